use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};

use crate::core::fixed_size_queue::FixedSizeQueue;
use crate::core::tdigest::TDigest;
use crate::models::aggregate::{Aggregate, EndpointAggregate, TimeBucketPoint};
use crate::models::result::{ErrorKind, RequestResult};

// 直方图采样环形缓冲的默认容量
pub const DEFAULT_MAX_RESULTS: usize = 100_000;
// 仪表盘快照缓存
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(500);
// 消费端批量折叠大小
pub const FOLD_BATCH_SIZE: usize = 256;
// 时间桶冻结的滞后窗口(秒)
const BUCKET_FREEZE_LAG: u64 = 2;
// 桶内p95用的小digest
const BUCKET_DIGEST_COMPRESSION: f64 = 32.0;

const NS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug)]
struct EndpointStats {
    method: String,
    url: String,
    total: u64,
    ok: u64,
    failed: u64,
    timeouts: u64,
    connection_errors: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
    bytes_received: u64,
    digest: TDigest,
    // 瞬时tps的滚动双秒窗口：last_second为进行中的秒
    last_second: u64,
    count_last: u64,
    count_prev: u64,
}

impl EndpointStats {
    fn new(method: &str, url: &str) -> Self {
        EndpointStats {
            method: method.to_string(),
            url: url.to_string(),
            total: 0,
            ok: 0,
            failed: 0,
            timeouts: 0,
            connection_errors: 0,
            sum_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: 0.0,
            bytes_received: 0,
            digest: TDigest::default(),
            last_second: 0,
            count_last: 0,
            count_prev: 0,
        }
    }

    fn track_second(&mut self, second: u64) {
        if second == self.last_second {
            self.count_last += 1;
        } else if second == self.last_second + 1 {
            self.count_prev = self.count_last;
            self.count_last = 1;
            self.last_second = second;
        } else if second > self.last_second {
            self.count_prev = 0;
            self.count_last = 1;
            self.last_second = second;
        } else if second + 1 == self.last_second {
            self.count_prev += 1;
        }
        // 更晚到的不计入瞬时窗口
    }

    // 以全局最新桶为基准取最近一个完整秒的请求数
    fn tps_current(&self, latest_bucket: u64) -> f64 {
        if latest_bucket == self.last_second {
            self.count_prev as f64
        } else if latest_bucket == self.last_second + 1 {
            self.count_last as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
struct TimeBucket {
    total: u64,
    ok: u64,
    failed: u64,
    sum_ms: f64,
    late: u64,
    digest: TDigest,
}

impl TimeBucket {
    fn new() -> Self {
        TimeBucket {
            total: 0,
            ok: 0,
            failed: 0,
            sum_ms: 0.0,
            late: 0,
            digest: TDigest::new(BUCKET_DIGEST_COMPRESSION),
        }
    }
}

// 压力阶段窗口：计数走差值，分位数走阶段内新digest
#[derive(Debug)]
struct PhaseWindow {
    started: Instant,
    base_total: u64,
    base_ok: u64,
    base_failed: u64,
    base_timeouts: u64,
    sum_ms: f64,
    digest: TDigest,
}

// 阶段窗口的聚合值，交给压力控制器判定SLA
#[derive(Debug, Clone, Copy)]
pub struct PhaseAggregate {
    pub duration_seconds: f64,
    pub total: u64,
    pub ok: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub tps: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate_pct: f64,
    pub timeout_rate_pct: f64,
}

// 单消费者聚合器：计数器精确无界，只有直方图采样缓冲有界。
// 分位数来自吃掉了所有样本的T-Digest，环形缓冲只服务直方图渲染。
pub struct MetricsCollector {
    run_start: Instant,
    end_time: Option<Instant>,
    total: u64,
    ok: u64,
    failed: u64,
    timeouts: u64,
    connection_errors: u64,
    protocol_errors: u64,
    other_errors: u64,
    bytes_received: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
    digest: TDigest,
    samples: FixedSizeQueue<f64>,
    endpoints: HashMap<String, EndpointStats>,
    buckets: BTreeMap<u64, TimeBucket>,
    // 小于该下标的桶已冻结
    frozen_below: u64,
    late_results: u64,
    cache: Option<(Aggregate, Instant)>,
    phase: Option<PhaseWindow>,
}

impl MetricsCollector {
    pub fn new(run_start: Instant, max_results: usize) -> Self {
        MetricsCollector {
            run_start,
            end_time: None,
            total: 0,
            ok: 0,
            failed: 0,
            timeouts: 0,
            connection_errors: 0,
            protocol_errors: 0,
            other_errors: 0,
            bytes_received: 0,
            sum_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: 0.0,
            digest: TDigest::default(),
            samples: FixedSizeQueue::new(max_results),
            endpoints: HashMap::new(),
            buckets: BTreeMap::new(),
            frozen_below: 0,
            late_results: 0,
            cache: None,
            phase: None,
        }
    }

    pub fn run_start(&self) -> Instant {
        self.run_start
    }

    pub fn total_folded(&self) -> u64 {
        self.total
    }

    // 每条结果恰好折叠一次
    pub fn fold(&mut self, result: &RequestResult) {
        self.total += 1;
        self.bytes_received += result.bytes_received;
        if result.ok {
            self.ok += 1;
        } else {
            self.failed += 1;
        }
        match result.error_kind {
            ErrorKind::None => {}
            ErrorKind::Timeout => self.timeouts += 1,
            ErrorKind::Connection => self.connection_errors += 1,
            ErrorKind::Protocol => self.protocol_errors += 1,
            ErrorKind::Other => self.other_errors += 1,
        }

        let elapsed = result.elapsed_ms;
        self.samples.push(elapsed);

        let endpoint = self
            .endpoints
            .entry(result.request_name.clone())
            .or_insert_with(|| EndpointStats::new(&result.method, &result.url));
        endpoint.total += 1;
        endpoint.bytes_received += result.bytes_received;
        if result.ok {
            endpoint.ok += 1;
        } else {
            endpoint.failed += 1;
        }
        match result.error_kind {
            ErrorKind::Timeout => endpoint.timeouts += 1,
            ErrorKind::Connection => endpoint.connection_errors += 1,
            _ => {}
        }
        endpoint.track_second(result.started_at_ns / NS_PER_SEC);

        if result.ok {
            self.sum_ms += elapsed;
            self.min_ms = self.min_ms.min(elapsed);
            self.max_ms = self.max_ms.max(elapsed);
            self.digest.add(elapsed);
            endpoint.sum_ms += elapsed;
            endpoint.min_ms = endpoint.min_ms.min(elapsed);
            endpoint.max_ms = endpoint.max_ms.max(elapsed);
            endpoint.digest.add(elapsed);
            if let Some(phase) = &mut self.phase {
                phase.sum_ms += elapsed;
                phase.digest.add(elapsed);
            }
        }

        // 时间桶：开始时刻早于run_start的结果已被钳到0
        let mut second = result.started_at_ns / NS_PER_SEC;
        let mut late = false;
        if second < self.frozen_below {
            // 迟到结果并入最早的未冻结桶
            second = self.frozen_below;
            late = true;
            self.late_results += 1;
        }
        let bucket = self.buckets.entry(second).or_insert_with(TimeBucket::new);
        bucket.total += 1;
        bucket.sum_ms += elapsed;
        if result.ok {
            bucket.ok += 1;
            bucket.digest.add(elapsed);
        } else {
            bucket.failed += 1;
        }
        if late {
            bucket.late += 1;
        }
    }

    pub fn set_end_time(&mut self) {
        self.end_time = Some(Instant::now());
    }

    fn duration_seconds(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.run_start)
            .as_secs_f64()
            .max(f64::MIN_POSITIVE)
    }

    // 开启一个压力阶段窗口
    pub fn begin_phase(&mut self) {
        self.phase = Some(PhaseWindow {
            started: Instant::now(),
            base_total: self.total,
            base_ok: self.ok,
            base_failed: self.failed,
            base_timeouts: self.timeouts,
            sum_ms: 0.0,
            digest: TDigest::default(),
        });
    }

    // 结算当前阶段窗口
    pub fn finish_phase(&mut self) -> PhaseAggregate {
        let (duration, total, ok, failed, timeouts, sum_ms, p50, p95, p99) = match self.phase.take()
        {
            Some(mut phase) => (
                phase.started.elapsed().as_secs_f64().max(f64::MIN_POSITIVE),
                self.total - phase.base_total,
                self.ok - phase.base_ok,
                self.failed - phase.base_failed,
                self.timeouts - phase.base_timeouts,
                phase.sum_ms,
                phase.digest.percentile(50.0),
                phase.digest.percentile(95.0),
                phase.digest.percentile(99.0),
            ),
            None => (f64::MIN_POSITIVE, 0, 0, 0, 0, 0.0, 0.0, 0.0, 0.0),
        };
        PhaseAggregate {
            duration_seconds: duration,
            total,
            ok,
            failed,
            timeouts,
            tps: total as f64 / duration,
            mean_ms: if ok > 0 { sum_ms / ok as f64 } else { 0.0 },
            p50_ms: p50,
            p95_ms: p95,
            p99_ms: p99,
            error_rate_pct: if total > 0 { 100.0 * failed as f64 / total as f64 } else { 0.0 },
            timeout_rate_pct: if total > 0 { 100.0 * timeouts as f64 / total as f64 } else { 0.0 },
        }
    }

    // 完整快照。include_response_times只在渲染直方图时开
    pub fn full_aggregate(&mut self, include_response_times: bool) -> Aggregate {
        let duration = self.duration_seconds();
        let latest_bucket = self.buckets.keys().next_back().copied().unwrap_or(0);
        // 快照观测过的桶随之冻结
        self.frozen_below = self.frozen_below.max(latest_bucket.saturating_sub(BUCKET_FREEZE_LAG - 1));

        let mut endpoints: Vec<EndpointAggregate> = Vec::with_capacity(self.endpoints.len());
        let mut names: Vec<&String> = self.endpoints.keys().collect();
        names.sort();
        let names: Vec<String> = names.into_iter().cloned().collect();
        for name in names {
            if let Some(stats) = self.endpoints.get_mut(&name) {
                endpoints.push(EndpointAggregate {
                    name: name.clone(),
                    method: stats.method.clone(),
                    url: stats.url.clone(),
                    total_requests: stats.total,
                    successful_requests: stats.ok,
                    failed_requests: stats.failed,
                    timeout_count: stats.timeouts,
                    connection_error_count: stats.connection_errors,
                    tps_mean: stats.total as f64 / duration,
                    tps_current: stats.tps_current(latest_bucket),
                    mean_ms: if stats.ok > 0 { stats.sum_ms / stats.ok as f64 } else { 0.0 },
                    p50_ms: stats.digest.percentile(50.0),
                    p95_ms: stats.digest.percentile(95.0),
                    p99_ms: stats.digest.percentile(99.0),
                    min_ms: if stats.ok > 0 { stats.min_ms } else { 0.0 },
                    max_ms: stats.max_ms,
                    error_rate_pct: if stats.total > 0 {
                        100.0 * stats.failed as f64 / stats.total as f64
                    } else {
                        0.0
                    },
                    bytes_received: stats.bytes_received,
                });
            }
        }

        let mut series: Vec<TimeBucketPoint> = Vec::with_capacity(self.buckets.len());
        for (second, bucket) in self.buckets.iter_mut() {
            series.push(TimeBucketPoint {
                second: *second,
                total_requests: bucket.total,
                successful_requests: bucket.ok,
                failed_requests: bucket.failed,
                mean_ms: if bucket.total > 0 { bucket.sum_ms / bucket.total as f64 } else { 0.0 },
                p95_ms: bucket.digest.percentile(95.0),
                late_count: bucket.late,
            });
        }

        // 瞬时tps取最近一个完整的桶
        let tps_current = self
            .buckets
            .get(&latest_bucket.saturating_sub(1))
            .map(|b| b.total as f64)
            .unwrap_or(0.0);

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        Aggregate {
            total_requests: self.total,
            successful_requests: self.ok,
            failed_requests: self.failed,
            timeout_count: self.timeouts,
            connection_error_count: self.connection_errors,
            protocol_error_count: self.protocol_errors,
            other_error_count: self.other_errors,
            duration_seconds: duration,
            tps_mean: self.total as f64 / duration,
            tps_current,
            mean_ms: if self.ok > 0 { self.sum_ms / self.ok as f64 } else { 0.0 },
            p50_ms: self.digest.percentile(50.0),
            p95_ms: self.digest.percentile(95.0),
            p99_ms: self.digest.percentile(99.0),
            min_ms: if self.ok > 0 { self.min_ms } else { 0.0 },
            max_ms: self.max_ms,
            error_rate_pct: if self.total > 0 {
                100.0 * self.failed as f64 / self.total as f64
            } else {
                0.0
            },
            timeout_rate_pct: if self.total > 0 {
                100.0 * self.timeouts as f64 / self.total as f64
            } else {
                0.0
            },
            bytes_received: self.bytes_received,
            late_results: self.late_results,
            endpoints,
            series,
            response_times_ms: if include_response_times {
                Some(self.samples.to_vec())
            } else {
                None
            },
            timestamp_ms,
        }
    }

    // 带TTL缓存的快照，给仪表盘用，把渲染频率和聚合开销解耦
    pub fn get_cached_aggregate(&mut self, ttl: Duration) -> Aggregate {
        if let Some((cached, at)) = &self.cache {
            if at.elapsed() <= ttl {
                return cached.clone();
            }
        }
        let aggregate = self.full_aggregate(false);
        self.cache = Some((aggregate.clone(), Instant::now()));
        aggregate
    }
}

// 消费端：批量抽干通道再折叠，通道关闭且排空后返回。
// recv返回None即所有生产者都已退出，不会丢结果。
pub(crate) async fn consume_results(
    mut rx: mpsc::Receiver<RequestResult>,
    collector: Arc<Mutex<MetricsCollector>>,
) {
    let mut batch: Vec<RequestResult> = Vec::with_capacity(FOLD_BATCH_SIZE);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < FOLD_BATCH_SIZE {
            match rx.try_recv() {
                Ok(r) => batch.push(r),
                Err(_) => break,
            }
        }
        let mut collector = collector.lock().await;
        for result in batch.drain(..) {
            collector.fold(&result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::result::ErrorKind;

    fn result(name: &str, ok: bool, elapsed_ms: f64, started_at_ns: u64) -> RequestResult {
        RequestResult {
            request_name: name.to_string(),
            folder_path: String::new(),
            method: "GET".to_string(),
            url: format!("http://127.0.0.1/{name}"),
            status_code: if ok { 200 } else { 0 },
            elapsed_ms,
            bytes_received: 10,
            ok,
            error_kind: if ok { ErrorKind::None } else { ErrorKind::Timeout },
            error_message: String::new(),
            started_at_ns,
            vu_id: 0,
        }
    }

    #[test]
    fn test_counters_monotonic_across_snapshots() {
        let mut c = MetricsCollector::new(Instant::now(), 100);
        for i in 0..50 {
            c.fold(&result("a", i % 5 != 0, 10.0, i * 1_000_000));
        }
        let s1 = c.full_aggregate(false);
        for i in 0..30 {
            c.fold(&result("a", true, 12.0, i * 1_000_000));
        }
        let s2 = c.full_aggregate(false);
        assert!(s2.total_requests >= s1.total_requests);
        assert!(s2.successful_requests >= s1.successful_requests);
        assert!(s2.failed_requests >= s1.failed_requests);
        assert_eq!(s2.total_requests, 80);
    }

    #[test]
    fn test_per_endpoint_totals_conserved() {
        let mut c = MetricsCollector::new(Instant::now(), 1000);
        for i in 0..40 {
            let name = if i % 3 == 0 { "alpha" } else { "beta" };
            c.fold(&result(name, i % 7 != 0, 5.0 + i as f64, 0));
        }
        let agg = c.full_aggregate(false);
        let endpoint_sum: u64 = agg.endpoints.iter().map(|e| e.total_requests).sum();
        assert_eq!(endpoint_sum, agg.total_requests);
        let endpoint_ok: u64 = agg.endpoints.iter().map(|e| e.successful_requests).sum();
        assert_eq!(endpoint_ok, agg.successful_requests);
    }

    #[test]
    fn test_percentiles_monotonic_and_below_max() {
        let mut c = MetricsCollector::new(Instant::now(), 10_000);
        for i in 1..=2000u64 {
            c.fold(&result("a", true, i as f64, 0));
        }
        let agg = c.full_aggregate(false);
        assert!(agg.p50_ms <= agg.p95_ms);
        assert!(agg.p95_ms <= agg.p99_ms);
        assert!(agg.p99_ms <= agg.max_ms);
        assert!((agg.mean_ms - 1000.5).abs() < 1.0);
    }

    #[test]
    fn test_ring_buffer_bounded_counters_exact() {
        let max = 100;
        let mut c = MetricsCollector::new(Instant::now(), max);
        for i in 0..5 * max as u64 {
            c.fold(&result("a", true, 1.0, i));
        }
        let agg = c.full_aggregate(true);
        // 采样有界，计数器精确
        assert_eq!(agg.response_times_ms.unwrap().len(), max);
        assert_eq!(agg.total_requests, 5 * max as u64);
    }

    #[test]
    fn test_late_results_fold_into_open_bucket() {
        let mut c = MetricsCollector::new(Instant::now(), 100);
        // 桶0..=9
        for s in 0..10u64 {
            c.fold(&result("a", true, 1.0, s * NS_PER_SEC));
        }
        // 快照后，9-1=8之前的桶冻结
        let _ = c.full_aggregate(false);
        // 桶3已冻结，结果并入桶8并打上迟到标记
        c.fold(&result("a", true, 1.0, 3 * NS_PER_SEC));
        let agg = c.full_aggregate(false);
        assert_eq!(agg.late_results, 1);
        let bucket3 = agg.series.iter().find(|b| b.second == 3).unwrap();
        assert_eq!(bucket3.total_requests, 1);
        let bucket8 = agg.series.iter().find(|b| b.second == 8).unwrap();
        assert_eq!(bucket8.total_requests, 2);
        assert_eq!(bucket8.late_count, 1);
    }

    #[test]
    fn test_endpoint_tps_fields() {
        let mut c = MetricsCollector::new(Instant::now(), 1000);
        // 秒0有3条，秒1有5条，秒2进行中有2条
        for _ in 0..3 {
            c.fold(&result("a", true, 1.0, 0));
        }
        for _ in 0..5 {
            c.fold(&result("a", true, 1.0, NS_PER_SEC));
        }
        for _ in 0..2 {
            c.fold(&result("a", true, 1.0, 2 * NS_PER_SEC));
        }
        let agg = c.full_aggregate(false);
        let endpoint = &agg.endpoints[0];
        // 最近一个完整秒是秒1
        assert!((endpoint.tps_current - 5.0).abs() < 1e-9);
        assert!(endpoint.tps_mean > 0.0);
        // 接口tps与全局同一个口径
        assert!((agg.tps_current - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_timeout_rate_tracked() {
        let mut c = MetricsCollector::new(Instant::now(), 100);
        for i in 0..10 {
            c.fold(&result("a", i >= 2, 1.0, 0));
        }
        let agg = c.full_aggregate(false);
        assert_eq!(agg.timeout_count, 2);
        assert!((agg.timeout_rate_pct - 20.0).abs() < 1e-9);
        assert!((agg.error_rate_pct - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_cached_aggregate_respects_ttl() {
        let mut c = MetricsCollector::new(Instant::now(), 100);
        c.fold(&result("a", true, 1.0, 0));
        let s1 = c.get_cached_aggregate(Duration::from_secs(60));
        c.fold(&result("a", true, 1.0, 0));
        // TTL内返回旧快照
        let s2 = c.get_cached_aggregate(Duration::from_secs(60));
        assert_eq!(s1.total_requests, s2.total_requests);
        // TTL为0强制重算
        let s3 = c.get_cached_aggregate(Duration::ZERO);
        assert_eq!(s3.total_requests, 2);
    }

    #[test]
    fn test_phase_window_diffs_counters() {
        let mut c = MetricsCollector::new(Instant::now(), 100);
        for _ in 0..5 {
            c.fold(&result("a", true, 10.0, 0));
        }
        c.begin_phase();
        for _ in 0..8 {
            c.fold(&result("a", true, 30.0, 0));
        }
        c.fold(&result("a", false, 30.0, 0));
        let phase = c.finish_phase();
        assert_eq!(phase.total, 9);
        assert_eq!(phase.ok, 8);
        assert_eq!(phase.failed, 1);
        assert_eq!(phase.timeouts, 1);
        // 阶段digest只见过阶段内的样本
        assert!((phase.p95_ms - 30.0).abs() < 1.0);
        // 全局digest跨阶段
        let agg = c.full_aggregate(false);
        assert_eq!(agg.total_requests, 14);
    }

    #[tokio::test]
    async fn test_consumer_drains_everything_after_close() {
        let collector = Arc::new(Mutex::new(MetricsCollector::new(Instant::now(), 1000)));
        let (tx, rx) = mpsc::channel(64);
        let consumer = tokio::spawn(consume_results(rx, Arc::clone(&collector)));
        for i in 0..500u64 {
            tx.send(result("a", true, 1.0, i)).await.unwrap();
        }
        drop(tx);
        consumer.await.unwrap();
        assert_eq!(collector.lock().await.total_folded(), 500);
    }
}
