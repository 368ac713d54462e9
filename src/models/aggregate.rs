use serde::Serialize;

// 单个接口的统计明细，以request_name为键
#[derive(Debug, Clone, Serialize)]
pub struct EndpointAggregate {
    pub name: String,
    pub method: String,
    pub url: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_count: u64,
    pub connection_error_count: u64,
    // 全程平均tps
    pub tps_mean: f64,
    // 最近一个完整时间桶的tps
    pub tps_current: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub error_rate_pct: f64,
    pub bytes_received: u64,
}

// 1秒时间桶
#[derive(Debug, Clone, Serialize)]
pub struct TimeBucketPoint {
    // 相对压测开始的秒数
    pub second: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub mean_ms: f64,
    pub p95_ms: f64,
    // 迟到并被并入该桶的结果数
    pub late_count: u64,
}

// 某一时刻的聚合快照
#[derive(Debug, Clone, Serialize)]
pub struct Aggregate {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_count: u64,
    pub connection_error_count: u64,
    pub protocol_error_count: u64,
    pub other_error_count: u64,
    pub duration_seconds: f64,
    // 全程平均tps
    pub tps_mean: f64,
    // 最近一个完整时间桶的tps
    pub tps_current: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub error_rate_pct: f64,
    pub timeout_rate_pct: f64,
    pub bytes_received: u64,
    pub late_results: u64,
    pub endpoints: Vec<EndpointAggregate>,
    pub series: Vec<TimeBucketPoint>,
    // 仅在需要渲染直方图时携带
    pub response_times_ms: Option<Vec<f64>>,
    pub timestamp_ms: u128,
}

impl Aggregate {
    pub fn success_rate_pct(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        100.0 * self.successful_requests as f64 / self.total_requests as f64
    }
}
