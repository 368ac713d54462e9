use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Error, Result};
use tokio::sync::{mpsc, Mutex};

use crate::core::collector::{consume_results, MetricsCollector, DEFAULT_MAX_RESULTS};
use crate::core::executor::{Executor, HttpExecutor, DEFAULT_TIMEOUT};
use crate::core::prepare::{prepare_requests, PreparedRequest};
use crate::core::scheduler::run_scenario;
use crate::core::share_result::publish_snapshots;
use crate::core::sla;
use crate::core::stress::{run_stress_with_executor, StressOutcome};
use crate::models::aggregate::Aggregate;
use crate::models::config::{ScenarioConfig, StressConfig};
use crate::models::request::ParsedRequest;
use crate::models::verdict::{SlaThresholds, Verdict};

// 结果通道容量：瞬时突发不阻塞，消费端持续落后时形成背压
pub const RESULT_CHANNEL_CAPACITY: usize = 50_000;

pub struct LoadOutcome {
    pub aggregate: Aggregate,
    pub verdict: Verdict,
}

// 负载测试入口：准备请求、建共享客户端、跑场景、排空、出最终快照
pub async fn run_load_test(
    config: &ScenarioConfig,
    requests: &[ParsedRequest],
    env: &BTreeMap<String, String>,
    live_tx: Option<mpsc::Sender<Aggregate>>,
) -> Result<LoadOutcome> {
    config.validate()?;
    if requests.is_empty() {
        return Err(Error::msg("no requests to run"));
    }
    let prepared = Arc::new(prepare_requests(requests, env)?);
    let run_start = Instant::now();
    let executor = HttpExecutor::new(run_start, config.users, DEFAULT_TIMEOUT)?;
    run_load_with_executor(config, prepared, executor, run_start, live_tx).await
}

pub async fn run_load_with_executor<E: Executor>(
    config: &ScenarioConfig,
    prepared: Arc<Vec<PreparedRequest>>,
    executor: E,
    run_start: Instant,
    live_tx: Option<mpsc::Sender<Aggregate>>,
) -> Result<LoadOutcome> {
    tracing::info!(
        component = "runner",
        users = config.users,
        duration = config.duration_seconds,
        scenario = %config.scenario,
        "负载测试开始"
    );
    let collector = Arc::new(Mutex::new(MetricsCollector::new(run_start, DEFAULT_MAX_RESULTS)));
    let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
    let consumer = tokio::spawn(consume_results(rx, Arc::clone(&collector)));
    // 聚合任务中途挂掉属于致命错误，立刻硬取消在途请求
    let watchdog_executor = executor.clone();
    let consumer = tokio::spawn(async move {
        let joined = consumer.await;
        if joined.is_err() {
            watchdog_executor.cancel();
        }
        joined
    });

    // 仪表盘快照推送
    let done = Arc::new(AtomicBool::new(false));
    let publisher = live_tx.map(|tx| {
        tokio::spawn(publish_snapshots(Arc::clone(&collector), tx, Arc::clone(&done)))
    });

    let active = Arc::new(AtomicUsize::new(0));
    let scenario_result = run_scenario(config, prepared, executor, tx, active).await;

    // 发送端全部释放后，消费者排空通道再退出，结果不会丢
    let consumer_result = consumer
        .await
        .map_err(|e| Error::msg(format!("metrics consumer failed: {e}")))?;
    if let Err(e) = consumer_result {
        // 尽力输出部分聚合再中止
        let mut guard = collector.lock().await;
        guard.set_end_time();
        let partial = guard.full_aggregate(false);
        tracing::error!(
            component = "runner",
            total_requests = partial.total_requests,
            "指标消费任务失败，部分聚合到此为止"
        );
        return Err(Error::msg(format!("metrics consumer failed: {e}")));
    }
    scenario_result?;

    done.store(true, Ordering::Relaxed);
    if let Some(publisher) = publisher {
        let _ = publisher.await;
    }

    let mut guard = collector.lock().await;
    guard.set_end_time();
    let aggregate = guard.full_aggregate(true);
    drop(guard);

    let verdict = sla::evaluate(&aggregate, &SlaThresholds::from(config));
    tracing::info!(
        component = "runner",
        total_requests = aggregate.total_requests,
        tps = format!("{:.1}", aggregate.tps_mean),
        error_rate_pct = format!("{:.2}", aggregate.error_rate_pct),
        pass = verdict.pass,
        "负载测试结束"
    );
    Ok(LoadOutcome { aggregate, verdict })
}

// 压力测试入口
pub async fn run_stress_test(
    config: &StressConfig,
    requests: &[ParsedRequest],
    env: &BTreeMap<String, String>,
    collection_name: &str,
) -> Result<StressOutcome> {
    config.validate()?;
    if requests.is_empty() {
        return Err(Error::msg("no requests for stress test"));
    }
    let prepared = Arc::new(prepare_requests(requests, env)?);
    let run_start = Instant::now();
    let peak_users = config.max_users.max(config.spike_users).max(config.soak_users);
    let executor = HttpExecutor::new(run_start, peak_users, DEFAULT_TIMEOUT)?;
    let collector = Arc::new(Mutex::new(MetricsCollector::new(run_start, DEFAULT_MAX_RESULTS)));
    run_stress_with_executor(config, prepared, executor, collector, collection_name).await
}
