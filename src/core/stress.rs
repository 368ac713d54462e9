use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};

use crate::core::collector::{consume_results, MetricsCollector, PhaseAggregate};
use crate::core::executor::Executor;
use crate::core::prepare::PreparedRequest;
use crate::core::scheduler::run_scenario;
use crate::core::sla;
use crate::models::config::{LoadScenario, ScenarioConfig, StressConfig, StressScenario};
use crate::models::stress_result::{PhaseResult, StressResult};
use crate::models::verdict::{SlaThresholds, Verdict};

// 阶段结果通道容量
const PHASE_CHANNEL_CAPACITY: usize = 50_000;
// p95斜率超过前一段2倍视为非线性劣化
const NONLINEAR_SLOPE_THRESHOLD: f64 = 2.0;

pub struct StressOutcome {
    pub result: StressResult,
    pub verdict: Verdict,
}

// 压力控制器：逐阶段抬升目标并发，首次SLA违反即停。
// 所有阶段共用一个收集器，阶段窗口靠计数差值和阶段内digest。
pub async fn run_stress_with_executor<E: Executor>(
    config: &StressConfig,
    requests: Arc<Vec<PreparedRequest>>,
    executor: E,
    collector: Arc<Mutex<MetricsCollector>>,
    collection_name: &str,
) -> Result<StressOutcome> {
    config.validate()?;
    let thresholds = SlaThresholds::from(config);
    let started_at_ms = unix_millis();
    tracing::info!(
        component = "stress",
        scenario = %config.scenario,
        initial_users = config.initial_users,
        max_users = config.max_users,
        "压力测试开始"
    );

    let mut phases: Vec<PhaseResult> = Vec::new();
    let mut breaking_point: u32 = 0;
    let mut max_sustainable: u32 = 0;
    let mut breach_verdict: Option<Verdict> = None;

    // 前置阶段：spike_stress单阶段保持，soak_stress先浸泡再线性抬升
    let mut linear_start: Option<u32> = Some(config.initial_users);
    match config.scenario {
        StressScenario::SpikeStress => {
            let (phase, verdict) = run_phase(
                config,
                phases.len(),
                config.spike_users,
                config.spike_hold_seconds,
                &thresholds,
                Arc::clone(&requests),
                executor.clone(),
                Arc::clone(&collector),
            )
            .await?;
            let breached = phase.breached;
            if breached {
                breaking_point = phase.target_users;
                breach_verdict = Some(verdict);
            } else {
                max_sustainable = phase.target_users;
            }
            phases.push(phase);
            linear_start = None;
        }
        StressScenario::SoakStress => {
            let (phase, verdict) = run_phase(
                config,
                phases.len(),
                config.soak_users,
                config.soak_duration_seconds,
                &thresholds,
                Arc::clone(&requests),
                executor.clone(),
                Arc::clone(&collector),
            )
            .await?;
            if phase.breached {
                breaking_point = phase.target_users;
                breach_verdict = Some(verdict);
                linear_start = None;
            } else {
                max_sustainable = phase.target_users;
            }
            phases.push(phase);
        }
        StressScenario::LinearOverload => {}
    }

    if let Some(initial) = linear_start {
        let mut target = initial;
        while target <= config.max_users {
            if executor.is_cancelled() {
                tracing::info!(component = "stress", "收到硬取消，不再进入下一阶段");
                break;
            }
            let (phase, verdict) = run_phase(
                config,
                phases.len(),
                target,
                config.step_interval_seconds,
                &thresholds,
                Arc::clone(&requests),
                executor.clone(),
                Arc::clone(&collector),
            )
            .await?;
            let breached = phase.breached;
            let reason = phase.breach_reason.clone();
            phases.push(phase);
            if breached {
                breaking_point = target;
                breach_verdict = Some(verdict);
                tracing::warn!(component = "stress", target_users = target, reason = %reason, "SLA被突破，停止抬升");
                break;
            }
            max_sustainable = target;
            target += config.step_users;
        }
    }

    let first_error_at = phases
        .iter()
        .find(|p| p.error_rate_pct > 0.0)
        .map(|p| p.target_users)
        .unwrap_or(0);
    let nonlinear_at = detect_nonlinear_latency(&phases);

    let result = StressResult {
        phases,
        breaking_point_users: breaking_point,
        max_sustainable_load_users: max_sustainable,
        first_error_at_users: first_error_at,
        nonlinear_latency_at_users: nonlinear_at,
        scenario: config.scenario.to_string(),
        collection_name: collection_name.to_string(),
        started_at_ms,
        ended_at_ms: unix_millis(),
    };
    tracing::info!(
        component = "stress",
        max_sustainable = result.max_sustainable_load_users,
        breaking_point = result.breaking_point_users,
        "压力测试结束"
    );
    Ok(StressOutcome {
        result,
        verdict: breach_verdict.unwrap_or_else(Verdict::passing),
    })
}

// 单个阶段：独立通道和消费者保证阶段快照前结果全部折叠完
#[allow(clippy::too_many_arguments)]
async fn run_phase<E: Executor>(
    config: &StressConfig,
    phase_idx: usize,
    target_users: u32,
    duration_seconds: f64,
    thresholds: &SlaThresholds,
    requests: Arc<Vec<PreparedRequest>>,
    executor: E,
    collector: Arc<Mutex<MetricsCollector>>,
) -> Result<(PhaseResult, Verdict)> {
    tracing::info!(
        component = "stress",
        phase = phase_idx,
        target_users,
        duration_seconds,
        "阶段开始"
    );
    collector.lock().await.begin_phase();

    let (tx, rx) = mpsc::channel(PHASE_CHANNEL_CAPACITY);
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

    let phase_config = ScenarioConfig {
        users: target_users,
        ramp_up_seconds: 0.0,
        duration_seconds,
        iterations: 0,
        think_time_ms: config.think_time_ms,
        scenario: LoadScenario::Constant,
        spike_users: 0,
        spike_duration_seconds: 0.0,
        sla_p95_ms: None,
        sla_p99_ms: None,
        sla_error_rate_pct: None,
    };
    let active = Arc::new(AtomicUsize::new(0));
    let stats = run_scenario(&phase_config, requests, executor, tx, active).await?;
    // 调度器返回即所有发送端都已释放，消费者排空后退出
    consumer
        .await
        .map_err(|e| anyhow::Error::msg(format!("metrics consumer failed: {e}")))?
        .map_err(|e| anyhow::Error::msg(format!("metrics consumer failed: {e}")))?;

    let mut guard = collector.lock().await;
    guard.set_end_time();
    let window: PhaseAggregate = guard.finish_phase();
    drop(guard);

    let verdict = sla::evaluate_values(
        window.p95_ms,
        window.p99_ms,
        window.error_rate_pct,
        window.timeout_rate_pct,
        thresholds,
    );
    let breach_reason = verdict
        .violations
        .first()
        .map(|v| v.describe())
        .unwrap_or_default();

    let phase = PhaseResult {
        phase: phase_idx,
        target_users,
        reached_users: stats.max_active as u32,
        duration_seconds: window.duration_seconds,
        total_requests: window.total,
        successful_requests: window.ok,
        failed_requests: window.failed,
        timeout_count: window.timeouts,
        tps: window.tps,
        mean_ms: window.mean_ms,
        p50_ms: window.p50_ms,
        p95_ms: window.p95_ms,
        p99_ms: window.p99_ms,
        error_rate_pct: window.error_rate_pct,
        timeout_rate_pct: window.timeout_rate_pct,
        breached: !verdict.pass,
        breach_reason,
    };
    Ok((phase, verdict))
}

// p95增量斜率超过前一段2倍的第一个阶段
fn detect_nonlinear_latency(phases: &[PhaseResult]) -> u32 {
    if phases.len() < 3 {
        return 0;
    }
    for i in 2..phases.len() {
        let slope_prev = phases[i - 1].p95_ms - phases[i - 2].p95_ms;
        let slope_curr = phases[i].p95_ms - phases[i - 1].p95_ms;
        if slope_prev > 0.0 && slope_curr > NONLINEAR_SLOPE_THRESHOLD * slope_prev {
            return phases[i].target_users;
        }
    }
    0
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(target: u32, p95: f64, err_pct: f64) -> PhaseResult {
        PhaseResult {
            phase: 0,
            target_users: target,
            reached_users: target,
            duration_seconds: 1.0,
            total_requests: 100,
            successful_requests: 100,
            failed_requests: 0,
            timeout_count: 0,
            tps: 100.0,
            mean_ms: p95,
            p50_ms: p95,
            p95_ms: p95,
            p99_ms: p95,
            error_rate_pct: err_pct,
            timeout_rate_pct: 0.0,
            breached: false,
            breach_reason: String::new(),
        }
    }

    #[test]
    fn test_nonlinear_latency_detection() {
        // 斜率 10,10,50：第三段超过前一段2倍
        let phases = vec![
            phase(5, 10.0, 0.0),
            phase(10, 20.0, 0.0),
            phase(15, 30.0, 0.0),
            phase(20, 80.0, 0.0),
        ];
        assert_eq!(detect_nonlinear_latency(&phases), 20);
    }

    #[test]
    fn test_nonlinear_needs_three_phases() {
        let phases = vec![phase(5, 10.0, 0.0), phase(10, 100.0, 0.0)];
        assert_eq!(detect_nonlinear_latency(&phases), 0);
    }

    #[test]
    fn test_no_nonlinearity_on_linear_growth() {
        let phases: Vec<PhaseResult> =
            (1..=5).map(|i| phase(i * 5, 10.0 * i as f64, 0.0)).collect();
        assert_eq!(detect_nonlinear_latency(&phases), 0);
    }
}
