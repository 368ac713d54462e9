use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;

use crate::core::executor::Executor;
use crate::core::prepare::PreparedRequest;
use crate::core::virtual_user::{run_virtual_user, VuHandle};
use crate::models::config::{LoadScenario, ScenarioConfig};
use crate::models::result::RequestResult;

// 调度粒度
pub const TICK: Duration = Duration::from_millis(250);
// 收尾时等待在途请求完成的宽限期，超时后强制中止
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// 一轮调度结束后的统计
#[derive(Debug, Clone, Copy)]
pub struct ScenarioStats {
    pub spawned_total: u64,
    pub max_active: usize,
}

// 目标并发曲线N(t)，调度器每个tick向它收敛
pub fn target_users(config: &ScenarioConfig, elapsed_seconds: f64) -> usize {
    if elapsed_seconds < 0.0 {
        return 0;
    }
    let users = config.users as usize;
    match config.scenario {
        LoadScenario::Constant => users,
        LoadScenario::Gradual => {
            if config.ramp_up_seconds <= 0.0 {
                return users;
            }
            let progress = (elapsed_seconds / config.ramp_up_seconds).min(1.0);
            ((users as f64 * progress).round() as usize).max(1)
        }
        LoadScenario::Spike => {
            // 突刺窗口从duration/2开始
            let spike_start = config.duration_seconds / 2.0;
            let spike_end = spike_start + config.spike_duration_seconds;
            if elapsed_seconds >= spike_start && elapsed_seconds < spike_end {
                users + config.spike_users as usize
            } else {
                users
            }
        }
    }
}

// 运行一个场景直到时长结束或所有VU完成迭代。
// 每个tick重算目标并发：不足就补，过量就从最新的VU开始优雅停止。
pub(crate) async fn run_scenario<E: Executor>(
    config: &ScenarioConfig,
    requests: Arc<Vec<PreparedRequest>>,
    executor: E,
    tx: mpsc::Sender<RequestResult>,
    active: Arc<AtomicUsize>,
) -> Result<ScenarioStats> {
    let think_time = Duration::from_millis(config.think_time_ms);
    let started = Instant::now();
    let mut ticker = tokio::time::interval(TICK);

    let mut vus: Vec<VuHandle> = Vec::new();
    // 已收到停止信号、还没退出的VU
    let mut draining: Vec<VuHandle> = Vec::new();
    let mut next_id: u64 = 0;
    let mut spawned_total: u64 = 0;
    let mut max_active: usize = 0;
    // 迭代模式下自然退出的VU不补位
    let spawn_cap: u64 = match config.scenario {
        LoadScenario::Spike => (config.users + config.spike_users) as u64,
        _ => config.users as u64,
    };

    loop {
        ticker.tick().await;
        let elapsed = started.elapsed().as_secs_f64();
        // 硬取消时在途请求已被执行器中止，这里只需要停止补充VU并收场
        if elapsed >= config.duration_seconds || executor.is_cancelled() {
            break;
        }

        vus.retain(|v| !v.handle.is_finished());
        draining.retain(|v| !v.handle.is_finished());
        max_active = max_active.max(active.load(Ordering::Relaxed));

        // 迭代全部耗尽时提前收场
        if config.iterations > 0
            && spawned_total >= spawn_cap
            && vus.is_empty()
            && draining.is_empty()
        {
            break;
        }

        let target = target_users(config, elapsed);
        if vus.len() < target {
            let deficit = (target - vus.len()) as u64;
            let allowed = if config.iterations > 0 {
                deficit.min(spawn_cap.saturating_sub(spawned_total))
            } else {
                deficit
            };
            for _ in 0..allowed {
                let stop = Arc::new(AtomicBool::new(false));
                let handle = tokio::spawn(run_virtual_user(
                    next_id,
                    Arc::clone(&requests),
                    executor.clone(),
                    tx.clone(),
                    Arc::clone(&stop),
                    config.iterations,
                    think_time,
                    Arc::clone(&active),
                ));
                vus.push(VuHandle { id: next_id, stop, handle });
                next_id += 1;
                spawned_total += 1;
            }
        } else {
            // 后进先出，被停的VU转入排空队列，不再计入当前并发
            while vus.len() > target {
                if let Some(vu) = vus.pop() {
                    vu.signal_stop();
                    draining.push(vu);
                }
            }
        }
    }

    // 收尾：全部通知停止，宽限期内等待在途请求完成
    for vu in vus.iter().chain(draining.iter()) {
        vu.signal_stop();
    }
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    for vu in vus.iter_mut().chain(draining.iter_mut()) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, &mut vu.handle).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(component = "scheduler", vu_id = vu.id, "VU未在宽限期内退出，强制中止");
                vu.handle.abort();
            }
        }
    }
    max_active = max_active.max(active.load(Ordering::Relaxed));
    drop(tx);

    Ok(ScenarioStats { spawned_total, max_active })
}
