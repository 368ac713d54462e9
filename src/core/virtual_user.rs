use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::executor::Executor;
use crate::core::prepare::PreparedRequest;
use crate::models::result::RequestResult;

// 调度器持有的VU句柄，stop置位后VU在当前请求结束时退出
pub(crate) struct VuHandle {
    pub id: u64,
    pub stop: Arc<AtomicBool>,
    pub handle: JoinHandle<()>,
}

impl VuHandle {
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

// 单个虚拟用户：顺序轮询请求序列，结果写入有界通道。
// 通道写满时send挂起，这就是对生产侧的背压。
pub(crate) async fn run_virtual_user<E: Executor>(
    vu_id: u64,
    requests: Arc<Vec<PreparedRequest>>,
    executor: E,
    tx: mpsc::Sender<RequestResult>,
    stop: Arc<AtomicBool>,
    iterations: u64,
    think_time: Duration,
    active: Arc<AtomicUsize>,
) {
    active.fetch_add(1, Ordering::Relaxed);
    let mut iter_count: u64 = 0;
    // 硬取消时不再发起新请求，在途请求由执行器中止并按cancelled上报
    'run: while !stop.load(Ordering::Relaxed)
        && !executor.is_cancelled()
        && (iterations == 0 || iter_count < iterations)
    {
        if requests.is_empty() {
            break;
        }
        for req in requests.iter() {
            if stop.load(Ordering::Relaxed) || executor.is_cancelled() {
                break 'run;
            }
            let result = executor.execute(req, vu_id).await;
            // 通道关闭说明运行已经结束
            if tx.send(result).await.is_err() {
                break 'run;
            }
            if !think_time.is_zero() {
                tokio::time::sleep(think_time).await;
            }
        }
        iter_count += 1;
    }
    active.fetch_sub(1, Ordering::Relaxed);
}
