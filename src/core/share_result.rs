use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;

use crate::core::collector::{MetricsCollector, DEFAULT_CACHE_TTL};
use crate::models::aggregate::Aggregate;

// 每秒向外推送一次带TTL缓存的快照，渲染方的帧率与聚合开销解耦。
// 接收端关闭或done置位后退出。
pub(crate) async fn publish_snapshots(
    collector: Arc<Mutex<MetricsCollector>>,
    tx: mpsc::Sender<Aggregate>,
    done: Arc<AtomicBool>,
) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        if done.load(Ordering::Relaxed) {
            break;
        }
        let aggregate = collector.lock().await.get_cached_aggregate(DEFAULT_CACHE_TTL);
        if tx.send(aggregate).await.is_err() {
            break;
        }
    }
    // 最后补一帧终态
    let aggregate = collector.lock().await.get_cached_aggregate(Duration::ZERO);
    let _ = tx.send(aggregate).await;
}
