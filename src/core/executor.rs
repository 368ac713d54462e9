use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::{Notify, Semaphore};

use crate::core::prepare::PreparedRequest;
use crate::models::result::{ErrorKind, RequestResult};

// 连接池参数，所有VU共享同一个客户端
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_KEEPALIVE: usize = 200;
pub const KEEPALIVE_EXPIRY: Duration = Duration::from_secs(30);
pub const MAX_REDIRECTS: usize = 10;
// 在途请求上限
pub const MAX_IN_FLIGHT_LIMIT: usize = 1000;
pub const MIN_IN_FLIGHT_LIMIT: usize = 50;
pub const MAX_IN_FLIGHT_MULTIPLIER: usize = 2;
// 错误信息截断长度
const ERROR_MESSAGE_MAX: usize = 200;

const NS_TO_MS: f64 = 1_000_000.0;

// 硬取消信号：置位后在途请求立刻中止，结果按cancelled上报。
// 与时长到点的优雅收尾不同，这条路径用于用户中断和致命错误。
#[derive(Debug, Default)]
pub struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    // 挂起直到信号置位。先注册再复查flag，避免错过notify_waiters
    pub(crate) async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

// 进程级信号，ctrl-c处理和致命错误走这里
static GLOBAL_CANCEL: OnceLock<Arc<CancelSignal>> = OnceLock::new();

pub fn global_cancel() -> Arc<CancelSignal> {
    Arc::clone(GLOBAL_CANCEL.get_or_init(|| Arc::new(CancelSignal::default())))
}

// 执行器接口：调度器和VU只依赖这一层，测试用mock替换真实传输
pub trait Executor: Clone + Send + Sync + 'static {
    fn execute(
        &self,
        req: &PreparedRequest,
        vu_id: u64,
    ) -> impl Future<Output = RequestResult> + Send;

    // 硬取消传播，默认实现不支持取消
    fn cancel(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

pub fn in_flight_limit(users: u32) -> usize {
    (users as usize * MAX_IN_FLIGHT_MULTIPLIER)
        .max(MIN_IN_FLIGHT_LIMIT)
        .min(MAX_IN_FLIGHT_LIMIT)
}

#[derive(Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    run_start: Instant,
    cancel: Arc<CancelSignal>,
}

impl HttpExecutor {
    pub fn new(run_start: Instant, users: u32, timeout: Duration) -> Result<Self> {
        HttpExecutor::with_signal(run_start, users, timeout, global_cancel())
    }

    pub fn with_signal(
        run_start: Instant,
        users: u32,
        timeout: Duration,
        cancel: Arc<CancelSignal>,
    ) -> Result<Self> {
        let info = os_info::get();
        let user_agent = format!(
            "{} {} ({}; {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            info.os_type(),
            info.version()
        );
        // http2走ALPN协商，纯http目标自动回落到1.1
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .pool_max_idle_per_host(MAX_KEEPALIVE)
            .pool_idle_timeout(KEEPALIVE_EXPIRY)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("cannot build http client")?;
        Ok(HttpExecutor {
            client,
            permits: Arc::new(Semaphore::new(in_flight_limit(users))),
            run_start,
            cancel,
        })
    }

    fn cancelled_result(
        &self,
        req: &PreparedRequest,
        vu_id: u64,
        elapsed_ms: f64,
        started_at_ns: u64,
    ) -> RequestResult {
        RequestResult {
            request_name: req.name.clone(),
            folder_path: req.folder_path.clone(),
            method: req.method.as_str().to_string(),
            url: req.url.clone(),
            status_code: 0,
            elapsed_ms,
            bytes_received: 0,
            ok: false,
            error_kind: ErrorKind::Other,
            error_message: "cancelled".to_string(),
            started_at_ns,
            vu_id,
        }
    }

    async fn execute_inner(&self, req: &PreparedRequest, vu_id: u64) -> RequestResult {
        // 信号量在整个运行期间不会被关闭
        let _permit = self.permits.acquire().await.ok();
        let started = Instant::now();
        let started_at_ns = started.saturating_duration_since(self.run_start).as_nanos() as u64;
        if self.cancel.is_cancelled() {
            return self.cancelled_result(req, vu_id, 0.0, started_at_ns);
        }

        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .headers(req.headers.clone());
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let request = async {
            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    // 响应头字节数
                    let mut bytes_received: u64 = response
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            name.as_str().len() as u64 + value.as_bytes().len() as u64 + 4
                        })
                        .sum();
                    // 只读长度，不做解码
                    let mut stream = response.bytes_stream();
                    let mut body_error: Option<reqwest::Error> = None;
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(c) => bytes_received += c.len() as u64,
                            Err(e) => {
                                body_error = Some(e);
                                break;
                            }
                        }
                    }
                    match body_error {
                        None => Ok((status, bytes_received)),
                        Some(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        };

        // 硬取消时丢弃请求future，连接层随之中止该请求
        let outcome = tokio::select! {
            outcome = request => outcome,
            _ = self.cancel.cancelled() => {
                let elapsed_ms = started.elapsed().as_nanos() as f64 / NS_TO_MS;
                return self.cancelled_result(req, vu_id, elapsed_ms, started_at_ns);
            }
        };

        let elapsed_ms = started.elapsed().as_nanos() as f64 / NS_TO_MS;
        match outcome {
            Ok((status_code, bytes_received)) => RequestResult {
                request_name: req.name.clone(),
                folder_path: req.folder_path.clone(),
                method: req.method.as_str().to_string(),
                url: req.url.clone(),
                status_code,
                elapsed_ms,
                bytes_received,
                ok: (200..400).contains(&status_code),
                error_kind: ErrorKind::None,
                error_message: String::new(),
                started_at_ns,
                vu_id,
            },
            Err(e) => {
                let mut message = e.to_string();
                if message.len() > ERROR_MESSAGE_MAX {
                    // 按字符截断，避免切到多字节边界
                    message = message.chars().take(ERROR_MESSAGE_MAX).collect();
                }
                RequestResult {
                    request_name: req.name.clone(),
                    folder_path: req.folder_path.clone(),
                    method: req.method.as_str().to_string(),
                    url: req.url.clone(),
                    status_code: 0,
                    elapsed_ms,
                    bytes_received: 0,
                    ok: false,
                    error_kind: classify_error(&e),
                    error_message: message,
                    started_at_ns,
                    vu_id,
                }
            }
        }
    }
}

impl Executor for HttpExecutor {
    fn execute(
        &self,
        req: &PreparedRequest,
        vu_id: u64,
    ) -> impl Future<Output = RequestResult> + Send {
        self.execute_inner(req, vu_id)
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// 在捕获点做一次分类，之后不再解析错误文本
pub fn classify_error(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_connect() {
        ErrorKind::Connection
    } else if e.is_body() || e.is_decode() {
        ErrorKind::Protocol
    } else {
        ErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::ParsedRequest;
    use std::collections::BTreeMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn prepared(url: &str) -> PreparedRequest {
        let parsed = ParsedRequest {
            name: "probe".to_string(),
            folder_path: String::new(),
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            query_params: Vec::new(),
        };
        PreparedRequest::prepare(&parsed, &BTreeMap::new()).unwrap()
    }

    #[tokio::test]
    async fn test_connection_error_classified() {
        let executor = HttpExecutor::new(Instant::now(), 1, DEFAULT_TIMEOUT).unwrap();
        // 端口1没有监听，连接被立刻拒绝
        let result = executor.execute_inner(&prepared("http://127.0.0.1:1/"), 7).await;
        assert!(!result.ok);
        assert_eq!(result.status_code, 0);
        assert_eq!(result.error_kind, ErrorKind::Connection);
        assert_eq!(result.vu_id, 7);
        assert!(!result.error_message.is_empty());
        assert!(result.error_message.len() <= 200);
    }

    #[tokio::test]
    async fn test_timeout_classified() {
        // 接受连接但永不响应
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        let executor =
            HttpExecutor::new(Instant::now(), 1, Duration::from_millis(200)).unwrap();
        let result = executor
            .execute_inner(&prepared(&format!("http://{addr}/")), 1)
            .await;
        assert!(!result.ok);
        assert_eq!(result.status_code, 0);
        assert_eq!(result.error_kind, ErrorKind::Timeout);
        assert!(result.elapsed_ms >= 150.0);
    }

    #[tokio::test]
    async fn test_status_and_bytes_on_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let body = b"hello-deli";
                    let head = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(body).await;
                });
            }
        });
        let executor = HttpExecutor::new(Instant::now(), 1, DEFAULT_TIMEOUT).unwrap();
        let result = executor
            .execute_inner(&prepared(&format!("http://{addr}/")), 0)
            .await;
        assert!(result.ok, "err={:?} {}", result.error_kind, result.error_message);
        assert_eq!(result.status_code, 200);
        assert_eq!(result.error_kind, ErrorKind::None);
        // 响应头加响应体
        assert!(result.bytes_received > 10);
        assert!(result.elapsed_ms > 0.0);
    }

    #[tokio::test]
    async fn test_hard_cancel_aborts_in_flight_request() {
        // 服务端挂起不响应，请求只能被取消
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        // 独立信号，不碰进程级的那个
        let signal = Arc::new(CancelSignal::default());
        let executor = HttpExecutor::with_signal(
            Instant::now(),
            1,
            DEFAULT_TIMEOUT,
            Arc::clone(&signal),
        )
        .unwrap();
        let canceller = Arc::clone(&signal);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = executor
            .execute_inner(&prepared(&format!("http://{addr}/")), 3)
            .await;
        // 没有等满30秒超时就返回了
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.ok);
        assert_eq!(result.status_code, 0);
        assert_eq!(result.error_kind, ErrorKind::Other);
        assert_eq!(result.error_message, "cancelled");
        assert!(Executor::is_cancelled(&executor));

        // 取消后的新请求直接按cancelled返回
        let again = executor
            .execute_inner(&prepared(&format!("http://{addr}/")), 3)
            .await;
        assert_eq!(again.error_message, "cancelled");
    }

    #[test]
    fn test_in_flight_limit_bounds() {
        assert_eq!(in_flight_limit(1), MIN_IN_FLIGHT_LIMIT);
        assert_eq!(in_flight_limit(100), 200);
        assert_eq!(in_flight_limit(10_000), MAX_IN_FLIGHT_LIMIT);
    }
}
