use serde::{Deserialize, Serialize};

// 错误分类，在请求执行时就确定，后续不再解析错误信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    None,
    Timeout,
    Connection,
    Protocol,
    Other,
}

// 单次请求的执行结果，每次尝试恰好产生一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_name: String,
    pub folder_path: String,
    pub method: String,
    pub url: String,
    // 无响应时为0
    pub status_code: u16,
    pub elapsed_ms: f64,
    pub bytes_received: u64,
    pub ok: bool,
    pub error_kind: ErrorKind,
    pub error_message: String,
    // 相对压测开始时刻的单调纳秒
    pub started_at_ns: u64,
    pub vu_id: u64,
}

impl RequestResult {
    pub fn is_timeout(&self) -> bool {
        self.error_kind == ErrorKind::Timeout
    }
}
