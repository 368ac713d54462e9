use anyhow::{Error, Result};
use url::Url;

use crate::models::request::ParsedRequest;

pub const MANUAL_REQUEST_NAME: &str = "manual";

// 不走集合，直接压测单个URL。复用同一套请求模型，后面的流水线不感知差异。
pub fn build_manual_requests(raw_url: &str) -> Result<Vec<ParsedRequest>> {
    let raw_url = raw_url.trim();
    if raw_url.is_empty() {
        return Err(Error::msg("manual URL must not be empty"));
    }
    let parsed = Url::parse(raw_url).map_err(|e| Error::msg(format!("invalid manual URL: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(Error::msg(format!("unsupported URL scheme: {}", parsed.scheme())));
    }
    if parsed.host_str().is_none() {
        return Err(Error::msg(format!("invalid manual URL: {raw_url}")));
    }
    Ok(vec![ParsedRequest {
        name: MANUAL_REQUEST_NAME.to_string(),
        folder_path: String::new(),
        method: "GET".to_string(),
        url: raw_url.to_string(),
        headers: Vec::new(),
        body: None,
        query_params: Vec::new(),
    }])
}

// 报告标题用的短名称
pub fn manual_target_name(raw_url: &str) -> String {
    Url::parse(raw_url.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| MANUAL_REQUEST_NAME.to_string())
}
