use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Error, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;

use crate::models::request::{ParsedRequest, RequestBody};

// 字面量替换{{var}}，没有绑定的token原样保留
pub fn substitute_vars(text: &str, env: &BTreeMap<String, String>) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match env.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // 没有闭合，剩余部分原样输出
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

// 请求模板的一次性产物：头表、体字节、最终url在启动时算好，热路径只做克隆
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub name: String,
    pub folder_path: String,
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl PreparedRequest {
    pub fn prepare(req: &ParsedRequest, env: &BTreeMap<String, String>) -> Result<Self> {
        let method = Method::from_str(&req.method.to_uppercase())
            .map_err(|_| Error::msg(format!("invalid method: {}", req.method)))?;

        let mut url = substitute_vars(&req.url, env);
        if !req.query_params.is_empty() {
            let pairs: Vec<(String, String)> = req
                .query_params
                .iter()
                .map(|(k, v)| (substitute_vars(k, env), substitute_vars(v, env)))
                .collect();
            let encoded = serde_urlencoded::to_string(&pairs)
                .map_err(|e| Error::msg(format!("cannot encode query params: {e}")))?;
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&encoded);
        }

        let mut headers = HeaderMap::new();
        for (k, v) in &req.headers {
            let name = k
                .parse::<HeaderName>()
                .map_err(|_| Error::msg(format!("invalid header name: {k}")))?;
            let value = substitute_vars(v, env)
                .parse::<HeaderValue>()
                .map_err(|_| Error::msg(format!("invalid header value for {k}")))?;
            headers.append(name, value);
        }

        let body = match &req.body {
            None => None,
            Some(RequestBody::Raw(text)) => {
                if !req.has_header("content-type") {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Some(Bytes::from(substitute_vars(text, env).into_bytes()))
            }
            Some(RequestBody::Form(fields)) => {
                let resolved: Vec<(String, String)> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute_vars(v, env)))
                    .collect();
                let encoded = serde_urlencoded::to_string(&resolved)
                    .map_err(|e| Error::msg(format!("cannot encode form body: {e}")))?;
                if !req.has_header("content-type") {
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                }
                Some(Bytes::from(encoded.into_bytes()))
            }
        };

        Ok(PreparedRequest {
            name: req.name.clone(),
            folder_path: req.folder_path.clone(),
            method,
            url,
            headers,
            body,
        })
    }
}

pub fn prepare_requests(
    requests: &[ParsedRequest],
    env: &BTreeMap<String, String>,
) -> Result<Vec<PreparedRequest>> {
    requests.iter().map(|r| PreparedRequest::prepare(r, env)).collect()
}
