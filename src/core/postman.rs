use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Error, Result};
use serde_json::Value;

use crate::core::prepare::substitute_vars;
use crate::models::request::{ParsedRequest, RequestBody};

// Postman v2.1集合解析：保留目录层级，展开成有序请求列表。
// 环境变量优先级：运行时覆盖 > 同目录<stem>_env.json。
pub fn load_collection(
    path: &Path,
    env_override: &BTreeMap<String, String>,
) -> Result<Vec<ParsedRequest>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("cannot read collection file: {}", path.display()))?;
    let root: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("invalid JSON in collection: {}", path.display()))?;
    let root = root
        .as_object()
        .ok_or_else(|| Error::msg("collection must be a JSON object"))?;

    let mut env = load_sidecar_env(path);
    for (k, v) in env_override {
        env.insert(k.clone(), v.clone());
    }

    let mut requests = Vec::new();
    if let Some(items) = root.get("item").and_then(Value::as_array) {
        walk_items(items, "", &env, &mut requests);
    }
    tracing::debug!(count = requests.len(), "集合解析完成");
    Ok(requests)
}

// Postman导出的环境文件：{"values": [{"key": ..., "value": ...}]}
fn load_sidecar_env(collection_path: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let stem = match collection_path.file_stem().and_then(|s| s.to_str()) {
        Some(s) => s,
        None => return env,
    };
    let env_path = collection_path.with_file_name(format!("{stem}_env.json"));
    let raw = match std::fs::read(&env_path) {
        Ok(raw) => raw,
        Err(_) => return env,
    };
    let parsed: Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(path = %env_path.display(), "环境文件解析失败，忽略");
            return env;
        }
    };
    if let Some(values) = parsed.get("values").and_then(Value::as_array) {
        for v in values {
            if let Some(key) = v.get("key").and_then(Value::as_str) {
                let value = v.get("value").map(value_to_string).unwrap_or_default();
                env.insert(key.to_string(), value);
            }
        }
    }
    env
}

fn walk_items(
    items: &[Value],
    folder_path: &str,
    env: &BTreeMap<String, String>,
    out: &mut Vec<ParsedRequest>,
) {
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let name = obj.get("name").and_then(Value::as_str).unwrap_or("Unnamed");
        if obj.contains_key("request") {
            // 解析失败的条目跳过，不让单个坏请求拖垮整个集合
            if let Some(req) = parse_request_item(obj, folder_path, env) {
                out.push(req);
            }
        }
        if let Some(sub) = obj.get("item").and_then(Value::as_array) {
            let new_path = if folder_path.is_empty() {
                name.to_string()
            } else {
                format!("{folder_path}/{name}")
            };
            walk_items(sub, &new_path, env, out);
        }
    }
}

fn parse_request_item(
    item: &serde_json::Map<String, Value>,
    folder_path: &str,
    env: &BTreeMap<String, String>,
) -> Option<ParsedRequest> {
    let req = item.get("request")?.as_object()?;

    let mut query_params = Vec::new();
    let url = match req.get("url") {
        Some(Value::String(s)) => substitute_vars(s, env),
        Some(Value::Object(url_obj)) => {
            query_params = parse_query(url_obj, env);
            substitute_vars(&assemble_url(url_obj), env)
        }
        _ => return None,
    };

    let method = req
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .trim()
        .to_uppercase();
    let headers = parse_headers(req.get("header"), env);
    let body = parse_body(req.get("body"), env);

    Some(ParsedRequest {
        name: item
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Unnamed")
            .to_string(),
        folder_path: folder_path.to_string(),
        method,
        url,
        headers,
        body,
        query_params,
    })
}

// Postman的url对象：protocol/host/path分段存放
fn assemble_url(url_obj: &serde_json::Map<String, Value>) -> String {
    let protocol = url_obj
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or("https");
    let host = match url_obj.get("host") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("."),
        _ => String::new(),
    };
    let path = match url_obj.get("path") {
        Some(Value::Array(parts)) => {
            let joined = parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("/");
            if joined.is_empty() || joined.starts_with('/') {
                joined
            } else {
                format!("/{joined}")
            }
        }
        _ => String::new(),
    };
    format!("{protocol}://{host}{path}")
}

fn parse_query(
    url_obj: &serde_json::Map<String, Value>,
    env: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(query) = url_obj.get("query").and_then(Value::as_array) {
        for q in query {
            let Some(obj) = q.as_object() else { continue };
            if obj.get("disabled").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let Some(key) = obj.get("key").and_then(Value::as_str) else { continue };
            let value = obj.get("value").and_then(Value::as_str).unwrap_or("");
            out.push((substitute_vars(key, env), substitute_vars(value, env)));
        }
    }
    out
}

fn parse_headers(headers: Option<&Value>, env: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(list) = headers.and_then(Value::as_array) {
        for h in list {
            let Some(obj) = h.as_object() else { continue };
            if obj.get("disabled").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let Some(key) = obj.get("key").and_then(Value::as_str) else { continue };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = obj.get("value").map(value_to_string).unwrap_or_default();
            out.push((key.to_string(), substitute_vars(&value, env)));
        }
    }
    out
}

fn parse_body(body: Option<&Value>, env: &BTreeMap<String, String>) -> Option<RequestBody> {
    let obj = body?.as_object()?;
    match obj.get("mode").and_then(Value::as_str) {
        Some("raw") => {
            let raw = obj.get("raw").map(value_to_string)?;
            Some(RequestBody::Raw(substitute_vars(&raw, env)))
        }
        Some("urlencoded") => {
            let fields = obj.get("urlencoded").and_then(Value::as_array)?;
            let mut out = Vec::new();
            for f in fields {
                let Some(field) = f.as_object() else { continue };
                if field.get("disabled").and_then(Value::as_bool).unwrap_or(false) {
                    continue;
                }
                let Some(key) = field.get("key").and_then(Value::as_str) else { continue };
                let value = field.get("value").map(value_to_string).unwrap_or_default();
                out.push((key.to_string(), substitute_vars(&value, env)));
            }
            Some(RequestBody::Form(out))
        }
        _ => None,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLECTION: &str = r#"{
        "info": {"name": "demo", "schema": "https://schema.getpostman.com/json/collection/v2.1.0/collection.json"},
        "item": [
            {
                "name": "auth",
                "item": [
                    {
                        "name": "login",
                        "request": {
                            "method": "post",
                            "url": "https://{{host}}/login",
                            "header": [
                                {"key": "X-Trace", "value": "{{trace}}"},
                                {"key": "X-Skip", "value": "x", "disabled": true}
                            ],
                            "body": {"mode": "raw", "raw": "{\"user\":\"{{user}}\"}"}
                        }
                    }
                ]
            },
            {
                "name": "list",
                "request": {
                    "method": "GET",
                    "url": {
                        "protocol": "http",
                        "host": ["api", "local"],
                        "path": ["v1", "items"],
                        "query": [{"key": "page", "value": "1"}]
                    }
                }
            },
            {"name": "not-a-request"}
        ]
    }"#;

    fn write_collection(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("demo.json");
        std::fs::write(&path, COLLECTION).unwrap();
        path
    }

    #[test]
    fn test_collection_flattened_in_folder_order() {
        let dir = std::env::temp_dir().join("deli-postman-test-1");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_collection(&dir);
        let env: BTreeMap<String, String> =
            [("host".to_string(), "api.local".to_string())].into();
        let requests = load_collection(&path, &env).unwrap();
        assert_eq!(requests.len(), 2);

        assert_eq!(requests[0].name, "login");
        assert_eq!(requests[0].folder_path, "auth");
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].url, "https://api.local/login");
        // disabled的请求头被跳过
        assert_eq!(requests[0].headers.len(), 1);
        // 没有绑定的token保留原样
        assert_eq!(requests[0].headers[0].1, "{{trace}}");
        assert!(matches!(requests[0].body, Some(RequestBody::Raw(_))));

        assert_eq!(requests[1].name, "list");
        assert_eq!(requests[1].folder_path, "");
        assert_eq!(requests[1].url, "http://api.local/v1/items");
        assert_eq!(requests[1].query_params, vec![("page".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_sidecar_env_loaded_and_overridden() {
        let dir = std::env::temp_dir().join("deli-postman-test-2");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_collection(&dir);
        std::fs::write(
            dir.join("demo_env.json"),
            r#"{"values": [{"key": "host", "value": "from-file"}, {"key": "trace", "value": "t1"}]}"#,
        )
        .unwrap();
        // 运行时覆盖优先于环境文件
        let overrides: BTreeMap<String, String> =
            [("host".to_string(), "from-cli".to_string())].into();
        let requests = load_collection(&path, &overrides).unwrap();
        assert_eq!(requests[0].url, "https://from-cli/login");
        assert_eq!(requests[0].headers[0].1, "t1");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let missing = std::path::Path::new("/nonexistent/deli.json");
        assert!(load_collection(missing, &BTreeMap::new()).is_err());
    }
}
