use serde::{Deserialize, Serialize};

// 请求体：原始文本或者urlencoded表单
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum RequestBody {
    Raw(String),
    Form(Vec<(String, String)>),
}

// 解析后的请求模板，运行期间不可变
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ParsedRequest {
    pub name: String,
    pub folder_path: String,
    pub method: String,
    pub url: String,
    // 有序请求头，键比较不区分大小写
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub query_params: Vec<(String, String)>,
}

impl ParsedRequest {
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}
