use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Capabilities {
    pub api_version: &'static str,
    pub ops: Vec<OpInfo>,
    pub streaming: bool,
}

#[derive(Debug, Serialize)]
pub struct OpInfo {
    pub name: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
}
