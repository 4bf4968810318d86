use base64::Engine;
use rusqlite::Connection;
use std::path::PathBuf;

use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Image bytes from either `params.path` or inline `params.dataBase64`.
pub fn read_image_param(params: &serde_json::Value) -> Result<Vec<u8>, HandlerErr> {
    if let Some(data) = get_optional_str(params, "dataBase64") {
        let payload = data
            .split_once(";base64,")
            .map(|(_, b)| b)
            .unwrap_or(data.as_str());
        return base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| HandlerErr::new("bad_params", format!("dataBase64 is not valid base64: {e}")));
    }
    let Some(path) = get_optional_str(params, "path").map(PathBuf::from) else {
        return Err(HandlerErr::new("bad_params", "missing path or dataBase64"));
    };
    std::fs::read(&path).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string())
            .with_details(serde_json::json!({ "path": path.to_string_lossy() }))
    })
}
