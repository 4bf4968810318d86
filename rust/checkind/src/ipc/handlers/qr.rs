use crate::decode;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, read_image_param};
use crate::ipc::types::{AppState, Request};
use crate::qr;
use serde_json::json;
use std::path::Path;

fn qr_parse(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let payload = get_required_str(params, "payload")?;
    let user = qr::parse_qr_payload(&payload)?;
    Ok(json!({ "user": user }))
}

fn qr_decode_image(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let text = match get_optional_str(params, "path") {
        Some(path) if params.get("dataBase64").is_none() => {
            decode::decode_image_file(Path::new(&path))?
        }
        _ => decode::decode_image_bytes(&read_image_param(params)?)?,
    };
    let user = qr::parse_qr_payload(&text).ok();
    Ok(json!({ "text": text, "user": user }))
}

pub fn try_handle(_state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "qr.parse" => Some(respond(&req.id, qr_parse(&req.params))),
        "qr.decodeImage" => Some(respond(&req.id, qr_decode_image(&req.params))),
        _ => None,
    }
}
