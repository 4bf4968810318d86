use crate::camera::{Facing, SpoolCameraProvider};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, read_image_param};
use crate::ipc::types::{AppState, Request};
use crate::session::Notice;
use serde_json::json;

fn with_state(state: &AppState, notices: Vec<Notice>) -> serde_json::Value {
    json!({
        "state": state.controller.snapshot(),
        "notices": notices,
    })
}

fn camera_provider(state: &AppState) -> Result<SpoolCameraProvider, HandlerErr> {
    state
        .config
        .camera_root(state.workspace.as_deref())
        .map(SpoolCameraProvider::new)
        .ok_or_else(|| {
            HandlerErr::new(
                "camera_unavailable",
                "no camera spool configured; select a workspace or pass --camera-spool",
            )
        })
}

fn facing_param(params: &serde_json::Value) -> Result<Facing, HandlerErr> {
    match get_optional_str(params, "facing").as_deref() {
        None | Some("environment") => Ok(Facing::Environment),
        Some("user") => Ok(Facing::User),
        Some(other) => Err(HandlerErr::new("bad_params", "facing must be environment or user")
            .with_details(json!({ "facing": other }))),
    }
}

fn session_start_scan(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let facing = facing_param(params)?;
    let provider = camera_provider(state)?;
    let notices = state.controller.start_scan(&provider, facing)?;
    Ok(with_state(state, notices))
}

fn session_scan_another(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let facing = facing_param(params)?;
    let provider = camera_provider(state)?;
    let notices = state.controller.scan_another(&provider, facing)?;
    Ok(with_state(state, notices))
}

fn session_poll(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let notices = state.controller.poll(state.db.as_ref())?;
    Ok(with_state(state, notices))
}

fn session_cancel(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let notices = state.controller.cancel()?;
    Ok(with_state(state, notices))
}

fn session_submit_scan(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let text = get_required_str(params, "text")?;
    let notices = state.controller.submit_scan(&text, state.db.as_ref())?;
    Ok(with_state(state, notices))
}

fn session_upload(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let bytes = read_image_param(params)?;
    let notices = state.controller.upload(&bytes, state.db.as_ref())?;
    Ok(with_state(state, notices))
}

fn session_save(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let outcome = state.controller.save(state.db.as_ref())?;
    let mut result = with_state(state, Vec::new());
    result["created"] = json!(outcome.created);
    result["student"] = json!(outcome.record);
    Ok(result)
}

fn session_reset(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let notices = state.controller.reset()?;
    Ok(with_state(state, notices))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "session.get" => Ok(with_state(state, Vec::new())),
        "session.startScan" => session_start_scan(state, &req.params),
        "session.scanAnother" => session_scan_another(state, &req.params),
        "session.poll" => session_poll(state),
        "session.cancel" => session_cancel(state),
        "session.submitScan" => session_submit_scan(state, &req.params),
        "session.upload" => session_upload(state, &req.params),
        "session.save" => session_save(state),
        "session.reset" => session_reset(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
