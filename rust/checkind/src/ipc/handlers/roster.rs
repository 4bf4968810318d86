use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::students::batch_size_param;
use crate::ipc::helpers::{get_required_str, require_db};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use crate::session::OperationKind;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

fn roster_import(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let path = PathBuf::from(get_required_str(params, "path")?);
    let batch_size = batch_size_param(state, params);
    let _guard = state.controller.lock().try_acquire(OperationKind::Import)?;

    let report = roster::import_roster(conn, &path, batch_size, &mut |pct| {
        info!(progress = pct, "roster import progress");
    })?;

    let mut result = json!(report);
    result["summary"] = if report.batch.failed == 0 {
        json!(format!("Successfully imported {} students", report.batch.success))
    } else {
        json!(format!(
            "Imported {} students with {} failures",
            report.batch.success, report.batch.failed
        ))
    };
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.import" => Some(respond(&req.id, roster_import(state, &req.params))),
        _ => None,
    }
}
