use crate::directory::{self, Lookup};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_required_str, require_db};
use crate::ipc::types::{AppState, Request};
use crate::model::UserInfo;
use crate::roster;
use crate::session::OperationKind;
use serde_json::json;
use std::collections::BTreeMap;

fn students_check_exists(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let roll = get_required_str(params, "rollNumber")?;
    Ok(match directory::check_exists(conn, &roll) {
        Lookup::Found(student) => json!({ "exists": true, "student": student }),
        Lookup::NotFound => json!({
            "exists": false,
            "error": "Student not found in database",
            "errorKind": "not_found"
        }),
        Lookup::QueryFailed(message) => json!({
            "exists": false,
            "error": message,
            "errorKind": "query_failed"
        }),
    })
}

fn students_mark_present(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let roll = get_required_str(params, "rollNumber")?;
    let matched = directory::mark_present(conn, &roll)?;
    Ok(json!({ "success": true, "matched": matched }))
}

fn students_upsert(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user: UserInfo = params
        .get("user")
        .cloned()
        .ok_or_else(|| HandlerErr::new("bad_params", "missing user"))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| HandlerErr::new("bad_params", format!("invalid user: {e}")))
        })?;
    let _guard = state.controller.lock().try_acquire(OperationKind::Save)?;
    let outcome = directory::upsert_one(conn, &user)?;
    Ok(json!({ "created": outcome.created, "student": outcome.record }))
}

/// Loose `{ column: value }` objects; scalars other than strings are stringified.
fn parse_row_objects(params: &serde_json::Value) -> Result<Vec<BTreeMap<String, String>>, HandlerErr> {
    let Some(rows) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing rows"));
    };
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            return Err(HandlerErr::new("bad_params", "rows must be objects")
                .with_details(json!({ "index": i })));
        };
        let mut cells = BTreeMap::new();
        for (k, v) in obj {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            cells.insert(k.clone(), value);
        }
        out.push(cells);
    }
    Ok(out)
}

pub fn batch_size_param(state: &AppState, params: &serde_json::Value) -> usize {
    params
        .get("batchSize")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .filter(|v| *v > 0)
        .unwrap_or(state.config.batch_size)
}

fn students_upsert_batch(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let objects = parse_row_objects(params)?;
    let batch_size = batch_size_param(state, params);
    let _guard = state.controller.lock().try_acquire(OperationKind::Import)?;
    let rows = roster::rows_from_objects(&objects);
    let report = directory::upsert_batch(conn, &rows, batch_size, &mut |_, _| {});
    Ok(json!(report))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.checkExists" => students_check_exists(state, &req.params),
        "students.markPresent" => students_mark_present(state, &req.params),
        "students.upsert" => students_upsert(state, &req.params),
        "students.upsertBatch" => students_upsert_batch(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
