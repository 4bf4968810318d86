use serde_json::json;

use crate::camera::CameraError;
use crate::decode::DecodeError;
use crate::directory::DirectoryError;
use crate::qr::QrFormatError;
use crate::roster::RosterError;
use crate::session::SessionError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        tracing::warn!(code = self.code, message = %self.message, "request failed");
        err(id, self.code, self.message, self.details)
    }
}

impl From<QrFormatError> for HandlerErr {
    fn from(e: QrFormatError) -> Self {
        let QrFormatError::TooFewFields { found } = e;
        HandlerErr::new("bad_format", e.to_string()).with_details(json!({ "fields": found }))
    }
}

impl From<DecodeError> for HandlerErr {
    fn from(e: DecodeError) -> Self {
        let code = match e {
            DecodeError::Io { .. } => "io_failed",
            DecodeError::Image(_) | DecodeError::NoCode | DecodeError::Unreadable(_) => {
                "decode_failed"
            }
        };
        HandlerErr::new(code, e.to_string())
    }
}

impl From<CameraError> for HandlerErr {
    fn from(e: CameraError) -> Self {
        let code = match e {
            CameraError::Unavailable => "camera_unavailable",
            CameraError::InUse(_) => "camera_in_use",
            CameraError::BadFrame(_) | CameraError::Io(_) => "camera_failed",
        };
        HandlerErr::new(code, e.to_string())
    }
}

impl From<DirectoryError> for HandlerErr {
    fn from(e: DirectoryError) -> Self {
        let code = match e {
            DirectoryError::Unreachable(_) => "backend_unreachable",
            DirectoryError::Query(_) => "db_query_failed",
            DirectoryError::Write(_) => "db_write_failed",
            DirectoryError::MissingRoll => "bad_params",
        };
        HandlerErr::new(code, e.to_string()).with_details(json!({ "table": "students" }))
    }
}

impl From<RosterError> for HandlerErr {
    fn from(e: RosterError) -> Self {
        let code = match e {
            RosterError::Io { .. } => "io_failed",
            RosterError::UnsupportedSpreadsheet(_)
            | RosterError::UnsupportedExtension(_)
            | RosterError::NotText => "unsupported_format",
            RosterError::Empty => "empty_roster",
        };
        HandlerErr::new(code, e.to_string())
    }
}

impl From<SessionError> for HandlerErr {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Busy { in_flight, .. } => HandlerErr::new("busy", e.to_string())
                .with_details(json!({ "inFlight": in_flight.as_str() })),
            SessionError::BadState { view, .. } => {
                HandlerErr::new("bad_state", e.to_string()).with_details(json!({ "view": view }))
            }
            SessionError::NoWorkspace => HandlerErr::new("no_workspace", "select a workspace first"),
            SessionError::Camera(inner) => inner.into(),
            SessionError::Directory(inner) => inner.into(),
        }
    }
}
