use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::Config;
use crate::session::Controller;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: Config,
    pub controller: Controller,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let controller = Controller::new(Default::default(), config.scan_config());
        Self {
            workspace: None,
            db: None,
            config,
            controller,
        }
    }
}
