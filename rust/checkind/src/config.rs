use crate::camera::ScanConfig;
use crate::directory::DEFAULT_BATCH_SIZE;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Student check-in sidecar. Speaks newline-delimited JSON on stdin/stdout;
/// logs go to stderr or `--log-file`.
#[derive(Debug, Clone, Parser)]
#[command(name = "checkind", version)]
pub struct Config {
    /// Workspace directory to open at startup (holds checkin.sqlite3).
    #[arg(long, env = "CHECKIND_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Frame spool the UI shell writes camera frames into.
    /// Defaults to `<workspace>/camera`.
    #[arg(long, env = "CHECKIND_CAMERA_SPOOL")]
    pub camera_spool: Option<PathBuf>,

    /// Rows per transaction during bulk import.
    #[arg(long, env = "CHECKIND_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=60))]
    pub scan_fps: u32,

    /// Give up a live scan after this many seconds; 0 scans until cancelled.
    #[arg(long, default_value_t = 120)]
    pub scan_timeout_secs: u64,

    /// tracing EnvFilter directive, e.g. `info` or `checkind=debug`.
    #[arg(long, env = "CHECKIND_LOG", default_value = "info")]
    pub log_filter: String,

    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            fps: self.scan_fps,
            timeout: (self.scan_timeout_secs > 0)
                .then(|| Duration::from_secs(self.scan_timeout_secs)),
        }
    }

    pub fn camera_root(&self, workspace: Option<&Path>) -> Option<PathBuf> {
        self.camera_spool
            .clone()
            .or_else(|| workspace.map(|w| w.join("camera")))
    }
}
