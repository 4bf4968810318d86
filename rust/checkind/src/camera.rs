use crate::decode::decode_luma;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CLAIM_FILE: &str = ".claimed";
const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Rear camera.
    Environment,
    /// Front camera.
    User,
}

impl Facing {
    pub fn as_str(self) -> &'static str {
        match self {
            Facing::Environment => "environment",
            Facing::User => "user",
        }
    }

    fn other(self) -> Facing {
        match self {
            Facing::Environment => Facing::User,
            Facing::User => Facing::Environment,
        }
    }
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("no camera available")]
    Unavailable,
    #[error("camera is already in use: {0}")]
    InUse(String),
    #[error("unreadable camera frame: {0}")]
    BadFrame(String),
    #[error("camera I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub trait CameraDevice: Send {
    fn facing(&self) -> Facing;

    /// Next captured frame, or `None` when nothing new has arrived yet.
    fn next_frame(&mut self) -> Result<Option<GrayImage>, CameraError>;

    fn release(&mut self) -> Result<(), CameraError>;
}

pub trait CameraProvider {
    fn open(&self, preferred: Facing) -> Result<Box<dyn CameraDevice>, CameraError>;
}

/// Cameras backed by a frame spool: the UI shell writes captured frames into
/// `<root>/environment/` or `<root>/user/`.
///
/// Frames must appear atomically: the shell writes `NNNN.png.part` and renames
/// it to `NNNN.png` once complete. Only `png`/`jpg`/`jpeg`/`bmp` names are read.
/// The claim file holds the owning process id.
pub struct SpoolCameraProvider {
    root: PathBuf,
}

impl SpoolCameraProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CameraProvider for SpoolCameraProvider {
    fn open(&self, preferred: Facing) -> Result<Box<dyn CameraDevice>, CameraError> {
        for facing in [preferred, preferred.other()] {
            let dir = self.root.join(facing.as_str());
            if dir.is_dir() {
                let cam = SpoolCamera::claim(dir, facing)?;
                return Ok(Box::new(cam));
            }
        }
        Err(CameraError::Unavailable)
    }
}

pub struct SpoolCamera {
    dir: PathBuf,
    facing: Facing,
}

impl SpoolCamera {
    fn claim(dir: PathBuf, facing: Facing) -> Result<Self, CameraError> {
        let claim = dir.join(CLAIM_FILE);
        let in_use = || CameraError::InUse(dir.to_string_lossy().to_string());
        match write_claim(&claim) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !claim_is_stale(&claim) {
                    return Err(in_use());
                }
                warn!(path = %claim.to_string_lossy(), "taking over stale camera claim");
                match std::fs::remove_file(&claim) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                write_claim(&claim).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        in_use()
                    } else {
                        e.into()
                    }
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        let cam = Self { dir, facing };
        // Frames from an earlier session belong to an earlier student.
        match cam.discard_frames() {
            Ok(0) => {}
            Ok(discarded) => {
                debug!(facing = facing.as_str(), discarded, "discarded stale camera frames")
            }
            Err(e) => {
                let _ = std::fs::remove_file(&claim);
                return Err(e);
            }
        }
        Ok(cam)
    }

    fn frame_files(&self) -> Result<Vec<PathBuf>, CameraError> {
        let mut frames: Vec<PathBuf> = Vec::new();
        for ent in std::fs::read_dir(&self.dir)? {
            let p = ent?.path();
            if p.is_file() && is_frame_file(&p) {
                frames.push(p);
            }
        }
        frames.sort();
        Ok(frames)
    }

    fn discard_frames(&self) -> Result<usize, CameraError> {
        let frames = self.frame_files()?;
        for p in &frames {
            std::fs::remove_file(p)?;
        }
        Ok(frames.len())
    }

    fn oldest_frame(&self) -> Result<Option<PathBuf>, CameraError> {
        Ok(self.frame_files()?.into_iter().next())
    }
}

fn write_claim(path: &Path) -> std::io::Result<()> {
    let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(f, "{}", std::process::id())?;
    Ok(())
}

/// A claim left behind by a process that no longer runs. Empty or garbled
/// claims count as stale; a claim by this process never does.
fn claim_is_stale(path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return false;
    };
    match raw.trim().parse::<u32>() {
        Ok(pid) if pid == std::process::id() => false,
        Ok(pid) => !process_alive(pid),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn is_frame_file(p: &Path) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl CameraDevice for SpoolCamera {
    fn facing(&self) -> Facing {
        self.facing
    }

    fn next_frame(&mut self) -> Result<Option<GrayImage>, CameraError> {
        let Some(path) = self.oldest_frame()? else {
            return Ok(None);
        };
        let bytes = std::fs::read(&path)?;
        // Consumed either way; a bad frame must not be retried forever.
        std::fs::remove_file(&path)?;
        let img = image::load_from_memory(&bytes).map_err(|e| {
            CameraError::BadFrame(format!("{}: {}", path.to_string_lossy(), e))
        })?;
        Ok(Some(img.to_luma8()))
    }

    fn release(&mut self) -> Result<(), CameraError> {
        std::fs::remove_file(self.dir.join(CLAIM_FILE))?;
        Ok(())
    }
}

/// Owns an open device and releases it at most once.
pub struct DeviceLease {
    device: Option<Box<dyn CameraDevice>>,
}

impl DeviceLease {
    pub fn new(device: Box<dyn CameraDevice>) -> Self {
        Self {
            device: Some(device),
        }
    }

    pub fn device_mut(&mut self) -> Option<&mut Box<dyn CameraDevice>> {
        self.device.as_mut()
    }

    pub fn release(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        match device.release() {
            Ok(()) => debug!(facing = device.facing().as_str(), "camera released"),
            Err(e) => warn!(facing = device.facing().as_str(), error = %e, "failed to release camera"),
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "camelCase")]
pub enum ScanOutcome {
    Pending,
    Decoded(String),
    Failed(String),
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    pub fps: u32,
    pub timeout: Option<Duration>,
}

/// A live scan on a background thread. Stops at the first decoded frame.
pub struct ScanSession {
    id: String,
    facing: Facing,
    stop: Arc<AtomicBool>,
    outcome: Arc<Mutex<ScanOutcome>>,
    handle: Option<JoinHandle<()>>,
}

impl ScanSession {
    pub fn start(device: Box<dyn CameraDevice>, config: ScanConfig) -> Self {
        let id = Uuid::new_v4().to_string();
        let facing = device.facing();
        let stop = Arc::new(AtomicBool::new(false));
        let outcome = Arc::new(Mutex::new(ScanOutcome::Pending));

        let thread_stop = Arc::clone(&stop);
        let thread_outcome = Arc::clone(&outcome);
        let session_id = id.clone();
        let handle = std::thread::spawn(move || {
            let mut lease = DeviceLease::new(device);
            let result = run_scan(&mut lease, &thread_stop, config);
            lease.release();
            info!(session = %session_id, outcome = ?result, "scan finished");
            *thread_outcome.lock().unwrap_or_else(|p| p.into_inner()) = result;
        });

        info!(session = %id, facing = facing.as_str(), fps = config.fps, "scan started");
        Self {
            id,
            facing,
            stop,
            outcome,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn outcome(&self) -> ScanOutcome {
        self.outcome
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome() != ScanOutcome::Pending
    }

    /// Signals the scan thread and waits for it to hand the device back.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(session = %self.id, "scan thread panicked");
            }
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_scan(lease: &mut DeviceLease, stop: &AtomicBool, config: ScanConfig) -> ScanOutcome {
    let interval = Duration::from_millis(1000 / u64::from(config.fps.max(1)));
    let started = Instant::now();
    loop {
        if stop.load(Ordering::SeqCst) {
            return ScanOutcome::Cancelled;
        }
        if let Some(limit) = config.timeout {
            if started.elapsed() >= limit {
                return ScanOutcome::TimedOut;
            }
        }
        let Some(device) = lease.device_mut() else {
            return ScanOutcome::Failed("camera already released".to_string());
        };
        match device.next_frame() {
            Ok(Some(frame)) => match decode_luma(&frame) {
                Ok(text) => return ScanOutcome::Decoded(text),
                Err(e) => debug!(error = %e, "frame without QR code"),
            },
            Ok(None) => {}
            Err(CameraError::BadFrame(msg)) => warn!(%msg, "skipping camera frame"),
            Err(e) => return ScanOutcome::Failed(e.to_string()),
        }
        std::thread::sleep(interval);
    }
}
