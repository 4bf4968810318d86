use crate::camera::{CameraError, CameraProvider, Facing, ScanConfig, ScanOutcome, ScanSession};
use crate::decode;
use crate::directory::{self, DirectoryError, Lookup, UpsertOutcome};
use crate::model::UserInfo;
use crate::qr;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Scan,
    Upload,
    Save,
    Import,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Scan => "scan",
            OperationKind::Upload => "upload",
            OperationKind::Save => "save",
            OperationKind::Import => "import",
        }
    }
}

/// Single-slot lock: at most one scan/upload/save/import outstanding.
#[derive(Clone, Default)]
pub struct OperationLock {
    slot: Arc<Mutex<Option<OperationKind>>>,
}

pub struct OperationGuard {
    slot: Arc<Mutex<Option<OperationKind>>>,
}

impl OperationLock {
    pub fn try_acquire(&self, kind: OperationKind) -> Result<OperationGuard, SessionError> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(in_flight) = *slot {
            return Err(SessionError::Busy {
                requested: kind,
                in_flight,
            });
        }
        *slot = Some(kind);
        Ok(OperationGuard {
            slot: Arc::clone(&self.slot),
        })
    }

    pub fn in_flight(&self) -> Option<OperationKind> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{} rejected: {} already in progress", .requested.as_str(), .in_flight.as_str())]
    Busy {
        requested: OperationKind,
        in_flight: OperationKind,
    },
    #[error("cannot {action} while {view}")]
    BadState {
        action: &'static str,
        view: &'static str,
    },
    #[error("no workspace selected")]
    NoWorkspace,
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum View {
    Idle,
    Scanning,
    Reviewing,
}

impl View {
    pub fn as_str(self) -> &'static str {
        match self {
            View::Idle => "idle",
            View::Scanning => "scanning",
            View::Reviewing => "reviewing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub details: String,
}

impl Notice {
    fn new(level: NoticeLevel, title: &str, details: impl Into<String>) -> Self {
        Self {
            level,
            title: title.to_string(),
            details: details.into(),
        }
    }
}

/// Outcome of matching a scanned profile against the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckIn {
    MarkedPresent,
    MarkFailed,
    NotFound,
    LookupFailed,
    Unchecked,
}

/// Everything the UI needs to render after an action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub view: View,
    pub user: Option<UserInfo>,
    pub check_in: Option<CheckIn>,
    pub status: Option<Notice>,
    pub scan_id: Option<String>,
    pub facing: Option<Facing>,
    pub in_flight: Option<OperationKind>,
}

struct ActiveScan {
    session: ScanSession,
    _guard: OperationGuard,
}

/// The check-in screen: idle → scanning → reviewing → idle.
pub struct Controller {
    view: View,
    user: Option<UserInfo>,
    check_in: Option<CheckIn>,
    status: Option<Notice>,
    scan: Option<ActiveScan>,
    lock: OperationLock,
    scan_config: ScanConfig,
}

impl Controller {
    pub fn new(lock: OperationLock, scan_config: ScanConfig) -> Self {
        Self {
            view: View::Idle,
            user: None,
            check_in: None,
            status: None,
            scan: None,
            lock,
            scan_config,
        }
    }

    pub fn lock(&self) -> &OperationLock {
        &self.lock
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            view: self.view,
            user: self.user.clone(),
            check_in: self.check_in,
            status: self.status.clone(),
            scan_id: self.scan.as_ref().map(|s| s.session.id().to_string()),
            facing: self.scan.as_ref().map(|s| s.session.facing()),
            in_flight: self.lock.in_flight(),
        }
    }

    fn require(&self, action: &'static str, allowed: &[View]) -> Result<(), SessionError> {
        if allowed.contains(&self.view) {
            Ok(())
        } else {
            Err(SessionError::BadState {
                action,
                view: self.view.as_str(),
            })
        }
    }

    fn clear_record(&mut self) {
        self.user = None;
        self.check_in = None;
        self.status = None;
    }

    /// idle → scanning.
    pub fn start_scan(
        &mut self,
        provider: &dyn CameraProvider,
        facing: Facing,
    ) -> Result<Vec<Notice>, SessionError> {
        self.require("start scanning", &[View::Idle])?;
        self.open_scan(provider, facing)
    }

    /// reviewing → scanning, dropping the unsaved record.
    pub fn scan_another(
        &mut self,
        provider: &dyn CameraProvider,
        facing: Facing,
    ) -> Result<Vec<Notice>, SessionError> {
        self.require("scan another", &[View::Reviewing])?;
        self.open_scan(provider, facing)
    }

    fn open_scan(
        &mut self,
        provider: &dyn CameraProvider,
        facing: Facing,
    ) -> Result<Vec<Notice>, SessionError> {
        let guard = self.lock.try_acquire(OperationKind::Scan)?;
        let device = provider.open(facing).map_err(|e| {
            error!(error = %e, "camera unavailable");
            e
        })?;

        self.clear_record();
        let session = ScanSession::start(device, self.scan_config);
        self.scan = Some(ActiveScan {
            session,
            _guard: guard,
        });
        self.view = View::Scanning;
        Ok(Vec::new())
    }

    /// scanning → idle. Stops the scan and hands the camera back.
    pub fn cancel(&mut self) -> Result<Vec<Notice>, SessionError> {
        self.require("cancel", &[View::Scanning])?;
        if let Some(mut active) = self.scan.take() {
            active.session.stop();
        }
        self.view = View::Idle;
        info!("scan cancelled");
        Ok(Vec::new())
    }

    /// Collects a finished scan, if any, and runs the check-in flow on it.
    pub fn poll(&mut self, conn: Option<&Connection>) -> Result<Vec<Notice>, SessionError> {
        if self.view != View::Scanning {
            return Ok(Vec::new());
        }
        let outcome = match self.scan.as_ref() {
            Some(active) if !active.session.is_finished() => return Ok(Vec::new()),
            Some(active) => active.session.outcome(),
            None => ScanOutcome::Failed("scan session missing".to_string()),
        };

        // Dropping the session joins the thread and frees the lock slot.
        if let Some(mut active) = self.scan.take() {
            active.session.stop();
        }
        self.view = View::Idle;

        match outcome {
            ScanOutcome::Decoded(text) => Ok(self.check_in_text(&text, conn)),
            ScanOutcome::Failed(msg) => Ok(vec![Notice::new(
                NoticeLevel::Error,
                "Camera Error",
                format!("Failed to access camera. Please check permissions. ({msg})"),
            )]),
            ScanOutcome::TimedOut => Ok(vec![Notice::new(
                NoticeLevel::Warning,
                "Scan Timed Out",
                "No QR code was detected. Please try again.",
            )]),
            ScanOutcome::Cancelled | ScanOutcome::Pending => Ok(Vec::new()),
        }
    }

    /// Decoded text delivered by the UI shell's own scanner. idle → reviewing.
    pub fn submit_scan(
        &mut self,
        text: &str,
        conn: Option<&Connection>,
    ) -> Result<Vec<Notice>, SessionError> {
        self.require("accept a scan", &[View::Idle])?;
        let _guard = self.lock.try_acquire(OperationKind::Upload)?;
        Ok(self.check_in_text(text, conn))
    }

    /// Uploaded QR image. idle → reviewing on success; stays idle otherwise.
    pub fn upload(
        &mut self,
        image_bytes: &[u8],
        conn: Option<&Connection>,
    ) -> Result<Vec<Notice>, SessionError> {
        self.require("upload an image", &[View::Idle])?;
        let _guard = self.lock.try_acquire(OperationKind::Upload)?;
        match decode::decode_image_bytes(image_bytes) {
            Ok(text) => {
                let mut notices = vec![Notice::new(
                    NoticeLevel::Success,
                    "Image Processed",
                    "QR code from image processed successfully!",
                )];
                notices.extend(self.check_in_text(&text, conn));
                Ok(notices)
            }
            Err(e) => {
                error!(error = %e, "failed to decode uploaded image");
                Ok(vec![Notice::new(
                    NoticeLevel::Error,
                    "Upload Failed",
                    format!(
                        "Failed to process QR code from image. Please try another image. ({e})"
                    ),
                )])
            }
        }
    }

    fn check_in_text(&mut self, text: &str, conn: Option<&Connection>) -> Vec<Notice> {
        let user = match qr::parse_qr_payload(text) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "unparseable QR payload");
                self.view = View::Idle;
                return vec![Notice::new(
                    NoticeLevel::Error,
                    "Invalid QR Code",
                    format!("Failed to parse QR code data. Please try again. ({e})"),
                )];
            }
        };

        let mut notices = vec![Notice::new(
            NoticeLevel::Success,
            "Scanned",
            "QR code scanned successfully!",
        )];
        self.view = View::Reviewing;
        self.user = Some(user.clone());

        let Some(conn) = conn else {
            self.check_in = Some(CheckIn::Unchecked);
            self.status = None;
            return notices;
        };

        let (check_in, status) = match directory::check_exists(conn, &user.roll_number) {
            Lookup::Found(_) => match directory::mark_present(conn, &user.roll_number) {
                Ok(_) => (
                    CheckIn::MarkedPresent,
                    Notice::new(
                        NoticeLevel::Success,
                        "Valid Student!",
                        format!(
                            "{} ({}) has been marked present.",
                            user.name, user.roll_number
                        ),
                    ),
                ),
                Err(e) => {
                    error!(roll = %user.roll_number, error = %e, "failed to mark present");
                    (
                        CheckIn::MarkFailed,
                        Notice::new(NoticeLevel::Error, "Database Error", e.to_string()),
                    )
                }
            },
            Lookup::NotFound => (
                CheckIn::NotFound,
                Notice::new(
                    NoticeLevel::Error,
                    "Invalid Student!",
                    "Student not found in database",
                ),
            ),
            Lookup::QueryFailed(msg) => (
                CheckIn::LookupFailed,
                Notice::new(NoticeLevel::Warning, "Lookup Failed", msg),
            ),
        };
        info!(roll = %user.roll_number, outcome = ?check_in, "check-in processed");
        self.check_in = Some(check_in);
        self.status = Some(status.clone());
        notices.push(status);
        notices
    }

    /// reviewing → idle once the profile is stored; stays reviewing on failure.
    pub fn save(&mut self, conn: Option<&Connection>) -> Result<UpsertOutcome, SessionError> {
        self.require("save", &[View::Reviewing])?;
        let conn = conn.ok_or(SessionError::NoWorkspace)?;
        let _guard = self.lock.try_acquire(OperationKind::Save)?;
        let Some(user) = self.user.as_ref() else {
            return Err(SessionError::BadState {
                action: "save",
                view: "reviewing without a record",
            });
        };
        let outcome = directory::upsert_one(conn, user).map_err(|e| {
            error!(roll = %user.roll_number, error = %e, "failed to save student");
            e
        })?;
        self.clear_record();
        self.view = View::Idle;
        Ok(outcome)
    }

    /// reviewing → idle without saving.
    pub fn reset(&mut self) -> Result<Vec<Notice>, SessionError> {
        self.require("reset", &[View::Reviewing])?;
        self.clear_record();
        self.view = View::Idle;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::fakes::{wait_finished, FakeCamera, FakeFrame};
    use crate::camera::CameraDevice;
    use crate::db::open_in_memory;
    use crate::decode::test_images::{blank_png, render_qr, render_qr_png};
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const ALICE: &str = "Alice | R100 | a@p.com | a@c.edu | 555-1234 | 1 Main St | CS | 2 | true";

    struct FakeProvider {
        camera: RefCell<Option<FakeCamera>>,
    }

    impl FakeProvider {
        fn with(frames: Vec<FakeFrame>) -> (Self, Arc<AtomicUsize>) {
            let (cam, releases) = FakeCamera::new(frames);
            (
                Self {
                    camera: RefCell::new(Some(cam)),
                },
                releases,
            )
        }
    }

    impl CameraProvider for FakeProvider {
        fn open(&self, _preferred: Facing) -> Result<Box<dyn CameraDevice>, CameraError> {
            match self.camera.borrow_mut().take() {
                Some(cam) => Ok(Box::new(cam)),
                None => Err(CameraError::Unavailable),
            }
        }
    }

    fn controller() -> Controller {
        Controller::new(
            OperationLock::default(),
            ScanConfig {
                fps: 200,
                timeout: Some(Duration::from_secs(5)),
            },
        )
    }

    fn wait_for_scan(c: &Controller) {
        let active = c.scan.as_ref().expect("active scan");
        wait_finished(&active.session);
    }

    #[test]
    fn lock_rejects_second_operation() {
        let lock = OperationLock::default();
        let guard = lock.try_acquire(OperationKind::Import).expect("first");
        let err = lock.try_acquire(OperationKind::Save).err().expect("busy");
        assert!(matches!(
            err,
            SessionError::Busy {
                requested: OperationKind::Save,
                in_flight: OperationKind::Import
            }
        ));
        assert_eq!(lock.in_flight(), Some(OperationKind::Import));
        drop(guard);
        assert_eq!(lock.in_flight(), None);
        assert!(lock.try_acquire(OperationKind::Save).is_ok());
    }

    #[test]
    fn scan_of_known_student_marks_present() {
        let conn = open_in_memory();
        directory::upsert_one(&conn, &qr::parse_qr_payload(ALICE).expect("parse")).expect("seed");

        let (provider, releases) = FakeProvider::with(vec![FakeFrame::Frame(render_qr(ALICE))]);
        let mut c = controller();
        c.start_scan(&provider, Facing::Environment).expect("start");
        assert_eq!(c.view(), View::Scanning);
        assert_eq!(c.lock().in_flight(), Some(OperationKind::Scan));

        wait_for_scan(&c);
        let notices = c.poll(Some(&conn)).expect("poll");
        assert_eq!(c.view(), View::Reviewing);
        assert_eq!(c.snapshot().check_in, Some(CheckIn::MarkedPresent));
        assert_eq!(notices.last().map(|n| n.title.as_str()), Some("Valid Student!"));
        assert_eq!(c.lock().in_flight(), None);
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        let record = directory::get_student(&conn, "R100").expect("get").expect("row");
        assert!(record.flags.present);
    }

    #[test]
    fn unknown_student_is_invalid() {
        let conn = open_in_memory();
        let mut c = controller();
        let notices = c.submit_scan(ALICE, Some(&conn)).expect("submit");
        assert_eq!(c.view(), View::Reviewing);
        assert_eq!(c.snapshot().check_in, Some(CheckIn::NotFound));
        assert_eq!(notices.last().map(|n| n.title.as_str()), Some("Invalid Student!"));
    }

    #[test]
    fn lookup_failure_is_not_reported_as_invalid_student() {
        let conn = open_in_memory();
        conn.execute("DROP TABLE students", []).expect("drop");
        let mut c = controller();
        let notices = c.submit_scan(ALICE, Some(&conn)).expect("submit");
        assert_eq!(c.snapshot().check_in, Some(CheckIn::LookupFailed));
        assert_eq!(notices.last().map(|n| n.level), Some(NoticeLevel::Warning));
    }

    #[test]
    fn malformed_payload_stays_idle() {
        let mut c = controller();
        let notices = c.submit_scan("not a profile", None).expect("submit");
        assert_eq!(c.view(), View::Idle);
        assert_eq!(notices[0].title, "Invalid QR Code");
        assert!(c.snapshot().user.is_none());
    }

    #[test]
    fn each_scan_entry_point_accepts_one_view() {
        let conn = open_in_memory();
        let (provider, _) = FakeProvider::with(vec![]);
        let mut c = controller();
        assert!(matches!(
            c.scan_another(&provider, Facing::Environment),
            Err(SessionError::BadState { .. })
        ));

        c.submit_scan(ALICE, Some(&conn)).expect("submit");
        assert_eq!(c.view(), View::Reviewing);
        assert!(matches!(
            c.start_scan(&provider, Facing::Environment),
            Err(SessionError::BadState { .. })
        ));
        assert_eq!(c.view(), View::Reviewing);

        c.scan_another(&provider, Facing::Environment).expect("scan another");
        assert_eq!(c.view(), View::Scanning);
        assert!(c.snapshot().user.is_none());
        c.cancel().expect("cancel");
    }

    #[test]
    fn cancel_releases_camera_and_lock() {
        let (provider, releases) = FakeProvider::with(vec![]);
        let mut c = controller();
        c.start_scan(&provider, Facing::Environment).expect("start");
        assert!(matches!(
            c.submit_scan(ALICE, None),
            Err(SessionError::BadState { .. })
        ));
        c.cancel().expect("cancel");
        assert_eq!(c.view(), View::Idle);
        assert_eq!(c.lock().in_flight(), None);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn camera_unavailable_keeps_idle() {
        let (provider, _) = FakeProvider::with(vec![]);
        provider.camera.borrow_mut().take();
        let mut c = controller();
        assert!(matches!(
            c.start_scan(&provider, Facing::Environment),
            Err(SessionError::Camera(CameraError::Unavailable))
        ));
        assert_eq!(c.view(), View::Idle);
        assert_eq!(c.lock().in_flight(), None);
    }

    #[test]
    fn failed_camera_returns_to_idle_with_error() {
        let (provider, _) = FakeProvider::with(vec![FakeFrame::Broken]);
        let mut c = controller();
        c.start_scan(&provider, Facing::Environment).expect("start");
        wait_for_scan(&c);
        let notices = c.poll(None).expect("poll");
        assert_eq!(c.view(), View::Idle);
        assert_eq!(notices[0].title, "Camera Error");
    }

    #[test]
    fn upload_then_save_and_reset_flow() {
        let conn = open_in_memory();
        let mut c = controller();

        let notices = c.upload(&blank_png(), Some(&conn)).expect("upload");
        assert_eq!(c.view(), View::Idle);
        assert_eq!(notices[0].level, NoticeLevel::Error);

        c.upload(&render_qr_png(ALICE), Some(&conn)).expect("upload");
        assert_eq!(c.view(), View::Reviewing);
        assert!(matches!(c.upload(&blank_png(), Some(&conn)), Err(SessionError::BadState { .. })));

        let outcome = c.save(Some(&conn)).expect("save");
        assert!(outcome.created);
        assert_eq!(c.view(), View::Idle);
        assert!(c.snapshot().user.is_none());

        c.submit_scan(ALICE, Some(&conn)).expect("submit");
        assert_eq!(c.snapshot().check_in, Some(CheckIn::MarkedPresent));
        c.reset().expect("reset");
        assert_eq!(c.view(), View::Idle);
        assert!(matches!(c.reset(), Err(SessionError::BadState { .. })));
    }

    #[test]
    fn save_without_workspace_keeps_record() {
        let mut c = controller();
        c.submit_scan(ALICE, None).expect("submit");
        assert_eq!(c.snapshot().check_in, Some(CheckIn::Unchecked));
        assert!(matches!(c.save(None), Err(SessionError::NoWorkspace)));
        assert_eq!(c.view(), View::Reviewing);
        assert!(c.snapshot().user.is_some());
    }

    #[test]
    fn busy_lock_rejects_upload() {
        let mut c = controller();
        let _import = c.lock().try_acquire(OperationKind::Import).expect("import");
        assert!(matches!(
            c.upload(&render_qr_png(ALICE), None),
            Err(SessionError::Busy { .. })
        ));
        assert_eq!(c.view(), View::Idle);
    }
}
