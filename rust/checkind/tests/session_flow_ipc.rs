use base64::Engine;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar(workspace: &PathBuf) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_checkind");
    let mut child = Command::new(exe)
        .arg("--workspace")
        .arg(workspace)
        .arg("--scan-fps")
        .arg("20")
        .env_remove("CHECKIND_CAMERA_SPOOL")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn checkind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

const ALICE: &str = "Alice | R100 | a@p.com | a@c.edu | 555-1234 | 1 Main St | CS | 2 | true";

fn qr_png(text: &str) -> Vec<u8> {
    let code = qrcode::QrCode::new(text.as_bytes()).expect("encode qr");
    let modules = code.width();
    let scale = 6u32;
    let quiet = 4u32;
    let side = (modules as u32 + quiet * 2) * scale;
    let img = image::GrayImage::from_fn(side, side, |px, py| {
        let mx = (px / scale) as i64 - quiet as i64;
        let my = (py / scale) as i64 - quiet as i64;
        let inside = mx >= 0 && my >= 0 && (mx as usize) < modules && (my as usize) < modules;
        if inside && code[(mx as usize, my as usize)] == qrcode::Color::Dark {
            image::Luma([0u8])
        } else {
            image::Luma([255u8])
        }
    });
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("encode png");
    buf.into_inner()
}

fn notice_titles(result: &serde_json::Value) -> Vec<String> {
    result["notices"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|n| n["title"].as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn poll_until_done(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> serde_json::Value {
    for i in 0..100 {
        let result = request_ok(stdin, reader, &format!("poll-{i}"), "session.poll", json!({}));
        if result["state"]["view"].as_str() != Some("scanning") {
            return result;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("scan never finished");
}

#[test]
fn submitted_scan_checks_in_and_save_returns_to_idle() {
    let workspace = temp_dir("checkind-session-submit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.upsert",
        json!({ "user": { "name": "Alice", "rollNumber": "R100" } }),
    );

    let scanned = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "session.submitScan",
        json!({ "text": ALICE }),
    );
    assert_eq!(notice_titles(&scanned), vec!["Scanned", "Valid Student!"]);
    assert_eq!(scanned["state"]["view"].as_str(), Some("reviewing"));
    assert_eq!(scanned["state"]["checkIn"].as_str(), Some("markedPresent"));
    assert_eq!(scanned["state"]["user"]["phone"].as_str(), Some("555-1234"));

    // Only one record can be under review.
    let again = request(
        &mut stdin,
        &mut reader,
        "3",
        "session.submitScan",
        json!({ "text": ALICE }),
    );
    assert_eq!(again["error"]["code"].as_str(), Some("bad_state"));

    let saved = request_ok(&mut stdin, &mut reader, "4", "session.save", json!({}));
    assert_eq!(saved["created"].as_bool(), Some(false));
    assert_eq!(saved["student"]["present"].as_bool(), Some(true));
    assert_eq!(saved["student"]["personalEmail"].as_str(), Some("a@p.com"));
    assert_eq!(saved["state"]["view"].as_str(), Some("idle"));

    let reset = request(&mut stdin, &mut reader, "5", "session.reset", json!({}));
    assert_eq!(reset["error"]["code"].as_str(), Some("bad_state"));

    let stranger = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "session.submitScan",
        json!({ "text": "Zed | R999 | z@p | z@c | 1 | x | EE | 1 | false" }),
    );
    assert_eq!(notice_titles(&stranger), vec!["Scanned", "Invalid Student!"]);
    assert_eq!(stranger["state"]["checkIn"].as_str(), Some("notFound"));
    request_ok(&mut stdin, &mut reader, "7", "session.reset", json!({}));

    let garbage = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "session.submitScan",
        json!({ "text": "not | enough" }),
    );
    assert_eq!(notice_titles(&garbage), vec!["Invalid QR Code"]);
    assert_eq!(garbage["state"]["view"].as_str(), Some("idle"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn uploaded_image_is_decoded_and_checked_in() {
    let workspace = temp_dir("checkind-session-upload");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    let data = base64::engine::general_purpose::STANDARD.encode(qr_png(ALICE));
    let uploaded = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "session.upload",
        json!({ "dataBase64": format!("data:image/png;base64,{data}") }),
    );
    assert_eq!(
        notice_titles(&uploaded),
        vec!["Image Processed", "Scanned", "Invalid Student!"]
    );
    assert_eq!(uploaded["state"]["view"].as_str(), Some("reviewing"));

    let saved = request_ok(&mut stdin, &mut reader, "2", "session.save", json!({}));
    assert_eq!(saved["created"].as_bool(), Some(true));
    assert_eq!(saved["student"]["isRegistered"].as_bool(), Some(true));

    let blank = workspace.join("blank.png");
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(image::GrayImage::from_pixel(64, 64, image::Luma([255u8])))
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("encode png");
    std::fs::write(&blank, buf.into_inner()).expect("write blank");
    let failed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.upload",
        json!({ "path": blank.to_string_lossy() }),
    );
    assert_eq!(notice_titles(&failed), vec!["Upload Failed"]);
    assert_eq!(failed["state"]["view"].as_str(), Some("idle"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn camera_scan_holds_the_operation_lock_until_done() {
    let workspace = temp_dir("checkind-session-camera");
    let rear = workspace.join("camera").join("environment");
    std::fs::create_dir_all(&rear).expect("create spool");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    let started = request_ok(&mut stdin, &mut reader, "1", "session.startScan", json!({}));
    assert_eq!(started["state"]["view"].as_str(), Some("scanning"));
    assert_eq!(started["state"]["inFlight"].as_str(), Some("scan"));
    assert_eq!(started["state"]["facing"].as_str(), Some("environment"));
    assert!(rear.join(".claimed").is_file());

    let busy = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.upsert",
        json!({ "user": { "name": "Alice", "rollNumber": "R100" } }),
    );
    assert_eq!(busy["error"]["code"].as_str(), Some("busy"));
    assert_eq!(busy["error"]["details"]["inFlight"].as_str(), Some("scan"));

    let cancelled = request_ok(&mut stdin, &mut reader, "3", "session.cancel", json!({}));
    assert_eq!(cancelled["state"]["view"].as_str(), Some("idle"));
    assert!(cancelled["state"]["inFlight"].is_null());
    assert!(!rear.join(".claimed").exists());

    // Leftovers from before the scan started are never decoded.
    std::fs::write(rear.join("0000.png"), qr_png("Old | R000 | o | o | 0 | x | CS | 1 | false"))
        .expect("write stale frame");
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "session.startScan",
        json!({ "facing": "environment" }),
    );
    assert!(!rear.join("0000.png").exists());
    let part = rear.join("0001.png.part");
    std::fs::write(&part, qr_png(ALICE)).expect("write frame");
    std::fs::rename(&part, rear.join("0001.png")).expect("publish frame");
    let done = poll_until_done(&mut stdin, &mut reader);
    assert_eq!(done["state"]["view"].as_str(), Some("reviewing"));
    assert_eq!(done["state"]["user"]["rollNumber"].as_str(), Some("R100"));
    assert!(notice_titles(&done).contains(&"Scanned".to_string()));
    assert!(!rear.join(".claimed").exists());

    let bad_facing = request(
        &mut stdin,
        &mut reader,
        "5",
        "session.scanAnother",
        json!({ "facing": "sideways" }),
    );
    assert_eq!(bad_facing["error"]["code"].as_str(), Some("bad_params"));

    let another = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "session.scanAnother",
        json!({ "facing": "user" }),
    );
    assert_eq!(another["state"]["view"].as_str(), Some("scanning"));
    assert!(another["state"]["user"].is_null());
    request_ok(&mut stdin, &mut reader, "7", "session.cancel", json!({}));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn start_scan_without_camera_or_with_camera_taken_fails() {
    let workspace = temp_dir("checkind-session-nocam");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    let missing = request(&mut stdin, &mut reader, "1", "session.startScan", json!({}));
    assert_eq!(missing["error"]["code"].as_str(), Some("camera_unavailable"));

    let front = workspace.join("camera").join("user");
    std::fs::create_dir_all(&front).expect("create spool");
    std::fs::write(front.join(".claimed"), std::process::id().to_string()).expect("claim");
    let taken = request(&mut stdin, &mut reader, "2", "session.startScan", json!({}));
    assert_eq!(taken["error"]["code"].as_str(), Some("camera_in_use"));

    let state = request_ok(&mut stdin, &mut reader, "3", "session.get", json!({}));
    assert_eq!(state["state"]["view"].as_str(), Some("idle"));
    assert!(state["state"]["inFlight"].is_null());

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn claim_left_by_a_crashed_sidecar_does_not_block_scanning() {
    let workspace = temp_dir("checkind-session-stale-claim");
    let rear = workspace.join("camera").join("environment");
    std::fs::create_dir_all(&rear).expect("create spool");
    std::fs::write(rear.join(".claimed"), b"").expect("abandoned claim");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    let started = request_ok(&mut stdin, &mut reader, "1", "session.startScan", json!({}));
    assert_eq!(started["state"]["view"].as_str(), Some("scanning"));
    let owner = std::fs::read_to_string(rear.join(".claimed")).expect("read claim");
    assert_eq!(owner, child.id().to_string());

    request_ok(&mut stdin, &mut reader, "2", "session.cancel", json!({}));
    assert!(!rear.join(".claimed").exists());

    drop(stdin);
    let _ = child.wait();
}
