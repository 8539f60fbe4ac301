use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_lmsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn lmsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    caller: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({ "id": id, "method": method, "params": params });
    if !caller.is_null() {
        payload["caller"] = caller;
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    caller: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, caller, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "expected error: {}", value);
    value["error"]["code"].as_str().expect("error code")
}

#[test]
fn each_resource_type_requires_its_own_source_field() {
    let workspace = temp_dir("lms-resources");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!(null),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created_admin = request_ok(
        &mut stdin,
        &mut reader,
        "admin",
        "auth.createAdmin",
        json!(null),
        json!({ "username": "teacher", "email": "teacher@school.test", "password": "pw-admin" }),
    );
    let admin = json!({ "userId": created_admin["userId"], "role": "admin" });

    // File-backed types without a file are rejected.
    let resp = request(
        &mut stdin,
        &mut reader,
        "pdf-no-file",
        "resources.create",
        admin.clone(),
        json!({ "title": "Syllabus", "resourceType": "pdf", "subject": "General" }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    // URL-backed types without a URL are rejected, even with a file path.
    let resp = request(
        &mut stdin,
        &mut reader,
        "yt-no-url",
        "resources.create",
        admin.clone(),
        json!({
            "title": "Intro Video",
            "resourceType": "youtube",
            "filePath": "uploads/intro.mp4",
            "subject": "General"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "unknown-type",
        "resources.create",
        admin.clone(),
        json!({ "title": "Feed", "resourceType": "podcast", "url": "https://x.test", "subject": "General" }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let pdf = request_ok(
        &mut stdin,
        &mut reader,
        "pdf-ok",
        "resources.create",
        admin.clone(),
        json!({
            "title": "Syllabus",
            "resourceType": "pdf",
            "filePath": "uploads/syllabus.pdf",
            "subject": "General"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "link-ok",
        "resources.create",
        admin.clone(),
        json!({
            "title": "MDN",
            "resourceType": "link",
            "url": "https://developer.mozilla.org",
            "subject": "Web"
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "resources.list",
        json!(null),
        json!({}),
    );
    assert_eq!(listed["resources"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(listed["typeCounts"]["pdf"].as_i64(), Some(1));
    assert_eq!(listed["typeCounts"]["link"].as_i64(), Some(1));
    assert_eq!(listed["typeCounts"]["video"].as_i64(), Some(0));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list-filtered",
        "resources.list",
        json!(null),
        json!({ "subject": "Web" }),
    );
    assert_eq!(listed["resources"].as_array().map(|a| a.len()), Some(1));

    // Changing the type re-validates against the stored fields.
    let pdf_id = pdf["resourceId"].as_str().expect("resourceId").to_string();
    let resp = request(
        &mut stdin,
        &mut reader,
        "retype-invalid",
        "resources.update",
        admin.clone(),
        json!({ "resourceId": pdf_id, "resourceType": "youtube" }),
    );
    assert_eq!(error_code(&resp), "validation_failed");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "retype-valid",
        "resources.update",
        admin.clone(),
        json!({ "resourceId": pdf_id, "resourceType": "youtube", "url": "https://youtu.be/abc" }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "delete",
        "resources.delete",
        admin.clone(),
        json!({ "resourceId": pdf_id }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "delete-again",
        "resources.delete",
        admin.clone(),
        json!({ "resourceId": pdf_id }),
    );
    assert_eq!(error_code(&resp), "not_found");

    // Creation is an admin surface.
    let resp = request(
        &mut stdin,
        &mut reader,
        "anon-create",
        "resources.create",
        json!(null),
        json!({ "title": "X", "resourceType": "link", "url": "https://x.test", "subject": "General" }),
    );
    assert_eq!(error_code(&resp), "forbidden");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
