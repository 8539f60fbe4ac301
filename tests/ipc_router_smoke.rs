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
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if !caller.is_null() {
        payload["caller"] = caller;
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
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

fn admin(user_id: &str) -> serde_json::Value {
    json!({ "userId": user_id, "role": "admin" })
}

fn student(user_id: &str) -> serde_json::Value {
    json!({ "userId": user_id, "role": "student" })
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("lms-router-smoke");
    let bundle_out = workspace.join("smoke-backup.lmsbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(&mut stdin, &mut reader, "1", "health", json!(null), json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!(null),
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created_admin = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.createAdmin",
        json!(null),
        json!({ "username": "smokeadmin", "email": "smokeadmin@school.test", "password": "pw-1234" }),
    );
    let admin_id = created_admin["userId"].as_str().expect("userId").to_string();

    let created_course = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.create",
        admin(&admin_id),
        json!({ "name": "Smoke Course" }),
    );
    let course_id = created_course["courseId"].as_str().expect("courseId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "lessons.create",
        admin(&admin_id),
        json!({ "courseId": course_id, "title": "Lesson One" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "quizzes.create",
        admin(&admin_id),
        json!({ "courseId": course_id, "title": "Quiz One" }),
    );

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "requests.submit",
        json!(null),
        json!({
            "firstName": "Smoke",
            "lastName": "Student",
            "username": "smokestudent",
            "email": "smokestudent@school.test",
            "password": "pw-5678",
            "confirmPassword": "pw-5678",
            "mobile": "555-0100",
            "age": 17,
            "courseIds": [course_id]
        }),
    );
    let request_id = submitted["requestId"].as_str().expect("requestId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "requests.list",
        admin(&admin_id),
        json!({}),
    );
    let approved = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "requests.approve",
        admin(&admin_id),
        json!({ "requestId": request_id }),
    );
    let student_user = approved["userId"].as_str().expect("userId").to_string();
    let student_id = approved["studentId"].as_str().expect("studentId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "auth.studentLogin",
        json!(null),
        json!({ "username": "smokestudent", "password": "pw-5678" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.list",
        admin(&admin_id),
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "students.dashboard",
        student(&student_user),
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "courses.open",
        student(&student_user),
        json!({ "courseId": course_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "progress.overview",
        admin(&admin_id),
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "progress.rows",
        admin(&admin_id),
        json!({ "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "progress.mine",
        student(&student_user),
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "assignments.create",
        admin(&admin_id),
        json!({ "courseId": course_id, "title": "Smoke Homework", "dueDate": "2027-01-15" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "assignments.listMine",
        student(&student_user),
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "resources.create",
        admin(&admin_id),
        json!({
            "title": "Course Site",
            "resourceType": "link",
            "url": "https://example.test/course",
            "subject": "General"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "resources.list",
        json!(null),
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "notifications.send",
        admin(&admin_id),
        json!({ "userId": "all", "title": "Welcome", "message": "Term starts Monday" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "notifications.list",
        student(&student_user),
        json!({}),
    );
    let created_room = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "discussions.createRoom",
        admin(&admin_id),
        json!({ "courseId": course_id, "name": "Smoke Room" }),
    );
    let room_id = created_room["roomId"].as_str().expect("roomId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "discussions.rooms",
        student(&student_user),
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "discussions.createPost",
        student(&student_user),
        json!({ "roomId": room_id, "title": "First", "content": "Hello room" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "26",
        "chat.message",
        student(&student_user),
        json!({ "message": "hello" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "27",
        "backup.exportWorkspaceBundle",
        admin(&admin_id),
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "28",
        "backup.importWorkspaceBundle",
        admin(&admin_id),
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "29",
        "courses.delete",
        admin(&admin_id),
        json!({ "courseId": course_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

// Unparseable input must still produce a parseable error line, even when the
// parser's own message contains quotes.
#[test]
fn malformed_lines_get_a_parseable_error() {
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    writeln!(stdin, "{}", r#"{"id":"x","method":"m","caller":"nope"}"#).expect("write line");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).expect("error response must be valid json");
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(value["error"]["code"].as_str(), Some("bad_json"));

    writeln!(stdin, "this is not json at all").expect("write line");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).expect("error response must be valid json");
    assert_eq!(value["error"]["code"].as_str(), Some("bad_json"));

    drop(stdin);
    let _ = child.wait();
}
