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

fn approve_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &serde_json::Value,
    course_id: &str,
    username: &str,
) -> serde_json::Value {
    let submitted = request_ok(
        stdin,
        reader,
        &format!("submit-{}", username),
        "requests.submit",
        json!(null),
        json!({
            "firstName": "Alex",
            "lastName": "Learner",
            "username": username,
            "email": format!("{}@school.test", username),
            "password": "pw-secret",
            "confirmPassword": "pw-secret",
            "mobile": "555-0120",
            "age": 17,
            "courseIds": [course_id]
        }),
    );
    request_ok(
        stdin,
        reader,
        &format!("approve-{}", username),
        "requests.approve",
        admin.clone(),
        json!({ "requestId": submitted["requestId"] }),
    )
}

#[test]
fn assignment_fans_out_and_walks_the_status_ladder() {
    let workspace = temp_dir("lms-assignment-lifecycle");
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

    let course_id = request_ok(
        &mut stdin,
        &mut reader,
        "course",
        "courses.create",
        admin.clone(),
        json!({ "name": "Databases" }),
    )["courseId"]
        .as_str()
        .expect("courseId")
        .to_string();

    let first = approve_student(&mut stdin, &mut reader, &admin, &course_id, "alex");
    let second = approve_student(&mut stdin, &mut reader, &admin, &course_id, "brook");
    let first_caller = json!({ "userId": first["userId"], "role": "student" });

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "assignment",
        "assignments.create",
        admin.clone(),
        json!({
            "courseId": course_id,
            "title": "Normalization Exercise",
            "dueDate": "2027-03-01",
            "maxPoints": 50
        }),
    );
    assert_eq!(created["assignedTo"].as_i64(), Some(2));
    let assignment_id = created["assignmentId"].as_str().expect("assignmentId").to_string();

    let mine = request_ok(
        &mut stdin,
        &mut reader,
        "mine-before",
        "assignments.listMine",
        first_caller.clone(),
        json!({}),
    );
    assert_eq!(mine["notStartedCount"].as_i64(), Some(1));
    assert_eq!(mine["submittedCount"].as_i64(), Some(0));

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "submit",
        "assignments.submit",
        first_caller.clone(),
        json!({ "assignmentId": assignment_id, "submissionText": "3NF decomposition attached" }),
    );
    let row_id = submitted["studentAssignmentId"].as_str().expect("row id").to_string();

    let mine = request_ok(
        &mut stdin,
        &mut reader,
        "mine-after",
        "assignments.listMine",
        first_caller.clone(),
        json!({}),
    );
    assert_eq!(mine["submittedCount"].as_i64(), Some(1));
    let row = &mine["assignments"].as_array().expect("assignments")[0];
    assert_eq!(row["status"].as_str(), Some("submitted"));
    assert!(row["submittedAt"].as_str().is_some());

    // No re-submission once handed in.
    let resp = request(
        &mut stdin,
        &mut reader,
        "resubmit",
        "assignments.submit",
        first_caller.clone(),
        json!({ "assignmentId": assignment_id, "submissionText": "second try" }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    // Grading caps at maxPoints and requires a submission.
    let resp = request(
        &mut stdin,
        &mut reader,
        "grade-too-high",
        "assignments.grade",
        admin.clone(),
        json!({ "studentAssignmentId": row_id, "grade": 51 }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "grade",
        "assignments.grade",
        admin.clone(),
        json!({ "studentAssignmentId": row_id, "grade": 45, "feedback": "Well argued" }),
    );
    assert_eq!(graded["grade"].as_i64(), Some(45));

    let resp = request(
        &mut stdin,
        &mut reader,
        "grade-again",
        "assignments.grade",
        admin.clone(),
        json!({ "studentAssignmentId": row_id, "grade": 40 }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    // The admin view shows one graded and one untouched submission row.
    let submissions = request_ok(
        &mut stdin,
        &mut reader,
        "submissions",
        "assignments.submissions",
        admin.clone(),
        json!({ "assignmentId": assignment_id }),
    );
    let rows = submissions["submissions"].as_array().expect("submissions");
    assert_eq!(rows.len(), 2);
    let graded_row = rows
        .iter()
        .find(|r| r["status"].as_str() == Some("graded"))
        .expect("graded row");
    assert_eq!(graded_row["grade"].as_i64(), Some(45));
    assert_eq!(graded_row["feedback"].as_str(), Some("Well argued"));
    assert!(rows.iter().any(|r| r["status"].as_str() == Some("not_started")));

    let _ = second;
    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn late_enrollees_do_not_get_rows_retroactively() {
    let workspace = temp_dir("lms-assignment-late");
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
    let course_id = request_ok(
        &mut stdin,
        &mut reader,
        "course",
        "courses.create",
        admin.clone(),
        json!({ "name": "Networking" }),
    )["courseId"]
        .as_str()
        .expect("courseId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "assignment",
        "assignments.create",
        admin.clone(),
        json!({ "courseId": course_id, "title": "Subnetting", "dueDate": "2027-04-01" }),
    );
    assert_eq!(created["assignedTo"].as_i64(), Some(0));

    let late = approve_student(&mut stdin, &mut reader, &admin, &course_id, "dale");
    let late_caller = json!({ "userId": late["userId"], "role": "student" });
    let mine = request_ok(
        &mut stdin,
        &mut reader,
        "mine",
        "assignments.listMine",
        late_caller,
        json!({}),
    );
    assert_eq!(mine["assignments"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
