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

fn request_ok(
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
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

fn overall_rows(rows: &serde_json::Value) -> Vec<serde_json::Value> {
    rows["rows"]
        .as_array()
        .expect("rows array")
        .iter()
        .filter(|r| r["courseId"].is_null())
        .cloned()
        .collect()
}

#[test]
fn at_most_one_overall_row_survives_repeated_writes() {
    let workspace = temp_dir("lms-overall-invariant");
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

    let course_a = request_ok(
        &mut stdin,
        &mut reader,
        "course-a",
        "courses.create",
        admin.clone(),
        json!({ "name": "Course A" }),
    )["courseId"]
        .as_str()
        .expect("courseId")
        .to_string();
    let course_b = request_ok(
        &mut stdin,
        &mut reader,
        "course-b",
        "courses.create",
        admin.clone(),
        json!({ "name": "Course B" }),
    )["courseId"]
        .as_str()
        .expect("courseId")
        .to_string();

    let mut lesson_ids = Vec::new();
    for i in 0..10 {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("lesson-{}", i),
            "lessons.create",
            admin.clone(),
            json!({ "courseId": course_a, "title": format!("Lesson {}", i + 1), "sortOrder": i }),
        );
        lesson_ids.push(created["lessonId"].as_str().expect("lessonId").to_string());
    }

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "request",
        "requests.submit",
        json!(null),
        json!({
            "firstName": "Ona",
            "lastName": "Learner",
            "username": "ona",
            "email": "ona@school.test",
            "password": "pw-ona",
            "confirmPassword": "pw-ona",
            "mobile": "555-0102",
            "age": 15,
            "courseIds": [course_a, course_b]
        }),
    );
    let approved = request_ok(
        &mut stdin,
        &mut reader,
        "approve",
        "requests.approve",
        admin.clone(),
        json!({ "requestId": submitted["requestId"] }),
    );
    let student = json!({ "userId": approved["userId"], "role": "student" });
    let student_id = approved["studentId"].as_str().expect("studentId").to_string();

    // Hammer the writers that all touch the overall row.
    for (i, lesson_id) in lesson_ids.iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("complete-{}", i),
            "lessons.markComplete",
            student.clone(),
            json!({ "lessonId": lesson_id }),
        );
    }
    for i in 0..3 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("recalc-{}", i),
            "progress.recalculate",
            admin.clone(),
            json!({ "studentId": student_id }),
        );
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("mine-{}", i),
            "progress.mine",
            student.clone(),
            json!({}),
        );
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("overview-{}", i),
            "progress.overview",
            admin.clone(),
            json!({}),
        );
    }

    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "rows",
        "progress.rows",
        admin.clone(),
        json!({ "studentId": student_id }),
    );
    let overall = overall_rows(&rows);
    assert_eq!(overall.len(), 1, "expected one overall row, got {:?}", overall);

    // Course A is fully complete with no quizzes (70), course B has no
    // lessons and stays at 0: overall = floor((70 + 0) / 2) = 35.
    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "overview-final",
        "progress.overview",
        admin.clone(),
        json!({}),
    );
    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "rows-final",
        "progress.rows",
        admin.clone(),
        json!({ "studentId": student_id }),
    );
    let overall = overall_rows(&rows);
    assert_eq!(overall[0]["percentage"].as_i64(), Some(35));
    assert!(overview["progressData"].as_array().map(|a| !a.is_empty()).unwrap_or(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn overall_row_stays_put_before_any_course_rows_exist() {
    let workspace = temp_dir("lms-overall-empty");
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

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "course",
        "courses.create",
        admin.clone(),
        json!({ "name": "Course" }),
    )["courseId"]
        .as_str()
        .expect("courseId")
        .to_string();
    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "request",
        "requests.submit",
        json!(null),
        json!({
            "firstName": "Rio",
            "lastName": "Learner",
            "username": "rio",
            "email": "rio@school.test",
            "password": "pw-rio",
            "confirmPassword": "pw-rio",
            "mobile": "555-0103",
            "age": 18,
            "courseIds": [course]
        }),
    );
    let approved = request_ok(
        &mut stdin,
        &mut reader,
        "approve",
        "requests.approve",
        admin.clone(),
        json!({ "requestId": submitted["requestId"] }),
    );
    let student_id = approved["studentId"].as_str().expect("studentId").to_string();

    // Approval seeds exactly one overall row at 0; recalculating with no
    // course-scoped rows must not invent a percentage.
    let recalc = request_ok(
        &mut stdin,
        &mut reader,
        "recalc",
        "progress.recalculate",
        admin.clone(),
        json!({ "studentId": student_id }),
    );
    assert_eq!(recalc["percentage"].as_i64(), Some(0));

    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "rows",
        "progress.rows",
        admin.clone(),
        json!({ "studentId": student_id }),
    );
    assert_eq!(overall_rows(&rows).len(), 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
