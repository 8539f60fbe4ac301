use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_required_i64, get_required_str, get_trimmed_str, open_conn, require_admin, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::progress;

/// Public registration: validate, then store a pending request. Nothing is
/// committed on any validation failure.
fn handle_submit(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;

    let first_name = get_trimmed_str(&req.params, "firstName")?;
    let last_name = get_trimmed_str(&req.params, "lastName")?;
    let username = get_trimmed_str(&req.params, "username")?;
    let email = get_trimmed_str(&req.params, "email")?;
    let password = get_required_str(&req.params, "password")?;
    let confirm_password = get_required_str(&req.params, "confirmPassword")?;
    let mobile = get_trimmed_str(&req.params, "mobile")?;
    let age = get_required_i64(&req.params, "age")?;

    if password != confirm_password {
        return Err(HandlerErr::validation("passwords do not match"));
    }
    if age <= 0 {
        return Err(HandlerErr::validation("age must be a positive number"));
    }

    let course_ids: Vec<String> = req
        .params
        .get("courseIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if course_ids.is_empty() {
        return Err(HandlerErr::validation("please select at least one course"));
    }
    for cid in &course_ids {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM courses WHERE id = ?", [cid.as_str()], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(HandlerErr::not_found(format!("course not found: {}", cid)));
        }
    }

    // Unique across live accounts and other pending requests.
    let username_taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE username = ?
             UNION ALL
             SELECT 1 FROM student_requests WHERE username = ? AND status = 'pending'",
            [username.as_str(), username.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    if username_taken.is_some() {
        return Err(HandlerErr::validation("username already exists"));
    }
    let email_taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE email = ?
             UNION ALL
             SELECT 1 FROM student_requests WHERE email = ? AND status = 'pending'",
            [email.as_str(), email.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    if email_taken.is_some() {
        return Err(HandlerErr::validation("email already exists"));
    }

    let tx = conn.unchecked_transaction()?;
    let request_id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, &password);
    tx.execute(
        "INSERT INTO student_requests(id, first_name, last_name, username, email, password_hash, password_salt, mobile, age, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        (
            &request_id,
            &first_name,
            &last_name,
            &username,
            &email,
            &hash,
            &salt,
            &mobile,
            age,
            now_iso(),
        ),
    )?;
    for cid in &course_ids {
        tx.execute(
            "INSERT INTO student_request_courses(request_id, course_id) VALUES(?, ?)",
            [request_id.as_str(), cid.as_str()],
        )?;
    }
    tx.commit()?;

    Ok(json!({ "requestId": request_id, "status": "pending" }))
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;

    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, username, email, mobile, age, created_at
         FROM student_requests
         WHERE status = 'pending'
         ORDER BY created_at",
    )?;
    let mut pending = Vec::new();
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, String>(5)?,
            r.get::<_, i64>(6)?,
            r.get::<_, String>(7)?,
        ))
    })?;
    for row in rows {
        let (id, first_name, last_name, username, email, mobile, age, created_at) = row?;
        let mut course_stmt = conn.prepare(
            "SELECT c.id, c.name
             FROM student_request_courses src
             JOIN courses c ON c.id = src.course_id
             WHERE src.request_id = ?
             ORDER BY c.name",
        )?;
        let courses = course_stmt
            .query_map([id.as_str()], |r| {
                Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        pending.push(json!({
            "id": id,
            "firstName": first_name,
            "lastName": last_name,
            "username": username,
            "email": email,
            "mobile": mobile,
            "age": age,
            "createdAt": created_at,
            "courses": courses,
        }));
    }

    let approved_students: i64 =
        conn.query_row("SELECT COUNT(*) FROM student_profiles", [], |r| r.get(0))?;
    let total_courses: i64 = conn.query_row("SELECT COUNT(*) FROM courses", [], |r| r.get(0))?;

    Ok(json!({
        "pendingRequests": pending,
        "approvedStudents": approved_students,
        "totalCourses": total_courses,
    }))
}

/// Approval materializes account + profile + enrollments + the initial
/// overall progress row, then marks the request approved. Guarded so only a
/// request still pending can be processed; the username is re-checked right
/// before account creation to surface the double-approval race instead of
/// overwriting.
fn handle_approve(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let request_id = get_required_str(&req.params, "requestId")?;

    let row = conn
        .query_row(
            "SELECT first_name, last_name, username, email, password_hash, password_salt, mobile, age, status
             FROM student_requests WHERE id = ?",
            [request_id.as_str()],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, i64>(7)?,
                    r.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?;
    let Some((first_name, last_name, username, email, hash, salt, mobile, age, status)) = row
    else {
        return Err(HandlerErr::not_found("student request not found"));
    };
    if status != "pending" {
        return Err(HandlerErr::validation(format!(
            "request already processed (status: {})",
            status
        )));
    }

    // Race window between two approvals creating the same username: check
    // immediately before insert and report, leaving the request pending.
    let collision: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE username = ?",
            [username.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    if collision.is_some() {
        return Err(HandlerErr::new(
            "username_taken",
            format!("username {} already exists", username),
        ));
    }

    let tx = conn.unchecked_transaction()?;
    let user_id = Uuid::new_v4().to_string();
    // Hash and salt are copied as-is: the approved account keeps the
    // credential the student registered with, with no plaintext stored.
    tx.execute(
        "INSERT INTO users(id, username, email, password_hash, password_salt, first_name, last_name, is_staff, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &user_id, &username, &email, &hash, &salt, &first_name, &last_name, now_iso(),
        ),
    )?;

    let student_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO student_profiles(id, user_id, age, mobile) VALUES(?, ?, ?, ?)",
        (&student_id, &user_id, age, &mobile),
    )?;

    tx.execute(
        "INSERT INTO enrollments(student_id, course_id)
         SELECT ?, course_id FROM student_request_courses WHERE request_id = ?",
        [student_id.as_str(), request_id.as_str()],
    )?;

    progress::ensure_progress_row(&tx, &student_id, None)?;

    tx.execute(
        "UPDATE student_requests SET status = 'approved' WHERE id = ?",
        [request_id.as_str()],
    )?;
    tx.commit()?;

    Ok(json!({
        "userId": user_id,
        "studentId": student_id,
        "username": username,
    }))
}

/// Rejection is deletion: remove the row and its course links, nothing else.
fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let request_id = get_required_str(&req.params, "requestId")?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM student_requests WHERE id = ?",
            [request_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("student request not found"));
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM student_request_courses WHERE request_id = ?",
        [request_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM student_requests WHERE id = ?",
        [request_id.as_str()],
    )?;
    tx.commit()?;

    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "requests.submit" => handle_submit(state, req),
        "requests.list" => handle_list(state, req),
        "requests.approve" => handle_approve(state, req),
        "requests.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
