use rusqlite::OptionalExtension;
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_i64, get_opt_str, get_required_str, open_conn, require_admin, require_student,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::progress;

fn student_courses(
    conn: &rusqlite::Connection,
    student_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.description
         FROM enrollments e
         JOIN courses c ON c.id = e.course_id
         WHERE e.student_id = ?
         ORDER BY c.name",
    )?;
    let courses = stmt
        .query_map([student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(courses)
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;

    let mut stmt = conn.prepare(
        "SELECT sp.id, u.id, u.username, u.email, u.first_name, u.last_name, sp.age, sp.mobile,
                (SELECT COUNT(*) FROM enrollments e WHERE e.student_id = sp.id) AS course_count,
                (SELECT p.percentage FROM progress p
                 WHERE p.student_id = sp.id AND p.course_id IS NULL) AS overall
         FROM student_profiles sp
         JOIN users u ON u.id = sp.user_id
         ORDER BY u.username",
    )?;
    let students = stmt
        .query_map([], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "userId": r.get::<_, String>(1)?,
                "username": r.get::<_, String>(2)?,
                "email": r.get::<_, String>(3)?,
                "firstName": r.get::<_, String>(4)?,
                "lastName": r.get::<_, String>(5)?,
                "age": r.get::<_, i64>(6)?,
                "mobile": r.get::<_, String>(7)?,
                "courseCount": r.get::<_, i64>(8)?,
                "overallPercentage": r.get::<_, Option<i64>>(9)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // Missing overall rows count as 0 in the roster average, same as the
    // admin students screen always did.
    let total: f64 = students
        .iter()
        .map(|s| s["overallPercentage"].as_i64().unwrap_or(0) as f64)
        .sum();
    let average_progress = if students.is_empty() {
        0.0
    } else {
        (total / students.len() as f64 * 10.0).round() / 10.0
    };

    let pending_requests: i64 = conn.query_row(
        "SELECT COUNT(*) FROM student_requests WHERE status = 'pending'",
        [],
        |r| r.get(0),
    )?;
    let total_courses: i64 = conn.query_row("SELECT COUNT(*) FROM courses", [], |r| r.get(0))?;

    Ok(json!({
        "students": students,
        "pendingRequestsCount": pending_requests,
        "totalCourses": total_courses,
        "averageProgress": average_progress,
    }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let row = conn
        .query_row(
            "SELECT u.id, u.username, u.email, u.first_name, u.last_name, sp.age, sp.mobile
             FROM student_profiles sp
             JOIN users u ON u.id = sp.user_id
             WHERE sp.id = ?",
            [student_id.as_str()],
            |r| {
                Ok(json!({
                    "userId": r.get::<_, String>(0)?,
                    "username": r.get::<_, String>(1)?,
                    "email": r.get::<_, String>(2)?,
                    "firstName": r.get::<_, String>(3)?,
                    "lastName": r.get::<_, String>(4)?,
                    "age": r.get::<_, i64>(5)?,
                    "mobile": r.get::<_, String>(6)?,
                }))
            },
        )
        .optional()?;
    let Some(mut student) = row else {
        return Err(HandlerErr::not_found("student not found"));
    };
    student["studentId"] = json!(student_id);
    student["courses"] = json!(student_courses(conn, &student_id)?);
    Ok(student)
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM student_profiles WHERE id = ?",
            [student_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let tx = conn.unchecked_transaction()?;
    if let Some(first_name) = get_opt_str(&req.params, "firstName") {
        tx.execute(
            "UPDATE users SET first_name = ? WHERE id = ?",
            [first_name.as_str(), user_id.as_str()],
        )?;
    }
    if let Some(last_name) = get_opt_str(&req.params, "lastName") {
        tx.execute(
            "UPDATE users SET last_name = ? WHERE id = ?",
            [last_name.as_str(), user_id.as_str()],
        )?;
    }
    if let Some(email) = get_opt_str(&req.params, "email") {
        let taken: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM users WHERE email = ? AND id <> ?",
                [email.as_str(), user_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(HandlerErr::validation("email already exists"));
        }
        tx.execute(
            "UPDATE users SET email = ? WHERE id = ?",
            [email.as_str(), user_id.as_str()],
        )?;
    }
    if let Some(age) = get_opt_i64(&req.params, "age") {
        if age <= 0 {
            return Err(HandlerErr::validation("age must be a positive number"));
        }
        tx.execute(
            "UPDATE student_profiles SET age = ? WHERE id = ?",
            (age, student_id.as_str()),
        )?;
    }
    if let Some(mobile) = get_opt_str(&req.params, "mobile") {
        tx.execute(
            "UPDATE student_profiles SET mobile = ? WHERE id = ?",
            [mobile.as_str(), student_id.as_str()],
        )?;
    }

    // Replacing the membership set is how the edit screen works: unchecked
    // boxes unenroll.
    if let Some(course_ids) = req.params.get("courseIds").and_then(|v| v.as_array()) {
        tx.execute(
            "DELETE FROM enrollments WHERE student_id = ?",
            [student_id.as_str()],
        )?;
        for cid in course_ids.iter().filter_map(|v| v.as_str()) {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM courses WHERE id = ?", [cid], |r| r.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(HandlerErr::not_found(format!("course not found: {}", cid)));
            }
            tx.execute(
                "INSERT INTO enrollments(student_id, course_id) VALUES(?, ?)",
                [student_id.as_str(), cid],
            )?;
        }
    }
    tx.commit()?;

    Ok(json!({ "updated": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM student_profiles WHERE id = ?",
            [student_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::not_found("student not found"));
    };

    // Explicit dependency-order delete; no ON DELETE CASCADE in the schema.
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM discussion_replies
         WHERE post_id IN (SELECT id FROM discussion_posts WHERE author_id = ?)",
        [student_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM discussion_replies WHERE author_id = ?",
        [user_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM discussion_posts WHERE author_id = ?",
        [student_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM student_assignments WHERE student_id = ?",
        [student_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM quiz_attempts WHERE student_id = ?",
        [student_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM lesson_completions WHERE student_id = ?",
        [student_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM progress WHERE student_id = ?",
        [student_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM enrollments WHERE student_id = ?",
        [student_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM notifications WHERE user_id = ?",
        [user_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM student_profiles WHERE id = ?",
        [student_id.as_str()],
    )?;
    tx.execute("DELETE FROM users WHERE id = ?", [user_id.as_str()])?;
    tx.commit()?;

    Ok(json!({ "deleted": true }))
}

fn handle_dashboard(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;

    progress::ensure_progress_row(conn, &student_id, None)?;
    let overall = conn.query_row(
        "SELECT percentage, completed_lessons, total_lessons, last_activity
         FROM progress WHERE student_id = ? AND course_id IS NULL",
        [student_id.as_str()],
        |r| {
            Ok(json!({
                "percentage": r.get::<_, i64>(0)?,
                "completedLessons": r.get::<_, i64>(1)?,
                "totalLessons": r.get::<_, i64>(2)?,
                "lastActivity": r.get::<_, String>(3)?,
            }))
        },
    )?;

    let completed_courses: i64 = conn.query_row(
        "SELECT COUNT(*) FROM progress p
         JOIN enrollments e ON e.course_id = p.course_id AND e.student_id = p.student_id
         WHERE p.student_id = ? AND p.percentage >= 100",
        [student_id.as_str()],
        |r| r.get(0),
    )?;

    Ok(json!({
        "studentId": student_id,
        "courses": student_courses(conn, &student_id)?,
        "overallProgress": overall,
        "completedCourses": completed_courses,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_list(state, req),
        "students.get" => handle_get(state, req),
        "students.update" => handle_update(state, req),
        "students.delete" => handle_delete(state, req),
        "students.dashboard" => handle_dashboard(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
