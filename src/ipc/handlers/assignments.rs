use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_exists, get_opt_i64, get_opt_str, get_required_str, get_trimmed_str, open_conn,
    require_admin, require_student, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn assignment_exists(
    conn: &rusqlite::Connection,
    assignment_id: &str,
) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [assignment_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_filter = get_opt_str(&req.params, "courseId");
    let mut stmt = conn.prepare(
        "SELECT a.id, a.course_id, c.name, a.title, a.description, a.due_date, a.max_points,
                (SELECT COUNT(*) FROM student_assignments sa WHERE sa.assignment_id = a.id) AS assigned,
                (SELECT COUNT(*) FROM student_assignments sa
                 WHERE sa.assignment_id = a.id AND sa.status = 'submitted') AS submitted,
                (SELECT COUNT(*) FROM student_assignments sa
                 WHERE sa.assignment_id = a.id AND sa.status = 'graded') AS graded
         FROM assignments a
         JOIN courses c ON c.id = a.course_id
         WHERE (?1 IS NULL OR a.course_id = ?1)
         ORDER BY a.due_date, a.title",
    )?;
    let assignments = stmt
        .query_map([&course_filter], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "courseName": r.get::<_, String>(2)?,
                "title": r.get::<_, String>(3)?,
                "description": r.get::<_, String>(4)?,
                "dueDate": r.get::<_, String>(5)?,
                "maxPoints": r.get::<_, i64>(6)?,
                "assignedCount": r.get::<_, i64>(7)?,
                "submittedCount": r.get::<_, i64>(8)?,
                "gradedCount": r.get::<_, i64>(9)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "assignments": assignments }))
}

/// Creating an assignment fans it out to every student currently enrolled
/// in the course. Students who enroll later do not get a row
/// retroactively.
fn handle_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let title = get_trimmed_str(&req.params, "title")?;
    let description = get_opt_str(&req.params, "description").unwrap_or_default();
    let due_date = get_required_str(&req.params, "dueDate")?;
    let max_points = get_opt_i64(&req.params, "maxPoints").unwrap_or(100);
    if max_points <= 0 {
        return Err(HandlerErr::validation("maxPoints must be a positive number"));
    }

    let assignment_id = Uuid::new_v4().to_string();
    let now = now_iso();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO assignments(id, course_id, title, description, due_date, max_points, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &course_id,
            &title,
            &description,
            &due_date,
            max_points,
            &now,
            &now,
        ),
    )?;
    let enrolled = {
        let mut stmt =
            tx.prepare("SELECT student_id FROM enrollments WHERE course_id = ?")?;
        let ids = stmt
            .query_map([course_id.as_str()], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<String>, _>>()?;
        ids
    };
    for student_id in &enrolled {
        tx.execute(
            "INSERT INTO student_assignments(id, student_id, assignment_id, status, created_at, updated_at)
             VALUES(?, ?, ?, 'not_started', ?, ?)",
            (
                Uuid::new_v4().to_string(),
                student_id.as_str(),
                assignment_id.as_str(),
                now.as_str(),
                now.as_str(),
            ),
        )?;
    }
    tx.commit()?;

    Ok(json!({
        "assignmentId": assignment_id,
        "title": title,
        "assignedTo": enrolled.len(),
    }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    if !assignment_exists(conn, &assignment_id)? {
        return Err(HandlerErr::not_found("assignment not found"));
    }
    if let Some(title) = get_opt_str(&req.params, "title") {
        conn.execute(
            "UPDATE assignments SET title = ? WHERE id = ?",
            [title.as_str(), assignment_id.as_str()],
        )?;
    }
    if let Some(description) = get_opt_str(&req.params, "description") {
        conn.execute(
            "UPDATE assignments SET description = ? WHERE id = ?",
            [description.as_str(), assignment_id.as_str()],
        )?;
    }
    if let Some(due_date) = get_opt_str(&req.params, "dueDate") {
        conn.execute(
            "UPDATE assignments SET due_date = ? WHERE id = ?",
            [due_date.as_str(), assignment_id.as_str()],
        )?;
    }
    if let Some(max_points) = get_opt_i64(&req.params, "maxPoints") {
        if max_points <= 0 {
            return Err(HandlerErr::validation("maxPoints must be a positive number"));
        }
        conn.execute(
            "UPDATE assignments SET max_points = ? WHERE id = ?",
            (max_points, assignment_id.as_str()),
        )?;
    }
    conn.execute(
        "UPDATE assignments SET updated_at = ? WHERE id = ?",
        (now_iso(), assignment_id.as_str()),
    )?;
    Ok(json!({ "updated": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    if !assignment_exists(conn, &assignment_id)? {
        return Err(HandlerErr::not_found("assignment not found"));
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM student_assignments WHERE assignment_id = ?",
        [assignment_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM assignments WHERE id = ?",
        [assignment_id.as_str()],
    )?;
    tx.commit()?;
    Ok(json!({ "deleted": true }))
}

fn handle_submissions(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let assignment_id = get_required_str(&req.params, "assignmentId")?;

    let assignment = conn
        .query_row(
            "SELECT a.title, a.due_date, a.max_points, c.name
             FROM assignments a
             JOIN courses c ON c.id = a.course_id
             WHERE a.id = ?",
            [assignment_id.as_str()],
            |r| {
                Ok(json!({
                    "title": r.get::<_, String>(0)?,
                    "dueDate": r.get::<_, String>(1)?,
                    "maxPoints": r.get::<_, i64>(2)?,
                    "courseName": r.get::<_, String>(3)?,
                }))
            },
        )
        .optional()?;
    let Some(mut assignment) = assignment else {
        return Err(HandlerErr::not_found("assignment not found"));
    };

    let mut stmt = conn.prepare(
        "SELECT sa.id, sa.student_id, u.username, u.first_name, u.last_name,
                sa.status, sa.submission_text, sa.submitted_at, sa.grade, sa.feedback
         FROM student_assignments sa
         JOIN student_profiles sp ON sp.id = sa.student_id
         JOIN users u ON u.id = sp.user_id
         WHERE sa.assignment_id = ?
         ORDER BY u.username",
    )?;
    let submissions = stmt
        .query_map([assignment_id.as_str()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "username": r.get::<_, String>(2)?,
                "firstName": r.get::<_, String>(3)?,
                "lastName": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
                "submissionText": r.get::<_, Option<String>>(6)?,
                "submittedAt": r.get::<_, Option<String>>(7)?,
                "grade": r.get::<_, Option<i64>>(8)?,
                "feedback": r.get::<_, Option<String>>(9)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    assignment["assignmentId"] = json!(assignment_id);
    assignment["submissions"] = json!(submissions);
    Ok(assignment)
}

fn handle_list_mine(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;

    let mut stmt = conn.prepare(
        "SELECT sa.id, a.id, a.title, a.description, a.due_date, a.max_points, c.name,
                sa.status, sa.submitted_at, sa.grade, sa.feedback
         FROM student_assignments sa
         JOIN assignments a ON a.id = sa.assignment_id
         JOIN courses c ON c.id = a.course_id
         WHERE sa.student_id = ?
         ORDER BY a.due_date, a.title",
    )?;
    let assignments = stmt
        .query_map([student_id.as_str()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "assignmentId": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "description": r.get::<_, String>(3)?,
                "dueDate": r.get::<_, String>(4)?,
                "maxPoints": r.get::<_, i64>(5)?,
                "courseName": r.get::<_, String>(6)?,
                "status": r.get::<_, String>(7)?,
                "submittedAt": r.get::<_, Option<String>>(8)?,
                "grade": r.get::<_, Option<i64>>(9)?,
                "feedback": r.get::<_, Option<String>>(10)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let count_status = |status: &str| {
        assignments
            .iter()
            .filter(|a| a["status"].as_str() == Some(status))
            .count()
    };
    let now = now_iso();
    let overdue = assignments
        .iter()
        .filter(|a| {
            let open = matches!(a["status"].as_str(), Some("not_started") | Some("in_progress"));
            open && a["dueDate"].as_str().map(|d| d < now.as_str()).unwrap_or(false)
        })
        .count();

    Ok(json!({
        "assignments": assignments,
        "notStartedCount": count_status("not_started"),
        "inProgressCount": count_status("in_progress"),
        "submittedCount": count_status("submitted"),
        "gradedCount": count_status("graded"),
        "overdueCount": overdue,
    }))
}

/// A submission is accepted from not_started or in_progress. Submitted and
/// graded work is locked; there is no re-submission.
fn handle_submit(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    let submission_text = get_trimmed_str(&req.params, "submissionText")?;

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, status FROM student_assignments
             WHERE student_id = ? AND assignment_id = ?",
            [student_id.as_str(), assignment_id.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((row_id, status)) = row else {
        return Err(HandlerErr::not_found("assignment not found"));
    };
    match status.as_str() {
        "not_started" | "in_progress" => {}
        "submitted" => return Err(HandlerErr::validation("assignment already submitted")),
        _ => return Err(HandlerErr::validation("assignment already graded")),
    }

    let now = now_iso();
    conn.execute(
        "UPDATE student_assignments
         SET status = 'submitted', submission_text = ?, submitted_at = ?, updated_at = ?
         WHERE id = ?",
        [
            submission_text.as_str(),
            now.as_str(),
            now.as_str(),
            row_id.as_str(),
        ],
    )?;
    Ok(json!({ "submitted": true, "studentAssignmentId": row_id }))
}

/// Grading requires a submitted row; grading twice or grading unsubmitted
/// work is rejected.
fn handle_grade(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let row_id = get_required_str(&req.params, "studentAssignmentId")?;
    let grade = get_opt_i64(&req.params, "grade")
        .ok_or_else(|| HandlerErr::new("bad_params", "missing or invalid param: grade"))?;
    let feedback = get_opt_str(&req.params, "feedback").unwrap_or_default();

    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT sa.status, a.max_points
             FROM student_assignments sa
             JOIN assignments a ON a.id = sa.assignment_id
             WHERE sa.id = ?",
            [row_id.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((status, max_points)) = row else {
        return Err(HandlerErr::not_found("submission not found"));
    };
    if status != "submitted" {
        return Err(HandlerErr::validation("only submitted work can be graded"));
    }
    if !(0..=max_points).contains(&grade) {
        return Err(HandlerErr::validation(format!(
            "grade must be in 0..={}",
            max_points
        )));
    }

    conn.execute(
        "UPDATE student_assignments
         SET status = 'graded', grade = ?, feedback = ?, updated_at = ?
         WHERE id = ?",
        (grade, feedback.as_str(), now_iso(), row_id.as_str()),
    )?;
    Ok(json!({ "graded": true, "grade": grade }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "assignments.list" => handle_list(state, req),
        "assignments.create" => handle_create(state, req),
        "assignments.update" => handle_update(state, req),
        "assignments.delete" => handle_delete(state, req),
        "assignments.submissions" => handle_submissions(state, req),
        "assignments.listMine" => handle_list_mine(state, req),
        "assignments.submit" => handle_submit(state, req),
        "assignments.grade" => handle_grade(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
