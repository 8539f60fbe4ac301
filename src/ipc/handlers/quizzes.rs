use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_exists, get_opt_i64, get_opt_str, get_required_i64, get_required_str, get_trimmed_str,
    open_conn, require_admin, require_enrolled, require_student, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::progress;

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let course_filter = get_opt_str(&req.params, "courseId");
    let mut stmt = conn.prepare(
        "SELECT q.id, q.course_id, c.name, q.title, q.total_questions, q.passing_score, q.active
         FROM quizzes q
         JOIN courses c ON c.id = q.course_id
         WHERE (?1 IS NULL OR q.course_id = ?1)
         ORDER BY c.name, q.title",
    )?;
    let quizzes = stmt
        .query_map([&course_filter], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "courseName": r.get::<_, String>(2)?,
                "title": r.get::<_, String>(3)?,
                "totalQuestions": r.get::<_, i64>(4)?,
                "passingScore": r.get::<_, i64>(5)?,
                "active": r.get::<_, i64>(6)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "quizzes": quizzes }))
}

fn handle_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let title = get_trimmed_str(&req.params, "title")?;
    let total_questions = get_opt_i64(&req.params, "totalQuestions").unwrap_or(5);
    let passing_score = get_opt_i64(&req.params, "passingScore").unwrap_or(60);
    if !(0..=100).contains(&passing_score) {
        return Err(HandlerErr::validation("passingScore must be in 0..=100"));
    }

    let quiz_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO quizzes(id, course_id, title, total_questions, passing_score, active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &quiz_id,
            &course_id,
            &title,
            total_questions,
            passing_score,
            now_iso(),
        ),
    )?;
    Ok(json!({ "quizId": quiz_id, "title": title }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM quizzes WHERE id = ?", [quiz_id.as_str()], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("quiz not found"));
    }
    if let Some(title) = get_opt_str(&req.params, "title") {
        conn.execute(
            "UPDATE quizzes SET title = ? WHERE id = ?",
            [title.as_str(), quiz_id.as_str()],
        )?;
    }
    if let Some(total_questions) = get_opt_i64(&req.params, "totalQuestions") {
        conn.execute(
            "UPDATE quizzes SET total_questions = ? WHERE id = ?",
            (total_questions, quiz_id.as_str()),
        )?;
    }
    if let Some(passing_score) = get_opt_i64(&req.params, "passingScore") {
        if !(0..=100).contains(&passing_score) {
            return Err(HandlerErr::validation("passingScore must be in 0..=100"));
        }
        conn.execute(
            "UPDATE quizzes SET passing_score = ? WHERE id = ?",
            (passing_score, quiz_id.as_str()),
        )?;
    }
    if let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE quizzes SET active = ? WHERE id = ?",
            (active as i64, quiz_id.as_str()),
        )?;
    }
    Ok(json!({ "updated": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM quizzes WHERE id = ?", [quiz_id.as_str()], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("quiz not found"));
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM quiz_attempts WHERE quiz_id = ?",
        [quiz_id.as_str()],
    )?;
    tx.execute("DELETE FROM quizzes WHERE id = ?", [quiz_id.as_str()])?;
    tx.commit()?;
    Ok(json!({ "deleted": true }))
}

/// Records one attempt. Every attempt counts toward the course average, so
/// this always appends a row and re-runs the aggregator.
fn handle_record_attempt(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let score = get_required_i64(&req.params, "score")?;
    if !(0..=100).contains(&score) {
        return Err(HandlerErr::validation("score must be in 0..=100"));
    }

    let quiz: Option<(String, i64, i64)> = conn
        .query_row(
            "SELECT course_id, total_questions, passing_score FROM quizzes WHERE id = ? AND active = 1",
            [quiz_id.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((course_id, total_questions, passing_score)) = quiz else {
        return Err(HandlerErr::not_found("quiz not found"));
    };
    require_enrolled(conn, &student_id, &course_id)?;

    let passed = score >= passing_score;
    let attempt_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO quiz_attempts(id, student_id, quiz_id, score, total_questions, passed, attempted_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &attempt_id,
            &student_id,
            &quiz_id,
            score,
            total_questions,
            passed as i64,
            now_iso(),
        ),
    )?;

    progress::recalculate_course_and_overall(conn, &student_id, &course_id)?;

    Ok(json!({
        "attemptId": attempt_id,
        "score": score,
        "passed": passed,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "quizzes.list" => handle_list(state, req),
        "quizzes.create" => handle_create(state, req),
        "quizzes.update" => handle_update(state, req),
        "quizzes.delete" => handle_delete(state, req),
        "quizzes.recordAttempt" => handle_record_attempt(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
