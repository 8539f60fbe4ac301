use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_exists, get_opt_str, get_required_str, get_trimmed_str, open_conn, require_admin,
    require_enrolled, require_student, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::progress;

fn handle_list(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.description,
                (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id) AS student_count,
                (SELECT COUNT(*) FROM lessons l WHERE l.course_id = c.id AND l.active = 1) AS lesson_count
         FROM courses c
         ORDER BY c.name",
    )?;
    let courses = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "studentCount": r.get::<_, i64>(3)?,
                "lessonCount": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let total_students: i64 =
        conn.query_row("SELECT COUNT(*) FROM student_profiles", [], |r| r.get(0))?;
    Ok(json!({ "courses": courses, "totalStudents": total_students }))
}

fn handle_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let name = get_trimmed_str(&req.params, "name")?;
    let description = get_opt_str(&req.params, "description");

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, name, description) VALUES(?, ?, ?)",
        (&course_id, &name, &description),
    )?;
    Ok(json!({ "courseId": course_id, "name": name }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    if let Some(name) = get_opt_str(&req.params, "name") {
        conn.execute(
            "UPDATE courses SET name = ? WHERE id = ?",
            [name.as_str(), course_id.as_str()],
        )?;
    }
    if req.params.get("description").is_some() {
        let description = get_opt_str(&req.params, "description");
        conn.execute(
            "UPDATE courses SET description = ? WHERE id = ?",
            (&description, course_id.as_str()),
        )?;
    }
    Ok(json!({ "updated": true }))
}

/// Deleting a course removes its lessons, quizzes, assignments, discussion
/// rooms and every dependent fact, in dependency order inside one
/// transaction.
fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM discussion_replies
         WHERE post_id IN (
           SELECT p.id FROM discussion_posts p
           JOIN discussion_rooms r ON r.id = p.room_id
           WHERE r.course_id = ?
         )",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM discussion_posts
         WHERE room_id IN (SELECT id FROM discussion_rooms WHERE course_id = ?)",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM discussion_rooms WHERE course_id = ?",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM student_assignments
         WHERE assignment_id IN (SELECT id FROM assignments WHERE course_id = ?)",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM assignments WHERE course_id = ?",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM quiz_attempts
         WHERE quiz_id IN (SELECT id FROM quizzes WHERE course_id = ?)",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM quizzes WHERE course_id = ?",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM lesson_completions
         WHERE lesson_id IN (SELECT id FROM lessons WHERE course_id = ?)",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM lessons WHERE course_id = ?",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM progress WHERE course_id = ?",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM student_request_courses WHERE course_id = ?",
        [course_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM enrollments WHERE course_id = ?",
        [course_id.as_str()],
    )?;
    tx.execute("DELETE FROM courses WHERE id = ?", [course_id.as_str()])?;
    tx.commit()?;

    Ok(json!({ "deleted": true }))
}

/// Student course page: active lessons in order with completion flags, plus
/// a freshly aggregated course percentage.
fn handle_open(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;
    let course_id = get_required_str(&req.params, "courseId")?;

    let course = conn
        .query_row(
            "SELECT name, description FROM courses WHERE id = ?",
            [course_id.as_str()],
            |r| {
                Ok(json!({
                    "name": r.get::<_, String>(0)?,
                    "description": r.get::<_, Option<String>>(1)?,
                }))
            },
        )
        .optional()?;
    let Some(mut course) = course else {
        return Err(HandlerErr::not_found("course not found"));
    };
    require_enrolled(conn, &student_id, &course_id)?;

    progress::recalculate(conn, &student_id, Some(&course_id))?;

    let mut stmt = conn.prepare(
        "SELECT l.id, l.title, l.description, l.duration, l.sort_order,
                COALESCE((SELECT lc.completed FROM lesson_completions lc
                          WHERE lc.student_id = ? AND lc.lesson_id = l.id), 0)
         FROM lessons l
         WHERE l.course_id = ? AND l.active = 1
         ORDER BY l.sort_order",
    )?;
    let lessons = stmt
        .query_map([student_id.as_str(), course_id.as_str()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, String>(2)?,
                "duration": r.get::<_, String>(3)?,
                "sortOrder": r.get::<_, i64>(4)?,
                "completed": r.get::<_, i64>(5)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let prog = conn.query_row(
        "SELECT percentage, completed_lessons, total_lessons
         FROM progress WHERE student_id = ? AND course_id = ?",
        [student_id.as_str(), course_id.as_str()],
        |r| {
            Ok(json!({
                "percentage": r.get::<_, i64>(0)?,
                "completedLessons": r.get::<_, i64>(1)?,
                "totalLessons": r.get::<_, i64>(2)?,
            }))
        },
    )?;

    course["id"] = json!(course_id);
    course["lessons"] = json!(lessons);
    course["progress"] = prog;
    Ok(course)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.list" => handle_list(state, req),
        "courses.create" => handle_create(state, req),
        "courses.update" => handle_update(state, req),
        "courses.delete" => handle_delete(state, req),
        "courses.open" => handle_open(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
