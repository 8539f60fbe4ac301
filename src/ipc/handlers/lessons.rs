use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_exists, get_opt_i64, get_opt_str, get_required_str, get_trimmed_str, open_conn,
    require_admin, require_enrolled, require_student, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::progress;

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_filter = get_opt_str(&req.params, "courseId");

    let sql = "SELECT l.id, l.course_id, c.name, l.title, l.description, l.duration,
                      l.sort_order, l.active, l.video_url
               FROM lessons l
               JOIN courses c ON c.id = l.course_id
               WHERE (?1 IS NULL OR l.course_id = ?1)
               ORDER BY c.name, l.sort_order";
    let mut stmt = conn.prepare(sql)?;
    let lessons = stmt
        .query_map([&course_filter], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "courseName": r.get::<_, String>(2)?,
                "title": r.get::<_, String>(3)?,
                "description": r.get::<_, String>(4)?,
                "duration": r.get::<_, String>(5)?,
                "sortOrder": r.get::<_, i64>(6)?,
                "active": r.get::<_, i64>(7)? != 0,
                "videoUrl": r.get::<_, Option<String>>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "lessons": lessons }))
}

fn handle_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let title = get_trimmed_str(&req.params, "title")?;
    let description = get_opt_str(&req.params, "description").unwrap_or_default();
    let content = get_opt_str(&req.params, "content").unwrap_or_default();
    let video_url = get_opt_str(&req.params, "videoUrl");
    let duration = get_opt_str(&req.params, "duration").unwrap_or_else(|| "30 minutes".to_string());
    let sort_order = get_opt_i64(&req.params, "sortOrder").unwrap_or(0);

    let lesson_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO lessons(id, course_id, title, description, content, video_url, duration, sort_order, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &lesson_id,
            &course_id,
            &title,
            &description,
            &content,
            &video_url,
            &duration,
            sort_order,
            now_iso(),
        ),
    )?;
    Ok(json!({ "lessonId": lesson_id, "title": title }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let lesson_id = get_required_str(&req.params, "lessonId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM lessons WHERE id = ?", [lesson_id.as_str()], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("lesson not found"));
    }

    if let Some(title) = get_opt_str(&req.params, "title") {
        conn.execute(
            "UPDATE lessons SET title = ? WHERE id = ?",
            [title.as_str(), lesson_id.as_str()],
        )?;
    }
    if let Some(description) = get_opt_str(&req.params, "description") {
        conn.execute(
            "UPDATE lessons SET description = ? WHERE id = ?",
            [description.as_str(), lesson_id.as_str()],
        )?;
    }
    if let Some(content) = get_opt_str(&req.params, "content") {
        conn.execute(
            "UPDATE lessons SET content = ? WHERE id = ?",
            [content.as_str(), lesson_id.as_str()],
        )?;
    }
    if let Some(duration) = get_opt_str(&req.params, "duration") {
        conn.execute(
            "UPDATE lessons SET duration = ? WHERE id = ?",
            [duration.as_str(), lesson_id.as_str()],
        )?;
    }
    if let Some(sort_order) = get_opt_i64(&req.params, "sortOrder") {
        conn.execute(
            "UPDATE lessons SET sort_order = ? WHERE id = ?",
            (sort_order, lesson_id.as_str()),
        )?;
    }
    if let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) {
        // Toggling active changes the course denominator for everyone;
        // cached percentages refresh lazily on the next aggregator run.
        conn.execute(
            "UPDATE lessons SET active = ? WHERE id = ?",
            (active as i64, lesson_id.as_str()),
        )?;
    }
    Ok(json!({ "updated": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let lesson_id = get_required_str(&req.params, "lessonId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM lessons WHERE id = ?", [lesson_id.as_str()], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("lesson not found"));
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM lesson_completions WHERE lesson_id = ?",
        [lesson_id.as_str()],
    )?;
    tx.execute("DELETE FROM lessons WHERE id = ?", [lesson_id.as_str()])?;
    tx.commit()?;

    Ok(json!({ "deleted": true }))
}

struct LessonRow {
    course_id: String,
    title: String,
    description: String,
    content: String,
    video_url: Option<String>,
    duration: String,
    sort_order: i64,
}

fn load_lesson(conn: &rusqlite::Connection, lesson_id: &str) -> Result<LessonRow, HandlerErr> {
    conn.query_row(
        "SELECT course_id, title, description, content, video_url, duration, sort_order
         FROM lessons WHERE id = ? AND active = 1",
        [lesson_id],
        |r| {
            Ok(LessonRow {
                course_id: r.get(0)?,
                title: r.get(1)?,
                description: r.get(2)?,
                content: r.get(3)?,
                video_url: r.get(4)?,
                duration: r.get(5)?,
                sort_order: r.get(6)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("lesson not found"))
}

/// Student lesson page: records the visit (get-or-create the completion row,
/// stamp last_accessed) and returns prev/next navigation.
fn handle_open(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;
    let lesson_id = get_required_str(&req.params, "lessonId")?;
    let lesson = load_lesson(conn, &lesson_id)?;
    require_enrolled(conn, &student_id, &lesson.course_id)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM lesson_completions WHERE student_id = ? AND lesson_id = ?",
            [student_id.as_str(), lesson_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE lesson_completions SET last_accessed = ? WHERE id = ?",
                [now_iso().as_str(), id.as_str()],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO lesson_completions(id, student_id, lesson_id, completed, last_accessed)
                 VALUES(?, ?, ?, 0, ?)",
                (
                    Uuid::new_v4().to_string(),
                    student_id.as_str(),
                    lesson_id.as_str(),
                    now_iso(),
                ),
            )?;
        }
    }

    let completed: bool = conn.query_row(
        "SELECT completed FROM lesson_completions WHERE student_id = ? AND lesson_id = ?",
        [student_id.as_str(), lesson_id.as_str()],
        |r| Ok(r.get::<_, i64>(0)? != 0),
    )?;

    let prev: Option<(String, String)> = conn
        .query_row(
            "SELECT id, title FROM lessons
             WHERE course_id = ? AND active = 1 AND sort_order < ?
             ORDER BY sort_order DESC LIMIT 1",
            (lesson.course_id.as_str(), lesson.sort_order),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let next: Option<(String, String)> = conn
        .query_row(
            "SELECT id, title FROM lessons
             WHERE course_id = ? AND active = 1 AND sort_order > ?
             ORDER BY sort_order ASC LIMIT 1",
            (lesson.course_id.as_str(), lesson.sort_order),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    Ok(json!({
        "id": lesson_id,
        "courseId": lesson.course_id,
        "title": lesson.title,
        "description": lesson.description,
        "content": lesson.content,
        "videoUrl": lesson.video_url,
        "duration": lesson.duration,
        "completed": completed,
        "prevLesson": prev.map(|(id, title)| json!({ "id": id, "title": title })),
        "nextLesson": next.map(|(id, title)| json!({ "id": id, "title": title })),
    }))
}

/// Idempotent: completing an already-completed lesson reports it without
/// touching the timestamp. First completion triggers the course and overall
/// aggregation.
fn handle_mark_complete(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;
    let lesson_id = get_required_str(&req.params, "lessonId")?;
    let lesson = load_lesson(conn, &lesson_id)?;
    require_enrolled(conn, &student_id, &lesson.course_id)?;

    let existing: Option<(String, bool)> = conn
        .query_row(
            "SELECT id, completed FROM lesson_completions WHERE student_id = ? AND lesson_id = ?",
            [student_id.as_str(), lesson_id.as_str()],
            |r| Ok((r.get(0)?, r.get::<_, i64>(1)? != 0)),
        )
        .optional()?;

    let already_completed = match existing {
        Some((_, true)) => true,
        Some((id, false)) => {
            conn.execute(
                "UPDATE lesson_completions SET completed = 1, completed_at = ?, last_accessed = ? WHERE id = ?",
                [now_iso().as_str(), now_iso().as_str(), id.as_str()],
            )?;
            false
        }
        None => {
            conn.execute(
                "INSERT INTO lesson_completions(id, student_id, lesson_id, completed, completed_at, last_accessed)
                 VALUES(?, ?, ?, 1, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    student_id.as_str(),
                    lesson_id.as_str(),
                    now_iso(),
                    now_iso(),
                ),
            )?;
            false
        }
    };

    progress::recalculate_course_and_overall(conn, &student_id, &lesson.course_id)?;

    Ok(json!({
        "lessonId": lesson_id,
        "title": lesson.title,
        "alreadyCompleted": already_completed,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "lessons.list" => handle_list(state, req),
        "lessons.create" => handle_create(state, req),
        "lessons.update" => handle_update(state, req),
        "lessons.delete" => handle_delete(state, req),
        "lessons.open" => handle_open(state, req),
        "lessons.markComplete" => handle_mark_complete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
