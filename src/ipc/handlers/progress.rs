use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_i64, get_opt_str, get_required_i64, get_required_str, open_conn, require_admin,
    require_student, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};
use crate::progress;

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM student_profiles WHERE id = ?",
            [student_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

/// Admins may recalculate any student; a student only themselves.
fn resolve_target_student(
    conn: &Connection,
    req: &Request,
) -> Result<String, HandlerErr> {
    match req.caller.role {
        Role::Admin => {
            let student_id = get_required_str(&req.params, "studentId")?;
            if !student_exists(conn, &student_id)? {
                return Err(HandlerErr::not_found("student not found"));
            }
            Ok(student_id)
        }
        _ => require_student(conn, &req.caller),
    }
}

fn progress_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "courseId": row.get::<_, Option<String>>(1)?,
        "percentage": row.get::<_, i64>(2)?,
        "completedLessons": row.get::<_, i64>(3)?,
        "totalLessons": row.get::<_, i64>(4)?,
        "lastActivity": row.get::<_, String>(5)?,
    }))
}

fn rows_for_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, course_id, percentage, completed_lessons, total_lessons, last_activity
         FROM progress WHERE student_id = ?
         ORDER BY course_id IS NOT NULL, last_activity DESC",
    )?;
    let rows = stmt
        .query_map([student_id], progress_row_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_recalculate(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = resolve_target_student(conn, req)?;
    let course_id = get_opt_str(&req.params, "courseId");

    let percentage = progress::recalculate(conn, &student_id, course_id.as_deref())?;
    if course_id.is_some() {
        // A fresh course percentage shifts the overall average too.
        progress::recalculate(conn, &student_id, None)?;
    }
    Ok(json!({ "studentId": student_id, "courseId": course_id, "percentage": percentage }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = resolve_target_student(conn, req)?;
    let course_id = get_opt_str(&req.params, "courseId");

    let row = match course_id.as_deref() {
        Some(cid) => conn
            .query_row(
                "SELECT id, course_id, percentage, completed_lessons, total_lessons, last_activity
                 FROM progress WHERE student_id = ? AND course_id = ?",
                [student_id.as_str(), cid],
                progress_row_json,
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT id, course_id, percentage, completed_lessons, total_lessons, last_activity
                 FROM progress WHERE student_id = ? AND course_id IS NULL",
                [student_id.as_str()],
                progress_row_json,
            )
            .optional()?,
    };
    Ok(json!({ "studentId": student_id, "progress": row }))
}

fn handle_rows(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "studentId": student_id, "rows": rows_for_student(conn, &student_id)? }))
}

/// Admin progress screen: every student with their overall row and course
/// rows (created lazily here, as the page always did), filterable by course
/// and by overall band.
fn handle_overview(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_filter = get_opt_str(&req.params, "courseId");
    let band_filter = get_opt_str(&req.params, "band");

    let mut stmt = conn.prepare(
        "SELECT sp.id, u.username, u.first_name, u.last_name
         FROM student_profiles sp
         JOIN users u ON u.id = sp.user_id
         ORDER BY u.username",
    )?;
    let students = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut progress_data = Vec::new();
    for (student_id, username, first_name, last_name) in students {
        progress::ensure_progress_row(conn, &student_id, None)?;
        let mut enroll_stmt = conn.prepare(
            "SELECT course_id FROM enrollments WHERE student_id = ? ORDER BY course_id",
        )?;
        let enrolled = enroll_stmt
            .query_map([student_id.as_str()], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for cid in &enrolled {
            progress::ensure_progress_row(conn, &student_id, Some(cid))?;
        }

        let overall = conn.query_row(
            "SELECT id, course_id, percentage, completed_lessons, total_lessons, last_activity
             FROM progress WHERE student_id = ? AND course_id IS NULL",
            [student_id.as_str()],
            progress_row_json,
        )?;

        let overall_pct = overall["percentage"].as_i64().unwrap_or(0);
        if let Some(band) = band_filter.as_deref() {
            let keep = match band {
                "high" => overall_pct >= 80,
                "medium" => (50..80).contains(&overall_pct),
                "low" => overall_pct < 50,
                _ => return Err(HandlerErr::new("bad_params", "band must be high, medium or low")),
            };
            if !keep {
                continue;
            }
        }

        let mut course_rows = Vec::new();
        {
            let mut row_stmt = conn.prepare(
                "SELECT p.id, p.course_id, p.percentage, p.completed_lessons, p.total_lessons, p.last_activity, c.name
                 FROM progress p
                 JOIN courses c ON c.id = p.course_id
                 WHERE p.student_id = ? AND p.course_id IS NOT NULL
                 ORDER BY c.name",
            )?;
            let rows = row_stmt.query_map([student_id.as_str()], |r| {
                let mut v = progress_row_json(r)?;
                v["courseName"] = json!(r.get::<_, String>(6)?);
                Ok(v)
            })?;
            for row in rows {
                let row = row?;
                if let Some(cf) = course_filter.as_deref() {
                    if row["courseId"].as_str() != Some(cf) {
                        continue;
                    }
                }
                course_rows.push(row);
            }
        }

        progress_data.push(json!({
            "studentId": student_id,
            "username": username,
            "firstName": first_name,
            "lastName": last_name,
            "overallProgress": overall,
            "courseProgress": course_rows,
        }));
    }

    Ok(json!({ "progressData": progress_data }))
}

fn handle_set(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let course_id = get_opt_str(&req.params, "courseId");
    let percentage = get_required_i64(&req.params, "percentage")?;
    if !(0..=100).contains(&percentage) {
        return Err(HandlerErr::validation("percentage must be in 0..=100"));
    }

    let row_id = progress::ensure_progress_row(conn, &student_id, course_id.as_deref())?;
    conn.execute(
        "UPDATE progress SET percentage = ?, last_activity = ? WHERE id = ?",
        (percentage, now_iso(), row_id.as_str()),
    )?;
    if let Some(completed) = get_opt_i64(&req.params, "completedLessons") {
        conn.execute(
            "UPDATE progress SET completed_lessons = ? WHERE id = ?",
            (completed, row_id.as_str()),
        )?;
    }
    if let Some(total) = get_opt_i64(&req.params, "totalLessons") {
        conn.execute(
            "UPDATE progress SET total_lessons = ? WHERE id = ?",
            (total, row_id.as_str()),
        )?;
    }
    Ok(json!({ "progressId": row_id, "percentage": percentage }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let progress_id = get_required_str(&req.params, "progressId")?;
    let affected = conn.execute("DELETE FROM progress WHERE id = ?", [progress_id.as_str()])?;
    if affected == 0 {
        return Err(HandlerErr::not_found("progress record not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn parse_day(ts: &str) -> Option<NaiveDate> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.date_naive())
}

/// Student progress page: overall + course rows, stats, a merged
/// recent-activity feed and the consecutive-day learning streak.
fn handle_mine(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;

    progress::ensure_progress_row(conn, &student_id, None)?;
    let overall = conn.query_row(
        "SELECT id, course_id, percentage, completed_lessons, total_lessons, last_activity
         FROM progress WHERE student_id = ? AND course_id IS NULL",
        [student_id.as_str()],
        progress_row_json,
    )?;

    let mut course_rows = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT p.id, p.course_id, p.percentage, p.completed_lessons, p.total_lessons, p.last_activity, c.name
             FROM progress p
             JOIN courses c ON c.id = p.course_id
             WHERE p.student_id = ? AND p.course_id IS NOT NULL
             ORDER BY c.name",
        )?;
        let rows = stmt.query_map([student_id.as_str()], |r| {
            let mut v = progress_row_json(r)?;
            v["courseName"] = json!(r.get::<_, String>(6)?);
            Ok(v)
        })?;
        for row in rows {
            course_rows.push(row?);
        }
    }

    let total_courses: i64 = conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE student_id = ?",
        [student_id.as_str()],
        |r| r.get(0),
    )?;
    let completed_courses = course_rows
        .iter()
        .filter(|r| r["percentage"].as_i64() == Some(100))
        .count();
    let average_progress = if course_rows.is_empty() {
        0.0
    } else {
        let sum: i64 = course_rows
            .iter()
            .filter_map(|r| r["percentage"].as_i64())
            .sum();
        (sum as f64 / course_rows.len() as f64 * 10.0).round() / 10.0
    };

    // (timestamp, title, description) triples from the three activity
    // sources, merged newest-first.
    let mut activities: Vec<(String, String, String)> = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT lc.completed_at, c.name, l.title
             FROM lesson_completions lc
             JOIN lessons l ON l.id = lc.lesson_id
             JOIN courses c ON c.id = l.course_id
             WHERE lc.student_id = ? AND lc.completed = 1 AND lc.completed_at IS NOT NULL
             ORDER BY lc.completed_at DESC LIMIT 5",
        )?;
        let rows = stmt.query_map([student_id.as_str()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (ts, course, lesson) = row?;
            activities.push((
                ts,
                format!("Completed {}", course),
                format!("Finished \"{}\" lesson", lesson),
            ));
        }
    }
    {
        let mut stmt = conn.prepare(
            "SELECT qa.attempted_at, qa.score, qa.passed, c.name, q.title
             FROM quiz_attempts qa
             JOIN quizzes q ON q.id = qa.quiz_id
             JOIN courses c ON c.id = q.course_id
             WHERE qa.student_id = ?
             ORDER BY qa.attempted_at DESC LIMIT 3",
        )?;
        let rows = stmt.query_map([student_id.as_str()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)? != 0,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        for row in rows {
            let (ts, score, passed, course, quiz) = row?;
            let status = if passed { "Passed" } else { "Attempted" };
            activities.push((
                ts,
                format!("{} {} Quiz", status, course),
                format!("Scored {}% on \"{}\"", score, quiz),
            ));
        }
    }
    {
        let mut stmt = conn.prepare(
            "SELECT sa.submitted_at, c.name, a.title
             FROM student_assignments sa
             JOIN assignments a ON a.id = sa.assignment_id
             JOIN courses c ON c.id = a.course_id
             WHERE sa.student_id = ? AND sa.submitted_at IS NOT NULL
             ORDER BY sa.submitted_at DESC LIMIT 3",
        )?;
        let rows = stmt.query_map([student_id.as_str()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (ts, course, title) = row?;
            activities.push((
                ts,
                format!("Submitted {} Assignment", course),
                format!("Submitted \"{}\"", title),
            ));
        }
    }
    activities.sort_by(|a, b| b.0.cmp(&a.0));
    activities.truncate(5);
    let recent_activities: Vec<serde_json::Value> = activities
        .iter()
        .map(|(ts, title, description)| {
            json!({ "timestamp": ts, "title": title, "description": description })
        })
        .collect();

    // Learning streak: consecutive days ending today with any activity,
    // capped at the 7-day window the page shows.
    let mut active_days: std::collections::HashSet<NaiveDate> = std::collections::HashSet::new();
    for sql in [
        "SELECT completed_at FROM lesson_completions WHERE student_id = ? AND completed_at IS NOT NULL",
        "SELECT attempted_at FROM quiz_attempts WHERE student_id = ?",
        "SELECT submitted_at FROM student_assignments WHERE student_id = ? AND submitted_at IS NOT NULL",
    ] {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([student_id.as_str()], |r| r.get::<_, String>(0))?;
        for ts in rows {
            if let Some(day) = parse_day(&ts?) {
                active_days.insert(day);
            }
        }
    }
    let today = Utc::now().date_naive();
    let mut streak = 0;
    for i in 0..7 {
        let day = today - Duration::days(i);
        if active_days.contains(&day) {
            streak += 1;
        } else {
            break;
        }
    }

    Ok(json!({
        "studentId": student_id,
        "overallProgress": overall,
        "courseProgress": course_rows,
        "totalCourses": total_courses,
        "completedCourses": completed_courses,
        "averageProgress": average_progress,
        "recentActivities": recent_activities,
        "learningStreak": streak,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "progress.recalculate" => handle_recalculate(state, req),
        "progress.get" => handle_get(state, req),
        "progress.rows" => handle_rows(state, req),
        "progress.overview" => handle_overview(state, req),
        "progress.set" => handle_set(state, req),
        "progress.delete" => handle_delete(state, req),
        "progress.mine" => handle_mine(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
