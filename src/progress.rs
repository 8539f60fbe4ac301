//! Progress aggregation.
//!
//! A `progress` row caches a 0-100 percentage per (student, course). A row
//! with `course_id = NULL` is the student's overall percentage across all
//! enrolled courses; at most one such row may exist per student. The pure
//! math lives up top, the read-then-write plumbing below it.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::now_iso;

/// Weighting of lesson completion vs. quiz performance in a course
/// percentage.
pub const LESSON_WEIGHT: f64 = 0.7;
pub const QUIZ_WEIGHT: f64 = 0.3;

/// Course-scoped percentage: lessons 70%, quizzes 30%, clamped to 100 and
/// floored to an integer.
///
/// Returns `None` when the course has no active lessons. Callers must leave
/// the stored percentage untouched in that case; zero lessons is neither 0%
/// nor 100%.
pub fn course_percentage(completed: i64, total: i64, quiz_scores: &[i64]) -> Option<i64> {
    if total <= 0 {
        return None;
    }
    let lesson_ratio = (completed as f64) / (total as f64) * 100.0;
    let quiz_avg = if quiz_scores.is_empty() {
        0.0
    } else {
        quiz_scores.iter().sum::<i64>() as f64 / quiz_scores.len() as f64
    };
    let combined = lesson_ratio * LESSON_WEIGHT + quiz_avg * QUIZ_WEIGHT;
    Some(combined.min(100.0).floor() as i64)
}

/// Overall percentage: floored average of the course-scoped percentages.
/// `None` when no course-scoped rows exist yet (leave prior value alone).
pub fn overall_percentage(course_percentages: &[i64]) -> Option<i64> {
    if course_percentages.is_empty() {
        return None;
    }
    let avg = course_percentages.iter().sum::<i64>() as f64 / course_percentages.len() as f64;
    Some(avg.min(100.0).floor() as i64)
}

/// Idempotent get-or-create for a progress row. This is the only place that
/// creates progress rows, and the only place that enforces the
/// single-overall-row invariant: before inserting an overall row, every
/// other overall row for the student is removed.
pub fn ensure_progress_row(
    conn: &Connection,
    student_id: &str,
    course_id: Option<&str>,
) -> anyhow::Result<String> {
    let existing: Option<String> = match course_id {
        Some(cid) => conn
            .query_row(
                "SELECT id FROM progress WHERE student_id = ? AND course_id = ?",
                [student_id, cid],
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT id FROM progress
                 WHERE student_id = ? AND course_id IS NULL
                 ORDER BY last_activity DESC",
                [student_id],
                |r| r.get(0),
            )
            .optional()?,
    };
    if let Some(id) = existing {
        if course_id.is_none() {
            // Supersede any duplicate overall rows left by older writes.
            conn.execute(
                "DELETE FROM progress
                 WHERE student_id = ? AND course_id IS NULL AND id <> ?",
                [student_id, id.as_str()],
            )?;
        }
        return Ok(id);
    }

    if course_id.is_none() {
        conn.execute(
            "DELETE FROM progress WHERE student_id = ? AND course_id IS NULL",
            [student_id],
        )?;
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO progress(id, student_id, course_id, percentage, completed_lessons, total_lessons, last_activity)
         VALUES(?, ?, ?, 0, 0, 0, ?)",
        (&id, student_id, course_id, now_iso()),
    )?;
    Ok(id)
}

/// Recompute and persist one progress row from the underlying facts.
/// Returns the stored percentage.
pub fn recalculate(
    conn: &Connection,
    student_id: &str,
    course_id: Option<&str>,
) -> anyhow::Result<i64> {
    let row_id = ensure_progress_row(conn, student_id, course_id)?;

    match course_id {
        Some(cid) => {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM lessons WHERE course_id = ? AND active = 1",
                [cid],
                |r| r.get(0),
            )?;
            let completed: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT lc.lesson_id)
                 FROM lesson_completions lc
                 JOIN lessons l ON l.id = lc.lesson_id
                 WHERE lc.student_id = ? AND lc.completed = 1 AND l.course_id = ?",
                [student_id, cid],
                |r| r.get(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT qa.score
                 FROM quiz_attempts qa
                 JOIN quizzes q ON q.id = qa.quiz_id
                 WHERE qa.student_id = ? AND q.course_id = ?",
            )?;
            let quiz_scores = stmt
                .query_map([student_id, cid], |r| r.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            match course_percentage(completed, total, &quiz_scores) {
                Some(pct) => {
                    conn.execute(
                        "UPDATE progress
                         SET percentage = ?, completed_lessons = ?, total_lessons = ?, last_activity = ?
                         WHERE id = ?",
                        (pct, completed, total, now_iso(), &row_id),
                    )?;
                }
                None => {
                    // No active lessons yet: keep the prior percentage.
                    conn.execute(
                        "UPDATE progress SET completed_lessons = ?, total_lessons = 0, last_activity = ? WHERE id = ?",
                        (completed, now_iso(), &row_id),
                    )?;
                }
            }
        }
        None => {
            let enrolled: i64 = conn.query_row(
                "SELECT COUNT(*) FROM enrollments WHERE student_id = ?",
                [student_id],
                |r| r.get(0),
            )?;
            if enrolled > 0 {
                let mut stmt = conn.prepare(
                    "SELECT percentage FROM progress
                     WHERE student_id = ? AND course_id IS NOT NULL",
                )?;
                let course_pcts = stmt
                    .query_map([student_id], |r| r.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(pct) = overall_percentage(&course_pcts) {
                    conn.execute(
                        "UPDATE progress SET percentage = ?, last_activity = ? WHERE id = ?",
                        (pct, now_iso(), &row_id),
                    )?;
                } else {
                    conn.execute(
                        "UPDATE progress SET last_activity = ? WHERE id = ?",
                        (now_iso(), &row_id),
                    )?;
                }
            } else {
                conn.execute(
                    "UPDATE progress SET last_activity = ? WHERE id = ?",
                    (now_iso(), &row_id),
                )?;
            }
        }
    }

    let pct: i64 = conn.query_row("SELECT percentage FROM progress WHERE id = ?", [&row_id], |r| {
        r.get(0)
    })?;
    Ok(pct)
}

/// Recompute the course-scoped row for one course, then fold the result into
/// the overall row. The order matters: the overall average reads the
/// course-scoped percentages.
pub fn recalculate_course_and_overall(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> anyhow::Result<()> {
    recalculate(conn, student_id, Some(course_id))?;
    recalculate(conn, student_id, None)?;
    Ok(())
}
