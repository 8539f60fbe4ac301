use rusqlite::{Connection, OptionalExtension};

use crate::ipc::error::err;
use crate::ipc::types::{AppState, Caller, Role};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_failed", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn db(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::db(e)
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        HandlerErr::new("internal_error", e.to_string())
    }
}

pub fn open_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_trimmed_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let v = get_required_str(params, key)?;
    let v = v.trim().to_string();
    if v.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must not be empty", key),
        ));
    }
    Ok(v)
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn require_admin(caller: &Caller) -> Result<String, HandlerErr> {
    if caller.role != Role::Admin {
        return Err(HandlerErr::new("forbidden", "admin access required"));
    }
    caller
        .user_id
        .clone()
        .ok_or_else(|| HandlerErr::new("forbidden", "admin access required"))
}

/// Resolve the calling student's profile id. A user without a profile is an
/// account whose request was never approved.
pub fn require_student(conn: &Connection, caller: &Caller) -> Result<String, HandlerErr> {
    if caller.role != Role::Student {
        return Err(HandlerErr::new("forbidden", "student access required"));
    }
    let user_id = caller
        .user_id
        .as_deref()
        .ok_or_else(|| HandlerErr::new("forbidden", "student access required"))?;
    conn.query_row(
        "SELECT id FROM student_profiles WHERE user_id = ?",
        [user_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("student profile not found"))
}

pub fn course_exists(conn: &Connection, course_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

pub fn is_enrolled(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE student_id = ? AND course_id = ?",
            [student_id, course_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn require_enrolled(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<(), HandlerErr> {
    if !is_enrolled(conn, student_id, course_id)? {
        return Err(HandlerErr::new(
            "forbidden",
            "you are not enrolled in this course",
        ));
    }
    Ok(())
}
