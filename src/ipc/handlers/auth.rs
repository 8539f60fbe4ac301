use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_str, get_trimmed_str, open_conn, HandlerErr};
use crate::ipc::types::{AppState, Request, Role};

struct Account {
    id: String,
    password_hash: String,
    password_salt: String,
    is_staff: bool,
}

fn find_account(
    conn: &rusqlite::Connection,
    username: &str,
) -> Result<Option<Account>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, password_hash, password_salt, is_staff FROM users WHERE username = ?",
            [username],
            |r| {
                Ok(Account {
                    id: r.get(0)?,
                    password_hash: r.get(1)?,
                    password_salt: r.get(2)?,
                    is_staff: r.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()?)
}

fn handle_student_login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let username = get_required_str(&req.params, "username")?;
    let password = get_required_str(&req.params, "password")?;

    let account = find_account(conn, &username)?;
    let Some(account) = account else {
        // A pending request is not yet an account.
        let pending: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM student_requests WHERE username = ? AND status = 'pending'",
                [username.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if pending.is_some() {
            return Err(HandlerErr::new(
                "pending_approval",
                "your account is pending admin approval",
            ));
        }
        return Err(HandlerErr::new("invalid_credentials", "invalid student credentials"));
    };

    if !auth::verify_password(&account.password_salt, &account.password_hash, &password) {
        return Err(HandlerErr::new("invalid_credentials", "invalid student credentials"));
    }

    let profile: Option<String> = conn
        .query_row(
            "SELECT id FROM student_profiles WHERE user_id = ?",
            [account.id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    let Some(profile_id) = profile else {
        return Err(HandlerErr::new(
            "pending_approval",
            "your account is pending admin approval",
        ));
    };

    Ok(json!({
        "userId": account.id,
        "studentId": profile_id,
        "role": "student",
    }))
}

fn handle_admin_login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let username = get_required_str(&req.params, "username")?;
    let password = get_required_str(&req.params, "password")?;

    let account = find_account(conn, &username)?
        .ok_or_else(|| HandlerErr::new("invalid_credentials", "invalid admin credentials"))?;
    if !account.is_staff
        || !auth::verify_password(&account.password_salt, &account.password_hash, &password)
    {
        return Err(HandlerErr::new("invalid_credentials", "invalid admin credentials"));
    }

    Ok(json!({
        "userId": account.id,
        "role": "admin",
    }))
}

fn handle_create_admin(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;

    // Bootstrap: the first admin may be created unauthenticated; after that
    // only an admin can mint another.
    let staff_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM users WHERE is_staff = 1", [], |r| r.get(0))?;
    if staff_count > 0 && req.caller.role != Role::Admin {
        return Err(HandlerErr::new("forbidden", "admin access required"));
    }

    let username = get_trimmed_str(&req.params, "username")?;
    let email = get_trimmed_str(&req.params, "email")?;
    let password = get_required_str(&req.params, "password")?;

    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE username = ? OR email = ?",
            [username.as_str(), email.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(HandlerErr::validation("username or email already exists"));
    }

    let user_id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, &password);
    conn.execute(
        "INSERT INTO users(id, username, email, password_hash, password_salt, is_staff, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (&user_id, &username, &email, &hash, &salt, now_iso()),
    )?;

    Ok(json!({ "userId": user_id, "username": username }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.studentLogin" => handle_student_login(state, req),
        "auth.adminLogin" => handle_admin_login(state, req),
        "auth.createAdmin" => handle_create_admin(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
