use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_required_str, get_trimmed_str, open_conn, require_admin, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};

/// Sends to one user, or fans out to every student account when the target
/// is "all".
fn handle_send(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let target = get_required_str(&req.params, "userId")?;
    let title = get_trimmed_str(&req.params, "title")?;
    let message = get_trimmed_str(&req.params, "message")?;

    let recipients: Vec<String> = if target == "all" {
        let mut stmt = conn.prepare("SELECT id FROM users WHERE is_staff = 0")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    } else {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?", [target.as_str()], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("user not found"));
        }
        vec![target]
    };

    let tx = conn.unchecked_transaction()?;
    for user_id in &recipients {
        tx.execute(
            "INSERT INTO notifications(id, user_id, title, message, is_read, created_at)
             VALUES(?, ?, ?, ?, 0, ?)",
            (
                Uuid::new_v4().to_string(),
                user_id.as_str(),
                title.as_str(),
                message.as_str(),
                now_iso(),
            ),
        )?;
    }
    tx.commit()?;

    Ok(json!({ "sent": recipients.len() }))
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;

    // Admins see everything; everyone else sees only their own.
    let user_id: Option<String> = match req.caller.role {
        Role::Admin => None,
        _ => Some(
            req.caller
                .user_id
                .clone()
                .ok_or_else(|| HandlerErr::new("forbidden", "login required"))?,
        ),
    };

    let mut stmt = conn.prepare(
        "SELECT n.id, n.user_id, u.username, n.title, n.message, n.is_read, n.created_at
         FROM notifications n
         JOIN users u ON u.id = n.user_id
         WHERE (?1 IS NULL OR n.user_id = ?1)
         ORDER BY n.created_at DESC",
    )?;
    let notifications = stmt
        .query_map([&user_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "userId": r.get::<_, String>(1)?,
                "username": r.get::<_, String>(2)?,
                "title": r.get::<_, String>(3)?,
                "message": r.get::<_, String>(4)?,
                "read": r.get::<_, i64>(5)? != 0,
                "createdAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let unread = notifications
        .iter()
        .filter(|n| n["read"].as_bool() == Some(false))
        .count();

    Ok(json!({ "notifications": notifications, "unreadCount": unread }))
}

fn handle_mark_read(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let notification_id = get_required_str(&req.params, "notificationId")?;

    let owner: Option<String> = conn
        .query_row(
            "SELECT user_id FROM notifications WHERE id = ?",
            [notification_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    let Some(owner) = owner else {
        return Err(HandlerErr::not_found("notification not found"));
    };
    if req.caller.role != Role::Admin && req.caller.user_id.as_deref() != Some(owner.as_str()) {
        return Err(HandlerErr::new("forbidden", "not your notification"));
    }

    conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE id = ?",
        [notification_id.as_str()],
    )?;
    Ok(json!({ "read": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let notification_id = get_required_str(&req.params, "notificationId")?;
    let affected = conn.execute(
        "DELETE FROM notifications WHERE id = ?",
        [notification_id.as_str()],
    )?;
    if affected == 0 {
        return Err(HandlerErr::not_found("notification not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.send" => handle_send(state, req),
        "notifications.list" => handle_list(state, req),
        "notifications.markRead" => handle_mark_read(state, req),
        "notifications.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
