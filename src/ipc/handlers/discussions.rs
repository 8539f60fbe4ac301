use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_exists, get_opt_str, get_required_str, get_trimmed_str, open_conn, require_admin,
    require_enrolled, require_student, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};

const POST_TYPES: &[&str] = &["question", "discussion", "announcement", "resource"];

fn handle_create_room(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let name = get_trimmed_str(&req.params, "name")?;
    let description = get_opt_str(&req.params, "description").unwrap_or_default();

    let room_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO discussion_rooms(id, course_id, title, description, active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&room_id, &course_id, &name, &description, now_iso()),
    )?;
    Ok(json!({ "roomId": room_id, "name": name }))
}

/// Admins see every room; students see active rooms of the courses they are
/// enrolled in.
fn handle_rooms(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let row_json = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "courseId": r.get::<_, String>(1)?,
            "courseName": r.get::<_, String>(2)?,
            "name": r.get::<_, String>(3)?,
            "description": r.get::<_, String>(4)?,
            "active": r.get::<_, i64>(5)? != 0,
            "postCount": r.get::<_, i64>(6)?,
        }))
    };

    let rooms = match req.caller.role {
        Role::Admin => {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.course_id, c.name, r.title, r.description, r.active,
                        (SELECT COUNT(*) FROM discussion_posts p WHERE p.room_id = r.id)
                 FROM discussion_rooms r
                 JOIN courses c ON c.id = r.course_id
                 ORDER BY c.name, r.title",
            )?;
            let rows = stmt
                .query_map([], row_json)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        _ => {
            let student_id = require_student(conn, &req.caller)?;
            let mut stmt = conn.prepare(
                "SELECT r.id, r.course_id, c.name, r.title, r.description, r.active,
                        (SELECT COUNT(*) FROM discussion_posts p WHERE p.room_id = r.id)
                 FROM discussion_rooms r
                 JOIN courses c ON c.id = r.course_id
                 JOIN enrollments e ON e.course_id = r.course_id
                 WHERE r.active = 1 AND e.student_id = ?
                 ORDER BY c.name, r.title",
            )?;
            let rows = stmt
                .query_map([student_id.as_str()], row_json)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(json!({ "rooms": rooms }))
}

fn load_room(
    conn: &rusqlite::Connection,
    room_id: &str,
) -> Result<(String, String, bool), HandlerErr> {
    conn.query_row(
        "SELECT course_id, title, active FROM discussion_rooms WHERE id = ?",
        [room_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get::<_, i64>(2)? != 0)),
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("discussion room not found"))
}

fn handle_create_post(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let student_id = require_student(conn, &req.caller)?;
    let room_id = get_required_str(&req.params, "roomId")?;
    let (course_id, _, active) = load_room(conn, &room_id)?;
    if !active {
        return Err(HandlerErr::validation("discussion room is closed"));
    }
    require_enrolled(conn, &student_id, &course_id)?;

    let title = get_trimmed_str(&req.params, "title")?;
    let content = get_trimmed_str(&req.params, "content")?;
    let post_type = get_opt_str(&req.params, "postType").unwrap_or_else(|| "discussion".into());
    if !POST_TYPES.contains(&post_type.as_str()) {
        return Err(HandlerErr::validation(
            "postType must be question, discussion, announcement or resource",
        ));
    }

    let post_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO discussion_posts(id, room_id, author_id, title, content, post_type, pinned, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &post_id,
            &room_id,
            &student_id,
            &title,
            &content,
            &post_type,
            now_iso(),
        ),
    )?;
    Ok(json!({ "postId": post_id, "title": title }))
}

/// Pinned posts first, then newest first. Replies ride along in thread
/// order.
fn handle_posts(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let room_id = get_required_str(&req.params, "roomId")?;
    let (course_id, room_name, _) = load_room(conn, &room_id)?;
    if req.caller.role != Role::Admin {
        let student_id = require_student(conn, &req.caller)?;
        require_enrolled(conn, &student_id, &course_id)?;
    }

    let mut stmt = conn.prepare(
        "SELECT p.id, p.title, p.content, p.post_type, p.pinned, p.created_at,
                u.first_name, u.last_name
         FROM discussion_posts p
         JOIN student_profiles sp ON sp.id = p.author_id
         JOIN users u ON u.id = sp.user_id
         WHERE p.room_id = ?
         ORDER BY p.pinned DESC, p.created_at DESC",
    )?;
    let mut posts = stmt
        .query_map([room_id.as_str()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "content": r.get::<_, String>(2)?,
                "postType": r.get::<_, String>(3)?,
                "pinned": r.get::<_, i64>(4)? != 0,
                "createdAt": r.get::<_, String>(5)?,
                "authorName": format!("{} {}", r.get::<_, String>(6)?, r.get::<_, String>(7)?),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut reply_stmt = conn.prepare(
        "SELECT r.content, r.instructor_reply, r.created_at, u.first_name, u.last_name
         FROM discussion_replies r
         JOIN users u ON u.id = r.author_id
         WHERE r.post_id = ?
         ORDER BY r.created_at",
    )?;
    for post in &mut posts {
        let post_id = post["id"].as_str().unwrap_or_default().to_string();
        let replies = reply_stmt
            .query_map([post_id.as_str()], |r| {
                Ok(json!({
                    "content": r.get::<_, String>(0)?,
                    "instructorReply": r.get::<_, i64>(1)? != 0,
                    "createdAt": r.get::<_, String>(2)?,
                    "authorName": format!("{} {}", r.get::<_, String>(3)?, r.get::<_, String>(4)?),
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        post["replies"] = json!(replies);
    }

    Ok(json!({ "roomId": room_id, "roomName": room_name, "posts": posts }))
}

/// Replies are stored against the user account, so an admin reply carries
/// the instructor flag the post view highlights.
fn handle_reply(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let post_id = get_required_str(&req.params, "postId")?;
    let content = get_trimmed_str(&req.params, "content")?;

    let room: Option<String> = conn
        .query_row(
            "SELECT room_id FROM discussion_posts WHERE id = ?",
            [post_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    let Some(room_id) = room else {
        return Err(HandlerErr::not_found("post not found"));
    };

    let (author_id, instructor_reply) = match req.caller.role {
        Role::Admin => (
            req.caller
                .user_id
                .clone()
                .ok_or_else(|| HandlerErr::new("forbidden", "login required"))?,
            true,
        ),
        _ => {
            let student_id = require_student(conn, &req.caller)?;
            let (course_id, _, _) = load_room(conn, &room_id)?;
            require_enrolled(conn, &student_id, &course_id)?;
            (
                req.caller
                    .user_id
                    .clone()
                    .ok_or_else(|| HandlerErr::new("forbidden", "login required"))?,
                false,
            )
        }
    };

    let reply_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO discussion_replies(id, post_id, author_id, content, instructor_reply, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &reply_id,
            &post_id,
            &author_id,
            &content,
            instructor_reply as i64,
            now_iso(),
        ),
    )?;
    Ok(json!({ "replyId": reply_id, "instructorReply": instructor_reply }))
}

fn handle_pin_post(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let post_id = get_required_str(&req.params, "postId")?;
    let pinned = req
        .params
        .get("pinned")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let affected = conn.execute(
        "UPDATE discussion_posts SET pinned = ? WHERE id = ?",
        (pinned as i64, post_id.as_str()),
    )?;
    if affected == 0 {
        return Err(HandlerErr::not_found("post not found"));
    }
    Ok(json!({ "pinned": pinned }))
}

fn handle_delete_post(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let post_id = get_required_str(&req.params, "postId")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM discussion_posts WHERE id = ?",
            [post_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("post not found"));
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM discussion_replies WHERE post_id = ?",
        [post_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM discussion_posts WHERE id = ?",
        [post_id.as_str()],
    )?;
    tx.commit()?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "discussions.createRoom" => handle_create_room(state, req),
        "discussions.rooms" => handle_rooms(state, req),
        "discussions.createPost" => handle_create_post(state, req),
        "discussions.posts" => handle_posts(state, req),
        "discussions.reply" => handle_reply(state, req),
        "discussions.pinPost" => handle_pin_post(state, req),
        "discussions.deletePost" => handle_delete_post(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
