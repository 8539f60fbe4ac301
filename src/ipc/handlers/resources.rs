use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::db::now_iso;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_str, get_required_str, get_trimmed_str, open_conn, require_admin, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

const RESOURCE_TYPES: &[&str] = &["pdf", "video", "youtube", "link"];

/// pdf and video resources point at an uploaded file; youtube and link
/// resources point at a URL. Each type requires exactly its own field.
fn validate_source(
    resource_type: &str,
    file_path: &Option<String>,
    url: &Option<String>,
) -> Result<(), HandlerErr> {
    match resource_type {
        "pdf" | "video" => {
            if file_path.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(HandlerErr::validation(format!(
                    "{} resources require filePath",
                    resource_type
                )));
            }
        }
        "youtube" | "link" => {
            if url.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(HandlerErr::validation(format!(
                    "{} resources require url",
                    resource_type
                )));
            }
        }
        _ => {
            return Err(HandlerErr::validation(
                "resourceType must be pdf, video, youtube or link",
            ))
        }
    }
    Ok(())
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = open_conn(state)?;
    let type_filter = get_opt_str(&req.params, "resourceType");
    let subject_filter = get_opt_str(&req.params, "subject");

    let mut stmt = conn.prepare(
        "SELECT id, title, description, resource_type, file_path, url, subject, grade_level, created_at
         FROM resources
         WHERE (?1 IS NULL OR resource_type = ?1)
           AND (?2 IS NULL OR subject = ?2)
         ORDER BY created_at DESC",
    )?;
    let resources = stmt
        .query_map([&type_filter, &subject_filter], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, String>(2)?,
                "resourceType": r.get::<_, String>(3)?,
                "filePath": r.get::<_, Option<String>>(4)?,
                "url": r.get::<_, Option<String>>(5)?,
                "subject": r.get::<_, String>(6)?,
                "gradeLevel": r.get::<_, Option<String>>(7)?,
                "createdAt": r.get::<_, String>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = serde_json::Map::new();
    for rt in RESOURCE_TYPES {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE resource_type = ?",
            [rt],
            |r| r.get(0),
        )?;
        counts.insert((*rt).to_string(), json!(n));
    }

    Ok(json!({ "resources": resources, "typeCounts": counts }))
}

fn handle_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let title = get_trimmed_str(&req.params, "title")?;
    let description = get_opt_str(&req.params, "description").unwrap_or_default();
    let resource_type = get_required_str(&req.params, "resourceType")?;
    let file_path = get_opt_str(&req.params, "filePath");
    let url = get_opt_str(&req.params, "url");
    let subject = get_trimmed_str(&req.params, "subject")?;
    let grade_level = get_opt_str(&req.params, "gradeLevel");
    validate_source(&resource_type, &file_path, &url)?;

    let resource_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO resources(id, title, description, resource_type, file_path, url, subject, grade_level, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &resource_id,
            &title,
            &description,
            &resource_type,
            &file_path,
            &url,
            &subject,
            &grade_level,
            now_iso(),
        ),
    )?;
    Ok(json!({ "resourceId": resource_id, "title": title }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let resource_id = get_required_str(&req.params, "resourceId")?;

    let row: Option<(String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT resource_type, file_path, url FROM resources WHERE id = ?",
            [resource_id.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((current_type, current_path, current_url)) = row else {
        return Err(HandlerErr::not_found("resource not found"));
    };

    let resource_type = get_opt_str(&req.params, "resourceType").unwrap_or(current_type);
    let file_path = get_opt_str(&req.params, "filePath").or(current_path);
    let url = get_opt_str(&req.params, "url").or(current_url);
    validate_source(&resource_type, &file_path, &url)?;

    conn.execute(
        "UPDATE resources SET resource_type = ?, file_path = ?, url = ? WHERE id = ?",
        (
            resource_type.as_str(),
            &file_path,
            &url,
            resource_id.as_str(),
        ),
    )?;
    if let Some(title) = get_opt_str(&req.params, "title") {
        conn.execute(
            "UPDATE resources SET title = ? WHERE id = ?",
            [title.as_str(), resource_id.as_str()],
        )?;
    }
    if let Some(description) = get_opt_str(&req.params, "description") {
        conn.execute(
            "UPDATE resources SET description = ? WHERE id = ?",
            [description.as_str(), resource_id.as_str()],
        )?;
    }
    if let Some(subject) = get_opt_str(&req.params, "subject") {
        conn.execute(
            "UPDATE resources SET subject = ? WHERE id = ?",
            [subject.as_str(), resource_id.as_str()],
        )?;
    }
    if let Some(grade_level) = get_opt_str(&req.params, "gradeLevel") {
        conn.execute(
            "UPDATE resources SET grade_level = ? WHERE id = ?",
            [grade_level.as_str(), resource_id.as_str()],
        )?;
    }
    Ok(json!({ "updated": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let conn = open_conn(state)?;
    let resource_id = get_required_str(&req.params, "resourceId")?;
    let affected = conn.execute("DELETE FROM resources WHERE id = ?", [resource_id.as_str()])?;
    if affected == 0 {
        return Err(HandlerErr::not_found("resource not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "resources.list" => handle_list(state, req),
        "resources.create" => handle_create(state, req),
        "resources.update" => handle_update(state, req),
        "resources.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
