use serde_json::json;
use std::path::PathBuf;

use crate::backup;
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_str, get_trimmed_str, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn resolve_workspace(state: &AppState, req: &Request) -> Result<PathBuf, HandlerErr> {
    get_opt_str(&req.params, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn handle_export(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let out_path = get_trimmed_str(&req.params, "outPath")?;
    let workspace_path = resolve_workspace(state, req)?;

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = backup::export_workspace_bundle(&workspace_path, &out).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": out_path }))
    })?;

    Ok(json!({
        "ok": true,
        "path": out.to_string_lossy(),
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
    }))
}

fn handle_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(&req.caller)?;
    let in_path = get_trimmed_str(&req.params, "inPath")?;
    let workspace_path = resolve_workspace(state, req)?;

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(
            HandlerErr::not_found("bundle file not found").with_details(json!({ "path": in_path }))
        );
    }

    // Drop the open handle before the database file is replaced.
    state.db = None;

    let import = backup::import_workspace_bundle(&src, &workspace_path).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string())
            .with_details(json!({ "path": src.to_string_lossy() }))
    })?;

    let conn = db::open_db(&workspace_path)
        .map_err(|e| HandlerErr::new("db_open_failed", e.to_string()))?;
    state.workspace = Some(workspace_path.clone());
    state.db = Some(conn);

    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => handle_export(state, req),
        "backup.importWorkspaceBundle" => handle_import(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
