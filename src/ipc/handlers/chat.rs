use serde_json::json;

use crate::chat;
use crate::ipc::error::ok;
use crate::ipc::types::{AppState, Request};

/// The widget must never error out; a missing or empty message gets the
/// fallback reply like any other unmatched input.
pub fn try_handle(_state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "chat.message" {
        return None;
    }
    let message = req
        .params
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let response = if message.trim().is_empty() {
        chat::FALLBACK
    } else {
        chat::respond(message)
    };
    Some(ok(&req.id, json!({ "response": response })))
}
