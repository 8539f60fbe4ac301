use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_lmsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn lmsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn chat(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    params: serde_json::Value,
) -> String {
    let payload = json!({ "id": id, "method": "chat.message", "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "chat.message must never fail: {}",
        value
    );
    value["result"]["response"].as_str().expect("response").to_string()
}

// The widget needs no workspace and no login.
#[test]
fn responds_before_any_workspace_is_selected() {
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let reply = chat(&mut stdin, &mut reader, "1", json!({ "message": "hello" }));
    assert!(!reply.is_empty());
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn greeting_synonyms_share_one_reply() {
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let hi = chat(&mut stdin, &mut reader, "1", json!({ "message": "hi" }));
    let hello = chat(&mut stdin, &mut reader, "2", json!({ "message": "hello" }));
    let hey = chat(&mut stdin, &mut reader, "3", json!({ "message": "hey there" }));
    assert_eq!(hi, hello);
    assert_eq!(hi, hey);
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn matching_is_case_insensitive() {
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let lower = chat(&mut stdin, &mut reader, "1", json!({ "message": "tell me about python" }));
    let upper = chat(&mut stdin, &mut reader, "2", json!({ "message": "Tell me about PYTHON" }));
    assert_eq!(lower, upper);
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unmatched_and_missing_messages_get_the_same_fallback() {
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let gibberish = chat(&mut stdin, &mut reader, "1", json!({ "message": "xyzzy plugh" }));
    let missing = chat(&mut stdin, &mut reader, "2", json!({}));
    let blank = chat(&mut stdin, &mut reader, "3", json!({ "message": "   " }));
    let wrong_type = chat(&mut stdin, &mut reader, "4", json!({ "message": 42 }));
    assert_eq!(gibberish, missing);
    assert_eq!(gibberish, blank);
    assert_eq!(gibberish, wrong_type);
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn distinct_topics_get_distinct_replies() {
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let python = chat(&mut stdin, &mut reader, "1", json!({ "message": "python help" }));
    let sql = chat(&mut stdin, &mut reader, "2", json!({ "message": "database tips" }));
    let thanks = chat(&mut stdin, &mut reader, "3", json!({ "message": "thanks!" }));
    assert_ne!(python, sql);
    assert_ne!(python, thanks);
    drop(stdin);
    let _ = child.wait();
}
