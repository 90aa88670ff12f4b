//! Upgrades frames from older IPython kernels to the current protocol shape,
//! and adds the request fields those kernels still expect.
//!
//! | older | current |
//! |---|---|
//! | `pyout` / `pyerr` / `pyin` | `execute_result` / `error` / `execute_input` |
//! | `prompt_number` | `execution_count` |
//! | stream `data` | stream `text` |
//! | payload source `IPython.kernel.zmq.page.page` | `page` |
//! | page payload `text` | `data["text/plain"]` |

use chrono::{DateTime, NaiveDateTime, Utc};
use jupyter_protocol::Channel;
use log::debug;
use serde_json::{json, Map, Value};

use crate::WireError;

fn malformed(message: impl Into<String>) -> WireError {
    WireError::MalformedMessage(message.into())
}

/// Current name of a message type.
pub(crate) fn canonical_msg_type(msg_type: &str) -> &str {
    match msg_type {
        "pyout" => "execute_result",
        "pyerr" => "error",
        "pyin" => "execute_input",
        other => other,
    }
}

/// Check the envelope and rewrite it in place so it deserializes as a
/// current-protocol message.
///
/// Fails when `header.msg_type` or `parent_header` is missing.
pub(crate) fn upgrade_frame(frame: &mut Map<String, Value>) -> Result<(), WireError> {
    let header = match frame.get_mut("header") {
        Some(Value::Object(header)) => header,
        Some(_) => return Err(malformed("header must be an object")),
        None => return Err(malformed("missing header")),
    };
    let msg_type = match header.get("msg_type") {
        Some(Value::String(t)) => canonical_msg_type(t).to_string(),
        _ => return Err(malformed("header is missing msg_type")),
    };
    upgrade_header(header)?;
    header.insert("msg_type".to_string(), Value::from(msg_type.as_str()));

    match frame.get_mut("parent_header") {
        None => return Err(malformed("missing parent_header")),
        Some(Value::Null) => {}
        Some(Value::Object(parent)) if parent.is_empty() => {}
        Some(Value::Object(parent)) => {
            if let Some(Value::String(t)) = parent.get("msg_type") {
                let canonical = canonical_msg_type(t).to_string();
                parent.insert("msg_type".to_string(), Value::from(canonical));
            }
            upgrade_header(parent)?;
        }
        Some(_) => return Err(malformed("parent_header must be an object")),
    }

    if !matches!(frame.get("metadata"), Some(Value::Object(_))) {
        frame.insert("metadata".to_string(), Value::Object(Map::new()));
    }
    let channel_known = frame
        .get("channel")
        .map(|c| serde_json::from_value::<Channel>(c.clone()).is_ok())
        .unwrap_or(true);
    if !channel_known {
        frame.remove("channel");
    }

    let content = frame
        .remove("content")
        .unwrap_or_else(|| Value::Object(Map::new()));
    frame.insert("content".to_string(), upgrade_content(&msg_type, content));
    Ok(())
}

/// Older kernels omit `version`, may send an empty `username`/`session` or
/// none at all, and stamp `date` without a timezone.
fn upgrade_header(header: &mut Map<String, Value>) -> Result<(), WireError> {
    if !matches!(header.get("msg_id"), Some(Value::String(_))) {
        return Err(malformed("header is missing msg_id"));
    }
    for key in ["username", "session", "version", "msg_type"] {
        if !matches!(header.get(key), Some(Value::String(_))) {
            header.insert(key.to_string(), Value::from(""));
        }
    }
    let date = upgrade_date(header.get("date"));
    header.insert("date".to_string(), Value::from(date.to_rfc3339()));
    Ok(())
}

fn upgrade_date(value: Option<&Value>) -> DateTime<Utc> {
    let Some(text) = value.and_then(Value::as_str) else {
        return Utc::now();
    };
    DateTime::parse_from_rfc3339(text)
        .map(|date| date.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc()))
        .unwrap_or_else(|_| Utc::now())
}

fn rename(obj: &mut Map<String, Value>, from: &str, to: &str) {
    if !obj.contains_key(to) {
        if let Some(value) = obj.remove(from) {
            obj.insert(to.to_string(), value);
        }
    }
}

fn default_key(obj: &mut Map<String, Value>, key: &str, value: Value) {
    match obj.get(key) {
        Some(Value::Null) | None => {
            obj.insert(key.to_string(), value);
        }
        Some(_) => {}
    }
}

/// Rewrite `content` of a `msg_type` message into the current shape.
///
/// `msg_type` must already be canonical. Content that is not an object is
/// returned unchanged and left for the typed parser to reject.
pub(crate) fn upgrade_content(msg_type: &str, content: Value) -> Value {
    let Value::Object(mut obj) = content else {
        return content;
    };
    match msg_type {
        "stream" => {
            rename(&mut obj, "data", "text");
            default_key(&mut obj, "name", Value::from("stdout"));
            default_key(&mut obj, "text", Value::from(""));
        }
        "display_data" => {
            default_key(&mut obj, "data", json!({}));
            default_key(&mut obj, "metadata", json!({}));
        }
        "execute_result" => {
            rename(&mut obj, "prompt_number", "execution_count");
            default_key(&mut obj, "execution_count", Value::from(0));
            default_key(&mut obj, "data", json!({}));
            default_key(&mut obj, "metadata", json!({}));
        }
        "execute_input" => {
            rename(&mut obj, "prompt_number", "execution_count");
            default_key(&mut obj, "execution_count", Value::from(0));
            default_key(&mut obj, "code", Value::from(""));
        }
        "error" => {
            default_key(&mut obj, "ename", Value::from(""));
            default_key(&mut obj, "evalue", Value::from(""));
            default_key(&mut obj, "traceback", json!([]));
        }
        "clear_output" => default_key(&mut obj, "wait", Value::from(false)),
        "execute_reply" => {
            default_key(&mut obj, "status", Value::from("ok"));
            rename(&mut obj, "prompt_number", "execution_count");
            // Aborted replies carry no counter; 0 means "none".
            default_key(&mut obj, "execution_count", Value::from(0));
            // Older kernels answer with expression objects the typed reply
            // cannot hold; this client never asks for any.
            obj.remove("user_expressions");
            obj.remove("user_variables");
            let payload = match obj.remove("payload") {
                Some(Value::Array(entries)) => entries.into_iter().filter_map(upgrade_payload).collect(),
                _ => Vec::new(),
            };
            obj.insert("payload".to_string(), Value::Array(payload));
        }
        "complete_request" => {
            rename(&mut obj, "line", "code");
            default_key(&mut obj, "code", Value::from(""));
            default_key(&mut obj, "cursor_pos", Value::from(0));
        }
        "complete_reply" => {
            default_key(&mut obj, "matches", json!([]));
            default_key(&mut obj, "cursor_start", Value::from(0));
            default_key(&mut obj, "cursor_end", Value::from(0));
            default_key(&mut obj, "metadata", json!({}));
            default_key(&mut obj, "status", Value::from("ok"));
        }
        _ => {}
    }
    Value::Object(obj)
}

fn source_is(source: &str, name: &str) -> bool {
    source == name
        || source
            .strip_suffix(name)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Keep the payloads this client acts on, in their current shape.
fn upgrade_payload(entry: Value) -> Option<Value> {
    let Value::Object(mut obj) = entry else {
        return None;
    };
    let source = obj.get("source")?.as_str()?.to_string();
    if source_is(&source, "page") {
        if !obj.contains_key("data") {
            let text = obj.remove("text").unwrap_or_else(|| Value::from(""));
            obj.insert("data".to_string(), json!({ "text/plain": text }));
        }
        rename(&mut obj, "start_line_number", "start");
        if !obj.get("start").is_some_and(Value::is_u64) {
            obj.insert("start".to_string(), Value::from(0));
        }
        obj.insert("source".to_string(), Value::from("page"));
    } else if source_is(&source, "set_next_input") {
        default_key(&mut obj, "text", Value::from(""));
        default_key(&mut obj, "replace", Value::from(false));
        obj.insert("source".to_string(), Value::from("set_next_input"));
    } else {
        debug!("[wire] dropping {} payload", source);
        return None;
    }
    Some(Value::Object(obj))
}

/// Fields older kernels require on requests and newer ones ignore.
pub(crate) fn add_request_fields(msg_type: &str, content: &mut Map<String, Value>) {
    match msg_type {
        "execute_request" => {
            content
                .entry("user_variables")
                .or_insert_with(|| json!([]));
        }
        "complete_request" => {
            let code = content.get("code").cloned().unwrap_or_else(|| Value::from(""));
            content.entry("line").or_insert(code);
            content.entry("text").or_insert_with(|| Value::from(""));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_stream_and_result_fields() {
        let stream = upgrade_content("stream", json!({"name": "stderr", "data": "oops"}));
        assert_eq!(stream, json!({"name": "stderr", "text": "oops"}));

        let result = upgrade_content(
            canonical_msg_type("pyout"),
            json!({"prompt_number": 3, "data": {"text/plain": "3"}}),
        );
        assert_eq!(result["execution_count"], 3);
        assert_eq!(result["metadata"], json!({}));
        assert!(result.get("prompt_number").is_none());
    }

    #[test]
    fn test_execute_reply_defaults() {
        let reply = upgrade_content(
            "execute_reply",
            json!({
                "status": "aborted",
                "execution_count": null,
                "user_expressions": {"x": {"status": "ok", "data": {}}}
            }),
        );
        assert_eq!(reply["execution_count"], 0);
        assert_eq!(reply["payload"], json!([]));
        assert!(reply.get("user_expressions").is_none());
    }

    #[test]
    fn test_payload_sources_are_upgraded() {
        let reply = upgrade_content(
            "execute_reply",
            json!({
                "status": "ok",
                "execution_count": 2,
                "payload": [
                    {"source": "IPython.kernel.zmq.page.page", "text": "Docs", "start_line_number": 4},
                    {"source": "IPython.kernel.zmq.zmqshell.ZMQInteractiveShell.set_next_input", "text": "x"},
                    {"source": "IPython.core.magics.edit", "filename": "a.py"},
                    {"source": "nopage", "text": "ignored"}
                ]
            }),
        );
        assert_eq!(
            reply["payload"],
            json!([
                {"source": "page", "data": {"text/plain": "Docs"}, "start": 4},
                {"source": "set_next_input", "text": "x", "replace": false}
            ])
        );
    }

    #[test]
    fn test_header_without_timezone_or_version() {
        let mut header = json!({"msg_id": "m", "msg_type": "status", "date": "2013-10-03T12:00:00.123456"})
            .as_object()
            .cloned()
            .unwrap();
        upgrade_header(&mut header).unwrap();
        assert_eq!(header["version"], "");
        assert_eq!(header["username"], "");
        assert!(header["date"].as_str().unwrap().starts_with("2013-10-03T12:00:00.123456"));
    }

    #[test]
    fn test_header_without_msg_id_is_malformed() {
        let mut header = json!({"msg_type": "status"}).as_object().cloned().unwrap();
        assert!(matches!(
            upgrade_header(&mut header),
            Err(WireError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_request_fields_for_older_kernels() {
        let mut execute = Map::new();
        add_request_fields("execute_request", &mut execute);
        assert_eq!(execute["user_variables"], json!([]));

        let mut complete = json!({"code": "pri", "cursor_pos": 3}).as_object().cloned().unwrap();
        add_request_fields("complete_request", &mut complete);
        assert_eq!(complete["line"], "pri");
        assert_eq!(complete["text"], "");
    }
}
