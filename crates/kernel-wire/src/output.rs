//! Rich-output normalization: kernel content into cell [`Output`]s.

use jupyter_protocol::{ExecuteReply, JupyterMessageContent, Media, MediaType, Payload, Stdio};
use notebook_doc::{MimeBundle, MimeType, Output};
use serde_json::{Map, Value};

use crate::message::parse_content;
use crate::WireError;

/// Whether this content becomes a cell [`Output`].
pub fn is_output(content: &JupyterMessageContent) -> bool {
    matches!(
        content,
        JupyterMessageContent::StreamContent(_)
            | JupyterMessageContent::DisplayData(_)
            | JupyterMessageContent::ExecuteResult(_)
            | JupyterMessageContent::ErrorOutput(_)
    )
}

/// Convert an output-kind content into an [`Output`].
///
/// Any other kind is a caller bug and fails with `UnknownMessageType`.
pub fn into_output(content: JupyterMessageContent) -> Result<Output, WireError> {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                Stdio::Stdout => "stdout",
                Stdio::Stderr => "stderr",
            };
            Ok(Output::stream(name, &stream.text))
        }
        JupyterMessageContent::DisplayData(display) => Ok(Output::DisplayData {
            data: mime_bundle(&display.data),
            metadata: display.metadata,
            extra: Map::new(),
        }),
        JupyterMessageContent::ExecuteResult(result) => Ok(Output::ExecuteResult {
            // Counters start at 1; 0 is what an absent one was read as.
            execution_count: match result.execution_count.0 {
                0 => None,
                n => i64::try_from(n).ok(),
            },
            data: mime_bundle(&result.data),
            metadata: result.metadata,
            extra: Map::new(),
        }),
        JupyterMessageContent::ErrorOutput(error) => {
            Ok(Output::error(&error.ename, &error.evalue, error.traceback))
        }
        other => Err(WireError::UnknownMessageType(
            other.message_type().to_string(),
        )),
    }
}

/// Normalize an output-kind reply into an [`Output`].
///
/// `msg_type` must be one of `stream`, `display_data`, `execute_result`,
/// `error` (or their older names); anything else is `UnknownMessageType`.
pub fn normalize_output(msg_type: &str, content: Value) -> Result<Output, WireError> {
    into_output(parse_content(msg_type, content)?)
}

/// Keep the MIME types a cell can hold; drop the rest.
fn mime_bundle(media: &Media) -> MimeBundle {
    let mut bundle = MimeBundle::new();
    for entry in &media.content {
        let (mime, payload) = match entry {
            MediaType::Plain(text) => (MimeType::TextPlain, Value::from(text.as_str())),
            MediaType::Html(text) => (MimeType::TextHtml, Value::from(text.as_str())),
            MediaType::Latex(text) => (MimeType::TextLatex, Value::from(text.as_str())),
            MediaType::Javascript(text) => (MimeType::Javascript, Value::from(text.as_str())),
            MediaType::Svg(text) => (MimeType::ImageSvg, Value::from(text.as_str())),
            MediaType::Png(data) => (MimeType::ImagePng, Value::from(data.as_str())),
            MediaType::Jpeg(data) => (MimeType::ImageJpeg, Value::from(data.as_str())),
            MediaType::Json(obj) => (MimeType::Json, Value::Object(obj.clone())),
            // JSON that is not an object lands here
            MediaType::Other((key, value)) => match MimeType::from_mime(key) {
                Some(mime) => (mime, value.clone()),
                None => continue,
            },
            _ => continue,
        };
        bundle.insert(mime, payload);
    }
    bundle
}

/// Text the kernel asked to show in a pager (`?`/`??` introspection).
pub fn pager_text(reply: &ExecuteReply) -> Option<String> {
    reply.payload.iter().find_map(|payload| match payload {
        Payload::Page { data, .. } => data.content.iter().find_map(|media| match media {
            MediaType::Plain(text) => Some(text.clone()),
            _ => None,
        }),
        _ => None,
    })
}

/// Replacement input requested by the kernel (`set_next_input` payload).
pub fn next_input(reply: &ExecuteReply) -> Option<String> {
    reply.payload.iter().find_map(|payload| match payload {
        Payload::SetNextInput { text, .. } => Some(text.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{ExecutionState, Status};
    use serde_json::json;

    fn reply(content: Value) -> ExecuteReply {
        match parse_content("execute_reply", content).unwrap() {
            JupyterMessageContent::ExecuteReply(reply) => reply,
            other => panic!("expected execute_reply, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_keeps_text_and_png() {
        let output = normalize_output(
            "display_data",
            json!({
                "data": {
                    "text/plain": "<Figure size 640x480>",
                    "image/png": "iVBORw0KGgo=",
                    "application/vnd.custom+json": {"x": 1}
                },
                "metadata": {}
            }),
        )
        .unwrap();
        let data = output.data().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.text(MimeType::TextPlain), Some("<Figure size 640x480>"));
        assert_eq!(data.text(MimeType::ImagePng), Some("iVBORw0KGgo="));
    }

    #[test]
    fn test_normalize_error_strips_ansi() {
        let output = normalize_output(
            "error",
            json!({
                "ename": "NameError",
                "evalue": "name 'x' is not defined",
                "traceback": ["\u{1b}[0;31mError\u{1b}[0m"]
            }),
        )
        .unwrap();
        match output {
            Output::Error { traceback, .. } => assert_eq!(traceback, vec!["Error"]),
            other => panic!("expected error output, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_stream_and_result() {
        assert_eq!(
            normalize_output("stream", json!({"name": "stderr", "text": "oops\n"})).unwrap(),
            Output::stream("stderr", "oops\n")
        );
        assert_eq!(
            normalize_output("stream", json!({"name": "stdout", "data": "old\n"})).unwrap(),
            Output::stream("stdout", "old\n")
        );
        let result =
            normalize_output("pyout", json!({"prompt_number": 9, "data": {"text/plain": "9"}}))
                .unwrap();
        assert!(matches!(
            result,
            Output::ExecuteResult { execution_count: Some(9), .. }
        ));
    }

    #[test]
    fn test_result_without_counter_has_none() {
        let result = normalize_output(
            "execute_result",
            json!({"execution_count": null, "data": {"text/plain": "x"}, "metadata": {}}),
        )
        .unwrap();
        assert!(matches!(
            result,
            Output::ExecuteResult { execution_count: None, .. }
        ));
    }

    #[test]
    fn test_json_payload_kept_as_value() {
        let output = normalize_output(
            "display_data",
            json!({"data": {"application/json": [1, 2]}, "metadata": {}}),
        )
        .unwrap();
        assert_eq!(output.data().unwrap().get(MimeType::Json), Some(&json!([1, 2])));
    }

    #[test]
    fn test_normalize_unknown_type_fails_loud() {
        assert!(matches!(
            normalize_output("custom_event", json!({})),
            Err(WireError::UnknownMessageType(t)) if t == "custom_event"
        ));
    }

    #[test]
    fn test_into_output_rejects_non_output_kinds() {
        let status = JupyterMessageContent::Status(Status {
            execution_state: ExecutionState::Idle,
        });
        assert!(!is_output(&status));
        assert!(matches!(
            into_output(status),
            Err(WireError::UnknownMessageType(t)) if t == "status"
        ));
    }

    #[test]
    fn test_execute_reply_payloads() {
        let current = reply(json!({
            "status": "ok",
            "execution_count": 2,
            "payload": [
                {"source": "page", "data": {"text/plain": "Docstring"}, "start": 0},
                {"source": "set_next_input", "text": "x = 1", "replace": false}
            ]
        }));
        assert_eq!(pager_text(&current).as_deref(), Some("Docstring"));
        assert_eq!(next_input(&current).as_deref(), Some("x = 1"));

        let legacy = reply(json!({
            "status": "ok",
            "prompt_number": 5,
            "payload": [{"source": "IPython.zmq.page.page", "text": "Old docs"}]
        }));
        assert_eq!(legacy.execution_count.0, 5);
        assert_eq!(pager_text(&legacy).as_deref(), Some("Old docs"));
        assert_eq!(next_input(&legacy), None);
    }
}
