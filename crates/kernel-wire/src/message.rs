//! Message envelopes and the frame codec.

use jupyter_protocol::{Channel, Header, JupyterMessage, JupyterMessageContent};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::legacy;
use crate::WireError;

/// A kernel message as carried by one WebSocket text frame.
///
/// Binary buffers are not used by the JSON channels, so unlike
/// [`JupyterMessage`] there are none here.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub header: Header,
    #[serde(serialize_with = "serialize_parent_header")]
    pub parent_header: Option<Header>,
    pub metadata: Value,
    pub content: JupyterMessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

impl Message {
    /// A new top-level message (empty parent header).
    pub fn new(content: impl Into<JupyterMessageContent>, session: &str, username: &str) -> Self {
        let mut message = Message::from(JupyterMessage::new(content, None).with_session(session));
        message.header.username = username.to_string();
        message
    }

    /// A message replying to `parent`, in the parent's session.
    pub fn reply_to(parent: &Message, content: impl Into<JupyterMessageContent>) -> Self {
        let mut message = Self::new(content, &parent.header.session, &parent.header.username);
        message.parent_header = Some(parent.header.clone());
        message
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }
}

impl From<JupyterMessage> for Message {
    fn from(msg: JupyterMessage) -> Self {
        Message {
            header: msg.header,
            parent_header: msg.parent_header,
            metadata: msg.metadata,
            content: msg.content,
            channel: msg.channel,
        }
    }
}

impl From<Message> for JupyterMessage {
    fn from(msg: Message) -> Self {
        JupyterMessage {
            zmq_identities: Vec::new(),
            header: msg.header,
            parent_header: msg.parent_header,
            metadata: msg.metadata,
            content: msg.content,
            buffers: Vec::new(),
            channel: msg.channel,
        }
    }
}

/// An absent parent is written as `{}`.
fn serialize_parent_header<S>(parent_header: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent_header {
        Some(parent_header) => parent_header.serialize(serializer),
        None => Map::new().serialize(serializer),
    }
}

/// `parent_header` may be `{}`, `null`, or a header.
fn deserialize_parent_header<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Object(obj) if obj.is_empty() => Ok(None),
        value => serde_json::from_value(value).map(Some).map_err(D::Error::custom),
    }
}

/// Intermediate form of an incoming frame.
///
/// - `content` is kept raw (parsed later based on `msg_type`)
/// - `parent_header` may be `{}`, `null`, or a header
/// - `metadata` may be missing
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub header: Header,
    #[serde(default, deserialize_with = "deserialize_parent_header")]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Value,
    pub content: Value,
    #[serde(default)]
    pub channel: Option<Channel>,
}

impl RawMessage {
    /// Read an envelope, upgrading older protocol shapes first.
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let Value::Object(mut frame) = value else {
            return Err(WireError::MalformedMessage(
                "frame is not a JSON object".to_string(),
            ));
        };
        legacy::upgrade_frame(&mut frame)?;
        serde_json::from_value(Value::Object(frame))
            .map_err(|e| WireError::MalformedMessage(format!("envelope: {}", e)))
    }
}

impl TryFrom<RawMessage> for Message {
    type Error = WireError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let content = typed_content(&raw.header.msg_type, raw.content)?;
        Ok(Message {
            header: raw.header,
            parent_header: raw.parent_header,
            metadata: raw.metadata,
            content,
            channel: raw.channel,
        })
    }
}

fn typed_content(msg_type: &str, content: Value) -> Result<JupyterMessageContent, WireError> {
    JupyterMessageContent::from_type_and_content(msg_type, content)
        .map_err(|e| WireError::MalformedMessage(format!("{} content: {}", msg_type, e)))
}

/// Typed content for `msg_type`, accepting the older IPython names and
/// field spellings.
pub fn parse_content(msg_type: &str, content: Value) -> Result<JupyterMessageContent, WireError> {
    let msg_type = legacy::canonical_msg_type(msg_type);
    typed_content(msg_type, legacy::upgrade_content(msg_type, content))
}

/// Encode a message as a JSON text frame.
///
/// Requests also carry the fields older kernels require (`user_variables`,
/// the completion `line`).
pub fn encode(message: &Message) -> Result<String, WireError> {
    let mut frame = serde_json::to_value(message)?;
    if let JupyterMessageContent::UnknownMessage(unknown) = &message.content {
        frame["content"] = unknown.content.clone();
    }
    if let Some(Value::Object(content)) = frame.get_mut("content") {
        legacy::add_request_fields(message.msg_type(), content);
    }
    Ok(serde_json::to_string(&frame)?)
}

/// Decode a JSON text frame.
///
/// A frame without `header.msg_type` or without `parent_header` fails with
/// [`WireError::MalformedMessage`], as does content that does not fit its
/// `msg_type`. Unknown message types decode to
/// [`JupyterMessageContent::UnknownMessage`].
pub fn decode(frame: &str) -> Result<Message, WireError> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| WireError::MalformedMessage(format!("invalid JSON: {}", e)))?;
    RawMessage::from_value(value)?.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{ExecuteRequest, ExecutionState, MediaType, Status};
    use serde_json::json;

    fn frame(parent_header: &str) -> String {
        format!(
            r#"
        {{
            "header": {{
                "date": "2025-05-14T14:32:23.490Z",
                "msg_id": "test-id",
                "msg_type": "status",
                "session": "test-session",
                "username": "",
                "version": "5.2"
            }},
            "parent_header": {},
            "metadata": {{}},
            "content": {{"execution_state": "busy"}},
            "buffers": [],
            "channel": "iopub"
        }}
        "#,
            parent_header
        )
    }

    #[test]
    fn test_deserialize_empty_parent_header() {
        let msg = decode(&frame("{}")).unwrap();
        assert!(msg.parent_header.is_none());
        assert!(matches!(msg.channel, Some(Channel::IOPub)));
        assert!(matches!(
            msg.content,
            JupyterMessageContent::Status(s) if s.execution_state == ExecutionState::Busy
        ));
    }

    #[test]
    fn test_deserialize_null_parent_header() {
        let msg = decode(&frame("null")).unwrap();
        assert!(msg.parent_header.is_none());
    }

    #[test]
    fn test_deserialize_partial_parent_header() {
        let msg = decode(&frame(r#"{"msg_id": "req-1", "msg_type": "execute_request"}"#)).unwrap();
        assert_eq!(msg.parent_id(), Some("req-1"));
    }

    #[test]
    fn test_missing_parent_header_is_malformed() {
        let text = r#"{"header": {"msg_id": "a", "msg_type": "status"}, "content": {}}"#;
        assert!(matches!(decode(text), Err(WireError::MalformedMessage(_))));
    }

    #[test]
    fn test_missing_msg_type_is_malformed() {
        let text = r#"{"header": {"msg_id": "a"}, "parent_header": {}, "content": {}}"#;
        assert!(matches!(decode(text), Err(WireError::MalformedMessage(_))));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(decode("hallo"), Err(WireError::MalformedMessage(_))));
        assert!(matches!(decode("[1, 2]"), Err(WireError::MalformedMessage(_))));
    }

    #[test]
    fn test_content_not_matching_type_is_malformed() {
        let text = r#"{"header": {"msg_id": "a", "msg_type": "status"}, "parent_header": {}, "content": {"execution_state": 7}}"#;
        assert!(matches!(decode(text), Err(WireError::MalformedMessage(_))));
    }

    #[test]
    fn test_unknown_channel_is_ignored() {
        let text = frame("{}").replace(r#""channel": "iopub""#, r#""channel": "websocket""#);
        assert!(decode(&text).unwrap().channel.is_none());
    }

    #[test]
    fn test_encode_decode_request() {
        let msg = Message::new(ExecuteRequest::new("print(1)".to_string()), "sess", "user");
        let text = encode(&msg).unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["parent_header"], json!({}));
        assert_eq!(value["header"]["msg_type"], "execute_request");
        assert_eq!(value["header"]["session"], "sess");
        assert_eq!(value["header"]["username"], "user");
        assert_eq!(value["content"]["user_variables"], json!([]));
        assert_eq!(value["content"]["user_expressions"], json!({}));

        let decoded = decode(&text).unwrap();
        assert_eq!(decoded.msg_id(), msg.msg_id());
        assert_eq!(decoded.header.date, msg.header.date);
        match decoded.content {
            JupyterMessageContent::ExecuteRequest(req) => {
                assert_eq!(req.code, "print(1)");
                assert!(req.store_history);
                assert!(!req.silent);
            }
            other => panic!("expected execute_request, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_to_sets_parent() {
        let request = Message::new(ExecuteRequest::new("1".to_string()), "sess", "user");
        let reply = Message::reply_to(&request, Status::idle());
        assert_eq!(reply.parent_id(), Some(request.msg_id()));
        assert_eq!(reply.header.session, "sess");
        assert_eq!(reply.msg_type(), "status");
        assert_ne!(reply.msg_id(), request.msg_id());

        let value: Value = serde_json::from_str(&encode(&reply).unwrap()).unwrap();
        assert_eq!(value["parent_header"]["msg_id"], request.msg_id());
    }

    #[test]
    fn test_legacy_frame_decodes_to_current_types() {
        let text = json!({
            "header": {"msg_id": "m1", "msg_type": "pyout", "session": "s", "username": "u", "date": "2013-10-03T12:00:00"},
            "parent_header": {"msg_id": "req", "msg_type": "execute_request", "session": "s", "username": "u"},
            "content": {"prompt_number": 4, "data": {"text/plain": ["4"]}}
        })
        .to_string();
        let msg = decode(&text).unwrap();
        assert_eq!(msg.msg_type(), "execute_result");
        assert_eq!(msg.parent_id(), Some("req"));
        match msg.content {
            JupyterMessageContent::ExecuteResult(result) => {
                assert_eq!(result.execution_count.0, 4);
                assert!(result
                    .data
                    .content
                    .iter()
                    .any(|m| matches!(m, MediaType::Plain(t) if t == "4")));
            }
            other => panic!("expected execute_result, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_round_trips_content() {
        let content = parse_content("custom_event", json!({"step": 3})).unwrap();
        assert!(matches!(content, JupyterMessageContent::UnknownMessage(_)));
        let msg = Message::new(content, "s", "u");
        let value: Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value["header"]["msg_type"], "custom_event");
        assert_eq!(value["content"], json!({"step": 3}));
    }

    #[test]
    fn test_conversion_with_jupyter_message() {
        let msg = Message::new(Status::busy(), "s", "u");
        let jupyter = JupyterMessage::from(msg.clone());
        assert_eq!(jupyter.message_type(), "status");
        let back = Message::from(jupyter);
        assert_eq!(back.msg_id(), msg.msg_id());
    }
}
