//! Output records attached to code cells.
//!
//! Kernels report results as "rich output": a mapping from MIME type to a
//! representation. Only a fixed set of MIME types is understood; anything
//! else is dropped when a bundle is built.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use base64::prelude::*;
use regex::Regex;
use serde_json::{Map, Value};

static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\x1b[^m]*m").expect("ANSI_ESCAPE_RE should compile"));

/// Remove terminal color escape sequences (`ESC ... m`) from `text`.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE_RE.replace_all(text, "")
}

/// The MIME types a bundle can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MimeType {
    TextPlain,
    TextHtml,
    ImageSvg,
    ImagePng,
    ImageJpeg,
    TextLatex,
    Json,
    Javascript,
}

impl MimeType {
    pub const ALL: [MimeType; 8] = [
        MimeType::TextPlain,
        MimeType::TextHtml,
        MimeType::ImageSvg,
        MimeType::ImagePng,
        MimeType::ImageJpeg,
        MimeType::TextLatex,
        MimeType::Json,
        MimeType::Javascript,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MimeType::TextPlain => "text/plain",
            MimeType::TextHtml => "text/html",
            MimeType::ImageSvg => "image/svg+xml",
            MimeType::ImagePng => "image/png",
            MimeType::ImageJpeg => "image/jpeg",
            MimeType::TextLatex => "text/latex",
            MimeType::Json => "application/json",
            MimeType::Javascript => "application/javascript",
        }
    }

    /// Key used for this MIME type by nbformat 3 outputs.
    pub fn legacy_key(self) -> &'static str {
        match self {
            MimeType::TextPlain => "text",
            MimeType::TextHtml => "html",
            MimeType::ImageSvg => "svg",
            MimeType::ImagePng => "png",
            MimeType::ImageJpeg => "jpeg",
            MimeType::TextLatex => "latex",
            MimeType::Json => "json",
            MimeType::Javascript => "javascript",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == mime)
    }

    pub fn from_legacy_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.legacy_key() == key)
    }

    /// Binary payloads are base64 text and are never split into lines.
    pub fn is_binary(self) -> bool {
        matches!(self, MimeType::ImagePng | MimeType::ImageJpeg)
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A MIME type -> payload mapping restricted to [`MimeType`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MimeBundle {
    entries: BTreeMap<MimeType, Value>,
}

impl MimeBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bundle from a `{mime: payload}` object, dropping unknown keys.
    pub fn from_mime_map(map: &Map<String, Value>) -> Self {
        let entries = map
            .iter()
            .filter_map(|(key, value)| {
                MimeType::from_mime(key).map(|mime| (mime, normalize_payload(mime, value)))
            })
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, mime: MimeType, payload: impl Into<Value>) {
        self.entries.insert(mime, payload.into());
    }

    pub fn get(&self, mime: MimeType) -> Option<&Value> {
        self.entries.get(&mime)
    }

    /// Payload as text, for string-valued MIME types.
    pub fn text(&self, mime: MimeType) -> Option<&str> {
        self.entries.get(&mime).and_then(Value::as_str)
    }

    /// Base64-decode a binary payload (PNG/JPEG). Embedded newlines are ignored.
    pub fn decode_binary(&self, mime: MimeType) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        let text = self.text(mime)?;
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        Some(BASE64_STANDARD.decode(compact))
    }

    pub fn iter(&self) -> impl Iterator<Item = (MimeType, &Value)> {
        self.entries.iter().map(|(mime, value)| (*mime, value))
    }

    pub fn mime_types(&self) -> impl Iterator<Item = MimeType> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as a `{mime: payload}` object.
    pub fn to_mime_map(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(mime, value)| (mime.as_str().to_string(), value.clone()))
            .collect()
    }
}

/// Multi-line payloads may arrive as arrays of lines; store them joined.
/// `application/json` is left alone since an array is a legitimate value there.
pub(crate) fn normalize_payload(mime: MimeType, value: &Value) -> Value {
    if mime == MimeType::Json {
        return value.clone();
    }
    match value {
        Value::Array(parts) if parts.iter().all(Value::is_string) => Value::String(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        ),
        other => other.clone(),
    }
}

/// One output record of a code cell, in arrival order.
///
/// `extra` holds the keys of the persisted record the model does not
/// interpret (`transient`, a stream's `metadata`, ...). They are written back
/// unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Stream {
        name: String,
        text: String,
        extra: Map<String, Value>,
    },
    DisplayData {
        data: MimeBundle,
        metadata: Map<String, Value>,
        extra: Map<String, Value>,
    },
    ExecuteResult {
        execution_count: Option<i64>,
        data: MimeBundle,
        metadata: Map<String, Value>,
        extra: Map<String, Value>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
        extra: Map<String, Value>,
    },
}

impl Output {
    pub fn stream(name: &str, text: &str) -> Self {
        Output::Stream {
            name: name.to_string(),
            text: text.to_string(),
            extra: Map::new(),
        }
    }

    pub fn display_data(data: MimeBundle) -> Self {
        Output::DisplayData {
            data,
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn execute_result(data: MimeBundle, execution_count: Option<i64>) -> Self {
        Output::ExecuteResult {
            execution_count,
            data,
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    /// Build an error output. Traceback lines are stored without ANSI escapes.
    pub fn error(ename: &str, evalue: &str, traceback: Vec<String>) -> Self {
        Output::Error {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
            traceback: traceback
                .iter()
                .map(|line| strip_ansi(line).into_owned())
                .collect(),
            extra: Map::new(),
        }
    }

    /// The `output_type` name used by nbformat 4 and the current wire protocol.
    pub fn output_type(&self) -> &'static str {
        match self {
            Output::Stream { .. } => "stream",
            Output::DisplayData { .. } => "display_data",
            Output::ExecuteResult { .. } => "execute_result",
            Output::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Plain-text view of this output, if it has one.
    pub fn plain_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Output::Stream { text, .. } => Some(Cow::Borrowed(text)),
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => {
                data.text(MimeType::TextPlain).map(Cow::Borrowed)
            }
            Output::Error { traceback, .. } => {
                let joined = traceback.join("\n");
                let mut text = strip_ansi(&joined).into_owned();
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                Some(Cow::Owned(text))
            }
        }
    }
}
