//! Persisted notebook format (nbformat 3 and 4).
//!
//! A notebook is written back in the layout and version it was read in.
//! Keys the model does not interpret are carried through untouched, so a
//! decode/encode cycle preserves the key structure of every object.
//!
//! | concept | nbformat 3 | nbformat 4 |
//! |---|---|---|
//! | cells | `worksheets[0].cells` | `cells` |
//! | code source | `input` | `source` |
//! | counter | `prompt_number` | `execution_count` |
//! | result output | `pyout` + short MIME keys | `execute_result` + `data` |
//! | error output | `pyerr` | `error` |
//! | stream name | `stream` | `name` |

use std::str::FromStr;

use serde_json::{Map, Value};

use crate::cell::{Cell, CellBody, CellKind, CodeCell, Prompt};
use crate::error::DocumentError;
use crate::notebook::{Layout, Notebook};
use crate::output::{normalize_payload, MimeBundle, MimeType, Output};

impl Notebook {
    /// Decode a notebook from its JSON text.
    pub fn from_json(text: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let Value::Object(mut obj) = value else {
            return Err(malformed("notebook must be a JSON object"));
        };

        let nbformat = match obj.remove("nbformat") {
            Some(v) => v
                .as_u64()
                .ok_or_else(|| malformed("nbformat must be an integer"))?,
            None => return Err(malformed("missing nbformat")),
        };
        if !(3..=4).contains(&nbformat) {
            return Err(DocumentError::UnsupportedVersion(nbformat));
        }
        let nbformat_minor = match obj.remove("nbformat_minor") {
            Some(v) => v
                .as_u64()
                .ok_or_else(|| malformed("nbformat_minor must be an integer"))?,
            None => 0,
        };

        let (raw_cells, layout) = if let Some(cells) = obj.remove("cells") {
            (expect_array(cells, "cells")?, Layout::Cells)
        } else if let Some(worksheets) = obj.remove("worksheets") {
            let mut worksheets = expect_array(worksheets, "worksheets")?.into_iter();
            match worksheets.next() {
                Some(Value::Object(mut first)) => {
                    let cells = match first.remove("cells") {
                        Some(cells) => expect_array(cells, "worksheet cells")?,
                        None => Vec::new(),
                    };
                    let layout = Layout::Worksheets {
                        first: Some(first),
                        rest: worksheets.collect(),
                    };
                    (cells, layout)
                }
                Some(_) => return Err(malformed("worksheet must be an object")),
                None => (
                    Vec::new(),
                    Layout::Worksheets {
                        first: None,
                        rest: Vec::new(),
                    },
                ),
            }
        } else {
            return Err(malformed("missing cells"));
        };

        let legacy = nbformat < 4;
        let cells = raw_cells
            .into_iter()
            .map(|cell| decode_cell(cell, legacy))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Notebook {
            nbformat: nbformat as u32,
            nbformat_minor: nbformat_minor as u32,
            cells,
            layout,
            extra: obj,
        })
    }

    pub fn to_value(&self) -> Value {
        let legacy = self.nbformat < 4;
        let cells: Vec<Value> = self
            .cells
            .iter()
            .map(|cell| encode_cell(cell, legacy))
            .collect();

        let mut obj = self.extra.clone();
        obj.insert("nbformat".to_string(), Value::from(self.nbformat));
        obj.insert("nbformat_minor".to_string(), Value::from(self.nbformat_minor));

        match &self.layout {
            Layout::Cells => {
                obj.insert("cells".to_string(), Value::Array(cells));
            }
            Layout::Worksheets { first, rest } => {
                let mut worksheets = Vec::with_capacity(rest.len() + 1);
                // A worksheet-less file stays worksheet-less until it gains cells.
                if first.is_some() || !cells.is_empty() {
                    let mut ws = first.clone().unwrap_or_default();
                    ws.insert("cells".to_string(), Value::Array(cells));
                    worksheets.push(Value::Object(ws));
                }
                worksheets.extend(rest.iter().cloned());
                obj.insert("worksheets".to_string(), Value::Array(worksheets));
            }
        }
        Value::Object(obj)
    }

    /// Serialize to pretty-printed JSON text.
    pub fn to_json(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }
}

impl FromStr for Notebook {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Notebook::from_json(s)
    }
}

fn malformed(message: &str) -> DocumentError {
    DocumentError::Malformed(message.to_string())
}

fn expect_array(value: Value, what: &str) -> Result<Vec<Value>, DocumentError> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(DocumentError::Malformed(format!("{} must be an array", what))),
    }
}

/// Multi-line strings may be stored either as one string or a list of lines.
fn join_multiline(value: &Value, what: &str) -> Result<String, DocumentError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(parts) => parts
            .iter()
            .map(|p| {
                p.as_str()
                    .ok_or_else(|| DocumentError::Malformed(format!("{} lines must be strings", what)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|lines| lines.concat()),
        Value::Null => Ok(String::new()),
        _ => Err(DocumentError::Malformed(format!("{} must be a string", what))),
    }
}

fn split_multiline(text: &str) -> Value {
    Value::Array(
        text.split_inclusive('\n')
            .map(|line| Value::String(line.to_string()))
            .collect(),
    )
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> Result<String, DocumentError> {
    match obj.remove(key) {
        Some(value) => join_multiline(&value, key),
        None => Ok(String::new()),
    }
}

/// Parse a counter. Non-integers (`null`, a leftover `"*"`) mean no counter.
fn parse_counter(value: Option<Value>) -> Option<i64> {
    value.and_then(|v| v.as_i64())
}

fn take_map(obj: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match obj.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn decode_cell(value: Value, legacy: bool) -> Result<Cell, DocumentError> {
    let Value::Object(mut obj) = value else {
        return Err(malformed("cell must be an object"));
    };
    let cell_type = match obj.remove("cell_type") {
        Some(Value::String(s)) => s,
        _ => return Err(malformed("cell is missing cell_type")),
    };
    let kind =
        CellKind::parse(&cell_type).ok_or_else(|| DocumentError::UnknownCellType(cell_type.clone()))?;

    let body = match kind {
        CellKind::Code => {
            let counter = match obj.remove("execution_count") {
                Some(v) => parse_counter(Some(v)),
                None => parse_counter(obj.remove("prompt_number")),
            };
            let outputs = match obj.remove("outputs") {
                Some(v) => expect_array(v, "outputs")?
                    .into_iter()
                    .map(|output| decode_output(output, legacy))
                    .collect::<Result<Vec<_>, _>>()?,
                None => Vec::new(),
            };
            CellBody::Code(CodeCell {
                prompt: counter.map(Prompt::Count).unwrap_or_default(),
                outputs,
            })
        }
        CellKind::Markdown => CellBody::Markdown,
        CellKind::Raw => CellBody::Raw,
        CellKind::Heading => {
            let level = match obj.remove("level") {
                Some(v) => v
                    .as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| malformed("heading level must be a small integer"))?,
                None => 1,
            };
            CellBody::Heading { level }
        }
    };

    let source = if kind == CellKind::Code && obj.contains_key("input") {
        take_string(&mut obj, "input")?
    } else {
        take_string(&mut obj, "source")?
    };

    Ok(Cell::from_parts(source, body, obj))
}

fn encode_cell(cell: &Cell, legacy: bool) -> Value {
    let mut obj = cell.extra.clone();
    obj.insert(
        "cell_type".to_string(),
        Value::String(cell.kind().as_str().to_string()),
    );

    let source_key = if legacy && cell.is_code() { "input" } else { "source" };
    obj.insert(source_key.to_string(), split_multiline(&cell.source));

    match &cell.body {
        CellBody::Code(code) => {
            let counter = code.prompt.count();
            if legacy {
                if let Some(n) = counter {
                    obj.insert("prompt_number".to_string(), Value::from(n));
                }
            } else {
                obj.insert(
                    "execution_count".to_string(),
                    counter.map(Value::from).unwrap_or(Value::Null),
                );
            }
            let outputs = code
                .outputs
                .iter()
                .map(|o| encode_output(o, legacy))
                .collect();
            obj.insert("outputs".to_string(), Value::Array(outputs));
        }
        CellBody::Heading { level } => {
            obj.insert("level".to_string(), Value::from(*level));
        }
        CellBody::Markdown | CellBody::Raw => {}
    }
    Value::Object(obj)
}

fn decode_output(value: Value, legacy: bool) -> Result<Output, DocumentError> {
    let Value::Object(mut obj) = value else {
        return Err(malformed("output must be an object"));
    };
    let output_type = match obj.remove("output_type") {
        Some(Value::String(s)) => s,
        _ => return Err(malformed("output is missing output_type")),
    };

    match output_type.as_str() {
        "stream" => {
            let name = match obj.remove("name").or_else(|| obj.remove("stream")) {
                Some(Value::String(s)) => s,
                _ => "stdout".to_string(),
            };
            let text = take_string(&mut obj, "text")?;
            Ok(Output::Stream {
                name,
                text,
                extra: legacy_leftovers(obj, legacy),
            })
        }
        "display_data" => {
            let metadata = take_map(&mut obj, "metadata");
            let data = take_bundle(&mut obj);
            Ok(Output::DisplayData {
                data,
                metadata,
                extra: obj,
            })
        }
        "execute_result" | "pyout" => {
            let execution_count = match obj.remove("execution_count") {
                Some(v) => parse_counter(Some(v)),
                None => parse_counter(obj.remove("prompt_number")),
            };
            let metadata = take_map(&mut obj, "metadata");
            let data = take_bundle(&mut obj);
            Ok(Output::ExecuteResult {
                execution_count,
                data,
                metadata,
                extra: obj,
            })
        }
        "error" | "pyerr" => {
            let ename = take_string(&mut obj, "ename")?;
            let evalue = take_string(&mut obj, "evalue")?;
            let traceback = match obj.remove("traceback") {
                Some(Value::Array(lines)) => lines
                    .into_iter()
                    .map(|l| match l {
                        Value::String(s) => Ok(s),
                        _ => Err(malformed("traceback lines must be strings")),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                Some(_) => return Err(malformed("traceback must be an array")),
                None => Vec::new(),
            };
            // Stored tracebacks are kept verbatim; stripping happens on the wire
            // path and in the rendered view.
            Ok(Output::Error {
                ename,
                evalue,
                traceback,
                extra: legacy_leftovers(obj, legacy),
            })
        }
        other => Err(DocumentError::UnknownOutputType(other.to_string())),
    }
}

/// nbformat 3 gives every stream and error output an empty `metadata`; the
/// encoder writes it back, so it is not kept as an extra key.
fn legacy_leftovers(mut obj: Map<String, Value>, legacy: bool) -> Map<String, Value> {
    if legacy && matches!(obj.get("metadata"), Some(Value::Object(m)) if m.is_empty()) {
        obj.remove("metadata");
    }
    obj
}

/// nbformat 4 nests MIME data under `data`; nbformat 3 spreads short keys
/// (`text`, `png`, ...) over the output object itself. Short keys that name no
/// known MIME type stay in `obj`.
fn take_bundle(obj: &mut Map<String, Value>) -> MimeBundle {
    if let Some(Value::Object(data)) = obj.get("data") {
        let bundle = MimeBundle::from_mime_map(data);
        obj.remove("data");
        return bundle;
    }
    let mut bundle = MimeBundle::new();
    for mime in MimeType::ALL {
        if let Some(value) = obj.remove(mime.legacy_key()) {
            bundle.insert(mime, normalize_payload(mime, &value));
        }
    }
    bundle
}

fn encode_payload(mime: MimeType, value: &Value) -> Value {
    match value {
        Value::String(s) if !mime.is_binary() => split_multiline(s),
        other => other.clone(),
    }
}

fn encode_output(output: &Output, legacy: bool) -> Value {
    match output {
        Output::Stream { name, text, extra } => {
            let mut obj = extra.clone();
            obj.insert("output_type".to_string(), Value::from("stream"));
            let name_key = if legacy { "stream" } else { "name" };
            obj.insert(name_key.to_string(), Value::from(name.as_str()));
            obj.insert("text".to_string(), split_multiline(text));
            if legacy {
                obj.entry("metadata")
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Value::Object(obj)
        }
        Output::DisplayData {
            data,
            metadata,
            extra,
        } => {
            let mut obj = extra.clone();
            obj.insert("output_type".to_string(), Value::from("display_data"));
            insert_bundle(&mut obj, data, legacy);
            obj.insert("metadata".to_string(), Value::Object(metadata.clone()));
            Value::Object(obj)
        }
        Output::ExecuteResult {
            execution_count,
            data,
            metadata,
            extra,
        } => {
            let mut obj = extra.clone();
            if legacy {
                obj.insert("output_type".to_string(), Value::from("pyout"));
                if let Some(n) = execution_count {
                    obj.insert("prompt_number".to_string(), Value::from(*n));
                }
            } else {
                obj.insert("output_type".to_string(), Value::from("execute_result"));
                obj.insert(
                    "execution_count".to_string(),
                    execution_count.map(Value::from).unwrap_or(Value::Null),
                );
            }
            insert_bundle(&mut obj, data, legacy);
            obj.insert("metadata".to_string(), Value::Object(metadata.clone()));
            Value::Object(obj)
        }
        Output::Error {
            ename,
            evalue,
            traceback,
            extra,
        } => {
            let mut obj = extra.clone();
            let output_type = if legacy { "pyerr" } else { "error" };
            obj.insert("output_type".to_string(), Value::from(output_type));
            obj.insert("ename".to_string(), Value::from(ename.as_str()));
            obj.insert("evalue".to_string(), Value::from(evalue.as_str()));
            obj.insert(
                "traceback".to_string(),
                Value::Array(traceback.iter().map(|l| Value::from(l.as_str())).collect()),
            );
            if legacy {
                obj.entry("metadata")
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Value::Object(obj)
        }
    }
}

fn insert_bundle(obj: &mut Map<String, Value>, data: &MimeBundle, legacy: bool) {
    if legacy {
        for (mime, value) in data.iter() {
            obj.insert(mime.legacy_key().to_string(), encode_payload(mime, value));
        }
    } else {
        let map: Map<String, Value> = data
            .iter()
            .map(|(mime, value)| (mime.as_str().to_string(), encode_payload(mime, value)))
            .collect();
        obj.insert("data".to_string(), Value::Object(map));
    }
}
