//! Annotated JSON documents.
//!
//! A document is a JSON array. The first object of `type` 1 describes the
//! source, objects of `type` 2 are packets, and objects with a `type` above
//! 10 are local annotation dictionaries mapping an origin object to
//! `[local_id, value]`.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::dictionary::{AnnotationKind, AnnotationValue, LocalDictionary, LocalId};
use crate::field::{FieldValue, PacketRecord};

const TYPE_SOURCE: i64 = 1;
const TYPE_PACKET: i64 = 2;
const DICT_LOWER_BOUNDARY: i64 = 10;

/// Errors raised while reading an annotated document.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document is not a JSON array of objects")]
    NotArray,

    #[error("object {index}: missing or invalid type")]
    MissingType { index: usize },

    #[error("object {index}: dictionary entry {origin:?} is not [local_id, value]")]
    BadDictionaryEntry { index: usize, origin: String },

    #[error("source header {parameter} is {found:?}, run uses {expected:?}")]
    HeaderMismatch {
        parameter: &'static str,
        found: String,
        expected: String,
    },
}

/// Source description carried by a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceHeader {
    pub sensorname: Option<String>,
    pub filename: Option<String>,
    pub tshark_filter: Option<String>,
    pub json_fields: Option<Vec<String>>,
}

impl SourceHeader {
    fn from_object(obj: &Map<String, Value>) -> Self {
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            sensorname: text("sensorname"),
            filename: text("filename"),
            tshark_filter: text("tshark_filter"),
            json_fields: obj.get("json_fields").and_then(Value::as_array).map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
        }
    }

    /// Checks the header against the run's filter and record fields.
    /// Absent header values are not checked.
    pub fn check(&self, filter: &str, record_fields: &[&str]) -> Result<(), DocumentError> {
        if let Some(found) = &self.tshark_filter {
            if found != filter {
                return Err(DocumentError::HeaderMismatch {
                    parameter: "tshark_filter",
                    found: found.clone(),
                    expected: filter.to_string(),
                });
            }
        }

        if let Some(found) = &self.json_fields {
            let mut found: Vec<&str> = found.iter().map(String::as_str).collect();
            let mut expected: Vec<&str> = record_fields.to_vec();
            found.sort_unstable();
            expected.sort_unstable();
            if found != expected {
                return Err(DocumentError::HeaderMismatch {
                    parameter: "json_fields",
                    found: found.join(","),
                    expected: expected.join(","),
                });
            }
        }

        Ok(())
    }
}

/// A parsed annotated document.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedDocument {
    pub header: SourceHeader,
    pub packets: Vec<PacketRecord>,
    pub local: LocalDictionary,
}

impl AnnotatedDocument {
    /// Reads a `.json` or `.json.gz` document.
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let io_err = |source| DocumentError::Io {
            path: path.display().to_string(),
            source,
        };

        let file = std::fs::File::open(path).map_err(io_err)?;
        let mut text = String::new();
        if path.extension().is_some_and(|e| e == "gz") {
            GzDecoder::new(file)
                .read_to_string(&mut text)
                .map_err(io_err)?;
        } else {
            std::io::BufReader::new(file)
                .read_to_string(&mut text)
                .map_err(io_err)?;
        }

        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(text)?;
        let objects = value.as_array().ok_or(DocumentError::NotArray)?;

        let mut doc = Self::default();
        for (index, object) in objects.iter().enumerate() {
            let obj = object.as_object().ok_or(DocumentError::NotArray)?;
            let code = obj
                .get("type")
                .and_then(Value::as_i64)
                .ok_or(DocumentError::MissingType { index })?;

            match code {
                TYPE_SOURCE => doc.header = SourceHeader::from_object(obj),
                TYPE_PACKET => doc.packets.push(
                    obj.iter()
                        .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                        .collect(),
                ),
                code if code > DICT_LOWER_BOUNDARY => match AnnotationKind::from_code(code) {
                    Some(kind) => read_dictionary(index, kind, obj, &mut doc.local)?,
                    // References into it resolve to the unresolved id.
                    None => tracing::info!(index, code, "skipping unknown dictionary type"),
                },
                other => {
                    tracing::debug!(index, kind = other, "skipping unknown document object");
                }
            }
        }

        Ok(doc)
    }
}

fn read_dictionary(
    index: usize,
    kind: AnnotationKind,
    obj: &Map<String, Value>,
    local: &mut LocalDictionary,
) -> Result<(), DocumentError> {
    for (origin, entry) in obj {
        if origin == "type" {
            continue;
        }
        let bad = || DocumentError::BadDictionaryEntry {
            index,
            origin: origin.clone(),
        };
        let pair = entry.as_array().filter(|a| a.len() == 2).ok_or_else(bad)?;
        let id = pair[0].as_i64().ok_or_else(bad)?;
        local.insert(kind, LocalId(id), AnnotationValue::from_json(&pair[1]));
    }
    Ok(())
}
