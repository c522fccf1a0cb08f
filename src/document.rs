//! # Bluesky Document Model
//!
//! The document-stream library delivers `(kind, body)` pairs in a fixed
//! relative order per run: exactly one `start`, then `descriptor`s and
//! `event_page`s interleaved per stream, then exactly one `stop`. This
//! module turns those pairs into a tagged union so the serializer can
//! dispatch with a single exhaustive `match` instead of name lookup.
//!
//! Typed views extract only the fields this crate acts on; the complete
//! raw mapping travels alongside so document metadata can be mirrored into
//! the container verbatim.
//!
//! `event` documents are accepted for convenience and normalized into
//! single-event pages, matching the upstream document router's behavior.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::schema::DataKeySpec;

/// Errors raised while interpreting an incoming document
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The document kind is not part of the model
    #[error("unknown document kind '{0}'")]
    UnknownKind(String),

    /// The document body is not a mapping
    #[error("{kind} document is not a mapping")]
    NotAMapping {
        /// Document kind
        kind: &'static str,
    },

    /// A required key is absent
    #[error("{kind} document is missing required key '{key}'")]
    MissingKey {
        /// Document kind
        kind: &'static str,
        /// The absent key
        key: &'static str,
    },

    /// A key holds a value of the wrong type
    #[error("{kind} document key '{key}' has an unexpected type")]
    InvalidValue {
        /// Document kind
        kind: &'static str,
        /// The offending key
        key: String,
    },

    /// Data and timestamp columns in an event page disagree in length
    #[error("event_page columns for field '{field}' have inconsistent lengths")]
    ColumnLengthMismatch {
        /// The offending field
        field: String,
    },

    /// A descriptor `data_keys` entry failed to parse
    #[error("invalid data_keys entry for field '{field}': {source}")]
    BadDataKey {
        /// The offending field
        field: String,
        /// Underlying parse error
        source: serde_json::Error,
    },

    /// A technique block in the start document is malformed
    #[error("technique block {index} is missing required key '{key}'")]
    BadTechnique {
        /// Index of the block within `md.techniques`
        index: usize,
        /// The absent key
        key: &'static str,
    },
}

fn into_object(kind: &'static str, body: Value) -> Result<Map<String, Value>, DocumentError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(DocumentError::NotAMapping { kind }),
    }
}

fn required_str(
    kind: &'static str,
    map: &Map<String, Value>,
    key: &'static str,
) -> Result<String, DocumentError> {
    match map.get(key) {
        None => Err(DocumentError::MissingKey { kind, key }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DocumentError::InvalidValue {
            kind,
            key: key.to_string(),
        }),
    }
}

/// The run-start document: run identity plus arbitrary plan metadata
#[derive(Debug, Clone)]
pub struct StartDoc {
    /// Unique run identifier
    pub uid: String,
    /// Complete document mapping
    pub raw: Map<String, Value>,
}

/// A named, versioned technique descriptor from the start document
///
/// The payload is a NeXus mini-schema mapping, materialized over the raw
/// tree at stop time.
#[derive(Debug, Clone)]
pub struct TechniqueBlock {
    /// Technique name (e.g. "SAXS")
    pub technique: String,
    /// Schema version of the payload (mandatory, shape unspecified)
    pub version: Value,
    /// The NeXus mini-schema payload
    pub payload: Map<String, Value>,
}

impl StartDoc {
    fn from_value(body: Value) -> Result<Self, DocumentError> {
        let raw = into_object("start", body)?;
        let uid = required_str("start", &raw, "uid")?;
        Ok(Self { uid, raw })
    }

    /// Technique blocks declared under `md.techniques`
    ///
    /// Absence of `md` or `techniques` is not an error; a present block
    /// missing `technique`, `version`, or its `nxsas` payload is.
    pub fn techniques(&self) -> Result<Vec<TechniqueBlock>, DocumentError> {
        let blocks = match self.raw.get("md").and_then(|md| md.get("techniques")) {
            None => return Ok(Vec::new()),
            Some(Value::Array(blocks)) => blocks,
            Some(_) => {
                return Err(DocumentError::InvalidValue {
                    kind: "start",
                    key: "md.techniques".to_string(),
                })
            }
        };
        let mut result = Vec::with_capacity(blocks.len());
        for (index, block) in blocks.iter().enumerate() {
            let technique = block
                .get("technique")
                .and_then(Value::as_str)
                .ok_or(DocumentError::BadTechnique {
                    index,
                    key: "technique",
                })?
                .to_string();
            let version = block
                .get("version")
                .cloned()
                .ok_or(DocumentError::BadTechnique { index, key: "version" })?;
            let payload = match block.get("nxsas") {
                Some(Value::Object(map)) => map.clone(),
                _ => return Err(DocumentError::BadTechnique { index, key: "nxsas" }),
            };
            result.push(TechniqueBlock {
                technique,
                version,
                payload,
            });
        }
        Ok(result)
    }
}

/// A stream descriptor: stream identity plus per-field schema entries
#[derive(Debug, Clone)]
pub struct DescriptorDoc {
    /// Descriptor identifier, referenced by event pages
    pub uid: String,
    /// Stream name, unique within a run
    pub name: String,
    /// Schema entry per declared field
    pub data_keys: HashMap<String, DataKeySpec>,
    /// Complete document mapping
    pub raw: Map<String, Value>,
}

impl DescriptorDoc {
    fn from_value(body: Value) -> Result<Self, DocumentError> {
        let raw = into_object("descriptor", body)?;
        let uid = required_str("descriptor", &raw, "uid")?;
        let name = required_str("descriptor", &raw, "name")?;
        let data_keys_value = raw.get("data_keys").ok_or(DocumentError::MissingKey {
            kind: "descriptor",
            key: "data_keys",
        })?;
        let Value::Object(entries) = data_keys_value else {
            return Err(DocumentError::InvalidValue {
                kind: "descriptor",
                key: "data_keys".to_string(),
            });
        };
        let mut data_keys = HashMap::with_capacity(entries.len());
        for (field, entry) in entries {
            let spec: DataKeySpec =
                serde_json::from_value(entry.clone()).map_err(|source| DocumentError::BadDataKey {
                    field: field.clone(),
                    source,
                })?;
            data_keys.insert(field.clone(), spec);
        }
        Ok(Self {
            uid,
            name,
            data_keys,
            raw,
        })
    }
}

/// A field-major batch of events for one stream
#[derive(Debug, Clone)]
pub struct EventPageDoc {
    /// Uid of the descriptor this page belongs to
    pub descriptor: String,
    /// Per-field value columns, in document order; one entry per event
    pub data: Vec<(String, Vec<Value>)>,
    /// Per-field timestamp columns, seconds since the epoch
    pub timestamps: HashMap<String, Vec<f64>>,
    /// Per-field fill flags; anything other than `true` means unfilled
    pub filled: HashMap<String, Vec<Value>>,
    /// Complete document mapping
    pub raw: Map<String, Value>,
}

impl EventPageDoc {
    fn from_value(body: Value) -> Result<Self, DocumentError> {
        let raw = into_object("event_page", body)?;
        let descriptor = required_str("event_page", &raw, "descriptor")?;

        let data = Self::value_columns(&raw, "data")?;
        let timestamp_columns = Self::value_columns(&raw, "timestamps")?;
        let mut timestamps = HashMap::with_capacity(timestamp_columns.len());
        for (field, column) in timestamp_columns {
            let mut parsed = Vec::with_capacity(column.len());
            for v in &column {
                let t = v.as_f64().ok_or_else(|| DocumentError::InvalidValue {
                    kind: "event_page",
                    key: format!("timestamps.{field}"),
                })?;
                parsed.push(t);
            }
            timestamps.insert(field, parsed);
        }

        let mut filled = HashMap::new();
        if let Some(value) = raw.get("filled") {
            let Value::Object(entries) = value else {
                return Err(DocumentError::InvalidValue {
                    kind: "event_page",
                    key: "filled".to_string(),
                });
            };
            for (field, flags) in entries {
                let Value::Array(flags) = flags else {
                    return Err(DocumentError::InvalidValue {
                        kind: "event_page",
                        key: format!("filled.{field}"),
                    });
                };
                filled.insert(field.clone(), flags.clone());
            }
        }

        let page = Self {
            descriptor,
            data,
            timestamps,
            filled,
            raw,
        };
        page.check_column_lengths()?;
        Ok(page)
    }

    /// Normalize a single `event` document into a one-event page
    fn from_event(body: Value) -> Result<Self, DocumentError> {
        let raw = into_object("event", body)?;
        let mut page = raw.clone();
        for key in ["data", "timestamps", "filled"] {
            let Some(Value::Object(columns)) = raw.get(key) else {
                continue;
            };
            let mut wrapped = Map::with_capacity(columns.len());
            for (field, value) in columns {
                wrapped.insert(field.clone(), Value::Array(vec![value.clone()]));
            }
            page.insert(key.to_string(), Value::Object(wrapped));
        }
        if let Some(seq_num) = raw.get("seq_num") {
            page.insert("seq_num".to_string(), Value::Array(vec![seq_num.clone()]));
        }
        Self::from_value(Value::Object(page))
    }

    fn value_columns(
        raw: &Map<String, Value>,
        key: &'static str,
    ) -> Result<Vec<(String, Vec<Value>)>, DocumentError> {
        let value = raw.get(key).ok_or(DocumentError::MissingKey {
            kind: "event_page",
            key,
        })?;
        let Value::Object(columns) = value else {
            return Err(DocumentError::InvalidValue {
                kind: "event_page",
                key: key.to_string(),
            });
        };
        let mut result = Vec::with_capacity(columns.len());
        for (field, column) in columns {
            let Value::Array(items) = column else {
                return Err(DocumentError::InvalidValue {
                    kind: "event_page",
                    key: format!("{key}.{field}"),
                });
            };
            result.push((field.clone(), items.clone()));
        }
        Ok(result)
    }

    fn check_column_lengths(&self) -> Result<(), DocumentError> {
        let events = self.events();
        for (field, column) in &self.data {
            if column.len() != events {
                return Err(DocumentError::ColumnLengthMismatch {
                    field: field.clone(),
                });
            }
            let ts_len = self
                .timestamps
                .get(field)
                .map(Vec::len)
                .ok_or_else(|| DocumentError::ColumnLengthMismatch {
                    field: field.clone(),
                })?;
            if ts_len != column.len() {
                return Err(DocumentError::ColumnLengthMismatch {
                    field: field.clone(),
                });
            }
            if let Some(flags) = self.filled.get(field) {
                if flags.len() != column.len() {
                    return Err(DocumentError::ColumnLengthMismatch {
                        field: field.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of events carried by this page
    pub fn events(&self) -> usize {
        self.data.first().map(|(_, column)| column.len()).unwrap_or(0)
    }

    /// Fields whose fill flags are anything other than `true`
    ///
    /// An unfilled entry is either `false` or an unresolved datum
    /// reference; both mean the field's data is not materialized.
    pub fn unfilled_fields(&self) -> Vec<String> {
        let mut unfilled: Vec<String> = self
            .filled
            .iter()
            .filter(|(_, flags)| flags.iter().any(|flag| flag != &Value::Bool(true)))
            .map(|(field, _)| field.clone())
            .collect();
        unfilled.sort();
        unfilled
    }
}

/// The run-stop document
#[derive(Debug, Clone)]
pub struct StopDoc {
    /// Complete document mapping
    pub raw: Map<String, Value>,
}

impl StopDoc {
    fn from_value(body: Value) -> Result<Self, DocumentError> {
        Ok(Self {
            raw: into_object("stop", body)?,
        })
    }
}

/// A fully dispatched bluesky document
#[derive(Debug, Clone)]
pub enum Document {
    /// Run start: metadata and run identity
    Start(StartDoc),
    /// Stream declaration with per-field schema entries
    Descriptor(DescriptorDoc),
    /// Batch of event data for one stream
    EventPage(EventPageDoc),
    /// Run stop: exit status and summary metadata
    Stop(StopDoc),
}

impl Document {
    /// Dispatch a `(kind, body)` pair into the document model
    ///
    /// `event` is accepted and normalized to a single-event page.
    pub fn from_name_and_json(kind: &str, body: Value) -> Result<Self, DocumentError> {
        match kind {
            "start" => Ok(Document::Start(StartDoc::from_value(body)?)),
            "descriptor" => Ok(Document::Descriptor(DescriptorDoc::from_value(body)?)),
            "event_page" => Ok(Document::EventPage(EventPageDoc::from_value(body)?)),
            "event" => Ok(Document::EventPage(EventPageDoc::from_event(body)?)),
            "stop" => Ok(Document::Stop(StopDoc::from_value(body)?)),
            other => Err(DocumentError::UnknownKind(other.to_string())),
        }
    }

    /// Document kind, as named by the upstream stream
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::EventPage(_) => "event_page",
            Document::Stop(_) => "stop",
        }
    }
}
