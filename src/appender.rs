//! # Streaming Dataset Appender
//!
//! Owns the lifecycle of every per-field value array and its parallel
//! timestamp array: lazy creation on first data, then strictly append-only
//! growth, one whole batch at a time.
//!
//! Field storage is an arena keyed by `(stream, field)`. Declaring a
//! stream registers each field in an explicit *uncreated* state; the first
//! event page carrying the field resolves its element type (consulting the
//! schema entry and, for arrays, the shape reconciler) and sizes storage
//! from the batch itself. Later pages may only grow the arrays by exactly
//! their event count — the value sequence and the timestamp sequence have
//! equal length after every successful append.

use std::collections::HashMap;

use serde_json::Value;

use crate::container::{Container, ContainerError, DataBuf, Dataset, ElementType};
use crate::document::EventPageDoc;
use crate::schema::{
    reconcile_field_shape, resolve_element_type, DataKeySpec, FieldType, SchemaError,
};

/// Name of the top-level group holding raw document data
pub const BLUESKY_GROUP: &str = "bluesky";

/// Container path of a field's value storage
pub fn data_path(stream: &str, field: &str) -> String {
    format!("{BLUESKY_GROUP}/events/{stream}/data/{field}")
}

/// Container path of a field's timestamp storage
pub fn timestamps_path(stream: &str, field: &str) -> String {
    format!("{BLUESKY_GROUP}/events/{stream}/timestamps/{field}")
}

/// Container path of a field's declared-shape dataset in its descriptor
pub fn data_key_shape_path(stream: &str, field: &str) -> String {
    format!("{BLUESKY_GROUP}/descriptors/{stream}/data_keys/{field}/shape")
}

/// Errors raised while appending event data
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// Schema entry could not be applied to the observed data
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The storage substrate rejected an operation
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// The page marks fields as not filled
    #[error("event_page for stream '{stream}' has unfilled fields: {fields:?}")]
    UnfilledField {
        /// Stream the page belongs to
        stream: String,
        /// The unfilled fields
        fields: Vec<String>,
    },

    /// The page names a field its descriptor never declared
    #[error("field '{field}' in stream '{stream}' was not declared by the descriptor")]
    UndeclaredField {
        /// Stream the page belongs to
        stream: String,
        /// The undeclared field
        field: String,
    },

    /// An event's value disagrees with the established per-event shape
    #[error("field '{field}': event shape {got:?} does not match storage shape {expected:?}")]
    EventShapeMismatch {
        /// The offending field
        field: String,
        /// Per-event shape of the existing storage
        expected: Vec<usize>,
        /// Shape of the offending value
        got: Vec<usize>,
    },

    /// An event's value cannot be coerced to the established element type
    #[error("field '{field}': value cannot be stored as {expected}")]
    TypeMismatch {
        /// The offending field
        field: String,
        /// Element type of the existing storage
        expected: ElementType,
    },
}

/// Per-field storage lifecycle state
#[derive(Debug, Clone)]
enum FieldState {
    /// Declared by a descriptor; no data seen yet
    Uncreated,
    /// Storage exists with `rows` events written
    Created {
        dtype: ElementType,
        row_shape: Vec<usize>,
        rows: usize,
    },
}

/// Arena of per-`(stream, field)` storage states for one run
#[derive(Debug, Default)]
pub struct StreamingDatasetAppender {
    states: HashMap<(String, String), FieldState>,
}

impl StreamingDatasetAppender {
    /// New appender with no streams declared
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every field of a newly declared stream as uncreated
    pub fn declare_stream<'a>(&mut self, stream: &str, fields: impl Iterator<Item = &'a String>) {
        for field in fields {
            self.states
                .insert((stream.to_string(), field.clone()), FieldState::Uncreated);
        }
    }

    /// Rows written so far for a field, if its storage exists
    pub fn rows(&self, stream: &str, field: &str) -> Option<usize> {
        match self.states.get(&(stream.to_string(), field.to_string()))? {
            FieldState::Uncreated => None,
            FieldState::Created { rows, .. } => Some(*rows),
        }
    }

    /// Append one event page's worth of data for `stream`
    ///
    /// Fails before any storage mutation if the page carries unfilled
    /// fields. For each field, creates storage on first sight (resolving
    /// dtype and reconciling shape — a corrected shape is written back to
    /// `data_keys` both in memory and in the container) and appends exactly
    /// the page's event count to the value and timestamp arrays.
    pub fn append_page(
        &mut self,
        container: &mut Container,
        stream: &str,
        page: &EventPageDoc,
        data_keys: &mut HashMap<String, DataKeySpec>,
    ) -> Result<(), AppendError> {
        let unfilled = page.unfilled_fields();
        if !unfilled.is_empty() {
            return Err(AppendError::UnfilledField {
                stream: stream.to_string(),
                fields: unfilled,
            });
        }
        if page.events() == 0 {
            log::debug!("empty event_page for stream '{stream}', nothing to append");
            return Ok(());
        }

        for (field, column) in &page.data {
            let spec = data_keys
                .get_mut(field)
                .ok_or_else(|| AppendError::UndeclaredField {
                    stream: stream.to_string(),
                    field: field.clone(),
                })?;
            // Timestamp columns are validated against data columns at
            // document-parse time, so this lookup cannot miss.
            let timestamps = page
                .timestamps
                .get(field)
                .ok_or_else(|| AppendError::UndeclaredField {
                    stream: stream.to_string(),
                    field: field.clone(),
                })?;

            let state_key = (stream.to_string(), field.clone());
            if !self.states.contains_key(&state_key) {
                return Err(AppendError::UndeclaredField {
                    stream: stream.to_string(),
                    field: field.clone(),
                });
            }

            if matches!(self.states[&state_key], FieldState::Uncreated) {
                let (dtype, row_shape) =
                    self.create_field_storage(container, stream, field, spec, &column[0])?;
                self.states.insert(
                    state_key.clone(),
                    FieldState::Created {
                        dtype,
                        row_shape,
                        rows: 0,
                    },
                );
            }

            let FieldState::Created { dtype, row_shape, rows } = &self.states[&state_key] else {
                unreachable!("field storage created above");
            };
            let (dtype, row_shape, rows) = (*dtype, row_shape.clone(), *rows);

            let batch = flatten_column(field, column, dtype, &row_shape)?;
            let n = column.len();
            container.append_rows(&data_path(stream, field), batch, n)?;
            container.append_rows(
                &timestamps_path(stream, field),
                DataBuf::F64(timestamps.clone()),
                n,
            )?;

            self.states.insert(
                state_key,
                FieldState::Created {
                    dtype,
                    row_shape,
                    rows: rows + n,
                },
            );
            log::debug!(
                "appended {} event(s) to '{}' (now {} rows)",
                n,
                data_path(stream, field),
                rows + n
            );
        }
        Ok(())
    }

    /// First-sight storage creation for one field
    ///
    /// Resolves the element type from the schema entry and the sample, and
    /// the per-event shape from the sample itself. For array fields the
    /// declared shape is reconciled first; a correction rewrites the schema
    /// entry in memory and its already-mirrored `shape` dataset in the
    /// container, so storage derives from the corrected declaration.
    fn create_field_storage(
        &mut self,
        container: &mut Container,
        stream: &str,
        field: &str,
        spec: &mut DataKeySpec,
        sample: &Value,
    ) -> Result<(ElementType, Vec<usize>), AppendError> {
        let field_type = spec.field_type(field)?;
        let observed = value_shape(sample);

        if field_type == FieldType::Array {
            if let Some(corrected) = reconcile_field_shape(field, &spec.shape, &observed)? {
                let shape_path = data_key_shape_path(stream, field);
                if container.exists(&shape_path) {
                    container.replace_dataset(&shape_path, Dataset::i64_vec(corrected.clone()))?;
                } else {
                    log::debug!("no stored shape dataset at '{shape_path}' to correct");
                }
                spec.shape = corrected;
            }
        }

        let dtype = resolve_element_type(field, field_type, sample)?;
        log::debug!(
            "creating storage for '{}' as {} with per-event shape {:?}",
            data_path(stream, field),
            dtype,
            observed
        );
        container.put_dataset(&data_path(stream, field), Dataset::appendable(dtype, &observed))?;
        container.put_dataset(
            &timestamps_path(stream, field),
            Dataset::appendable(ElementType::F64, &[]),
        )?;
        Ok((dtype, observed))
    }
}

/// Nested-array dimensions of a value; empty for scalars
fn value_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut current = value;
    while let Value::Array(items) = current {
        shape.push(items.len());
        match items.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    shape
}

/// Flatten a whole column of per-event values into one typed batch
fn flatten_column(
    field: &str,
    column: &[Value],
    dtype: ElementType,
    row_shape: &[usize],
) -> Result<DataBuf, AppendError> {
    let mut batch = DataBuf::empty(dtype);
    for value in column {
        let got = value_shape(value);
        if got != row_shape {
            return Err(AppendError::EventShapeMismatch {
                field: field.to_string(),
                expected: row_shape.to_vec(),
                got,
            });
        }
        flatten_value(field, value, &mut batch)?;
    }
    Ok(batch)
}

fn flatten_value(field: &str, value: &Value, batch: &mut DataBuf) -> Result<(), AppendError> {
    if let Value::Array(items) = value {
        for item in items {
            flatten_value(field, item, batch)?;
        }
        return Ok(());
    }
    let expected = batch.element_type();
    let mismatch = || AppendError::TypeMismatch {
        field: field.to_string(),
        expected,
    };
    match batch {
        DataBuf::F64(buf) => buf.push(value.as_f64().ok_or_else(mismatch)?),
        DataBuf::I64(buf) => buf.push(value.as_i64().ok_or_else(mismatch)?),
        DataBuf::I32(buf) => {
            let wide = value.as_i64().ok_or_else(mismatch)?;
            let narrow = i32::try_from(wide).map_err(|_| mismatch())?;
            buf.push(narrow);
        }
        DataBuf::Bool(buf) => buf.push(value.as_bool().ok_or_else(mismatch)?),
        DataBuf::Str(buf) => buf.push(value.as_str().ok_or_else(mismatch)?.to_string()),
    }
    Ok(())
}
