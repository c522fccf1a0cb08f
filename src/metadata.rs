//! # Metadata Tree Writer
//!
//! Mirrors an arbitrary document mapping into the container as nested
//! groups of named leaf datasets: one group per nested mapping, one leaf
//! per scalar or flat list.
//!
//! Value handling quirks inherited from the instruments upstream:
//!
//! - `null` is recorded as the literal string `"None"`.
//! - A value that is a single NUL byte becomes an empty string; the
//!   substrate's variable-length strings cannot hold embedded NULs.
//! - Strings and homogeneous string lists always use the explicit string
//!   element type, so fixed- versus variable-length ambiguity never
//!   misencodes them.
//! - A value too complex for a typed dataset (ragged or mixed-type
//!   nesting, e.g. plan hints like `[[["time"], "primary"]]`) degrades to
//!   its JSON text in a string leaf, with a warning.

use serde_json::{Map, Value};

use crate::container::{Container, ContainerError, Dataset};

/// Errors raised while mirroring metadata into the container
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The storage substrate rejected a write
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

/// Build the leaf dataset for a single metadata value
///
/// Values the substrate cannot hold directly degrade to a JSON-encoded
/// string leaf (warned, not surfaced as an error).
pub fn dataset_for_value(value: &Value) -> Dataset {
    match value {
        Value::Null => Dataset::scalar_str("None"),
        Value::String(s) if s == "\u{0}" => Dataset::scalar_str(""),
        Value::String(s) => Dataset::scalar_str(s.clone()),
        Value::Bool(b) => Dataset::scalar_bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dataset::scalar_i64(i)
            } else {
                Dataset::scalar_f64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::Array(items) => {
            if items.iter().all(Value::is_string) {
                let strings = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                Dataset::str_vec(strings)
            } else if items.iter().all(Value::is_boolean) {
                let bools = items.iter().filter_map(Value::as_bool).collect();
                Dataset::bool_vec(bools)
            } else if items.iter().all(|v| v.as_i64().is_some()) {
                let ints = items.iter().filter_map(Value::as_i64).collect();
                Dataset::i64_vec(ints)
            } else if items.iter().all(Value::is_number) {
                let floats = items.iter().filter_map(Value::as_f64).collect();
                Dataset::f64_vec(floats)
            } else {
                log::warn!("value too complex for a typed dataset, storing JSON: {value}");
                Dataset::scalar_str(value.to_string())
            }
        }
        Value::Object(_) => {
            // Mappings are handled structurally by the caller; one reaching
            // this point is inside a list and degrades like any other
            // too-complex value.
            log::warn!("value too complex for a typed dataset, storing JSON: {value}");
            Dataset::scalar_str(value.to_string())
        }
    }
}

/// Recursively mirror `mapping` into the container under `group_path`
///
/// Nested mappings become nested groups; every other value becomes a leaf
/// dataset via [`dataset_for_value`]. Substrate failures are logged with
/// the offending key and parent location, then propagated.
pub fn copy_metadata_to_datasets(
    mapping: &Map<String, Value>,
    container: &mut Container,
    group_path: &str,
) -> Result<(), MetadataError> {
    for (key, value) in mapping {
        let child_path = format!("{group_path}/{key}");
        match value {
            Value::Object(nested) => {
                if let Err(e) = container.create_group(&child_path) {
                    log::error!("failed to create metadata group '{key}' under '{group_path}': {e}");
                    return Err(e.into());
                }
                copy_metadata_to_datasets(nested, container, &child_path)?;
            }
            other => {
                let dataset = dataset_for_value(other);
                log::debug!(
                    "writing metadata leaf '{}' ({} shape {:?})",
                    child_path,
                    dataset.dtype,
                    dataset.shape
                );
                if let Err(e) = container.put_dataset(&child_path, dataset) {
                    log::error!("failed to write metadata key '{key}' under '{group_path}': {e}");
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}
