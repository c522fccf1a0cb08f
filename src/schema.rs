//! # Data-Key Schema Module
//!
//! Descriptor documents declare, per field, a storage-type category and a
//! shape. Both are hints: actual storage is typed and shaped from the first
//! observed batch, checked against the declaration.
//!
//! Two reconciliation concerns live here:
//!
//! 1. **Dtype resolution**: the closed category vocabulary
//!    (`string` / `number` / `integer` / `array`) maps to a concrete element
//!    type, with `array` deferring to the sample value actually received.
//!
//! 2. **Shape reconciliation**: the device-description service and the
//!    detector service disagree systematically about axis order. A declared
//!    shape whose meaningful axes are the exact reverse of the observed
//!    sample shape is corrected in place (once, before storage creation);
//!    any other disagreement is fatal.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::container::ElementType;

/// Errors raised while interpreting a field's schema entry
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The declared dtype category is outside the closed vocabulary
    #[error("unknown field type '{dtype}' declared for field '{field}'")]
    UnknownFieldType {
        /// Field whose schema entry is invalid
        field: String,
        /// The offending dtype string
        dtype: String,
    },

    /// Declared and observed shapes agree neither directly nor reversed
    #[error(
        "irreconcilable shapes for field '{field}': descriptor declares {declared:?}, \
         event data has {observed:?}"
    )]
    IrreconcilableShape {
        /// Field whose shapes disagree
        field: String,
        /// Shape recorded in the descriptor
        declared: Vec<i64>,
        /// Shape of the first observed sample, without the event axis
        observed: Vec<usize>,
    },

    /// A field declared `array` arrived with a non-array sample
    #[error("field '{field}' is declared 'array' but its sample value is not an array")]
    NotAnArray {
        /// The offending field
        field: String,
    },

    /// Sample elements are mixed, empty, or not storable
    #[error("field '{field}' holds values of mixed or unsupported element types")]
    UnsupportedElement {
        /// The offending field
        field: String,
    },
}

/// The closed vocabulary of declared storage-type categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Native string storage
    String,
    /// 8-byte float storage
    Number,
    /// 4-byte signed integer storage
    Integer,
    /// Element type taken from the observed sample array
    Array,
}

impl FieldType {
    /// Parse a declared dtype string, naming the offending field on failure
    pub fn parse(field: &str, dtype: &str) -> Result<Self, SchemaError> {
        match dtype {
            "string" => Ok(FieldType::String),
            "number" => Ok(FieldType::Number),
            "integer" => Ok(FieldType::Integer),
            "array" => Ok(FieldType::Array),
            other => Err(SchemaError::UnknownFieldType {
                field: field.to_string(),
                dtype: other.to_string(),
            }),
        }
    }
}

/// One field's schema entry from a descriptor's `data_keys` mapping
///
/// Only `dtype` and `shape` drive storage decisions; everything else is
/// descriptive metadata carried through to the container verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct DataKeySpec {
    /// Declared storage-type category
    pub dtype: String,

    /// Declared shape; empty for scalars, last entry conventionally a
    /// placeholder for array fields
    #[serde(default)]
    pub shape: Vec<i64>,

    /// Upstream source identifier (EPICS PV, ophyd signal, ...)
    #[serde(default)]
    pub source: Option<String>,

    /// Remaining descriptive entries (units, limits, object_name, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DataKeySpec {
    /// The declared category, parsed against the closed vocabulary
    pub fn field_type(&self, field: &str) -> Result<FieldType, SchemaError> {
        FieldType::parse(field, &self.dtype)
    }
}

/// Map a declared category plus an observed sample to an element type
///
/// `string` / `number` / `integer` resolve unconditionally; `array` takes
/// the element type of the sample itself.
pub fn resolve_element_type(
    field: &str,
    field_type: FieldType,
    sample: &Value,
) -> Result<ElementType, SchemaError> {
    match field_type {
        FieldType::String => Ok(ElementType::Str),
        FieldType::Number => Ok(ElementType::F64),
        FieldType::Integer => Ok(ElementType::I32),
        FieldType::Array => {
            if !sample.is_array() {
                return Err(SchemaError::NotAnArray {
                    field: field.to_string(),
                });
            }
            infer_element_type(field, sample)
        }
    }
}

/// Infer the element type of a (possibly nested) sample value
///
/// All leaves must agree: booleans, strings, or numbers (any float leaf
/// promotes the whole array to 8-byte float, otherwise 8-byte integer).
pub fn infer_element_type(field: &str, sample: &Value) -> Result<ElementType, SchemaError> {
    #[derive(PartialEq)]
    enum Leaf {
        Int,
        Float,
        Str,
        Bool,
    }

    fn walk(value: &Value, seen: &mut Vec<Leaf>) -> bool {
        match value {
            Value::Array(items) => items.iter().all(|v| walk(v, seen)),
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    seen.push(Leaf::Int);
                } else {
                    seen.push(Leaf::Float);
                }
                true
            }
            Value::String(_) => {
                seen.push(Leaf::Str);
                true
            }
            Value::Bool(_) => {
                seen.push(Leaf::Bool);
                true
            }
            _ => false,
        }
    }

    let mut seen = Vec::new();
    if !walk(sample, &mut seen) || seen.is_empty() {
        return Err(SchemaError::UnsupportedElement {
            field: field.to_string(),
        });
    }
    let all = |leaf: Leaf| seen.iter().all(|l| *l == leaf);
    if all(Leaf::Bool) {
        Ok(ElementType::Bool)
    } else if all(Leaf::Str) {
        Ok(ElementType::Str)
    } else if all(Leaf::Int) {
        Ok(ElementType::I64)
    } else if seen.iter().all(|l| *l == Leaf::Int || *l == Leaf::Float) {
        Ok(ElementType::F64)
    } else {
        Err(SchemaError::UnsupportedElement {
            field: field.to_string(),
        })
    }
}

/// Declared axes with the placeholder entry stripped
///
/// Detector-service shapes carry a trailing `0` placeholder; a shape already
/// corrected to storage order carries it leading instead.
fn meaningful_axes(declared: &[i64]) -> &[i64] {
    let mut axes = declared;
    if axes.first() == Some(&0) {
        axes = &axes[1..];
    }
    if axes.last() == Some(&0) {
        axes = &axes[..axes.len() - 1];
    }
    axes
}

/// Reconcile a field's declared shape against its first observed sample
///
/// Returns `Ok(None)` when the declaration already matches, or
/// `Ok(Some(corrected))` when the meaningful axes are the exact reverse of
/// the observed shape — the known axis-order disagreement between the two
/// upstream metadata producers. The corrected shape is the reverse of the
/// whole declared sequence and must replace the stored schema entry before
/// the field's storage is created. Any other disagreement is fatal.
pub fn reconcile_field_shape(
    field: &str,
    declared: &[i64],
    observed: &[usize],
) -> Result<Option<Vec<i64>>, SchemaError> {
    let axes = meaningful_axes(declared);
    let matches_observed = |axes: &[i64]| {
        axes.len() == observed.len() && axes.iter().zip(observed).all(|(a, o)| *a == *o as i64)
    };

    if matches_observed(axes) {
        log::debug!("field '{}': declared shape {:?} matches event data", field, declared);
        return Ok(None);
    }

    let reversed: Vec<i64> = axes.iter().rev().copied().collect();
    if matches_observed(&reversed) {
        let corrected: Vec<i64> = declared.iter().rev().copied().collect();
        log::warn!(
            "field '{}': declared shape {:?} is axis-reversed relative to event data {:?}; \
             correcting stored shape to {:?}",
            field,
            declared,
            observed,
            corrected
        );
        return Ok(Some(corrected));
    }

    Err(SchemaError::IrreconcilableShape {
        field: field.to_string(),
        declared: declared.to_vec(),
        observed: observed.to_vec(),
    })
}
