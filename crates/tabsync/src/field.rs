//! Fields and instances
//!
//! A source's fields are ordered; that order is fixed when configuration is
//! loaded and every other part of the system (filters, projections, forwarded
//! rows) refers to fields by that position.

use serde::{Deserialize, Serialize};
use std::fmt;
use tabsync_rdbc::types::{Row, Value};

use crate::coerce::coerce;

/// Declared type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Categorical string, at most 255 characters
    Nominal,
    /// Free text
    Text,
    /// Floating point number
    Numeric,
    /// Boolean
    Logic,
    /// Point in time
    Date,
}

impl FieldType {
    /// Whether values of this type are stored as text
    #[inline]
    pub const fn is_textual(self) -> bool {
        matches!(self, Self::Nominal | Self::Text)
    }

    /// Wire name of the type
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Text => "text",
            Self::Numeric => "numeric",
            Self::Logic => "logic",
            Self::Date => "date",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed column of a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    /// Zero-based position within the source
    pub index: usize,
    /// Physical column name
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl Field {
    /// Create a new field
    pub fn new(index: usize, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            index,
            name: name.into(),
            field_type,
        }
    }
}

/// One row's values in field order
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    values: Vec<Value>,
}

impl Instance {
    /// Wrap already typed values
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Build an instance from a JSON object keyed by field name.
    ///
    /// Unknown keys are ignored, missing keys become null. Returns `None` if
    /// `object` is not a JSON object.
    pub fn from_wire(fields: &[Field], object: &serde_json::Value) -> Option<Self> {
        let map = object.as_object()?;
        let values = fields
            .iter()
            .map(|f| match map.get(&f.name) {
                Some(raw) => coerce(&Value::from(raw), f.field_type),
                None => Value::Null,
            })
            .collect();
        Some(Self { values })
    }

    /// Build an instance from a fetched row, matching columns by name
    pub fn from_row(fields: &[Field], row: &Row) -> Self {
        let values = fields
            .iter()
            .map(|f| match row.get_by_name(&f.name) {
                Some(v) => coerce(v, f.field_type),
                None => Value::Null,
            })
            .collect();
        Self { values }
    }

    /// Number of values
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the instance holds no values
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a field position
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// All values in field order
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the instance, keeping the values
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// JSON array of the values in field order
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.values.iter().map(Value::to_json).collect())
    }
}
