//! Typed custom fields.
//!
//! Tenants extend events with their own properties. Values are kept in a typed
//! map and checked against an explicit schema instead of an untyped bag.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Date(NaiveDate),
}

impl FieldValue {
    /// Convert a JSON value handed over by the API layer.
    /// Strings that parse as `YYYY-MM-DD` become dates.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(FieldValue::Integer),
            serde_json::Value::String(s) => Some(
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(FieldValue::Date)
                    .unwrap_or_else(|_| FieldValue::Text(s.clone())),
            ),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Date(_) => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text { max_len: Option<usize> },
    Integer { min: Option<i64>, max: Option<i64> },
    Boolean,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub key: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSchema {
    fn check(&self, value: &FieldValue) -> Result<(), String> {
        match (&self.kind, value) {
            (FieldKind::Text { max_len }, FieldValue::Text(s)) => match max_len {
                Some(max) if s.chars().count() > *max => {
                    Err(format!("{}: longer than {max} characters", self.key))
                }
                _ => Ok(()),
            },
            (FieldKind::Integer { min, max }, FieldValue::Integer(n)) => {
                if min.is_some_and(|lo| *n < lo) || max.is_some_and(|hi| *n > hi) {
                    Err(format!("{}: {n} out of bounds", self.key))
                } else {
                    Ok(())
                }
            }
            (FieldKind::Boolean, FieldValue::Boolean(_)) => Ok(()),
            (FieldKind::Date, FieldValue::Date(_)) => Ok(()),
            (kind, value) => Err(format!(
                "{}: expected {kind:?}, got {}",
                self.key,
                value.type_name()
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomFields(BTreeMap<String, FieldValue>);

impl CustomFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collect every problem rather than stopping at the first. Unknown keys are rejected.
    pub fn validate(&self, schema: &[FieldSchema]) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for field in schema {
            match self.0.get(&field.key) {
                Some(value) => {
                    if let Err(e) = field.check(value) {
                        errors.push(e);
                    }
                }
                None if field.required => errors.push(format!("{}: required", field.key)),
                None => {}
            }
        }
        for key in self.0.keys() {
            if !schema.iter().any(|f| &f.key == key) {
                errors.push(format!("{key}: not in schema"));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
