//! Metric records emitted by collectors and receivers
//!
//! A [`MetricRecord`] is the single unit handed to the downstream sink. Its
//! identity is the name, the tag set and the timestamp; `meta` only carries
//! provenance and never takes part in identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::mpsc::{SendError, SyncSender};

/// Timestamp type for consistent time handling across the crate
pub type Timestamp = DateTime<Utc>;

/// Name of the field every record carries
pub const VALUE_FIELD: &str = "value";

/// A single field value: numeric readings or free-form strings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Str(String),
}

impl FieldValue {
    /// Numeric view of the value, `None` for strings
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

/// Immutable, timestamped metric sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RecordFields")]
pub struct MetricRecord {
    name: String,
    tags: BTreeMap<String, String>,
    meta: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Timestamp,
}

/// Wire shape of a record before the `value` field is checked
#[derive(Deserialize)]
struct RecordFields {
    name: String,
    tags: BTreeMap<String, String>,
    meta: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Timestamp,
}

impl TryFrom<RecordFields> for MetricRecord {
    type Error = String;

    fn try_from(raw: RecordFields) -> Result<Self, Self::Error> {
        if !raw.fields.contains_key(VALUE_FIELD) {
            return Err(format!("record '{}' has no '{}' field", raw.name, VALUE_FIELD));
        }
        Ok(Self {
            name: raw.name,
            tags: raw.tags,
            meta: raw.meta,
            fields: raw.fields,
            timestamp: raw.timestamp,
        })
    }
}

impl MetricRecord {
    /// Create a record stamped with the current time
    ///
    /// The `value` field is always present, which keeps the field set
    /// non-empty.
    pub fn new(
        name: impl Into<String>,
        tags: &BTreeMap<String, String>,
        meta: &BTreeMap<String, String>,
        value: impl Into<FieldValue>,
    ) -> Self {
        Self::with_timestamp(name, tags, meta, value, Utc::now())
    }

    pub fn with_timestamp(
        name: impl Into<String>,
        tags: &BTreeMap<String, String>,
        meta: &BTreeMap<String, String>,
        value: impl Into<FieldValue>,
        timestamp: Timestamp,
    ) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(VALUE_FIELD.to_string(), value.into());
        Self {
            name: name.into(),
            tags: tags.clone(),
            meta: meta.clone(),
            fields,
            timestamp,
        }
    }

    /// Attach an additional field, keeping `value` untouched
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let key = key.into();
        if key != VALUE_FIELD {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// The mandatory `value` field
    pub fn value(&self) -> &FieldValue {
        // Constructors and deserialization both guarantee VALUE_FIELD
        &self.fields[VALUE_FIELD]
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Push a record into the bounded output channel
///
/// Blocks while the channel is full. Only fails when the consumer side has
/// been dropped.
pub fn emit(
    output: &SyncSender<MetricRecord>,
    record: MetricRecord,
) -> Result<(), SendError<MetricRecord>> {
    output.send(record)
}

/// Build a string map from literal pairs
pub fn string_map<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
