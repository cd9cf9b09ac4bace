use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type PartitionId = u32;

/// Frame bytes written for every record: body length (4), content type length (1),
/// property count (2).
pub const RECORD_FRAME_OVERHEAD: usize = 7;
/// Frame bytes written per property before key and value: key length (2), type tag (1).
pub const PROPERTY_FRAME_OVERHEAD: usize = 3;

/// Scalar value allowed in record user properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PropertyValue {
    fn encoded_len(&self) -> usize {
        match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) | PropertyValue::Float(_) => 8,
            PropertyValue::Str(s) => 4 + s.len(),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

/// An outbound record. Owned by the producer until the stream acknowledges it.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    body: Bytes,
    content_type: Option<String>,
    properties: BTreeMap<String, PropertyValue>,
}

impl Record {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Size of the record once framed for the wire, not just its body.
    pub fn encoded_len(&self) -> usize {
        let content_type = self.content_type.as_ref().map_or(0, |c| c.len());
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| PROPERTY_FRAME_OVERHEAD + k.len() + v.encoded_len())
            .sum();
        RECORD_FRAME_OVERHEAD + self.body.len() + content_type + properties
    }
}

/// A record as stored by the stream, with the position and time it was assigned on acceptance.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedRecord {
    pub partition: PartitionId,
    pub offset: u64,
    pub enqueued_at: OffsetDateTime,
    pub record: Record,
}

impl ReceivedRecord {
    pub fn body(&self) -> &Bytes {
        self.record.body()
    }

    pub fn body_as_str(&self) -> Option<&str> {
        self.record.body_as_str()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.record.content_type()
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.record.properties().get(key)
    }
}

/// Where a send should land.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PartitionTarget {
    /// Let the stream pick, round robin.
    #[default]
    Any,
    Id(PartitionId),
    /// Records sharing a key always land on the same partition.
    Key(String),
}
