//! Schema-aware payload encoding.
//!
//! Encoded payloads carry their schema id in the content type (`application/json+<id>`), so a
//! receiver can decode without knowing the schema up front.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::record::Record;

pub const JSON_CONTENT_TYPE_PREFIX: &str = "application/json+";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Null => value.is_null(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Int => value.as_i64().is_some_and(|v| i32::try_from(v).is_ok()),
            FieldType::Long => value.is_i64() || value.is_u64(),
            FieldType::Float | FieldType::Double => value.is_number(),
            FieldType::String => value.is_string(),
        }
    }
}

/// Either a single type or a union such as `["null", "string"]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSchema {
    Single(FieldType),
    Union(Vec<FieldType>),
}

impl FieldSchema {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldSchema::Single(t) => t.accepts(value),
            FieldSchema::Union(types) => types.iter().any(|t| t.accepts(value)),
        }
    }

    fn is_nullable(&self) -> bool {
        self.accepts(&Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub schema: FieldSchema,
}

/// A record schema in the familiar `{"type": "record", "name": ..., "fields": [...]}` shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    #[serde(rename = "type", default = "record_type")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub fields: Vec<FieldDescriptor>,
}

fn record_type() -> String {
    "record".to_owned()
}

impl SchemaDescriptor {
    pub fn parse(definition: &str) -> Result<Self> {
        let schema: SchemaDescriptor = serde_json::from_str(definition)
            .map_err(|e| Error::encoding(format!("invalid schema definition: {e}")))?;
        if schema.kind != "record" {
            return Err(Error::encoding(format!(
                "unsupported schema type {}",
                schema.kind
            )));
        }
        Ok(schema)
    }

    pub fn full_name(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}.{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Check that `value` is an object matching every declared field.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let Some(object) = value.as_object() else {
            return Err(Error::encoding(format!(
                "{} expects an object, got {value}",
                self.full_name()
            )));
        };
        for field in &self.fields {
            match object.get(&field.name) {
                Some(v) if field.schema.accepts(v) => {}
                None if field.schema.is_nullable() => {}
                Some(v) => {
                    return Err(Error::encoding(format!(
                        "field {} of {} does not accept {v}",
                        field.name,
                        self.full_name()
                    )))
                }
                None => {
                    return Err(Error::encoding(format!(
                        "field {} of {} is missing",
                        field.name,
                        self.full_name()
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Payload ready to be put on a [`Record`].
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedPayload {
    pub bytes: Bytes,
    pub content_type: String,
}

impl EncodedPayload {
    pub fn into_record(self) -> Record {
        Record::new(self.bytes).with_content_type(self.content_type)
    }
}

#[async_trait]
pub trait SchemaEncoder: Send + Sync {
    async fn encode(&self, value: &Value, schema: &SchemaDescriptor) -> Result<EncodedPayload>;

    async fn decode(&self, bytes: &[u8], content_type: &str) -> Result<Value>;
}

/// Schemas registered for one schema group.
///
/// Registration is idempotent: registering a schema already known by its full name and
/// definition returns the id it got the first time.
pub struct SchemaCatalog {
    group: String,
    schemas: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, SchemaDescriptor>,
    ids: HashMap<String, String>,
}

impl SchemaCatalog {
    pub fn new(group: &str) -> Self {
        Self {
            group: group.to_owned(),
            schemas: Mutex::new(Registry::default()),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.schemas
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn register(&self, schema: &SchemaDescriptor) -> Result<String> {
        let definition = serde_json::to_string(schema)
            .map_err(|e| Error::encoding(format!("cannot serialize schema: {e}")))?;
        let mut registry = self.registry();
        if let Some(id) = registry.ids.get(&definition) {
            return Ok(id.clone());
        }

        let id = Uuid::now_v7().simple().to_string();
        tracing::info!(group = %self.group, schema = %schema.full_name(), id = %id, "registered schema");
        registry.ids.insert(definition, id.clone());
        registry.by_id.insert(id.clone(), schema.clone());
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<SchemaDescriptor> {
        self.registry().by_id.get(id).cloned()
    }
}

/// Encodes values as JSON after validating them against a registered schema.
#[derive(Clone)]
pub struct JsonSchemaEncoder {
    catalog: Arc<SchemaCatalog>,
}

impl JsonSchemaEncoder {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }
}

#[async_trait]
impl SchemaEncoder for JsonSchemaEncoder {
    async fn encode(&self, value: &Value, schema: &SchemaDescriptor) -> Result<EncodedPayload> {
        schema.validate(value)?;
        let id = self.catalog.register(schema)?;
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::encoding(format!("cannot serialize value: {e}")))?;
        Ok(EncodedPayload {
            bytes: Bytes::from(bytes),
            content_type: format!("{JSON_CONTENT_TYPE_PREFIX}{id}"),
        })
    }

    async fn decode(&self, bytes: &[u8], content_type: &str) -> Result<Value> {
        let Some(id) = content_type.strip_prefix(JSON_CONTENT_TYPE_PREFIX) else {
            return Err(Error::encoding(format!(
                "unsupported content type {content_type}"
            )));
        };
        let Some(schema) = self.catalog.get(id) else {
            return Err(Error::encoding(format!("unknown schema id {id}")));
        };
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::encoding(format!("payload is not valid JSON: {e}")))?;
        schema.validate(&value)?;
        Ok(value)
    }
}
