//! Entity metadata and record access.
//!
//! The query layer only needs a narrow view of entity metadata: field names
//! with their nullability, the queryable field list, primary keys and the
//! version field. Records expose their values by field name.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    /// Whether the field type can hold null.
    pub nullable: bool,
    /// Whether the field is selected by default.
    pub queryable: bool,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            queryable: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.queryable = false;
        self
    }
}

#[derive(Debug)]
struct EntityTypeInfo {
    name: String,
    fields: Vec<FieldInfo>,
    primary_keys: Vec<String>,
    version_field: Option<String>,
}

/// Shared handle to an entity's metadata. Cheap to clone; two handles are
/// equal when they describe the same entity name.
#[derive(Debug, Clone)]
pub struct EntityType(Arc<EntityTypeInfo>);

impl EntityType {
    pub fn builder(name: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder {
            info: EntityTypeInfo {
                name: name.into(),
                fields: Vec::new(),
                primary_keys: Vec::new(),
                version_field: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.0.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.0.fields.iter().find(|field| field.name == name)
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.0.primary_keys
    }

    pub fn version_field(&self) -> Option<&str> {
        self.0.version_field.as_deref()
    }

    /// Fields selected when a query does not list its own.
    pub fn query_fields(&self) -> Vec<&str> {
        self.0
            .fields
            .iter()
            .filter(|field| field.queryable)
            .map(|field| field.name.as_str())
            .collect()
    }

    /// Unknown fields are treated as nullable.
    pub fn is_nullable(&self, field: &str) -> bool {
        self.field(field).map_or(true, |info| info.nullable)
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.name == other.0.name
    }
}

impl Eq for EntityType {}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl Serialize for EntityType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.name)
    }
}

pub struct EntityTypeBuilder {
    info: EntityTypeInfo,
}

impl EntityTypeBuilder {
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.info.fields.push(field);
        self
    }

    /// Adds a non-nullable field and marks it as a primary key.
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.info.fields.push(FieldInfo::new(name.clone()).required());
        self.info.primary_keys.push(name);
        self
    }

    pub fn version_field(mut self, name: impl Into<String>) -> Self {
        self.info.version_field = Some(name.into());
        self
    }

    pub fn build(self) -> EntityType {
        EntityType(Arc::new(self.info))
    }
}

/// Read access to a record's field values by name.
pub trait Record {
    /// `None` when the record has no such field.
    fn field(&self, name: &str) -> Option<Value>;
}

/// A record type with static metadata.
pub trait Entity: Record + 'static {
    fn entity_type() -> EntityType;
}

/// Schemaless record backed by a sorted map, e.g. a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(BTreeMap<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

impl Record for Document {
    fn field(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Map(self.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_type() -> EntityType {
        EntityType::builder("User")
            .primary_key("Id")
            .field(FieldInfo::new("Name"))
            .field(FieldInfo::new("Age").required())
            .field(FieldInfo::new("Password").hidden())
            .version_field("Version")
            .build()
    }

    #[test]
    fn test_entity_metadata() {
        let user = user_type();
        assert_eq!(user.name(), "User");
        assert_eq!(user.primary_keys(), ["Id".to_string()]);
        assert_eq!(user.query_fields(), vec!["Id", "Name", "Age"]);
        assert_eq!(user.version_field(), Some("Version"));
        assert!(!user.is_nullable("Id"));
        assert!(!user.is_nullable("Age"));
        assert!(user.is_nullable("Name"));
        assert!(user.is_nullable("Unknown"));
    }

    #[test]
    fn test_entity_type_equality_by_name() {
        assert_eq!(user_type(), user_type());
        assert_ne!(user_type(), EntityType::builder("Role").build());
    }

    #[test]
    fn test_document_from_json() {
        let doc: Document = serde_json::from_str(r#"{"Id": 1, "Name": null}"#).unwrap();
        assert_eq!(doc.field("Id"), Some(Value::Int(1)));
        assert_eq!(doc.field("Name"), Some(Value::Null));
        assert_eq!(doc.field("Age"), None);
    }
}
