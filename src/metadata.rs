//! The data platform's entity metadata contract (spec §6.2) and the
//! attribute-type → domain-type mapping (spec §4.1).

use std::collections::HashMap;

use crate::value::ValueType;

/// The wire-level attribute type reported by the metadata provider. Maps to
/// a nullable [`ValueType`] per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Integer,
    Money,
    Decimal,
    String,
    Memo,
    EntityName,
    Lookup,
    Customer,
    Owner,
    UniqueIdentifier,
    Picklist,
    State,
    Status,
    Boolean,
    DateTime,
    Double,
}

impl AttributeType {
    /// The nullable domain type this attribute type is read as (spec §4.1).
    pub fn value_type(self) -> ValueType {
        use AttributeType::*;
        match self {
            Integer => ValueType::Int,
            Money | Decimal => ValueType::Decimal,
            String | Memo | EntityName => ValueType::String,
            Lookup | Customer | Owner => ValueType::EntityRef,
            UniqueIdentifier => ValueType::Guid,
            Picklist | State | Status => ValueType::Int,
            Boolean => ValueType::Bool,
            DateTime => ValueType::Timestamp,
            Double => ValueType::Float,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttributeMetadata {
    pub logical_name: String,
    pub attribute_type: AttributeType,
    pub is_valid_for_read: bool,
}

#[derive(Debug, Clone)]
pub struct ManyToManyRelationship {
    pub schema_name: String,
    pub e1_intersect_attr: String,
    pub e2_intersect_attr: String,
}

#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub logical_name: String,
    pub primary_id_attribute: String,
    pub is_intersect: bool,
    pub many_to_many_relationships: Vec<ManyToManyRelationship>,
    pub attributes: Vec<AttributeMetadata>,
    pub display_name: String,
    pub display_collection_name: String,
}

impl EntityMetadata {
    pub fn attribute(&self, logical_name: &str) -> Option<&AttributeMetadata> {
        self.attributes
            .iter()
            .find(|a| a.logical_name.eq_ignore_ascii_case(logical_name))
    }

    /// All attributes readable in a `SELECT *` / `table.*` expansion,
    /// sorted by name (spec §4.5 step 4).
    pub fn readable_attributes_sorted(&self) -> Vec<&AttributeMetadata> {
        let mut attrs: Vec<&AttributeMetadata> = self
            .attributes
            .iter()
            .filter(|a| a.is_valid_for_read)
            .collect();
        attrs.sort_by(|a, b| a.logical_name.cmp(&b.logical_name));
        attrs
    }

    /// The sole many-to-many relationship of an intersect entity (spec
    /// §4.8's DELETE rule for intersect entities).
    pub fn sole_many_to_many(&self) -> Option<&ManyToManyRelationship> {
        if self.many_to_many_relationships.len() == 1 {
            self.many_to_many_relationships.first()
        } else {
            None
        }
    }
}

/// External collaborator (spec §6.2): resolves an entity's metadata by its
/// exact lowercased logical name. Lookups are pure, cacheable functions; the
/// provider owns its own caching/concurrency (spec §5).
pub trait MetadataProvider {
    fn get(&self, entity_name: &str) -> anyhow::Result<EntityMetadata>;
}

/// A `HashMap`-backed [`MetadataProvider`] for tests and demos. Not wired
/// into any execution runtime — this crate has none (spec §1).
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct InMemoryMetadataProvider {
    entities: HashMap<String, EntityMetadata>,
}

#[cfg(any(test, feature = "test-util"))]
impl InMemoryMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityMetadata) -> Self {
        self.entities
            .insert(entity.logical_name.to_ascii_lowercase(), entity);
        self
    }
}

#[cfg(any(test, feature = "test-util"))]
impl MetadataProvider for InMemoryMetadataProvider {
    fn get(&self, entity_name: &str) -> anyhow::Result<EntityMetadata> {
        self.entities
            .get(&entity_name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("entity '{entity_name}' not found in metadata"))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub fn attr(name: &str, ty: AttributeType) -> AttributeMetadata {
    AttributeMetadata {
        logical_name: name.to_string(),
        attribute_type: ty,
        is_valid_for_read: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> EntityMetadata {
        EntityMetadata {
            logical_name: "account".into(),
            primary_id_attribute: "accountid".into(),
            is_intersect: false,
            many_to_many_relationships: Vec::new(),
            attributes: vec![
                attr("accountid", AttributeType::UniqueIdentifier),
                attr("name", AttributeType::String),
                attr("revenue", AttributeType::Money),
            ],
            display_name: "Account".into(),
            display_collection_name: "Accounts".into(),
        }
    }

    #[test]
    fn attribute_lookup_is_case_insensitive() {
        let e = account();
        assert!(e.attribute("NAME").is_some());
    }

    #[test]
    fn money_maps_to_nullable_decimal() {
        assert_eq!(AttributeType::Money.value_type(), ValueType::Decimal);
        assert_eq!(AttributeType::Picklist.value_type(), ValueType::Int);
    }

    #[test]
    fn in_memory_provider_round_trips() {
        let provider = InMemoryMetadataProvider::new().with_entity(account());
        let e = provider.get("Account").unwrap();
        assert_eq!(e.logical_name, "account");
        assert!(provider.get("contact").is_err());
    }

    #[test]
    fn readable_attributes_sorted_by_name() {
        let e = account();
        let names: Vec<&str> = e
            .readable_attributes_sorted()
            .iter()
            .map(|a| a.logical_name.as_str())
            .collect();
        assert_eq!(names, vec!["accountid", "name", "revenue"]);
    }
}
