//! The metadata binder (spec §3, §4.1): resolves SQL column references
//! against joined tables' entity metadata, and owns the arena that maps
//! each [`EntityTable`] to its node in the [`Fetch`] tree without a
//! back-pointer (spec §9's cyclic-back-reference note).

use std::collections::HashMap;

use crate::ast::MultiPartIdentifier;
use crate::error::CompileError;
use crate::fetchxml::{Fetch, Item, LinkEntity, LinkType};
use crate::metadata::EntityMetadata;
use crate::value::ValueType;

/// Where a table's own FetchXML node lives in the tree, addressed by index
/// rather than a direct reference (spec §9).
#[derive(Debug, Clone, Copy)]
pub enum TableLocation {
    /// The table is the query's root entity: its node is `fetch.entity`.
    Root,
    /// The table is a link-entity: its node is the `Item::LinkEntity` at
    /// `item_index` within the parent table's own items vector.
    Child { parent: usize, item_index: usize },
}

#[derive(Debug, Clone)]
pub struct EntityTable {
    pub logical_name: String,
    pub alias: Option<String>,
    pub metadata: EntityMetadata,
    pub location: TableLocation,
}

impl EntityTable {
    /// Resolution prefers `alias` over the entity's logical name (spec §3).
    pub fn display_qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.logical_name)
    }

    pub fn location_is_root(&self) -> bool {
        matches!(self.location, TableLocation::Root)
    }
}

/// The flat arena of tables for one query (spec §9). Allocated during FROM
/// lowering and discarded with the compiled query.
#[derive(Debug, Clone, Default)]
pub struct EntityArena {
    pub tables: Vec<EntityTable>,
}

impl EntityArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the root table. Must be called exactly once, before any
    /// `push_link` call.
    pub fn push_root(
        &mut self,
        logical_name: impl Into<String>,
        alias: Option<String>,
        metadata: EntityMetadata,
    ) -> usize {
        debug_assert!(self.tables.is_empty(), "root table must be pushed first");
        self.tables.push(EntityTable {
            logical_name: logical_name.into(),
            alias,
            metadata,
            location: TableLocation::Root,
        });
        0
    }

    /// Adds a join target as a `link-entity` under `parent`'s node in
    /// `fetch`, returning the new table's arena index.
    #[allow(clippy::too_many_arguments)]
    pub fn push_link(
        &mut self,
        fetch: &mut Fetch,
        parent: usize,
        logical_name: impl Into<String>,
        alias: impl Into<String>,
        metadata: EntityMetadata,
        from: impl Into<String>,
        to: impl Into<String>,
        link_type: LinkType,
    ) -> usize {
        let logical_name = logical_name.into();
        let alias = alias.into();
        let items = self.items_mut(fetch, parent);
        let item_index = items.len();
        items.push(Item::LinkEntity(LinkEntity {
            name: logical_name.clone(),
            alias: alias.clone(),
            from: from.into(),
            to: to.into(),
            link_type,
            items: Vec::new(),
        }));
        let table_idx = self.tables.len();
        self.tables.push(EntityTable {
            logical_name,
            alias: Some(alias),
            metadata,
            location: TableLocation::Child { parent, item_index },
        });
        table_idx
    }

    /// The mutable items vector of `table_idx`'s own FetchXML node, found by
    /// walking `location` chains down from the root rather than following a
    /// stored pointer.
    pub fn items_mut<'f>(&self, fetch: &'f mut Fetch, table_idx: usize) -> &'f mut Vec<Item> {
        match self.tables[table_idx].location {
            TableLocation::Root => &mut fetch.entity.items,
            TableLocation::Child { parent, item_index } => {
                let parent_items = self.items_mut(fetch, parent);
                match &mut parent_items[item_index] {
                    Item::LinkEntity(link) => &mut link.items,
                    _ => unreachable!("location.item_index must address a LinkEntity item"),
                }
            }
        }
    }

    pub fn items<'f>(&self, fetch: &'f Fetch, table_idx: usize) -> &'f Vec<Item> {
        match self.tables[table_idx].location {
            TableLocation::Root => &fetch.entity.items,
            TableLocation::Child { parent, item_index } => {
                let parent_items = self.items(fetch, parent);
                match &parent_items[item_index] {
                    Item::LinkEntity(link) => &link.items,
                    _ => unreachable!("location.item_index must address a LinkEntity item"),
                }
            }
        }
    }

    fn resolve_table(&self, qualifier: &str) -> Result<usize, CompileError> {
        if let Some(i) = self.tables.iter().position(|t| {
            t.alias
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(qualifier))
        }) {
            return Ok(i);
        }
        let matches: Vec<usize> = self
            .tables
            .iter()
            .enumerate()
            .filter(|(_, t)| t.alias.is_none() && t.logical_name.eq_ignore_ascii_case(qualifier))
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => Err(CompileError::UnknownTable {
                name: qualifier.to_string(),
            }),
            1 => Ok(matches[0]),
            _ => Err(CompileError::AmbiguousTable {
                identifier: qualifier.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnBinding {
    pub table: usize,
    pub attribute_name: String,
    pub attr_type: ValueType,
    /// Set when the reference resolved through an already-declared FetchXML
    /// attribute alias rather than the metadata's own attribute name.
    pub explicit_alias: Option<String>,
}

/// Binds a two- or one-part column identifier against `arena`'s tables
/// (spec §4.1). Never consults the ORDER BY/HAVING shadow table — callers
/// compiling those clauses should try [`ShadowColumns::lookup`] first.
pub fn bind_column(
    arena: &EntityArena,
    ident: &MultiPartIdentifier,
) -> Result<ColumnBinding, CompileError> {
    match ident.parts.as_slice() {
        [qualifier, name] => {
            let table_idx = arena.resolve_table(qualifier)?;
            let table = &arena.tables[table_idx];
            let attr = table.metadata.attribute(name).ok_or_else(|| {
                CompileError::UnknownAttribute {
                    table: table.display_qualifier().to_string(),
                    name: name.clone(),
                }
            })?;
            Ok(ColumnBinding {
                table: table_idx,
                attribute_name: attr.logical_name.clone(),
                attr_type: attr.attribute_type.value_type(),
                explicit_alias: None,
            })
        }
        [name] => {
            let matches: Vec<usize> = arena
                .tables
                .iter()
                .enumerate()
                .filter(|(_, t)| t.metadata.attribute(name).is_some())
                .map(|(i, _)| i)
                .collect();
            match matches.len() {
                0 => Err(CompileError::UnknownAttribute {
                    table: arena
                        .tables
                        .first()
                        .map(|t| t.display_qualifier().to_string())
                        .unwrap_or_default(),
                    name: name.clone(),
                }),
                1 => {
                    let table_idx = matches[0];
                    let attr = arena.tables[table_idx].metadata.attribute(name).unwrap();
                    Ok(ColumnBinding {
                        table: table_idx,
                        attribute_name: attr.logical_name.clone(),
                        attr_type: attr.attribute_type.value_type(),
                        explicit_alias: None,
                    })
                }
                _ => Err(CompileError::AmbiguousAttribute {
                    identifier: name.clone(),
                }),
            }
        }
        parts => Err(CompileError::NotSupportedQueryFragment {
            reason: "only one- or two-part column references are supported".into(),
            fragment: parts.join("."),
        }),
    }
}

/// A calculated column defined earlier in the SELECT list (spec §4.1),
/// visible only to ORDER BY and HAVING.
#[derive(Debug, Clone)]
pub enum ShadowEntry {
    /// The SELECT element was itself a plain column reference, so ORDER
    /// BY/HAVING referencing its alias resolve to the same binding.
    Column(ColumnBinding),
    /// The SELECT element was a computed expression realized by a
    /// Projection operator; referencing its alias reads that output column.
    Calculated {
        output_name: String,
        value_type: ValueType,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ShadowColumns {
    entries: HashMap<String, ShadowEntry>,
}

impl ShadowColumns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_column(&mut self, alias: &str, binding: ColumnBinding) {
        self.entries
            .insert(alias.to_ascii_lowercase(), ShadowEntry::Column(binding));
    }

    pub fn define_calculated(&mut self, alias: &str, output_name: String, value_type: ValueType) {
        self.entries.insert(
            alias.to_ascii_lowercase(),
            ShadowEntry::Calculated {
                output_name,
                value_type,
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Option<&ShadowEntry> {
        self.entries.get(&name.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{attr, AttributeType};

    fn account() -> EntityMetadata {
        EntityMetadata {
            logical_name: "account".into(),
            primary_id_attribute: "accountid".into(),
            is_intersect: false,
            many_to_many_relationships: Vec::new(),
            attributes: vec![
                attr("accountid", AttributeType::UniqueIdentifier),
                attr("name", AttributeType::String),
            ],
            display_name: "Account".into(),
            display_collection_name: "Accounts".into(),
        }
    }

    fn contact() -> EntityMetadata {
        EntityMetadata {
            logical_name: "contact".into(),
            primary_id_attribute: "contactid".into(),
            is_intersect: false,
            many_to_many_relationships: Vec::new(),
            attributes: vec![
                attr("contactid", AttributeType::UniqueIdentifier),
                attr("parentcustomerid", AttributeType::Lookup),
            ],
            display_name: "Contact".into(),
            display_collection_name: "Contacts".into(),
        }
    }

    #[test]
    fn single_part_column_binds_to_sole_matching_table() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let binding = bind_column(&arena, &MultiPartIdentifier::single("name")).unwrap();
        assert_eq!(binding.table, 0);
        assert_eq!(binding.attr_type, ValueType::String);
    }

    #[test]
    fn ambiguous_single_part_column_is_an_error() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        arena.push_link(
            &mut fetch,
            0,
            "account",
            "parent",
            account(),
            "parentaccountid",
            "accountid",
            LinkType::Inner,
        );
        let err = bind_column(&arena, &MultiPartIdentifier::single("name")).unwrap_err();
        assert!(matches!(err, CompileError::AmbiguousAttribute { .. }));
    }

    #[test]
    fn two_part_column_prefers_alias_over_entity_name() {
        let mut arena = EntityArena::new();
        arena.push_root("contact", Some("c".into()), contact());
        let mut fetch = Fetch::default();
        let acct_idx = arena.push_link(
            &mut fetch,
            0,
            "account",
            "a",
            account(),
            "parentcustomerid",
            "accountid",
            LinkType::Inner,
        );
        let binding =
            bind_column(&arena, &MultiPartIdentifier::qualified("a", "name")).unwrap();
        assert_eq!(binding.table, acct_idx);
    }

    #[test]
    fn push_link_places_the_link_entity_under_its_parent_node() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        arena.push_link(
            &mut fetch,
            0,
            "contact",
            "c",
            contact(),
            "accountid",
            "parentcustomerid",
            LinkType::Inner,
        );
        assert_eq!(fetch.entity.items.len(), 1);
        assert!(matches!(fetch.entity.items[0], Item::LinkEntity(_)));
    }

    #[test]
    fn shadow_columns_are_not_consulted_by_bind_column() {
        let mut shadow = ShadowColumns::new();
        shadow.define_calculated("total", "Expr0".into(), ValueType::Decimal);
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let err = bind_column(&arena, &MultiPartIdentifier::single("total")).unwrap_err();
        assert!(matches!(err, CompileError::UnknownAttribute { .. }));
        assert!(shadow.lookup("total").is_some());
    }
}
