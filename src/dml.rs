//! DML compilers (spec §4.8): UPDATE/DELETE/INSERT, all built by reusing the
//! SELECT assembler (§4.5) to do the actual FROM/WHERE lowering. Each
//! compiler's own job is narrow: decide which columns the SELECT needs to
//! fetch, and turn the statement's own value expressions into row-keyed
//! closures or pre-converted literals.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::assembler::{compile_query_spec, CompileOptions, CompiledSelect};
use crate::ast::{
    BooleanExpr, FunctionArg, InsertSource, Literal, MultiPartIdentifier, NamedTableReference,
    QuerySpecification, ScalarExpr, SelectElement, SqlStatement, TableReference, UniqueRowFilter,
};
use crate::binder::EntityArena;
use crate::error::CompileError;
use crate::expr::compile_scalar_expr;
use crate::fetchxml::Fetch;
use crate::metadata::{EntityMetadata, MetadataProvider};
use crate::value::{Row, Value, ValueType};

/// A compiled value expression closing over a row (spec §4.8's
/// `row => value` map), re-exported under its own name since DML's
/// `updates` map is part of this crate's public contract, not an
/// implementation detail of [`crate::expr`].
pub type RowExpr = Arc<dyn Fn(&Row) -> Value + Send + Sync>;

/// Spec §3: `CompiledQuery` for UPDATE — `entity_name`, `id_column`,
/// `updates`, carried alongside the SELECT that fetches the rows to update.
pub struct CompiledUpdate {
    pub select: CompiledSelect,
    pub entity_name: String,
    pub id_column: String,
    pub updates: HashMap<String, RowExpr>,
}

/// Spec §3: `CompiledQuery` for DELETE — `entity_name`, `id_columns`.
pub struct CompiledDelete {
    pub select: CompiledSelect,
    pub entity_name: String,
    pub id_columns: Vec<String>,
}

/// Spec §3: `CompiledQuery` for INSERT — the source rows/plan plus a
/// positional mapping from source column name to target attribute.
pub struct CompiledInsert {
    pub target_entity: String,
    pub mapping: Vec<(String, String)>,
    pub source: CompiledInsertSource,
}

pub enum CompiledInsertSource {
    Values(Vec<Vec<Value>>),
    Select(Box<CompiledSelect>),
}

fn collect_scalar_columns(expr: &ScalarExpr, out: &mut Vec<String>) {
    match expr {
        ScalarExpr::Column(ident) => {
            if let Some(name) = ident.parts.last() {
                out.push(name.clone());
            }
        }
        ScalarExpr::Literal(_) => {}
        ScalarExpr::Unary(_, inner) => collect_scalar_columns(inner, out),
        ScalarExpr::Binary(left, _, right) => {
            collect_scalar_columns(left, out);
            collect_scalar_columns(right, out);
        }
        ScalarExpr::Function { args, .. } => {
            for arg in args {
                if let FunctionArg::Scalar(e) = arg {
                    collect_scalar_columns(e, out);
                }
            }
        }
        ScalarExpr::SearchedCase {
            when_then,
            else_expr,
        } => {
            for (cond, then) in when_then {
                collect_bool_columns(cond, out);
                collect_scalar_columns(then, out);
            }
            if let Some(e) = else_expr {
                collect_scalar_columns(e, out);
            }
        }
        ScalarExpr::SimpleCase {
            operand,
            when_then,
            else_expr,
        } => {
            collect_scalar_columns(operand, out);
            for (when, then) in when_then {
                collect_scalar_columns(when, out);
                collect_scalar_columns(then, out);
            }
            if let Some(e) = else_expr {
                collect_scalar_columns(e, out);
            }
        }
    }
}

fn collect_bool_columns(expr: &BooleanExpr, out: &mut Vec<String>) {
    match expr {
        BooleanExpr::Comparison { left, right, .. } => {
            collect_scalar_columns(left, out);
            collect_scalar_columns(right, out);
        }
        BooleanExpr::And(l, r) | BooleanExpr::Or(l, r) => {
            collect_bool_columns(l, out);
            collect_bool_columns(r, out);
        }
        BooleanExpr::Not(inner) | BooleanExpr::Parenthesis(inner) => {
            collect_bool_columns(inner, out)
        }
        BooleanExpr::IsNull { expr, .. } => collect_scalar_columns(expr, out),
        BooleanExpr::Like { expr, pattern, .. } => {
            collect_scalar_columns(expr, out);
            collect_scalar_columns(pattern, out);
        }
        BooleanExpr::InList { expr, list, .. } => {
            collect_scalar_columns(expr, out);
            for e in list {
                collect_scalar_columns(e, out);
            }
        }
        BooleanExpr::InSubquery { .. } => {}
    }
}

fn dedup_push(list: &mut Vec<String>, name: String) {
    if !list.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
        list.push(name);
    }
}

fn column_select_element(name: &str) -> SelectElement {
    SelectElement::Column {
        expr: ScalarExpr::Column(MultiPartIdentifier::single(name.to_string())),
        alias: None,
    }
}

/// Synthesizes the `SELECT <columns> FROM <target> WHERE <where_clause>`
/// query spec that UPDATE/DELETE reuse the assembler's FROM+WHERE lowering
/// through (spec §4.8).
fn target_query_spec(
    columns: &[String],
    target: NamedTableReference,
    where_clause: Option<BooleanExpr>,
    distinct: bool,
) -> QuerySpecification {
    QuerySpecification {
        select_elements: columns.iter().map(|c| column_select_element(c)).collect(),
        from: TableReference {
            primary: target,
            joins: Vec::new(),
        },
        where_clause,
        group_by: Vec::new(),
        having: None,
        order_by: Vec::new(),
        offset: None,
        top: None,
        unique_row_filter: if distinct {
            UniqueRowFilter::Distinct
        } else {
            UniqueRowFilter::All
        },
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Converts a literal to the domain value its *target* attribute's type
/// demands (spec §4.8: "literal targets pre-convert via the attribute's
/// type"), as opposed to spec §4.3's generic literal lowering (used below
/// for non-literal SET/VALUES cells, which carry their own type).
fn convert_literal(lit: &Literal, value_type: ValueType) -> Result<Value, CompileError> {
    if matches!(lit, Literal::Null) {
        return Ok(Value::Null);
    }
    let malformed = |text: String| CompileError::NotSupportedQueryFragment {
        reason: format!("literal cannot be converted to {value_type:?}"),
        fragment: text,
    };
    Ok(match (lit, value_type) {
        (Literal::Integer(i), ValueType::Int) => {
            Value::Int(i32::try_from(*i).map_err(|_| malformed(i.to_string()))?)
        }
        (Literal::Integer(i), ValueType::Decimal) => Value::Decimal(Decimal::from(*i)),
        (Literal::Integer(i), ValueType::Float) => Value::Float(*i as f64),
        (Literal::Integer(i), ValueType::Bool) => Value::Bool(*i != 0),
        (Literal::Integer(i), ValueType::String) => Value::String(i.to_string()),
        (Literal::Decimal(text), ValueType::Decimal) => {
            Value::Decimal(text.parse().map_err(|_| malformed(text.clone()))?)
        }
        (Literal::Decimal(text), ValueType::Float) => {
            Value::Float(text.parse().map_err(|_| malformed(text.clone()))?)
        }
        (Literal::Real(r), ValueType::Float) => Value::Float(*r),
        (Literal::Real(r), ValueType::Decimal) => {
            Value::Decimal(Decimal::try_from(*r).map_err(|_| malformed(r.to_string()))?)
        }
        (Literal::String(s), ValueType::String) => Value::String(s.clone()),
        (Literal::String(s), ValueType::Guid) => {
            Value::Guid(s.parse::<Uuid>().map_err(|_| malformed(s.clone()))?)
        }
        (Literal::String(s), ValueType::Timestamp) => {
            Value::Timestamp(parse_datetime(s).ok_or_else(|| malformed(s.clone()))?)
        }
        (Literal::String(s), ValueType::Bool) => Value::Bool(matches!(
            s.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        )),
        (Literal::String(s), ValueType::Int) => {
            Value::Int(s.parse().map_err(|_| malformed(s.clone()))?)
        }
        (Literal::String(s), ValueType::Decimal) => {
            Value::Decimal(s.parse().map_err(|_| malformed(s.clone()))?)
        }
        (_, ValueType::EntityRef) => {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "lookup/customer/owner attributes cannot be set from a literal; use a row expression".into(),
                fragment: format!("{lit:?}"),
            })
        }
        (other, vt) => return Err(malformed(format!("{other:?} as {vt:?}"))),
    })
}

fn attribute_value_type(metadata: &EntityMetadata, name: &str) -> Result<ValueType, CompileError> {
    metadata
        .attribute(name)
        .map(|a| a.attribute_type.value_type())
        .ok_or_else(|| CompileError::UnknownAttribute {
            table: metadata.logical_name.clone(),
            name: name.to_string(),
        })
}

/// Compiles a scalar expression with no row context at all — a zero-argument
/// expression (spec §4.8's INSERT VALUES rule for non-literal cells) —
/// evaluated once against an empty row.
fn compile_constant_expr(expr: &ScalarExpr) -> Result<Value, CompileError> {
    let mut arena = EntityArena::new();
    let mut fetch = Fetch::default();
    let typed = compile_scalar_expr(expr, &mut arena, &mut fetch, None)?;
    Ok((typed.compiled)(&Row::new()))
}

/// Compiles a SET-list value expression against a scratch single-entity
/// arena for `metadata`'s own table (spec §4.8: "column targets use a
/// scalar expression"). The scratch arena exists only to bind column names;
/// its row keys for the root table are bare attribute names (see
/// `crate::expr::column_key`), matching the keys the accompanying SELECT's
/// rows are keyed under, so the resulting closure reads the right cell.
fn compile_row_expr(expr: &ScalarExpr, metadata: &EntityMetadata) -> Result<RowExpr, CompileError> {
    let mut arena = EntityArena::new();
    arena.push_root(metadata.logical_name.clone(), None, metadata.clone());
    let mut fetch = Fetch::default();
    let typed = compile_scalar_expr(expr, &mut arena, &mut fetch, None)?;
    Ok(typed.compiled)
}

/// Compiles `sql` as a single `UPDATE` statement (spec §4.8).
pub fn compile_update(
    sql: &str,
    provider: &dyn MetadataProvider,
    opts: &CompileOptions,
) -> Result<CompiledUpdate, CompileError> {
    let statements = crate::frontend::parse_batch(sql)?;
    let update = match statements.as_slice() {
        [SqlStatement::Update(u)] => u,
        _ => {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "compile_update requires a single UPDATE statement".into(),
                fragment: sql.to_string(),
            })
        }
    };
    let metadata = provider.get(&update.target.name)?;

    // Select the primary-id plus every attribute referenced by the SET
    // value expressions and the WHERE clause (spec §4.8) — not the target
    // attribute names themselves, since those are being written, not read.
    let mut columns = vec![metadata.primary_id_attribute.clone()];
    let mut referenced = Vec::new();
    for (_, expr) in &update.set {
        collect_scalar_columns(expr, &mut referenced);
    }
    if let Some(where_clause) = &update.where_clause {
        collect_bool_columns(where_clause, &mut referenced);
    }
    for name in referenced {
        dedup_push(&mut columns, name);
    }

    let query = target_query_spec(
        &columns,
        update.target.clone(),
        update.where_clause.clone(),
        true,
    );
    let select = compile_query_spec(sql, &query, provider, opts)?;

    let mut updates = HashMap::new();
    for (name, expr) in &update.set {
        let value_type = attribute_value_type(&metadata, name)?;
        let compiled: RowExpr = if let ScalarExpr::Literal(lit) = expr {
            let value = convert_literal(lit, value_type)?;
            Arc::new(move |_: &Row| value.clone())
        } else {
            compile_row_expr(expr, &metadata)?
        };
        updates.insert(name.clone(), compiled);
    }

    Ok(CompiledUpdate {
        select,
        entity_name: metadata.logical_name,
        id_column: metadata.primary_id_attribute,
        updates,
    })
}

/// Compiles `sql` as a single `DELETE` statement (spec §4.8). The id
/// column(s) selected depend on the target: `listmember` selects
/// `listid`+`entityid`; an intersect entity with exactly one many-to-many
/// relationship selects its two intersect attributes; anything else
/// selects its primary id.
pub fn compile_delete(
    sql: &str,
    provider: &dyn MetadataProvider,
    opts: &CompileOptions,
) -> Result<CompiledDelete, CompileError> {
    let statements = crate::frontend::parse_batch(sql)?;
    let delete = match statements.as_slice() {
        [SqlStatement::Delete(d)] => d,
        _ => {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "compile_delete requires a single DELETE statement".into(),
                fragment: sql.to_string(),
            })
        }
    };
    let metadata = provider.get(&delete.target.name)?;

    let id_columns: Vec<String> = if delete.target.name.eq_ignore_ascii_case("listmember") {
        vec!["listid".to_string(), "entityid".to_string()]
    } else if metadata.is_intersect {
        match metadata.sole_many_to_many() {
            Some(rel) => vec![rel.e1_intersect_attr.clone(), rel.e2_intersect_attr.clone()],
            None => vec![metadata.primary_id_attribute.clone()],
        }
    } else {
        vec![metadata.primary_id_attribute.clone()]
    };

    let mut columns = id_columns.clone();
    let mut referenced = Vec::new();
    if let Some(where_clause) = &delete.where_clause {
        collect_bool_columns(where_clause, &mut referenced);
    }
    for name in referenced {
        dedup_push(&mut columns, name);
    }

    let query = target_query_spec(
        &columns,
        delete.target.clone(),
        delete.where_clause.clone(),
        true,
    );
    let select = compile_query_spec(sql, &query, provider, opts)?;

    Ok(CompiledDelete {
        select,
        entity_name: metadata.logical_name,
        id_columns,
    })
}

/// Compiles `sql` as a single `INSERT` statement (spec §4.8). Requires an
/// explicit column list — the source carries no metadata of its own to
/// infer one from, and guessing the platform's attribute order would be
/// silently lossy (documented as an Open Question resolution in
/// DESIGN.md).
pub fn compile_insert(
    sql: &str,
    provider: &dyn MetadataProvider,
    opts: &CompileOptions,
) -> Result<CompiledInsert, CompileError> {
    let statements = crate::frontend::parse_batch(sql)?;
    let insert = match statements.as_slice() {
        [SqlStatement::Insert(i)] => i,
        _ => {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "compile_insert requires a single INSERT statement".into(),
                fragment: sql.to_string(),
            })
        }
    };
    if insert.columns.is_empty() {
        return Err(CompileError::NotSupportedQueryFragment {
            reason: "INSERT requires an explicit column list".into(),
            fragment: sql.to_string(),
        });
    }
    let metadata = provider.get(&insert.target_entity)?;

    let source = match &insert.source {
        InsertSource::Values(rows) => {
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                if row.len() != insert.columns.len() {
                    return Err(CompileError::NotSupportedQueryFragment {
                        reason: "VALUES row arity does not match the column list".into(),
                        fragment: sql.to_string(),
                    });
                }
                let mut values = Vec::with_capacity(row.len());
                for (cell, column) in row.iter().zip(&insert.columns) {
                    let value = match cell {
                        ScalarExpr::Literal(lit) => {
                            let value_type = attribute_value_type(&metadata, column)?;
                            convert_literal(lit, value_type)?
                        }
                        other => compile_constant_expr(other)?,
                    };
                    values.push(value);
                }
                out.push(values);
            }
            CompiledInsertSource::Values(out)
        }
        InsertSource::Select(select_stmt) => {
            let compiled = compile_query_spec(sql, &select_stmt.query, provider, opts)?;
            if compiled.columns.len() != insert.columns.len() {
                return Err(CompileError::NotSupportedQueryFragment {
                    reason: "INSERT SELECT column count does not match the target column list"
                        .into(),
                    fragment: sql.to_string(),
                });
            }
            CompiledInsertSource::Select(Box::new(compiled))
        }
    };

    let mapping = match &source {
        CompiledInsertSource::Values(_) => insert
            .columns
            .iter()
            .map(|c| (c.clone(), c.clone()))
            .collect(),
        CompiledInsertSource::Select(compiled) => compiled
            .columns
            .iter()
            .cloned()
            .zip(insert.columns.iter().cloned())
            .collect(),
    };

    Ok(CompiledInsert {
        target_entity: metadata.logical_name,
        mapping,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{attr, AttributeType, EntityMetadata, InMemoryMetadataProvider};
    use crate::metadata::ManyToManyRelationship;

    fn contact() -> EntityMetadata {
        EntityMetadata {
            logical_name: "contact".into(),
            primary_id_attribute: "contactid".into(),
            is_intersect: false,
            many_to_many_relationships: Vec::new(),
            attributes: vec![
                attr("contactid", AttributeType::UniqueIdentifier),
                attr("firstname", AttributeType::String),
                attr("lastname", AttributeType::String),
                attr("revenue", AttributeType::Money),
            ],
            display_name: "Contact".into(),
            display_collection_name: "Contacts".into(),
        }
    }

    fn listmembers() -> EntityMetadata {
        EntityMetadata {
            logical_name: "listmember".into(),
            primary_id_attribute: "listmemberid".into(),
            is_intersect: false,
            many_to_many_relationships: Vec::new(),
            attributes: vec![
                attr("listmemberid", AttributeType::UniqueIdentifier),
                attr("listid", AttributeType::Lookup),
                attr("entityid", AttributeType::Lookup),
            ],
            display_name: "List Member".into(),
            display_collection_name: "List Members".into(),
        }
    }

    fn account_contact_intersect() -> EntityMetadata {
        EntityMetadata {
            logical_name: "accountcontact".into(),
            primary_id_attribute: "accountcontactid".into(),
            is_intersect: true,
            many_to_many_relationships: vec![ManyToManyRelationship {
                schema_name: "account_contact".into(),
                e1_intersect_attr: "accountid".into(),
                e2_intersect_attr: "contactid".into(),
            }],
            attributes: vec![attr("accountcontactid", AttributeType::UniqueIdentifier)],
            display_name: "Account Contact".into(),
            display_collection_name: "Account Contacts".into(),
        }
    }

    fn provider() -> InMemoryMetadataProvider {
        InMemoryMetadataProvider::new()
            .with_entity(contact())
            .with_entity(listmembers())
            .with_entity(account_contact_intersect())
    }

    #[test]
    fn update_selects_referenced_columns_not_target_columns() {
        let sql = "UPDATE contact SET firstname = 'Hello ' + lastname";
        let compiled = compile_update(sql, &provider(), &CompileOptions::default()).unwrap();
        let xml = crate::fetchxml::write_fetch(compiled.select.fetch.as_ref().unwrap());
        assert!(xml.contains(r#"attribute name="lastname""#));
        assert!(xml.contains(r#"attribute name="contactid""#));
        assert!(!xml.contains(r#"attribute name="firstname""#));
        assert!(compiled.select.fetch.as_ref().unwrap().distinct);

        let row = Row::new().with("lastname", Value::String("Carrington".into()));
        let updated = (compiled.updates.get("firstname").unwrap())(&row);
        assert_eq!(updated, Value::String("Hello Carrington".into()));
    }

    #[test]
    fn update_literal_is_converted_to_the_target_attributes_type() {
        let sql = "UPDATE contact SET revenue = 100";
        let compiled = compile_update(sql, &provider(), &CompileOptions::default()).unwrap();
        let value = (compiled.updates.get("revenue").unwrap())(&Row::new());
        assert_eq!(value, Value::Decimal(Decimal::from(100)));
    }

    #[test]
    fn delete_selects_only_the_primary_id_by_default() {
        let sql = "DELETE FROM contact WHERE lastname = 'Carrington'";
        let compiled = compile_delete(sql, &provider(), &CompileOptions::default()).unwrap();
        assert_eq!(compiled.id_columns, vec!["contactid".to_string()]);
        let xml = crate::fetchxml::write_fetch(compiled.select.fetch.as_ref().unwrap());
        assert!(xml.contains(r#"attribute name="contactid""#));
        assert!(xml.contains(r#"attribute name="lastname""#));
    }

    #[test]
    fn delete_from_listmember_selects_list_and_entity_ids() {
        let sql = "DELETE FROM listmember WHERE listid = 'x'";
        let compiled = compile_delete(sql, &provider(), &CompileOptions::default()).unwrap();
        assert_eq!(
            compiled.id_columns,
            vec!["listid".to_string(), "entityid".to_string()]
        );
    }

    #[test]
    fn delete_from_intersect_entity_selects_both_intersect_attributes() {
        let sql = "DELETE FROM accountcontact WHERE accountcontactid = 'x'";
        let compiled = compile_delete(sql, &provider(), &CompileOptions::default()).unwrap();
        assert_eq!(
            compiled.id_columns,
            vec!["accountid".to_string(), "contactid".to_string()]
        );
    }

    #[test]
    fn insert_values_pre_converts_literals_to_attribute_types() {
        let sql = "INSERT INTO contact (firstname, revenue) VALUES ('Mark', 100)";
        let compiled = compile_insert(sql, &provider(), &CompileOptions::default()).unwrap();
        match compiled.source {
            CompiledInsertSource::Values(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0][0], Value::String("Mark".into()));
                assert_eq!(rows[0][1], Value::Decimal(Decimal::from(100)));
            }
            _ => panic!("expected a VALUES source"),
        }
        assert_eq!(
            compiled.mapping,
            vec![
                ("firstname".to_string(), "firstname".to_string()),
                ("revenue".to_string(), "revenue".to_string()),
            ]
        );
    }

    #[test]
    fn insert_select_requires_matching_column_counts() {
        let sql = "INSERT INTO contact (firstname) SELECT firstname, lastname FROM contact";
        let err = compile_insert(sql, &provider(), &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::NotSupportedQueryFragment { .. }));
    }

    #[test]
    fn insert_select_records_a_positional_mapping() {
        let sql = "INSERT INTO contact (firstname) SELECT lastname FROM contact";
        let compiled = compile_insert(sql, &provider(), &CompileOptions::default()).unwrap();
        assert_eq!(
            compiled.mapping,
            vec![("lastname".to_string(), "firstname".to_string())]
        );
        assert!(matches!(
            compiled.source,
            CompiledInsertSource::Select(_)
        ));
    }
}
