//! The query assembler (spec §4.5): drives clause-by-clause lowering in a
//! fixed order (FROM, WHERE, GROUP BY, SELECT, DISTINCT, ORDER BY, HAVING,
//! OFFSET, TOP), owns the fallback protocol between the FetchXML and
//! expression paths, and assembles the final [`CompiledSelect`].
//!
//! Style note: the teacher's `fql/parser.rs` drives its own clause grammar
//! with one `match` arm per keyword, each delegating to a `parse_x` method;
//! this module mirrors that shape with one `lower_x` method per clause.

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::ast::{
    BooleanExpr, FunctionArg, JoinType, OrderByElement, OrderKey, QuerySpecification, ScalarExpr,
    SelectElement, SqlStatement, TableReference, UniqueRowFilter,
};
use crate::binder::{bind_column, EntityArena, ShadowColumns, ShadowEntry, TableLocation};
use crate::error::CompileError;
use crate::expr::{column_key, compile_scalar_expr, compile_shadow_entry, ensure_attribute};
use crate::fetchxml::{
    AggregateFunction, Attribute, DateGrouping, Entity, Fetch, Item, LinkEntity, LinkType, Order,
};
use crate::metadata::MetadataProvider;
use crate::operators::{
    AggregateFn, AggregateSpec, Grouping, Operator, RowPredicate, RowSelector, SortKey,
};
use crate::predicate::{compile_expression_predicate, lower_join_on, lower_where_clause};
use crate::value::ValueType;

/// Batch-level toggles (SPEC_FULL.md §C). `force_aggregate_expression` is set
/// internally by the aggregate-alternative planner (spec §4.7); callers
/// normally leave it `false`.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub quoted_identifiers: bool,
    pub tsql_endpoint_available: bool,
    pub force_aggregate_expression: bool,
}

/// The immutable record the runtime consumes for a compiled SELECT (spec
/// §3). `fetch` is `None` only when the caller enabled
/// `tsql_endpoint_available` and the query could not be lowered at all
/// (spec §7's `NotSupportedQueryFragment` raw-SQL fallback).
#[derive(Debug, Clone)]
pub struct CompiledSelect {
    pub sql: String,
    pub fetch: Option<Fetch>,
    pub columns: Vec<String>,
    pub pipeline: Vec<Operator>,
    pub all_pages: bool,
    pub aggregate_alternative: Option<Box<CompiledSelect>>,
}

/// A structural fingerprint used in place of the source's node-identity
/// rewrite (spec §9): two scalar expressions that parse to the same shape
/// are treated as "the same reference" for the purposes of the GROUP BY
/// alias rewrite. Limitation: this only matches a SELECT/HAVING/ORDER BY
/// operand that *is itself, verbatim* a grouping column or aggregate call —
/// an aggregate nested inside a further expression (`count(*) + 1`) is not
/// recognised and is compiled as an ordinary (and, for an aggregate
/// function, unsupported) scalar expression. Documented in DESIGN.md.
fn fingerprint(expr: &ScalarExpr) -> String {
    format!("{expr:?}")
}

const AGGREGATE_FUNCTION_NAMES: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX"];

fn aggregate_function_name(expr: &ScalarExpr) -> Option<(&str, Option<&ScalarExpr>, bool)> {
    match expr {
        ScalarExpr::Function { name, args, distinct } => {
            let name = name.as_str();
            if !AGGREGATE_FUNCTION_NAMES.contains(&name.to_ascii_uppercase().as_str()) {
                return None;
            }
            let arg = args.iter().find_map(|a| match a {
                FunctionArg::Scalar(e) => Some(e),
                FunctionArg::DatePart(_) => None,
            });
            Some((name, arg, *distinct))
        }
        _ => None,
    }
}

fn is_count_star(expr: &ScalarExpr) -> bool {
    matches!(
        expr,
        ScalarExpr::Function { name, args, .. }
            if name.eq_ignore_ascii_case("COUNT")
                && matches!(
                    args.as_slice(),
                    [FunctionArg::Scalar(ScalarExpr::Column(ident))] if ident.parts == ["*"]
                )
    )
}

fn to_aggregate_fn(name: &str, distinct_column: bool) -> AggregateFn {
    match name.to_ascii_uppercase().as_str() {
        "COUNT" if distinct_column => AggregateFn::CountColumnDistinct,
        "COUNT" => AggregateFn::CountColumn,
        "SUM" => AggregateFn::Sum,
        "AVG" => AggregateFn::Avg,
        "MIN" => AggregateFn::Min,
        "MAX" => AggregateFn::Max,
        _ => unreachable!("filtered by AGGREGATE_FUNCTION_NAMES"),
    }
}

fn to_wire_aggregate(function: AggregateFn) -> AggregateFunction {
    match function {
        AggregateFn::Count => AggregateFunction::Count,
        AggregateFn::CountColumn => AggregateFunction::CountColumn,
        AggregateFn::CountColumnDistinct => AggregateFunction::CountColumnDistinct,
        AggregateFn::Avg => AggregateFunction::Avg,
        AggregateFn::Min => AggregateFunction::Min,
        AggregateFn::Max => AggregateFunction::Max,
        AggregateFn::Sum => AggregateFunction::Sum,
    }
}

fn to_date_grouping(symbol: &str) -> Option<DateGrouping> {
    Some(match symbol.to_ascii_lowercase().as_str() {
        "year" | "yy" | "yyyy" => DateGrouping::Year,
        "quarter" | "qq" | "q" => DateGrouping::Quarter,
        "month" | "mm" | "m" => DateGrouping::Month,
        "week" | "wk" | "ww" => DateGrouping::Week,
        "day" | "dd" | "d" => DateGrouping::Day,
        "fiscalperiod" => DateGrouping::FiscalPeriod,
        "fiscalyear" => DateGrouping::FiscalYear,
        _ => return None,
    })
}

/// Compiles a single already-parsed `SELECT` (spec §4.5). This is the
/// engine reused by [`compile_select`], the INSERT...SELECT compiler
/// (spec §4.8), and the aggregate-alternative planner (spec §4.7), which
/// simply calls this again with `opts.force_aggregate_expression = true`.
pub(crate) fn compile_query_spec(
    sql: &str,
    query: &QuerySpecification,
    provider: &dyn MetadataProvider,
    opts: &CompileOptions,
) -> Result<CompiledSelect, CompileError> {
    let mut arena = EntityArena::new();
    let mut fetch = lower_from(&query.from, &mut arena, provider)?;
    let mut pipeline: Vec<Operator> = Vec::new();

    lower_where(query, &mut arena, &mut fetch, &mut pipeline)?;

    let mut shadow = ShadowColumns::new();
    let mut agg_fingerprints: HashMap<String, ShadowEntry> = HashMap::new();
    lower_group_by_and_aggregates(
        query,
        &mut arena,
        &mut fetch,
        &mut pipeline,
        &mut agg_fingerprints,
        opts,
    )?;

    let columns = lower_select(
        query,
        &mut arena,
        &mut fetch,
        &mut pipeline,
        &mut shadow,
        &agg_fingerprints,
    )?;

    lower_distinct(query, &mut fetch, &mut pipeline);
    lower_order_by(
        query,
        &mut arena,
        &mut fetch,
        &mut pipeline,
        &shadow,
        &agg_fingerprints,
        &columns,
    )?;
    lower_having(query, &mut arena, &mut fetch, &mut pipeline, &shadow, &agg_fingerprints)?;
    lower_offset(query, &mut fetch, &mut pipeline);
    lower_top(query, &mut fetch, &mut pipeline)?;

    fetch.finalize();

    let aggregate_alternative = if fetch.aggregate && !opts.force_aggregate_expression {
        warn!("native aggregate query emitted; compiling an expression-path alternative plan for the platform row-limit fallback (spec §4.7)");
        let mut alt_opts = opts.clone();
        alt_opts.force_aggregate_expression = true;
        Some(Box::new(compile_query_spec(sql, query, provider, &alt_opts)?))
    } else {
        None
    };

    Ok(CompiledSelect {
        sql: sql.to_string(),
        fetch: Some(fetch),
        columns,
        pipeline,
        all_pages: true,
        aggregate_alternative,
    })
}

/// Public entry point: parses `sql` as a single SELECT statement and
/// compiles it. Honors `opts.tsql_endpoint_available` (spec §7): a fatal
/// `NotSupportedQueryFragment` becomes a fetch-less [`CompiledSelect`]
/// carrying only the original SQL text instead of propagating.
pub fn compile_select(
    sql: &str,
    provider: &dyn MetadataProvider,
    opts: &CompileOptions,
) -> Result<CompiledSelect, CompileError> {
    let statements = crate::frontend::parse_batch(sql)?;
    let select = match statements.as_slice() {
        [SqlStatement::Select(s)] => s,
        [_other] => {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "compile_select requires a SELECT statement".into(),
                fragment: sql.to_string(),
            })
        }
        _ => {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "compile_select accepts exactly one statement".into(),
                fragment: sql.to_string(),
            })
        }
    };
    match compile_query_spec(sql, &select.query, provider, opts) {
        Ok(compiled) => Ok(compiled),
        Err(CompileError::NotSupportedQueryFragment { reason, fragment })
            if opts.tsql_endpoint_available =>
        {
            debug!("falling back to raw SQL execution: {reason} ({fragment})");
            Ok(CompiledSelect {
                sql: sql.to_string(),
                fetch: None,
                columns: Vec::new(),
                pipeline: Vec::new(),
                all_pages: false,
                aggregate_alternative: None,
            })
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------
// 1. FROM (spec §4.5 step 1)
// ---------------------------------------------------------------------

fn apply_hints(hints: &[String], fetch: &mut Fetch) -> Result<(), CompileError> {
    for hint in hints {
        if hint.to_ascii_uppercase().contains("NOLOCK") {
            fetch.nolock = true;
        } else {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "unsupported table hint".into(),
                fragment: hint.clone(),
            });
        }
    }
    Ok(())
}

fn link_item_mut<'f>(arena: &EntityArena, fetch: &'f mut Fetch, table_idx: usize) -> &'f mut LinkEntity {
    match arena.tables[table_idx].location {
        TableLocation::Child { parent, item_index } => {
            let items = arena.items_mut(fetch, parent);
            match &mut items[item_index] {
                Item::LinkEntity(link) => link,
                _ => unreachable!("item_index must address this table's own LinkEntity item"),
            }
        }
        TableLocation::Root => unreachable!("the root table has no link-entity item of its own"),
    }
}

/// Resolves the join key's attribute on the not-yet-registered newcomer
/// table directly against its metadata, since [`bind_column`] cannot yet
/// resolve its alias (it is registered immediately afterward, once the key
/// is known, per the two-phase `push_link`-then-patch flow below).
fn newcomer_attribute<'a>(
    arena: &EntityArena,
    new_table_idx: usize,
    ident: &crate::ast::MultiPartIdentifier,
    new_alias: &str,
) -> Option<String> {
    let name = match ident.parts.as_slice() {
        [qualifier, name] if qualifier.eq_ignore_ascii_case(new_alias) => name,
        [name] => name,
        _ => return None,
    };
    arena.tables[new_table_idx]
        .metadata
        .attribute(name)
        .map(|a| a.logical_name.clone())
}

pub(crate) fn lower_from(
    from: &TableReference,
    arena: &mut EntityArena,
    provider: &dyn MetadataProvider,
) -> Result<Fetch, CompileError> {
    let root_meta = provider.get(&from.primary.name)?;
    arena.push_root(from.primary.name.clone(), from.primary.alias.clone(), root_meta);
    let mut fetch = Fetch {
        entity: Entity::new(from.primary.name.clone()),
        ..Fetch::default()
    };
    apply_hints(&from.primary.hints, &mut fetch)?;

    for join in &from.joins {
        let alias = join
            .table
            .alias
            .clone()
            .unwrap_or_else(|| join.table.name.clone());
        let meta = provider.get(&join.table.name)?;
        apply_hints(&join.table.hints, &mut fetch)?;
        let link_type = match join.join_type {
            JoinType::Inner => LinkType::Inner,
            JoinType::LeftOuter => LinkType::Outer,
        };
        let table_idx = arena.push_link(
            &mut fetch,
            0,
            join.table.name.clone(),
            alias.clone(),
            meta,
            String::new(),
            String::new(),
            link_type,
        );
        let (join_key, residual) = lower_join_on(&join.on, &alias, arena, &mut fetch)
            .or_else(|e| resolve_join_key_manually(&join.on, &alias, arena, table_idx, e))?;
        {
            let link = link_item_mut(arena, &mut fetch, table_idx);
            link.from = join_key.from;
            link.to = join_key.to;
        }
        if let Some(residual_filter) = residual {
            if !residual_filter.is_empty() {
                let items = arena.items_mut(&mut fetch, table_idx);
                items.push(Item::Filter(residual_filter));
            }
        }
        trace!("joined {} as {} ({:?})", join.table.name, alias, link_type);
    }
    Ok(fetch)
}

/// `predicate::lower_join_on` binds both sides of the join key through the
/// arena, which only works once the newcomer alias is registered — exactly
/// the case here, since `push_link` already ran. This helper exists only to
/// cover the case where `predicate::lower_join_on`'s stricter column-bind
/// rejects a reference it could not resolve; it re-derives the key directly
/// from metadata before giving up.
fn resolve_join_key_manually(
    on: &BooleanExpr,
    new_alias: &str,
    arena: &mut EntityArena,
    new_table_idx: usize,
    original_err: CompileError,
) -> Result<(crate::predicate::JoinKey, Option<crate::fetchxml::Filter>), CompileError> {
    if let BooleanExpr::Comparison {
        left: ScalarExpr::Column(l),
        op: crate::ast::CompareOp::Eq,
        right: ScalarExpr::Column(r),
    } = on
    {
        let new_is_left = newcomer_attribute(arena, new_table_idx, l, new_alias).is_some();
        let (new_ident, outer_ident) = if new_is_left { (l, r) } else { (r, l) };
        if let (Some(new_attr), Ok(outer_binding)) = (
            newcomer_attribute(arena, new_table_idx, new_ident, new_alias),
            bind_column(arena, outer_ident),
        ) {
            return Ok((
                crate::predicate::JoinKey {
                    from: outer_binding.attribute_name,
                    to: new_attr,
                },
                None,
            ));
        }
    }
    Err(original_err)
}

// ---------------------------------------------------------------------
// 2. WHERE (spec §4.5 step 2)
// ---------------------------------------------------------------------

pub(crate) fn lower_where(
    query: &QuerySpecification,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    pipeline: &mut Vec<Operator>,
) -> Result<(), CompileError> {
    let Some(where_clause) = &query.where_clause else {
        return Ok(());
    };
    let (filter, residual) = lower_where_clause(where_clause, arena, fetch)?;
    if !filter.is_empty() {
        fetch.entity.items.push(Item::Filter(filter));
    }
    if let Some(combined) = conjunction(residual) {
        debug!("WHERE clause partially lowered; residual compiled as an expression predicate");
        let pred: RowPredicate = compile_expression_predicate(&combined, arena, fetch, None)?;
        pipeline.push(Operator::Where(pred));
    }
    Ok(())
}

fn conjunction(mut exprs: Vec<BooleanExpr>) -> Option<BooleanExpr> {
    let mut iter = exprs.drain(..);
    let mut acc = iter.next()?;
    for e in iter {
        acc = BooleanExpr::And(Box::new(acc), Box::new(e));
    }
    Some(acc)
}

// ---------------------------------------------------------------------
// 3. GROUP BY / aggregates (spec §4.5 step 3)
// ---------------------------------------------------------------------

fn contains_aggregate(expr: &ScalarExpr) -> bool {
    if aggregate_function_name(expr).is_some() {
        return true;
    }
    match expr {
        ScalarExpr::Unary(_, e) => contains_aggregate(e),
        ScalarExpr::Binary(l, _, r) => contains_aggregate(l) || contains_aggregate(r),
        ScalarExpr::Function { args, .. } => args.iter().any(|a| match a {
            FunctionArg::Scalar(e) => contains_aggregate(e),
            FunctionArg::DatePart(_) => false,
        }),
        _ => false,
    }
}

fn boolean_contains_aggregate(expr: &BooleanExpr) -> bool {
    match expr {
        BooleanExpr::Comparison { left, right, .. } => {
            contains_aggregate(left) || contains_aggregate(right)
        }
        BooleanExpr::And(a, b) | BooleanExpr::Or(a, b) => {
            boolean_contains_aggregate(a) || boolean_contains_aggregate(b)
        }
        BooleanExpr::Not(a) | BooleanExpr::Parenthesis(a) => boolean_contains_aggregate(a),
        BooleanExpr::IsNull { expr, .. } => contains_aggregate(expr),
        BooleanExpr::Like { expr, pattern, .. } => {
            contains_aggregate(expr) || contains_aggregate(pattern)
        }
        BooleanExpr::InList { expr, list, .. } => {
            contains_aggregate(expr) || list.iter().any(contains_aggregate)
        }
        BooleanExpr::InSubquery { .. } => false,
    }
}

fn has_aggregation(query: &QuerySpecification) -> bool {
    if !query.group_by.is_empty() {
        return true;
    }
    let select_has = query.select_elements.iter().any(|e| match e {
        SelectElement::Column { expr, .. } => contains_aggregate(expr),
        _ => false,
    });
    let having_has = query
        .having
        .as_ref()
        .map(boolean_contains_aggregate)
        .unwrap_or(false);
    select_has || having_has
}

/// Picks the output alias a grouping/aggregate expression should use: the
/// explicit SELECT-list alias if this exact expression is selected with
/// one, else a generated name (spec §4.5 step 3).
fn explicit_select_alias(query: &QuerySpecification, fp: &str) -> Option<String> {
    query.select_elements.iter().find_map(|e| match e {
        SelectElement::Column {
            expr,
            alias: Some(alias),
        } if fingerprint(expr) == fp => Some(alias.clone()),
        _ => None,
    })
}

fn lower_group_by_and_aggregates(
    query: &QuerySpecification,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    pipeline: &mut Vec<Operator>,
    agg_fingerprints: &mut HashMap<String, ShadowEntry>,
    opts: &CompileOptions,
) -> Result<(), CompileError> {
    if !has_aggregation(query) {
        return Ok(());
    }

    let mut aggregate_calls: Vec<&ScalarExpr> = Vec::new();
    for e in &query.select_elements {
        if let SelectElement::Column { expr, .. } = e {
            collect_aggregate_calls(expr, &mut aggregate_calls);
        }
    }
    if let Some(having) = &query.having {
        collect_aggregate_calls_bool(having, &mut aggregate_calls);
    }
    let mut seen = std::collections::HashSet::new();
    aggregate_calls.retain(|e| seen.insert(fingerprint(e)));

    let use_expression_path = !pipeline.is_empty() || opts.force_aggregate_expression;

    if !use_expression_path {
        match try_native_aggregate(query, &aggregate_calls, arena, fetch, agg_fingerprints) {
            Ok(()) => return Ok(()),
            Err(reason) => {
                debug!("native aggregate lowering not possible ({reason}); falling back to the expression aggregate path");
            }
        }
    }

    lower_expression_aggregate(query, &aggregate_calls, arena, fetch, pipeline, agg_fingerprints)
}

fn collect_aggregate_calls<'a>(expr: &'a ScalarExpr, out: &mut Vec<&'a ScalarExpr>) {
    if aggregate_function_name(expr).is_some() {
        out.push(expr);
    }
}

fn collect_aggregate_calls_bool<'a>(expr: &'a BooleanExpr, out: &mut Vec<&'a ScalarExpr>) {
    match expr {
        BooleanExpr::Comparison { left, right, .. } => {
            collect_aggregate_calls(left, out);
            collect_aggregate_calls(right, out);
        }
        BooleanExpr::And(a, b) | BooleanExpr::Or(a, b) => {
            collect_aggregate_calls_bool(a, out);
            collect_aggregate_calls_bool(b, out);
        }
        BooleanExpr::Not(a) | BooleanExpr::Parenthesis(a) => collect_aggregate_calls_bool(a, out),
        _ => {}
    }
}

/// Tries the native FetchXML grouping/aggregate lowering (spec §4.5 step 3).
/// Returns `Err(reason)` rather than a `CompileError` so the caller falls
/// back to the expression path instead of failing the whole query —
/// `PostProcessingRequired` realized as a plain `Result`, matching the
/// "fallback by exception" redesign of spec §9.
fn try_native_aggregate(
    query: &QuerySpecification,
    aggregate_calls: &[&ScalarExpr],
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    agg_fingerprints: &mut HashMap<String, ShadowEntry>,
) -> Result<(), &'static str> {
    for g in &query.group_by {
        match g {
            ScalarExpr::Column(_) => {}
            ScalarExpr::Function { name, args, .. } if name.eq_ignore_ascii_case("DATEPART") => {
                let part_ok = matches!(args.first(), Some(FunctionArg::DatePart(p)) if to_date_grouping(p).is_some());
                let col_ok = matches!(args.get(1), Some(FunctionArg::Scalar(ScalarExpr::Column(_))));
                if !(part_ok && col_ok) {
                    return Err("unsupported DATEPART grouping");
                }
            }
            _ => return Err("grouping is not a plain column or a recognised DATEPART(column)"),
        }
    }
    for call in aggregate_calls {
        if is_count_star(call) {
            continue;
        }
        let (_, arg, _) = aggregate_function_name(call).expect("filtered to aggregate calls");
        if !matches!(arg, Some(ScalarExpr::Column(_))) {
            return Err("aggregate argument is not a plain column");
        }
    }

    // Validation passed; commit to the native form.
    fetch.aggregate = true;

    for (i, g) in query.group_by.iter().enumerate() {
        let fp = fingerprint(g);
        let alias = explicit_select_alias(query, &fp).unwrap_or_else(|| format!("grp{}", i + 1));
        let (ident, date_part) = match g {
            ScalarExpr::Column(ident) => (ident, None),
            ScalarExpr::Function { args, .. } => {
                let ident = match &args[1] {
                    FunctionArg::Scalar(ScalarExpr::Column(ident)) => ident,
                    _ => unreachable!("validated above"),
                };
                let part = match &args[0] {
                    FunctionArg::DatePart(p) => to_date_grouping(p),
                    _ => None,
                };
                (ident, part)
            }
            _ => unreachable!("validated above"),
        };
        let binding = bind_column(arena, ident).map_err(|_| "unbound grouping column")?;
        let table_idx = binding.table;
        let table_alias = arena.tables[table_idx].display_qualifier().to_string();
        let is_root = arena.tables[table_idx].location_is_root();
        let qualified_alias = if is_root {
            alias.clone()
        } else {
            format!("{table_alias}_{alias}")
        };
        ensure_group_attribute(
            arena,
            fetch,
            table_idx,
            &binding.attribute_name,
            date_part,
            qualified_alias.clone(),
        );
        agg_fingerprints.insert(
            fp,
            ShadowEntry::Calculated {
                output_name: qualified_alias,
                value_type: binding.attr_type,
            },
        );
    }

    let mut generated = 0usize;
    for call in aggregate_calls {
        let fp = fingerprint(call);
        let (name, arg, distinct) = aggregate_function_name(call).expect("filtered to aggregate calls");
        let explicit_alias = explicit_select_alias(query, &fp);
        if is_count_star(call) {
            let table_idx = 0;
            let primary_id = arena.tables[0].metadata.primary_id_attribute.clone();
            generated += 1;
            let alias = explicit_alias.unwrap_or_else(|| format!("{primary_id}_count_{generated}"));
            let items = arena.items_mut(fetch, table_idx);
            items.push(Item::Attribute(Attribute::count_star(primary_id).with_alias(alias.clone())));
            agg_fingerprints.insert(
                fp,
                ShadowEntry::Calculated {
                    output_name: alias,
                    value_type: ValueType::Int,
                },
            );
            continue;
        }
        let ident = match arg {
            Some(ScalarExpr::Column(ident)) => ident,
            _ => unreachable!("validated above"),
        };
        let binding = bind_column(arena, ident).map_err(|_| "unbound aggregate column")?;
        let function = to_aggregate_fn(name, distinct);
        generated += 1;
        let table_alias = arena.tables[binding.table].display_qualifier().to_string();
        let is_root = arena.tables[binding.table].location_is_root();
        let base = format!("{}_{}", binding.attribute_name, name.to_ascii_lowercase());
        let alias = explicit_alias.unwrap_or_else(|| format!("{base}_{generated}"));
        let qualified_alias = if is_root { alias } else { format!("{table_alias}_{alias}") };
        let items = arena.items_mut(fetch, binding.table);
        items.push(Item::Attribute(Attribute {
            name: binding.attribute_name,
            alias: Some(qualified_alias.clone()),
            aggregate: Some(to_wire_aggregate(function)),
            distinct,
            date_grouping: None,
            groupby: false,
        }));
        agg_fingerprints.insert(
            fp,
            ShadowEntry::Calculated {
                output_name: qualified_alias,
                value_type: ValueType::Decimal,
            },
        );
    }
    Ok(())
}

fn ensure_group_attribute(
    arena: &EntityArena,
    fetch: &mut Fetch,
    table_idx: usize,
    attribute_name: &str,
    date_grouping: Option<DateGrouping>,
    alias: String,
) {
    let items = arena.items_mut(fetch, table_idx);
    let already_present = items.iter().any(|item| matches!(
        item,
        Item::Attribute(a) if a.groupby
            && a.name.eq_ignore_ascii_case(attribute_name)
            && a.date_grouping == date_grouping
    ));
    if already_present {
        return;
    }
    items.push(Item::Attribute(Attribute {
        name: attribute_name.to_string(),
        alias: Some(alias),
        aggregate: None,
        distinct: false,
        date_grouping,
        groupby: true,
    }));
}

/// The expression-path grouping/aggregate lowering (spec §4.5 step 3): every
/// referenced column is fetched as a plain attribute, the assembler inserts
/// a `Sort` over the grouping selectors (the `Aggregate` operator requires
/// pre-sorted input), then an `Aggregate` operator.
fn lower_expression_aggregate(
    query: &QuerySpecification,
    aggregate_calls: &[&ScalarExpr],
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    pipeline: &mut Vec<Operator>,
    agg_fingerprints: &mut HashMap<String, ShadowEntry>,
) -> Result<(), CompileError> {
    let mut groupings = Vec::with_capacity(query.group_by.len());
    let mut sort_keys = Vec::with_capacity(query.group_by.len());
    for (i, g) in query.group_by.iter().enumerate() {
        let fp = fingerprint(g);
        let output_name = explicit_select_alias(query, &fp).unwrap_or_else(|| format!("grp{}", i + 1));
        let compiled = compile_scalar_expr(g, arena, fetch, None)?;
        groupings.push(Grouping {
            output_name: output_name.clone(),
            selector: compiled.compiled.clone(),
        });
        sort_keys.push(SortKey {
            is_native_prefix: false,
            selector: compiled.compiled,
            descending: false,
        });
        agg_fingerprints.insert(
            fp,
            ShadowEntry::Calculated {
                output_name,
                value_type: compiled.value_type,
            },
        );
    }
    if !sort_keys.is_empty() {
        pipeline.push(Operator::Sort(sort_keys));
    }

    let mut aggregates = Vec::with_capacity(aggregate_calls.len());
    for (i, call) in aggregate_calls.iter().enumerate() {
        let fp = fingerprint(call);
        let output_name = explicit_select_alias(query, &fp).unwrap_or_else(|| format!("agg{}", i + 1));
        let (name, arg, distinct) = aggregate_function_name(call).expect("filtered to aggregate calls");
        let (function, selector): (AggregateFn, Option<RowSelector>) = if is_count_star(call) {
            (AggregateFn::Count, None)
        } else {
            let arg = arg.ok_or_else(|| CompileError::NotSupportedQueryFragment {
                reason: "aggregate function requires an argument".into(),
                fragment: name.to_string(),
            })?;
            let compiled = compile_scalar_expr(arg, arena, fetch, None)?;
            (to_aggregate_fn(name, distinct), Some(compiled.compiled))
        };
        aggregates.push(AggregateSpec {
            output_name: output_name.clone(),
            function,
            selector,
        });
        agg_fingerprints.insert(
            fp,
            ShadowEntry::Calculated {
                output_name,
                value_type: ValueType::Decimal,
            },
        );
    }
    pipeline.push(Operator::Aggregate { groupings, aggregates });
    Ok(())
}

// ---------------------------------------------------------------------
// 4. SELECT (spec §4.5 step 4)
// ---------------------------------------------------------------------

fn lower_select(
    query: &QuerySpecification,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    pipeline: &mut Vec<Operator>,
    shadow: &mut ShadowColumns,
    agg_fingerprints: &HashMap<String, ShadowEntry>,
) -> Result<Vec<String>, CompileError> {
    let mut columns = Vec::new();
    let mut projections: Vec<(String, RowSelector)> = Vec::new();
    let mut expr_counter = 0usize;

    for element in &query.select_elements {
        match element {
            SelectElement::Star => {
                let is_root = arena.tables[0].location_is_root();
                debug_assert!(is_root);
                let items = arena.items_mut(fetch, 0);
                if !items.iter().any(|i| matches!(i, Item::AllAttributes)) {
                    items.push(Item::AllAttributes);
                }
                let mut names: Vec<String> = arena.tables[0]
                    .metadata
                    .readable_attributes_sorted()
                    .iter()
                    .map(|a| a.logical_name.clone())
                    .collect();
                columns.append(&mut names);
            }
            SelectElement::TableStar(qualifier) => {
                let table_idx = resolve_table_star(arena, qualifier)?;
                let items = arena.items_mut(fetch, table_idx);
                if !items.iter().any(|i| matches!(i, Item::AllAttributes)) {
                    items.push(Item::AllAttributes);
                }
                let mut names: Vec<String> = arena.tables[table_idx]
                    .metadata
                    .readable_attributes_sorted()
                    .iter()
                    .map(|a| a.logical_name.clone())
                    .collect();
                columns.append(&mut names);
            }
            SelectElement::Column { expr, alias } => {
                let fp = fingerprint(expr);
                if let Some(entry) = agg_fingerprints.get(&fp) {
                    let output_name = match entry {
                        ShadowEntry::Calculated { output_name, .. } => output_name.clone(),
                        ShadowEntry::Column(b) => column_key(arena, b.table, &b.attribute_name),
                    };
                    let out_alias = alias.clone().unwrap_or_else(|| output_name.clone());
                    if out_alias != output_name {
                        let compiled = compile_shadow_entry(entry, arena, fetch);
                        projections.push((out_alias.clone(), compiled.compiled));
                    }
                    shadow.define_calculated(&out_alias, out_alias.clone(), value_type_of(entry));
                    columns.push(out_alias);
                    continue;
                }
                match expr {
                    ScalarExpr::Column(ident) => {
                        let binding = bind_column(arena, ident)?;
                        let key = ensure_attribute(arena, fetch, binding.table, &binding.attribute_name);
                        let out_name = alias.clone().unwrap_or_else(|| binding.attribute_name.clone());
                        shadow.define_column(&out_name, binding.clone());
                        if let Some(a) = alias {
                            if a != &key {
                                let key_clone = key.clone();
                                projections.push((
                                    a.clone(),
                                    std::sync::Arc::new(move |row: &crate::value::Row| row.get(&key_clone).clone()),
                                ));
                            }
                        }
                        columns.push(out_name);
                    }
                    _ => {
                        let compiled = compile_scalar_expr(expr, arena, fetch, Some(&*shadow))?;
                        expr_counter += 1;
                        let out_name = alias.clone().unwrap_or_else(|| format!("Expr{expr_counter}"));
                        projections.push((out_name.clone(), compiled.compiled));
                        shadow.define_calculated(&out_name, out_name.clone(), compiled.value_type);
                        columns.push(out_name);
                    }
                }
            }
        }
    }

    if !projections.is_empty() {
        pipeline.push(Operator::Projection(projections));
    }
    Ok(columns)
}

fn value_type_of(entry: &ShadowEntry) -> ValueType {
    match entry {
        ShadowEntry::Column(b) => b.attr_type,
        ShadowEntry::Calculated { value_type, .. } => *value_type,
    }
}

fn resolve_table_star(arena: &EntityArena, qualifier: &str) -> Result<usize, CompileError> {
    arena
        .tables
        .iter()
        .position(|t| t.display_qualifier().eq_ignore_ascii_case(qualifier))
        .ok_or_else(|| CompileError::UnknownTable {
            name: qualifier.to_string(),
        })
}

// ---------------------------------------------------------------------
// 5. DISTINCT (spec §4.5 step 5)
// ---------------------------------------------------------------------

fn lower_distinct(query: &QuerySpecification, fetch: &mut Fetch, pipeline: &mut Vec<Operator>) {
    if query.unique_row_filter != UniqueRowFilter::Distinct {
        return;
    }
    if pipeline.is_empty() {
        fetch.distinct = true;
    } else {
        pipeline.push(Operator::Distinct);
    }
}

// ---------------------------------------------------------------------
// 6. ORDER BY (spec §4.5 step 6)
// ---------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn lower_order_by(
    query: &QuerySpecification,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    pipeline: &mut Vec<Operator>,
    shadow: &ShadowColumns,
    agg_fingerprints: &HashMap<String, ShadowEntry>,
    columns: &[String],
) -> Result<(), CompileError> {
    if query.order_by.is_empty() {
        return Ok(());
    }
    let mut sort_keys = Vec::with_capacity(query.order_by.len());
    for element in &query.order_by {
        lower_order_element(
            element,
            query,
            arena,
            fetch,
            pipeline,
            shadow,
            agg_fingerprints,
            columns,
            &mut sort_keys,
        )?;
    }
    if !sort_keys.is_empty() {
        pipeline.push(Operator::Sort(sort_keys));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn lower_order_element(
    element: &OrderByElement,
    query: &QuerySpecification,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    pipeline: &mut Vec<Operator>,
    shadow: &ShadowColumns,
    agg_fingerprints: &HashMap<String, ShadowEntry>,
    columns: &[String],
    sort_keys: &mut Vec<SortKey>,
) -> Result<(), CompileError> {
    let resolved_expr: ScalarExpr = match &element.key {
        OrderKey::Ordinal(n) => {
            let idx = (*n as usize).checked_sub(1).ok_or_else(|| {
                CompileError::NotSupportedQueryFragment {
                    reason: "ORDER BY ordinal must be 1-based".into(),
                    fragment: n.to_string(),
                }
            })?;
            let name = columns.get(idx).ok_or_else(|| CompileError::NotSupportedQueryFragment {
                reason: "ORDER BY ordinal out of range".into(),
                fragment: n.to_string(),
            })?;
            ScalarExpr::Column(crate::ast::MultiPartIdentifier::single(name.clone()))
        }
        OrderKey::Expr(e) => e.clone(),
    };

    let fp = fingerprint(&resolved_expr);
    if let Some(entry) = agg_fingerprints.get(&fp) {
        let compiled = compile_shadow_entry(entry, arena, fetch);
        sort_keys.push(SortKey {
            is_native_prefix: false,
            selector: compiled.compiled,
            descending: element.descending,
        });
        return Ok(());
    }

    // A plain column with no pipeline yet can be ordered natively; anything
    // else (a calculated column, a compound expression, or any order key
    // once a post-processing step already exists) falls back to Sort.
    if pipeline.is_empty() {
        if let ScalarExpr::Column(ident) = &resolved_expr {
            if shadow.lookup(&column_name(ident)).is_none() {
                if let Ok(binding) = bind_column(arena, ident) {
                    let is_aggregate_fetch = fetch.aggregate;
                    let key = ensure_attribute(arena, fetch, binding.table, &binding.attribute_name);
                    let order_attr = if is_aggregate_fetch { key.clone() } else { binding.attribute_name.clone() };
                    let items = arena.items_mut(fetch, binding.table);
                    items.push(Item::Order(Order {
                        attribute: order_attr,
                        descending: element.descending,
                    }));
                    return Ok(());
                }
            }
        }
    }

    let compiled = compile_scalar_expr(&resolved_expr, arena, fetch, Some(shadow))?;
    sort_keys.push(SortKey {
        is_native_prefix: false,
        selector: compiled.compiled,
        descending: element.descending,
    });
    let _ = query;
    Ok(())
}

fn column_name(ident: &crate::ast::MultiPartIdentifier) -> String {
    ident.parts.last().cloned().unwrap_or_default()
}

// ---------------------------------------------------------------------
// 7. HAVING (spec §4.5 step 7)
// ---------------------------------------------------------------------

fn lower_having(
    query: &QuerySpecification,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    pipeline: &mut Vec<Operator>,
    shadow: &ShadowColumns,
    agg_fingerprints: &HashMap<String, ShadowEntry>,
) -> Result<(), CompileError> {
    let Some(having) = &query.having else {
        return Ok(());
    };
    let rewritten = rewrite_having_aggregates(having, agg_fingerprints);
    let pred = compile_expression_predicate(&rewritten, arena, fetch, Some(shadow))?;
    pipeline.push(Operator::Having(pred));
    Ok(())
}

/// Substitutes any operand that is, verbatim, a known aggregate/grouping
/// expression with a reference to its generated output column (spec §4.5
/// step 3's AST rewrite, realized here as a fingerprint-matched rewrite
/// rather than the source's identity-based visitor — see [`fingerprint`]).
fn rewrite_having_aggregates(
    expr: &BooleanExpr,
    agg_fingerprints: &HashMap<String, ShadowEntry>,
) -> BooleanExpr {
    let rewrite_scalar = |e: &ScalarExpr| -> ScalarExpr {
        if let Some(entry) = agg_fingerprints.get(&fingerprint(e)) {
            let name = match entry {
                ShadowEntry::Calculated { output_name, .. } => output_name.clone(),
                ShadowEntry::Column(_) => return e.clone(),
            };
            return ScalarExpr::Column(crate::ast::MultiPartIdentifier::single(name));
        }
        e.clone()
    };
    match expr {
        BooleanExpr::Comparison { left, op, right } => BooleanExpr::Comparison {
            left: rewrite_scalar(left),
            op: *op,
            right: rewrite_scalar(right),
        },
        BooleanExpr::And(a, b) => BooleanExpr::And(
            Box::new(rewrite_having_aggregates(a, agg_fingerprints)),
            Box::new(rewrite_having_aggregates(b, agg_fingerprints)),
        ),
        BooleanExpr::Or(a, b) => BooleanExpr::Or(
            Box::new(rewrite_having_aggregates(a, agg_fingerprints)),
            Box::new(rewrite_having_aggregates(b, agg_fingerprints)),
        ),
        BooleanExpr::Not(a) => BooleanExpr::Not(Box::new(rewrite_having_aggregates(a, agg_fingerprints))),
        BooleanExpr::Parenthesis(a) => {
            BooleanExpr::Parenthesis(Box::new(rewrite_having_aggregates(a, agg_fingerprints)))
        }
        BooleanExpr::IsNull { expr, negated } => BooleanExpr::IsNull {
            expr: rewrite_scalar(expr),
            negated: *negated,
        },
        BooleanExpr::Like { expr, pattern, negated } => BooleanExpr::Like {
            expr: rewrite_scalar(expr),
            pattern: rewrite_scalar(pattern),
            negated: *negated,
        },
        BooleanExpr::InList { expr, list, negated } => BooleanExpr::InList {
            expr: rewrite_scalar(expr),
            list: list.iter().map(rewrite_scalar).collect(),
            negated: *negated,
        },
        BooleanExpr::InSubquery { fragment } => BooleanExpr::InSubquery {
            fragment: fragment.clone(),
        },
    }
}

// ---------------------------------------------------------------------
// 8. OFFSET (spec §4.5 step 8)
// ---------------------------------------------------------------------

fn lower_offset(query: &QuerySpecification, fetch: &mut Fetch, pipeline: &mut Vec<Operator>) {
    let Some(offset) = query.offset else {
        return;
    };
    if pipeline.is_empty() && offset.fetch > 0 && offset.offset % offset.fetch == 0 {
        fetch.count = Some(offset.fetch);
        fetch.page = Some(offset.offset / offset.fetch + 1);
    } else {
        pipeline.push(Operator::Offset {
            skip: offset.offset as usize,
            take: offset.fetch as usize,
        });
    }
}

// ---------------------------------------------------------------------
// 9. TOP (spec §4.5 step 9)
// ---------------------------------------------------------------------

fn lower_top(
    query: &QuerySpecification,
    fetch: &mut Fetch,
    pipeline: &mut Vec<Operator>,
) -> Result<(), CompileError> {
    let Some(top) = query.top else {
        return Ok(());
    };
    if top.percent || top.with_ties {
        return Err(CompileError::NotSupportedQueryFragment {
            reason: "TOP PERCENT / WITH TIES are not supported".into(),
            fragment: format!("{top:?}"),
        });
    }
    if pipeline.is_empty() {
        fetch.top = Some(top.n);
    } else {
        pipeline.push(Operator::Top(top.n as usize));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{attr, AttributeType, EntityMetadata, InMemoryMetadataProvider};

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
                attr("parentcustomerid", AttributeType::Lookup),
            ],
            display_name: "Contact".into(),
            display_collection_name: "Contacts".into(),
        }
    }

    fn provider() -> InMemoryMetadataProvider {
        InMemoryMetadataProvider::new()
            .with_entity(account())
            .with_entity(contact())
    }

    #[test]
    fn simple_select_has_no_pipeline() {
        let sql = "SELECT accountid, name FROM account";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        assert!(compiled.pipeline.is_empty());
        assert_eq!(compiled.columns, vec!["accountid", "name"]);
        let xml = crate::fetchxml::write_fetch(compiled.fetch.as_ref().unwrap());
        assert!(xml.contains(r#"name="account""#));
        assert!(xml.contains(r#"attribute name="accountid""#));
    }

    #[test]
    fn where_equality_lowers_to_native_condition() {
        let sql = "SELECT accountid, name FROM account WHERE name = 'test'";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        assert!(compiled.pipeline.is_empty());
        let xml = crate::fetchxml::write_fetch(compiled.fetch.as_ref().unwrap());
        assert!(xml.contains(r#"<filter type="and">"#));
        assert!(xml.contains(r#"value="test""#));
    }

    #[test]
    fn column_to_column_where_falls_back_to_where_operator() {
        let sql = "SELECT contactid FROM contact WHERE firstname = lastname";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        assert_eq!(compiled.pipeline.len(), 1);
        assert!(matches!(compiled.pipeline[0], Operator::Where(_)));
        let xml = crate::fetchxml::write_fetch(compiled.fetch.as_ref().unwrap());
        assert!(xml.contains("firstname"));
        assert!(xml.contains("lastname"));
    }

    #[test]
    fn top_after_pipeline_fallback_becomes_an_operator() {
        let sql = "SELECT TOP 10 contactid FROM contact WHERE firstname = lastname";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        assert!(compiled.pipeline.iter().any(|op| matches!(op, Operator::Top(10))));
        assert!(compiled.fetch.as_ref().unwrap().top.is_none());
    }

    #[test]
    fn count_star_group_by_emits_native_aggregate_and_an_alternative() {
        let sql = "SELECT name, count(*) FROM account GROUP BY name ORDER BY 2 DESC";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        assert!(compiled.fetch.as_ref().unwrap().aggregate);
        assert!(compiled.aggregate_alternative.is_some());
        let alt = compiled.aggregate_alternative.unwrap();
        assert!(!alt.fetch.as_ref().unwrap().aggregate);
        assert!(alt.pipeline.iter().any(|op| matches!(op, Operator::Aggregate { .. })));
    }

    #[test]
    fn count_distinct_emits_a_countcolumn_attribute_marked_distinct() {
        let sql = "SELECT name, count(distinct name) FROM account GROUP BY name";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        let xml = crate::fetchxml::write_fetch(compiled.fetch.as_ref().unwrap());
        assert!(xml.contains(r#"aggregate="countcolumn""#));
        assert!(xml.contains(r#"distinct="true""#));
    }

    #[test]
    fn inner_join_produces_a_link_entity_with_the_join_key() {
        let sql = "SELECT c.contactid FROM contact c INNER JOIN account a ON a.accountid = c.parentcustomerid";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        let xml = crate::fetchxml::write_fetch(compiled.fetch.as_ref().unwrap());
        assert!(xml.contains("link-entity"));
        assert!(xml.contains(r#"from="accountid""#));
        assert!(xml.contains(r#"to="parentcustomerid""#));
    }

    #[test]
    fn distinct_is_native_when_pipeline_is_empty() {
        let sql = "SELECT DISTINCT name FROM account";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        assert!(compiled.fetch.as_ref().unwrap().distinct);
        assert!(compiled.pipeline.is_empty());
    }

    #[test]
    fn having_is_always_an_operator() {
        let sql = "SELECT name, count(*) FROM account GROUP BY name HAVING count(*) > 1";
        let compiled = compile_select(sql, &provider(), &CompileOptions::default()).unwrap();
        assert!(compiled.pipeline.iter().any(|op| matches!(op, Operator::Having(_))));
    }
}
