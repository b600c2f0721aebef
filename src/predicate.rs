//! The predicate lowerer (spec §4.4): dual output of either a FetchXML
//! `<filter>/<condition>` tree or an in-memory expression predicate, plus
//! the AND/OR fallback-lifting rule that lets a WHERE clause partially
//! lower even when one conjunct cannot be expressed natively.

use std::cmp::Ordering;
use std::sync::Arc;

use regex::Regex;

use crate::ast::{BooleanExpr, CompareOp, FunctionArg, Literal, MultiPartIdentifier, ScalarExpr};
use crate::binder::{bind_column, EntityArena, ShadowColumns};
use crate::error::{CompileError, Fallback};
use crate::expr::{compile_scalar_expr, ensure_attribute};
use crate::fetchxml::{Condition, Fetch, Filter, FilterItem, FilterType};
use crate::value::{Row, Tribool, Value};

/// Combines a fatal compiler error with the internal
/// [`Fallback`] signal (spec §9's "fallback by exception" redesign,
/// modeled as a sum type) so AND/OR composition can tell "this conjunct
/// needs the expression path" apart from "this query is simply invalid".
enum LowerErr {
    Fatal(CompileError),
    Fallback(Fallback),
}

impl From<CompileError> for LowerErr {
    fn from(e: CompileError) -> Self {
        LowerErr::Fatal(e)
    }
}

type LowerResult<T> = Result<T, LowerErr>;

fn fallback<T>(reason: &'static str, fragment: impl Into<String>) -> LowerResult<T> {
    Err(LowerErr::Fallback(Fallback::new(reason, fragment)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connective {
    And,
    Or,
}

fn flatten_chain<'a>(expr: &'a BooleanExpr, connective: Connective, out: &mut Vec<&'a BooleanExpr>) {
    match (connective, expr) {
        (Connective::And, BooleanExpr::And(l, r)) => {
            flatten_chain(l, connective, out);
            flatten_chain(r, connective, out);
        }
        (Connective::Or, BooleanExpr::Or(l, r)) => {
            flatten_chain(l, connective, out);
            flatten_chain(r, connective, out);
        }
        _ => out.push(expr),
    }
}

/// Lowers one AND- or OR-chain. Under AND, a member that cannot be lowered
/// natively is lifted into the returned residual list and its siblings keep
/// being processed (spec §4.4); under OR, any member failing natively fails
/// the whole chain, since an OR cannot be partially evaluated in FetchXML
/// and partially in memory.
fn lower_chain(
    expr: &BooleanExpr,
    connective: Connective,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
) -> LowerResult<(Filter, Vec<BooleanExpr>)> {
    let mut members = Vec::new();
    flatten_chain(expr, connective, &mut members);
    let mut filter = Filter {
        filter_type: if connective == Connective::And {
            FilterType::And
        } else {
            FilterType::Or
        },
        items: Vec::new(),
    };
    let mut residual = Vec::new();
    for member in &members {
        match lower_member(member, arena, fetch) {
            Ok(item) => filter.items.push(item),
            Err(LowerErr::Fatal(e)) => return Err(LowerErr::Fatal(e)),
            Err(LowerErr::Fallback(f)) if connective == Connective::And => {
                let _ = f;
                residual.push((*member).clone());
            }
            Err(LowerErr::Fallback(f)) => return Err(LowerErr::Fallback(f)),
        }
    }
    Ok((filter, residual))
}

fn lower_member(expr: &BooleanExpr, arena: &mut EntityArena, fetch: &mut Fetch) -> LowerResult<FilterItem> {
    match expr {
        BooleanExpr::And(_, _) => {
            let (filter, residual) = lower_chain(expr, Connective::And, arena, fetch)?;
            if residual.is_empty() {
                Ok(FilterItem::Filter(filter))
            } else {
                fallback(
                    "a nested AND requiring expression fallback cannot be lifted outside the top-level WHERE clause",
                    format!("{expr:?}"),
                )
            }
        }
        BooleanExpr::Or(_, _) => {
            let (filter, _residual) = lower_chain(expr, Connective::Or, arena, fetch)?;
            Ok(FilterItem::Filter(filter))
        }
        BooleanExpr::Parenthesis(inner) => match lower_member(inner, arena, fetch)? {
            FilterItem::Filter(f) => Ok(FilterItem::Filter(f)),
            FilterItem::Condition(c) => Ok(FilterItem::Filter(Filter {
                filter_type: FilterType::And,
                items: vec![FilterItem::Condition(c)],
            })),
        },
        BooleanExpr::Comparison { left, op, right } => {
            lower_comparison(left, *op, right, arena, fetch).map(FilterItem::Condition)
        }
        BooleanExpr::IsNull { expr, negated } => {
            lower_is_null(expr, *negated, arena, fetch).map(FilterItem::Condition)
        }
        BooleanExpr::Like {
            expr,
            pattern,
            negated,
        } => lower_like(expr, pattern, *negated, arena, fetch).map(FilterItem::Condition),
        BooleanExpr::InList {
            expr,
            list,
            negated,
        } => lower_in_list(expr, list, *negated, arena, fetch).map(FilterItem::Condition),
        BooleanExpr::Not(_) => fallback("NOT has no direct FetchXML filter mapping", format!("{expr:?}")),
        BooleanExpr::InSubquery { fragment } => {
            Err(LowerErr::Fatal(CompileError::UnsupportedSubquery {
                fragment: fragment.clone(),
            }))
        }
    }
}

fn wire_operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "eq",
        CompareOp::Ne => "ne",
        CompareOp::Gt => "gt",
        CompareOp::Ge => "ge",
        CompareOp::Lt => "lt",
        CompareOp::Le => "le",
    }
}

fn literal_to_wire_value(lit: &Literal) -> LowerResult<String> {
    match lit {
        Literal::Integer(i) => Ok(i.to_string()),
        Literal::Decimal(text) => Ok(text.clone()),
        Literal::Real(r) => Ok(r.to_string()),
        Literal::String(s) => Ok(s.clone()),
        Literal::Null => fallback("`= NULL` has no native operator; rewrite as IS NULL", "NULL"),
    }
}

/// FetchXML operator-sugar function names (GLOSSARY: "predicates used as
/// FetchXML operator sugar"). The SQL function call `lastxdays(3)` becomes
/// `operator="last-x-days" value="3"`.
fn sugar_operator_name(func_name: &str) -> Option<&'static str> {
    match func_name.to_ascii_uppercase().as_str() {
        "LASTXDAYS" => Some("last-x-days"),
        "NEXTXDAYS" => Some("next-x-days"),
        "LASTXHOURS" => Some("last-x-hours"),
        "NEXTXHOURS" => Some("next-x-hours"),
        "LASTXWEEKS" => Some("last-x-weeks"),
        "LASTXMONTHS" => Some("last-x-months"),
        "LASTXYEARS" => Some("last-x-years"),
        "OLDERTHANXDAYS" => Some("olderthan-x-days"),
        "OLDERTHANXMINUTES" => Some("olderthan-x-minutes"),
        "EQUSERID" => Some("eq-userid"),
        "NEUSERID" => Some("ne-userid"),
        "EQUSERTEAMS" => Some("eq-userteams"),
        "TODAY" => Some("today"),
        "YESTERDAY" => Some("yesterday"),
        "TOMORROW" => Some("tomorrow"),
        "THISWEEK" => Some("this-week"),
        "THISMONTH" => Some("this-month"),
        "THISYEAR" => Some("this-year"),
        "THISFISCALYEAR" => Some("this-fiscal-year"),
        _ => None,
    }
}

fn lower_operator_sugar(
    attribute_name: &str,
    func_name: &str,
    args: &[FunctionArg],
) -> LowerResult<Condition> {
    let operator = match sugar_operator_name(func_name) {
        Some(op) => op,
        None => return fallback("unrecognised operator-sugar function", func_name.to_string()),
    };
    if args.len() > 1 {
        return fallback(
            "operator-sugar functions accept at most one literal parameter",
            func_name.to_string(),
        );
    }
    let mut condition = Condition::new(attribute_name.to_string(), operator);
    if let Some(FunctionArg::Scalar(ScalarExpr::Literal(lit))) = args.first() {
        condition = condition.with_value(literal_to_wire_value(lit)?);
    }
    Ok(condition)
}

/// Conditions attached at the root `<filter>` must carry `entityname` when
/// they target a joined entity's attribute, since the filter is shared by
/// every table in the tree (spec §4.2); a root-table condition needs none.
fn qualify(condition: Condition, arena: &EntityArena, table_idx: usize) -> Condition {
    if arena.tables[table_idx].location_is_root() {
        condition
    } else {
        condition.in_link_entity(arena.tables[table_idx].display_qualifier().to_string())
    }
}

fn lower_column_comparison(
    ident: &MultiPartIdentifier,
    op: CompareOp,
    value_expr: &ScalarExpr,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
) -> LowerResult<Condition> {
    let binding = bind_column(arena, ident)?;
    ensure_attribute(arena, fetch, binding.table, &binding.attribute_name);
    let condition = match value_expr {
        ScalarExpr::Literal(lit) => {
            let value = literal_to_wire_value(lit)?;
            Condition::new(binding.attribute_name, wire_operator(op)).with_value(value)
        }
        ScalarExpr::Function { name, args, .. } if op == CompareOp::Eq => {
            lower_operator_sugar(&binding.attribute_name, name, args)?
        }
        _ => {
            return fallback(
                "comparison value is not a literal or a recognised operator function",
                format!("{value_expr:?}"),
            )
        }
    };
    Ok(qualify(condition, arena, binding.table))
}

fn lower_comparison(
    left: &ScalarExpr,
    op: CompareOp,
    right: &ScalarExpr,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
) -> LowerResult<Condition> {
    match (left, right) {
        (ScalarExpr::Column(_), ScalarExpr::Column(_)) => fallback(
            "column-to-column comparison is not permitted in WHERE",
            format!("{left:?} {op:?} {right:?}"),
        ),
        (ScalarExpr::Column(ident), value_expr) => {
            lower_column_comparison(ident, op, value_expr, arena, fetch)
        }
        (value_expr, ScalarExpr::Column(ident)) => {
            lower_column_comparison(ident, op.mirrored(), value_expr, arena, fetch)
        }
        _ => fallback(
            "comparison requires a column operand",
            format!("{left:?} {op:?} {right:?}"),
        ),
    }
}

fn lower_is_null(
    expr: &ScalarExpr,
    negated: bool,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
) -> LowerResult<Condition> {
    match expr {
        ScalarExpr::Column(ident) => {
            let binding = bind_column(arena, ident)?;
            ensure_attribute(arena, fetch, binding.table, &binding.attribute_name);
            let operator = if negated { "not-null" } else { "null" };
            let condition = Condition::new(binding.attribute_name, operator);
            Ok(qualify(condition, arena, binding.table))
        }
        _ => fallback("IS NULL requires a column operand", format!("{expr:?}")),
    }
}

fn lower_like(
    expr: &ScalarExpr,
    pattern: &ScalarExpr,
    negated: bool,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
) -> LowerResult<Condition> {
    match (expr, pattern) {
        (ScalarExpr::Column(ident), ScalarExpr::Literal(Literal::String(pat))) => {
            let binding = bind_column(arena, ident)?;
            ensure_attribute(arena, fetch, binding.table, &binding.attribute_name);
            let operator = if negated { "not-like" } else { "like" };
            let condition = Condition::new(binding.attribute_name, operator).with_value(pat.clone());
            Ok(qualify(condition, arena, binding.table))
        }
        _ => fallback(
            "LIKE requires a column and a string literal pattern",
            format!("{expr:?} LIKE {pattern:?}"),
        ),
    }
}

fn lower_in_list(
    expr: &ScalarExpr,
    list: &[ScalarExpr],
    negated: bool,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
) -> LowerResult<Condition> {
    match expr {
        ScalarExpr::Column(ident) => {
            let binding = bind_column(arena, ident)?;
            ensure_attribute(arena, fetch, binding.table, &binding.attribute_name);
            let mut values = Vec::with_capacity(list.len());
            for item in list {
                match item {
                    ScalarExpr::Literal(lit) => values.push(literal_to_wire_value(lit)?),
                    _ => return fallback("IN list must be all literals", format!("{item:?}")),
                }
            }
            let operator = if negated { "not-in" } else { "in" };
            let condition = Condition::new(binding.attribute_name, operator).with_values(values);
            Ok(qualify(condition, arena, binding.table))
        }
        _ => fallback("IN requires a column operand", format!("{expr:?}")),
    }
}

/// Lowers a WHERE clause into a root `Filter` plus any conjuncts that had to
/// fall back to the expression path (spec §4.5 step 2). Never fails: a
/// fragment that cannot be lowered at all becomes one residual conjunct.
pub(crate) fn lower_where_clause(
    expr: &BooleanExpr,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
) -> Result<(Filter, Vec<BooleanExpr>), CompileError> {
    let connective = if matches!(expr, BooleanExpr::Or(_, _)) {
        Connective::Or
    } else {
        Connective::And
    };
    match lower_chain(expr, connective, arena, fetch) {
        Ok(result) => Ok(result),
        Err(LowerErr::Fatal(e)) => Err(e),
        Err(LowerErr::Fallback(_)) if connective == Connective::Or => {
            Ok((Filter::indeterminate(), vec![expr.clone()]))
        }
        Err(LowerErr::Fallback(_)) => {
            unreachable!("an AND-chain lowering always lifts its fallbacks into the residual list")
        }
    }
}

/// The join key extracted from an `ON` clause, plus any residual predicate
/// that could be lowered natively alongside it.
pub(crate) struct JoinKey {
    pub from: String,
    pub to: String,
}

/// Lowers a JOIN's `ON` clause (spec §4.5 step 1): exactly one
/// `column = column` comparison designates the join key (the side
/// referencing `new_table_alias` becomes `to`, the other `from`); anything
/// else in the clause becomes a residual filter, which must itself lower
/// natively or the whole join fails with `RewriteAsWhere`.
pub(crate) fn lower_join_on(
    on: &BooleanExpr,
    new_table_alias: &str,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
) -> Result<(JoinKey, Option<Filter>), CompileError> {
    let mut members = Vec::new();
    flatten_chain(on, Connective::And, &mut members);

    let mut join_key: Option<JoinKey> = None;
    let mut residual_members = Vec::new();
    for member in &members {
        if let BooleanExpr::Comparison {
            left: ScalarExpr::Column(l),
            op: CompareOp::Eq,
            right: ScalarExpr::Column(r),
        } = member
        {
            if join_key.is_some() {
                return Err(CompileError::NotSupportedQueryFragment {
                    reason: "a join ON clause may designate the join key only once".into(),
                    fragment: format!("{member:?}"),
                });
            }
            let new_side_is_left = l
                .parts
                .first()
                .map(|p| p.eq_ignore_ascii_case(new_table_alias))
                .unwrap_or(false);
            let (new_side, outer_side) = if new_side_is_left { (l, r) } else { (r, l) };
            let new_binding = bind_column(arena, new_side)?;
            let outer_binding = bind_column(arena, outer_side)?;
            join_key = Some(JoinKey {
                from: outer_binding.attribute_name,
                to: new_binding.attribute_name,
            });
            continue;
        }
        residual_members.push(*member);
    }

    let join_key = join_key.ok_or_else(|| CompileError::NotSupportedQueryFragment {
        reason: "join ON clause must designate a join key via column = column".into(),
        fragment: format!("{on:?}"),
    })?;

    if residual_members.is_empty() {
        return Ok((join_key, None));
    }
    for member in &residual_members {
        if matches!(member, BooleanExpr::Or(_, _)) {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "a join ON clause may not mix the join key with OR".into(),
                fragment: format!("{member:?}"),
            });
        }
    }

    let mut residual_filter = Filter {
        filter_type: FilterType::And,
        items: Vec::new(),
    };
    for member in &residual_members {
        match lower_member(member, arena, fetch) {
            Ok(item) => residual_filter.items.push(item),
            Err(LowerErr::Fatal(e)) => return Err(e),
            Err(LowerErr::Fallback(_)) => {
                return Err(CompileError::RewriteAsWhere {
                    table: new_table_alias.to_string(),
                })
            }
        }
    }
    Ok((join_key, Some(residual_filter)))
}

// ---------------------------------------------------------------------
// Expression-predicate lowering (spec §4.4): used in HAVING, CASE-WHEN
// tests, and as the WHERE fallback tail.
// ---------------------------------------------------------------------

fn compare_tribool(op: CompareOp, lv: &Value, rv: &Value) -> Tribool {
    match op {
        CompareOp::Eq => match lv.three_valued_eq(rv) {
            Tribool::True => Tribool::True,
            _ => Tribool::False,
        },
        CompareOp::Ne => match lv.three_valued_eq(rv) {
            Tribool::True => Tribool::False,
            Tribool::False => Tribool::True,
            Tribool::Unknown => Tribool::False,
        },
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => match lv.three_valued_cmp(rv)
        {
            Some(ord) => Tribool::from_bool(match op {
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                _ => unreachable!(),
            }),
            None => Tribool::False,
        },
    }
}

/// Translates a SQL `LIKE` pattern (`%`/`_` wildcards, no `ESCAPE` support
/// per spec §4.4) into a case-insensitive anchored regex.
fn like_regex(pattern: &str) -> Regex {
    let mut re = String::from("(?is)^");
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).expect("built from escaped literals and two fixed wildcard translations")
}

/// A compiled boolean predicate: a row in, a three-valued result out.
pub(crate) type CompiledPredicate = Arc<dyn Fn(&Row) -> Tribool + Send + Sync>;

pub(crate) fn compile_expression_predicate(
    expr: &BooleanExpr,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    shadow: Option<&ShadowColumns>,
) -> Result<CompiledPredicate, CompileError> {
    match expr {
        BooleanExpr::Comparison { left, op, right } => {
            let l = compile_scalar_expr(left, arena, fetch, shadow)?;
            let r = compile_scalar_expr(right, arena, fetch, shadow)?;
            let op = *op;
            let lf = l.compiled;
            let rf = r.compiled;
            Ok(Arc::new(move |row: &Row| compare_tribool(op, &lf(row), &rf(row))))
        }
        BooleanExpr::And(a, b) => {
            let af = compile_expression_predicate(a, arena, fetch, shadow)?;
            let bf = compile_expression_predicate(b, arena, fetch, shadow)?;
            Ok(Arc::new(move |row: &Row| af(row).and(bf(row))))
        }
        BooleanExpr::Or(a, b) => {
            let af = compile_expression_predicate(a, arena, fetch, shadow)?;
            let bf = compile_expression_predicate(b, arena, fetch, shadow)?;
            Ok(Arc::new(move |row: &Row| af(row).or(bf(row))))
        }
        BooleanExpr::Not(inner) => {
            let f = compile_expression_predicate(inner, arena, fetch, shadow)?;
            Ok(Arc::new(move |row: &Row| f(row).not()))
        }
        BooleanExpr::Parenthesis(inner) => compile_expression_predicate(inner, arena, fetch, shadow),
        BooleanExpr::IsNull { expr, negated } => {
            let e = compile_scalar_expr(expr, arena, fetch, shadow)?;
            let negated = *negated;
            let ef = e.compiled;
            Ok(Arc::new(move |row: &Row| {
                Tribool::from_bool(ef(row).is_null() != negated)
            }))
        }
        BooleanExpr::Like {
            expr,
            pattern,
            negated,
        } => {
            let e = compile_scalar_expr(expr, arena, fetch, shadow)?;
            let p = compile_scalar_expr(pattern, arena, fetch, shadow)?;
            let negated = *negated;
            let ef = e.compiled;
            let pf = p.compiled;
            Ok(Arc::new(move |row: &Row| {
                match (ef(row), pf(row)) {
                    (Value::String(s), Value::String(pat)) => {
                        Tribool::from_bool(like_regex(&pat).is_match(&s) != negated)
                    }
                    _ => Tribool::False,
                }
            }))
        }
        BooleanExpr::InList {
            expr,
            list,
            negated,
        } => {
            let e = compile_scalar_expr(expr, arena, fetch, shadow)?;
            let mut compiled_list = Vec::with_capacity(list.len());
            for item in list {
                compiled_list.push(compile_scalar_expr(item, arena, fetch, shadow)?.compiled);
            }
            let negated = *negated;
            let ef = e.compiled;
            Ok(Arc::new(move |row: &Row| {
                let ev = ef(row);
                let is_in = compiled_list
                    .iter()
                    .any(|f| ev.three_valued_eq(&f(row)) == Tribool::True);
                Tribool::from_bool(is_in != negated)
            }))
        }
        BooleanExpr::InSubquery { fragment } => Err(CompileError::UnsupportedSubquery {
            fragment: fragment.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::MultiPartIdentifier;
    use crate::metadata::{attr, AttributeType, EntityMetadata};

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

    fn col(name: &str) -> ScalarExpr {
        ScalarExpr::Column(MultiPartIdentifier::single(name))
    }

    fn str_lit(s: &str) -> ScalarExpr {
        ScalarExpr::Literal(Literal::String(s.to_string()))
    }

    #[test]
    fn simple_equality_lowers_to_a_condition() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        let expr = BooleanExpr::Comparison {
            left: col("name"),
            op: CompareOp::Eq,
            right: str_lit("test"),
        };
        let (filter, residual) = lower_where_clause(&expr, &mut arena, &mut fetch).unwrap();
        assert!(residual.is_empty());
        assert_eq!(filter.items.len(), 1);
        match &filter.items[0] {
            FilterItem::Condition(c) => {
                assert_eq!(c.attribute, "name");
                assert_eq!(c.operator, "eq");
                assert_eq!(c.value.as_deref(), Some("test"));
            }
            _ => panic!("expected a condition"),
        }
    }

    #[test]
    fn column_to_column_comparison_is_lifted_to_residual_under_and() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        let expr = BooleanExpr::And(
            Box::new(BooleanExpr::Comparison {
                left: col("name"),
                op: CompareOp::Eq,
                right: str_lit("test"),
            }),
            Box::new(BooleanExpr::Comparison {
                left: col("name"),
                op: CompareOp::Eq,
                right: col("revenue"),
            }),
        );
        let (filter, residual) = lower_where_clause(&expr, &mut arena, &mut fetch).unwrap();
        assert_eq!(filter.items.len(), 1);
        assert_eq!(residual.len(), 1);
    }

    #[test]
    fn subquery_in_is_always_fatal() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        let expr = BooleanExpr::InSubquery {
            fragment: "SELECT 1".into(),
        };
        let err = lower_where_clause(&expr, &mut arena, &mut fetch).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedSubquery { .. }));
    }

    #[test]
    fn expression_predicate_treats_null_comparison_as_false_not_unknown() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        let expr = BooleanExpr::Comparison {
            left: ScalarExpr::Literal(Literal::Null),
            op: CompareOp::Eq,
            right: str_lit("x"),
        };
        let pred = compile_expression_predicate(&expr, &mut arena, &mut fetch, None).unwrap();
        let row = Row::new();
        assert_eq!(pred(&row), Tribool::False);
    }

    #[test]
    fn like_pattern_matches_sql_wildcards_case_insensitively() {
        let regex = like_regex("J%n");
        assert!(regex.is_match("John"));
        assert!(regex.is_match("jOHn"));
        assert!(!regex.is_match("Jane"));
    }
}
