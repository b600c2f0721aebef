//! Post-processing operators (spec §4.6): in-memory row transforms for
//! everything a FetchXML query could not express natively. Each operator
//! consumes and produces a lazy sequence of rows; a few (`Sort`,
//! `Distinct`, `Aggregate`) necessarily buffer their input since their
//! semantics are whole-sequence operations, but none retain state across
//! separate pipeline runs.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::value::{Row, Tribool, Value};

/// A compiled boolean predicate over a row (spec §4.4's expression path).
pub type RowPredicate = Arc<dyn Fn(&Row) -> Tribool + Send + Sync>;

/// A compiled scalar selector over a row (spec §4.3's expression tree).
pub type RowSelector = Arc<dyn Fn(&Row) -> Value + Send + Sync>;

/// One key of a `Sort` operator. `is_native_prefix` records that this key
/// was already satisfied by the FetchXML `<order>` the query executed
/// against — retained for the assembler's own bookkeeping (spec §4.5 step
/// 6); the in-memory comparator itself just compares every key in order,
/// which reproduces "only break ties within native-equal groups" exactly
/// because the native fetch already established the correct relative order
/// for rows that differ on a native-prefix key.
#[derive(Clone)]
pub struct SortKey {
    pub is_native_prefix: bool,
    pub selector: RowSelector,
    pub descending: bool,
}

#[derive(Clone)]
pub struct Grouping {
    pub output_name: String,
    pub selector: RowSelector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    CountColumn,
    CountColumnDistinct,
    Avg,
    Min,
    Max,
    Sum,
}

#[derive(Clone)]
pub struct AggregateSpec {
    pub output_name: String,
    pub function: AggregateFn,
    /// `None` only for `Count` (`count(*)`), which needs no column.
    pub selector: Option<RowSelector>,
}

#[derive(Clone)]
pub enum Operator {
    Where(RowPredicate),
    Projection(Vec<(String, RowSelector)>),
    Sort(Vec<SortKey>),
    Distinct,
    Top(usize),
    Offset { skip: usize, take: usize },
    Having(RowPredicate),
    Aggregate {
        groupings: Vec<Grouping>,
        aggregates: Vec<AggregateSpec>,
    },
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::Where(_) => write!(f, "Where(..)"),
            Operator::Projection(cols) => {
                write!(f, "Projection({:?})", cols.iter().map(|(n, _)| n).collect::<Vec<_>>())
            }
            Operator::Sort(keys) => write!(f, "Sort(len={})", keys.len()),
            Operator::Distinct => write!(f, "Distinct"),
            Operator::Top(n) => write!(f, "Top({n})"),
            Operator::Offset { skip, take } => write!(f, "Offset({skip}, {take})"),
            Operator::Having(_) => write!(f, "Having(..)"),
            Operator::Aggregate { groupings, aggregates } => write!(
                f,
                "Aggregate(groupings={}, aggregates={})",
                groupings.len(),
                aggregates.len()
            ),
        }
    }
}

fn canonical_key(value: &Value) -> String {
    match value {
        Value::Null => "\u{0}".to_string(),
        Value::String(s) => format!("s:{}", s.to_ascii_lowercase()),
        other => format!("v:{other}"),
    }
}

/// NULLs sort before every non-null value, matching default T-SQL ORDER BY
/// behavior; two nulls compare equal.
fn compare_with_nulls(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.three_valued_cmp(b).unwrap_or(Ordering::Equal),
    }
}

fn as_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Int(i) => Some(Decimal::from(*i)),
        Value::Decimal(d) => Some(*d),
        Value::Float(f) => Decimal::try_from(*f).ok(),
        _ => None,
    }
}

fn compute_aggregate(function: AggregateFn, selector: Option<&RowSelector>, rows: &[Row]) -> Value {
    match function {
        AggregateFn::Count => Value::Int(rows.len() as i32),
        AggregateFn::CountColumn => match selector {
            Some(selector) => Value::Int(rows.iter().filter(|r| !selector(r).is_null()).count() as i32),
            None => Value::Int(0),
        },
        AggregateFn::CountColumnDistinct => match selector {
            Some(selector) => {
                let mut seen = HashSet::new();
                for r in rows {
                    let v = selector(r);
                    if !v.is_null() {
                        seen.insert(canonical_key(&v));
                    }
                }
                Value::Int(seen.len() as i32)
            }
            None => Value::Int(0),
        },
        AggregateFn::Sum => match selector {
            Some(selector) => {
                let mut total: Option<Decimal> = None;
                for r in rows {
                    if let Some(d) = as_decimal(&selector(r)) {
                        total = Some(total.unwrap_or(Decimal::ZERO) + d);
                    }
                }
                total.map(Value::Decimal).unwrap_or(Value::Null)
            }
            None => Value::Null,
        },
        AggregateFn::Avg => match selector {
            Some(selector) => {
                let mut total = Decimal::ZERO;
                let mut count = 0i64;
                for r in rows {
                    if let Some(d) = as_decimal(&selector(r)) {
                        total += d;
                        count += 1;
                    }
                }
                if count == 0 {
                    Value::Null
                } else {
                    Value::Decimal(total / Decimal::from(count))
                }
            }
            None => Value::Null,
        },
        AggregateFn::Min | AggregateFn::Max => match selector {
            Some(selector) => {
                let mut best: Option<Value> = None;
                for r in rows {
                    let v = selector(r);
                    if v.is_null() {
                        continue;
                    }
                    best = Some(match best {
                        None => v,
                        Some(cur) => {
                            let keep_new = match v.three_valued_cmp(&cur) {
                                Some(Ordering::Less) => function == AggregateFn::Min,
                                Some(Ordering::Greater) => function == AggregateFn::Max,
                                _ => false,
                            };
                            if keep_new {
                                v
                            } else {
                                cur
                            }
                        }
                    });
                }
                best.unwrap_or(Value::Null)
            }
            None => Value::Null,
        },
    }
}

/// Groups pre-sorted input by key-change detection (spec §4.6).
fn group_rows(
    rows: Box<dyn Iterator<Item = Row>>,
    groupings: &[Grouping],
) -> Vec<(Vec<Value>, Vec<Row>)> {
    let mut groups: Vec<(Vec<String>, Vec<Value>, Vec<Row>)> = Vec::new();
    for row in rows {
        let key_values: Vec<Value> = groupings.iter().map(|g| (g.selector)(&row)).collect();
        let key_strings: Vec<String> = key_values.iter().map(canonical_key).collect();
        if let Some(last) = groups.last_mut() {
            if last.0 == key_strings {
                last.2.push(row);
                continue;
            }
        }
        groups.push((key_strings, key_values, vec![row]));
    }
    groups.into_iter().map(|(_, k, r)| (k, r)).collect()
}

impl Operator {
    pub fn apply(&self, rows: Box<dyn Iterator<Item = Row>>) -> Box<dyn Iterator<Item = Row>> {
        match self {
            Operator::Where(pred) => {
                let pred = pred.clone();
                Box::new(rows.filter(move |row| pred(row).as_filter_pass()))
            }
            Operator::Having(pred) => {
                let pred = pred.clone();
                Box::new(rows.filter(move |row| pred(row).as_filter_pass()))
            }
            Operator::Projection(columns) => {
                let columns = columns.clone();
                Box::new(rows.map(move |mut row| {
                    for (name, selector) in &columns {
                        let value = selector(&row);
                        row.set(name.clone(), value);
                    }
                    row
                }))
            }
            Operator::Sort(keys) => {
                let mut buffered: Vec<Row> = rows.collect();
                buffered.sort_by(|a, b| {
                    for key in keys {
                        let av = (key.selector)(a);
                        let bv = (key.selector)(b);
                        let mut ord = compare_with_nulls(&av, &bv);
                        if key.descending {
                            ord = ord.reverse();
                        }
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
                Box::new(buffered.into_iter())
            }
            Operator::Distinct => {
                let mut seen: HashSet<Vec<String>> = HashSet::new();
                let filtered: Vec<Row> = rows
                    .filter(move |row| {
                        let key: Vec<String> = row.columns().map(|(_, v)| canonical_key(v)).collect();
                        seen.insert(key)
                    })
                    .collect();
                Box::new(filtered.into_iter())
            }
            Operator::Top(n) => Box::new(rows.take(*n)),
            Operator::Offset { skip, take } => Box::new(rows.skip(*skip).take(*take)),
            Operator::Aggregate {
                groupings,
                aggregates,
            } => {
                let groups = group_rows(rows, groupings);
                let mut out = Vec::with_capacity(groups.len());
                for (key_values, group_rows_vec) in groups {
                    let mut row = Row::new();
                    for (grouping, value) in groupings.iter().zip(key_values.into_iter()) {
                        row.set(grouping.output_name.clone(), value);
                    }
                    for spec in aggregates {
                        let value =
                            compute_aggregate(spec.function, spec.selector.as_ref(), &group_rows_vec);
                        row.set(spec.output_name.clone(), value);
                    }
                    out.push(row);
                }
                Box::new(out.into_iter())
            }
        }
    }
}

/// Runs a row sequence through an entire pipeline in append order (spec §3:
/// "the order of application is the order of append").
pub fn apply_pipeline(
    mut rows: Box<dyn Iterator<Item = Row>>,
    pipeline: &[Operator],
) -> Box<dyn Iterator<Item = Row>> {
    for op in pipeline {
        rows = op.apply(rows);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, value: Value) -> Row {
        Row::new().with(name, value)
    }

    fn name_selector() -> RowSelector {
        Arc::new(|row: &Row| row.get("name").clone())
    }

    #[test]
    fn where_filters_out_unknown_as_false() {
        let rows: Vec<Row> = vec![row("name", Value::Null), row("name", Value::String("a".into()))];
        let pred: RowPredicate = Arc::new(|row: &Row| row.get("name").three_valued_eq(&Value::String("a".into())));
        let op = Operator::Where(pred);
        let out: Vec<Row> = op.apply(Box::new(rows.into_iter())).collect();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn distinct_is_case_insensitive_on_strings() {
        let rows = vec![
            row("name", Value::String("Mark".into())),
            row("name", Value::String("mark".into())),
            row("name", Value::String("Jane".into())),
        ];
        let out: Vec<Row> = Operator::Distinct.apply(Box::new(rows.into_iter())).collect();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn top_limits_row_count() {
        let rows: Vec<Row> = (0..5).map(|i| row("n", Value::Int(i))).collect();
        let out: Vec<Row> = Operator::Top(2).apply(Box::new(rows.into_iter())).collect();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn offset_skips_then_takes() {
        let rows: Vec<Row> = (0..10).map(|i| row("n", Value::Int(i))).collect();
        let out: Vec<Row> = Operator::Offset { skip: 3, take: 2 }
            .apply(Box::new(rows.into_iter()))
            .collect();
        let values: Vec<i32> = out
            .iter()
            .map(|r| match r.get("n") {
                Value::Int(i) => *i,
                _ => panic!("expected int"),
            })
            .collect();
        assert_eq!(values, vec![3, 4]);
    }

    #[test]
    fn sort_orders_nulls_first_ascending() {
        let rows = vec![
            row("n", Value::Int(2)),
            row("n", Value::Null),
            row("n", Value::Int(1)),
        ];
        let selector: RowSelector = Arc::new(|row: &Row| row.get("n").clone());
        let op = Operator::Sort(vec![SortKey {
            is_native_prefix: false,
            selector,
            descending: false,
        }]);
        let out: Vec<Row> = op.apply(Box::new(rows.into_iter())).collect();
        assert!(out[0].get("n").is_null());
    }

    #[test]
    fn aggregate_streams_groups_by_key_change() {
        let rows = vec![
            row("name", Value::String("a".into())),
            row("name", Value::String("a".into())),
            row("name", Value::String("b".into())),
        ];
        let op = Operator::Aggregate {
            groupings: vec![Grouping {
                output_name: "grp1".into(),
                selector: name_selector(),
            }],
            aggregates: vec![AggregateSpec {
                output_name: "agg1".into(),
                function: AggregateFn::Count,
                selector: None,
            }],
        };
        let out: Vec<Row> = op.apply(Box::new(rows.into_iter())).collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("agg1"), &Value::Int(2));
        assert_eq!(out[1].get("agg1"), &Value::Int(1));
    }

    #[test]
    fn average_computes_decimal_sum_over_count() {
        let rows = vec![row("v", Value::Int(2)), row("v", Value::Int(4))];
        let op = Operator::Aggregate {
            groupings: vec![],
            aggregates: vec![AggregateSpec {
                output_name: "avg1".into(),
                function: AggregateFn::Avg,
                selector: Some(Arc::new(|row: &Row| row.get("v").clone())),
            }],
        };
        let out: Vec<Row> = op.apply(Box::new(rows.into_iter())).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("avg1"), &Value::Decimal(Decimal::from(3)));
    }
}
