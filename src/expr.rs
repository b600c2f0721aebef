//! The scalar expression lowerer (spec §4.3): compiles a SQL scalar AST node
//! into a typed, closure-based expression tree evaluated against a single
//! [`Row`] parameter.
//!
//! Per §9's note on the source's shared mutable `ParameterExpression`: there
//! is no global row slot here. Each compiled expression is an
//! `Fn(&Row) -> Value` closure; a fresh `Row` is threaded through at
//! evaluation time, and nested expressions close over their own compiled
//! children rather than a shared parameter.

use std::sync::Arc;

use chrono::{Datelike, Duration, Months, NaiveDateTime, Timelike};
use rust_decimal::Decimal;

use crate::ast::{BinaryOp, FunctionArg, Literal, ScalarExpr, UnaryOp};
use crate::binder::{bind_column, EntityArena, ShadowColumns, ShadowEntry};
use crate::error::CompileError;
use crate::fetchxml::{Attribute, Fetch, Item};
use crate::value::{Row, Value, ValueType};

/// A compiled scalar expression: a row in, a value out.
pub type CompiledExpr = Arc<dyn Fn(&Row) -> Value + Send + Sync>;

/// A compiled expression paired with the domain type it evaluates to.
#[derive(Clone)]
pub struct TypedExpr {
    pub compiled: CompiledExpr,
    pub value_type: ValueType,
}

/// Compiles a scalar expression, adding any referenced column to its owning
/// table's FetchXML items as a side effect (spec §4.3's Column rule).
///
/// `shadow`, when given, is consulted for single-part identifiers before
/// the metadata binder — only ORDER BY/HAVING/CASE-WHEN compilation passes
/// one, matching the shadow table's visibility rule (spec §4.1).
pub(crate) fn compile_scalar_expr(
    expr: &ScalarExpr,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    shadow: Option<&ShadowColumns>,
) -> Result<TypedExpr, CompileError> {
    match expr {
        ScalarExpr::Column(ident) => compile_column(ident, arena, fetch, shadow),
        ScalarExpr::Literal(lit) => compile_literal(lit),
        ScalarExpr::Unary(op, inner) => {
            let inner = compile_scalar_expr(inner, arena, fetch, shadow)?;
            Ok(compile_unary(*op, inner))
        }
        ScalarExpr::Binary(left, op, right) => {
            let left = compile_scalar_expr(left, arena, fetch, shadow)?;
            let right = compile_scalar_expr(right, arena, fetch, shadow)?;
            Ok(compile_binary(*op, left, right))
        }
        ScalarExpr::Function { name, args, .. } => compile_function(name, args, arena, fetch, shadow),
        ScalarExpr::SearchedCase {
            when_then,
            else_expr,
        } => compile_searched_case(when_then, else_expr, arena, fetch, shadow),
        ScalarExpr::SimpleCase {
            operand,
            when_then,
            else_expr,
        } => compile_simple_case(operand, when_then, else_expr, arena, fetch, shadow),
    }
}

fn compile_column(
    ident: &crate::ast::MultiPartIdentifier,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    shadow: Option<&ShadowColumns>,
) -> Result<TypedExpr, CompileError> {
    if ident.parts.len() == 1 {
        if let Some(shadow) = shadow {
            if let Some(entry) = shadow.lookup(&ident.parts[0]) {
                return Ok(compile_shadow_entry(entry, arena, fetch));
            }
        }
    }
    let binding = bind_column(arena, ident)?;
    let key = ensure_attribute(arena, fetch, binding.table, &binding.attribute_name);
    let compiled: CompiledExpr = Arc::new(move |row: &Row| row.get(&key).clone());
    Ok(TypedExpr {
        compiled,
        value_type: binding.attr_type,
    })
}

/// Compiles a reference to an already-bound shadow entry (spec §4.1): a
/// calculated SELECT-list column, or a column re-bound by the GROUP BY
/// rewrite pass (spec §4.5 step 3). Exposed to [`crate::assembler`] so
/// grouping/aggregate aliases can be read back the same way ORDER BY/HAVING
/// read any other shadow entry.
pub(crate) fn compile_shadow_entry(entry: &ShadowEntry, arena: &mut EntityArena, fetch: &mut Fetch) -> TypedExpr {
    match entry {
        ShadowEntry::Column(binding) => {
            let key = ensure_attribute(arena, fetch, binding.table, &binding.attribute_name);
            let compiled: CompiledExpr = Arc::new(move |row: &Row| row.get(&key).clone());
            TypedExpr {
                compiled,
                value_type: binding.attr_type,
            }
        }
        ShadowEntry::Calculated {
            output_name,
            value_type,
        } => {
            let key = output_name.clone();
            let compiled: CompiledExpr = Arc::new(move |row: &Row| row.get(&key).clone());
            TypedExpr {
                compiled,
                value_type: *value_type,
            }
        }
    }
}

/// Adds `attribute_name` to `table_idx`'s own FetchXML items unless it is
/// already requested or subsumed by `<all-attributes/>` (spec §4.3), and
/// returns the row key the attribute's value will be keyed under.
pub(crate) fn ensure_attribute(
    arena: &EntityArena,
    fetch: &mut Fetch,
    table_idx: usize,
    attribute_name: &str,
) -> String {
    let key = column_key(arena, table_idx, attribute_name);
    let is_root = arena.tables[table_idx].location_is_root();
    let items = arena.items_mut(fetch, table_idx);
    let already = items.iter().any(|item| match item {
        Item::Attribute(a) => a.name.eq_ignore_ascii_case(attribute_name),
        Item::AllAttributes => true,
        _ => false,
    });
    if !already {
        let mut attr = Attribute::plain(attribute_name);
        if !is_root {
            attr = attr.with_alias(key.clone());
        }
        items.push(Item::Attribute(attr));
    }
    key
}

/// The row key a bound column's value is stored under: the bare attribute
/// name for the root table, `alias.attribute` for a joined table (so two
/// tables' same-named attributes never collide).
pub(crate) fn column_key(arena: &EntityArena, table_idx: usize, attribute_name: &str) -> String {
    if arena.tables[table_idx].location_is_root() {
        attribute_name.to_string()
    } else {
        format!(
            "{}.{}",
            arena.tables[table_idx].display_qualifier(),
            attribute_name
        )
    }
}

fn compile_literal(lit: &Literal) -> Result<TypedExpr, CompileError> {
    let (value, value_type) = match lit {
        Literal::Integer(i) => (
            Value::Int(i32::try_from(*i).map_err(|_| CompileError::NotSupportedQueryFragment {
                reason: "integer literal out of range".into(),
                fragment: i.to_string(),
            })?),
            ValueType::Int,
        ),
        Literal::Decimal(text) => (
            Value::Decimal(text.parse::<Decimal>().map_err(|_| {
                CompileError::NotSupportedQueryFragment {
                    reason: "malformed decimal literal".into(),
                    fragment: text.clone(),
                }
            })?),
            ValueType::Decimal,
        ),
        Literal::Real(r) => (Value::Float(*r), ValueType::Float),
        Literal::String(s) => (Value::String(s.clone()), ValueType::String),
        Literal::Null => (Value::Null, ValueType::String),
    };
    let compiled: CompiledExpr = Arc::new(move |_: &Row| value.clone());
    Ok(TypedExpr {
        compiled,
        value_type,
    })
}

fn compile_unary(op: UnaryOp, inner: TypedExpr) -> TypedExpr {
    let value_type = inner.value_type;
    let inner_fn = inner.compiled;
    let compiled: CompiledExpr = Arc::new(move |row: &Row| {
        let v = inner_fn(row);
        if v.is_null() {
            return Value::Null;
        }
        match (op, &v) {
            (UnaryOp::Plus, _) => v,
            (UnaryOp::Negate, Value::Int(i)) => Value::Int(-i),
            (UnaryOp::Negate, Value::Decimal(d)) => Value::Decimal(-d),
            (UnaryOp::Negate, Value::Float(f)) => Value::Float(-f),
            (UnaryOp::BitNot, Value::Int(i)) => Value::Int(!i),
            _ => Value::Null,
        }
    });
    TypedExpr {
        compiled,
        value_type,
    }
}

fn numeric_result_type(a: ValueType, b: ValueType) -> ValueType {
    if a == ValueType::Decimal || b == ValueType::Decimal {
        ValueType::Decimal
    } else if a == ValueType::Float || b == ValueType::Float {
        ValueType::Float
    } else {
        ValueType::Int
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

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Decimal(d) => d.to_string().parse().ok(),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn as_i32(v: &Value) -> Option<i32> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Decimal(d) => d.to_string().parse().ok(),
        Value::Float(f) => Some(*f as i32),
        _ => None,
    }
}

fn eval_numeric(op: BinaryOp, lv: &Value, rv: &Value, result_type: ValueType) -> Value {
    match op {
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
            match (as_i32(lv), as_i32(rv)) {
                (Some(l), Some(r)) => Value::Int(match op {
                    BinaryOp::BitAnd => l & r,
                    BinaryOp::BitOr => l | r,
                    BinaryOp::BitXor => l ^ r,
                    _ => unreachable!(),
                }),
                _ => Value::Null,
            }
        }
        _ => match result_type {
            ValueType::Decimal => match (as_decimal(lv), as_decimal(rv)) {
                (Some(l), Some(r)) => match op {
                    BinaryOp::Add => Value::Decimal(l + r),
                    BinaryOp::Subtract => Value::Decimal(l - r),
                    BinaryOp::Multiply => Value::Decimal(l * r),
                    BinaryOp::Divide => Value::Decimal(l / r),
                    BinaryOp::Modulo => Value::Decimal(l % r),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },
            ValueType::Float => match (as_f64(lv), as_f64(rv)) {
                (Some(l), Some(r)) => Value::Float(match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Subtract => l - r,
                    BinaryOp::Multiply => l * r,
                    BinaryOp::Divide => l / r,
                    BinaryOp::Modulo => l % r,
                    _ => return Value::Null,
                }),
                _ => Value::Null,
            },
            _ => match (as_i32(lv), as_i32(rv)) {
                (Some(l), Some(r)) => match op {
                    BinaryOp::Add => Value::Int(l + r),
                    BinaryOp::Subtract => Value::Int(l - r),
                    BinaryOp::Multiply => Value::Int(l * r),
                    BinaryOp::Divide => Value::Int(l / r),
                    BinaryOp::Modulo => Value::Int(l % r),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },
        },
    }
}

fn compile_binary(op: BinaryOp, left: TypedExpr, right: TypedExpr) -> TypedExpr {
    let is_string_concat = op == BinaryOp::Add && left.value_type == ValueType::String;
    let value_type = if is_string_concat {
        ValueType::String
    } else {
        numeric_result_type(left.value_type, right.value_type)
    };
    let l = left.compiled;
    let r = right.compiled;
    let compiled: CompiledExpr = Arc::new(move |row: &Row| {
        let lv = l(row);
        let rv = r(row);
        if is_string_concat {
            return match (&lv, rv.is_null()) {
                (Value::String(s), false) => Value::String(format!("{s}{rv}")),
                _ => Value::Null,
            };
        }
        if lv.is_null() || rv.is_null() {
            return Value::Null;
        }
        eval_numeric(op, &lv, &rv, value_type)
    });
    TypedExpr {
        compiled,
        value_type,
    }
}

fn null_expr() -> CompiledExpr {
    Arc::new(|_: &Row| Value::Null)
}

fn compile_searched_case(
    when_then: &[(crate::ast::BooleanExpr, ScalarExpr)],
    else_expr: &Option<Box<ScalarExpr>>,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    shadow: Option<&ShadowColumns>,
) -> Result<TypedExpr, CompileError> {
    let mut branches = Vec::with_capacity(when_then.len());
    let mut value_type = None;
    for (cond, then) in when_then {
        let pred = crate::predicate::compile_expression_predicate(cond, arena, fetch, shadow)?;
        let then_expr = compile_scalar_expr(then, arena, fetch, shadow)?;
        if value_type.is_none() {
            value_type = Some(then_expr.value_type);
        }
        branches.push((pred, then_expr.compiled));
    }
    let else_compiled = match else_expr {
        Some(e) => compile_scalar_expr(e, arena, fetch, shadow)?.compiled,
        None => null_expr(),
    };
    let compiled: CompiledExpr = Arc::new(move |row: &Row| {
        for (pred, then) in &branches {
            if pred(row).as_filter_pass() {
                return then(row);
            }
        }
        else_compiled(row)
    });
    Ok(TypedExpr {
        compiled,
        value_type: value_type.unwrap_or(ValueType::String),
    })
}

fn compile_simple_case(
    operand: &ScalarExpr,
    when_then: &[(ScalarExpr, ScalarExpr)],
    else_expr: &Option<Box<ScalarExpr>>,
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    shadow: Option<&ShadowColumns>,
) -> Result<TypedExpr, CompileError> {
    let operand_expr = compile_scalar_expr(operand, arena, fetch, shadow)?;
    let mut branches = Vec::with_capacity(when_then.len());
    let mut value_type = None;
    for (when_val, then) in when_then {
        let when_expr = compile_scalar_expr(when_val, arena, fetch, shadow)?;
        let then_expr = compile_scalar_expr(then, arena, fetch, shadow)?;
        if value_type.is_none() {
            value_type = Some(then_expr.value_type);
        }
        branches.push((when_expr.compiled, then_expr.compiled));
    }
    let else_compiled = match else_expr {
        Some(e) => compile_scalar_expr(e, arena, fetch, shadow)?.compiled,
        None => null_expr(),
    };
    let operand_compiled = operand_expr.compiled;
    let compiled: CompiledExpr = Arc::new(move |row: &Row| {
        let operand_val = operand_compiled(row);
        for (when, then) in &branches {
            if operand_val.three_valued_eq(&when(row)).as_filter_pass() {
                return then(row);
            }
        }
        else_compiled(row)
    });
    Ok(TypedExpr {
        compiled,
        value_type: value_type.unwrap_or(ValueType::String),
    })
}

// ---------------------------------------------------------------------
// Function library (spec §4.3, GLOSSARY; DATEPART abbreviations per
// SPEC_FULL.md §F)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatePart {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    Weekday,
    Hour,
    Minute,
    Second,
}

fn normalize_date_part(symbol: &str) -> Result<DatePart, CompileError> {
    Ok(match symbol.to_ascii_lowercase().as_str() {
        "year" | "yy" | "yyyy" => DatePart::Year,
        "quarter" | "qq" | "q" => DatePart::Quarter,
        "month" | "mm" | "m" => DatePart::Month,
        "week" | "wk" | "ww" => DatePart::Week,
        "day" | "dd" | "d" => DatePart::Day,
        "weekday" | "dw" | "w" => DatePart::Weekday,
        "hour" | "hh" => DatePart::Hour,
        "minute" | "mi" | "n" => DatePart::Minute,
        "second" | "ss" | "s" => DatePart::Second,
        // Recognised symbols (spec §4.3's list) with no scalar-expression
        // meaning: a fiscal period/year needs the platform's fiscal
        // calendar configuration, which isn't part of the metadata
        // contract (§6.2) this crate binds against. `DATEPART(year, …)`
        // still works; only these two symbols are out of reach here.
        "fiscalperiod" | "fiscalyear" => {
            return Err(CompileError::NotSupportedQueryFragment {
                reason: "DATEADD/DATEDIFF/DATEPART on fiscalperiod/fiscalyear requires fiscal calendar configuration this crate does not have".into(),
                fragment: symbol.to_string(),
            })
        }
        other => {
            return Err(CompileError::UnknownFunction {
                name: format!("DATEPART part '{other}'"),
            })
        }
    })
}

fn date_part_value(part: DatePart, dt: NaiveDateTime) -> i32 {
    match part {
        DatePart::Year => dt.year(),
        DatePart::Quarter => (dt.month() as i32 - 1) / 3 + 1,
        DatePart::Month => dt.month() as i32,
        DatePart::Week => dt.iso_week().week() as i32,
        DatePart::Day => dt.day() as i32,
        DatePart::Weekday => dt.weekday().num_days_from_sunday() as i32 + 1,
        DatePart::Hour => dt.hour() as i32,
        DatePart::Minute => dt.minute() as i32,
        DatePart::Second => dt.second() as i32,
    }
}

fn date_diff(part: DatePart, start: NaiveDateTime, end: NaiveDateTime) -> i32 {
    match part {
        DatePart::Year => end.year() - start.year(),
        DatePart::Quarter => {
            (end.year() - start.year()) * 4 + (end.month() as i32 - 1) / 3
                - (start.month() as i32 - 1) / 3
        }
        DatePart::Month => (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32,
        DatePart::Week => ((end - start).num_days() / 7) as i32,
        DatePart::Day | DatePart::Weekday => (end - start).num_days() as i32,
        DatePart::Hour => (end - start).num_hours() as i32,
        DatePart::Minute => (end - start).num_minutes() as i32,
        DatePart::Second => (end - start).num_seconds() as i32,
    }
}

fn date_add(part: DatePart, n: i32, dt: NaiveDateTime) -> Option<NaiveDateTime> {
    match part {
        DatePart::Year | DatePart::Quarter | DatePart::Month => {
            let months = match part {
                DatePart::Year => n.saturating_mul(12),
                DatePart::Quarter => n.saturating_mul(3),
                _ => n,
            };
            if months >= 0 {
                dt.checked_add_months(Months::new(months as u32))
            } else {
                dt.checked_sub_months(Months::new((-months) as u32))
            }
        }
        DatePart::Week => dt.checked_add_signed(Duration::weeks(n as i64)),
        DatePart::Day | DatePart::Weekday => dt.checked_add_signed(Duration::days(n as i64)),
        DatePart::Hour => dt.checked_add_signed(Duration::hours(n as i64)),
        DatePart::Minute => dt.checked_add_signed(Duration::minutes(n as i64)),
        DatePart::Second => dt.checked_add_signed(Duration::seconds(n as i64)),
    }
}

fn as_timestamp(v: &Value) -> Option<NaiveDateTime> {
    match v {
        Value::Timestamp(t) => Some(*t),
        _ => None,
    }
}

fn single_date_part_arg(args: &[FunctionArg], name: &str) -> Result<&str, CompileError> {
    match args.first() {
        Some(FunctionArg::DatePart(symbol)) => Ok(symbol.as_str()),
        _ => Err(CompileError::NotSupportedQueryFragment {
            reason: format!("{name} requires a date-part symbol as its first argument"),
            fragment: name.to_string(),
        }),
    }
}

fn scalar_arg<'a>(
    args: &'a [FunctionArg],
    index: usize,
    name: &str,
) -> Result<&'a ScalarExpr, CompileError> {
    match args.get(index) {
        Some(FunctionArg::Scalar(e)) => Ok(e),
        _ => Err(CompileError::NotSupportedQueryFragment {
            reason: format!("{name} requires a scalar argument at position {index}"),
            fragment: name.to_string(),
        }),
    }
}

fn compile_function(
    name: &str,
    args: &[FunctionArg],
    arena: &mut EntityArena,
    fetch: &mut Fetch,
    shadow: Option<&ShadowColumns>,
) -> Result<TypedExpr, CompileError> {
    match name {
        "LEN" => {
            let s = compile_scalar_expr(scalar_arg(args, 0, name)?, arena, fetch, shadow)?;
            let f = s.compiled;
            let compiled: CompiledExpr = Arc::new(move |row: &Row| match f(row) {
                Value::String(s) => Value::Int(s.chars().count() as i32),
                Value::Null => Value::Null,
                other => Value::Int(other.to_string().chars().count() as i32),
            });
            Ok(TypedExpr {
                compiled,
                value_type: ValueType::Int,
            })
        }
        "TRIM" => {
            let s = compile_scalar_expr(scalar_arg(args, 0, name)?, arena, fetch, shadow)?;
            let f = s.compiled;
            let compiled: CompiledExpr = Arc::new(move |row: &Row| match f(row) {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other,
            });
            Ok(TypedExpr {
                compiled,
                value_type: ValueType::String,
            })
        }
        "LEFT" | "RIGHT" => {
            let s = compile_scalar_expr(scalar_arg(args, 0, name)?, arena, fetch, shadow)?;
            let n = compile_scalar_expr(scalar_arg(args, 1, name)?, arena, fetch, shadow)?;
            let sf = s.compiled;
            let nf = n.compiled;
            let from_left = name == "LEFT";
            let compiled: CompiledExpr = Arc::new(move |row: &Row| {
                let sv = sf(row);
                let nv = nf(row);
                match (sv, as_i32(&nv)) {
                    (Value::String(s), Some(n)) => {
                        let n = n.max(0) as usize;
                        let chars: Vec<char> = s.chars().collect();
                        let slice = if from_left {
                            chars.iter().take(n).collect::<String>()
                        } else {
                            let start = chars.len().saturating_sub(n);
                            chars[start..].iter().collect::<String>()
                        };
                        Value::String(slice)
                    }
                    _ => Value::Null,
                }
            });
            Ok(TypedExpr {
                compiled,
                value_type: ValueType::String,
            })
        }
        "SUBSTRING" => {
            let s = compile_scalar_expr(scalar_arg(args, 0, name)?, arena, fetch, shadow)?;
            let start = compile_scalar_expr(scalar_arg(args, 1, name)?, arena, fetch, shadow)?;
            let len = compile_scalar_expr(scalar_arg(args, 2, name)?, arena, fetch, shadow)?;
            let sf = s.compiled;
            let startf = start.compiled;
            let lenf = len.compiled;
            let compiled: CompiledExpr = Arc::new(move |row: &Row| {
                let sv = sf(row);
                let startv = as_i32(&startf(row));
                let lenv = as_i32(&lenf(row));
                match (sv, startv, lenv) {
                    (Value::String(s), Some(start), Some(len)) => {
                        let chars: Vec<char> = s.chars().collect();
                        let start_idx = (start - 1).max(0) as usize;
                        if start_idx >= chars.len() || len <= 0 {
                            Value::String(String::new())
                        } else {
                            let end_idx = (start_idx + len as usize).min(chars.len());
                            Value::String(chars[start_idx..end_idx].iter().collect())
                        }
                    }
                    _ => Value::Null,
                }
            });
            Ok(TypedExpr {
                compiled,
                value_type: ValueType::String,
            })
        }
        "DATEADD" => {
            let part = normalize_date_part(single_date_part_arg(args, name)?)?;
            let n = compile_scalar_expr(scalar_arg(args, 1, name)?, arena, fetch, shadow)?;
            let date = compile_scalar_expr(scalar_arg(args, 2, name)?, arena, fetch, shadow)?;
            let nf = n.compiled;
            let datef = date.compiled;
            let compiled: CompiledExpr = Arc::new(move |row: &Row| {
                match (as_i32(&nf(row)), as_timestamp(&datef(row))) {
                    (Some(n), Some(dt)) => date_add(part, n, dt)
                        .map(Value::Timestamp)
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            });
            Ok(TypedExpr {
                compiled,
                value_type: ValueType::Timestamp,
            })
        }
        "DATEDIFF" => {
            let part = normalize_date_part(single_date_part_arg(args, name)?)?;
            let start = compile_scalar_expr(scalar_arg(args, 1, name)?, arena, fetch, shadow)?;
            let end = compile_scalar_expr(scalar_arg(args, 2, name)?, arena, fetch, shadow)?;
            let startf = start.compiled;
            let endf = end.compiled;
            let compiled: CompiledExpr = Arc::new(move |row: &Row| {
                match (as_timestamp(&startf(row)), as_timestamp(&endf(row))) {
                    (Some(s), Some(e)) => Value::Int(date_diff(part, s, e)),
                    _ => Value::Null,
                }
            });
            Ok(TypedExpr {
                compiled,
                value_type: ValueType::Int,
            })
        }
        "DATEPART" => {
            let part = normalize_date_part(single_date_part_arg(args, name)?)?;
            let date = compile_scalar_expr(scalar_arg(args, 1, name)?, arena, fetch, shadow)?;
            let datef = date.compiled;
            let compiled: CompiledExpr = Arc::new(move |row: &Row| match as_timestamp(&datef(row)) {
                Some(dt) => Value::Int(date_part_value(part, dt)),
                None => Value::Null,
            });
            Ok(TypedExpr {
                compiled,
                value_type: ValueType::Int,
            })
        }
        other => Err(CompileError::UnknownFunction {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::MultiPartIdentifier;
    use crate::binder::EntityArena;
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

    #[test]
    fn binding_a_column_adds_it_to_fetchxml_items_once() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        let ident = MultiPartIdentifier::single("name");
        compile_scalar_expr(&ScalarExpr::Column(ident.clone()), &mut arena, &mut fetch, None)
            .unwrap();
        compile_scalar_expr(&ScalarExpr::Column(ident), &mut arena, &mut fetch, None).unwrap();
        assert_eq!(fetch.entity.items.len(), 1);
    }

    #[test]
    fn null_operand_propagates_through_arithmetic() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        let expr = ScalarExpr::Binary(
            Box::new(ScalarExpr::Literal(Literal::Integer(1))),
            BinaryOp::Add,
            Box::new(ScalarExpr::Literal(Literal::Null)),
        );
        let compiled = compile_scalar_expr(&expr, &mut arena, &mut fetch, None).unwrap();
        let row = Row::new();
        assert_eq!((compiled.compiled)(&row), Value::Null);
    }

    #[test]
    fn string_concatenation_via_plus() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        let expr = ScalarExpr::Binary(
            Box::new(ScalarExpr::Literal(Literal::String("Hello ".into()))),
            BinaryOp::Add,
            Box::new(ScalarExpr::Literal(Literal::String("World".into()))),
        );
        let compiled = compile_scalar_expr(&expr, &mut arena, &mut fetch, None).unwrap();
        let row = Row::new();
        assert_eq!(
            (compiled.compiled)(&row),
            Value::String("Hello World".into())
        );
    }

    #[test]
    fn datepart_recognizes_tsql_abbreviations() {
        assert_eq!(normalize_date_part("yyyy").unwrap(), DatePart::Year);
        assert_eq!(normalize_date_part("qq").unwrap(), DatePart::Quarter);
        assert_eq!(normalize_date_part("mm").unwrap(), DatePart::Month);
        assert!(normalize_date_part("bogus").is_err());
    }

    #[test]
    fn left_and_right_functions_slice_strings() {
        let mut arena = EntityArena::new();
        arena.push_root("account", None, account());
        let mut fetch = Fetch::default();
        let left = ScalarExpr::Function {
            name: "LEFT".into(),
            args: vec![
                FunctionArg::Scalar(ScalarExpr::Literal(Literal::String("abcdef".into()))),
                FunctionArg::Scalar(ScalarExpr::Literal(Literal::Integer(3))),
            ],
            distinct: false,
        };
        let compiled = compile_scalar_expr(&left, &mut arena, &mut fetch, None).unwrap();
        let row = Row::new();
        assert_eq!((compiled.compiled)(&row), Value::String("abc".into()));
    }
}
