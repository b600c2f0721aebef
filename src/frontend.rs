//! Adapter from `sqlparser`'s AST into the compiler's own typed AST
//! ([`crate::ast`]).
//!
//! spec §1/§6.1 treat the SQL front end as an external collaborator whose
//! grammar isn't specified; this module is the concrete default front end,
//! built the same way `rust-sqlpackage`'s `ExtendedTsqlDialect` wraps
//! `MsSqlDialect` to keep `sqlparser`'s internal `dialect_of!` checks (which
//! gate T-SQL-specific grammar) working.

use std::any::TypeId;

use sqlparser::ast::{
    self, BinaryOperator, DuplicateTreatment, Expr, FunctionArg as SpFunctionArg, FunctionArgExpr,
    FunctionArguments, GroupByExpr, JoinConstraint, JoinOperator, OrderByKind, Select, SelectItem,
    SetExpr, Statement, TableFactor, TableWithJoins, UnaryOperator, Value as SpValue,
    ValueWithSpan,
};
use sqlparser::dialect::{Dialect, MsSqlDialect};
use sqlparser::parser::Parser;

use crate::ast::*;
use crate::error::CompileError;

/// A T-SQL dialect for `sqlparser`, reported to the parser as `MsSqlDialect`
/// so the parser's internal feature checks for T-SQL syntax (bracketed
/// identifiers, `TOP`, table hints) stay enabled.
#[derive(Debug, Default)]
pub struct TsqlDialect {
    base: MsSqlDialect,
}

impl TsqlDialect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dialect for TsqlDialect {
    fn dialect(&self) -> TypeId {
        TypeId::of::<MsSqlDialect>()
    }

    fn is_identifier_start(&self, ch: char) -> bool {
        self.base.is_identifier_start(ch)
    }

    fn is_identifier_part(&self, ch: char) -> bool {
        self.base.is_identifier_part(ch)
    }

    fn is_delimited_identifier_start(&self, ch: char) -> bool {
        self.base.is_delimited_identifier_start(ch)
    }

    fn supports_filter_during_aggregation(&self) -> bool {
        self.base.supports_filter_during_aggregation()
    }
}

/// Parses a `;`-separated T-SQL batch into the compiler's own statement AST.
pub fn parse_batch(sql: &str) -> Result<Vec<SqlStatement>, CompileError> {
    let dialect = TsqlDialect::new();
    let statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| CompileError::QueryParse {
            line: 0,
            col: 0,
            message: e.to_string(),
        })?;
    statements.iter().map(lower_statement).collect()
}

fn unsupported(reason: &str, fragment: impl std::fmt::Debug) -> CompileError {
    CompileError::NotSupportedQueryFragment {
        reason: reason.to_string(),
        fragment: format!("{fragment:?}"),
    }
}

fn lower_statement(stmt: &Statement) -> Result<SqlStatement, CompileError> {
    match stmt {
        Statement::Query(query) => Ok(SqlStatement::Select(lower_query(query)?)),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => {
            let target = lower_table_with_joins_primary(table)?;
            let set = assignments
                .iter()
                .map(|a| {
                    let name = a.target.to_string();
                    let expr = lower_expr(&a.value)?;
                    Ok((name, expr))
                })
                .collect::<Result<_, CompileError>>()?;
            let where_clause = selection.as_ref().map(lower_boolean_expr).transpose()?;
            Ok(SqlStatement::Update(UpdateStatement {
                target,
                set,
                where_clause,
            }))
        }
        Statement::Delete(delete) => {
            let table = delete
                .from
                .iter()
                .next()
                .ok_or_else(|| unsupported("DELETE requires a FROM table", delete))?;
            let target = lower_table_with_joins_primary(table)?;
            let where_clause = delete
                .selection
                .as_ref()
                .map(lower_boolean_expr)
                .transpose()?;
            Ok(SqlStatement::Delete(DeleteStatement {
                target,
                where_clause,
            }))
        }
        Statement::Insert(insert) => {
            let target_entity = insert.table.to_string();
            let columns = insert.columns.iter().map(|c| c.value.clone()).collect();
            let source = match &insert.source {
                Some(query) => match query.body.as_ref() {
                    SetExpr::Values(values) => InsertSource::Values(
                        values
                            .rows
                            .iter()
                            .map(|row| row.iter().map(lower_expr).collect())
                            .collect::<Result<_, CompileError>>()?,
                    ),
                    SetExpr::Select(_) => {
                        InsertSource::Select(Box::new(lower_query(query)?))
                    }
                    other => return Err(unsupported("unsupported INSERT source", other)),
                },
                None => return Err(unsupported("INSERT requires VALUES or SELECT", insert)),
            };
            Ok(SqlStatement::Insert(InsertStatement {
                target_entity,
                columns,
                source,
            }))
        }
        other => Err(unsupported("unsupported statement kind", other)),
    }
}

fn lower_query(query: &ast::Query) -> Result<SelectStatement, CompileError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select.as_ref(),
        other => return Err(unsupported("only SELECT query bodies are supported", other)),
    };

    let from = lower_from(&select.from)?;
    let select_elements = select
        .projection
        .iter()
        .map(lower_select_item)
        .collect::<Result<_, CompileError>>()?;
    let where_clause = select
        .selection
        .as_ref()
        .map(lower_boolean_expr)
        .transpose()?;
    let group_by = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => {
            exprs.iter().map(lower_expr).collect::<Result<_, CompileError>>()?
        }
        GroupByExpr::All(_) => return Err(unsupported("GROUP BY ALL is not supported", &select.group_by)),
    };
    let having = select.having.as_ref().map(lower_boolean_expr).transpose()?;
    let order_by = match &query.order_by {
        Some(ob) => lower_order_by(ob)?,
        None => Vec::new(),
    };
    let top = select
        .top
        .as_ref()
        .map(|top| {
            let n = match &top.quantity {
                Some(ast::TopQuantity::Constant(n)) => *n as u64,
                Some(ast::TopQuantity::Expr(e)) => expr_as_u64(e)?,
                None => return Err(unsupported("TOP requires a quantity", top)),
            };
            Ok(TopClause {
                n,
                percent: top.percent,
                with_ties: top.with_ties,
            })
        })
        .transpose()?;
    let offset = lower_offset_fetch(query)?;
    let unique_row_filter = match &select.distinct {
        Some(ast::Distinct::Distinct) => UniqueRowFilter::Distinct,
        Some(ast::Distinct::On(_)) => {
            return Err(unsupported("DISTINCT ON is not supported", &select.distinct))
        }
        None => UniqueRowFilter::All,
    };

    Ok(SelectStatement {
        query: QuerySpecification {
            select_elements,
            from,
            where_clause,
            group_by,
            having,
            order_by,
            offset,
            top,
            unique_row_filter,
        },
    })
}

fn lower_offset_fetch(query: &ast::Query) -> Result<Option<OffsetClause>, CompileError> {
    let offset = match &query.offset {
        Some(o) => expr_as_u64(&o.value)?,
        None => {
            return Ok(query
                .limit
                .as_ref()
                .map(|l| expr_as_u64(l))
                .transpose()?
                .map(|fetch| OffsetClause { offset: 0, fetch }))
        }
    };
    let fetch = query
        .limit
        .as_ref()
        .map(|l| expr_as_u64(l))
        .transpose()?
        .ok_or_else(|| unsupported("OFFSET without FETCH NEXT is not supported", query))?;
    Ok(Some(OffsetClause { offset, fetch }))
}

fn expr_as_u64(expr: &Expr) -> Result<u64, CompileError> {
    match expr {
        Expr::Value(ValueWithSpan {
            value: SpValue::Number(n, _),
            ..
        }) => n
            .parse()
            .map_err(|_| unsupported("expected an integer literal", expr)),
        other => Err(unsupported("expected an integer literal", other)),
    }
}

fn lower_from(from: &[TableWithJoins]) -> Result<TableReference, CompileError> {
    let twj = from
        .first()
        .ok_or_else(|| unsupported("FROM clause is required", from))?;
    if from.len() > 1 {
        return Err(unsupported(
            "comma-separated FROM (ANSI cross join) is not supported",
            from,
        ));
    }
    let primary = lower_table_factor(&twj.relation)?;
    let joins = twj
        .joins
        .iter()
        .map(|j| {
            let table = lower_table_factor(&j.relation)?;
            let (join_type, constraint) = match &j.join_operator {
                JoinOperator::Inner(c) => (JoinType::Inner, c),
                JoinOperator::LeftOuter(c) => (JoinType::LeftOuter, c),
                other => return Err(unsupported("only INNER/LEFT OUTER joins are supported", other)),
            };
            let on = match constraint {
                JoinConstraint::On(expr) => lower_boolean_expr(expr)?,
                other => return Err(unsupported("joins require an ON clause", other)),
            };
            Ok(QualifiedJoin {
                join_type,
                table,
                on,
            })
        })
        .collect::<Result<_, CompileError>>()?;
    Ok(TableReference { primary, joins })
}

fn lower_table_with_joins_primary(
    twj: &TableWithJoins,
) -> Result<NamedTableReference, CompileError> {
    lower_table_factor(&twj.relation)
}

fn lower_table_factor(factor: &TableFactor) -> Result<NamedTableReference, CompileError> {
    match factor {
        TableFactor::Table {
            name,
            alias,
            with_hints,
            ..
        } => {
            let hints = with_hints
                .iter()
                .map(|h| h.to_string().to_ascii_uppercase())
                .collect::<Vec<_>>();
            for hint in &hints {
                if !hint.contains("NOLOCK") {
                    return Err(CompileError::NotSupportedQueryFragment {
                        reason: "unsupported table hint".into(),
                        fragment: hint.clone(),
                    });
                }
            }
            Ok(NamedTableReference {
                name: name.to_string(),
                alias: alias.as_ref().map(|a| a.name.value.clone()),
                hints,
            })
        }
        other => Err(unsupported("only plain table references are supported", other)),
    }
}

fn lower_select_item(item: &SelectItem) -> Result<SelectElement, CompileError> {
    match item {
        SelectItem::Wildcard(_) => Ok(SelectElement::Star),
        SelectItem::QualifiedWildcard(kind, _) => {
            Ok(SelectElement::TableStar(kind.to_string()))
        }
        SelectItem::UnnamedExpr(expr) => Ok(SelectElement::Column {
            expr: lower_expr(expr)?,
            alias: None,
        }),
        SelectItem::ExprWithAlias { expr, alias } => Ok(SelectElement::Column {
            expr: lower_expr(expr)?,
            alias: Some(alias.value.clone()),
        }),
    }
}

fn lower_order_by(order_by: &ast::OrderBy) -> Result<Vec<OrderByElement>, CompileError> {
    let exprs = match &order_by.kind {
        OrderByKind::Expressions(exprs) => exprs,
        OrderByKind::All(_) => return Err(unsupported("ORDER BY ALL is not supported", order_by)),
    };
    exprs
        .iter()
        .map(|o| {
            let descending = o.options.asc == Some(false);
            let key = match &o.expr {
                Expr::Value(ValueWithSpan {
                    value: SpValue::Number(n, _),
                    ..
                }) => OrderKey::Ordinal(n.parse().map_err(|_| {
                    unsupported("expected an ordinal position", &o.expr)
                })?),
                other => OrderKey::Expr(lower_expr(other)?),
            };
            Ok(OrderByElement { key, descending })
        })
        .collect()
}

fn lower_identifier(parts: &[ast::Ident]) -> Result<MultiPartIdentifier, CompileError> {
    match parts.len() {
        1 => Ok(MultiPartIdentifier::single(parts[0].value.clone())),
        2 => Ok(MultiPartIdentifier::qualified(
            parts[0].value.clone(),
            parts[1].value.clone(),
        )),
        _ => Err(CompileError::NotSupportedQueryFragment {
            reason: "only one- or two-part column references are supported".into(),
            fragment: parts
                .iter()
                .map(|p| p.value.clone())
                .collect::<Vec<_>>()
                .join("."),
        }),
    }
}

fn lower_expr(expr: &Expr) -> Result<ScalarExpr, CompileError> {
    match expr {
        Expr::Identifier(ident) => Ok(ScalarExpr::Column(lower_identifier(
            std::slice::from_ref(ident),
        )?)),
        Expr::CompoundIdentifier(parts) => Ok(ScalarExpr::Column(lower_identifier(parts)?)),
        Expr::Value(ValueWithSpan { value, .. }) => Ok(ScalarExpr::Literal(lower_literal(value)?)),
        Expr::UnaryOp { op, expr } => {
            let inner = lower_expr(expr)?;
            let op = match op {
                UnaryOperator::Minus => UnaryOp::Negate,
                UnaryOperator::Plus => UnaryOp::Plus,
                UnaryOperator::PGBitwiseNot => UnaryOp::BitNot,
                other => return Err(unsupported("unsupported unary operator", other)),
            };
            Ok(ScalarExpr::Unary(op, Box::new(inner)))
        }
        Expr::BinaryOp { left, op, right } => {
            let l = lower_expr(left)?;
            let r = lower_expr(right)?;
            let op = match op {
                BinaryOperator::Plus => BinaryOp::Add,
                BinaryOperator::Minus => BinaryOp::Subtract,
                BinaryOperator::Multiply => BinaryOp::Multiply,
                BinaryOperator::Divide => BinaryOp::Divide,
                BinaryOperator::Modulo => BinaryOp::Modulo,
                BinaryOperator::BitwiseAnd => BinaryOp::BitAnd,
                BinaryOperator::BitwiseOr => BinaryOp::BitOr,
                BinaryOperator::BitwiseXor => BinaryOp::BitXor,
                other => return Err(unsupported("unsupported binary operator", other)),
            };
            Ok(ScalarExpr::Binary(Box::new(l), op, Box::new(r)))
        }
        Expr::Nested(inner) => lower_expr(inner),
        Expr::Function(func) => lower_function(func),
        Expr::Case {
            operand,
            conditions,
            results: _,
            else_result,
            ..
        } => lower_case(operand, conditions, else_result),
        other => Err(unsupported("unsupported scalar expression", other)),
    }
}

fn lower_case(
    operand: &Option<Box<Expr>>,
    conditions: &[ast::CaseWhen],
    else_result: &Option<Box<Expr>>,
) -> Result<ScalarExpr, CompileError> {
    let else_expr = else_result
        .as_ref()
        .map(|e| lower_expr(e))
        .transpose()?
        .map(Box::new);
    match operand {
        None => {
            let when_then = conditions
                .iter()
                .map(|w| {
                    let cond = lower_boolean_expr(&w.condition)?;
                    let then = lower_expr(&w.result)?;
                    Ok((cond, then))
                })
                .collect::<Result<_, CompileError>>()?;
            Ok(ScalarExpr::SearchedCase {
                when_then,
                else_expr,
            })
        }
        Some(operand_expr) => {
            let operand = Box::new(lower_expr(operand_expr)?);
            let when_then = conditions
                .iter()
                .map(|w| {
                    let when = lower_expr(&w.condition)?;
                    let then = lower_expr(&w.result)?;
                    Ok((when, then))
                })
                .collect::<Result<_, CompileError>>()?;
            Ok(ScalarExpr::SimpleCase {
                operand,
                when_then,
                else_expr,
            })
        }
    }
}

/// Functions whose first argument is a date-part symbol, not an expression
/// (spec §4.3).
const DATE_PART_FUNCTIONS: &[&str] = &["DATEADD", "DATEDIFF", "DATEPART"];

fn lower_function(func: &ast::Function) -> Result<ScalarExpr, CompileError> {
    let name = func.name.to_string().to_ascii_uppercase();
    let args = match &func.args {
        FunctionArguments::List(list) => &list.args,
        _ => {
            return Ok(ScalarExpr::Function {
                name,
                args: Vec::new(),
                distinct: false,
            })
        }
    };
    let distinct = matches!(
        &func.args,
        FunctionArguments::List(list) if matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct))
    );
    let date_part_function = DATE_PART_FUNCTIONS.contains(&name.as_str());
    let mut out = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let arg_expr = match arg {
            SpFunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => e,
            SpFunctionArg::Unnamed(FunctionArgExpr::Wildcard) => {
                out.push(FunctionArg::Scalar(ScalarExpr::Column(
                    MultiPartIdentifier::single("*"),
                )));
                continue;
            }
            other => return Err(unsupported("unsupported function argument", other)),
        };
        if i == 0 && date_part_function {
            let symbol = match arg_expr {
                Expr::Identifier(ident) => ident.value.clone(),
                other => return Err(unsupported("expected a date-part symbol", other)),
            };
            out.push(FunctionArg::DatePart(symbol));
        } else {
            out.push(FunctionArg::Scalar(lower_expr(arg_expr)?));
        }
    }
    Ok(ScalarExpr::Function {
        name,
        args: out,
        distinct,
    })
}

fn lower_literal(value: &SpValue) -> Result<Literal, CompileError> {
    match value {
        SpValue::Number(n, _) => {
            if n.contains('.') {
                Ok(Literal::Decimal(n.clone()))
            } else {
                n.parse::<i64>()
                    .map(Literal::Integer)
                    .or_else(|_| Ok(Literal::Decimal(n.clone())))
            }
        }
        SpValue::SingleQuotedString(s) | SpValue::DoubleQuotedString(s) => {
            Ok(Literal::String(s.clone()))
        }
        SpValue::Null => Ok(Literal::Null),
        SpValue::Boolean(b) => Ok(Literal::Integer(i64::from(*b))),
        other => Err(unsupported("unsupported literal", other)),
    }
}

fn lower_boolean_expr(expr: &Expr) -> Result<BooleanExpr, CompileError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(BooleanExpr::And(
                Box::new(lower_boolean_expr(left)?),
                Box::new(lower_boolean_expr(right)?),
            )),
            BinaryOperator::Or => Ok(BooleanExpr::Or(
                Box::new(lower_boolean_expr(left)?),
                Box::new(lower_boolean_expr(right)?),
            )),
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq => {
                let cmp = match op {
                    BinaryOperator::Eq => CompareOp::Eq,
                    BinaryOperator::NotEq => CompareOp::Ne,
                    BinaryOperator::Gt => CompareOp::Gt,
                    BinaryOperator::GtEq => CompareOp::Ge,
                    BinaryOperator::Lt => CompareOp::Lt,
                    BinaryOperator::LtEq => CompareOp::Le,
                    _ => unreachable!(),
                };
                Ok(BooleanExpr::Comparison {
                    left: lower_expr(left)?,
                    op: cmp,
                    right: lower_expr(right)?,
                })
            }
            other => Err(unsupported("unsupported boolean binary operator", other)),
        },
        Expr::Nested(inner) => Ok(BooleanExpr::Parenthesis(Box::new(lower_boolean_expr(inner)?))),
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(BooleanExpr::Not(Box::new(lower_boolean_expr(expr)?))),
        Expr::IsNull(e) => Ok(BooleanExpr::IsNull {
            expr: lower_expr(e)?,
            negated: false,
        }),
        Expr::IsNotNull(e) => Ok(BooleanExpr::IsNull {
            expr: lower_expr(e)?,
            negated: true,
        }),
        Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => Ok(BooleanExpr::Like {
            expr: lower_expr(expr)?,
            pattern: lower_expr(pattern)?,
            negated: *negated,
        }),
        Expr::InList {
            expr,
            list,
            negated,
        } => Ok(BooleanExpr::InList {
            expr: lower_expr(expr)?,
            list: list.iter().map(lower_expr).collect::<Result<_, _>>()?,
            negated: *negated,
        }),
        Expr::InSubquery { negated: _, .. } => Ok(BooleanExpr::InSubquery {
            fragment: expr.to_string(),
        }),
        other => Err(unsupported("unsupported boolean expression", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_select() {
        let stmts = parse_batch("SELECT accountid, name FROM account").unwrap();
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            SqlStatement::Select(s) => {
                assert_eq!(s.query.select_elements.len(), 2);
                assert_eq!(s.query.from.primary.name, "account");
            }
            _ => panic!("expected a SELECT"),
        }
    }

    #[test]
    fn parses_where_and_order_by_ordinal() {
        let stmts =
            parse_batch("SELECT name FROM account WHERE name = 'test' ORDER BY 1 DESC").unwrap();
        match &stmts[0] {
            SqlStatement::Select(s) => {
                assert!(s.query.where_clause.is_some());
                assert!(matches!(
                    s.query.order_by[0].key,
                    OrderKey::Ordinal(1)
                ));
                assert!(s.query.order_by[0].descending);
            }
            _ => panic!("expected a SELECT"),
        }
    }

    #[test]
    fn rejects_cross_join() {
        let err = parse_batch("SELECT 1 FROM a, b").unwrap_err();
        assert!(matches!(err, CompileError::NotSupportedQueryFragment { .. }));
    }
}
