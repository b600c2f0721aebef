//! The typed SQL AST the compiler consumes (spec §6.1).
//!
//! This is the contract spec §6.1 describes the SQL front end as producing.
//! [`crate::frontend`] is the concrete adapter that builds it from
//! `sqlparser`'s own AST; callers that already run a different front end can
//! construct these types directly and skip `sqlparser` entirely.

#[derive(Debug, Clone)]
pub enum SqlStatement {
    Select(SelectStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Insert(InsertStatement),
}

#[derive(Debug, Clone)]
pub struct SelectStatement {
    pub query: QuerySpecification,
}

#[derive(Debug, Clone)]
pub struct QuerySpecification {
    pub select_elements: Vec<SelectElement>,
    pub from: TableReference,
    pub where_clause: Option<BooleanExpr>,
    pub group_by: Vec<ScalarExpr>,
    pub having: Option<BooleanExpr>,
    pub order_by: Vec<OrderByElement>,
    pub offset: Option<OffsetClause>,
    pub top: Option<TopClause>,
    pub unique_row_filter: UniqueRowFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueRowFilter {
    All,
    Distinct,
}

#[derive(Debug, Clone)]
pub enum SelectElement {
    /// `SELECT *`
    Star,
    /// `SELECT a.*`
    TableStar(String),
    Column {
        expr: ScalarExpr,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct TableReference {
    pub primary: NamedTableReference,
    pub joins: Vec<QualifiedJoin>,
}

#[derive(Debug, Clone)]
pub struct NamedTableReference {
    pub name: String,
    pub alias: Option<String>,
    /// Table hints, e.g. `WITH (NOLOCK)`. Anything other than `NOLOCK` is
    /// rejected during FROM lowering (spec §4.5 step 1).
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone)]
pub struct QualifiedJoin {
    pub join_type: JoinType,
    pub table: NamedTableReference,
    pub on: BooleanExpr,
}

#[derive(Debug, Clone)]
pub struct OrderByElement {
    pub key: OrderKey,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub enum OrderKey {
    Expr(ScalarExpr),
    /// 1-based ordinal into the SELECT list (spec §4.5 step 6).
    Ordinal(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct OffsetClause {
    pub offset: u64,
    pub fetch: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TopClause {
    pub n: u64,
    pub percent: bool,
    pub with_ties: bool,
}

#[derive(Debug, Clone)]
pub struct UpdateStatement {
    pub target: NamedTableReference,
    pub set: Vec<(String, ScalarExpr)>,
    pub where_clause: Option<BooleanExpr>,
}

#[derive(Debug, Clone)]
pub struct DeleteStatement {
    pub target: NamedTableReference,
    pub where_clause: Option<BooleanExpr>,
}

#[derive(Debug, Clone)]
pub struct InsertStatement {
    pub target_entity: String,
    pub columns: Vec<String>,
    pub source: InsertSource,
}

#[derive(Debug, Clone)]
pub enum InsertSource {
    Values(Vec<Vec<ScalarExpr>>),
    Select(Box<SelectStatement>),
}

// ---------------------------------------------------------------------
// Scalar expressions (spec §4.3)
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MultiPartIdentifier {
    /// One part (`name`) or two (`alias.name`).
    pub parts: Vec<String>,
}

impl MultiPartIdentifier {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            parts: vec![name.into()],
        }
    }

    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            parts: vec![qualifier.into(), name.into()],
        }
    }
}

#[derive(Debug, Clone)]
pub enum Literal {
    Integer(i64),
    /// Exact decimal text as written (preserves scale); money/numeric
    /// literals lower to `rust_decimal::Decimal` (spec §4.3).
    Decimal(String),
    Real(f64),
    String(String),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    BitNot,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone)]
pub enum FunctionArg {
    Scalar(ScalarExpr),
    /// The first argument of `DATEADD`/`DATEDIFF`/`DATEPART`: a bare
    /// identifier consumed as a symbol, never evaluated (spec §4.3).
    DatePart(String),
}

#[derive(Debug, Clone)]
pub enum ScalarExpr {
    Column(MultiPartIdentifier),
    Literal(Literal),
    Unary(UnaryOp, Box<ScalarExpr>),
    Binary(Box<ScalarExpr>, BinaryOp, Box<ScalarExpr>),
    Function {
        name: String,
        args: Vec<FunctionArg>,
        /// `true` for `COUNT(DISTINCT col)` (spec §4.5 step 3's
        /// `count-distinct` aggregate); meaningless outside an aggregate
        /// function call.
        distinct: bool,
    },
    SearchedCase {
        when_then: Vec<(BooleanExpr, ScalarExpr)>,
        else_expr: Option<Box<ScalarExpr>>,
    },
    SimpleCase {
        operand: Box<ScalarExpr>,
        when_then: Vec<(ScalarExpr, ScalarExpr)>,
        else_expr: Option<Box<ScalarExpr>>,
    },
}

// ---------------------------------------------------------------------
// Boolean expressions (spec §4.4)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    /// The operator observed when the left/right operands are swapped
    /// (spec §4.4: "direction-sensitive operators are mirrored").
    pub fn mirrored(self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Ne => CompareOp::Ne,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BooleanExpr {
    Comparison {
        left: ScalarExpr,
        op: CompareOp,
        right: ScalarExpr,
    },
    And(Box<BooleanExpr>, Box<BooleanExpr>),
    Or(Box<BooleanExpr>, Box<BooleanExpr>),
    Not(Box<BooleanExpr>),
    Parenthesis(Box<BooleanExpr>),
    IsNull {
        expr: ScalarExpr,
        negated: bool,
    },
    Like {
        expr: ScalarExpr,
        pattern: ScalarExpr,
        negated: bool,
    },
    InList {
        expr: ScalarExpr,
        list: Vec<ScalarExpr>,
        negated: bool,
    },
    /// `IN (SELECT ...)` — always rejected with `UnsupportedSubquery` (spec
    /// §4.4); the caller must rewrite as a join.
    InSubquery {
        fragment: String,
    },
}
