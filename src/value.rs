//! Domain value types and the nullable comparison/arithmetic semantics that
//! back scalar expression evaluation (spec §4.1, §4.3, §4.4).

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use uuid::Uuid;

/// A single cell of a row flowing through the post-processing pipeline.
///
/// Every domain type from spec §4.1's attribute-type table is nullable
/// except `String`, which SQL already treats as nullable via `Value::Null`
/// regardless of the wrapping variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Decimal(Decimal),
    Float(f64),
    String(String),
    Bool(bool),
    Guid(Uuid),
    /// A lookup/customer/owner reference: the referenced entity's logical
    /// name and primary id.
    EntityRef { entity: String, id: Uuid },
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Decimal(_) => "decimal",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::Guid(_) => "guid",
            Value::EntityRef { .. } => "entityref",
            Value::Timestamp(_) => "datetime",
        }
    }

    /// Three-valued equality (spec §4.4): string comparison is
    /// case-insensitive, an entity reference compares equal to a bare guid
    /// when the ids match, and any null operand makes the comparison
    /// `Unknown` rather than `false`.
    pub fn three_valued_eq(&self, other: &Value) -> Tribool {
        if self.is_null() || other.is_null() {
            return Tribool::Unknown;
        }
        Tribool::from_bool(values_equal(self, other))
    }

    pub fn three_valued_cmp(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        compare_non_null(self, other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Int(i) => write!(f, "{i}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Guid(g) => write!(f, "{g}"),
            Value::EntityRef { id, .. } => write!(f, "{id}"),
            Value::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    use Value::*;
    match (a, b) {
        (Int(x), Int(y)) => x == y,
        (Decimal(x), Decimal(y)) => x == y,
        (Float(x), Float(y)) => x == y,
        (String(x), String(y)) => x.eq_ignore_ascii_case(y),
        (Bool(x), Bool(y)) => x == y,
        (Guid(x), Guid(y)) => x == y,
        (EntityRef { id, .. }, Guid(g)) | (Guid(g), EntityRef { id, .. }) => id == g,
        (EntityRef { entity: e1, id: i1 }, EntityRef { entity: e2, id: i2 }) => {
            e1.eq_ignore_ascii_case(e2) && i1 == i2
        }
        (Timestamp(x), Timestamp(y)) => x == y,
        // Cross-type numeric comparisons normalize through Decimal.
        (Int(x), Decimal(y)) | (Decimal(y), Int(x)) => Decimal::from(*x) == *y,
        _ => false,
    }
}

fn compare_non_null(a: &Value, b: &Value) -> Option<Ordering> {
    use Value::*;
    match (a, b) {
        (Int(x), Int(y)) => x.partial_cmp(y),
        (Decimal(x), Decimal(y)) => x.partial_cmp(y),
        (Float(x), Float(y)) => x.partial_cmp(y),
        (Int(x), Decimal(y)) => Decimal::from(*x).partial_cmp(y),
        (Decimal(x), Int(y)) => x.partial_cmp(&Decimal::from(*y)),
        (String(x), String(y)) => Some(x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase())),
        (Timestamp(x), Timestamp(y)) => x.partial_cmp(y),
        (Bool(x), Bool(y)) => x.partial_cmp(y),
        _ => None,
    }
}

/// SQL three-valued logic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tribool {
    True,
    False,
    Unknown,
}

impl Tribool {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Tribool::True
        } else {
            Tribool::False
        }
    }

    /// How FetchXML-observable WHERE/HAVING filtering treats unknown: as
    /// `false`, never as `true` (spec §8 Property 4).
    pub fn as_filter_pass(self) -> bool {
        matches!(self, Tribool::True)
    }

    pub fn and(self, other: Tribool) -> Tribool {
        use Tribool::*;
        match (self, other) {
            (False, _) | (_, False) => False,
            (True, True) => True,
            _ => Unknown,
        }
    }

    pub fn or(self, other: Tribool) -> Tribool {
        use Tribool::*;
        match (self, other) {
            (True, _) | (_, True) => True,
            (False, False) => False,
            _ => Unknown,
        }
    }

    pub fn not(self) -> Tribool {
        match self {
            Tribool::True => Tribool::False,
            Tribool::False => Tribool::True,
            Tribool::Unknown => Tribool::Unknown,
        }
    }
}

/// A single row flowing through the post-processing pipeline (spec §4.6): an
/// ordered, case-insensitively keyed list of named cells. Ordered so a
/// `SELECT *` row preserves the metadata's sorted attribute order; keyed
/// case-insensitively because FetchXML attribute names are.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> &Value {
        self.columns
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self
            .columns
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            slot.1 = value;
        } else {
            self.columns.push((name, value));
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// The nullable domain type an attribute's metadata maps to (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Decimal,
    Float,
    String,
    Bool,
    Guid,
    EntityRef,
    Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_equality_is_case_insensitive() {
        let a = Value::String("Mark".into());
        let b = Value::String("mark".into());
        assert_eq!(a.three_valued_eq(&b), Tribool::True);
    }

    #[test]
    fn null_operand_is_unknown_not_false() {
        let a = Value::Null;
        let b = Value::Int(1);
        assert_eq!(a.three_valued_eq(&b), Tribool::Unknown);
        assert!(!a.three_valued_eq(&b).as_filter_pass());
    }

    #[test]
    fn entity_ref_compares_equal_to_its_guid() {
        let id = Uuid::nil();
        let a = Value::EntityRef {
            entity: "contact".into(),
            id,
        };
        let b = Value::Guid(id);
        assert_eq!(a.three_valued_eq(&b), Tribool::True);
    }

    #[test]
    fn tribool_and_or_follow_kleene_logic() {
        assert_eq!(Tribool::True.and(Tribool::Unknown), Tribool::Unknown);
        assert_eq!(Tribool::False.and(Tribool::Unknown), Tribool::False);
        assert_eq!(Tribool::False.or(Tribool::Unknown), Tribool::Unknown);
        assert_eq!(Tribool::True.or(Tribool::Unknown), Tribool::True);
    }
}
