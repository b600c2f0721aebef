//! Error kinds for the query compiler (spec §7).
//!
//! [`CompileError`] is the only error type that crosses the compiler's public
//! boundary. [`Fallback`] is an internal control signal used by the predicate
//! and aggregate lowerers to request the expression path instead of FetchXML;
//! it is never wrapped into a [`CompileError`] and must be resolved by the
//! nearest enclosing assembler step.

use thiserror::Error;

/// Fatal errors returned from [`crate::compile_select`] and friends.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("query parse error at line {line}, column {col}: {message}")]
    QueryParse {
        line: usize,
        col: usize,
        message: String,
    },

    #[error("unsupported query fragment ({reason}): {fragment}")]
    NotSupportedQueryFragment { reason: String, fragment: String },

    #[error("column reference `{identifier}` matches more than one table")]
    AmbiguousTable { identifier: String },

    #[error("column reference `{identifier}` matches more than one attribute")]
    AmbiguousAttribute { identifier: String },

    #[error("unknown table `{name}`")]
    UnknownTable { name: String },

    #[error("unknown attribute `{name}` on `{table}`")]
    UnknownAttribute { table: String, name: String },

    #[error("join ON clause for `{table}` cannot be lowered; rewrite the residual into WHERE")]
    RewriteAsWhere { table: String },

    #[error("IN with a subquery is not supported; rewrite `{fragment}` as a join")]
    UnsupportedSubquery { fragment: String },

    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },

    #[error(transparent)]
    Metadata(#[from] anyhow::Error),
}

/// Internal-only signal raised by the predicate and aggregate lowerers when a
/// fragment cannot be expressed natively in FetchXML and must instead be
/// realized by an in-memory operator. Never escapes the crate.
#[derive(Debug, Clone)]
pub(crate) struct Fallback {
    pub reason: &'static str,
    pub fragment: String,
}

impl Fallback {
    pub fn new(reason: &'static str, fragment: impl Into<String>) -> Self {
        Self {
            reason,
            fragment: fragment.into(),
        }
    }
}

pub(crate) type Lowered<T> = Result<T, Fallback>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_messages_name_the_offending_identifier() {
        let err = CompileError::UnknownAttribute {
            table: "account".into(),
            name: "revenuee".into(),
        };
        assert_eq!(
            err.to_string(),
            "unknown attribute `revenuee` on `account`"
        );
    }

    #[test]
    fn metadata_errors_wrap_anyhow_transparently() {
        let inner = anyhow::anyhow!("connection refused");
        let err: CompileError = inner.into();
        assert_eq!(err.to_string(), "connection refused");
    }
}
