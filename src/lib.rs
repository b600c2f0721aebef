//! Compiles a T-SQL query batch into FetchXML query plans plus an in-memory
//! post-processing pipeline.
//!
//! The public surface is deliberately small: [`compile_select`] for
//! `SELECT`, [`compile_update`]/[`compile_delete`]/[`compile_insert`] for
//! DML, the [`CompileOptions`] batch-level toggles, the
//! [`MetadataProvider`] trait every caller implements against their own
//! entity metadata, and [`operators::apply_pipeline`] to run a compiled
//! query's post-processing pipeline over the rows a FetchXML execution
//! returned.

pub mod aggregate_alt;
pub mod assembler;
pub mod ast;
pub mod binder;
pub mod dml;
pub mod error;
pub mod expr;
pub mod fetchxml;
pub mod frontend;
pub mod metadata;
pub mod operators;
pub mod predicate;
pub mod value;

pub use aggregate_alt::{AggregateLimitClassifier, SubstringAggregateLimitClassifier};
pub use assembler::{compile_select, CompileOptions, CompiledSelect};
pub use dml::{
    compile_delete, compile_insert, compile_update, CompiledDelete, CompiledInsert,
    CompiledInsertSource, CompiledUpdate, RowExpr,
};
pub use error::CompileError;
pub use metadata::{AttributeType, EntityMetadata, ManyToManyRelationship, MetadataProvider};
pub use operators::{apply_pipeline, Operator};
pub use value::{Row, Tribool, Value, ValueType};

#[cfg(any(test, feature = "test-util"))]
pub use metadata::InMemoryMetadataProvider;
