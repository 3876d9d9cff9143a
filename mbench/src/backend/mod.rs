//! Storage capability the benchmark drives.
//!
//! A backend adapter provides a [`ConnectionFactory`]; every worker thread
//! opens exactly one [`Connection`] from it and keeps it for its lifetime.

pub mod in_memory;

use thiserror::Error;

use crate::record::Record;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BackendError {
    #[error("the schema has not been created")]
    NoSchema,
    #[error("column count {0} is not positive")]
    InvalidColumnCount(i32),
    #[error("record has {actual} fields, the schema has {expected}")]
    SchemaMismatch { expected: usize, actual: usize },
    #[error("key {0} already exists")]
    DuplicateKey(i64),
    #[error("key {0} does not exist")]
    KeyNotFound(i64),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// One unit of work against the backend. Dropping a transaction without
/// committing discards everything staged in it.
pub trait Transaction {
    fn insert(&mut self, key: i64, record: &Record) -> Result<(), BackendError>;

    fn update(&mut self, key: i64, record: &Record) -> Result<(), BackendError>;

    fn remove(&mut self, key: i64) -> Result<(), BackendError>;

    fn get(&mut self, key: i64) -> Result<(), BackendError>;

    /// Analytic query, the meaning of the returned number is up to the backend.
    fn query1(&mut self) -> Result<i64, BackendError>;

    fn commit(self) -> Result<(), BackendError>;
}

pub trait Connection: Send {
    type Transaction<'connection>: Transaction
    where
        Self: 'connection;

    fn start_transaction(&mut self) -> Result<Self::Transaction<'_>, BackendError>;

    fn create_schema(&mut self, num_columns: i32) -> Result<(), BackendError>;
}

pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection + 'static;

    fn connect(&self) -> Result<Self::Connection, BackendError>;
}
