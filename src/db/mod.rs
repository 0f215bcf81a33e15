//! The database collaborator: parameterized statement execution, nothing else.

mod postgres;

use crate::error::OrmError;
use async_trait::async_trait;
use serde_json::Value;

pub use postgres::{PgDatabase, PgTransaction};

/// One result row keyed by column name, in select-list order.
pub type Row = serde_json::Map<String, Value>;

/// Executes statements built by the query builder. Values are always passed as
/// positional parameters (`$1..$n`), never spliced into `sql`.
///
/// Every call completes before the caller issues its next statement; retries,
/// timeouts and pooling belong to the implementation.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run a SELECT and return every row.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, OrmError>;

    /// Run a write and return the number of affected rows.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, OrmError>;

    /// Run an INSERT carrying a `RETURNING` clause and return the generated key.
    async fn insert(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, OrmError>;

    /// First column of the first row, if any.
    async fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, OrmError> {
        let rows = self.query(sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v)))
    }
}
