//! Convert serde_json::Value parameters to typed sqlx binds.

use serde_json::Value;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

/// A value that can be bound to a PostgreSQL query. Converts from serde_json::Value.
#[derive(Clone, Debug, PartialEq)]
pub enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Uuid(uuid::Uuid),
    Json(Value),
}

impl PgBindValue {
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => PgBindValue::Null,
            Value::Bool(b) => PgBindValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PgBindValue::I64(i),
                // u64 above i64::MAX and non-integers
                None => PgBindValue::F64(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => match uuid::Uuid::parse_str(s) {
                Ok(u) => PgBindValue::Uuid(u),
                Err(_) => PgBindValue::String(s.clone()),
            },
            Value::Array(_) | Value::Object(_) => PgBindValue::Json(v.clone()),
        }
    }

    /// Bind onto `query` with the PostgreSQL type matching the variant.
    pub fn bind_to<'q>(self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        match self {
            PgBindValue::Null => query.bind(Option::<i32>::None),
            PgBindValue::Bool(b) => query.bind(b),
            PgBindValue::I64(n) => query.bind(n),
            PgBindValue::F64(n) => query.bind(n),
            PgBindValue::String(s) => query.bind(s),
            PgBindValue::Uuid(u) => query.bind(u),
            PgBindValue::Json(v) => query.bind(sqlx::types::Json(v)),
        }
    }
}

/// Prepare `sql` with every parameter bound in order.
pub fn bind_all<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, p| PgBindValue::from_json(p).bind_to(query))
}
