//! PostgreSQL implementation of [`Database`] over a sqlx pool or transaction.

use super::{Database, Row};
use crate::config::OrmConfig;
use crate::error::OrmError;
use crate::sql::bind_all;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, PgValueFormat};
use sqlx::{Column, Postgres, Transaction, TypeInfo, ValueRef};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        PgDatabase { pool }
    }

    pub async fn connect(config: &OrmConfig) -> Result<Self, OrmError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        tracing::info!(max_connections = config.max_connections, "connected to database");
        Ok(PgDatabase { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction. Pass the result wherever a `&dyn Database` is expected to make
    /// a create/update/delete/cascade sequence atomic, then commit or roll back.
    pub async fn begin(&self) -> Result<PgTransaction, OrmError> {
        let tx = self.pool.begin().await?;
        Ok(PgTransaction { tx: Mutex::new(tx) })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, OrmError> {
        let rows = bind_all(sql, params).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_map).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, OrmError> {
        let done = bind_all(sql, params).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn insert(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, OrmError> {
        let row = bind_all(sql, params).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().and_then(first_cell))
    }

    async fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, OrmError> {
        let row = bind_all(sql, params).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().and_then(first_cell))
    }
}

/// A PostgreSQL transaction usable as a [`Database`]. Statements run one at a time.
pub struct PgTransaction {
    tx: Mutex<Transaction<'static, Postgres>>,
}

impl PgTransaction {
    pub async fn commit(self) -> Result<(), OrmError> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), OrmError> {
        self.tx.into_inner().rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Database for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, OrmError> {
        let mut tx = self.tx.lock().await;
        let rows = bind_all(sql, params).fetch_all(&mut **tx).await?;
        Ok(rows.iter().map(row_to_map).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, OrmError> {
        let mut tx = self.tx.lock().await;
        let done = bind_all(sql, params).execute(&mut **tx).await?;
        Ok(done.rows_affected())
    }

    async fn insert(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, OrmError> {
        let mut tx = self.tx.lock().await;
        let row = bind_all(sql, params).fetch_optional(&mut **tx).await?;
        Ok(row.as_ref().and_then(first_cell))
    }

    async fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, OrmError> {
        let mut tx = self.tx.lock().await;
        let row = bind_all(sql, params).fetch_optional(&mut **tx).await?;
        Ok(row.as_ref().and_then(first_cell))
    }
}

fn row_to_map(row: &PgRow) -> Row {
    use sqlx::Row as _;
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), cell_to_value(row, col.name())))
        .collect()
}

fn first_cell(row: &PgRow) -> Option<Value> {
    use sqlx::Row as _;
    row.columns().first().map(|col| cell_to_value(row, col.name()))
}

/// Try `T` for the cell; `Some` once the column type matched (its value may be NULL).
fn decode<T>(row: &PgRow, name: &str) -> Option<Option<T>>
where
    T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    use sqlx::Row as _;
    row.try_get::<Option<T>, _>(name).ok()
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    if let Some(v) = decode::<i16>(row, name) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<i32>(row, name) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<i64>(row, name) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<f32>(row, name) {
        return v.map(|n| Value::from(f64::from(n))).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<f64>(row, name) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<bool>(row, name) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<uuid::Uuid>(row, name) {
        return v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<chrono::DateTime<chrono::Utc>>(row, name) {
        return v.map(|d| Value::String(d.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<chrono::NaiveDateTime>(row, name) {
        return v
            .map(|d| Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<chrono::NaiveDate>(row, name) {
        return v
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<chrono::NaiveTime>(row, name) {
        return v
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<String>(row, name) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Some(v) = decode::<Value>(row, name) {
        return v.unwrap_or(Value::Null);
    }
    if let Some(v) = decode_array::<i64>(row, name, Value::from) {
        return v;
    }
    if let Some(v) = decode_array::<i32>(row, name, Value::from) {
        return v;
    }
    if let Some(v) = decode_array::<f64>(row, name, Value::from) {
        return v;
    }
    if let Some(v) = decode_array::<bool>(row, name, Value::Bool) {
        return v;
    }
    if let Some(v) = decode_array::<uuid::Uuid>(row, name, |u| Value::String(u.to_string())) {
        return v;
    }
    if let Some(v) = decode_array::<String>(row, name, Value::String) {
        return v;
    }
    raw_to_value(row, name)
}

fn decode_array<T>(row: &PgRow, name: &str, item: impl Fn(T) -> Value) -> Option<Value>
where
    Vec<Option<T>>: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    decode::<Vec<Option<T>>>(row, name).map(|cell| match cell {
        Some(items) => Value::Array(
            items
                .into_iter()
                .map(|x| x.map(&item).unwrap_or(Value::Null))
                .collect(),
        ),
        None => Value::Null,
    })
}

/// Cells no typed decoder accepts: NUMERIC, enums and other text-encoded types.
fn raw_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row as _;
    let Ok(raw) = row.try_get_raw(name) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    let type_name = raw.type_info().name().to_string();
    let text = matches!(raw.format(), PgValueFormat::Text);
    match raw.as_bytes() {
        Ok(bytes) => fallback_value(&type_name, text, bytes).unwrap_or_else(|| {
            tracing::warn!(column = name, pg_type = %type_name, "undecodable column, read as null");
            Value::Null
        }),
        Err(_) => Value::Null,
    }
}

fn fallback_value(type_name: &str, text: bool, bytes: &[u8]) -> Option<Value> {
    if type_name == "NUMERIC" && !text {
        return numeric_text(bytes).map(|s| number_value(&s));
    }
    let s = std::str::from_utf8(bytes).ok()?;
    Some(if type_name == "NUMERIC" {
        number_value(s)
    } else {
        Value::String(s.to_string())
    })
}

/// JSON number when the decimal text survives the conversion, the text itself otherwise.
fn number_value(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::from(i);
    }
    let digits = s.chars().filter(char::is_ascii_digit).count();
    match s.parse::<f64>() {
        Ok(f) if digits <= 15 => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(s.to_string())),
        _ => Value::String(s.to_string()),
    }
}

/// Render PostgreSQL's binary NUMERIC: `ndigits, weight, sign, dscale` words followed by
/// base-10000 digits, the first carrying exponent `weight`.
fn numeric_text(bytes: &[u8]) -> Option<String> {
    let word = |i: usize| -> Option<u16> {
        let b = bytes.get(i * 2..i * 2 + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);
    let negative = match sign {
        0x0000 => false,
        0x4000 => true,
        0xC000 => return Some("NaN".into()),
        0xD000 => return Some("Infinity".into()),
        0xF000 => return Some("-Infinity".into()),
        _ => return None,
    };
    let digits: Vec<u16> = (0..ndigits).map(|i| word(4 + i)).collect::<Option<_>>()?;
    let group = |i: i32| -> u16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if negative && digits.iter().any(|d| *d != 0) {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", group(i)));
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn numeric(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    #[test]
    fn binary_numeric_renders_exact_decimal() {
        // ndigits, weight, sign, dscale, digits...
        assert_eq!(numeric_text(&numeric(&[2, 0, 0, 2, 12, 5000])).unwrap(), "12.50");
        assert_eq!(numeric_text(&numeric(&[2, 1, 0, 0, 12, 3456])).unwrap(), "123456");
        assert_eq!(
            numeric_text(&numeric(&[2, (-1i16) as u16, 0x4000, 7, 1, 2340])).unwrap(),
            "-0.0001234"
        );
        assert_eq!(numeric_text(&numeric(&[0, 0, 0, 0])).unwrap(), "0");
        assert_eq!(numeric_text(&numeric(&[0, 0, 0xC000, 0])).unwrap(), "NaN");
        assert!(numeric_text(&[0, 1]).is_none());
    }

    #[test]
    fn untyped_cells_fall_back_by_type() {
        let price = numeric(&[2, 0, 0, 2, 12, 5000]);
        assert_eq!(fallback_value("NUMERIC", false, &price), Some(json!(12.5)));
        assert_eq!(fallback_value("NUMERIC", true, b"42"), Some(json!(42)));
        assert_eq!(
            fallback_value("NUMERIC", true, b"12345678901234567890.5"),
            Some(json!("12345678901234567890.5"))
        );
        // enum labels travel as text in both formats
        assert_eq!(fallback_value("mood", false, b"happy"), Some(json!("happy")));
        assert_eq!(fallback_value("mood", false, &[0xff, 0xfe]), None);
    }
}
