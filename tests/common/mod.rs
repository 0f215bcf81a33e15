//! Shared fixtures: a scripted in-memory database and the User / Address models.
#![allow(dead_code)]

use async_trait::async_trait;
use metaorm::{Database, Entity, EntityMetadata, Model, OrmError, Row};
use serde_json::Value;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Query,
    Scalar,
    Execute,
    Insert,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Executed {
    pub kind: Kind,
    pub sql: String,
    pub params: Vec<Value>,
}

/// Scripted response for the next statement.
#[derive(Clone, Debug)]
pub enum Reply {
    Rows(Vec<Row>),
    Scalar(Option<Value>),
    Affected(u64),
    Key(Value),
    Fail(String),
}

/// Records every statement and answers from a queue of replies. With the queue empty,
/// reads return nothing, writes affect one row and inserts return no key.
#[derive(Default)]
pub struct MockDatabase {
    replies: Mutex<VecDeque<Reply>>,
    log: Mutex<Vec<Executed>>,
}

/// Route library logs to the test harness; `RUST_LOG=metaorm=debug` shows every statement.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl MockDatabase {
    pub fn new() -> Self {
        init_tracing();
        MockDatabase::default()
    }

    pub fn reply(&self, reply: Reply) -> &Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn rows(&self, rows: Vec<Value>) -> &Self {
        self.reply(Reply::Rows(rows.into_iter().map(row).collect()))
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.log.lock().unwrap().clone()
    }

    pub fn statements(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn last(&self) -> Executed {
        self.log.lock().unwrap().last().cloned().expect("no statement executed")
    }

    pub fn reset_log(&self) {
        self.log.lock().unwrap().clear();
    }

    fn next(&self, kind: Kind, sql: &str, params: &[Value]) -> Option<Reply> {
        self.log.lock().unwrap().push(Executed {
            kind,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        self.replies.lock().unwrap().pop_front()
    }
}

fn fail(msg: String) -> OrmError {
    OrmError::Database(msg.into())
}

#[async_trait]
impl Database for MockDatabase {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, OrmError> {
        match self.next(Kind::Query, sql, params) {
            None => Ok(Vec::new()),
            Some(Reply::Rows(rows)) => Ok(rows),
            Some(Reply::Fail(msg)) => Err(fail(msg)),
            Some(other) => panic!("query `{sql}` got scripted {other:?}"),
        }
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, OrmError> {
        match self.next(Kind::Execute, sql, params) {
            None => Ok(1),
            Some(Reply::Affected(n)) => Ok(n),
            Some(Reply::Fail(msg)) => Err(fail(msg)),
            Some(other) => panic!("execute `{sql}` got scripted {other:?}"),
        }
    }

    async fn insert(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, OrmError> {
        match self.next(Kind::Insert, sql, params) {
            None => Ok(None),
            Some(Reply::Key(k)) => Ok(Some(k)),
            Some(Reply::Fail(msg)) => Err(fail(msg)),
            Some(other) => panic!("insert `{sql}` got scripted {other:?}"),
        }
    }

    async fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, OrmError> {
        match self.next(Kind::Scalar, sql, params) {
            None => Ok(None),
            Some(Reply::Scalar(v)) => Ok(v),
            Some(Reply::Fail(msg)) => Err(fail(msg)),
            Some(other) => panic!("scalar `{sql}` got scripted {other:?}"),
        }
    }
}

/// Object literal to row.
pub fn row(v: Value) -> Row {
    match v {
        Value::Object(map) => map,
        other => panic!("row fixture must be an object, got {other}"),
    }
}

/// Normalize SQL by collapsing whitespace and dropping identifier quotes.
fn canonicalize_sql(sql: &str) -> String {
    let cleaned: String = sql.chars().filter(|c| *c != '"').collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Assert that SQL contains all expected fragments in order.
pub fn assert_sql_contains(actual: &str, fragments: &[&str]) {
    let actual_canonical = canonicalize_sql(actual);
    let mut search_start = 0usize;
    for fragment in fragments {
        let fragment_canonical = canonicalize_sql(fragment);
        match actual_canonical[search_start..].find(&fragment_canonical) {
            Some(pos) => search_start += pos + fragment_canonical.len(),
            None => panic!("expected SQL fragment `{fragment_canonical}` not found in `{actual_canonical}`"),
        }
    }
}

macro_rules! entity_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone)]
        pub struct $name(pub Entity);

        impl From<Entity> for $name {
            fn from(e: Entity) -> Self {
                $name(e)
            }
        }

        impl Deref for $name {
            type Target = Entity;
            fn deref(&self) -> &Entity {
                &self.0
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Entity {
                &mut self.0
            }
        }
    };
}

entity_newtype!(User);
entity_newtype!(Address);

impl Model for User {
    const NAME: &'static str = "User";

    fn declare(meta: &mut EntityMetadata) {
        meta.with_label("user").with_columns(["id", "name", "age"]);
        meta.add_rule("name", "Name", "notEmpty")
            .add_rule("age", "Age", "between(1,120)");
        meta.has_one::<Address>("address");
        meta.has_many::<Address>("addresses");
    }
}

impl Model for Address {
    const NAME: &'static str = "Address";

    fn declare(meta: &mut EntityMetadata) {
        meta.with_columns(["id", "user_id", "addr", "tel"]);
        meta.add_rule("user_id", "User", "notEmpty")
            .add_rule("addr", "Address", "notEmpty")
            .add_rule("tel", "Phone", "notEmpty && digit");
        meta.belongs_to::<User>("user");
    }
}

pub fn user_row(id: i64, name: &str, age: i64) -> Value {
    serde_json::json!({"id": id, "name": name, "age": age})
}

pub fn address_row(id: i64, user_id: i64, addr: &str) -> Value {
    serde_json::json!({"id": id, "user_id": user_id, "addr": addr, "tel": "13800000000"})
}

/// A user as if just read from the database.
pub fn loaded_user(id: i64, name: &str, age: i64) -> User {
    User(Entity::from_row(User::metadata(), row(user_row(id, name, age))))
}

pub fn loaded_address(id: i64, user_id: i64, addr: &str) -> Address {
    Address(Entity::from_row(Address::metadata(), row(address_row(id, user_id, addr))))
}
