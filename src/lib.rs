//! metaorm: metadata-driven entity layer with composable SQL clauses, relations and
//! cascades over PostgreSQL.

pub mod case;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod meta;
pub mod relation;
pub mod sql;

pub use config::OrmConfig;
pub use db::{Database, PgDatabase, PgTransaction, Row};
pub use entity::{Entity, EntityState, Related};
pub use error::{ConfigError, ErrorBody, OrmError, Violation, Violations};
pub use meta::{
    define, lookup, register, register_rule, EntityMetadata, LifecycleEvent, Model, RelationDefinition, RelationKind,
    ValidationRule,
};
pub use sql::{ClauseCompiler, JoinKind, Order, QueryBuf, QueryBuilder};
