//! Safe SQL building: identifiers validated and quoted, values always bound as parameters.

pub mod builder;
pub mod clause;
pub mod params;

pub use builder::{JoinKind, Order, QueryBuilder};
pub use clause::{ClauseCompiler, ClauseKind, QueryBuf};
pub use params::{bind_all, PgBindValue};
