//! Builds parameterized SELECT, COUNT, INSERT, UPDATE, DELETE from an entity's metadata and
//! the accumulated clauses, and runs them against a [`Database`].

use super::clause::{quoted, ClauseCompiler, QueryBuf, GROUP_BY, HAVING, JOIN, ORDER_BY, WHERE};
use crate::db::{Database, Row};
use crate::entity::Entity;
use crate::error::OrmError;
use crate::meta::EntityMetadata;
use crate::relation;
use serde_json::Value;
use std::fmt::Write as _;

/// Sort direction for [`QueryBuilder::order_by`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub fn as_str(&self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Right,
}

impl JoinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
        }
    }
}

/// Query state for one entity type. Clause methods consume and return the builder, so a
/// cloned builder can be narrowed further without affecting the original.
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    meta: &'static EntityMetadata,
    alias: Option<String>,
    joins: ClauseCompiler,
    wheres: ClauseCompiler,
    groups: ClauseCompiler,
    havings: ClauseCompiler,
    orders: ClauseCompiler,
    limit: Option<u64>,
    offset: Option<u64>,
    with: Vec<String>,
}

impl QueryBuilder {
    pub(crate) fn new(meta: &'static EntityMetadata) -> Self {
        QueryBuilder {
            meta,
            alias: None,
            joins: ClauseCompiler::new(&JOIN),
            wheres: ClauseCompiler::new(&WHERE),
            groups: ClauseCompiler::new(&GROUP_BY),
            havings: ClauseCompiler::new(&HAVING),
            orders: ClauseCompiler::new(&ORDER_BY),
            limit: None,
            offset: None,
            with: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &'static EntityMetadata {
        self.meta
    }

    /// Relations recorded for eager loading, in request order.
    pub fn eager_relations(&self) -> &[String] {
        &self.with
    }

    /// `column = value`.
    pub fn r#where(self, column: &str, value: impl Into<Value>) -> Result<Self, OrmError> {
        self.where_op(column, "=", value)
    }

    pub fn where_op(mut self, column: &str, op: &str, value: impl Into<Value>) -> Result<Self, OrmError> {
        self.wheres
            .add_subexpression(vec![column.into(), op.into(), value.into()])?;
        Ok(self)
    }

    pub fn having(self, column: &str, value: impl Into<Value>) -> Result<Self, OrmError> {
        self.having_op(column, "=", value)
    }

    pub fn having_op(mut self, column: &str, op: &str, value: impl Into<Value>) -> Result<Self, OrmError> {
        self.havings
            .add_subexpression(vec![column.into(), op.into(), value.into()])?;
        Ok(self)
    }

    pub fn group_by(mut self, column: &str) -> Result<Self, OrmError> {
        self.groups.add_subexpression(vec![column.into()])?;
        Ok(self)
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Result<Self, OrmError> {
        self.orders
            .add_subexpression(vec![column.into(), order.as_str().into()])?;
        Ok(self)
    }

    /// `<kind> JOIN table ON left = right`.
    pub fn join(mut self, kind: JoinKind, table: &str, left: &str, right: &str) -> Result<Self, OrmError> {
        self.joins
            .add_subexpression(vec![kind.as_str().into(), table.into(), left.into(), right.into()])?;
        Ok(self)
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    /// Eager-load `relation` for every entity returned by `find` / `find_all`.
    pub fn with(mut self, relation: &str) -> Result<Self, OrmError> {
        self.meta.relation(relation)?;
        if !self.with.iter().any(|r| r == relation) {
            self.with.push(relation.to_string());
        }
        Ok(self)
    }

    /// Drop every clause, the alias, limit, offset and eager relations.
    pub fn clear(self) -> Self {
        QueryBuilder::new(self.meta)
    }

    fn qualifier(&self) -> String {
        match &self.alias {
            Some(a) => quoted(a),
            None => self.meta.qualified_table(),
        }
    }

    fn target(&self) -> String {
        match &self.alias {
            Some(a) => format!("{} AS {}", self.meta.qualified_table(), quoted(a)),
            None => self.meta.qualified_table(),
        }
    }

    pub fn compile_select(&self) -> Result<QueryBuf, OrmError> {
        let qualifier = self.qualifier();
        let columns: Vec<String> = self
            .meta
            .columns()
            .iter()
            .map(|c| format!("{}.{}", qualifier, quoted(c)))
            .collect();
        let mut q = QueryBuf::new();
        q.sql = format!("SELECT {} FROM {}", columns.join(", "), self.target());
        self.joins.compile(&mut q)?;
        self.wheres.compile(&mut q)?;
        self.groups.compile(&mut q)?;
        self.havings.compile(&mut q)?;
        self.orders.compile(&mut q)?;
        if let Some(n) = self.limit {
            let _ = write!(q.sql, " LIMIT {}", n);
        }
        if let Some(n) = self.offset {
            let _ = write!(q.sql, " OFFSET {}", n);
        }
        Ok(q)
    }

    /// COUNT(*) over the joins and WHERE clause; grouping, ordering and paging are ignored.
    pub fn compile_count(&self) -> Result<QueryBuf, OrmError> {
        let mut q = QueryBuf::new();
        q.sql = format!("SELECT COUNT(*) FROM {}", self.target());
        self.joins.compile(&mut q)?;
        self.wheres.compile(&mut q)?;
        Ok(q)
    }

    pub fn compile_insert(&self, row: &Row) -> Result<QueryBuf, OrmError> {
        self.check_columns(row)?;
        let mut q = QueryBuf::new();
        let table = self.meta.qualified_table();
        let pk = quoted(self.meta.primary_key());
        if row.is_empty() {
            q.sql = format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, pk);
            return Ok(q);
        }
        let mut cols = Vec::with_capacity(row.len());
        let mut placeholders = Vec::with_capacity(row.len());
        for (col, v) in row {
            cols.push(quoted(col));
            placeholders.push(value_sql(&mut q, v));
        }
        q.sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            cols.join(", "),
            placeholders.join(", "),
            pk
        );
        Ok(q)
    }

    pub fn compile_update(&self, row: &Row) -> Result<QueryBuf, OrmError> {
        if row.is_empty() {
            return Err(OrmError::InvalidClauseValue("update needs at least one column".into()));
        }
        self.check_columns(row)?;
        let mut q = QueryBuf::new();
        let mut sets = Vec::with_capacity(row.len());
        for (col, v) in row {
            let ph = value_sql(&mut q, v);
            sets.push(format!("{} = {}", quoted(col), ph));
        }
        q.sql = format!("UPDATE {} SET {}", self.target(), sets.join(", "));
        self.wheres.compile(&mut q)?;
        Ok(q)
    }

    pub fn compile_delete(&self) -> Result<QueryBuf, OrmError> {
        let mut q = QueryBuf::new();
        q.sql = format!("DELETE FROM {}", self.target());
        self.wheres.compile(&mut q)?;
        Ok(q)
    }

    fn check_columns(&self, row: &Row) -> Result<(), OrmError> {
        match row.keys().find(|c| !self.meta.has_column(c)) {
            Some(c) => Err(OrmError::unknown_column(self.meta.name(), c)),
            None => Ok(()),
        }
    }

    /// First matching row as `T`, or an unloaded entity when nothing matched.
    pub async fn find<T: From<Entity>>(&self, db: &dyn Database) -> Result<T, OrmError> {
        let mut single = self.clone();
        single.limit = Some(1);
        let mut entities = single.fetch_entities(db).await?;
        if entities.is_empty() {
            return Ok(T::from(Entity::new(self.meta)));
        }
        relation::eager_load(db, &mut entities, &self.with).await?;
        let entity = entities.swap_remove(0);
        Ok(T::from(entity))
    }

    /// Every matching row in result order; eager relations are loaded once for the whole set.
    pub async fn find_all<T: From<Entity>>(&self, db: &dyn Database) -> Result<Vec<T>, OrmError> {
        let mut entities = self.fetch_entities(db).await?;
        relation::eager_load(db, &mut entities, &self.with).await?;
        Ok(entities.into_iter().map(T::from).collect())
    }

    /// Rows hydrated as entities, without eager loading.
    pub(crate) async fn fetch_entities(&self, db: &dyn Database) -> Result<Vec<Entity>, OrmError> {
        let q = self.compile_select()?;
        log_statement(&q);
        let rows = db.query(&q.sql, &q.params).await?;
        Ok(rows
            .into_iter()
            .map(|row| Entity::from_row(self.meta, row))
            .collect())
    }

    pub async fn count(&self, db: &dyn Database) -> Result<u64, OrmError> {
        let q = self.compile_count()?;
        log_statement(&q);
        match db.query_scalar(&q.sql, &q.params).await? {
            None | Some(Value::Null) => Ok(0),
            Some(Value::String(s)) => serde_json::from_str(&s).map_err(|source| OrmError::Decode {
                column: "count".into(),
                source,
            }),
            Some(v) => serde_json::from_value(v).map_err(|source| OrmError::Decode {
                column: "count".into(),
                source,
            }),
        }
    }

    /// Insert `row` and return the generated primary key.
    pub async fn insert(&self, db: &dyn Database, row: &Row) -> Result<Option<Value>, OrmError> {
        let q = self.compile_insert(row)?;
        log_statement(&q);
        db.insert(&q.sql, &q.params).await
    }

    pub async fn update(&self, db: &dyn Database, row: &Row) -> Result<u64, OrmError> {
        let q = self.compile_update(row)?;
        log_statement(&q);
        db.execute(&q.sql, &q.params).await
    }

    pub async fn delete(&self, db: &dyn Database) -> Result<u64, OrmError> {
        let q = self.compile_delete()?;
        log_statement(&q);
        db.execute(&q.sql, &q.params).await
    }
}

fn log_statement(q: &QueryBuf) {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
}

/// Placeholder for a written value; NULL is written literally so the target column types it.
fn value_sql(q: &mut QueryBuf, v: &Value) -> String {
    if v.is_null() {
        "NULL".to_string()
    } else {
        q.push_param(v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::registry;
    use serde_json::json;

    fn meta() -> &'static EntityMetadata {
        registry::define("BuilderPerson", |m| {
            m.with_columns(["id", "name", "age", "team_id"]);
            m.has_many_named("pets", "BuilderPet");
        })
    }

    #[test]
    fn select_lists_qualified_columns() {
        let q = meta().query_builder().compile_select().unwrap();
        assert_eq!(
            q.sql,
            r#"SELECT "builder_person"."id", "builder_person"."name", "builder_person"."age", "builder_person"."team_id" FROM "builder_person""#
        );
        assert!(q.params.is_empty());
    }

    #[test]
    fn select_assembles_clauses_in_order() {
        let q = meta()
            .query_builder()
            .alias("p")
            .join(JoinKind::Left, "team", "p.team_id", "team.id")
            .unwrap()
            .where_op("age", ">=", 18)
            .unwrap()
            .group_by("p.team_id")
            .unwrap()
            .having_op("count(*)", ">", 1)
            .unwrap()
            .order_by("age", Order::Desc)
            .unwrap()
            .limit(10)
            .offset(20)
            .compile_select()
            .unwrap();
        assert!(q.sql.starts_with(r#"SELECT "p"."id", "p"."name""#));
        assert!(q.sql.ends_with(
            r#" FROM "builder_person" AS "p" LEFT JOIN "team" ON "p"."team_id" = "team"."id" WHERE "age" >= $1 GROUP BY "p"."team_id" HAVING COUNT(*) > $2 ORDER BY "age" DESC LIMIT 10 OFFSET 20"#
        ));
        assert_eq!(q.params, vec![json!(18), json!(1)]);
    }

    #[test]
    fn insert_returns_primary_key() {
        let mut row = Row::new();
        row.insert("name".into(), json!("shi"));
        row.insert("age".into(), json!(24));
        let q = meta().query_builder().compile_insert(&row).unwrap();
        assert_eq!(
            q.sql,
            r#"INSERT INTO "builder_person" ("name", "age") VALUES ($1, $2) RETURNING "id""#
        );
        assert_eq!(q.params, vec![json!("shi"), json!(24)]);

        let q = meta().query_builder().compile_insert(&Row::new()).unwrap();
        assert_eq!(q.sql, r#"INSERT INTO "builder_person" DEFAULT VALUES RETURNING "id""#);
    }

    #[test]
    fn update_and_delete_are_scoped_by_where() {
        let mut row = Row::new();
        row.insert("age".into(), json!(25));
        let qb = meta().query_builder().r#where("id", 7).unwrap();
        let q = qb.compile_update(&row).unwrap();
        assert_eq!(q.sql, r#"UPDATE "builder_person" SET "age" = $1 WHERE "id" = $2"#);
        assert_eq!(q.params, vec![json!(25), json!(7)]);

        let q = qb.compile_delete().unwrap();
        assert_eq!(q.sql, r#"DELETE FROM "builder_person" WHERE "id" = $1"#);
        assert_eq!(q.params, vec![json!(7)]);
    }

    #[test]
    fn written_nulls_are_literal() {
        let mut row = Row::new();
        row.insert("name".into(), json!("shi"));
        row.insert("team_id".into(), Value::Null);
        let q = meta().query_builder().compile_insert(&row).unwrap();
        assert_eq!(
            q.sql,
            r#"INSERT INTO "builder_person" ("name", "team_id") VALUES ($1, NULL) RETURNING "id""#
        );
        assert_eq!(q.params, vec![json!("shi")]);

        let mut row = Row::new();
        row.insert("team_id".into(), Value::Null);
        let q = meta().query_builder().r#where("team_id", 3).unwrap().compile_update(&row).unwrap();
        assert_eq!(q.sql, r#"UPDATE "builder_person" SET "team_id" = NULL WHERE "team_id" = $1"#);
        assert_eq!(q.params, vec![json!(3)]);
    }

    #[test]
    fn write_rejects_undeclared_columns() {
        let mut row = Row::new();
        row.insert("nickname".into(), json!("x"));
        let err = meta().query_builder().compile_insert(&row).unwrap_err();
        assert!(matches!(err, OrmError::UnknownColumn { ref column, .. } if column == "nickname"));
        assert!(meta().query_builder().compile_update(&Row::new()).is_err());
    }

    #[test]
    fn count_ignores_paging_and_order() {
        let q = meta()
            .query_builder()
            .r#where("team_id", 3)
            .unwrap()
            .order_by("age", Order::Asc)
            .unwrap()
            .limit(5)
            .compile_count()
            .unwrap();
        assert_eq!(q.sql, r#"SELECT COUNT(*) FROM "builder_person" WHERE "team_id" = $1"#);
    }

    #[test]
    fn with_requires_declared_relation() {
        let qb = meta().query_builder().with("pets").unwrap().with("pets").unwrap();
        assert_eq!(qb.eager_relations().to_vec(), vec!["pets".to_string()]);
        let err = meta().query_builder().with("owners").unwrap_err();
        assert!(matches!(err, OrmError::UnknownRelation { .. }));
    }

    #[test]
    fn cloned_builder_does_not_leak_clauses() {
        let base = meta().query_builder().r#where("team_id", 1).unwrap();
        let narrowed = base.clone().where_op("age", "<", 30).unwrap();
        assert_eq!(base.compile_select().unwrap().params.len(), 1);
        assert_eq!(narrowed.compile_select().unwrap().params.len(), 2);
        assert!(narrowed.clear().compile_select().unwrap().params.is_empty());
    }
}
