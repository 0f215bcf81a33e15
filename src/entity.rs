//! A live record of one entity type: attribute values, dirty tracking, persistence state
//! and the cache of resolved relations.

use crate::db::{Database, Row};
use crate::error::OrmError;
use crate::meta::{EntityMetadata, LifecycleEvent, RelationKind};
use serde::de::DeserializeOwned;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

static NULL: Value = Value::Null;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityState {
    /// Constructed, or looked up by key without a match. No row is bound.
    New,
    Loaded,
    /// Terminal; the row is gone but the values stay readable.
    Deleted,
}

/// Resolved value of a relation.
#[derive(Clone, Debug)]
pub enum Related {
    /// belongs-to / has-one; an unloaded entity when nothing matched.
    One(Box<Entity>),
    /// has-many, in result order.
    Many(Vec<Entity>),
}

impl Related {
    pub fn as_one(&self) -> Option<&Entity> {
        match self {
            Related::One(e) => Some(&**e),
            Related::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> Option<&[Entity]> {
        match self {
            Related::One(_) => None,
            Related::Many(v) => Some(v.as_slice()),
        }
    }
}

impl From<Entity> for Related {
    fn from(e: Entity) -> Self {
        Related::One(Box::new(e))
    }
}

impl From<Vec<Entity>> for Related {
    fn from(v: Vec<Entity>) -> Self {
        Related::Many(v)
    }
}

impl Serialize for Related {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Related::One(e) if e.is_loaded() => e.serialize(serializer),
            Related::One(_) => serializer.serialize_none(),
            Related::Many(v) => serializer.collect_seq(v),
        }
    }
}

#[derive(Clone)]
pub struct Entity {
    pub(crate) meta: &'static EntityMetadata,
    pub(crate) data: Row,
    /// Values as of the last load or save; the dirty set is the difference to `data`.
    pub(crate) original: Row,
    pub(crate) state: EntityState,
    pub(crate) related: BTreeMap<String, Related>,
}

impl Entity {
    pub fn new(meta: &'static EntityMetadata) -> Self {
        Entity {
            meta,
            data: Row::new(),
            original: Row::new(),
            state: EntityState::New,
            related: BTreeMap::new(),
        }
    }

    /// Hydrate a loaded entity from a result row. Columns the type does not declare are dropped.
    pub fn from_row(meta: &'static EntityMetadata, row: Row) -> Self {
        let data: Row = row.into_iter().filter(|(c, _)| meta.has_column(c)).collect();
        Entity {
            meta,
            original: data.clone(),
            data,
            state: EntityState::Loaded,
            related: BTreeMap::new(),
        }
    }

    /// Look up by primary key. The result is unloaded when no row matched.
    pub async fn load(
        meta: &'static EntityMetadata,
        db: &dyn Database,
        pk: impl Into<Value>,
    ) -> Result<Self, OrmError> {
        let pk = pk.into();
        meta.query_builder()
            .r#where(meta.primary_key(), pk)?
            .find::<Entity>(db)
            .await
    }

    pub fn metadata(&self) -> &'static EntityMetadata {
        self.meta
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == EntityState::Loaded
    }

    /// Current value of `column`; null when unset or undeclared.
    pub fn get(&self, column: &str) -> &Value {
        self.data.get(column).unwrap_or(&NULL)
    }

    pub fn get_as<T: DeserializeOwned>(&self, column: &str) -> Result<T, OrmError> {
        if !self.meta.has_column(column) {
            return Err(OrmError::unknown_column(self.meta.name(), column));
        }
        serde_json::from_value(self.get(column).clone()).map_err(|source| OrmError::Decode {
            column: column.to_string(),
            source,
        })
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<&mut Self, OrmError> {
        if !self.meta.has_column(column) {
            return Err(OrmError::unknown_column(self.meta.name(), column));
        }
        let value = value.into();
        if self.state == EntityState::Loaded
            && column == self.meta.primary_key()
            && self.original.get(column) != Some(&value)
        {
            return Err(OrmError::PrimaryKeyImmutable {
                entity: self.meta.name().to_string(),
                column: column.to_string(),
            });
        }
        self.data.insert(column.to_string(), value);
        Ok(self)
    }

    pub fn data(&self) -> &Row {
        &self.data
    }

    pub fn pk(&self) -> &Value {
        self.get(self.meta.primary_key())
    }

    /// Declared columns whose value differs from the last persisted snapshot, in declaration order.
    pub fn dirty_columns(&self) -> Vec<String> {
        self.meta
            .columns()
            .iter()
            .filter(|c| self.data.get(c.as_str()) != self.original.get(c.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.meta
            .columns()
            .iter()
            .any(|c| self.data.get(c.as_str()) != self.original.get(c.as_str()))
    }

    pub(crate) fn ensure_loaded(&self) -> Result<(), OrmError> {
        match self.state {
            EntityState::Loaded => Ok(()),
            EntityState::New => Err(OrmError::EntityNotLoaded {
                entity: self.meta.name().to_string(),
            }),
            EntityState::Deleted => Err(OrmError::EntityDeleted {
                entity: self.meta.name().to_string(),
            }),
        }
    }

    fn fire(&mut self, event: LifecycleEvent) -> Result<(), OrmError> {
        let meta = self.meta;
        if let Some(handler) = meta.event_handler(event) {
            tracing::debug!(entity = meta.name(), %event, "lifecycle hook");
            handler(self)?;
        }
        Ok(())
    }

    /// Validate every ruled field, insert, and bind the generated primary key.
    pub async fn create(&mut self, db: &dyn Database) -> Result<Value, OrmError> {
        match self.state {
            EntityState::New => {}
            EntityState::Loaded => {
                return Err(OrmError::EntityAlreadyLoaded {
                    entity: self.meta.name().to_string(),
                })
            }
            EntityState::Deleted => {
                return Err(OrmError::EntityDeleted {
                    entity: self.meta.name().to_string(),
                })
            }
        }
        self.fire(LifecycleEvent::BeforeSave)?;
        self.fire(LifecycleEvent::BeforeCreate)?;
        let meta = self.meta;
        meta.validate(&self.data, None)?;

        let pk = meta.primary_key();
        let row: Row = meta
            .columns()
            .iter()
            .filter_map(|c| self.data.get(c).map(|v| (c.clone(), v.clone())))
            .filter(|(c, v)| !(c == pk && v.is_null()))
            .collect();
        let key = meta.query_builder().insert(db, &row).await?;
        if let Some(key) = key.filter(|k| !k.is_null()) {
            self.data.insert(pk.to_string(), key);
        }
        self.original = self.data.clone();
        self.state = EntityState::Loaded;
        tracing::debug!(entity = meta.name(), pk = %self.pk(), "created");

        self.fire(LifecycleEvent::AfterCreate)?;
        self.fire(LifecycleEvent::AfterSave)?;
        Ok(self.pk().clone())
    }

    /// Write the dirty columns. Returns `false` without touching the database when
    /// nothing changed.
    pub async fn update(&mut self, db: &dyn Database) -> Result<bool, OrmError> {
        self.ensure_loaded()?;
        if !self.is_dirty() {
            return Ok(false);
        }
        self.fire(LifecycleEvent::BeforeSave)?;
        self.fire(LifecycleEvent::BeforeUpdate)?;
        let dirty = self.dirty_columns();
        if dirty.is_empty() {
            return Ok(false);
        }
        let meta = self.meta;
        meta.validate(&self.data, Some(&dirty))?;

        let row: Row = dirty.iter().map(|c| (c.clone(), self.get(c).clone())).collect();
        let pk = meta.primary_key();
        let key = self.original.get(pk).cloned().unwrap_or(Value::Null);
        meta.query_builder().r#where(pk, key)?.update(db, &row).await?;
        self.original = self.data.clone();
        tracing::debug!(entity = meta.name(), pk = %self.pk(), columns = ?dirty, "updated");

        self.fire(LifecycleEvent::AfterUpdate)?;
        self.fire(LifecycleEvent::AfterSave)?;
        Ok(true)
    }

    /// Delete the row, cascading first through relations declared with `cascade_delete`.
    pub async fn delete(&mut self, db: &dyn Database) -> Result<(), OrmError> {
        let mut path = Vec::new();
        self.delete_guarded(db, &mut path).await
    }

    /// `path` holds the entity types whose delete is in progress further up the cascade.
    pub(crate) fn delete_guarded<'a>(
        &'a mut self,
        db: &'a dyn Database,
        path: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<(), OrmError>> {
        Box::pin(async move {
            self.ensure_loaded()?;
            self.fire(LifecycleEvent::BeforeDelete)?;
            let meta = self.meta;

            path.push(meta.name().to_string());
            for def in meta.relations().filter(|d| d.cascades_delete()) {
                self.delete_related_guarded(db, def.name(), path).await?;
            }
            path.pop();

            let pk = meta.primary_key();
            meta.query_builder()
                .r#where(pk, self.pk().clone())?
                .delete(db)
                .await?;
            self.state = EntityState::Deleted;
            self.related.clear();
            tracing::debug!(entity = meta.name(), pk = %self.pk(), "deleted");

            self.fire(LifecycleEvent::AfterDelete)?;
            Ok(())
        })
    }

    /// Resolve `name`, loading it on first access and caching it afterwards.
    pub async fn related(&mut self, db: &dyn Database, name: &str) -> Result<&Related, OrmError> {
        if !self.related.contains_key(name) {
            let loaded = crate::relation::load(self, db, name).await?;
            self.related.insert(name.to_string(), loaded);
        }
        self.related
            .get(name)
            .ok_or_else(|| OrmError::unknown_relation(self.meta.name(), name))
    }

    pub async fn related_one(&mut self, db: &dyn Database, name: &str) -> Result<&Entity, OrmError> {
        let meta = self.meta;
        match self.related(db, name).await? {
            Related::One(e) => Ok(&**e),
            Related::Many(_) => Err(mismatch(meta, name, "single-valued")),
        }
    }

    pub async fn related_many(&mut self, db: &dyn Database, name: &str) -> Result<&[Entity], OrmError> {
        let meta = self.meta;
        match self.related(db, name).await? {
            Related::Many(v) => Ok(v.as_slice()),
            Related::One(_) => Err(mismatch(meta, name, "a collection")),
        }
    }

    /// Replace the cached value of `name`. Assigning a parent through a belongs-to relation
    /// also copies its primary key into the foreign-key column.
    pub fn set_related(&mut self, name: &str, value: impl Into<Related>) -> Result<&mut Self, OrmError> {
        let meta = self.meta;
        let def = meta.relation(name)?;
        let value = value.into();
        match (&value, def.is_collection()) {
            (Related::Many(_), false) => return Err(mismatch(meta, name, "a collection")),
            (Related::One(_), true) => return Err(mismatch(meta, name, "single-valued")),
            _ => {}
        }
        if def.kind() == RelationKind::BelongsTo {
            if let Related::One(parent) = &value {
                self.set(def.foreign_key(), parent.pk().clone())?;
            }
        }
        self.related.insert(name.to_string(), value);
        Ok(self)
    }

    /// Value of `name` if it was already resolved or assigned.
    pub fn cached_related(&self, name: &str) -> Option<&Related> {
        self.related.get(name)
    }
}

fn mismatch(meta: &EntityMetadata, relation: &str, expected: &'static str) -> OrmError {
    OrmError::RelationMismatch {
        entity: meta.name().to_string(),
        relation: relation.to_string(),
        expected,
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.data.len() + self.related.len()))?;
        for (k, v) in &self.data {
            map.serialize_entry(k, v)?;
        }
        for (k, v) in &self.related {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type", &self.meta.name())
            .field("state", &self.state)
            .field("data", &self.data)
            .field("related", &self.related.keys().collect::<Vec<_>>())
            .finish()
    }
}
