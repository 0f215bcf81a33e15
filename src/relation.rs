//! Relation resolution: lazy and batched eager loads, counting, unlinking and cascading
//! deletes across declared relations.

use crate::db::{Database, Row};
use crate::entity::{BoxFuture, Entity, Related};
use crate::error::OrmError;
use crate::meta::rules::scalar_text;
use crate::meta::RelationKind;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Join values are compared by their scalar text, so `6` and `"6"` match; null never does.
fn join_key(v: &Value) -> Option<String> {
    scalar_text(v)
}

/// Bind parameters PostgreSQL accepts in one statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Split `IN` keys so each statement stays within the bind limit after `reserved` filter
/// parameters.
fn key_batches(keys: &[Value], reserved: usize) -> std::slice::Chunks<'_, Value> {
    keys.chunks(MAX_BIND_PARAMS.saturating_sub(reserved).max(1))
}

/// Load relation `name` of `owner` with one query.
pub(crate) async fn load(owner: &Entity, db: &dyn Database, name: &str) -> Result<Related, OrmError> {
    let meta = owner.meta;
    let def = meta.relation(name)?;
    let related = def.related_metadata()?;
    let key = owner.get(def.owner_key(meta));
    tracing::debug!(entity = meta.name(), relation = name, "lazy load");
    if key.is_null() {
        return Ok(if def.is_collection() {
            Related::Many(Vec::new())
        } else {
            Related::from(Entity::new(related))
        });
    }
    let qb = def.query(related)?.r#where(def.related_key(related), key.clone())?;
    if def.is_collection() {
        Ok(Related::Many(qb.fetch_entities(db).await?))
    } else {
        Ok(Related::from(qb.find::<Entity>(db).await?))
    }
}

/// Resolve each relation in `names` for all of `entities` with one `IN` query per relation,
/// then attach the matches to their owners.
pub(crate) async fn eager_load(db: &dyn Database, entities: &mut [Entity], names: &[String]) -> Result<(), OrmError> {
    let Some(first) = entities.first() else {
        return Ok(());
    };
    let meta = first.meta;
    for name in names {
        let def = meta.relation(name)?;
        let related = def.related_metadata()?;
        let owner_key = def.owner_key(meta);
        let related_key = def.related_key(related);

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for e in entities.iter() {
            let v = e.get(owner_key);
            if let Some(k) = join_key(v) {
                if seen.insert(k) {
                    keys.push(v.clone());
                }
            }
        }

        let mut groups: HashMap<String, Vec<Entity>> = HashMap::new();
        if !keys.is_empty() {
            let base = def.query(related)?;
            let reserved = base.compile_select()?.params.len();
            for batch in key_batches(&keys, reserved) {
                let rows = base
                    .clone()
                    .where_op(related_key, "IN", Value::Array(batch.to_vec()))?
                    .fetch_entities(db)
                    .await?;
                for r in rows {
                    if let Some(k) = join_key(r.get(related_key)) {
                        groups.entry(k).or_default().push(r);
                    }
                }
            }
        }
        tracing::debug!(
            entity = meta.name(),
            relation = name.as_str(),
            owners = entities.len(),
            matched = groups.len(),
            "eager load"
        );

        for e in entities.iter_mut() {
            let matched = join_key(e.get(owner_key))
                .and_then(|k| groups.get(&k))
                .cloned()
                .unwrap_or_default();
            let value = if def.is_collection() {
                Related::Many(matched)
            } else {
                let one = matched.into_iter().next().unwrap_or_else(|| Entity::new(related));
                Related::from(one)
            };
            e.related.insert(name.clone(), value);
        }
    }
    Ok(())
}

impl Entity {
    /// Number of rows reachable through relation `name`.
    pub async fn count_related(&self, db: &dyn Database, name: &str) -> Result<u64, OrmError> {
        let meta = self.meta;
        let def = meta.relation(name)?;
        let related = def.related_metadata()?;
        let key = self.get(def.owner_key(meta));
        if key.is_null() {
            return Ok(0);
        }
        def.query(related)?
            .r#where(def.related_key(related), key.clone())?
            .count(db)
            .await
    }

    /// Point the foreign key of relation `name` at `value` without deleting anything.
    ///
    /// For belongs-to the foreign key is this entity's own column and is saved right away;
    /// for has-one / has-many every related row is rewritten with a single UPDATE. Returns
    /// the number of rows written.
    pub async fn remove_relations(
        &mut self,
        db: &dyn Database,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<u64, OrmError> {
        self.ensure_loaded()?;
        let meta = self.meta;
        let def = meta.relation(name)?;
        let value = value.into();
        let written = match def.kind() {
            RelationKind::BelongsTo => {
                self.set(def.foreign_key(), value)?;
                u64::from(self.update(db).await?)
            }
            RelationKind::HasOne | RelationKind::HasMany => {
                let related = def.related_metadata()?;
                let key = self.get(def.owner_key(meta)).clone();
                if key.is_null() {
                    0
                } else {
                    let mut row = Row::new();
                    row.insert(def.foreign_key().to_string(), value);
                    def.query(related)?
                        .r#where(def.foreign_key(), key)?
                        .update(db, &row)
                        .await?
                }
            }
        };
        self.related.remove(name);
        Ok(written)
    }

    /// Unlink relation `name` by nulling its foreign key.
    pub async fn clear_relations(&mut self, db: &dyn Database, name: &str) -> Result<u64, OrmError> {
        self.remove_relations(db, name, Value::Null).await
    }

    /// Delete every entity reachable through relation `name`, each with its own cascades.
    /// Returns the number of rows deleted through this relation.
    pub async fn delete_related(&mut self, db: &dyn Database, name: &str) -> Result<u64, OrmError> {
        let mut path = vec![self.meta.name().to_string()];
        self.delete_related_guarded(db, name, &mut path).await
    }

    pub(crate) fn delete_related_guarded<'a>(
        &'a mut self,
        db: &'a dyn Database,
        name: &'a str,
        path: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<u64, OrmError>> {
        Box::pin(async move {
            self.ensure_loaded()?;
            let meta = self.meta;
            let def = meta.relation(name)?;
            let related = def.related_metadata()?;
            let key = self.get(def.owner_key(meta)).clone();
            let deleted = if key.is_null() {
                0
            } else {
                let qb = def.query(related)?.r#where(def.related_key(related), key)?;
                if path.iter().any(|p| p == related.name()) {
                    // already being deleted further up: drop the rows, don't walk back into them
                    tracing::warn!(
                        entity = meta.name(),
                        relation = name,
                        related = related.name(),
                        "cascade cycle, deleting related rows without recursing"
                    );
                    qb.delete(db).await?
                } else {
                    let mut targets = qb.fetch_entities(db).await?;
                    for target in targets.iter_mut() {
                        target.delete_guarded(db, path).await?;
                    }
                    targets.len() as u64
                }
            };
            self.related.remove(name);
            Ok(deleted)
        })
    }
}
