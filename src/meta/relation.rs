//! Relation definitions declared on entity metadata.

use super::metadata::EntityMetadata;
use super::registry;
use crate::error::OrmError;
use crate::sql::QueryBuilder;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationKind {
    /// Foreign key lives on the owning row and names the related row.
    BelongsTo,
    /// Foreign key lives on the related row; at most one match.
    HasOne,
    /// Foreign key lives on the related rows.
    HasMany,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::BelongsTo => "belongs_to",
            RelationKind::HasOne => "has_one",
            RelationKind::HasMany => "has_many",
        }
    }
}

/// Extra predicate applied to every query a relation issues.
pub type RelationFilter = Arc<dyn Fn(QueryBuilder) -> Result<QueryBuilder, OrmError> + Send + Sync>;

/// How the related entity type is found. Resolution is deferred until first use so
/// declarations may reference each other in either direction.
#[derive(Clone)]
pub enum RelatedType {
    Model {
        name: &'static str,
        metadata: fn() -> &'static EntityMetadata,
    },
    Named(String),
}

impl RelatedType {
    pub fn name(&self) -> &str {
        match self {
            RelatedType::Model { name, .. } => name,
            RelatedType::Named(name) => name,
        }
    }

    fn resolve(&self) -> Option<&'static EntityMetadata> {
        match self {
            RelatedType::Model { metadata, .. } => Some(metadata()),
            RelatedType::Named(name) => registry::lookup(name),
        }
    }
}

#[derive(Clone)]
pub struct RelationDefinition {
    pub(crate) name: String,
    pub(crate) kind: RelationKind,
    pub(crate) related: RelatedType,
    pub(crate) foreign_key: String,
    pub(crate) filter: Option<RelationFilter>,
    pub(crate) cascade_delete: bool,
}

impl RelationDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn related_name(&self) -> &str {
        self.related.name()
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn cascades_delete(&self) -> bool {
        self.cascade_delete
    }

    pub fn is_collection(&self) -> bool {
        self.kind == RelationKind::HasMany
    }

    /// Column on the owning entity holding the join value.
    pub fn owner_key<'a>(&'a self, owner: &'a EntityMetadata) -> &'a str {
        match self.kind {
            RelationKind::BelongsTo => &self.foreign_key,
            RelationKind::HasOne | RelationKind::HasMany => owner.primary_key(),
        }
    }

    /// Column on the related entity matched against [`owner_key`](Self::owner_key).
    pub fn related_key<'a>(&'a self, related: &'a EntityMetadata) -> &'a str {
        match self.kind {
            RelationKind::BelongsTo => related.primary_key(),
            RelationKind::HasOne | RelationKind::HasMany => &self.foreign_key,
        }
    }

    /// Metadata of the related type; fails when that type was never registered.
    pub fn related_metadata(&self) -> Result<&'static EntityMetadata, OrmError> {
        self.related
            .resolve()
            .ok_or_else(|| OrmError::unknown_relation(self.related.name(), &self.name))
    }

    /// Base query on the related type with the relation's filter applied.
    pub fn query(&self, related: &'static EntityMetadata) -> Result<QueryBuilder, OrmError> {
        let qb = related.query_builder();
        match &self.filter {
            Some(f) => f(qb),
            None => Ok(qb),
        }
    }
}

impl fmt::Debug for RelationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("related", &self.related.name())
            .field("foreign_key", &self.foreign_key)
            .field("filtered", &self.filter.is_some())
            .field("cascade_delete", &self.cascade_delete)
            .finish()
    }
}

/// Refines a relation right after it is declared.
pub struct RelationBuilder<'a> {
    pub(crate) def: &'a mut RelationDefinition,
}

impl<'a> RelationBuilder<'a> {
    pub fn foreign_key(self, column: &str) -> Self {
        self.def.foreign_key = column.to_string();
        self
    }

    pub fn filter<F>(self, f: F) -> Self
    where
        F: Fn(QueryBuilder) -> Result<QueryBuilder, OrmError> + Send + Sync + 'static,
    {
        self.def.filter = Some(Arc::new(f));
        self
    }

    /// Delete related rows when the owner is deleted, each through its own `delete`.
    ///
    /// A cascade never re-enters an entity type that is already being deleted further up.
    /// Rows of such a type are removed with one keyed DELETE, without their hooks or
    /// cascades. For a self-referencing relation (a category and its children) this means
    /// direct children go in one statement and grandchildren are left in place.
    pub fn cascade_delete(self) -> Self {
        if self.def.kind == RelationKind::BelongsTo {
            tracing::warn!(relation = %self.def.name, "cascade_delete ignored on belongs_to");
        } else {
            self.def.cascade_delete = true;
        }
        self
    }
}
