//! Per-entity-type metadata: table binding, columns, rules, relations and hooks.

use super::events::{EventHandler, LifecycleEvent};
use super::registry::Model;
use super::relation::{RelatedType, RelationBuilder, RelationDefinition, RelationKind};
use super::rules::{self, ValidationRule};
use crate::case::{foreign_key_for, to_snake_case};
use crate::db::Row;
use crate::entity::Entity;
use crate::error::OrmError;
use crate::sql::clause::quoted;
use crate::sql::QueryBuilder;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

pub struct EntityMetadata {
    name: String,
    label: String,
    default_table: String,
    /// Set at most once through [`EntityMetadata::set_table`].
    table: OnceLock<String>,
    /// Raised by the first `query_builder()` call.
    table_locked: AtomicBool,
    schema: Option<String>,
    primary_key: String,
    default_foreign_key: String,
    columns: Vec<String>,
    rules: Vec<ValidationRule>,
    relations: BTreeMap<String, RelationDefinition>,
    events: HashMap<LifecycleEvent, EventHandler>,
}

impl EntityMetadata {
    /// Metadata with defaults derived from `name`: table `snake_case(name)`, primary key
    /// `id`, foreign key `snake_case(name)_id`.
    pub fn new(name: &str) -> Self {
        EntityMetadata {
            name: name.to_string(),
            label: name.to_string(),
            default_table: to_snake_case(name),
            table: OnceLock::new(),
            table_locked: AtomicBool::new(false),
            schema: None,
            primary_key: "id".to_string(),
            default_foreign_key: foreign_key_for(name),
            columns: Vec::new(),
            rules: Vec::new(),
            relations: BTreeMap::new(),
            events: HashMap::new(),
        }
    }

    pub fn with_label(&mut self, label: &str) -> &mut Self {
        self.label = label.to_string();
        self
    }

    pub fn with_table(&mut self, table: &str) -> &mut Self {
        if !table.is_empty() {
            self.default_table = table.to_string();
        }
        self
    }

    pub fn with_schema(&mut self, schema: &str) -> &mut Self {
        self.schema = Some(schema.to_string());
        self
    }

    pub fn with_primary_key(&mut self, column: &str) -> &mut Self {
        self.primary_key = column.to_string();
        self
    }

    pub fn with_columns<I, S>(&mut self, columns: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for c in columns {
            let c = c.into();
            if !self.columns.contains(&c) {
                self.columns.push(c);
            }
        }
        self
    }

    /// Register or overwrite the rule on `field`.
    pub fn add_rule(&mut self, field: &str, label: &str, expr: &str) -> &mut Self {
        let rule = ValidationRule::new(field, label, expr);
        match self.rules.iter_mut().find(|r| r.field == field) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        self
    }

    pub fn belongs_to<M: Model>(&mut self, name: &str) -> RelationBuilder<'_> {
        self.relate(name, RelationKind::BelongsTo, model_type::<M>())
    }

    pub fn has_one<M: Model>(&mut self, name: &str) -> RelationBuilder<'_> {
        self.relate(name, RelationKind::HasOne, model_type::<M>())
    }

    pub fn has_many<M: Model>(&mut self, name: &str) -> RelationBuilder<'_> {
        self.relate(name, RelationKind::HasMany, model_type::<M>())
    }

    /// Relation to a type registered by name through [`registry::define`](super::registry::define).
    pub fn belongs_to_named(&mut self, name: &str, related: &str) -> RelationBuilder<'_> {
        self.relate(name, RelationKind::BelongsTo, RelatedType::Named(related.to_string()))
    }

    pub fn has_one_named(&mut self, name: &str, related: &str) -> RelationBuilder<'_> {
        self.relate(name, RelationKind::HasOne, RelatedType::Named(related.to_string()))
    }

    pub fn has_many_named(&mut self, name: &str, related: &str) -> RelationBuilder<'_> {
        self.relate(name, RelationKind::HasMany, RelatedType::Named(related.to_string()))
    }

    fn relate(&mut self, name: &str, kind: RelationKind, related: RelatedType) -> RelationBuilder<'_> {
        // the foreign key always names the parent side
        let foreign_key = match kind {
            RelationKind::BelongsTo => foreign_key_for(related.name()),
            RelationKind::HasOne | RelationKind::HasMany => self.default_foreign_key.clone(),
        };
        let def = RelationDefinition {
            name: name.to_string(),
            kind,
            related,
            foreign_key,
            filter: None,
            cascade_delete: false,
        };
        let def = match self.relations.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(def);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(def),
        };
        RelationBuilder { def }
    }

    /// Attach a lifecycle hook, replacing any previous one for `event`.
    pub fn on<F>(&mut self, event: LifecycleEvent, handler: F) -> &mut Self
    where
        F: Fn(&mut Entity) -> Result<(), OrmError> + Send + Sync + 'static,
    {
        self.events.insert(event, Arc::new(handler));
        self
    }

    /// Primary key leads the column list; a type declaring no columns has just its key.
    pub(crate) fn finish(&mut self) {
        if let Some(i) = self.columns.iter().position(|c| *c == self.primary_key) {
            let pk = self.columns.remove(i);
            self.columns.insert(0, pk);
        } else {
            self.columns.insert(0, self.primary_key.clone());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn table(&self) -> &str {
        self.table.get().unwrap_or(&self.default_table)
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Quoted table, schema-qualified when a schema is set.
    pub fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quoted(schema), quoted(self.table())),
            None => quoted(self.table()),
        }
    }

    /// Rebind the table. Allowed once, and only before the first query builder is handed out.
    pub fn set_table(&self, table: &str) -> Result<(), OrmError> {
        let locked = || OrmError::TableLocked {
            entity: self.name.clone(),
        };
        if table.is_empty() {
            return Err(OrmError::InvalidClauseValue("table name cannot be empty".into()));
        }
        if self.table_locked.load(Ordering::Acquire) {
            return Err(locked());
        }
        self.table.set(table.to_string()).map_err(|_| locked())
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Column other types use to point at this one, e.g. `user_id`.
    pub fn default_foreign_key(&self) -> &str {
        &self.default_foreign_key
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    pub fn relation(&self, name: &str) -> Result<&RelationDefinition, OrmError> {
        self.relations
            .get(name)
            .ok_or_else(|| OrmError::unknown_relation(&self.name, name))
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationDefinition> {
        self.relations.values()
    }

    pub fn event_handler(&self, event: LifecycleEvent) -> Option<&EventHandler> {
        self.events.get(&event)
    }

    /// Hook registered under `name` (`beforeCreate`, `afterSave`, ...).
    pub fn get_event_handler(&self, name: &str) -> Option<&EventHandler> {
        LifecycleEvent::from_name(name).and_then(|e| self.event_handler(e))
    }

    /// Fresh builder bound to this type's table. Locks the table binding.
    pub fn query_builder(&'static self) -> QueryBuilder {
        self.table_locked.store(true, Ordering::Release);
        QueryBuilder::new(self)
    }

    /// Check `data` against the declared rules, all of them or only `fields`.
    pub fn validate(&self, data: &Row, fields: Option<&[String]>) -> Result<(), OrmError> {
        rules::validate(&self.rules, data, fields)
    }
}

fn model_type<M: Model>() -> RelatedType {
    RelatedType::Model {
        name: M::NAME,
        metadata: M::metadata,
    }
}

impl fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut events: Vec<&str> = self.events.keys().map(|e| e.as_str()).collect();
        events.sort_unstable();
        f.debug_struct("EntityMetadata")
            .field("name", &self.name)
            .field("table", &self.table())
            .field("schema", &self.schema)
            .field("primary_key", &self.primary_key)
            .field("columns", &self.columns)
            .field("rules", &self.rules)
            .field("relations", &self.relations.values().collect::<Vec<_>>())
            .field("events", &events)
            .finish()
    }
}
