//! Lifecycle hooks fired around create, update and delete.

use crate::entity::Entity;
use crate::error::OrmError;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeSave,
    AfterSave,
    BeforeDelete,
    AfterDelete,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 8] = [
        LifecycleEvent::BeforeCreate,
        LifecycleEvent::AfterCreate,
        LifecycleEvent::BeforeUpdate,
        LifecycleEvent::AfterUpdate,
        LifecycleEvent::BeforeSave,
        LifecycleEvent::AfterSave,
        LifecycleEvent::BeforeDelete,
        LifecycleEvent::AfterDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::BeforeCreate => "beforeCreate",
            LifecycleEvent::AfterCreate => "afterCreate",
            LifecycleEvent::BeforeUpdate => "beforeUpdate",
            LifecycleEvent::AfterUpdate => "afterUpdate",
            LifecycleEvent::BeforeSave => "beforeSave",
            LifecycleEvent::AfterSave => "afterSave",
            LifecycleEvent::BeforeDelete => "beforeDelete",
            LifecycleEvent::AfterDelete => "afterDelete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook run with the entity being persisted. An error aborts the operation.
pub type EventHandler = Arc<dyn Fn(&mut Entity) -> Result<(), OrmError> + Send + Sync>;
