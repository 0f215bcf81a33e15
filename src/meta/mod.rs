//! Entity metadata: declarations per entity type and the registry holding them.

pub mod events;
pub mod metadata;
pub mod registry;
pub mod relation;
pub mod rules;

pub use events::{EventHandler, LifecycleEvent};
pub use metadata::EntityMetadata;
pub use registry::{define, lookup, register, Model};
pub use relation::{RelationBuilder, RelationDefinition, RelationFilter, RelationKind};
pub use rules::{register_rule, ValidationRule};
