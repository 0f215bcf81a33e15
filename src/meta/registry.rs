//! Process-wide registry of entity metadata, keyed by entity type name.
//!
//! Metadata is built on first access and never dropped. Builders run outside the lock;
//! the first one to insert wins and later ones are discarded, so concurrent first access
//! always converges on a single `&'static EntityMetadata`. Typed lookups are then cached
//! per thread, so reading built metadata takes no lock.

use super::metadata::EntityMetadata;
use crate::entity::Entity;
use crate::sql::QueryBuilder;
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

type Registry = RwLock<HashMap<String, &'static EntityMetadata>>;

thread_local! {
    static RESOLVED: RefCell<HashMap<TypeId, &'static EntityMetadata>> = RefCell::new(HashMap::new());
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// An entity type with a Rust representation, usually a newtype over [`Entity`].
///
/// ```ignore
/// struct User(Entity);
/// impl From<Entity> for User { fn from(e: Entity) -> Self { User(e) } }
/// impl Model for User {
///     const NAME: &'static str = "User";
///     fn declare(meta: &mut EntityMetadata) {
///         meta.with_columns(["id", "name", "age"]);
///         meta.has_many::<Address>("addresses");
///     }
/// }
/// ```
pub trait Model: From<Entity> + 'static {
    const NAME: &'static str;

    /// Describe the type: table, columns, rules, relations, hooks.
    fn declare(meta: &mut EntityMetadata);

    fn metadata() -> &'static EntityMetadata {
        register::<Self>()
    }

    fn query_builder() -> QueryBuilder {
        Self::metadata().query_builder()
    }

    /// New, unsaved instance.
    fn blank() -> Self {
        Self::from(Entity::new(Self::metadata()))
    }
}

/// Metadata for `M`, building and registering it on first call.
pub fn register<M: Model>() -> &'static EntityMetadata {
    let id = TypeId::of::<M>();
    if let Some(meta) = RESOLVED.with(|cache| cache.borrow().get(&id).copied()) {
        return meta;
    }
    let meta = define(M::NAME, M::declare);
    RESOLVED.with(|cache| cache.borrow_mut().insert(id, meta));
    meta
}

/// Metadata for a type known only by name. `declare` runs only if `name` is not registered yet.
///
/// # Panics
///
/// If `name` is blank: it names the default table and foreign keys.
pub fn define<F>(name: &str, declare: F) -> &'static EntityMetadata
where
    F: FnOnce(&mut EntityMetadata),
{
    assert!(!name.trim().is_empty(), "entity type name must not be blank");
    if let Some(meta) = lookup(name) {
        return meta;
    }
    let mut meta = EntityMetadata::new(name);
    declare(&mut meta);
    meta.finish();
    let mut map = registry().write().unwrap_or_else(PoisonError::into_inner);
    let meta = *map
        .entry(name.to_string())
        .or_insert_with(|| &*Box::leak(Box::new(meta)));
    tracing::debug!(entity = name, table = meta.table(), "entity registered");
    meta
}

pub fn lookup(name: &str) -> Option<&'static EntityMetadata> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn define_is_idempotent() {
        let first = define("RegistryWidget", |m| {
            m.with_columns(["id", "name"]);
        });
        let second = define("RegistryWidget", |_| panic!("declared twice"));
        assert!(std::ptr::eq(first, second));
        assert!(std::ptr::eq(lookup("RegistryWidget").unwrap(), first));
        assert!(lookup("RegistryMissing").is_none());
    }

    struct Gadget(Entity);

    impl From<Entity> for Gadget {
        fn from(e: Entity) -> Self {
            Gadget(e)
        }
    }

    impl Model for Gadget {
        const NAME: &'static str = "RegistryGadget";

        fn declare(meta: &mut EntityMetadata) {
            meta.with_columns(["id", "label"]);
        }
    }

    #[test]
    fn typed_lookups_agree_across_threads() {
        let here = Gadget::metadata();
        assert!(std::ptr::eq(here, Gadget::metadata()));
        assert!(std::ptr::eq(here, lookup("RegistryGadget").unwrap()));
        let there = std::thread::spawn(|| Gadget::metadata() as *const EntityMetadata as usize)
            .join()
            .unwrap();
        assert_eq!(there, here as *const EntityMetadata as usize);
        assert_eq!(Gadget::blank().0.metadata().table(), "registry_gadget");
    }

    #[test]
    #[should_panic(expected = "must not be blank")]
    fn blank_names_are_rejected() {
        define(" ", |m| {
            m.with_columns(["id"]);
        });
    }

    #[test]
    fn concurrent_first_access_converges() {
        let builds = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let builds = builds.clone();
                std::thread::spawn(move || {
                    let meta = define("RegistryRace", |m| {
                        builds.fetch_add(1, Ordering::SeqCst);
                        m.with_columns(["id"]);
                    });
                    meta as *const EntityMetadata as usize
                })
            })
            .collect();
        let ptrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        assert!(builds.load(Ordering::SeqCst) >= 1);
    }
}
