//! The entity store: registration, persistence, and query execution.
//!
//! [`EntityStore`] is the "world" handle. It owns a [`Backend`] chosen once
//! at construction and the in-memory [`SchemaRegistry`], and drives the
//! backend from registration outcomes (first sighting -> provision storage;
//! additive diff -> widen storage).
//!
//! Query execution walks `query -> materialize -> invoke -> apply commands`
//! per matched entity, in backend enumeration order. Handlers receive a
//! [`SystemArgs`] view of the current match and return [`Command`]s that the
//! executor applies before moving on.

use std::cell::RefCell;

use tracing::warn;

use crate::backend::{Backend, MatchRecord};
use crate::command::{Command, CommandSet};
use crate::component::{Component, ComponentSchema, SchemaRegistry};
use crate::entity::{Entity, EntityId};
use crate::query::QueryDescriptor;
use crate::Result;

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// The world: a backend plus the schema registry, with the query executor on
/// top.
///
/// ```no_run
/// use tessera::prelude::*;
/// use tessera::backend::sqlite::SqliteBackend;
///
/// # fn main() -> tessera::Result<()> {
/// let store = EntityStore::open(SqliteBackend::open("world.db")?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EntityStore<B> {
    backend: B,
    registry: RefCell<SchemaRegistry>,
}

impl<B: Backend> EntityStore<B> {
    /// Wrap a backend. The backend choice is fixed for the store's lifetime.
    pub fn open(backend: B) -> Self {
        Self {
            backend,
            registry: RefCell::new(SchemaRegistry::new()),
        }
    }

    /// Direct access to the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Register a component type, provisioning or widening backend storage
    /// as needed. Returns whether this was the first registration of the
    /// type's name. Idempotent.
    pub fn register_component<T: Component>(&self) -> Result<bool> {
        self.register_schema(&T::schema())
    }

    fn register_schema(&self, schema: &ComponentSchema) -> Result<bool> {
        let registration = self.registry.borrow_mut().register(schema);
        if registration.first {
            self.backend.provision_component(schema)?;
        } else if !registration.added.is_empty() {
            self.backend.widen_component(schema, &registration.added)?;
        }
        Ok(registration.first)
    }

    /// The merged shape currently recorded for a name, falling back to the
    /// component's own declaration.
    fn merged_schema<T: Component>(&self) -> ComponentSchema {
        self.registry
            .borrow()
            .get(T::component_name())
            .cloned()
            .unwrap_or_else(T::schema)
    }

    fn registry_snapshot(&self) -> SchemaRegistry {
        self.registry.borrow().clone()
    }

    // -- persistence --------------------------------------------------------

    /// Persist a new entity, registering any component types it carries that
    /// have not been seen yet. Returns the assigned id.
    pub fn add_entity(&self, entity: &mut Entity) -> Result<EntityId> {
        let schemas: Vec<ComponentSchema> = entity.carried_schemas().cloned().collect();
        for schema in &schemas {
            self.register_schema(schema)?;
        }
        self.backend.add_entity(entity, &self.registry_snapshot())
    }

    /// Overwrite the stored fields of the entity's loaded components.
    /// Returns `false` only if the entity was never persisted.
    pub fn update_entity(&self, entity: &Entity) -> Result<bool> {
        let schemas: Vec<ComponentSchema> = entity.carried_schemas().cloned().collect();
        for schema in &schemas {
            self.register_schema(schema)?;
        }
        self.backend.update_entity(entity, &self.registry_snapshot())
    }

    /// Remove the entity's index record and all its component records.
    pub fn delete_entity(&self, entity: &Entity) -> Result<()> {
        self.backend.delete_entity(entity)
    }

    /// Load component `T` onto the entity from the backend, overwriting any
    /// in-memory value. Returns `false` if the entity has no persisted `T`.
    pub fn load_component<T: Component>(&self, entity: &mut Entity) -> Result<bool> {
        self.register_component::<T>()?;
        self.backend.load_component(entity, &self.merged_schema::<T>())
    }

    /// Get component `T` from the entity, lazily loading it if the backend
    /// index knows it but it has not been materialized yet.
    ///
    /// This is the explicit-store-handle form of lazy loading: the entity
    /// itself holds no reference back to the store.
    pub fn get_component<T: Component>(&self, entity: &mut Entity) -> Result<Option<T>> {
        if entity.is_unloaded(T::component_name()) {
            self.load_component::<T>(entity)?;
        }
        entity.get::<T>()
    }

    // -- query execution ----------------------------------------------------

    /// Register every component type a descriptor touches. Excluded types
    /// are included: their index storage must exist for the predicate to
    /// compile against.
    fn prepare(&self, descriptor: &QueryDescriptor) -> Result<()> {
        for schema in descriptor.schemas() {
            self.register_schema(schema)?;
        }
        Ok(())
    }

    /// How many entities the descriptor currently matches, without
    /// materializing any of them.
    pub fn count_matches(&self, descriptor: &QueryDescriptor) -> Result<u64> {
        self.prepare(descriptor)?;
        self.backend.count_matches(descriptor)
    }

    /// Run `handler` once per entity matching `descriptor`, in backend
    /// enumeration order, applying returned commands after each invocation.
    pub fn run<H, C>(&self, descriptor: &QueryDescriptor, mut handler: H) -> Result<()>
    where
        H: FnMut(&mut SystemArgs<'_, B>) -> C,
        C: Into<CommandSet>,
    {
        self.prepare(descriptor)?;
        let registry = self.registry_snapshot();
        let records = self.backend.query(descriptor)?;

        for (index, record) in records.into_iter().enumerate() {
            let mut entity = self.materialize(&record, &registry)?;
            let commands: CommandSet = {
                let mut args = SystemArgs {
                    descriptor,
                    entity: &mut entity,
                    store: self,
                    index,
                };
                handler(&mut args).into()
            };

            if commands.contains(Command::DeleteEntity) {
                self.backend.delete_entity(&entity)?;
            } else if commands.contains(Command::SaveEntity) {
                self.backend.update_entity(&entity, &registry)?;
            }
            if commands.contains(Command::Break) {
                break;
            }
        }
        Ok(())
    }

    /// Turn one match record into an entity: descriptor-mentioned components
    /// load eagerly, everything else the index revealed stays an unloaded
    /// marker. Unregistered component names are always unloaded rather than
    /// an error.
    fn materialize(&self, record: &MatchRecord, registry: &SchemaRegistry) -> Result<Entity> {
        let mut entity = Entity::new();
        entity.set_uid(record.entity_id);
        for (name, &cid) in &record.refs {
            let Some(schema) = registry.get(name) else {
                entity.mark_unloaded(name);
                continue;
            };
            match self.backend.fetch_component(cid, schema)? {
                Some(fields) => {
                    entity.set_fields(name, fields);
                    entity.set_ref(name, cid);
                }
                None => warn!(
                    component = name.as_str(),
                    reference = %cid,
                    entity = %record.entity_id,
                    "reference id has no backing component record"
                ),
            }
        }
        for name in &record.extra {
            entity.mark_unloaded(name);
        }
        Ok(entity)
    }
}

// ---------------------------------------------------------------------------
// SystemArgs
// ---------------------------------------------------------------------------

/// The handler's view of one matched entity.
///
/// Required components are guaranteed present by the query predicate, so
/// [`SystemArgs::required`] treats absence as an invariant violation and
/// panics rather than returning an error. The context accessors (`entity`,
/// `store`, `index`) are only available when the descriptor requested the
/// corresponding slot.
pub struct SystemArgs<'a, B> {
    descriptor: &'a QueryDescriptor,
    entity: &'a mut Entity,
    store: &'a EntityStore<B>,
    index: usize,
}

impl<'a, B: Backend> SystemArgs<'a, B> {
    /// A required component's value.
    ///
    /// # Panics
    ///
    /// Panics if the component is absent or fails to decode; both mean the
    /// predicate or the stored data violated the query's invariants.
    pub fn required<T: Component>(&self) -> T {
        match self.entity.get::<T>() {
            Ok(Some(component)) => component,
            Ok(None) => panic!(
                "required component '{}' missing from a matched entity",
                T::component_name()
            ),
            Err(e) => panic!(
                "required component '{}' failed to decode: {e}",
                T::component_name()
            ),
        }
    }

    /// An optional component's value, or `None` when the entity lacks it.
    ///
    /// # Panics
    ///
    /// Panics if a present value fails to decode.
    pub fn optional<T: Component>(&self) -> Option<T> {
        match self.entity.get::<T>() {
            Ok(component) => component,
            Err(e) => panic!(
                "optional component '{}' failed to decode: {e}",
                T::component_name()
            ),
        }
    }

    /// Write a component value back onto the current entity. Persist it by
    /// returning [`Command::SaveEntity`].
    pub fn set<T: Component>(&mut self, component: T) -> Result<()> {
        self.entity.insert(component)
    }

    /// The current entity handle. Requires `with_entity()` on the builder.
    pub fn entity(&mut self) -> &mut Entity {
        assert!(
            self.descriptor.wants_entity(),
            "entity handle was not requested by this query (use with_entity())"
        );
        self.entity
    }

    /// The store handle. Requires `with_store()` on the builder.
    pub fn store(&self) -> &'a EntityStore<B> {
        assert!(
            self.descriptor.wants_store(),
            "store handle was not requested by this query (use with_store())"
        );
        self.store
    }

    /// The 0-based iteration index. Requires `with_index()` on the builder.
    pub fn index(&self) -> usize {
        assert!(
            self.descriptor.wants_index(),
            "iteration index was not requested by this query (use with_index())"
        );
        self.index
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
