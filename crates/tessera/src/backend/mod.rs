//! The storage backend contract.
//!
//! A [`Backend`] persists entities and their component records and evaluates
//! flat query predicates over its entity index. Two implementations ship with
//! the crate: [`sqlite::SqliteBackend`] (table-per-component-type relational
//! layout) and [`object::ObjectBackend`] (prefix-keyed blob layout).
//!
//! Every method is a single blocking call. A connection or session is
//! acquired per operation and released on every exit path; no state is
//! carried between calls. There is no cross-operation atomicity:
//! [`Backend::add_entity`] performing N component writes plus the index
//! record is N+1 independent writes, and a crash mid-sequence can leave
//! orphaned component records. That limitation is part of the contract, not
//! hidden by it.

pub mod object;
pub mod sqlite;

use std::collections::{BTreeMap, BTreeSet};

use crate::component::{ComponentSchema, FieldDef, FieldMap, SchemaRegistry};
use crate::entity::{ComponentId, Entity, EntityId};
use crate::query::QueryDescriptor;
use crate::Result;

/// One matched entity from [`Backend::query`]: its id, the reference map for
/// component types the descriptor mentions, and any further component names
/// the backend's index record revealed (left for the materializer to mark
/// unloaded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    /// The matched entity's identifier.
    pub entity_id: EntityId,
    /// Component-type name -> reference id, restricted to the descriptor's
    /// required and optional types. Optional types absent from the entity are
    /// simply omitted.
    pub refs: BTreeMap<String, ComponentId>,
    /// Component-type names present on the entity beyond `refs`.
    pub extra: BTreeSet<String>,
}

/// Storage implementation satisfying the entity/component persistence
/// contract.
pub trait Backend {
    /// Create storage for a component type if absent. Idempotent.
    fn provision_component(&self, schema: &ComponentSchema) -> Result<()>;

    /// Add storage for newly seen fields of a known component type.
    /// Additive only and idempotent: a field that already has storage is a
    /// no-op, never an error.
    fn widen_component(&self, schema: &ComponentSchema, added: &[FieldDef]) -> Result<()>;

    /// Persist all currently loaded components of `entity`, assigning each a
    /// fresh reference id, then persist the entity's index record. Assigns
    /// and returns the entity id. Partial writes are not rolled back.
    fn add_entity(&self, entity: &mut Entity, registry: &SchemaRegistry) -> Result<EntityId>;

    /// Overwrite the stored fields of every currently loaded component of
    /// `entity`. Components not loaded onto the entity are untouched.
    /// Returns `false` only if the entity was never persisted.
    fn update_entity(&self, entity: &Entity, registry: &SchemaRegistry) -> Result<bool>;

    /// Remove the entity's index record and all its component records.
    fn delete_entity(&self, entity: &Entity) -> Result<()>;

    /// Load one component's current persisted value onto `entity`,
    /// overwriting any in-memory value and clearing the unloaded marker.
    /// Returns `false` if no such component exists for the entity.
    fn load_component(&self, entity: &mut Entity, schema: &ComponentSchema) -> Result<bool>;

    /// Point-read one component record by reference id. `None` if the
    /// reference has no backing record.
    fn fetch_component(&self, id: ComponentId, schema: &ComponentSchema)
        -> Result<Option<FieldMap>>;

    /// Evaluate the descriptor's predicate, returning every matching entity
    /// with its reference map. Order is this backend's natural enumeration
    /// order; no sort is guaranteed.
    fn query(&self, descriptor: &QueryDescriptor) -> Result<Vec<MatchRecord>>;

    /// The number of records [`Backend::query`] would yield, computed without
    /// materializing entities.
    fn count_matches(&self, descriptor: &QueryDescriptor) -> Result<u64>;
}
