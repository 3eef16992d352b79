//! Entity and component identifiers, and the in-memory entity value.
//!
//! An [`Entity`] is a bag of at most one component per type name. Components
//! live in the entity as dynamic [`FieldMap`]s; typed access serializes and
//! deserializes through serde at the boundary. An entity has no identity
//! until its first persist, when the backend assigns a random [`EntityId`]
//! (and a [`ComponentId`] per component record).
//!
//! Entities hold no back-reference to their store. Lazily loading an
//! unloaded component is done by handing the entity to the store
//! (`EntityStore::get_component`), which keeps the ownership graph acyclic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::component::{Component, ComponentSchema, FieldMap};
use crate::{Result, StoreError};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Store-assigned entity identifier. Random, non-negative, assigned on first
/// persist.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl EntityId {
    /// Draw a fresh random id.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(0..i64::MAX))
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned reference id of one persisted component record, unique
/// within its component type's storage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub i64);

impl ComponentId {
    /// Draw a fresh random id.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(0..i64::MAX))
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// An identified collection of at most one component per type name.
///
/// Component values are held as dynamic field maps; [`Entity::get`] and
/// [`Entity::insert`] convert to and from the typed value. Component type
/// names present in persisted storage but not materialized are tracked in a
/// separate unloaded set. A name is never simultaneously loaded and unloaded.
#[derive(Debug, Default)]
pub struct Entity {
    uid: Option<EntityId>,
    components: BTreeMap<String, FieldMap>,
    refs: BTreeMap<String, ComponentId>,
    schemas: BTreeMap<String, ComponentSchema>,
    unloaded: BTreeSet<String>,
}

impl Entity {
    /// Create an empty, unpersisted entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style construction: `Entity::new().with(a)?.with(b)?`.
    pub fn with<T: Component>(mut self, component: T) -> Result<Self> {
        self.insert(component)?;
        Ok(self)
    }

    /// The persisted identifier, if this entity has been saved.
    pub fn uid(&self) -> Option<EntityId> {
        self.uid
    }

    /// Insert or overwrite a component, loading it onto this entity.
    ///
    /// Clears the type from the unloaded set if it was there.
    pub fn insert<T: Component>(&mut self, component: T) -> Result<()> {
        let name = T::component_name();
        let fields = to_field_map(name, &component)?;
        self.unloaded.remove(name);
        self.schemas.insert(name.to_owned(), T::schema());
        self.components.insert(name.to_owned(), fields);
        Ok(())
    }

    /// Get a loaded component's value, deserialized.
    ///
    /// Returns `Ok(None)` when the component is absent *or merely unloaded*;
    /// use the store's `get_component` to load on demand.
    pub fn get<T: Component>(&self) -> Result<Option<T>> {
        let name = T::component_name();
        match self.components.get(name) {
            None => Ok(None),
            Some(fields) => from_field_map(name, fields).map(Some),
        }
    }

    /// Remove a loaded component, returning its raw field map.
    pub fn remove(&mut self, name: &str) -> Option<FieldMap> {
        self.refs.remove(name);
        self.components.remove(name)
    }

    /// Whether the component type is loaded on this entity.
    pub fn has(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Whether every listed component type is loaded on this entity.
    pub fn has_components(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.has(n))
    }

    /// Whether at least one listed component type is loaded on this entity.
    pub fn has_any_component(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.has(n))
    }

    /// Every component type name this entity carries, loaded or not.
    pub fn component_names(&self) -> Vec<&str> {
        self.components
            .keys()
            .map(String::as_str)
            .chain(self.unloaded.iter().map(String::as_str))
            .collect()
    }

    /// Names of currently loaded components.
    ///
    /// Logs a warning per unloaded component, since the caller is about to
    /// act on an incomplete view.
    pub fn loaded_component_names(&self) -> Vec<&str> {
        for name in &self.unloaded {
            warn!(
                component = name.as_str(),
                "listing loaded components while an unloaded component exists"
            );
        }
        self.components.keys().map(String::as_str).collect()
    }

    /// Component type names present in persisted storage but not materialized.
    pub fn unloaded_component_names(&self) -> Vec<&str> {
        self.unloaded.iter().map(String::as_str).collect()
    }

    /// Whether the component type is known to exist but not loaded.
    pub fn is_unloaded(&self, name: &str) -> bool {
        self.unloaded.contains(name)
    }

    // -- crate-internal plumbing used by backends and the materializer ------

    pub(crate) fn set_uid(&mut self, uid: EntityId) {
        self.uid = Some(uid);
    }

    pub(crate) fn fields(&self, name: &str) -> Option<&FieldMap> {
        self.components.get(name)
    }

    pub(crate) fn loaded(&self) -> impl Iterator<Item = (&str, &FieldMap)> {
        self.components.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub(crate) fn set_fields(&mut self, name: &str, fields: FieldMap) {
        self.unloaded.remove(name);
        self.components.insert(name.to_owned(), fields);
    }

    pub(crate) fn set_field(&mut self, name: &str, field: &str, value: serde_json::Value) {
        if let Some(fields) = self.components.get_mut(name) {
            fields.insert(field.to_owned(), value);
        }
    }

    pub(crate) fn component_ref(&self, name: &str) -> Option<ComponentId> {
        self.refs.get(name).copied()
    }

    pub(crate) fn set_ref(&mut self, name: &str, id: ComponentId) {
        self.refs.insert(name.to_owned(), id);
    }

    pub(crate) fn carried_schemas(&self) -> impl Iterator<Item = &ComponentSchema> {
        self.schemas.values()
    }

    pub(crate) fn carried_schema(&self, name: &str) -> Option<&ComponentSchema> {
        self.schemas.get(name)
    }

    /// Mark a component type as present-but-unloaded. No-op if already loaded
    /// (a name never appears in both sets).
    pub(crate) fn mark_unloaded(&mut self, name: &str) {
        if !self.components.contains_key(name) {
            self.unloaded.insert(name.to_owned());
        }
    }
}

// ---------------------------------------------------------------------------
// Typed <-> dynamic conversion
// ---------------------------------------------------------------------------

/// Serialize a component to its dynamic field map.
pub(crate) fn to_field_map<T: Component>(name: &str, component: &T) -> Result<FieldMap> {
    match serde_json::to_value(component) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(StoreError::NotARecord { component: name.to_owned() }),
        Err(e) => Err(StoreError::ComponentDecode {
            component: name.to_owned(),
            details: e.to_string(),
        }),
    }
}

/// Deserialize a component from its dynamic field map.
pub(crate) fn from_field_map<T: Component>(name: &str, fields: &FieldMap) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(fields.clone())).map_err(|e| {
        StoreError::ComponentDecode {
            component: name.to_owned(),
            details: e.to_string(),
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
