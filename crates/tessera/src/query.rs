//! Declarative query descriptors.
//!
//! A [`QueryDescriptor`] is the compiled form of "what a handler needs": the
//! component types it requires, may optionally use, and excludes, plus which
//! context slots (store handle, entity handle, iteration index) it wants
//! injected. Descriptors are flat -- the predicate a backend compiles from
//! one is a pure conjunction, with no OR semantics or nested groups.
//!
//! Descriptors are built once per handler through [`QueryBuilder`] and reused
//! across runs. The descriptor carries the full schema of every mentioned
//! component type so the store can register them lazily before first use.

use std::fmt;

use crate::component::{Component, ComponentSchema};
use crate::{Result, StoreError};

// ---------------------------------------------------------------------------
// ContextSlot
// ---------------------------------------------------------------------------

/// The injectable execution-context slots a handler may request, each at most
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSlot {
    /// The store handle (for nested queries or entity creation).
    Store,
    /// The current entity handle.
    Entity,
    /// The 0-based iteration index.
    Index,
}

impl fmt::Display for ContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextSlot::Store => write!(f, "store"),
            ContextSlot::Entity => write!(f, "entity"),
            ContextSlot::Index => write!(f, "index"),
        }
    }
}

// ---------------------------------------------------------------------------
// QueryDescriptor
// ---------------------------------------------------------------------------

/// A compiled query: required/optional/excluded component types plus
/// requested context slots.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    required: Vec<ComponentSchema>,
    optional: Vec<ComponentSchema>,
    excluded: Vec<ComponentSchema>,
    wants_store: bool,
    wants_entity: bool,
    wants_index: bool,
}

impl QueryDescriptor {
    /// Start building a descriptor.
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    /// Names of required component types.
    pub fn required_names(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(ComponentSchema::name)
    }

    /// Names of optional component types.
    pub fn optional_names(&self) -> impl Iterator<Item = &str> {
        self.optional.iter().map(ComponentSchema::name)
    }

    /// Names of excluded component types.
    pub fn excluded_names(&self) -> impl Iterator<Item = &str> {
        self.excluded.iter().map(ComponentSchema::name)
    }

    /// Whether `name` is mentioned as required or optional (the set a
    /// backend's reference map is restricted to).
    pub fn mentions(&self, name: &str) -> bool {
        self.required_names().any(|n| n == name) || self.optional_names().any(|n| n == name)
    }

    /// Every schema this descriptor touches (required, optional, and
    /// excluded -- excluded types still need provisioned index storage for
    /// the predicate to compile against).
    pub fn schemas(&self) -> impl Iterator<Item = &ComponentSchema> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .chain(self.excluded.iter())
    }

    /// Whether the handler requested the store handle.
    pub fn wants_store(&self) -> bool {
        self.wants_store
    }

    /// Whether the handler requested the entity handle.
    pub fn wants_entity(&self) -> bool {
        self.wants_entity
    }

    /// Whether the handler requested the iteration index.
    pub fn wants_index(&self) -> bool {
        self.wants_index
    }
}

// ---------------------------------------------------------------------------
// QueryBuilder
// ---------------------------------------------------------------------------

/// Builder for [`QueryDescriptor`].
///
/// ```
/// use tessera::prelude::*;
///
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct Counter { n: i64 }
/// # impl Component for Counter {
/// #     fn component_name() -> &'static str { "Counter" }
/// #     fn schema() -> ComponentSchema {
/// #         ComponentSchema::new("Counter").field("n", FieldKind::Integer)
/// #     }
/// # }
/// let descriptor = QueryDescriptor::builder()
///     .require::<Counter>()
///     .with_index()
///     .build()
///     .unwrap();
/// assert!(descriptor.wants_index());
/// ```
#[derive(Debug, Default)]
pub struct QueryBuilder {
    required: Vec<ComponentSchema>,
    optional: Vec<ComponentSchema>,
    excluded: Vec<ComponentSchema>,
    wants_store: bool,
    wants_entity: bool,
    wants_index: bool,
    duplicate_slot: Option<ContextSlot>,
}

impl QueryBuilder {
    /// Require component type `T` on every matched entity.
    pub fn require<T: Component>(mut self) -> Self {
        push_unique(&mut self.required, T::schema());
        self
    }

    /// Load component type `T` when present, without filtering on it.
    pub fn optional<T: Component>(mut self) -> Self {
        push_unique(&mut self.optional, T::schema());
        self
    }

    /// Exclude entities carrying component type `T`.
    pub fn exclude<T: Component>(mut self) -> Self {
        push_unique(&mut self.excluded, T::schema());
        self
    }

    /// Inject the store handle into the handler.
    pub fn with_store(mut self) -> Self {
        if self.wants_store {
            self.duplicate_slot.get_or_insert(ContextSlot::Store);
        }
        self.wants_store = true;
        self
    }

    /// Inject the current entity handle into the handler.
    pub fn with_entity(mut self) -> Self {
        if self.wants_entity {
            self.duplicate_slot.get_or_insert(ContextSlot::Entity);
        }
        self.wants_entity = true;
        self
    }

    /// Inject the 0-based iteration index into the handler.
    pub fn with_index(mut self) -> Self {
        if self.wants_index {
            self.duplicate_slot.get_or_insert(ContextSlot::Index);
        }
        self.wants_index = true;
        self
    }

    /// Finish the descriptor.
    ///
    /// Fails with [`StoreError::DuplicateContextSlot`] if any context slot
    /// was requested more than once.
    pub fn build(self) -> Result<QueryDescriptor> {
        if let Some(slot) = self.duplicate_slot {
            return Err(StoreError::DuplicateContextSlot { slot });
        }
        Ok(QueryDescriptor {
            required: self.required,
            optional: self.optional,
            excluded: self.excluded,
            wants_store: self.wants_store,
            wants_entity: self.wants_entity,
            wants_index: self.wants_index,
        })
    }
}

fn push_unique(list: &mut Vec<ComponentSchema>, schema: ComponentSchema) {
    if !list.iter().any(|s| s.name() == schema.name()) {
        list.push(schema);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
