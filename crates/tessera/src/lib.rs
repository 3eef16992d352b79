//! Tessera -- an entity-component persistence engine.
//!
//! A tessera store holds entities as bags of typed component records and
//! answers declarative queries over them: which component types a handler
//! requires, excludes, or may optionally use. Component schemas grow
//! additively at runtime -- registering a wider shape widens storage in
//! place, with no hand-written migrations.
//!
//! Storage is pluggable behind the [`backend::Backend`] trait, with two
//! implementations: a relational one on SQLite (table per component type)
//! and an object-store one over prefix-keyed blobs.
//!
//! # Quick Start
//!
//! ```
//! use tessera::prelude::*;
//! use tessera::backend::sqlite::SqliteBackend;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Counter { n: i64 }
//!
//! impl Component for Counter {
//!     fn component_name() -> &'static str { "Counter" }
//!     fn schema() -> ComponentSchema {
//!         ComponentSchema::new("Counter").field("n", FieldKind::Integer)
//!     }
//! }
//!
//! # fn main() -> tessera::Result<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let store = EntityStore::open(SqliteBackend::open(dir.path().join("world.db"))?);
//!
//! let mut entity = Entity::new().with(Counter { n: 5 })?;
//! store.add_entity(&mut entity)?;
//!
//! let tick = QueryDescriptor::builder().require::<Counter>().build()?;
//! store.run(&tick, |args| {
//!     let counter = args.required::<Counter>();
//!     args.set(Counter { n: counter.n + 1 }).unwrap();
//!     Command::SaveEntity
//! })?;
//!
//! assert_eq!(store.count_matches(&tick)?, 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod backend;
pub mod codec;
pub mod command;
pub mod component;
pub mod entity;
pub mod query;
pub mod store;

use crate::component::FieldKind;
use crate::query::ContextSlot;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
///
/// Missing data is not an error: a load that finds nothing reports
/// `Ok(false)` or `None`, leaving the entity partially loaded. Storage
/// transport failures propagate uncaught with no automatic retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A query descriptor requested the same context injection twice.
    #[error("query requests the '{slot}' context slot more than once")]
    DuplicateContextSlot {
        slot: ContextSlot,
    },

    /// A component type name was used that is not in the schema registry.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent {
        name: String,
        registered: String,
    },

    /// A component value did not serialize to a named-field record.
    #[error("component '{component}' does not serialize to a record with named fields")]
    NotARecord {
        component: String,
    },

    /// A stored component could not be decoded back into its type.
    #[error("failed to decode component '{component}': {details}")]
    ComponentDecode {
        component: String,
        details: String,
    },

    /// A field value did not fit its declared kind.
    #[error("field value does not fit declared kind {kind:?}: {details}")]
    KindMismatch {
        kind: FieldKind,
        details: String,
    },

    /// An object-store key did not parse as one of the known key families.
    #[error("malformed storage key '{key}'")]
    MalformedKey {
        key: String,
    },

    /// Relational backend failure.
    #[error("sqlite storage failure: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Object-store backend I/O failure.
    #[error("object storage I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::command::{Command, CommandSet};
    pub use crate::component::{Component, ComponentSchema, FieldKind, SchemaRegistry};
    pub use crate::entity::{ComponentId, Entity, EntityId};
    pub use crate::query::{ContextSlot, QueryBuilder, QueryDescriptor};
    pub use crate::store::{EntityStore, SystemArgs};
    pub use crate::StoreError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
