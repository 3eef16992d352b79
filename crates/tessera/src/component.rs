//! Component schemas and the schema registry.
//!
//! Every component type persisted by tessera declares an explicit
//! [`ComponentSchema`]: its storage name plus an ordered list of fields with
//! declared [`FieldKind`]s. Schemas are append-only over time -- registering a
//! wider schema for a known name yields an additive diff that the store
//! applies to backend storage; fields are never removed or retyped.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Dynamic field map of a single component instance: field name to JSON value.
///
/// Components cross the storage boundary in this shape -- produced by
/// serializing the typed value to a JSON object, consumed by deserializing
/// the object back into the typed value.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// FieldKind / FieldDef
// ---------------------------------------------------------------------------

/// Declared storage kind of a component field.
///
/// Backends map these onto their native type systems as closely as they can
/// (the relational backend maps them to SQL column types; the object-store
/// backend picks a byte encoding per kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Real,
    /// UTF-8 text.
    Text,
    /// Raw byte sequence.
    Bytes,
    /// Anything else -- stored via the opaque JSON fallback encoding.
    Opaque,
}

/// A single named field in a component schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name, matching the serde field name of the component type.
    pub name: String,
    /// Declared storage kind.
    pub kind: FieldKind,
}

// ---------------------------------------------------------------------------
// ComponentSchema
// ---------------------------------------------------------------------------

/// The declared shape of a component type: storage name plus field list.
///
/// Built explicitly by the component author (no runtime reflection):
///
/// ```
/// use tessera::component::{ComponentSchema, FieldKind};
///
/// let schema = ComponentSchema::new("counter").field("n", FieldKind::Integer);
/// assert_eq!(schema.field_kind("n"), Some(FieldKind::Integer));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSchema {
    name: String,
    fields: Vec<FieldDef>,
}

impl ComponentSchema {
    /// Start a schema with no fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field declaration (builder style).
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
        });
        self
    }

    /// The component type's storage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared fields, in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Look up the declared kind of a field.
    pub fn field_kind(&self, field: &str) -> Option<FieldKind> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.kind)
    }
}

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A typed, named-field record that can be attached to an entity.
///
/// Implementors must serialize to a JSON object whose keys match the declared
/// schema fields (plain structs with named fields do). The schema is declared
/// explicitly rather than derived through reflection.
///
/// ```
/// use tessera::component::{Component, ComponentSchema, FieldKind};
///
/// #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// struct Counter { n: i64 }
///
/// impl Component for Counter {
///     fn component_name() -> &'static str { "Counter" }
///     fn schema() -> ComponentSchema {
///         ComponentSchema::new(Self::component_name()).field("n", FieldKind::Integer)
///     }
/// }
/// ```
pub trait Component: Serialize + DeserializeOwned + 'static {
    /// Storage name for this component type. Doubles as the relational table
    /// name and the object-store key segment, so keep it identifier-shaped.
    fn component_name() -> &'static str;

    /// The declared field layout persisted for this component type.
    fn schema() -> ComponentSchema;
}

// ---------------------------------------------------------------------------
// SchemaRegistry
// ---------------------------------------------------------------------------

/// Outcome of a registration call: whether the name was new, and which fields
/// were added relative to the previously recorded shape.
#[derive(Debug, Clone)]
pub struct Registration {
    /// `true` iff this was the first sighting of the component name.
    pub first: bool,
    /// Fields newly added by this registration (the additive schema diff).
    /// Empty for an identical re-registration.
    pub added: Vec<FieldDef>,
}

/// In-memory record of every component shape this process has seen.
///
/// The registry is pure bookkeeping: it computes additive schema diffs and
/// answers name -> schema lookups during materialization. Driving the backend
/// (provisioning tables, widening columns) is the store's job, keyed off the
/// [`Registration`] outcome.
///
/// Registration is idempotent: the same schema registered twice yields an
/// empty diff. A field that reappears with a different [`FieldKind`] keeps its
/// original kind -- retyping is never applied, only logged.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, ComponentSchema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `schema`, merging additively into any previously recorded shape.
    pub fn register(&mut self, schema: &ComponentSchema) -> Registration {
        match self.schemas.get_mut(schema.name()) {
            None => {
                self.schemas
                    .insert(schema.name().to_owned(), schema.clone());
                Registration {
                    first: true,
                    added: schema.fields().to_vec(),
                }
            }
            Some(known) => {
                let mut added = Vec::new();
                for field in schema.fields() {
                    match known.field_kind(&field.name) {
                        None => {
                            known.fields.push(field.clone());
                            added.push(field.clone());
                        }
                        Some(kind) if kind != field.kind => {
                            warn!(
                                component = schema.name(),
                                field = field.name.as_str(),
                                old = ?kind,
                                new = ?field.kind,
                                "ignoring field retype; schemas are append-only"
                            );
                        }
                        Some(_) => {}
                    }
                }
                Registration {
                    first: false,
                    added,
                }
            }
        }
    }

    /// Look up the recorded schema for a component name.
    pub fn get(&self, name: &str) -> Option<&ComponentSchema> {
        self.schemas.get(name)
    }

    /// Whether the name has been registered.
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Names of every registered component type, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
