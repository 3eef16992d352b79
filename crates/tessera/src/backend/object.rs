//! Object-store backend: prefix-keyed blobs simulating an index.
//!
//! The store has no secondary indexes, only prefix listing, so each persisted
//! component instance fans out into three key families:
//!
//! - `entity/<eid>/<type>-<ref>` -- empty marker: what components does this
//!   entity have.
//! - `component/<type>/<eid>-<ref>` -- empty marker: which entities have this
//!   component type. This is the backend's only query primitive.
//! - `value/<ref>/<field>` -- the encoded field value (no type tag stored;
//!   the reading process decodes by schema).
//!
//! Queries list `component/<type>/` per required type and intersect the
//! resulting entity sets; excluded types are subtracted and optional types
//! enrich the reference map, both as post-passes over the candidates. This
//! trades point-read efficiency for running over a plain blob namespace --
//! appropriate when read volume is low or no relational store is available.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::backend::{Backend, MatchRecord};
use crate::codec;
use crate::component::{ComponentSchema, FieldDef, FieldMap, SchemaRegistry};
use crate::entity::{ComponentId, Entity, EntityId};
use crate::query::QueryDescriptor;
use crate::{Result, StoreError};

// ---------------------------------------------------------------------------
// BlobStore abstraction
// ---------------------------------------------------------------------------

/// Minimal blob-store surface the backend needs: keyed byte blobs with
/// prefix listing.
pub trait BlobStore {
    /// Write (or overwrite) a blob.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    /// Read a blob, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// All keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Remove a blob. Removing an absent key is a no-op.
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory blob store, mostly for tests and ephemeral worlds.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs().insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs().get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.blobs().remove(key);
        Ok(())
    }
}

/// Directory-backed blob store: each key maps to a file under the root.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_owned(),
        })
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.root.join(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk only the deepest directory the prefix pins down.
        let dir = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.root.join(dir),
            None => self.root.clone(),
        };
        let mut keys = Vec::new();
        self.collect_keys(&dir, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.root.join(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Key plumbing
// ---------------------------------------------------------------------------

const ENTITY_FOLDER: &str = "entity";
const COMPONENT_FOLDER: &str = "component";
const VALUE_FOLDER: &str = "value";

fn entity_key(eid: EntityId, name: &str, cid: ComponentId) -> String {
    format!("{ENTITY_FOLDER}/{eid}/{name}-{cid}")
}

fn component_key(name: &str, eid: EntityId, cid: ComponentId) -> String {
    format!("{COMPONENT_FOLDER}/{name}/{eid}-{cid}")
}

fn value_key(cid: ComponentId, field: &str) -> String {
    format!("{VALUE_FOLDER}/{cid}/{field}")
}

fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

fn malformed(key: &str) -> StoreError {
    StoreError::MalformedKey {
        key: key.to_owned(),
    }
}

/// Parse `<eid>-<ref>` from a `component/<type>/` listing entry.
fn parse_component_marker(key: &str) -> Result<(EntityId, ComponentId)> {
    let (eid, cid) = last_segment(key).rsplit_once('-').ok_or_else(|| malformed(key))?;
    Ok((
        EntityId(eid.parse().map_err(|_| malformed(key))?),
        ComponentId(cid.parse().map_err(|_| malformed(key))?),
    ))
}

/// Parse `<type>-<ref>` from an `entity/<eid>/` listing entry.
fn parse_entity_marker(key: &str) -> Result<(String, ComponentId)> {
    let (name, cid) = last_segment(key).rsplit_once('-').ok_or_else(|| malformed(key))?;
    Ok((
        name.to_owned(),
        ComponentId(cid.parse().map_err(|_| malformed(key))?),
    ))
}

// ---------------------------------------------------------------------------
// ObjectBackend
// ---------------------------------------------------------------------------

/// Entity/component persistence over any [`BlobStore`].
#[derive(Debug)]
pub struct ObjectBackend<S> {
    blobs: S,
}

impl ObjectBackend<MemoryBlobStore> {
    /// An ephemeral in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(MemoryBlobStore::new())
    }
}

impl ObjectBackend<DirBlobStore> {
    /// A backend persisting to a local directory tree.
    pub fn open_dir(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(DirBlobStore::open(root)?))
    }
}

impl<S: BlobStore> ObjectBackend<S> {
    /// Wrap an existing blob store.
    pub fn new(blobs: S) -> Self {
        Self { blobs }
    }

    fn schema_for<'a>(
        entity: &'a Entity,
        registry: &'a SchemaRegistry,
        name: &str,
    ) -> Result<&'a ComponentSchema> {
        entity
            .carried_schema(name)
            .or_else(|| registry.get(name))
            .ok_or_else(|| StoreError::UnknownComponent {
                name: name.to_owned(),
                registered: registry.registered_names().join(", "),
            })
    }

    /// Write every field of one component record under `value/<ref>/`.
    fn write_fields(
        &self,
        schema: &ComponentSchema,
        cid: ComponentId,
        fields: &FieldMap,
        overwrite: bool,
    ) -> Result<()> {
        for field in schema.fields() {
            let key = value_key(cid, &field.name);
            match fields.get(&field.name) {
                Some(value) if !value.is_null() => {
                    let (bytes, _tag) = codec::encode(field.kind, value)?;
                    self.blobs.put(&key, &bytes)?;
                }
                // Null and absent fields are stored as absent keys.
                _ if overwrite => self.blobs.delete(&key)?,
                _ => {}
            }
        }
        for field in fields.keys() {
            if schema.field_kind(field).is_none() {
                warn!(
                    component = schema.name(),
                    field = field.as_str(),
                    "skipping field not declared in the component schema"
                );
            }
        }
        Ok(())
    }

    /// Read one component record's fields from `value/<ref>/`.
    fn read_fields(&self, schema: &ComponentSchema, cid: ComponentId) -> Result<FieldMap> {
        let mut fields = FieldMap::new();
        for key in self.blobs.list(&format!("{VALUE_FOLDER}/{cid}/"))? {
            let field = last_segment(&key).to_owned();
            let Some(kind) = schema.field_kind(&field) else {
                debug!(
                    component = schema.name(),
                    field = field.as_str(),
                    "skipping stored field not in the known schema"
                );
                continue;
            };
            let Some(bytes) = self.blobs.get(&key)? else {
                continue;
            };
            fields.insert(field, codec::decode(kind, &bytes)?);
        }
        Ok(fields)
    }

    /// The `entity/<eid>/` markers as a name -> reference map.
    fn entity_markers(&self, eid: EntityId) -> Result<BTreeMap<String, ComponentId>> {
        let mut markers = BTreeMap::new();
        for key in self.blobs.list(&format!("{ENTITY_FOLDER}/{eid}/"))? {
            let (name, cid) = parse_entity_marker(&key)?;
            markers.insert(name, cid);
        }
        Ok(markers)
    }

    /// The `component/<name>/` markers as an entity -> reference map.
    fn component_markers(&self, name: &str) -> Result<BTreeMap<EntityId, ComponentId>> {
        let mut markers = BTreeMap::new();
        for key in self.blobs.list(&format!("{COMPONENT_FOLDER}/{name}/"))? {
            let (eid, cid) = parse_component_marker(&key)?;
            markers.insert(eid, cid);
        }
        Ok(markers)
    }

    /// Candidate entities for a descriptor: intersection of required-type
    /// listings (or every entity when nothing is required), minus entities
    /// holding an excluded type. Optional types are not consulted here.
    fn candidates(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<BTreeMap<EntityId, BTreeMap<String, ComponentId>>> {
        let mut candidates: Option<BTreeMap<EntityId, BTreeMap<String, ComponentId>>> = None;

        for name in descriptor.required_names() {
            let markers = self.component_markers(name)?;
            candidates = Some(match candidates.take() {
                None => markers
                    .into_iter()
                    .map(|(eid, cid)| (eid, BTreeMap::from([(name.to_owned(), cid)])))
                    .collect(),
                Some(previous) => {
                    let mut next = BTreeMap::new();
                    for (eid, mut refs) in previous {
                        if let Some(&cid) = markers.get(&eid) {
                            refs.insert(name.to_owned(), cid);
                            next.insert(eid, refs);
                        }
                    }
                    next
                }
            });
        }

        let mut candidates = match candidates {
            Some(c) => c,
            // No required types: every persisted entity is a candidate.
            None => {
                let mut all = BTreeMap::new();
                for key in self.blobs.list(&format!("{ENTITY_FOLDER}/"))? {
                    let eid_text = key
                        .split('/')
                        .nth(1)
                        .ok_or_else(|| malformed(&key))?;
                    let eid = EntityId(eid_text.parse().map_err(|_| malformed(&key))?);
                    all.entry(eid).or_insert_with(BTreeMap::new);
                }
                all
            }
        };

        // Excluded types subtract from the candidate set.
        for name in descriptor.excluded_names() {
            for eid in self.component_markers(name)?.keys() {
                candidates.remove(eid);
            }
        }
        Ok(candidates)
    }
}

impl<S: BlobStore> Backend for ObjectBackend<S> {
    fn provision_component(&self, _schema: &ComponentSchema) -> Result<()> {
        // Keys are created on write; there is nothing to provision.
        Ok(())
    }

    fn widen_component(&self, _schema: &ComponentSchema, _added: &[FieldDef]) -> Result<()> {
        // New fields show up as new value keys; old records simply lack them.
        Ok(())
    }

    fn add_entity(&self, entity: &mut Entity, registry: &SchemaRegistry) -> Result<EntityId> {
        let uid = entity.uid().unwrap_or_else(EntityId::random);

        let loaded: Vec<(String, FieldMap)> = entity
            .loaded()
            .map(|(n, f)| (n.to_owned(), f.clone()))
            .collect();

        let mut refs = Vec::with_capacity(loaded.len());
        for (name, fields) in &loaded {
            let schema = Self::schema_for(entity, registry, name)?.clone();
            let cid = ComponentId::random();
            self.blobs.put(&entity_key(uid, name, cid), &[])?;
            self.blobs.put(&component_key(name, uid, cid), &[])?;
            self.write_fields(&schema, cid, fields, false)?;
            refs.push((name.clone(), cid));
        }

        for (name, cid) in refs {
            entity.set_ref(&name, cid);
        }
        entity.set_uid(uid);
        Ok(uid)
    }

    fn update_entity(&self, entity: &Entity, registry: &SchemaRegistry) -> Result<bool> {
        let Some(uid) = entity.uid() else {
            return Ok(false);
        };
        let markers = self.entity_markers(uid)?;
        if markers.is_empty() {
            return Ok(false);
        }
        for (name, fields) in entity.loaded() {
            let schema = Self::schema_for(entity, registry, name)?;
            let cid = match entity.component_ref(name).or_else(|| markers.get(name).copied()) {
                Some(cid) => cid,
                None => {
                    warn!(
                        component = name,
                        entity = %uid,
                        "skipping update of a component that was never persisted"
                    );
                    continue;
                }
            };
            self.write_fields(schema, cid, fields, true)?;
        }
        Ok(true)
    }

    fn delete_entity(&self, entity: &Entity) -> Result<()> {
        let Some(uid) = entity.uid() else {
            warn!("delete requested for an entity that was never persisted");
            return Ok(());
        };
        for (name, cid) in self.entity_markers(uid)? {
            for key in self.blobs.list(&format!("{VALUE_FOLDER}/{cid}/"))? {
                self.blobs.delete(&key)?;
            }
            self.blobs.delete(&component_key(&name, uid, cid))?;
            self.blobs.delete(&entity_key(uid, &name, cid))?;
        }
        Ok(())
    }

    fn load_component(&self, entity: &mut Entity, schema: &ComponentSchema) -> Result<bool> {
        let Some(uid) = entity.uid() else {
            return Ok(false);
        };
        let cid = match entity.component_ref(schema.name()) {
            Some(cid) => cid,
            None => match self.component_markers(schema.name())?.get(&uid).copied() {
                Some(cid) => cid,
                None => return Ok(false),
            },
        };
        let fields = self.read_fields(schema, cid)?;
        entity.set_fields(schema.name(), fields);
        entity.set_ref(schema.name(), cid);
        Ok(true)
    }

    fn fetch_component(
        &self,
        id: ComponentId,
        schema: &ComponentSchema,
    ) -> Result<Option<FieldMap>> {
        // A record with no non-null fields is indistinguishable from an
        // absent one here; the index markers are authoritative for presence,
        // so an empty map is returned rather than None.
        Ok(Some(self.read_fields(schema, id)?))
    }

    fn query(&self, descriptor: &QueryDescriptor) -> Result<Vec<MatchRecord>> {
        let candidates = self.candidates(descriptor)?;
        let mut optional_markers = Vec::new();
        for name in descriptor.optional_names() {
            optional_markers.push((name.to_owned(), self.component_markers(name)?));
        }

        let mut records = Vec::with_capacity(candidates.len());
        for (entity_id, mut refs) in candidates {
            for (name, markers) in &optional_markers {
                if let Some(&cid) = markers.get(&entity_id) {
                    refs.insert(name.clone(), cid);
                }
            }
            // The full marker set reveals component types beyond the
            // descriptor's mention set; those become unloaded markers.
            let extra = self
                .entity_markers(entity_id)?
                .into_keys()
                .filter(|name| !refs.contains_key(name))
                .collect();
            records.push(MatchRecord {
                entity_id,
                refs,
                extra,
            });
        }
        Ok(records)
    }

    fn count_matches(&self, descriptor: &QueryDescriptor) -> Result<u64> {
        Ok(self.candidates(descriptor)?.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
