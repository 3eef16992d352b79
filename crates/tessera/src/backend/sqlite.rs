//! Relational backend on SQLite.
//!
//! Layout: one index table (`_entities`, entity id primary key, one nullable
//! INTEGER reference column per known component type) plus one table per
//! component type (`_uid` primary key, `_entity` reference, one column per
//! schema field). The descriptor's flat predicate compiles to `IS NOT NULL` /
//! `IS NULL` conjuncts over the index columns.
//!
//! A connection is opened per operation and dropped at the end of it; no
//! pooling, no cross-operation transactions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{Backend, MatchRecord};
use crate::component::{ComponentSchema, FieldDef, FieldKind, FieldMap, SchemaRegistry};
use crate::entity::{ComponentId, Entity, EntityId};
use crate::query::QueryDescriptor;
use crate::{Result, StoreError};

/// Index table holding one row per entity.
const ENTITY_TABLE: &str = "_entities";
/// Primary-key column of every table.
const PRIMARY_KEY: &str = "_uid";
/// Entity-reference column of every component table.
const ENTITY_REFERENCE: &str = "_entity";

// ---------------------------------------------------------------------------
// SqliteBackend
// ---------------------------------------------------------------------------

/// Table-per-component-type SQLite backend.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path` and ensure the entity
    /// index table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let backend = Self {
            path: path.as_ref().to_owned(),
        };
        let conn = backend.connect()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} ({} INTEGER PRIMARY KEY)",
                quote(ENTITY_TABLE),
                quote(PRIMARY_KEY)
            ),
            [],
        )?;
        Ok(backend)
    }

    fn connect(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    /// Resolve the shape to persist `name` with: the shape carried by the
    /// entity if present, otherwise the registry's.
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

    /// Read one component row into a dynamic field map, dropping the
    /// storage-only columns.
    fn row_to_fields(
        schema: &ComponentSchema,
        columns: &[String],
        row: &rusqlite::Row<'_>,
    ) -> Result<(FieldMap, ComponentId)> {
        let mut fields = FieldMap::new();
        let mut cid = ComponentId(0);
        for (i, column) in columns.iter().enumerate() {
            let value = row.get_ref(i)?;
            if column == PRIMARY_KEY {
                if let ValueRef::Integer(raw) = value {
                    cid = ComponentId(raw);
                }
                continue;
            }
            if column == ENTITY_REFERENCE {
                continue;
            }
            match schema.field_kind(column) {
                Some(kind) => {
                    fields.insert(column.clone(), from_sql(kind, value)?);
                }
                None => {
                    // Column added by a process with a wider schema; this
                    // process's component type cannot carry it.
                    debug!(
                        component = schema.name(),
                        column = column.as_str(),
                        "skipping column not in the known schema"
                    );
                }
            }
        }
        Ok((fields, cid))
    }

    fn where_clause(descriptor: &QueryDescriptor) -> String {
        let clauses: Vec<String> = descriptor
            .required_names()
            .map(|n| format!("{} IS NOT NULL", quote(n)))
            .chain(
                descriptor
                    .excluded_names()
                    .map(|n| format!("{} IS NULL", quote(n))),
            )
            .collect();
        if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE ({})", clauses.join(" AND "))
        }
    }
}

impl Backend for SqliteBackend {
    fn provision_component(&self, schema: &ComponentSchema) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} ({} INTEGER PRIMARY KEY, {} INTEGER)",
                quote(schema.name()),
                quote(PRIMARY_KEY),
                quote(ENTITY_REFERENCE)
            ),
            [],
        )?;
        for field in schema.fields() {
            ensure_column(&conn, schema.name(), &field.name, sql_type(field.kind))?;
        }
        // The index table gains one nullable reference column per type.
        ensure_column(&conn, ENTITY_TABLE, schema.name(), "INTEGER")?;
        debug!(component = schema.name(), "provisioned component storage");
        Ok(())
    }

    fn widen_component(&self, schema: &ComponentSchema, added: &[FieldDef]) -> Result<()> {
        let conn = self.connect()?;
        for field in added {
            ensure_column(&conn, schema.name(), &field.name, sql_type(field.kind))?;
        }
        Ok(())
    }

    fn add_entity(&self, entity: &mut Entity, registry: &SchemaRegistry) -> Result<EntityId> {
        let uid = entity.uid().unwrap_or_else(EntityId::random);
        let conn = self.connect()?;

        let loaded: Vec<(String, FieldMap)> = entity
            .loaded()
            .map(|(n, f)| (n.to_owned(), f.clone()))
            .collect();

        let mut refs: Vec<(String, ComponentId)> = Vec::with_capacity(loaded.len());
        for (name, fields) in &loaded {
            let schema = Self::schema_for(entity, registry, name)?;
            let cid = ComponentId::random();

            let mut columns = vec![quote(PRIMARY_KEY), quote(ENTITY_REFERENCE)];
            let mut values: Vec<SqlValue> = vec![SqlValue::Integer(cid.0), SqlValue::Integer(uid.0)];
            for (field, value) in fields {
                match schema.field_kind(field) {
                    Some(kind) => {
                        columns.push(quote(field));
                        values.push(to_sql(kind, value)?);
                    }
                    None => warn!(
                        component = name.as_str(),
                        field = field.as_str(),
                        "skipping field not declared in the component schema"
                    ),
                }
            }
            conn.execute(
                &format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote(name),
                    columns.join(","),
                    placeholders(columns.len())
                ),
                rusqlite::params_from_iter(values),
            )?;
            refs.push((name.clone(), cid));
        }

        // The index record, referencing every component just written.
        let mut columns = vec![quote(PRIMARY_KEY)];
        let mut values: Vec<SqlValue> = vec![SqlValue::Integer(uid.0)];
        for (name, cid) in &refs {
            columns.push(quote(name));
            values.push(SqlValue::Integer(cid.0));
        }
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(ENTITY_TABLE),
                columns.join(","),
                placeholders(columns.len())
            ),
            rusqlite::params_from_iter(values),
        )?;

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
        let conn = self.connect()?;
        let present: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE {} = ?1",
                    quote(ENTITY_TABLE),
                    quote(PRIMARY_KEY)
                ),
                [uid.0],
                |row| row.get(0),
            )
            .optional()?;
        if present.is_none() {
            return Ok(false);
        }

        for (name, fields) in entity.loaded() {
            let schema = Self::schema_for(entity, registry, name)?;
            let mut assignments = Vec::new();
            let mut values: Vec<SqlValue> = Vec::new();
            for (field, value) in fields {
                match schema.field_kind(field) {
                    Some(kind) => {
                        assignments.push(format!("{} = ?{}", quote(field), values.len() + 1));
                        values.push(to_sql(kind, value)?);
                    }
                    None => warn!(
                        component = name,
                        field = field.as_str(),
                        "skipping field not declared in the component schema"
                    ),
                }
            }
            if assignments.is_empty() {
                continue;
            }
            values.push(SqlValue::Integer(uid.0));
            conn.execute(
                &format!(
                    "UPDATE {} SET {} WHERE {} = ?{}",
                    quote(name),
                    assignments.join(", "),
                    quote(ENTITY_REFERENCE),
                    values.len()
                ),
                rusqlite::params_from_iter(values),
            )?;
        }
        Ok(true)
    }

    fn delete_entity(&self, entity: &Entity) -> Result<()> {
        let Some(uid) = entity.uid() else {
            warn!("delete requested for an entity that was never persisted");
            return Ok(());
        };
        let conn = self.connect()?;

        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1",
            quote(ENTITY_TABLE),
            quote(PRIMARY_KEY)
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        // Collect (component name, reference id) pairs from the index row.
        let mut component_refs: Vec<(String, i64)> = Vec::new();
        {
            let mut rows = stmt.query([uid.0])?;
            if let Some(row) = rows.next()? {
                for (i, column) in columns.iter().enumerate() {
                    if column == PRIMARY_KEY {
                        continue;
                    }
                    if let ValueRef::Integer(cid) = row.get_ref(i)? {
                        component_refs.push((column.clone(), cid));
                    }
                }
            }
        }

        for (name, cid) in component_refs {
            conn.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", quote(&name), quote(PRIMARY_KEY)),
                [cid],
            )?;
        }
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote(ENTITY_TABLE),
                quote(PRIMARY_KEY)
            ),
            [uid.0],
        )?;
        Ok(())
    }

    fn load_component(&self, entity: &mut Entity, schema: &ComponentSchema) -> Result<bool> {
        let Some(uid) = entity.uid() else {
            return Ok(false);
        };
        let conn = self.connect()?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 LIMIT 1",
            quote(schema.name()),
            quote(ENTITY_REFERENCE)
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([uid.0])?;
        let Some(row) = rows.next()? else {
            return Ok(false);
        };
        let (fields, cid) = Self::row_to_fields(schema, &columns, row)?;
        entity.set_fields(schema.name(), fields);
        entity.set_ref(schema.name(), cid);
        Ok(true)
    }

    fn fetch_component(
        &self,
        id: ComponentId,
        schema: &ComponentSchema,
    ) -> Result<Option<FieldMap>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1",
            quote(schema.name()),
            quote(PRIMARY_KEY)
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([id.0])?;
        match rows.next()? {
            Some(row) => {
                let (fields, _) = Self::row_to_fields(schema, &columns, row)?;
                Ok(Some(fields))
            }
            None => Ok(None),
        }
    }

    fn query(&self, descriptor: &QueryDescriptor) -> Result<Vec<MatchRecord>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT * FROM {}{}",
            quote(ENTITY_TABLE),
            Self::where_clause(descriptor)
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut records = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut entity_id = None;
            let mut refs = BTreeMap::new();
            let mut extra = BTreeSet::new();
            for (i, column) in columns.iter().enumerate() {
                let ValueRef::Integer(raw) = row.get_ref(i)? else {
                    continue;
                };
                if column == PRIMARY_KEY {
                    entity_id = Some(EntityId(raw));
                } else if descriptor.mentions(column) {
                    refs.insert(column.clone(), ComponentId(raw));
                } else {
                    extra.insert(column.clone());
                }
            }
            if let Some(entity_id) = entity_id {
                records.push(MatchRecord {
                    entity_id,
                    refs,
                    extra,
                });
            }
        }
        Ok(records)
    }

    fn count_matches(&self, descriptor: &QueryDescriptor) -> Result<u64> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            quote(ENTITY_TABLE),
            Self::where_clause(descriptor)
        );
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

/// Double-quote an identifier, escaping embedded quotes.
fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `?,?,?` for n = 3.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn sql_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Integer => "INTEGER",
        FieldKind::Real => "REAL",
        FieldKind::Text | FieldKind::Opaque => "TEXT",
        FieldKind::Bytes => "BLOB",
    }
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    Ok(count == 1)
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if !column_exists(conn, table, column)? {
        conn.execute(
            &format!("ALTER TABLE {} ADD {} {}", quote(table), quote(column), sql_type),
            [],
        )?;
    }
    Ok(())
}

fn kind_mismatch(kind: FieldKind, details: impl ToString) -> StoreError {
    StoreError::KindMismatch {
        kind,
        details: details.to_string(),
    }
}

/// Convert a dynamic field value into an SQL parameter, by declared kind.
fn to_sql(kind: FieldKind, value: &Value) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    match kind {
        FieldKind::Integer => value
            .as_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| kind_mismatch(kind, format!("{value} is not an integer"))),
        FieldKind::Real => value
            .as_f64()
            .map(SqlValue::Real)
            .ok_or_else(|| kind_mismatch(kind, format!("{value} is not a float"))),
        FieldKind::Text => value
            .as_str()
            .map(|s| SqlValue::Text(s.to_owned()))
            .ok_or_else(|| kind_mismatch(kind, format!("{value} is not text"))),
        FieldKind::Bytes => {
            let array = value
                .as_array()
                .ok_or_else(|| kind_mismatch(kind, format!("{value} is not a byte array")))?;
            let mut bytes = Vec::with_capacity(array.len());
            for item in array {
                let b = item
                    .as_u64()
                    .filter(|&b| b <= u8::MAX as u64)
                    .ok_or_else(|| kind_mismatch(kind, format!("{item} is not a byte")))?;
                bytes.push(b as u8);
            }
            Ok(SqlValue::Blob(bytes))
        }
        FieldKind::Opaque => serde_json::to_string(value)
            .map(SqlValue::Text)
            .map_err(|e| kind_mismatch(kind, e)),
    }
}

/// Convert a stored SQL value back into a dynamic field value, by declared
/// kind.
fn from_sql(kind: FieldKind, value: ValueRef<'_>) -> Result<Value> {
    if let ValueRef::Null = value {
        return Ok(Value::Null);
    }
    match (kind, value) {
        (FieldKind::Integer, ValueRef::Integer(i)) => Ok(Value::from(i)),
        (FieldKind::Real, ValueRef::Real(f)) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| kind_mismatch(kind, format!("{f} is not a finite float"))),
        (FieldKind::Real, ValueRef::Integer(i)) => Ok(Value::from(i)),
        (FieldKind::Text, ValueRef::Text(t)) => std::str::from_utf8(t)
            .map(|s| Value::String(s.to_owned()))
            .map_err(|e| kind_mismatch(kind, e)),
        (FieldKind::Bytes, ValueRef::Blob(b)) => Ok(Value::Array(
            b.iter().map(|&b| Value::from(b as u64)).collect(),
        )),
        (FieldKind::Opaque, ValueRef::Text(t)) => {
            serde_json::from_slice(t).map_err(|e| kind_mismatch(kind, e))
        }
        (_, other) => Err(kind_mismatch(
            kind,
            format!("stored value has SQL type {:?}", other.data_type()),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Counter {
        n: i64,
    }
    impl Component for Counter {
        fn component_name() -> &'static str {
            "Counter"
        }
        fn schema() -> ComponentSchema {
            ComponentSchema::new("Counter").field("n", FieldKind::Integer)
        }
    }

    fn temp_backend() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(dir.path().join("world.db")).unwrap();
        (dir, backend)
    }

    fn registered(schemas: &[ComponentSchema]) -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        for schema in schemas {
            registry.register(schema);
        }
        registry
    }

    #[test]
    fn provisioning_is_idempotent() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        backend.provision_component(&Counter::schema()).unwrap();
        let conn = backend.connect().unwrap();
        assert!(column_exists(&conn, "Counter", "n").unwrap());
        assert!(column_exists(&conn, ENTITY_TABLE, "Counter").unwrap());
    }

    #[test]
    fn widening_adds_column_once() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        let added = vec![FieldDef {
            name: "label".to_owned(),
            kind: FieldKind::Text,
        }];
        let wider = Counter::schema().field("label", FieldKind::Text);
        backend.widen_component(&wider, &added).unwrap();
        backend.widen_component(&wider, &added).unwrap();
        let conn = backend.connect().unwrap();
        assert!(column_exists(&conn, "Counter", "label").unwrap());
    }

    #[test]
    fn widening_preserves_existing_rows() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        let registry = registered(&[Counter::schema()]);

        let mut entity = Entity::new().with(Counter { n: 9 }).unwrap();
        backend.add_entity(&mut entity, &registry).unwrap();

        let wider = Counter::schema().field("label", FieldKind::Text);
        let added = vec![FieldDef {
            name: "label".to_owned(),
            kind: FieldKind::Text,
        }];
        backend.widen_component(&wider, &added).unwrap();

        let mut reloaded = Entity::new();
        reloaded.set_uid(entity.uid().unwrap());
        assert!(backend.load_component(&mut reloaded, &wider).unwrap());
        let fields = reloaded.fields("Counter").unwrap();
        assert_eq!(fields.get("n"), Some(&serde_json::json!(9)));
        assert_eq!(
            fields.get("label").cloned().unwrap_or(Value::Null),
            Value::Null
        );
    }

    #[test]
    fn add_then_load_roundtrip() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        let registry = registered(&[Counter::schema()]);

        let mut entity = Entity::new().with(Counter { n: 5 }).unwrap();
        let uid = backend.add_entity(&mut entity, &registry).unwrap();
        assert_eq!(entity.uid(), Some(uid));

        let mut fresh = Entity::new();
        fresh.set_uid(uid);
        assert!(backend.load_component(&mut fresh, &Counter::schema()).unwrap());
        assert_eq!(fresh.get::<Counter>().unwrap(), Some(Counter { n: 5 }));
    }

    #[test]
    fn load_missing_component_returns_false() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        let mut entity = Entity::new();
        entity.set_uid(EntityId(12345));
        assert!(!backend.load_component(&mut entity, &Counter::schema()).unwrap());
    }

    #[test]
    fn update_unpersisted_entity_returns_false() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        let registry = registered(&[Counter::schema()]);
        let entity = Entity::new().with(Counter { n: 5 }).unwrap();
        assert!(!backend.update_entity(&entity, &registry).unwrap());
    }

    #[test]
    fn update_overwrites_fields() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        let registry = registered(&[Counter::schema()]);

        let mut entity = Entity::new().with(Counter { n: 1 }).unwrap();
        let uid = backend.add_entity(&mut entity, &registry).unwrap();
        entity.insert(Counter { n: 2 }).unwrap();
        assert!(backend.update_entity(&entity, &registry).unwrap());

        let mut fresh = Entity::new();
        fresh.set_uid(uid);
        backend.load_component(&mut fresh, &Counter::schema()).unwrap();
        assert_eq!(fresh.get::<Counter>().unwrap(), Some(Counter { n: 2 }));
    }

    #[test]
    fn delete_removes_index_and_component_rows() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        let registry = registered(&[Counter::schema()]);

        let mut entity = Entity::new().with(Counter { n: 5 }).unwrap();
        backend.add_entity(&mut entity, &registry).unwrap();
        backend.delete_entity(&entity).unwrap();

        let descriptor = QueryDescriptor::builder().require::<Counter>().build().unwrap();
        assert_eq!(backend.count_matches(&descriptor).unwrap(), 0);
        // The component row itself is gone.
        let conn = backend.connect().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM \"Counter\"", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn fetch_component_by_reference() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        let registry = registered(&[Counter::schema()]);

        let mut entity = Entity::new().with(Counter { n: 7 }).unwrap();
        backend.add_entity(&mut entity, &registry).unwrap();
        let cid = entity.component_ref("Counter").unwrap();

        let fields = backend
            .fetch_component(cid, &Counter::schema())
            .unwrap()
            .unwrap();
        assert_eq!(fields.get("n"), Some(&serde_json::json!(7)));
        assert!(backend
            .fetch_component(ComponentId(987654), &Counter::schema())
            .unwrap()
            .is_none());
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Tag {
        v: i64,
    }
    impl Component for Tag {
        fn component_name() -> &'static str {
            "Tag"
        }
        fn schema() -> ComponentSchema {
            ComponentSchema::new("Tag").field("v", FieldKind::Integer)
        }
    }

    #[test]
    fn query_compiles_required_and_excluded_conjuncts() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        backend.provision_component(&Tag::schema()).unwrap();
        let registry = registered(&[Counter::schema(), Tag::schema()]);

        let mut only_counter = Entity::new().with(Counter { n: 1 }).unwrap();
        let mut only_tag = Entity::new().with(Tag { v: 2 }).unwrap();
        let mut both = Entity::new()
            .with(Counter { n: 3 })
            .unwrap()
            .with(Tag { v: 4 })
            .unwrap();
        let counter_uid = backend.add_entity(&mut only_counter, &registry).unwrap();
        backend.add_entity(&mut only_tag, &registry).unwrap();
        let both_uid = backend.add_entity(&mut both, &registry).unwrap();

        // Require Counter, exclude Tag: only the first entity.
        let descriptor = QueryDescriptor::builder()
            .require::<Counter>()
            .exclude::<Tag>()
            .build()
            .unwrap();
        let records = backend.query(&descriptor).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_id, counter_uid);
        assert!(records[0].refs.contains_key("Counter"));
        assert_eq!(backend.count_matches(&descriptor).unwrap(), 1);

        // Require Counter with Tag optional: two matches, the reference map
        // includes Tag only where present.
        let descriptor = QueryDescriptor::builder()
            .require::<Counter>()
            .optional::<Tag>()
            .build()
            .unwrap();
        let records = backend.query(&descriptor).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(backend.count_matches(&descriptor).unwrap(), 2);
        let with_tag = records.iter().find(|r| r.entity_id == both_uid).unwrap();
        assert!(with_tag.refs.contains_key("Tag"));
        let without_tag = records.iter().find(|r| r.entity_id == counter_uid).unwrap();
        assert!(!without_tag.refs.contains_key("Tag"));
    }

    #[test]
    fn query_reports_unmentioned_components_as_extra() {
        let (_dir, backend) = temp_backend();
        backend.provision_component(&Counter::schema()).unwrap();
        backend.provision_component(&Tag::schema()).unwrap();
        let registry = registered(&[Counter::schema(), Tag::schema()]);

        let mut both = Entity::new()
            .with(Counter { n: 3 })
            .unwrap()
            .with(Tag { v: 4 })
            .unwrap();
        backend.add_entity(&mut both, &registry).unwrap();

        let descriptor = QueryDescriptor::builder().require::<Counter>().build().unwrap();
        let records = backend.query(&descriptor).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].extra.contains("Tag"));
        assert!(!records[0].refs.contains_key("Tag"));
    }

    #[test]
    fn value_conversions_roundtrip() {
        use serde_json::json;
        let cases = [
            (FieldKind::Integer, json!(42)),
            (FieldKind::Real, json!(1.25)),
            (FieldKind::Text, json!("hello")),
            (FieldKind::Bytes, json!([1, 2, 3])),
            (FieldKind::Opaque, json!({"a": [1, 2]})),
        ];
        for (kind, value) in cases {
            let sql = to_sql(kind, &value).unwrap();
            let back = match &sql {
                SqlValue::Integer(i) => from_sql(kind, ValueRef::Integer(*i)),
                SqlValue::Real(f) => from_sql(kind, ValueRef::Real(*f)),
                SqlValue::Text(t) => from_sql(kind, ValueRef::Text(t.as_bytes())),
                SqlValue::Blob(b) => from_sql(kind, ValueRef::Blob(b)),
                SqlValue::Null => from_sql(kind, ValueRef::Null),
            }
            .unwrap();
            assert_eq!(back, value, "kind {kind:?}");
        }
    }

    #[test]
    fn quote_escapes_embedded_quotes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(placeholders(3), "?,?,?");
    }
}
