//! Property tests for store operations.
//!
//! These tests use `proptest` to generate random sequences of persistence
//! operations and verify that query results and match counts agree with a
//! naive in-memory model after each sequence.

use proptest::prelude::*;
use tessera::backend::object::ObjectBackend;
use tessera::backend::sqlite::SqliteBackend;
use tessera::prelude::*;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Pos {
    x: i64,
    y: i64,
}
impl Component for Pos {
    fn component_name() -> &'static str {
        "Pos"
    }
    fn schema() -> ComponentSchema {
        ComponentSchema::new("Pos")
            .field("x", FieldKind::Integer)
            .field("y", FieldKind::Integer)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Vel {
    dx: i64,
    dy: i64,
}
impl Component for Vel {
    fn component_name() -> &'static str {
        "Vel"
    }
    fn schema() -> ComponentSchema {
        ComponentSchema::new("Vel")
            .field("dx", FieldKind::Integer)
            .field("dy", FieldKind::Integer)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Tag {
    label: String,
}
impl Component for Tag {
    fn component_name() -> &'static str {
        "Tag"
    }
    fn schema() -> ComponentSchema {
        ComponentSchema::new("Tag").field("label", FieldKind::Text)
    }
}

/// Operations we can perform against the store.
#[derive(Debug, Clone)]
enum StoreOp {
    Spawn {
        pos: Option<(i64, i64)>,
        vel: Option<(i64, i64)>,
        tag: Option<String>,
    },
    Delete(usize),
    CheckPos,
    CheckPosVel,
    CheckPosNoTag,
}

fn small_i64() -> impl Strategy<Value = i64> {
    -1_000_000i64..1_000_000i64
}

fn store_op_strategy() -> impl Strategy<Value = StoreOp> {
    prop_oneof![
        (
            prop::option::of((small_i64(), small_i64())),
            prop::option::of((small_i64(), small_i64())),
            prop::option::of("[a-z]{1,8}"),
        )
            .prop_map(|(pos, vel, tag)| StoreOp::Spawn { pos, vel, tag }),
        (0..100usize).prop_map(StoreOp::Delete),
        Just(StoreOp::CheckPos),
        Just(StoreOp::CheckPosVel),
        Just(StoreOp::CheckPosNoTag),
    ]
}

/// Spawn through the store and keep the persisted entity as the model record;
/// an entity with no components never hits storage, so force at least one.
fn apply_spawn<B: Backend>(
    store: &EntityStore<B>,
    pos: Option<(i64, i64)>,
    vel: Option<(i64, i64)>,
    tag: Option<String>,
) -> Entity {
    let mut entity = Entity::new();
    let (x, y) = pos.unwrap_or((0, 0));
    entity.insert(Pos { x, y }).unwrap();
    if let Some((dx, dy)) = vel {
        entity.insert(Vel { dx, dy }).unwrap();
    }
    if let Some(label) = tag {
        entity.insert(Tag { label }).unwrap();
    }
    store.add_entity(&mut entity).unwrap();
    entity
}

/// The model's answer for one descriptor: uids of entities whose loaded
/// component names satisfy the conjunction.
fn model_matches(alive: &[Entity], required: &[&str], excluded: &[&str]) -> Vec<EntityId> {
    let mut uids: Vec<EntityId> = alive
        .iter()
        .filter(|e| e.has_components(required) && !e.has_any_component(excluded))
        .map(|e| e.uid().unwrap())
        .collect();
    uids.sort();
    uids
}

/// Run a descriptor collecting matched uids, then check both the uid set and
/// the count against the model.
fn check_descriptor<B: Backend>(
    store: &EntityStore<B>,
    descriptor: &QueryDescriptor,
    expected: &[EntityId],
) -> Result<(), TestCaseError> {
    let mut seen = Vec::new();
    store
        .run(descriptor, |args| {
            seen.push(args.entity().uid().unwrap());
        })
        .unwrap();
    seen.sort();
    prop_assert_eq!(seen.as_slice(), expected);
    prop_assert_eq!(store.count_matches(descriptor).unwrap(), expected.len() as u64);
    Ok(())
}

fn run_ops<B: Backend>(store: &EntityStore<B>, ops: Vec<StoreOp>) -> Result<(), TestCaseError> {
    let pos_query = QueryDescriptor::builder()
        .require::<Pos>()
        .with_entity()
        .build()
        .unwrap();
    let pos_vel_query = QueryDescriptor::builder()
        .require::<Pos>()
        .require::<Vel>()
        .with_entity()
        .build()
        .unwrap();
    let pos_no_tag_query = QueryDescriptor::builder()
        .require::<Pos>()
        .exclude::<Tag>()
        .with_entity()
        .build()
        .unwrap();

    let mut alive: Vec<Entity> = Vec::new();

    for op in ops {
        match op {
            StoreOp::Spawn { pos, vel, tag } => {
                alive.push(apply_spawn(store, pos, vel, tag));
            }
            StoreOp::Delete(idx) => {
                if !alive.is_empty() {
                    let idx = idx % alive.len();
                    let entity = alive.remove(idx);
                    store.delete_entity(&entity).unwrap();
                }
            }
            StoreOp::CheckPos => {
                let expected = model_matches(&alive, &["Pos"], &[]);
                check_descriptor(store, &pos_query, &expected)?;
            }
            StoreOp::CheckPosVel => {
                let expected = model_matches(&alive, &["Pos", "Vel"], &[]);
                check_descriptor(store, &pos_vel_query, &expected)?;
            }
            StoreOp::CheckPosNoTag => {
                let expected = model_matches(&alive, &["Pos"], &["Tag"]);
                check_descriptor(store, &pos_no_tag_query, &expected)?;
            }
        }

        // Invariant: every live entity still matches the universal query.
        let expected = model_matches(&alive, &["Pos"], &[]);
        prop_assert_eq!(store.count_matches(&pos_query).unwrap(), expected.len() as u64);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn object_store_random_ops_agree_with_model(
        ops in prop::collection::vec(store_op_strategy(), 1..30),
    ) {
        let store = EntityStore::open(ObjectBackend::in_memory());
        run_ops(&store, ops)?;
    }

    /// A save command issued for every match must leave every matched
    /// component changed exactly once, and nothing else.
    #[test]
    fn save_command_applies_to_every_match_exactly_once(
        positions in prop::collection::vec((small_i64(), small_i64()), 1..20),
    ) {
        let store = EntityStore::open(ObjectBackend::in_memory());
        for &(x, y) in &positions {
            apply_spawn(&store, Some((x, y)), None, None);
        }

        let descriptor = QueryDescriptor::builder().require::<Pos>().build().unwrap();
        store
            .run(&descriptor, |args| {
                let pos = args.required::<Pos>();
                args.set(Pos { x: pos.x + 1, y: pos.y }).unwrap();
                Command::SaveEntity
            })
            .unwrap();

        let mut seen: Vec<(i64, i64)> = Vec::new();
        store
            .run(&descriptor, |args| {
                let pos = args.required::<Pos>();
                seen.push((pos.x, pos.y));
            })
            .unwrap();
        seen.sort_unstable();
        let mut expected: Vec<(i64, i64)> =
            positions.iter().map(|&(x, y)| (x + 1, y)).collect();
        expected.sort_unstable();
        prop_assert_eq!(seen, expected);
    }
}

// The relational backend runs fewer cases: every operation opens the database
// file anew.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn sqlite_random_ops_agree_with_model(
        ops in prop::collection::vec(store_op_strategy(), 1..20),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            EntityStore::open(SqliteBackend::open(dir.path().join("world.db")).unwrap());
        run_ops(&store, ops)?;
    }
}
