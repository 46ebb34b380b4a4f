//! End-to-end mutation scenarios against the in-memory index and stream.
//!
//! Run with: cargo test --package tessera-engine --test integration

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tessera_core::config::EngineConfig;
use tessera_core::{
    Attributes, ConnectionUpdate, DocumentPatch, EditInput, Element, EventKind, ObjectId,
};
use tessera_engine::{
    CreateOutcome, ErrorKind, LocalLockService, LockService, MergeOptions, MutationEngine,
    RuleContribution,
};
use tessera_store::{DocumentQuery, IndexStore, MemoryIndex, Page, StoreError};
use tessera_stream::{JournalStream, MemoryStream};

struct Harness {
    engine: MutationEngine,
    index: Arc<MemoryIndex>,
    stream: Arc<MemoryStream>,
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

fn harness_with(config: EngineConfig) -> Harness {
    let index = Arc::new(MemoryIndex::new());
    let stream = Arc::new(MemoryStream::new());
    let engine = MutationEngine::builder(index.clone(), stream.clone())
        .config(config)
        .build();
    Harness {
        engine,
        index,
        stream,
    }
}

fn input(value: Value) -> Attributes {
    value.as_object().cloned().unwrap()
}

async fn entity(engine: &MutationEngine, entity_type: &str, data: Value) -> Element {
    engine
        .create_entity(entity_type, input(data))
        .await
        .unwrap()
        .element
}

async fn link(engine: &MutationEngine, kind: &str, from: &Element, to: &Element, extra: Value) -> CreateOutcome {
    let mut data = input(extra);
    data.insert("fromId".into(), json!(from.internal_id.to_string()));
    data.insert("toId".into(), json!(to.internal_id.to_string()));
    engine.create_relation(kind, data).await.unwrap()
}

async fn outbound_of(engine: &MutationEngine, element: &Element, kind: &str) -> Vec<Element> {
    engine
        .full_load_by_id(&element.internal_id.to_string())
        .await
        .unwrap()
        .unwrap()
        .outbound
        .into_iter()
        .filter(|r| r.entity_type == kind)
        .collect()
}

// ── Creation ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_input_twice_upserts() {
    let h = harness();
    let first = h
        .engine
        .create_entity("Malware", input(json!({"name": "Emotet"})))
        .await
        .unwrap();
    assert!(!first.upserted);
    assert!(first.event.is_some());
    let writes = h.index.writes();

    let second = h
        .engine
        .create_entity("Malware", input(json!({"name": "emotet "})))
        .await
        .unwrap();
    assert!(second.upserted);
    assert_eq!(second.element.internal_id, first.element.internal_id);
    assert!(second.event.is_none());
    assert_eq!(h.index.len().await, 1);
    assert_eq!(h.index.writes(), writes);
    assert_eq!(h.stream.count(EventKind::Create).await, 1);
    assert_eq!(h.stream.len().await, 1);
}

#[tokio::test]
async fn test_update_flag_replaces_upsert_fields() {
    let h = harness();
    entity(&h.engine, "Malware", json!({"name": "Emotet", "description": "loader"})).await;
    let outcome = h
        .engine
        .create_entity(
            "Malware",
            input(json!({"name": "Emotet", "description": "banking trojan", "update": true})),
        )
        .await
        .unwrap();
    assert!(outcome.upserted);
    assert_eq!(outcome.element.attribute("description"), Some(&json!("banking trojan")));
    assert_eq!(h.stream.count(EventKind::Update).await, 1);
}

#[tokio::test]
async fn test_unknown_reference_is_retryable() {
    let h = harness();
    let err = h
        .engine
        .create_entity(
            "Malware",
            input(json!({"name": "Emotet", "createdBy": "identity--00000000-0000-0000-0000-000000000000"})),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingReference);
    assert!(err.is_retryable());
    assert!(h.index.is_empty().await);
}

#[tokio::test]
async fn test_markings_accumulate_on_upsert() {
    let h = harness();
    let mut markings = Vec::new();
    for level in ["TLP:CLEAR", "TLP:GREEN", "TLP:AMBER"] {
        markings.push(
            entity(
                &h.engine,
                "Marking-Definition",
                json!({"definition_type": "TLP", "definition": level}),
            )
            .await,
        );
    }
    let malware = entity(
        &h.engine,
        "Malware",
        json!({
            "name": "Emotet",
            "objectMarking": [markings[0].standard_id, markings[1].standard_id],
        }),
    )
    .await;
    assert_eq!(outbound_of(&h.engine, &malware, "object-marking").await.len(), 2);

    let outcome = h
        .engine
        .create_entity(
            "Malware",
            input(json!({
                "name": "Emotet",
                "objectMarking": [markings[1].standard_id, markings[2].standard_id],
            })),
        )
        .await
        .unwrap();
    assert!(outcome.upserted);
    assert_eq!(outbound_of(&h.engine, &malware, "object-marking").await.len(), 3);
}

// ── Relationships ────────────────────────────────────────────────

#[tokio::test]
async fn test_relation_to_itself_is_rejected() {
    let h = harness();
    let malware = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;

    let mut data = Attributes::new();
    data.insert("fromId".into(), json!(malware.internal_id.to_string()));
    data.insert("toId".into(), json!(malware.internal_id.to_string()));
    let err = h.engine.create_relation("uses", data).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Functional);

    // Two ids of the same element.
    let mut data = Attributes::new();
    data.insert("fromId".into(), json!(malware.internal_id.to_string()));
    data.insert("toId".into(), json!(malware.standard_id));
    let err = h.engine.create_relation("uses", data).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Functional);
    assert_eq!(h.index.len().await, 1);
}

#[tokio::test]
async fn test_inverted_window_is_rejected_before_writing() {
    let h = harness();
    let malware = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let tool = entity(&h.engine, "Tool", json!({"name": "Mimikatz"})).await;
    let writes = h.index.writes();

    let mut data = input(json!({
        "start_time": "2021-06-01T00:00:00.000Z",
        "stop_time": "2021-01-01T00:00:00.000Z",
    }));
    data.insert("fromId".into(), json!(malware.internal_id.to_string()));
    data.insert("toId".into(), json!(tool.internal_id.to_string()));
    let err = h.engine.create_relation("uses", data).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Database);
    assert_eq!(h.index.writes(), writes);
}

#[tokio::test]
async fn test_disallowed_endpoints_are_rejected() {
    let h = harness();
    let tool = entity(&h.engine, "Tool", json!({"name": "Mimikatz"})).await;
    let malware = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;

    let mut data = Attributes::new();
    data.insert("fromId".into(), json!(tool.internal_id.to_string()));
    data.insert("toId".into(), json!(malware.internal_id.to_string()));
    let err = h.engine.create_relation("targets", data).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Functional);
}

#[tokio::test]
async fn test_sighting_window_extends_and_counts() {
    let h = harness();
    let indicator = entity(
        &h.engine,
        "Indicator",
        json!({"name": "bad ip", "pattern": "[ipv4-addr:value = '198.51.100.7']", "pattern_type": "stix"}),
    )
    .await;
    let org = entity(&h.engine, "Organization", json!({"name": "ACME"})).await;

    let created = link(
        &h.engine,
        "stix-sighting-relationship",
        &indicator,
        &org,
        json!({"first_seen": "2020-02-20"}),
    )
    .await;
    assert!(!created.upserted);
    assert_eq!(created.element.attribute("attribute_count"), Some(&json!(1)));

    let upserted = link(
        &h.engine,
        "stix-sighting-relationship",
        &indicator,
        &org,
        json!({"first_seen": "2020-02-10"}),
    )
    .await;
    assert!(upserted.upserted);
    assert_eq!(upserted.element.internal_id, created.element.internal_id);
    assert_eq!(
        upserted.element.attribute("first_seen"),
        Some(&json!("2020-02-10T00:00:00.000Z"))
    );
    assert_eq!(upserted.element.attribute("attribute_count"), Some(&json!(2)));
    assert_eq!(
        upserted.element.attribute("i_first_seen_day"),
        Some(&json!("2020-02-10"))
    );
}

#[tokio::test]
async fn test_relation_within_a_month_is_upserted() {
    let h = harness();
    let malware = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let tool = entity(&h.engine, "Tool", json!({"name": "Mimikatz"})).await;

    let first = link(&h.engine, "uses", &malware, &tool, json!({"start_time": "2021-03-01"})).await;
    let close = link(&h.engine, "uses", &malware, &tool, json!({"start_time": "2021-02-20"})).await;
    assert!(close.upserted);
    assert_eq!(close.element.internal_id, first.element.internal_id);
    assert_eq!(
        close.element.attribute("start_time"),
        Some(&json!("2021-02-20T00:00:00.000Z"))
    );

    let far = link(&h.engine, "uses", &malware, &tool, json!({"start_time": "2021-06-01"})).await;
    assert!(!far.upserted);
    assert_eq!(outbound_of(&h.engine, &malware, "uses").await.len(), 2);
}

#[tokio::test]
async fn test_single_creator_is_enforced() {
    let h = harness();
    let acme = entity(&h.engine, "Organization", json!({"name": "ACME"})).await;
    let globex = entity(&h.engine, "Organization", json!({"name": "Globex"})).await;
    let malware = entity(
        &h.engine,
        "Malware",
        json!({"name": "Emotet", "createdBy": acme.standard_id}),
    )
    .await;

    let err = h
        .engine
        .update_attribute(
            &malware.internal_id.to_string(),
            vec![EditInput::add("createdBy", vec![json!(globex.standard_id)])],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let replaced = h
        .engine
        .update_attribute(
            &malware.internal_id.to_string(),
            vec![EditInput::replace("createdBy", vec![json!(globex.standard_id)])],
        )
        .await
        .unwrap();
    let creators = outbound_of(&h.engine, &malware, "created-by").await;
    assert_eq!(creators.len(), 1);
    assert_eq!(creators[0].to_id(), Some(globex.internal_id));
    assert_eq!(replaced.changes[0].key, "createdBy");
}

// ── Updates ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_adding_a_value_twice_changes_once() {
    let h = harness();
    let malware = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let id = malware.internal_id.to_string();

    let first = h
        .engine
        .update_attribute(&id, vec![EditInput::add("aliases", vec![json!("Geodo")])])
        .await
        .unwrap();
    assert_eq!(first.changes.len(), 1);
    assert!(first.event.is_some());
    let writes = h.index.writes();
    let events = h.stream.len().await;

    let second = h
        .engine
        .update_attribute(&id, vec![EditInput::add("aliases", vec![json!("Geodo")])])
        .await
        .unwrap();
    assert!(second.changes.is_empty());
    assert!(second.event.is_none());
    assert_eq!(second.element.attribute("aliases"), Some(&json!(["Geodo"])));
    assert_eq!(h.index.writes(), writes);
    assert_eq!(h.stream.len().await, events);
}

#[tokio::test]
async fn test_same_key_twice_is_unsupported() {
    let h = harness();
    let malware = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let err = h
        .engine
        .update_attribute(
            &malware.internal_id.to_string(),
            vec![
                EditInput::replace("description", vec![json!("a")]),
                EditInput::replace("description", vec![json!("b")]),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[tokio::test]
async fn test_renaming_onto_another_entity_is_rejected() {
    let h = harness();
    entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let heodo = entity(&h.engine, "Malware", json!({"name": "Heodo"})).await;
    let err = h
        .engine
        .update_attribute(
            &heodo.internal_id.to_string(),
            vec![EditInput::replace("name", vec![json!("Emotet")])],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Functional);
}

#[tokio::test]
async fn test_observable_identity_collision_merges() {
    let h = harness();
    let kept = entity(&h.engine, "IPv4-Addr", json!({"value": "198.51.100.7"})).await;
    let moved = entity(&h.engine, "IPv4-Addr", json!({"value": "198.51.100.8"})).await;

    let result = h
        .engine
        .update_attribute(
            &moved.internal_id.to_string(),
            vec![EditInput::replace("value", vec![json!("198.51.100.7")])],
        )
        .await
        .unwrap();
    assert_eq!(result.merged_into, Some(kept.internal_id));
    assert!(h
        .engine
        .load_by_id(&moved.internal_id.to_string())
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.stream.count(EventKind::Merge).await, 1);
}

// ── Merging ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_merge_redirects_relationships() {
    let h = harness();
    let emotet = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let heodo = entity(&h.engine, "Malware", json!({"name": "Heodo", "description": "loader"})).await;
    let tool = entity(&h.engine, "Tool", json!({"name": "Mimikatz"})).await;
    let actor = entity(&h.engine, "Intrusion-Set", json!({"name": "TA542"})).await;
    let outgoing = link(&h.engine, "uses", &heodo, &tool, json!({})).await.element;
    let incoming = link(&h.engine, "uses", &actor, &heodo, json!({})).await.element;

    let merged = h
        .engine
        .merge_entities(
            &emotet.internal_id.to_string(),
            &[heodo.standard_id.clone()],
            &MergeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(merged.internal_id, emotet.internal_id);
    assert_eq!(merged.attribute("aliases"), Some(&json!(["Heodo"])));
    assert_eq!(merged.attribute("description"), Some(&json!("loader")));

    let full = h
        .engine
        .full_load_by_id(&emotet.internal_id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert!(full.outbound.iter().any(|r| r.internal_id == outgoing.internal_id));
    assert!(full.inbound.iter().any(|r| r.internal_id == incoming.internal_id));
    assert!(h
        .engine
        .load_by_id(&heodo.internal_id.to_string())
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.stream.count(EventKind::Merge).await, 1);
}

#[tokio::test]
async fn test_merge_drops_duplicate_relationships() {
    let h = harness();
    let emotet = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let heodo = entity(&h.engine, "Malware", json!({"name": "Heodo"})).await;
    let tool = entity(&h.engine, "Tool", json!({"name": "Mimikatz"})).await;
    link(&h.engine, "uses", &emotet, &tool, json!({})).await;
    let duplicate = link(&h.engine, "uses", &heodo, &tool, json!({})).await.element;

    h.engine
        .merge_entities(
            &emotet.internal_id.to_string(),
            &[heodo.internal_id.to_string()],
            &MergeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(outbound_of(&h.engine, &emotet, "uses").await.len(), 1);
    assert!(h
        .engine
        .load_by_id(&duplicate.internal_id.to_string())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_merge_rejects_mixed_types_and_self() {
    let h = harness();
    let emotet = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let tool = entity(&h.engine, "Tool", json!({"name": "Mimikatz"})).await;
    let id = emotet.internal_id.to_string();

    let err = h
        .engine
        .merge_entities(&id, &[tool.internal_id.to_string()], &MergeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Functional);

    let err = h
        .engine
        .merge_entities(&id, &[id.clone()], &MergeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Functional);
}

/// Delegates to a memory index, with failures and delays switched on per test.
#[derive(Default)]
struct FlakyIndex {
    inner: Arc<MemoryIndex>,
    redirections: AtomicUsize,
    fail_redirection_at: Option<usize>,
    fail_deletes: AtomicBool,
    slow_name: Option<&'static str>,
}

impl FlakyIndex {
    fn over(inner: Arc<MemoryIndex>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }
}

#[async_trait]
impl IndexStore for FlakyIndex {
    async fn index_elements(&self, elements: &[Element]) -> Result<(), StoreError> {
        if let Some(name) = self.slow_name {
            if elements.iter().any(|e| e.name() == Some(name)) {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
        self.inner.index_elements(elements).await
    }

    async fn update_element(&self, id: ObjectId, patch: &DocumentPatch) -> Result<Element, StoreError> {
        self.inner.update_element(id, patch).await
    }

    async fn delete_elements(&self, ids: &[ObjectId]) -> Result<usize, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("delete rejected".into()));
        }
        self.inner.delete_elements(ids).await
    }

    async fn find_by_ids(&self, ids: &[String], types: &[String]) -> Result<Vec<Element>, StoreError> {
        self.inner.find_by_ids(ids, types).await
    }

    async fn query(&self, query: &DocumentQuery) -> Result<Page, StoreError> {
        self.inner.query(query).await
    }

    async fn update_connections(&self, updates: &[ConnectionUpdate]) -> Result<(), StoreError> {
        let call = self.redirections.fetch_add(1, Ordering::SeqCst) + 1;
        if Some(call) == self.fail_redirection_at {
            return Err(StoreError::Unavailable("index went away".into()));
        }
        self.inner.update_connections(updates).await
    }
}

#[tokio::test]
async fn test_failed_redirection_is_reverted() {
    let store = Arc::new(FlakyIndex {
        fail_redirection_at: Some(2),
        ..FlakyIndex::over(Arc::new(MemoryIndex::new()))
    });
    let mut config = EngineConfig::default();
    config.merge.batch_size = 1;
    config.merge.max_concurrent_batches = 1;
    let engine = MutationEngine::builder(store, Arc::new(MemoryStream::new()))
        .config(config)
        .build();

    let emotet = entity(&engine, "Malware", json!({"name": "Emotet"})).await;
    let heodo = entity(&engine, "Malware", json!({"name": "Heodo"})).await;
    let mimikatz = entity(&engine, "Tool", json!({"name": "Mimikatz"})).await;
    let psexec = entity(&engine, "Tool", json!({"name": "PsExec"})).await;
    let actor = entity(&engine, "Intrusion-Set", json!({"name": "TA542"})).await;
    link(&engine, "uses", &heodo, &mimikatz, json!({})).await;
    link(&engine, "uses", &heodo, &psexec, json!({})).await;
    link(&engine, "uses", &actor, &heodo, json!({})).await;

    let err = engine
        .merge_entities(
            &emotet.internal_id.to_string(),
            &[heodo.internal_id.to_string()],
            &MergeOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let heodo_full = engine
        .full_load_by_id(&heodo.internal_id.to_string())
        .await
        .unwrap()
        .expect("source survives a failed merge");
    assert_eq!(heodo_full.relations().count(), 3);
    let emotet_full = engine
        .full_load_by_id(&emotet.internal_id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(emotet_full.relations().count(), 0);
    assert!(emotet_full.element.attribute("aliases").is_none());
}

#[tokio::test]
async fn test_failed_source_deletion_reverts_the_merge() {
    let store = Arc::new(FlakyIndex::over(Arc::new(MemoryIndex::new())));
    let engine = MutationEngine::builder(store.clone(), Arc::new(MemoryStream::new())).build();

    let emotet = entity(&engine, "Malware", json!({"name": "Emotet"})).await;
    let heodo = entity(&engine, "Malware", json!({"name": "Heodo", "description": "loader"})).await;
    let tool = entity(&engine, "Tool", json!({"name": "Mimikatz"})).await;
    let uses = link(&engine, "uses", &heodo, &tool, json!({})).await.element;

    store.fail_deletes.store(true, Ordering::SeqCst);
    let err = engine
        .merge_entities(
            &emotet.internal_id.to_string(),
            &[heodo.internal_id.to_string()],
            &MergeOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let heodo_full = engine
        .full_load_by_id(&heodo.internal_id.to_string())
        .await
        .unwrap()
        .expect("source survives a failed merge");
    assert_eq!(heodo_full.outbound.len(), 1);
    assert_eq!(heodo_full.outbound[0].internal_id, uses.internal_id);
    let emotet_full = engine
        .full_load_by_id(&emotet.internal_id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(emotet_full.relations().count(), 0);
    assert!(emotet_full.element.attribute("description").is_none());
    assert!(emotet_full.element.attribute("aliases").is_none());

    // The same merge goes through once deletions work again.
    store.fail_deletes.store(false, Ordering::SeqCst);
    let merged = engine
        .merge_entities(
            &emotet.internal_id.to_string(),
            &[heodo.internal_id.to_string()],
            &MergeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(merged.attribute("description"), Some(&json!("loader")));
}

#[tokio::test]
async fn test_merge_keeps_filled_target_values() {
    let h = harness();
    let emotet = entity(&h.engine, "Malware", json!({"name": "Emotet", "description": "target desc"})).await;
    let heodo = entity(&h.engine, "Malware", json!({"name": "Heodo", "description": "source desc"})).await;

    let merged = h
        .engine
        .merge_entities(
            &emotet.internal_id.to_string(),
            &[heodo.internal_id.to_string()],
            &MergeOptions::default().choose("description", &heodo.internal_id.to_string()),
        )
        .await
        .unwrap();
    assert_eq!(merged.attribute("description"), Some(&json!("target desc")));
}

// ── Identity races ───────────────────────────────────────────────

#[tokio::test]
async fn test_rename_racing_a_creation_is_rejected() {
    let index = Arc::new(MemoryIndex::new());
    let store = Arc::new(FlakyIndex {
        slow_name: Some("Target"),
        ..FlakyIndex::over(index.clone())
    });
    let engine = Arc::new(MutationEngine::builder(store, Arc::new(MemoryStream::new())).build());
    let other = entity(&engine, "Malware", json!({"name": "Other"})).await;

    let creating = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .create_entity("Malware", input(json!({"name": "Target"})))
                .await
        })
    };
    // Let the creation take its lock and stall inside the index write.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let renamed = engine
        .update_attribute(
            &other.internal_id.to_string(),
            vec![EditInput::replace("name", vec![json!("Target")])],
        )
        .await;
    let created = creating.await.unwrap().unwrap();
    assert_eq!(renamed.unwrap_err().kind(), ErrorKind::Functional);

    let standard_ids: Vec<String> = index
        .snapshot()
        .await
        .into_iter()
        .filter(|e| e.entity_type == "Malware")
        .map(|e| e.standard_id)
        .collect();
    assert_eq!(standard_ids.len(), 2);
    assert_eq!(
        standard_ids.iter().filter(|id| **id == created.element.standard_id).count(),
        1
    );
}

#[tokio::test]
async fn test_upsert_waits_for_the_found_element() {
    let index = Arc::new(MemoryIndex::new());
    let locks = LocalLockService::new();
    let mut config = EngineConfig::default();
    config.lock.timeout_ms = 50;
    let engine = MutationEngine::builder(index, Arc::new(MemoryStream::new()))
        .lock_service(Arc::new(locks.clone()))
        .config(config)
        .build();
    let malware = entity(&engine, "Malware", json!({"name": "Emotet"})).await;
    let tool = entity(&engine, "Tool", json!({"name": "Mimikatz"})).await;
    let uses = link(&engine, "uses", &malware, &tool, json!({})).await.element;

    // Only the internal id, as held by an update addressing it directly.
    let hold = |id: ObjectId| {
        let locks = locks.clone();
        async move {
            locks
                .acquire(&[id.to_string()], Duration::from_secs(30), Duration::from_millis(50))
                .await
                .unwrap()
        }
    };
    let held = hold(malware.internal_id).await;
    let err = engine
        .create_entity("Malware", input(json!({"name": "Emotet", "update": true})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    drop(held);

    let held = hold(uses.internal_id).await;
    let mut data = input(json!({"description": "dumps credentials", "update": true}));
    data.insert("fromId".into(), json!(malware.internal_id.to_string()));
    data.insert("toId".into(), json!(tool.internal_id.to_string()));
    let err = engine.create_relation("uses", data.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);

    drop(held);
    let upserted = engine.create_relation("uses", data).await.unwrap();
    assert!(upserted.upserted);
    assert_eq!(upserted.element.internal_id, uses.internal_id);
}

// ── Deletion ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_delete_cascades_to_dependent_relationships() {
    let h = harness();
    let marking = entity(
        &h.engine,
        "Marking-Definition",
        json!({"definition_type": "TLP", "definition": "TLP:RED"}),
    )
    .await;
    let malware = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let tool = entity(&h.engine, "Tool", json!({"name": "Mimikatz"})).await;
    let relation = link(
        &h.engine,
        "uses",
        &malware,
        &tool,
        json!({"objectMarking": [marking.standard_id]}),
    )
    .await
    .element;

    let outcome = h
        .engine
        .delete_element(&tool.internal_id.to_string())
        .await
        .unwrap();
    assert_eq!(outcome.dependencies.len(), 2);
    assert!(outcome.dependencies.contains(&relation.internal_id));
    assert!(h
        .engine
        .load_by_id(&relation.internal_id.to_string())
        .await
        .unwrap()
        .is_none());
    assert!(h
        .engine
        .load_by_id(&marking.internal_id.to_string())
        .await
        .unwrap()
        .is_some());
    assert_eq!(h.stream.count(EventKind::Delete).await, 1);

    // Recently deleted ids no longer resolve as references.
    let mut data = Attributes::new();
    data.insert("fromId".into(), json!(malware.internal_id.to_string()));
    data.insert("toId".into(), json!(tool.internal_id.to_string()));
    let err = h.engine.create_relation("uses", data).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingReference);
}

#[tokio::test]
async fn test_delete_by_endpoints() {
    let h = harness();
    let malware = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let tool = entity(&h.engine, "Tool", json!({"name": "Mimikatz"})).await;
    link(&h.engine, "uses", &malware, &tool, json!({"start_time": "2020-01-01"})).await;
    link(&h.engine, "uses", &malware, &tool, json!({"start_time": "2021-01-01"})).await;

    let deleted = h
        .engine
        .delete_relations_by_from_and_to(
            &malware.internal_id.to_string(),
            &tool.internal_id.to_string(),
            "uses",
        )
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert!(outbound_of(&h.engine, &malware, "uses").await.is_empty());
}

// ── Rules ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rule_contributions_aggregate_and_retract() {
    let h = harness();
    let emotet = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let trickbot = entity(&h.engine, "Malware", json!({"name": "Trickbot"})).await;
    let mut data = Attributes::new();
    data.insert("fromId".into(), json!(emotet.internal_id.to_string()));
    data.insert("toId".into(), json!(trickbot.internal_id.to_string()));

    let first = h
        .engine
        .create_inferred_relation(
            "related-to",
            data.clone(),
            RuleContribution::new("observe_sighting", vec!["dep-a".into()], input(json!({"confidence": 30}))),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(first.element.is_inferred());
    assert_eq!(first.element.attribute("confidence"), Some(&json!(30)));

    let second = h
        .engine
        .create_inferred_relation(
            "related-to",
            data,
            RuleContribution::new("location_targets", vec!["dep-b".into()], input(json!({"confidence": 10}))),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.element.internal_id, first.element.internal_id);
    assert_eq!(second.element.attribute("confidence"), Some(&json!(20)));
    assert_eq!(second.element.attribute("i_inference_weight"), Some(&json!(2)));

    let id = first.element.internal_id.to_string();
    h.engine
        .delete_inferred_rule_element("location_targets", &id, "dep-b")
        .await;
    let remaining = h.engine.load_by_id(&id).await.unwrap().unwrap();
    assert_eq!(remaining.attribute("confidence"), Some(&json!(30)));
    assert_eq!(remaining.rules.len(), 1);

    h.engine
        .delete_inferred_rule_element("observe_sighting", &id, "dep-a")
        .await;
    assert!(h.engine.load_by_id(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_inferred_self_loop_is_ignored() {
    let h = harness();
    let emotet = entity(&h.engine, "Malware", json!({"name": "Emotet"})).await;
    let mut data = Attributes::new();
    data.insert("fromId".into(), json!(emotet.internal_id.to_string()));
    data.insert("toId".into(), json!(emotet.standard_id));
    let created = h
        .engine
        .create_inferred_relation(
            "related-to",
            data,
            RuleContribution::new("observe_sighting", vec![], Attributes::new()),
        )
        .await
        .unwrap();
    assert!(created.is_none());
}

// ── Locking ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_contended_element_times_out() {
    let locks = LocalLockService::new();
    let index = Arc::new(MemoryIndex::new());
    let mut config = EngineConfig::default();
    config.lock.timeout_ms = 50;
    let engine = MutationEngine::builder(index, Arc::new(MemoryStream::new()))
        .lock_service(Arc::new(locks.clone()))
        .config(config)
        .build();
    let malware = entity(&engine, "Malware", json!({"name": "Emotet"})).await;

    let held = locks
        .acquire(
            &[malware.internal_id.to_string()],
            Duration::from_secs(30),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    let err = engine
        .update_attribute(
            &malware.internal_id.to_string(),
            vec![EditInput::replace("description", vec![json!("loader")])],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    assert!(err.is_retryable());

    drop(held);
    assert!(engine
        .update_attribute(
            &malware.internal_id.to_string(),
            vec![EditInput::replace("description", vec![json!("loader")])],
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn test_concurrent_creations_converge() {
    let h = Arc::new(harness());
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = Arc::clone(&h);
        tasks.push(tokio::spawn(async move {
            h.engine
                .create_entity("Malware", input(json!({"name": "Emotet"})))
                .await
                .map(|o| o.element.internal_id)
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.index.len().await, 1);
    assert_eq!(h.stream.count(EventKind::Create).await, 1);
}

// ── Journal ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_events_are_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Arc::new(JournalStream::open(dir.path()).unwrap());
    let engine = MutationEngine::builder(Arc::new(MemoryIndex::new()), journal.clone()).build();

    let malware = entity(&engine, "Malware", json!({"name": "Emotet"})).await;
    engine
        .update_attribute(
            &malware.internal_id.to_string(),
            vec![EditInput::replace("description", vec![json!("loader")])],
        )
        .await
        .unwrap();

    let records = journal.read_all().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.verify_integrity()));
    assert_eq!(records[1].previous_hash.as_deref(), Some(records[0].content_hash.as_str()));
}
