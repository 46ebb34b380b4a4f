//! Transaction orchestrator.
//!
//! [`MutationEngine`] composes the identity, reference, lock, attribute,
//! relationship, merge and rule engines. Every public mutation runs as a
//! [`Transaction`] moving through
//! `Resolving → Locking → Mutating → Indexing → Publishing → Done`, or
//! `Aborted` on error. The operations themselves are spread over the
//! sibling modules as further `impl MutationEngine` blocks.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use tessera_core::config::{EngineConfig, MergeConfig};
use tessera_core::schema::{is_empty_value, RelationFamily};
use tessera_core::types::{strings_of, KEY_STIX_IDS};
use tessera_core::{
    dates, Attributes, ChangeEvent, Connection, EditInput, Element, EndpointSide, EventPayload,
    IndexFamily, ObjectId, SchemaRegistry,
};
use tessera_store::{list_all, DocumentQuery, IndexStore};
use tessera_stream::{EventHandle, EventPublisher};

use crate::attributes::AttributeEngine;
use crate::error::{EngineError, Result};
use crate::identity::{normalize_name, IdentityResolver, INPUT_INTERNAL_ID, INPUT_STIX_ID};
use crate::locks::{
    LocalLockService, LockCoordinator, LockGuard, LockScope, LockService, ParticipantSet,
};
use crate::merge::MergeOptions;
use crate::references::{ReferenceResolver, ResolvedInput, INPUT_UPDATE};
use crate::relations;
use crate::tombstones::{MemoryTombstones, TombstoneCache};
use crate::upsert::stix_ids_of;

/// Keys of a creation input that never become attributes.
const CONTROL_KEYS: &[&str] = &[
    INPUT_UPDATE,
    INPUT_STIX_ID,
    INPUT_INTERNAL_ID,
    KEY_STIX_IDS,
    "standard_id",
    "alias_ids",
    "created_at",
    "updated_at",
    "i_inference_weight",
];

// ── Transactions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxState {
    Resolving,
    Locking,
    Mutating,
    Indexing,
    Publishing,
    Done,
    Aborted,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "RESOLVING",
            Self::Locking => "LOCKING",
            Self::Mutating => "MUTATING",
            Self::Indexing => "INDEXING",
            Self::Publishing => "PUBLISHING",
            Self::Done => "DONE",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// State tracking for one mutation.
#[derive(Debug)]
pub struct Transaction {
    id: Uuid,
    operation: &'static str,
    state: TxState,
    started: Instant,
}

impl Transaction {
    pub fn begin(operation: &'static str) -> Self {
        let tx = Self {
            id: Uuid::new_v4(),
            operation,
            state: TxState::Resolving,
            started: Instant::now(),
        };
        tracing::debug!(tx = %tx.id, operation, "Transaction started");
        tx
    }

    /// A nested mutation sharing the parent's id.
    pub fn child(&self, operation: &'static str) -> Self {
        Self {
            id: self.id,
            operation,
            state: TxState::Resolving,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn advance(&mut self, next: TxState) {
        if next != self.state {
            tracing::debug!(
                tx = %self.id,
                operation = self.operation,
                from = %self.state,
                to = %next,
                "Transaction state"
            );
            self.state = next;
        }
    }

    pub fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                self.advance(TxState::Done);
                tracing::debug!(
                    tx = %self.id,
                    operation = self.operation,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "Transaction done"
                );
            }
            Err(e) => {
                tracing::warn!(
                    tx = %self.id,
                    operation = self.operation,
                    failed_in = %self.state,
                    kind = ?e.kind(),
                    error = %e,
                    "Transaction aborted"
                );
                self.state = TxState::Aborted;
            }
        }
        result
    }
}

// ── Outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub element: Element,
    /// The input matched an existing element, which was upserted.
    #[serde(rename = "i_upserted")]
    pub upserted: bool,
    pub event: Option<EventHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub element: Element,
    pub changes: Vec<EditInput>,
    /// Set when the update collided with another identity and was merged into it.
    pub merged_into: Option<ObjectId>,
    pub event: Option<EventHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub element: Element,
    pub dependencies: Vec<ObjectId>,
    pub event: EventHandle,
}

/// An element with every relationship attached to it.
#[derive(Debug, Clone, Serialize)]
pub struct FullElement {
    pub element: Element,
    /// Relationships where the element is `from`.
    pub outbound: Vec<Element>,
    /// Relationships where the element is `to`.
    pub inbound: Vec<Element>,
}

impl FullElement {
    pub fn relations(&self) -> impl Iterator<Item = &Element> {
        self.outbound.iter().chain(self.inbound.iter())
    }
}

// ── Engine ───────────────────────────────────────────────────────

pub struct MutationEngine {
    pub(crate) schema: Arc<SchemaRegistry>,
    pub(crate) identity: IdentityResolver,
    pub(crate) references: ReferenceResolver,
    pub(crate) attributes: AttributeEngine,
    pub(crate) store: Arc<dyn IndexStore>,
    pub(crate) publisher: Arc<dyn EventPublisher>,
    pub(crate) locks: LockCoordinator,
    pub(crate) tombstones: Arc<dyn TombstoneCache>,
    pub(crate) merge_config: MergeConfig,
}

pub struct EngineBuilder {
    store: Arc<dyn IndexStore>,
    publisher: Arc<dyn EventPublisher>,
    schema: Option<Arc<SchemaRegistry>>,
    lock_service: Option<Arc<dyn LockService>>,
    tombstones: Option<Arc<dyn TombstoneCache>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn schema(mut self, schema: Arc<SchemaRegistry>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn lock_service(mut self, service: Arc<dyn LockService>) -> Self {
        self.lock_service = Some(service);
        self
    }

    pub fn tombstones(mut self, tombstones: Arc<dyn TombstoneCache>) -> Self {
        self.tombstones = Some(tombstones);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> MutationEngine {
        let schema = self
            .schema
            .unwrap_or_else(|| Arc::new(SchemaRegistry::builtin()));
        let identity = IdentityResolver::new(Arc::clone(&schema));
        let tombstones = self.tombstones.unwrap_or_else(|| {
            Arc::new(MemoryTombstones::new(Duration::from_secs(
                self.config.tombstones.ttl_secs,
            )))
        });
        let lock_service = self
            .lock_service
            .unwrap_or_else(|| Arc::new(LocalLockService::new()));
        let locks = LockCoordinator::new(
            lock_service,
            Duration::from_millis(self.config.lock.ttl_ms),
            Duration::from_millis(self.config.lock.timeout_ms),
        );
        let references = ReferenceResolver::new(
            Arc::clone(&schema),
            identity.clone(),
            Arc::clone(&self.store),
            Arc::clone(&tombstones),
        );
        let attributes = AttributeEngine::new(Arc::clone(&schema), identity.clone());

        tracing::info!(
            batch_size = self.config.merge.batch_size,
            max_concurrent_batches = self.config.merge.max_concurrent_batches,
            lock_timeout_ms = self.config.lock.timeout_ms,
            "Mutation engine ready"
        );
        MutationEngine {
            schema,
            identity,
            references,
            attributes,
            store: self.store,
            publisher: self.publisher,
            locks,
            tombstones,
            merge_config: self.config.merge,
        }
    }
}

impl MutationEngine {
    pub fn builder(store: Arc<dyn IndexStore>, publisher: Arc<dyn EventPublisher>) -> EngineBuilder {
        EngineBuilder {
            store,
            publisher,
            schema: None,
            lock_service: None,
            tombstones: None,
            config: EngineConfig::default(),
        }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    // ── Readers ──────────────────────────────────────────────────

    /// Load an element by any of its ids.
    pub async fn load_by_id(&self, id: &str) -> Result<Option<Element>> {
        let found = self.store.find_by_ids(&[id.to_string()], &[]).await?;
        if let Some(internal) = ObjectId::parse(id) {
            if let Some(exact) = found.iter().find(|e| e.internal_id == internal) {
                return Ok(Some(exact.clone()));
            }
        }
        Ok(found.into_iter().next())
    }

    /// Load an element together with its inbound and outbound relationships.
    pub async fn full_load_by_id(&self, id: &str) -> Result<Option<FullElement>> {
        let Some(element) = self.load_by_id(id).await? else {
            return Ok(None);
        };
        let outbound = self
            .relations_of(element.internal_id, Some(EndpointSide::From), &[])
            .await?;
        let inbound = self
            .relations_of(element.internal_id, Some(EndpointSide::To), &[])
            .await?;
        Ok(Some(FullElement {
            element,
            outbound,
            inbound,
        }))
    }

    /// Relationships (manual and inferred) touching an element.
    pub(crate) async fn relations_of(
        &self,
        id: ObjectId,
        role: Option<EndpointSide>,
        types: &[&str],
    ) -> Result<Vec<Element>> {
        let query = DocumentQuery::new()
            .families(&[
                IndexFamily::Relationships,
                IndexFamily::InferredRelationships,
            ])
            .types(types)
            .connection(role, &[id], &[]);
        Ok(list_all(self.store.as_ref(), &query).await?)
    }

    // ── Entity creation ──────────────────────────────────────────

    /// Create an entity, or upsert the existing element it resolves to.
    pub async fn create_entity(&self, entity_type: &str, input: Attributes) -> Result<CreateOutcome> {
        let mut tx = Transaction::begin("create_entity");
        let result = self
            .create_entity_in(&mut tx, &LockScope::default(), entity_type, input)
            .await;
        tx.finish(result)
    }

    async fn create_entity_in(
        &self,
        tx: &mut Transaction,
        scope: &LockScope,
        entity_type: &str,
        input: Attributes,
    ) -> Result<CreateOutcome> {
        let definition = self
            .schema
            .entity(entity_type)
            .ok_or_else(|| EngineError::Functional(format!("Unknown entity type {entity_type}")))?;
        let resolved = self.references.resolve(entity_type, input).await?;

        let mut keyed = resolved.data.clone();
        for (key, value) in &definition.defaults {
            keyed.entry(key.clone()).or_insert_with(|| value.clone());
        }
        let standard_id = self.identity.standard_id(entity_type, &keyed);
        let input_ids = self.identity.input_ids(entity_type, &keyed, &standard_id);

        tx.advance(TxState::Locking);
        let participants: ParticipantSet = input_ids.iter().collect();
        let guard = self.locks.acquire(scope, &participants).await?;

        tx.advance(TxState::Mutating);
        let existing: Vec<Element> = self
            .store
            .find_by_ids(&input_ids, &[entity_type.to_string()])
            .await?
            .into_iter()
            .filter(|e| e.entity_type == entity_type)
            .collect();

        let outcome = match existing.len() {
            0 => self.insert_entity(tx, &resolved, standard_id).await?,
            1 => {
                let found = existing.into_iter().next().ok_or_else(|| {
                    EngineError::Database("Existing element vanished".into())
                })?;
                self.upsert_found(tx, guard.scope(), &found, &resolved).await?
            }
            _ => {
                self.resolve_duplicates(tx, guard.scope(), existing, resolved, &standard_id)
                    .await?
            }
        };
        guard.release();
        Ok(outcome)
    }

    async fn insert_entity(
        &self,
        tx: &mut Transaction,
        resolved: &ResolvedInput,
        standard_id: String,
    ) -> Result<CreateOutcome> {
        let element = self.build_entity(resolved, standard_id)?;
        let meta = self.meta_relations_for(&element, resolved)?;

        tx.advance(TxState::Indexing);
        let mut documents = Vec::with_capacity(1 + meta.len());
        documents.push(element.clone());
        documents.extend(meta);
        self.store.index_elements(&documents).await?;

        tx.advance(TxState::Publishing);
        let message = format!("creates a {} `{}`", element.entity_type, display_name(&element));
        let event = self
            .publish(
                &element,
                message,
                EventPayload::Created {
                    element: element.clone(),
                },
            )
            .await?;
        tracing::info!(
            id = %element.internal_id,
            entity_type = %element.entity_type,
            references = documents.len() - 1,
            "Element created"
        );
        Ok(CreateOutcome {
            element,
            upserted: false,
            event: Some(event),
        })
    }

    pub(crate) async fn upsert_existing(
        &self,
        tx: &mut Transaction,
        instance: &Element,
        resolved: &ResolvedInput,
    ) -> Result<CreateOutcome> {
        let (element, changes) = self.upsert_element(tx, instance, resolved).await?;
        let event = self.publish_update(tx, &element, changes).await?;
        tracing::debug!(id = %element.internal_id, changed = event.is_some(), "Element upserted");
        Ok(CreateOutcome {
            element,
            upserted: true,
            event,
        })
    }

    /// [`upsert_existing`](Self::upsert_existing) under the element's own lock.
    pub(crate) async fn upsert_found(
        &self,
        tx: &mut Transaction,
        scope: &LockScope,
        found: &Element,
        resolved: &ResolvedInput,
    ) -> Result<CreateOutcome> {
        let (held, instance) = self.lock_found(scope, found).await?;
        let outcome = self.upsert_existing(tx, &instance, resolved).await;
        held.release();
        outcome
    }

    /// Lock an element found through other ids, the way an update on it
    /// would, and read it again under that lock.
    pub(crate) async fn lock_found(&self, scope: &LockScope, found: &Element) -> Result<(LockGuard, Element)> {
        let participants: ParticipantSet = [found.internal_id.to_string(), found.standard_id.clone()]
            .into_iter()
            .collect();
        let guard = self.locks.acquire(scope, &participants).await?;
        let current = self.reload(found.internal_id).await?;
        Ok((guard, current))
    }

    /// Several existing elements answer to the input ids.
    async fn resolve_duplicates(
        &self,
        tx: &mut Transaction,
        scope: &LockScope,
        existing: Vec<Element>,
        mut resolved: ResolvedInput,
        standard_id: &str,
    ) -> Result<CreateOutcome> {
        let entity_type = resolved.entity_type.clone();
        let target_index = existing.iter().position(|e| e.standard_id == standard_id);

        if resolved.update_requested() {
            let target_index = target_index.unwrap_or(0);
            let target = existing[target_index].internal_id;
            let sources: Vec<ObjectId> = existing
                .iter()
                .map(|e| e.internal_id)
                .filter(|id| *id != target)
                .collect();
            tracing::info!(
                target_id = %target,
                sources = sources.len(),
                entity_type = %entity_type,
                "Merging duplicates before upsert"
            );
            let mut child = tx.child("merge_entities");
            let merged = self
                .merge_in(&mut child, scope, target, &sources, &MergeOptions::default())
                .await;
            let merged = child.finish(merged)?;
            return self.upsert_found(tx, scope, &merged, &resolved).await;
        }

        let Some(target_index) = target_index else {
            return Err(EngineError::Unsupported(format!(
                "Input resolves to {} existing {entity_type} elements",
                existing.len()
            )));
        };
        let mut target = existing[target_index].clone();

        // The element owning the given stix id is folded into the identity match.
        let stix_id = resolved
            .data
            .get(INPUT_STIX_ID)
            .and_then(Value::as_str)
            .map(str::to_lowercase);
        let owner = stix_id.as_ref().and_then(|stix_id| {
            existing.iter().find(|e| {
                e.internal_id != target.internal_id
                    && (e.standard_id.eq_ignore_ascii_case(stix_id)
                        || e.stix_ids.iter().any(|s| s.eq_ignore_ascii_case(stix_id)))
            })
        });
        let mut absorbed = None;
        if let Some(owner) = owner {
            let mut child = tx.child("merge_entities");
            let merged = self
                .merge_in(
                    &mut child,
                    scope,
                    target.internal_id,
                    &[owner.internal_id],
                    &MergeOptions::default(),
                )
                .await;
            target = child.finish(merged)?;
            absorbed = Some(owner.internal_id);
        }

        // Aliases that belong to other elements stay with them.
        if let Some(field) = self.schema.alias_field(&entity_type) {
            let others: Vec<&Element> = existing
                .iter()
                .filter(|e| e.internal_id != target.internal_id && Some(e.internal_id) != absorbed)
                .collect();
            if let Some(aliases) = resolved.data.get(field) {
                let kept: Vec<Value> = strings_of(aliases)
                    .into_iter()
                    .filter(|alias| {
                        let ids = self.identity.alias_ids(&entity_type, &[alias.as_str()]);
                        !others
                            .iter()
                            .any(|other| other.alias_ids.iter().any(|a| ids.contains(a)))
                    })
                    .map(Value::String)
                    .collect();
                resolved.data.insert(field.to_string(), Value::Array(kept));
            }
        }
        self.upsert_found(tx, scope, &target, &resolved).await
    }

    // ── Builders ─────────────────────────────────────────────────

    /// Schema attributes of an input, coerced, with control and unknown keys dropped.
    pub(crate) fn prepare_attributes(&self, type_name: &str, data: &Attributes) -> Attributes {
        let mut attributes = Attributes::new();
        for (key, value) in data {
            if CONTROL_KEYS.contains(&key.as_str()) {
                continue;
            }
            let Some(attr) = self.schema.attribute(type_name, key) else {
                tracing::debug!(type_name, key = %key, "Ignoring unknown attribute");
                continue;
            };
            if attr.multiple {
                let mut values: Vec<Value> = Vec::new();
                let items = match value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                for item in items {
                    let item = attr.kind.coerce(item);
                    if !is_empty_value(&item) && !values.contains(&item) {
                        values.push(item);
                    }
                }
                if !values.is_empty() {
                    attributes.insert(key.clone(), Value::Array(values));
                }
            } else {
                let coerced = attr.kind.coerce(value.clone());
                if !is_empty_value(&coerced) {
                    attributes.insert(key.clone(), coerced);
                }
            }
        }
        attributes
    }

    /// Add day/month/year shadows for every stats date present.
    pub(crate) fn add_date_shadows(&self, type_name: &str, attributes: &mut Attributes) {
        let stats: Vec<(String, Value)> = self
            .schema
            .attributes(type_name)
            .filter(|a| a.stats_date)
            .filter_map(|a| attributes.get(&a.name).map(|v| (a.name.clone(), v.clone())))
            .collect();
        for (key, value) in stats {
            for (shadow, v) in dates::shadow_fields(&key, &value) {
                attributes.insert(shadow, v);
            }
        }
    }

    fn build_entity(&self, resolved: &ResolvedInput, standard_id: String) -> Result<Element> {
        let entity_type = resolved.entity_type.as_str();
        let definition = self
            .schema
            .entity(entity_type)
            .ok_or_else(|| EngineError::Functional(format!("Unknown entity type {entity_type}")))?;

        let mut element = Element::new_entity(
            entity_type,
            self.schema.parent_types(entity_type),
            standard_id,
        );
        if let Some(id) = resolved
            .data
            .get(INPUT_INTERNAL_ID)
            .and_then(Value::as_str)
            .and_then(ObjectId::parse)
        {
            element.internal_id = id;
        }

        let mut attributes = self.prepare_attributes(entity_type, &resolved.data);
        for (key, value) in &definition.defaults {
            attributes.entry(key.clone()).or_insert_with(|| value.clone());
        }
        attributes
            .entry("spec_version".to_string())
            .or_insert_with(|| Value::String("2.1".into()));
        if self.schema.has_domain_clock(entity_type) {
            let now = dates::now_string();
            let confidence = relations::confidence_from_reliability(resolved.created_by());
            attributes.entry("confidence".to_string()).or_insert(confidence.into());
            attributes.entry("revoked".to_string()).or_insert(Value::Bool(false));
            attributes.entry("lang".to_string()).or_insert_with(|| "en".into());
            attributes
                .entry("created".to_string())
                .or_insert_with(|| Value::String(now.clone()));
            attributes
                .entry("modified".to_string())
                .or_insert_with(|| Value::String(now));
        }
        let expired = attributes
            .get("valid_until")
            .and_then(dates::parse)
            .is_some_and(|until| until < dates::now());
        if expired {
            attributes.insert("revoked".into(), Value::Bool(true));
            if definition.detection_flag {
                attributes.insert("x_opencti_detection".into(), Value::Bool(false));
            }
        }
        self.add_date_shadows(entity_type, &mut attributes);

        element.stix_ids = stix_ids_of(&resolved.data, &element.standard_id);
        element.alias_ids = self.identity.alias_ids_of(entity_type, &attributes);
        element.attributes = attributes;
        Ok(element)
    }

    /// Meta relationships for the references of an input.
    pub(crate) fn meta_relations_for(
        &self,
        element: &Element,
        resolved: &ResolvedInput,
    ) -> Result<Vec<Element>> {
        let family = self.schema.relation(&element.entity_type).map(|r| r.family);
        let mut relations = Vec::new();
        for (relationship_type, targets) in &resolved.refs {
            if !carries_reference(family, relationship_type) {
                tracing::debug!(
                    entity_type = %element.entity_type,
                    relationship_type = %relationship_type,
                    "Reference not carried by this type"
                );
                continue;
            }
            for target in targets {
                if !self.schema.relation_allowed(relationship_type, element, target) {
                    return Err(EngineError::Functional(format!(
                        "{relationship_type} cannot link {} to {}",
                        element.entity_type, target.entity_type
                    )));
                }
                relations.push(self.build_meta_relation(relationship_type, element, target));
            }
        }
        Ok(relations)
    }

    pub(crate) fn build_meta_relation(
        &self,
        relationship_type: &str,
        from: &Element,
        to: &Element,
    ) -> Element {
        let connection = Connection {
            from_id: from.internal_id,
            from_type: from.entity_type.clone(),
            to_id: to.internal_id,
            to_type: to.entity_type.clone(),
        };
        let mut relation = Element::new_relation(
            relationship_type,
            self.schema.parent_types(relationship_type),
            self.identity.standard_id(relationship_type, &Attributes::new()),
            connection,
            from.is_inferred(),
        );
        relation
            .attributes
            .insert("spec_version".into(), Value::String("2.1".into()));
        relation
    }

    // ── Publishing ───────────────────────────────────────────────

    pub(crate) async fn publish(
        &self,
        subject: &Element,
        message: String,
        payload: EventPayload,
    ) -> Result<EventHandle> {
        let event = ChangeEvent::new(subject, message, payload);
        let kind = event.kind();
        let handle = self.publisher.publish(event).await?;
        tracing::debug!(
            id = %subject.internal_id,
            kind = %kind,
            sequence = handle.sequence,
            "Change event published"
        );
        Ok(handle)
    }

    /// Publish an update event, unless nothing changed.
    pub(crate) async fn publish_update(
        &self,
        tx: &mut Transaction,
        element: &Element,
        changes: Vec<EditInput>,
    ) -> Result<Option<EventHandle>> {
        if changes.is_empty() {
            return Ok(None);
        }
        tx.advance(TxState::Publishing);
        let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
        let message = format!(
            "updates `{}` of {} `{}`",
            keys.join(", "),
            element.entity_type,
            display_name(element)
        );
        let handle = self
            .publish(
                element,
                message,
                EventPayload::Updated {
                    changes,
                    element: element.clone(),
                },
            )
            .await?;
        Ok(Some(handle))
    }
}

/// Which meta references each relationship family carries; entities carry all.
pub(crate) fn carries_reference(family: Option<RelationFamily>, relationship_type: &str) -> bool {
    match family {
        None => true,
        Some(RelationFamily::Core) => matches!(
            relationship_type,
            "created-by" | "object-marking" | "kill-chain-phase" | "external-reference"
        ),
        Some(RelationFamily::Sighting) => {
            matches!(relationship_type, "created-by" | "object-marking")
        }
        Some(RelationFamily::Meta) => false,
    }
}

/// Human-readable name used in event messages.
pub(crate) fn display_name(element: &Element) -> String {
    if let Some(connection) = &element.connection {
        return format!("{} to {}", connection.from_id, connection.to_id);
    }
    ["name", "value", "definition", "url", "pattern"]
        .iter()
        .find_map(|key| element.attribute(key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| element.standard_id.clone())
}

/// Whether two names are the same after normalisation.
pub(crate) fn same_name(a: &str, b: &str) -> bool {
    normalize_name(a) == normalize_name(b)
}
