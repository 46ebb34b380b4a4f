//! Entity merging.
//!
//! Sources are folded into a target of the same type: their relationships
//! are redirected to the target, their attributes reconciled into it, and
//! they are deleted. Redirections run in bounded concurrent batches; a
//! failure at any later step reverts them and restores deleted documents.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use tessera_core::schema::is_empty_value;
use tessera_core::types::{is_rule_key, KEY_STIX_IDS};
use tessera_core::{
    dates, AttributeKind, ConnectionUpdate, EditInput, Element, EndpointSide, EventPayload,
    ObjectId, SchemaRegistry,
};
use tessera_store::IndexStore;

use crate::attributes::UpdateOutcome;
use crate::engine::{display_name, same_name, FullElement, MutationEngine, Transaction, TxState};
use crate::error::{EngineError, Result};
use crate::locks::{LockScope, ParticipantSet};

/// Attributes that belong to an element's own lifecycle and are never reconciled.
const UNMERGED_KEYS: &[&str] = &[
    "standard_id",
    "alias_ids",
    "created_at",
    "updated_at",
    "modified",
    "spec_version",
    KEY_STIX_IDS,
];

/// An element keeps at most one creator.
const CREATOR: &str = "created-by";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Attribute to the id of the element whose value wins.
    #[serde(default)]
    pub chosen_fields: BTreeMap<String, String>,
}

impl MergeOptions {
    pub fn choose(mut self, key: &str, element_id: &str) -> Self {
        self.chosen_fields.insert(key.to_string(), element_id.to_string());
        self
    }
}

/// Endpoint rewrites and relationships made redundant by a merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedirectionPlan {
    pub updates: Vec<ConnectionUpdate>,
    pub dropped: Vec<ObjectId>,
}

/// Decide, for every relationship of the sources, whether it moves to the
/// target or is dropped as a duplicate or a loop.
pub fn plan_redirections(target: &FullElement, sources: &[FullElement]) -> RedirectionPlan {
    let target_id = target.element.internal_id;
    let source_ids: HashSet<ObjectId> = sources.iter().map(|s| s.element.internal_id).collect();

    let undated_on_target: HashSet<(String, EndpointSide, ObjectId)> = target
        .outbound
        .iter()
        .map(|r| (r, EndpointSide::From))
        .chain(target.inbound.iter().map(|r| (r, EndpointSide::To)))
        .filter(|(r, _)| is_undated(r))
        .filter_map(|(r, side)| {
            let connection = r.connection.as_ref()?;
            let (other, _) = connection.endpoint(side.opposite());
            Some((r.entity_type.clone(), side, other))
        })
        .collect();

    let mut plan = RedirectionPlan::default();
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut taken: HashSet<(String, EndpointSide, ObjectId)> = HashSet::new();
    let mut creator_taken = target.outbound.iter().any(|r| r.entity_type == CREATOR);

    for source in sources {
        let source_id = source.element.internal_id;
        let sided = source
            .outbound
            .iter()
            .map(|r| (r, EndpointSide::From))
            .chain(source.inbound.iter().map(|r| (r, EndpointSide::To)));
        for (relation, side) in sided {
            if !seen.insert(relation.internal_id) {
                continue;
            }
            let Some(connection) = relation.connection.as_ref() else {
                continue;
            };
            let (other, _) = connection.endpoint(side.opposite());
            if other == target_id || source_ids.contains(&other) {
                plan.dropped.push(relation.internal_id);
                continue;
            }
            if relation.entity_type == CREATOR && side == EndpointSide::From {
                if creator_taken {
                    plan.dropped.push(relation.internal_id);
                    continue;
                }
                creator_taken = true;
            } else {
                let key = (relation.entity_type.clone(), side, other);
                if undated_on_target.contains(&key) || !taken.insert(key) {
                    plan.dropped.push(relation.internal_id);
                    continue;
                }
            }
            plan.updates.push(ConnectionUpdate {
                relation_id: relation.internal_id,
                relationship_type: relation.entity_type.clone(),
                side,
                previous_id: source_id,
                target_id,
                target_type: target.element.entity_type.clone(),
            });
        }
    }
    plan
}

fn is_undated(relation: &Element) -> bool {
    ["start_time", "stop_time", "first_seen", "last_seen"]
        .iter()
        .all(|key| dates::is_open(relation.attribute(key)))
}

/// Edit inputs folding the sources' attributes into the target.
///
/// Multi-valued attributes are unioned, dictionaries gain the keys the target
/// lacks, and single values fill the target only where it is empty, taken
/// from the chosen source when one is named for the attribute.
pub fn reconcile(
    schema: &SchemaRegistry,
    target: &Element,
    sources: &[Element],
    options: &MergeOptions,
) -> Result<Vec<EditInput>> {
    let entity_type = target.entity_type.as_str();
    let alias_field = schema.alias_field(entity_type);
    let mut inputs = Vec::new();

    for (key, chosen) in &options.chosen_fields {
        let known = std::iter::once(target)
            .chain(sources)
            .any(|e| e.ids().iter().any(|id| id.eq_ignore_ascii_case(chosen)));
        if !known {
            return Err(EngineError::Functional(format!(
                "Value of {key} chosen from {chosen}, which takes no part in the merge"
            )));
        }
    }

    for attr in schema.attributes(entity_type) {
        let key = attr.name.as_str();
        if UNMERGED_KEYS.contains(&key) || key.starts_with("i_") || is_rule_key(key) {
            continue;
        }

        if attr.kind == AttributeKind::Dictionary {
            let current = target
                .attribute(key)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let mut filled: Vec<String> = Vec::new();
            for source in sources {
                let Some(entries) = source.attribute(key).and_then(Value::as_object) else {
                    continue;
                };
                for (path, value) in entries {
                    if current.contains_key(path) || filled.contains(path) || is_empty_value(value) {
                        continue;
                    }
                    filled.push(path.clone());
                    inputs.push(EditInput::replace(format!("{key}.{path}"), vec![value.clone()]));
                }
            }
            continue;
        }

        if attr.multiple {
            let mut values: Vec<Value> = Vec::new();
            for source in sources {
                if let Some(Value::Array(items)) = source.attribute(key) {
                    values.extend(items.iter().cloned());
                }
                if Some(key) == alias_field {
                    let foreign_name = source
                        .name()
                        .filter(|name| target.name().map_or(true, |own| !same_name(own, name)));
                    if let Some(name) = foreign_name {
                        values.push(Value::String(name.to_string()));
                    }
                }
            }
            if !values.is_empty() {
                inputs.push(EditInput::add(key, values));
            }
            continue;
        }

        let filled = |e: &Element| {
            e.attribute(key)
                .filter(|v| !is_empty_value(v) && !dates::is_sentinel(v))
                .cloned()
        };
        if filled(target).is_some() {
            continue;
        }
        // A chosen source only decides who fills an empty target.
        if let Some(chosen) = options.chosen_fields.get(key) {
            let value = sources
                .iter()
                .find(|e| e.ids().iter().any(|id| id.eq_ignore_ascii_case(chosen)))
                .and_then(filled);
            if let Some(value) = value {
                inputs.push(EditInput::replace(key, vec![value]));
                continue;
            }
        }
        let candidates: Vec<Value> = sources.iter().filter_map(filled).collect();
        let Some(first) = candidates.first() else {
            continue;
        };
        if candidates.iter().any(|v| v != first) {
            tracing::warn!(
                id = %target.internal_id,
                key,
                candidates = candidates.len(),
                "Sources disagree on a value, keeping the first"
            );
        }
        inputs.push(EditInput::replace(key, vec![first.clone()]));
    }

    let stix_ids: Vec<Value> = sources
        .iter()
        .flat_map(|s| s.stix_ids.iter())
        .filter(|id| !target.stix_ids.contains(id))
        .map(|id| Value::String(id.clone()))
        .collect();
    if !stix_ids.is_empty() {
        inputs.push(EditInput::add(KEY_STIX_IDS, stix_ids));
    }
    Ok(inputs)
}

/// Endpoint rewrites undoing applied ones. Merges only join elements of one
/// type, so the restored endpoint keeps the target's type.
fn inverse(updates: &[ConnectionUpdate]) -> Vec<ConnectionUpdate> {
    updates
        .iter()
        .map(|u| ConnectionUpdate {
            relation_id: u.relation_id,
            relationship_type: u.relationship_type.clone(),
            side: u.side,
            previous_id: u.target_id,
            target_id: u.previous_id,
            target_type: u.target_type.clone(),
        })
        .collect()
}

impl MutationEngine {
    /// Merge sources into the target. Ids may be any id of the elements.
    pub async fn merge_entities(
        &self,
        target_id: &str,
        source_ids: &[String],
        options: &MergeOptions,
    ) -> Result<Element> {
        let mut tx = Transaction::begin("merge_entities");
        let result: Result<Element> = async {
            let target = self
                .load_by_id(target_id)
                .await?
                .ok_or_else(|| EngineError::Functional(format!("Cannot find merge target {target_id}")))?;
            let mut sources = Vec::with_capacity(source_ids.len());
            for id in source_ids {
                let source = self
                    .load_by_id(id)
                    .await?
                    .ok_or_else(|| EngineError::Functional(format!("Cannot find merge source {id}")))?;
                sources.push(source.internal_id);
            }
            self.merge_in(&mut tx, &LockScope::default(), target.internal_id, &sources, options)
                .await
        }
        .await;
        tx.finish(result)
    }

    pub(crate) async fn merge_in(
        &self,
        tx: &mut Transaction,
        scope: &LockScope,
        target_id: ObjectId,
        source_ids: &[ObjectId],
        options: &MergeOptions,
    ) -> Result<Element> {
        let mut unique: Vec<ObjectId> = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        if unique.is_empty() {
            return Err(EngineError::Functional("Nothing to merge".into()));
        }
        if unique.contains(&target_id) {
            return Err(EngineError::Functional(format!(
                "Cannot merge {target_id} into itself"
            )));
        }

        let (target, sources) = self.load_merge_inputs(target_id, &unique).await?;
        tx.advance(TxState::Locking);
        let mut participants = ParticipantSet::new();
        for full in std::iter::once(&target).chain(&sources) {
            participants.insert(full.element.internal_id.to_string());
            participants.insert(&full.element.standard_id);
        }
        for full in &sources {
            for relation in full.relations() {
                participants.insert(relation.internal_id.to_string());
                if let Some(connection) = &relation.connection {
                    participants.insert(connection.from_id.to_string());
                    participants.insert(connection.to_id.to_string());
                }
            }
        }
        let guard = self.locks.acquire(scope, &participants).await?;

        // Relationships may have moved while waiting for the lock.
        let (target, sources) = self.load_merge_inputs(target_id, &unique).await?;
        let source_elements: Vec<Element> = sources.iter().map(|s| s.element.clone()).collect();
        let inputs = reconcile(&self.schema, &target.element, &source_elements, options)?;
        let plan = plan_redirections(&target, &sources);
        tracing::info!(
            target_id = %target_id,
            sources = sources.len(),
            redirected = plan.updates.len(),
            dropped = plan.dropped.len(),
            "Merging elements"
        );

        let outcome = self.attributes.compute_update(&target.element, &inputs, false)?;

        tx.advance(TxState::Mutating);
        self.apply_redirections(&plan.updates).await?;
        let (deleted, after) = match self.commit_merge(tx, &target.element, &unique, &outcome).await {
            Ok(committed) => committed,
            Err(e) => {
                tracing::warn!(target_id = %target_id, error = %e, "Merge failed after redirection, reverting");
                self.revert_redirections(&plan.updates).await;
                return Err(e);
            }
        };

        tx.advance(TxState::Publishing);
        let names: Vec<String> = source_elements
            .iter()
            .map(display_name)
            .collect();
        let message = format!(
            "merges {} `{}` into `{}`",
            after.entity_type,
            names.join(", "),
            display_name(&after)
        );
        self.publish(
            &after,
            message,
            EventPayload::Merged {
                before: target.element.clone(),
                after: after.clone(),
                sources: source_elements.clone(),
                redirections: plan.updates.clone(),
            },
        )
        .await?;

        let mut tombstones: Vec<String> = deleted.iter().map(ObjectId::to_string).collect();
        tombstones.extend(source_elements.iter().map(|s| s.standard_id.clone()));
        self.tombstones.record(&tombstones).await;
        guard.release();
        Ok(after)
    }

    async fn load_merge_inputs(
        &self,
        target_id: ObjectId,
        source_ids: &[ObjectId],
    ) -> Result<(FullElement, Vec<FullElement>)> {
        let target = self.load_full(target_id).await?;
        if target.element.is_relation() {
            return Err(EngineError::Functional("Relationships cannot be merged".into()));
        }
        let mut sources = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            let source = self.load_full(*id).await?;
            if source.element.entity_type != target.element.entity_type {
                return Err(EngineError::Functional(format!(
                    "Cannot merge {} {} into {} {}",
                    source.element.entity_type,
                    source.element.internal_id,
                    target.element.entity_type,
                    target.element.internal_id
                )));
            }
            sources.push(source);
        }
        Ok((target, sources))
    }

    async fn load_full(&self, id: ObjectId) -> Result<FullElement> {
        let element = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| EngineError::Functional(format!("Cannot find element {id}")))?;
        let outbound = self.relations_of(id, Some(EndpointSide::From), &[]).await?;
        let inbound = self.relations_of(id, Some(EndpointSide::To), &[]).await?;
        Ok(FullElement {
            element,
            outbound,
            inbound,
        })
    }

    /// Rewrite endpoints in batches, at most `max_concurrent_batches` at once.
    /// On the first failure the batches already applied are rewritten back.
    async fn apply_redirections(&self, updates: &[ConnectionUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let batch_size = self.merge_config.batch_size.max(1);
        let total = updates.len();
        let semaphore = Arc::new(Semaphore::new(self.merge_config.max_concurrent_batches.max(1)));
        let mut tasks: JoinSet<Result<Vec<ConnectionUpdate>>> = JoinSet::new();
        for chunk in updates.chunks(batch_size) {
            let store: Arc<dyn IndexStore> = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            let batch = chunk.to_vec();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Database("Redirection pool closed".into()))?;
                store.update_connections(&batch).await?;
                Ok(batch)
            });
        }

        let mut applied: Vec<Vec<ConnectionUpdate>> = Vec::new();
        let mut done = 0usize;
        let mut failure: Option<EngineError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(batch)) => {
                    done += batch.len();
                    tracing::info!(done, total, "Relationships redirected");
                    applied.push(batch);
                }
                Ok(Err(e)) => {
                    if failure.is_none() {
                        tasks.abort_all();
                        failure = Some(e);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if failure.is_none() {
                        tasks.abort_all();
                        failure = Some(EngineError::Database(format!("Redirection batch panicked: {e}")));
                    }
                }
            }
        }

        let Some(error) = failure else {
            return Ok(());
        };
        tracing::warn!(
            applied = applied.iter().map(Vec::len).sum::<usize>(),
            total,
            error = %error,
            "Redirection failed, reverting applied batches"
        );
        let applied: Vec<ConnectionUpdate> = applied.into_iter().flatten().collect();
        self.revert_redirections(&applied).await;
        Err(error)
    }

    /// Undo applied endpoint rewrites, last batch first.
    async fn revert_redirections(&self, applied: &[ConnectionUpdate]) {
        let batch_size = self.merge_config.batch_size.max(1);
        for batch in applied.chunks(batch_size).rev() {
            if let Err(revert) = self.store.update_connections(&inverse(batch)).await {
                tracing::error!(error = %revert, "Could not revert redirection batch");
            }
        }
    }

    /// Delete the sources with their remaining dependents, then patch the
    /// target. Deleted documents are indexed again when a step fails.
    async fn commit_merge(
        &self,
        tx: &mut Transaction,
        target: &Element,
        sources: &[ObjectId],
        outcome: &UpdateOutcome,
    ) -> Result<(Vec<ObjectId>, Element)> {
        let mut deleted: Vec<ObjectId> = sources.to_vec();
        for id in sources {
            for dependency in self.dependencies_of(*id).await? {
                if !deleted.contains(&dependency) {
                    deleted.push(dependency);
                }
            }
        }
        let mut removed = Vec::with_capacity(deleted.len());
        for id in &deleted {
            if let Some(element) = self.store.load(*id).await? {
                removed.push(element);
            }
        }

        tx.advance(TxState::Indexing);
        let result: Result<Element> = async {
            self.store.delete_elements(&deleted).await?;
            if outcome.is_empty() {
                return Ok(target.clone());
            }
            Ok(self
                .store
                .update_element(target.internal_id, outcome.document_patch())
                .await?)
        }
        .await;
        match result {
            Ok(after) => Ok((deleted, after)),
            Err(e) => {
                if let Err(restore) = self.store.index_elements(&removed).await {
                    tracing::error!(error = %restore, "Could not restore merge sources");
                }
                Err(e)
            }
        }
    }
}
