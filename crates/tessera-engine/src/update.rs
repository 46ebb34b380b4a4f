//! Attribute and reference updates on existing elements.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use tessera_core::{Attributes, EditInput, EditOperation, Element, EndpointSide, ObjectId};

use crate::attributes::inputs_from_patch;
use crate::engine::{carries_reference, MutationEngine, Transaction, TxState, UpdateResult};
use crate::error::{EngineError, Result};
use crate::locks::{LockScope, ParticipantSet};
use crate::merge::MergeOptions;

impl MutationEngine {
    /// Apply edit inputs to an element. Reference keys (`objectMarking`,
    /// `createdBy`, ...) add, remove or replace meta relationships; the other
    /// keys go through the attribute engine.
    pub async fn update_attribute(&self, id: &str, inputs: Vec<EditInput>) -> Result<UpdateResult> {
        let mut tx = Transaction::begin("update_attribute");
        let result: Result<UpdateResult> = async {
            let element = self
                .load_by_id(id)
                .await?
                .ok_or_else(|| EngineError::Functional(format!("Cannot update {id}: element not found")))?;
            self.update_in(&mut tx, element, inputs).await
        }
        .await;
        tx.finish(result)
    }

    /// [`update_attribute`](Self::update_attribute) from a flat `{key: value}` document.
    pub async fn patch_attribute(
        &self,
        id: &str,
        patch: &Attributes,
        operations: &BTreeMap<String, EditOperation>,
    ) -> Result<UpdateResult> {
        self.update_attribute(id, inputs_from_patch(patch, operations))
            .await
    }

    async fn update_in(
        &self,
        tx: &mut Transaction,
        element: Element,
        inputs: Vec<EditInput>,
    ) -> Result<UpdateResult> {
        if let Some(twice) = repeated_key(&inputs) {
            return Err(EngineError::Unsupported(format!(
                "Cannot update {twice} twice in the same request"
            )));
        }
        let (reference_inputs, attribute_inputs): (Vec<EditInput>, Vec<EditInput>) = inputs
            .into_iter()
            .partition(|i| self.schema.meta_relation_for_input(&i.key).is_some());
        let entity_type = element.entity_type.clone();

        let preview = self
            .attributes
            .compute_update(&element, &attribute_inputs, false)?;

        tx.advance(TxState::Locking);
        let participants: ParticipantSet = [
            element.internal_id.to_string(),
            element.standard_id.clone(),
            preview.updated_instance.standard_id.clone(),
        ]
        .into_iter()
        .collect();
        let guard = self.locks.acquire(&LockScope::default(), &participants).await?;
        let current = self.reload(element.internal_id).await?;

        tx.advance(TxState::Mutating);
        let outcome = self
            .attributes
            .compute_update(&current, &attribute_inputs, false)?;
        // The reloaded element may derive another identity than the preview.
        let identity: ParticipantSet = std::iter::once(&outcome.updated_instance.standard_id)
            .chain(&outcome.updated_instance.alias_ids)
            .collect();
        let identity_guard = self.locks.acquire(guard.scope(), &identity).await?;

        if let Some(existing) = self.identity_collision(&current, &outcome.updated_instance).await? {
            let keys: Vec<&str> = attribute_inputs.iter().map(|i| i.key.as_str()).collect();
            let identity_only = keys
                .iter()
                .all(|k| self.identity.contributes(&entity_type, &[*k]));
            if !(self.schema.is_observable(&entity_type) && identity_only && reference_inputs.is_empty()) {
                return Err(EngineError::Functional(format!(
                    "This update would make {} a duplicate of {entity_type} {}",
                    current.internal_id, existing.internal_id
                )));
            }
            tracing::info!(
                id = %current.internal_id,
                existing_id = %existing.internal_id,
                standard_id = %outcome.updated_instance.standard_id,
                "Update collides with an existing observable, merging"
            );
            let mut child = tx.child("merge_entities");
            let merged = self
                .merge_in(
                    &mut child,
                    identity_guard.scope(),
                    existing.internal_id,
                    &[current.internal_id],
                    &MergeOptions::default(),
                )
                .await;
            let merged = child.finish(merged)?;
            identity_guard.release();
            guard.release();
            return Ok(UpdateResult {
                merged_into: Some(merged.internal_id),
                element: merged,
                changes: Vec::new(),
                event: None,
            });
        }

        let mut changes = Vec::new();
        let mut element = current;
        if !outcome.is_empty() {
            tx.advance(TxState::Indexing);
            element = self
                .store
                .update_element(element.internal_id, outcome.document_patch())
                .await?;
            changes = outcome.updated_inputs;
        }
        for input in &reference_inputs {
            changes.extend(self.apply_reference_input(tx, &element, input).await?);
        }

        let event = self.publish_update(tx, &element, changes.clone()).await?;
        identity_guard.release();
        guard.release();
        if event.is_none() {
            tracing::debug!(id = %element.internal_id, "Nothing to update");
        }
        Ok(UpdateResult {
            element,
            changes,
            merged_into: None,
            event,
        })
    }

    /// Another element of the same type already owning one of the ids the
    /// update gives `current`. A new alias owned elsewhere is a functional
    /// error; a new standard id owned elsewhere is returned.
    async fn identity_collision(&self, current: &Element, updated: &Element) -> Result<Option<Element>> {
        let entity_type = &current.entity_type;
        let new_aliases: Vec<String> = updated
            .alias_ids
            .iter()
            .filter(|a| !current.alias_ids.contains(a))
            .cloned()
            .collect();
        if !new_aliases.is_empty() {
            let clash = self
                .store
                .find_by_ids(&new_aliases, &[entity_type.clone()])
                .await?
                .into_iter()
                .find(|e| &e.entity_type == entity_type && e.internal_id != current.internal_id);
            if let Some(other) = clash {
                return Err(EngineError::Functional(format!(
                    "Alias already used by {entity_type} {}",
                    other.internal_id
                )));
            }
        }
        if updated.standard_id == current.standard_id {
            return Ok(None);
        }
        Ok(self
            .store
            .find_by_ids(&[updated.standard_id.clone()], &[entity_type.clone()])
            .await?
            .into_iter()
            .find(|e| &e.entity_type == entity_type && e.internal_id != current.internal_id))
    }

    /// Add, remove or replace the meta relationships behind one reference key.
    async fn apply_reference_input(
        &self,
        tx: &mut Transaction,
        element: &Element,
        input: &EditInput,
    ) -> Result<Vec<EditInput>> {
        let Some(definition) = self.schema.meta_relation_for_input(&input.key) else {
            return Ok(Vec::new());
        };
        let relationship_type = definition.name.clone();
        let single = !definition.is_multiple();
        let family = self.schema.relation(&element.entity_type).map(|r| r.family);
        if !carries_reference(family, &relationship_type) {
            return Err(EngineError::Functional(format!(
                "{} does not carry {}",
                element.entity_type, input.key
            )));
        }

        let ids = self
            .references
            .reference_ids(&input.key, &Value::Array(input.value.clone()));
        let targets = if ids.is_empty() {
            Vec::new()
        } else {
            self.references.resolve_ids(&ids).await?
        };
        let existing = self
            .relations_of(
                element.internal_id,
                Some(EndpointSide::From),
                &[relationship_type.as_str()],
            )
            .await?;
        let linked: HashSet<ObjectId> = existing.iter().filter_map(Element::to_id).collect();
        let wanted: HashSet<ObjectId> = targets.iter().map(|t| t.internal_id).collect();

        let (added, removed): (Vec<&Element>, Vec<&Element>) = match input.operation {
            EditOperation::Add => (
                targets.iter().filter(|t| !linked.contains(&t.internal_id)).collect(),
                Vec::new(),
            ),
            EditOperation::Remove => (
                Vec::new(),
                existing
                    .iter()
                    .filter(|r| r.to_id().is_some_and(|to| wanted.contains(&to)))
                    .collect(),
            ),
            EditOperation::Replace => (
                targets.iter().filter(|t| !linked.contains(&t.internal_id)).collect(),
                existing
                    .iter()
                    .filter(|r| r.to_id().is_some_and(|to| !wanted.contains(&to)))
                    .collect(),
            ),
        };
        if added.is_empty() && removed.is_empty() {
            return Ok(Vec::new());
        }
        if single && existing.len().saturating_sub(removed.len()) + added.len() > 1 {
            return Err(EngineError::Unsupported(format!(
                "{} accepts a single {relationship_type} reference",
                element.entity_type
            )));
        }

        let mut relations = Vec::with_capacity(added.len());
        for target in &added {
            if !self.schema.relation_allowed(&relationship_type, element, target) {
                return Err(EngineError::Functional(format!(
                    "{relationship_type} cannot link {} to {}",
                    element.entity_type, target.entity_type
                )));
            }
            relations.push(self.build_meta_relation(&relationship_type, element, target));
        }

        tx.advance(TxState::Indexing);
        if !relations.is_empty() {
            self.store.index_elements(&relations).await?;
        }
        if !removed.is_empty() {
            let ids: Vec<ObjectId> = removed.iter().map(|r| r.internal_id).collect();
            self.store.delete_elements(&ids).await?;
            let tombstones: Vec<String> = ids.iter().map(ObjectId::to_string).collect();
            self.tombstones.record(&tombstones).await;
        }
        tracing::debug!(
            id = %element.internal_id,
            relationship_type = %relationship_type,
            added = added.len(),
            removed = removed.len(),
            "References updated"
        );

        let standard_ids = |elements: &[&Element]| -> Vec<Value> {
            elements
                .iter()
                .map(|e| Value::String(e.standard_id.clone()))
                .collect()
        };
        let removed_ids: HashSet<ObjectId> = removed.iter().filter_map(|r| r.to_id()).collect();
        let removed_targets: Vec<&Element> = targets
            .iter()
            .filter(|t| removed_ids.contains(&t.internal_id))
            .collect();
        let changes = match input.operation {
            EditOperation::Add => vec![EditInput::add(&input.key, standard_ids(&added))],
            EditOperation::Remove => vec![EditInput::remove(&input.key, standard_ids(&removed_targets))],
            EditOperation::Replace => {
                let all: Vec<&Element> = targets.iter().collect();
                vec![EditInput::replace(&input.key, standard_ids(&all)).with_previous(
                    linked.iter().map(|id| Value::String(id.to_string())).collect(),
                )]
            }
        };
        Ok(changes)
    }
}

fn repeated_key(inputs: &[EditInput]) -> Option<String> {
    let mut seen = HashSet::new();
    inputs
        .iter()
        .find(|i| !seen.insert(i.key.as_str()))
        .map(|i| i.key.clone())
}
