//! Element deletion with cascading dependents.

use std::collections::{HashSet, VecDeque};

use tessera_core::{Element, EndpointSide, EventPayload, ObjectId};

use crate::engine::{display_name, DeleteOutcome, MutationEngine, Transaction, TxState};
use crate::error::{EngineError, Result};
use crate::locks::ParticipantSet;

impl MutationEngine {
    /// Delete an element and every relationship depending on it.
    pub async fn delete_element(&self, id: &str) -> Result<DeleteOutcome> {
        let mut tx = Transaction::begin("delete_element");
        let result: Result<DeleteOutcome> = async {
            let element = self
                .load_by_id(id)
                .await?
                .ok_or_else(|| EngineError::Functional(format!("Cannot delete {id}: element not found")))?;
            tx.advance(TxState::Locking);
            let participants: ParticipantSet = [
                element.internal_id.to_string(),
                element.standard_id.clone(),
            ]
            .into_iter()
            .collect();
            let tx = &mut tx;
            self.locks
                .with_lock(&participants, |_| async move {
                    let element = self.reload(element.internal_id).await?;
                    self.delete_in(tx, &element).await
                })
                .await
        }
        .await;
        tx.finish(result)
    }

    /// Delete every relationship of `relationship_type` going from `from` to `to`.
    pub async fn delete_relations_by_from_and_to(
        &self,
        from: &str,
        to: &str,
        relationship_type: &str,
    ) -> Result<usize> {
        let mut tx = Transaction::begin("delete_relations_by_from_and_to");
        let result: Result<usize> = async {
            let (from_element, to_element) = tokio::try_join!(self.load_by_id(from), self.load_by_id(to))?;
            let (Some(from_element), Some(to_element)) = (from_element, to_element) else {
                return Err(EngineError::Functional(format!(
                    "Cannot find both endpoints {from} and {to}"
                )));
            };
            tx.advance(TxState::Locking);
            let participants: ParticipantSet = [
                from_element.internal_id.to_string(),
                to_element.internal_id.to_string(),
            ]
            .into_iter()
            .collect();
            let tx = &mut tx;
            self.locks
                .with_lock(&participants, |_| async move {
                    tx.advance(TxState::Mutating);
                    let relations: Vec<Element> = self
                        .relations_of(from_element.internal_id, Some(EndpointSide::From), &[relationship_type])
                        .await?
                        .into_iter()
                        .filter(|r| r.to_id() == Some(to_element.internal_id))
                        .collect();
                    for relation in &relations {
                        self.delete_in(tx, relation).await?;
                    }
                    tracing::info!(
                        from = %from_element.internal_id,
                        to = %to_element.internal_id,
                        relationship_type,
                        deleted = relations.len(),
                        "Relationships deleted by endpoints"
                    );
                    Ok(relations.len())
                })
                .await
        }
        .await;
        tx.finish(result)
    }

    /// Delete an element already locked by the caller.
    pub(crate) async fn delete_in(&self, tx: &mut Transaction, element: &Element) -> Result<DeleteOutcome> {
        tx.advance(TxState::Mutating);
        let dependencies = self.dependencies_of(element.internal_id).await?;

        tx.advance(TxState::Indexing);
        let mut ids = Vec::with_capacity(1 + dependencies.len());
        ids.push(element.internal_id);
        ids.extend(dependencies.iter().copied());
        let deleted = self.store.delete_elements(&ids).await?;

        tx.advance(TxState::Publishing);
        let message = format!("deletes {} `{}`", element.entity_type, display_name(element));
        let event = self
            .publish(
                element,
                message,
                EventPayload::Deleted {
                    element: element.clone(),
                    dependencies: dependencies.clone(),
                },
            )
            .await?;

        let mut tombstones: Vec<String> = ids.iter().map(ObjectId::to_string).collect();
        tombstones.push(element.standard_id.clone());
        self.tombstones.record(&tombstones).await;
        tracing::info!(
            id = %element.internal_id,
            entity_type = %element.entity_type,
            dependencies = dependencies.len(),
            deleted,
            "Element deleted"
        );
        Ok(DeleteOutcome {
            element: element.clone(),
            dependencies,
            event,
        })
    }

    /// Relationships touching the element, and recursively those touching them.
    pub(crate) async fn dependencies_of(&self, id: ObjectId) -> Result<Vec<ObjectId>> {
        let mut seen: HashSet<ObjectId> = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        let mut dependencies = Vec::new();
        while let Some(current) = queue.pop_front() {
            for relation in self.relations_of(current, None, &[]).await? {
                if seen.insert(relation.internal_id) {
                    dependencies.push(relation.internal_id);
                    queue.push_back(relation.internal_id);
                }
            }
        }
        Ok(dependencies)
    }
}
