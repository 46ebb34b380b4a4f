//! In-process index backed by an id-ordered arena.
//!
//! Used by tests and by the CLI `memory` backend. Every write is counted so
//! callers can assert that no-op mutations never reach the index.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use tessera_core::{ConnectionUpdate, DocumentPatch, Element, EndpointSide, ObjectId};

use crate::error::StoreError;
use crate::index::IndexStore;
use crate::query::{DocumentQuery, Page};

#[derive(Default)]
pub struct MemoryIndex {
    documents: RwLock<BTreeMap<ObjectId, Element>>,
    writes: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write operations applied so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Copy of every stored document.
    pub async fn snapshot(&self) -> Vec<Element> {
        self.documents.read().await.values().cloned().collect()
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexStore for MemoryIndex {
    async fn index_elements(&self, elements: &[Element]) -> Result<(), StoreError> {
        if elements.is_empty() {
            return Ok(());
        }
        let mut documents = self.documents.write().await;
        for element in elements {
            documents.insert(element.internal_id, element.clone());
        }
        self.record_write();
        tracing::trace!(count = elements.len(), "Indexed documents");
        Ok(())
    }

    async fn update_element(
        &self,
        id: ObjectId,
        patch: &DocumentPatch,
    ) -> Result<Element, StoreError> {
        let mut documents = self.documents.write().await;
        let element = documents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let mut updated = element.clone();
        updated.apply_patch(patch)?;
        *element = updated.clone();
        self.record_write();
        Ok(updated)
    }

    async fn delete_elements(&self, ids: &[ObjectId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut documents = self.documents.write().await;
        let removed = ids
            .iter()
            .filter(|id| documents.remove(id).is_some())
            .count();
        self.record_write();
        Ok(removed)
    }

    async fn find_by_ids(
        &self,
        ids: &[String],
        types: &[String],
    ) -> Result<Vec<Element>, StoreError> {
        let wanted: HashSet<String> = ids.iter().map(|id| id.to_lowercase()).collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|e| types.is_empty() || types.iter().any(|t| e.is_type(t)))
            .filter(|e| e.ids().iter().any(|id| wanted.contains(&id.to_lowercase())))
            .cloned()
            .collect())
    }

    async fn query(&self, query: &DocumentQuery) -> Result<Page, StoreError> {
        let documents = self.documents.read().await;
        Ok(Page::collect(query, documents.values().cloned()))
    }

    async fn update_connections(&self, updates: &[ConnectionUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut documents = self.documents.write().await;
        for update in updates {
            let relation = documents
                .get(&update.relation_id)
                .ok_or(StoreError::NotFound(update.relation_id))?;
            if relation.connection.is_none() {
                return Err(StoreError::NotARelation(update.relation_id));
            }
        }
        for update in updates {
            if let Some(connection) = documents
                .get_mut(&update.relation_id)
                .and_then(|r| r.connection.as_mut())
            {
                match update.side {
                    EndpointSide::From => {
                        connection.from_id = update.target_id;
                        connection.from_type = update.target_type.clone();
                    }
                    EndpointSide::To => {
                        connection.to_id = update.target_id;
                        connection.to_type = update.target_type.clone();
                    }
                }
            }
        }
        self.record_write();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::Connection;

    fn entity(name: &str) -> Element {
        let mut e = Element::new_entity(
            "Malware",
            vec!["Stix-Domain-Object".into()],
            format!("malware--{name}"),
        );
        e.attributes.insert("name".into(), json!(name));
        e
    }

    #[tokio::test]
    async fn find_by_any_identifier() {
        let index = MemoryIndex::new();
        let mut e = entity("paradise");
        e.alias_ids.push("malware--alias".into());
        e.stix_ids.push("Malware--STIX".into());
        index.index_elements(&[e.clone()]).await.unwrap();

        for id in [
            e.internal_id.to_string(),
            "malware--paradise".to_string(),
            "malware--alias".to_string(),
            "malware--stix".to_string(),
        ] {
            let found = index.find_by_ids(&[id], &[]).await.unwrap();
            assert_eq!(found.len(), 1);
        }
        let typed = index
            .find_by_ids(&["malware--paradise".into()], &["Tool".into()])
            .await
            .unwrap();
        assert!(typed.is_empty());
    }

    #[tokio::test]
    async fn partial_update_counts_writes() {
        let index = MemoryIndex::new();
        let e = entity("paradise");
        index.index_elements(&[e.clone()]).await.unwrap();
        assert_eq!(index.writes(), 1);

        let mut patch = DocumentPatch::new();
        patch.insert("description".into(), json!("ransomware"));
        let updated = index.update_element(e.internal_id, &patch).await.unwrap();
        assert_eq!(updated.attribute("description"), Some(&json!("ransomware")));
        assert_eq!(index.writes(), 2);

        let missing = index.update_element(ObjectId::new(), &patch).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn connection_updates_are_all_or_nothing() {
        let index = MemoryIndex::new();
        let a = entity("a");
        let b = entity("b");
        let c = entity("c");
        let rel = Element::new_relation(
            "related-to",
            vec![],
            "relationship--1".into(),
            Connection {
                from_id: a.internal_id,
                from_type: "Malware".into(),
                to_id: b.internal_id,
                to_type: "Malware".into(),
            },
            false,
        );
        index
            .index_elements(&[a.clone(), b.clone(), c.clone(), rel.clone()])
            .await
            .unwrap();

        let good = ConnectionUpdate {
            relation_id: rel.internal_id,
            relationship_type: "related-to".into(),
            side: EndpointSide::From,
            previous_id: a.internal_id,
            target_id: c.internal_id,
            target_type: "Malware".into(),
        };
        let bad = ConnectionUpdate {
            relation_id: a.internal_id,
            ..good.clone()
        };
        assert!(index.update_connections(&[good.clone(), bad]).await.is_err());
        let unchanged = index.load(rel.internal_id).await.unwrap().unwrap();
        assert_eq!(unchanged.from_id(), Some(a.internal_id));

        index.update_connections(&[good]).await.unwrap();
        let moved = index.load(rel.internal_id).await.unwrap().unwrap();
        assert_eq!(moved.from_id(), Some(c.internal_id));
    }

    #[tokio::test]
    async fn delete_reports_existing_count() {
        let index = MemoryIndex::new();
        let e = entity("paradise");
        index.index_elements(&[e.clone()]).await.unwrap();
        let removed = index
            .delete_elements(&[e.internal_id, ObjectId::new()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(index.is_empty().await);
    }
}
