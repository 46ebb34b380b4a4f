//! The index collaborator contract.

use async_trait::async_trait;

use tessera_core::{ConnectionUpdate, DocumentPatch, Element, ObjectId};

use crate::error::StoreError;
use crate::query::DocumentQuery;

/// Document/search index holding every element.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Bulk index (insert or overwrite) full documents.
    async fn index_elements(&self, elements: &[Element]) -> Result<(), StoreError>;

    /// Apply a partial update and return the resulting document.
    async fn update_element(&self, id: ObjectId, patch: &DocumentPatch)
        -> Result<Element, StoreError>;

    /// Delete documents, returning how many existed.
    async fn delete_elements(&self, ids: &[ObjectId]) -> Result<usize, StoreError>;

    /// Elements answering to any of the ids (internal, standard, stix, alias),
    /// optionally restricted to types.
    async fn find_by_ids(&self, ids: &[String], types: &[String])
        -> Result<Vec<Element>, StoreError>;

    /// One page of documents matching the query, ordered by internal id.
    async fn query(&self, query: &DocumentQuery) -> Result<crate::query::Page, StoreError>;

    /// Rewrite relationship endpoints.
    async fn update_connections(&self, updates: &[ConnectionUpdate]) -> Result<(), StoreError>;

    async fn load(&self, id: ObjectId) -> Result<Option<Element>, StoreError> {
        let found = self.find_by_ids(&[id.to_string()], &[]).await?;
        Ok(found.into_iter().find(|e| e.internal_id == id))
    }
}

/// Drain every page of a query.
pub async fn list_all(
    store: &dyn IndexStore,
    query: &DocumentQuery,
) -> Result<Vec<Element>, StoreError> {
    let mut results = Vec::new();
    let mut current = query.clone();
    loop {
        let page = store.query(&current).await?;
        results.extend(page.elements);
        match (page.has_next_page, page.end_cursor) {
            (true, Some(cursor)) => current.after = Some(cursor),
            _ => break,
        }
    }
    Ok(results)
}
