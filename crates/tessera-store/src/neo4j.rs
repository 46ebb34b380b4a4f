//! Neo4j-backed index.
//!
//! Each element is one `:Document` node keyed by `internal_id`. The node
//! carries the lookup columns (`family`, `types`, `ids`, `from_id`,
//! `from_type`, `to_id`, `to_type`) and the full element as a JSON `doc`
//! string. Families, types, connections and the cursor are matched in
//! Cypher; attribute filters are evaluated on decoded documents, so a page
//! is only limited in Cypher when the query has none.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use async_trait::async_trait;
use neo4rs::{query, Query, Row};

use tessera_core::{ConnectionUpdate, DocumentPatch, Element, EndpointSide, ObjectId};

use crate::client::GraphClient;
use crate::error::StoreError;
use crate::index::IndexStore;
use crate::query::{DocumentQuery, Page};

#[derive(Clone)]
pub struct Neo4jIndex {
    client: GraphClient,
}

impl Neo4jIndex {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    async fn write(&self, element: &Element) -> Result<(), StoreError> {
        self.client.run(upsert_query(element)?).await
    }
}

fn upsert_query(element: &Element) -> Result<Query, StoreError> {
    let doc = serde_json::to_string(element)?;
    let mut types = vec![element.entity_type.clone()];
    types.extend(element.parent_types.iter().cloned());
    let ids: Vec<String> = element.ids().iter().map(|id| id.to_lowercase()).collect();

    Ok(query(
        "MERGE (d:Document {internal_id: $internal_id})
         SET d.family = $family, d.types = $types, d.ids = $ids,
             d.from_id = $from_id, d.from_type = $from_type,
             d.to_id = $to_id, d.to_type = $to_type, d.doc = $doc",
    )
    .param("internal_id", element.internal_id.to_string())
    .param("family", element.family.as_str())
    .param("types", types)
    .param("ids", ids)
    .param(
        "from_id",
        element.from_id().map(|id| id.to_string()).unwrap_or_default(),
    )
    .param(
        "to_id",
        element.to_id().map(|id| id.to_string()).unwrap_or_default(),
    )
    .param("from_type", endpoint_type(element, EndpointSide::From))
    .param("to_type", endpoint_type(element, EndpointSide::To))
    .param("doc", doc))
}

fn endpoint_type(element: &Element, side: EndpointSide) -> String {
    element
        .connection
        .as_ref()
        .map(|c| c.endpoint(side).1.to_string())
        .unwrap_or_default()
}

/// Cypher text and list parameters for a document query.
#[derive(Debug, Default, PartialEq)]
struct QueryPlan {
    cypher: String,
    lists: Vec<(String, Vec<String>)>,
    limit: Option<i64>,
}

impl QueryPlan {
    fn new(document_query: &DocumentQuery) -> Self {
        let mut plan = Self::default();
        let mut clauses = vec!["($after = '' OR d.internal_id > $after)".to_string()];

        if !document_query.families.is_empty() {
            clauses.push("d.family IN $families".into());
            plan.lists.push((
                "families".into(),
                document_query
                    .families
                    .iter()
                    .map(|f| f.as_str().to_string())
                    .collect(),
            ));
        }
        if !document_query.types.is_empty() {
            clauses.push("any(t IN d.types WHERE t IN $types)".into());
            plan.lists.push(("types".into(), document_query.types.clone()));
        }
        for (n, connection) in document_query.connections.iter().enumerate() {
            let ids = format!("c{n}_ids");
            let types = format!("c{n}_types");
            let side = |column: &str| {
                let mut parts = vec![format!("d.{column}_id <> ''")];
                if !connection.ids.is_empty() {
                    parts.push(format!("d.{column}_id IN ${ids}"));
                }
                if !connection.types.is_empty() {
                    parts.push(format!("d.{column}_type IN ${types}"));
                }
                format!("({})", parts.join(" AND "))
            };
            clauses.push(match connection.role {
                Some(EndpointSide::From) => side("from"),
                Some(EndpointSide::To) => side("to"),
                None => format!("({} OR {})", side("from"), side("to")),
            });
            if !connection.ids.is_empty() {
                plan.lists
                    .push((ids, connection.ids.iter().map(|id| id.to_string()).collect()));
            }
            if !connection.types.is_empty() {
                plan.lists.push((types, connection.types.clone()));
            }
        }

        let mut cypher = format!(
            "MATCH (d:Document)
             WHERE {}
             RETURN d.doc AS doc
             ORDER BY d.internal_id",
            clauses.join("\n               AND ")
        );
        if document_query.filters.is_empty() {
            cypher.push_str("\n             LIMIT $limit");
            plan.limit = Some(document_query.page_size() as i64 + 1);
        }
        plan.cypher = cypher;
        plan
    }

    fn into_query(self, after: String) -> Query {
        let mut q = query(&self.cypher).param("after", after);
        for (name, values) in self.lists {
            q = q.param(&name, values);
        }
        if let Some(limit) = self.limit {
            q = q.param("limit", limit);
        }
        q
    }
}

fn decode(row: &Row) -> Result<Element, StoreError> {
    let doc: String = row
        .get("doc")
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(serde_json::from_str(&doc)?)
}

fn decode_rows(rows: Vec<Row>) -> Result<Vec<Element>, StoreError> {
    rows.iter().map(decode).collect()
}

#[async_trait]
impl IndexStore for Neo4jIndex {
    async fn index_elements(&self, elements: &[Element]) -> Result<(), StoreError> {
        if elements.is_empty() {
            return Ok(());
        }
        let mut txn = self.client.start_txn().await?;
        for element in elements {
            txn.run(upsert_query(element)?).await?;
        }
        txn.commit().await?;
        tracing::debug!(count = elements.len(), "Indexed documents in Neo4j");
        Ok(())
    }

    async fn update_element(
        &self,
        id: ObjectId,
        patch: &DocumentPatch,
    ) -> Result<Element, StoreError> {
        let mut element = self.load(id).await?.ok_or(StoreError::NotFound(id))?;
        element.apply_patch(patch)?;
        self.write(&element).await?;
        Ok(element)
    }

    async fn delete_elements(&self, ids: &[ObjectId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let q = query(
            "MATCH (d:Document) WHERE d.internal_id IN $ids
             WITH collect(d) AS docs, count(d) AS n
             FOREACH (x IN docs | DETACH DELETE x)
             RETURN n",
        )
        .param("ids", ids);
        match self.client.query_one(q).await? {
            Some(row) => Ok(row.get::<i64>("n").unwrap_or(0).max(0) as usize),
            None => Ok(0),
        }
    }

    async fn find_by_ids(
        &self,
        ids: &[String],
        types: &[String],
    ) -> Result<Vec<Element>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = ids.iter().map(|id| id.to_lowercase()).collect();
        let q = query(
            "MATCH (d:Document)
             WHERE any(i IN d.ids WHERE i IN $ids)
               AND (size($types) = 0 OR any(t IN d.types WHERE t IN $types))
             RETURN d.doc AS doc",
        )
        .param("ids", ids)
        .param("types", types.to_vec());
        decode_rows(self.client.query_rows(q).await?)
    }

    async fn load(&self, id: ObjectId) -> Result<Option<Element>, StoreError> {
        let q = query("MATCH (d:Document {internal_id: $id}) RETURN d.doc AS doc")
            .param("id", id.to_string());
        match self.client.query_one(q).await? {
            Some(row) => Ok(Some(decode(&row)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, document_query: &DocumentQuery) -> Result<Page, StoreError> {
        let after = document_query
            .after
            .map(|id| id.to_string())
            .unwrap_or_default();
        let q = QueryPlan::new(document_query).into_query(after);
        let candidates = decode_rows(self.client.query_rows(q).await?)?;
        Ok(Page::collect(document_query, candidates))
    }

    async fn update_connections(&self, updates: &[ConnectionUpdate]) -> Result<(), StoreError> {
        let mut rewritten: BTreeMap<ObjectId, Element> = BTreeMap::new();
        for update in updates {
            let relation = match rewritten.entry(update.relation_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let loaded = self
                        .load(update.relation_id)
                        .await?
                        .ok_or(StoreError::NotFound(update.relation_id))?;
                    entry.insert(loaded)
                }
            };
            let connection = relation
                .connection
                .as_mut()
                .ok_or(StoreError::NotARelation(update.relation_id))?;
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
        let rewritten: Vec<Element> = rewritten.into_values().collect();
        self.index_elements(&rewritten).await
    }
}
