//! Resolution of the references carried by a mutation input.
//!
//! `fromId`/`toId` and the meta reference keys (`createdBy`, `objectMarking`,
//! ...) are all looked up in a single batched index call. Anything left
//! unresolved fails the mutation with a retryable missing-reference error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use tessera_core::types::strings_of;
use tessera_core::{Attributes, Element, SchemaRegistry};
use tessera_store::IndexStore;

use crate::error::{EngineError, Result};
use crate::identity::IdentityResolver;
use crate::tombstones::TombstoneCache;

pub const INPUT_FROM: &str = "fromId";
pub const INPUT_TO: &str = "toId";
/// Upsert flag: replace the type's upsert fields on an existing element.
pub const INPUT_UPDATE: &str = "update";

const LABEL_INPUT: &str = "objectLabel";

/// An input with every reference replaced by the element it points to.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub entity_type: String,
    /// The input minus its reference keys.
    pub data: Attributes,
    pub from: Option<Element>,
    pub to: Option<Element>,
    /// Referenced elements keyed by meta relationship type.
    pub refs: BTreeMap<String, Vec<Element>>,
}

impl ResolvedInput {
    pub fn refs_of(&self, relationship_type: &str) -> &[Element] {
        self.refs
            .get(relationship_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn created_by(&self) -> Option<&Element> {
        self.refs_of("created-by").first()
    }

    pub fn update_requested(&self) -> bool {
        self.data
            .get(INPUT_UPDATE)
            .is_some_and(|v| v.as_bool() == Some(true) || v.as_str() == Some("true"))
    }
}

struct Expected {
    input_key: String,
    relationship_type: Option<String>,
    ids: Vec<String>,
    single: bool,
}

pub struct ReferenceResolver {
    schema: Arc<SchemaRegistry>,
    identity: IdentityResolver,
    store: Arc<dyn IndexStore>,
    tombstones: Arc<dyn TombstoneCache>,
}

impl ReferenceResolver {
    pub fn new(
        schema: Arc<SchemaRegistry>,
        identity: IdentityResolver,
        store: Arc<dyn IndexStore>,
        tombstones: Arc<dyn TombstoneCache>,
    ) -> Self {
        Self {
            schema,
            identity,
            store,
            tombstones,
        }
    }

    pub async fn resolve(&self, entity_type: &str, mut input: Attributes) -> Result<ResolvedInput> {
        let mut expected = Vec::new();
        for key in [INPUT_FROM, INPUT_TO] {
            if let Some(value) = input.remove(key) {
                expected.push(Expected {
                    input_key: key.to_string(),
                    relationship_type: None,
                    ids: self.reference_ids(key, &value),
                    single: true,
                });
            }
        }
        let meta: Vec<(String, String, bool)> = self
            .schema
            .meta_relations()
            .map(|(key, def)| (key.to_string(), def.name.clone(), !def.is_multiple()))
            .collect();
        for (key, relationship_type, single) in meta {
            if let Some(value) = input.remove(&key) {
                let ids = self.reference_ids(&key, &value);
                if !ids.is_empty() {
                    expected.push(Expected {
                        input_key: key,
                        relationship_type: Some(relationship_type),
                        ids,
                        single,
                    });
                }
            }
        }

        let wanted: Vec<String> = expected.iter().flat_map(|e| e.ids.iter().cloned()).collect();
        let by_id = self.lookup(&wanted).await?;

        let mut resolved = ResolvedInput {
            entity_type: entity_type.to_string(),
            data: input,
            from: None,
            to: None,
            refs: BTreeMap::new(),
        };
        let mut unresolved = Vec::new();
        for entry in expected {
            let mut elements: Vec<Element> = Vec::new();
            for id in &entry.ids {
                match by_id.get(id) {
                    Some(found) => {
                        for element in found {
                            if !elements.iter().any(|e| e.internal_id == element.internal_id) {
                                elements.push(element.clone());
                            }
                        }
                    }
                    None => unresolved.push(id.clone()),
                }
            }
            if entry.single && elements.len() > 1 {
                return Err(EngineError::Unsupported(format!(
                    "{} resolves to {} elements",
                    entry.input_key,
                    elements.len()
                )));
            }
            match (entry.input_key.as_str(), entry.relationship_type) {
                (INPUT_FROM, _) => resolved.from = elements.pop(),
                (INPUT_TO, _) => resolved.to = elements.pop(),
                (_, Some(relationship_type)) if !elements.is_empty() => {
                    resolved.refs.insert(relationship_type, elements);
                }
                _ => {}
            }
        }

        if !unresolved.is_empty() {
            unresolved.sort();
            unresolved.dedup();
            tracing::debug!(entity_type, unresolved = ?unresolved, "Unresolved references");
            return Err(EngineError::MissingReference { unresolved });
        }
        Ok(resolved)
    }

    /// Resolve plain ids, failing on any that cannot be found.
    pub async fn resolve_ids(&self, ids: &[String]) -> Result<Vec<Element>> {
        let wanted: Vec<String> = ids.iter().map(|id| id.to_lowercase()).collect();
        let by_id = self.lookup(&wanted).await?;
        let mut elements: Vec<Element> = Vec::new();
        let mut unresolved = Vec::new();
        for id in &wanted {
            match by_id.get(id) {
                Some(found) => {
                    for element in found {
                        if !elements.iter().any(|e| e.internal_id == element.internal_id) {
                            elements.push(element.clone());
                        }
                    }
                }
                None => unresolved.push(id.clone()),
            }
        }
        if !unresolved.is_empty() {
            return Err(EngineError::MissingReference { unresolved });
        }
        Ok(elements)
    }

    /// Label references may be free text.
    pub fn reference_ids(&self, input_key: &str, value: &Value) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for raw in strings_of(value) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let id = if input_key == LABEL_INPUT {
                self.identity.label_id(raw)
            } else {
                raw.to_string()
            };
            let id = id.to_lowercase();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// One index round trip for every wanted id, skipping tombstoned elements.
    async fn lookup(&self, wanted: &[String]) -> Result<HashMap<String, Vec<Element>>> {
        let mut by_id: HashMap<String, Vec<Element>> = HashMap::new();
        if wanted.is_empty() {
            return Ok(by_id);
        }
        let wanted_set: HashSet<&str> = wanted.iter().map(String::as_str).collect();
        let found = self.store.find_by_ids(wanted, &[]).await?;
        for element in found {
            if self
                .tombstones
                .contains(&element.internal_id.to_string())
                .await
            {
                tracing::debug!(id = %element.internal_id, "Skipping recently deleted reference");
                continue;
            }
            for id in element.ids() {
                let id = id.to_lowercase();
                if wanted_set.contains(id.as_str()) {
                    by_id.entry(id).or_default().push(element.clone());
                }
            }
        }
        Ok(by_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tombstones::MemoryTombstones;
    use serde_json::json;
    use tessera_store::MemoryIndex;

    struct Fixture {
        store: Arc<MemoryIndex>,
        tombstones: Arc<MemoryTombstones>,
        resolver: ReferenceResolver,
    }

    fn fixture() -> Fixture {
        let schema = Arc::new(SchemaRegistry::builtin());
        let identity = IdentityResolver::new(Arc::clone(&schema));
        let store = Arc::new(MemoryIndex::new());
        let tombstones = Arc::new(MemoryTombstones::default());
        let resolver = ReferenceResolver::new(
            schema,
            identity,
            store.clone(),
            tombstones.clone(),
        );
        Fixture {
            store,
            tombstones,
            resolver,
        }
    }

    fn marking(name: &str) -> Element {
        let mut element = Element::new_entity(
            "Marking-Definition",
            vec!["Stix-Meta-Object".into()],
            format!("marking-definition--{}", uuid::Uuid::new_v4()),
        );
        element.attributes.insert("definition".into(), json!(name));
        element
    }

    fn input(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn resolves_markings_in_one_batch() {
        let f = fixture();
        let white = marking("TLP:WHITE");
        let green = marking("TLP:GREEN");
        f.store
            .index_elements(&[white.clone(), green.clone()])
            .await
            .unwrap();

        let resolved = f
            .resolver
            .resolve(
                "Malware",
                input(json!({
                    "name": "M",
                    "objectMarking": [white.standard_id, green.internal_id.to_string()],
                })),
            )
            .await
            .unwrap();
        assert_eq!(resolved.refs_of("object-marking").len(), 2);
        assert!(!resolved.data.contains_key("objectMarking"));
        assert_eq!(resolved.data.get("name"), Some(&json!("M")));
    }

    #[tokio::test]
    async fn unresolved_ids_are_reported() {
        let f = fixture();
        let err = f
            .resolver
            .resolve(
                "Malware",
                input(json!({"name": "M", "createdBy": "identity--4b7d1e05-6a8e-4d4c-bb43-7d4c1b1e9b11"})),
            )
            .await
            .unwrap_err();
        match err {
            EngineError::MissingReference { unresolved } => {
                assert_eq!(unresolved, vec!["identity--4b7d1e05-6a8e-4d4c-bb43-7d4c1b1e9b11".to_string()]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn tombstoned_references_are_unresolved() {
        let f = fixture();
        let white = marking("TLP:WHITE");
        f.store.index_elements(&[white.clone()]).await.unwrap();
        f.tombstones.record(&[white.internal_id.to_string()]).await;

        let err = f
            .resolver
            .resolve("Malware", input(json!({"objectMarking": [white.standard_id]})))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn single_reference_resolving_twice_is_unsupported() {
        let f = fixture();
        let shared = "identity--0e6a4f4e-3c2a-4a0e-9a77-1d8d4b6b2a10".to_string();
        let mut a = Element::new_entity("Organization", vec!["Identity".into()], "identity--a".into());
        a.stix_ids.push(shared.clone());
        let mut b = Element::new_entity("Organization", vec!["Identity".into()], "identity--b".into());
        b.stix_ids.push(shared.clone());
        f.store.index_elements(&[a, b]).await.unwrap();

        let err = f
            .resolver
            .resolve("Malware", input(json!({"createdBy": shared})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[test]
    fn labels_are_idified() {
        let f = fixture();
        let ids = f
            .resolver
            .reference_ids("objectLabel", &json!(["ransomware", "Ransomware"]));
        assert_eq!(ids.len(), 1);
        assert!(ids[0].starts_with("label--"));
    }
}
