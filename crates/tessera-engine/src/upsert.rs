//! Upsert of an input onto the element it resolved to.
//!
//! Planning is pure: given the existing instance and the resolved input it
//! yields the attribute inputs and the missing meta references. The engine
//! then runs the inputs through the attribute engine, so an upsert carrying
//! nothing new writes nothing and publishes nothing.

use std::collections::HashSet;

use serde_json::Value;

use tessera_core::schema::{is_empty_value, RelationFamily};
use tessera_core::types::{strings_of, KEY_STIX_IDS};
use tessera_core::{dates, EditInput, Element, ObjectId, SchemaRegistry};

use crate::engine::{carries_reference, same_name, MutationEngine, Transaction, TxState};
use crate::error::{EngineError, Result};
use crate::identity::{IdentityResolver, INPUT_STIX_ID};
use crate::references::ResolvedInput;

/// Occurrences brought by one sighting input when it does not say.
const DEFAULT_ATTRIBUTE_COUNT: i64 = 1;

#[derive(Debug, Default)]
pub(crate) struct UpsertPlan {
    pub inputs: Vec<EditInput>,
    /// Meta references to add, as (relationship type, target).
    pub references: Vec<(String, Element)>,
}

/// Historical ids supplied with an input, lowercased, excluding the standard id.
pub(crate) fn stix_ids_of(data: &tessera_core::Attributes, standard_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let provided = [INPUT_STIX_ID, KEY_STIX_IDS]
        .iter()
        .filter_map(|key| data.get(*key))
        .flat_map(strings_of);
    for id in provided {
        let id = id.trim().to_lowercase();
        if !id.is_empty() && !id.eq_ignore_ascii_case(standard_id) && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

pub(crate) fn plan_upsert(
    schema: &SchemaRegistry,
    identity: &IdentityResolver,
    instance: &Element,
    resolved: &ResolvedInput,
    existing_refs: &HashSet<(String, ObjectId)>,
) -> UpsertPlan {
    let mut plan = UpsertPlan::default();
    let data = &resolved.data;
    let type_name = instance.entity_type.as_str();

    let stix_ids = stix_ids_of(data, &instance.standard_id);
    if !stix_ids.is_empty() {
        plan.inputs.push(EditInput::add(
            KEY_STIX_IDS,
            stix_ids.into_iter().map(Value::String).collect(),
        ));
    }

    if let Some(field) = schema.alias_field(type_name) {
        let current_name = instance.name().unwrap_or_default();
        let mut aliases: Vec<Value> = Vec::new();
        let mut push = |alias: String| {
            let alias = alias.trim().to_string();
            if !alias.is_empty()
                && !same_name(&alias, current_name)
                && !aliases.iter().any(|a| a.as_str().is_some_and(|a| same_name(a, &alias)))
            {
                aliases.push(Value::String(alias));
            }
        };
        if let Some(values) = data.get(field) {
            strings_of(values).into_iter().for_each(&mut push);
        }
        // An input known under another name keeps that name as an alias.
        if let Some(name) = data.get("name").and_then(Value::as_str) {
            push(name.to_string());
        }
        if !aliases.is_empty() {
            plan.inputs.push(EditInput::add(field, aliases));
        }
    }

    let family = schema.relation(type_name).map(|r| r.family);
    if let Some((start_key, stop_key)) = family.and_then(|f| f.time_bounds()) {
        let start = extended_bound(instance.attribute(start_key), data.get(start_key), true);
        let stop = extended_bound(instance.attribute(stop_key), data.get(stop_key), false);
        let extended = start.is_some() || stop.is_some();
        if let Some(start) = start {
            plan.inputs.push(EditInput::replace(start_key, vec![start]));
        }
        if let Some(stop) = stop {
            plan.inputs.push(EditInput::replace(stop_key, vec![stop]));
        }
        if extended && family == Some(RelationFamily::Sighting) {
            let current = instance
                .attribute("attribute_count")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let incoming = data
                .get("attribute_count")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_ATTRIBUTE_COUNT);
            plan.inputs
                .push(EditInput::replace("attribute_count", vec![(current + incoming).into()]));
        }
    }

    if resolved.update_requested() {
        let fields: Vec<String> = if instance.is_relation() {
            vec!["confidence".into(), "description".into()]
        } else {
            let alias_field = schema.alias_field(type_name);
            schema
                .upsert_fields(type_name)
                .iter()
                .filter(|f| !identity.contributes(type_name, &[f.as_str()]))
                .filter(|f| Some(f.as_str()) != alias_field)
                .cloned()
                .collect()
        };
        for field in fields {
            let Some(value) = data.get(&field).filter(|v| !is_empty_value(v)) else {
                continue;
            };
            let values = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            plan.inputs.push(EditInput::replace(field, values));
        }
    }

    for (relationship_type, targets) in &resolved.refs {
        if !carries_reference(family, relationship_type) {
            continue;
        }
        let single = schema
            .relation(relationship_type)
            .is_some_and(|r| !r.is_multiple());
        let has_any = existing_refs.iter().any(|(t, _)| t == relationship_type);
        if single && has_any {
            continue;
        }
        for target in targets {
            let key = (relationship_type.clone(), target.internal_id);
            if !existing_refs.contains(&key) {
                plan.references.push((relationship_type.clone(), target.clone()));
            }
        }
    }
    plan
}

/// The bound to write when the input widens the current window.
///
/// Open input bounds never narrow or widen anything. An open current bound
/// takes the incoming date.
pub(crate) fn extended_bound(
    current: Option<&Value>,
    incoming: Option<&Value>,
    is_start: bool,
) -> Option<Value> {
    if dates::is_open(incoming) {
        return None;
    }
    let incoming = incoming.and_then(dates::parse)?;
    let current = match current.filter(|v| !dates::is_sentinel(v)).and_then(dates::parse) {
        Some(current) => current,
        None => return Some(Value::String(dates::format(&incoming))),
    };
    let widens = if is_start {
        incoming < current
    } else {
        incoming > current
    };
    widens.then(|| Value::String(dates::format(&incoming)))
}

impl MutationEngine {
    /// Apply an input onto an existing element. Returns the element and the
    /// changes to report.
    pub(crate) async fn upsert_element(
        &self,
        tx: &mut Transaction,
        instance: &Element,
        resolved: &ResolvedInput,
    ) -> Result<(Element, Vec<EditInput>)> {
        let meta_types: Vec<&str> = resolved.refs.keys().map(String::as_str).collect();
        let existing_refs: HashSet<(String, ObjectId)> = if meta_types.is_empty() {
            HashSet::new()
        } else {
            self.relations_of(
                instance.internal_id,
                Some(tessera_core::EndpointSide::From),
                &meta_types,
            )
            .await?
            .into_iter()
            .filter_map(|r| r.to_id().map(|to| (r.entity_type.clone(), to)))
            .collect()
        };

        let plan = plan_upsert(&self.schema, &self.identity, instance, resolved, &existing_refs);
        tx.advance(TxState::Mutating);
        let outcome = self
            .attributes
            .compute_update(instance, &plan.inputs, false)?;

        let mut element = instance.clone();
        let mut changes = Vec::new();
        if !outcome.is_empty() {
            tx.advance(TxState::Indexing);
            element = self
                .store
                .update_element(instance.internal_id, outcome.document_patch())
                .await?;
            changes = outcome.updated_inputs;
        }

        if !plan.references.is_empty() {
            let mut relations = Vec::with_capacity(plan.references.len());
            let mut reported: Vec<(String, Vec<Value>)> = Vec::new();
            for (relationship_type, target) in &plan.references {
                if !self.schema.relation_allowed(relationship_type, &element, target) {
                    return Err(EngineError::Functional(format!(
                        "{relationship_type} cannot link {} to {}",
                        element.entity_type, target.entity_type
                    )));
                }
                relations.push(self.build_meta_relation(relationship_type, &element, target));
                let input_key = self
                    .schema
                    .relation(relationship_type)
                    .and_then(|r| r.input_key.clone())
                    .unwrap_or_else(|| relationship_type.clone());
                let value = Value::String(target.standard_id.clone());
                match reported.iter_mut().find(|(k, _)| *k == input_key) {
                    Some((_, values)) => values.push(value),
                    None => reported.push((input_key, vec![value])),
                }
            }
            tx.advance(TxState::Indexing);
            self.store.index_elements(&relations).await?;
            tracing::debug!(
                id = %element.internal_id,
                references = relations.len(),
                "Upsert added references"
            );
            changes.extend(
                reported
                    .into_iter()
                    .map(|(key, values)| EditInput::add(key, values)),
            );
        }
        Ok((element, changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tessera_core::{Connection, ObjectId};

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::builtin())
    }

    fn resolved(entity_type: &str, data: Value) -> ResolvedInput {
        ResolvedInput {
            entity_type: entity_type.into(),
            data: data.as_object().cloned().unwrap_or_default(),
            from: None,
            to: None,
            refs: BTreeMap::new(),
        }
    }

    fn find<'a>(plan: &'a UpsertPlan, key: &str) -> Option<&'a EditInput> {
        plan.inputs.iter().find(|i| i.key == key)
    }

    fn sighting(first_seen: &str, last_seen: &str, count: i64) -> Element {
        let connection = Connection {
            from_id: ObjectId::new(),
            from_type: "Indicator".into(),
            to_id: ObjectId::new(),
            to_type: "Organization".into(),
        };
        let mut element = Element::new_relation(
            "stix-sighting-relationship",
            Vec::new(),
            "sighting--1".into(),
            connection,
            false,
        );
        element.attributes.insert("first_seen".into(), json!(first_seen));
        element.attributes.insert("last_seen".into(), json!(last_seen));
        element.attributes.insert("attribute_count".into(), json!(count));
        element
    }

    #[test]
    fn other_names_become_aliases() {
        let schema = schema();
        let identity = IdentityResolver::new(Arc::clone(&schema));
        let mut instance = Element::new_entity("Malware", Vec::new(), "malware--x".into());
        instance.attributes.insert("name".into(), json!("Emotet"));

        let plan = plan_upsert(
            &schema,
            &identity,
            &instance,
            &resolved("Malware", json!({"name": "Geodo", "aliases": ["emotet", "Heodo"]})),
            &HashSet::new(),
        );
        let aliases = find(&plan, "aliases").unwrap();
        assert_eq!(aliases.value, vec![json!("Heodo"), json!("Geodo")]);
    }

    #[test]
    fn new_stix_ids_are_added_lowercased() {
        let schema = schema();
        let identity = IdentityResolver::new(Arc::clone(&schema));
        let instance = Element::new_entity("Malware", Vec::new(), "malware--x".into());
        let plan = plan_upsert(
            &schema,
            &identity,
            &instance,
            &resolved("Malware", json!({"stix_id": "Malware--ABC", "x_opencti_stix_ids": ["malware--x"]})),
            &HashSet::new(),
        );
        let input = find(&plan, KEY_STIX_IDS).unwrap();
        assert_eq!(input.value, vec![json!("malware--abc")]);
    }

    #[test]
    fn sighting_window_extension_sums_counts() {
        let schema = schema();
        let identity = IdentityResolver::new(Arc::clone(&schema));
        let instance = sighting("2021-03-01T00:00:00.000Z", "2021-06-01T00:00:00.000Z", 1);
        let plan = plan_upsert(
            &schema,
            &identity,
            &instance,
            &resolved(
                "stix-sighting-relationship",
                json!({"first_seen": "2021-02-01T00:00:00.000Z", "last_seen": "2021-04-01T00:00:00.000Z"}),
            ),
            &HashSet::new(),
        );
        assert_eq!(
            find(&plan, "first_seen").unwrap().value,
            vec![json!("2021-02-01T00:00:00.000Z")]
        );
        assert!(find(&plan, "last_seen").is_none());
        assert_eq!(find(&plan, "attribute_count").unwrap().value, vec![json!(2)]);
    }

    #[test]
    fn narrower_window_changes_nothing() {
        let schema = schema();
        let identity = IdentityResolver::new(Arc::clone(&schema));
        let instance = sighting("2021-01-01T00:00:00.000Z", "2021-12-01T00:00:00.000Z", 3);
        let plan = plan_upsert(
            &schema,
            &identity,
            &instance,
            &resolved(
                "stix-sighting-relationship",
                json!({"first_seen": "2021-02-01T00:00:00.000Z", "last_seen": dates::UNTIL_END}),
            ),
            &HashSet::new(),
        );
        assert!(plan.inputs.is_empty());
    }

    #[test]
    fn update_flag_replaces_non_identity_fields() {
        let schema = schema();
        let identity = IdentityResolver::new(Arc::clone(&schema));
        let mut instance = Element::new_entity("Malware", Vec::new(), "malware--x".into());
        instance.attributes.insert("name".into(), json!("Emotet"));
        let plan = plan_upsert(
            &schema,
            &identity,
            &instance,
            &resolved(
                "Malware",
                json!({"name": "Emotet", "description": "loader", "is_family": true, "update": true}),
            ),
            &HashSet::new(),
        );
        assert_eq!(find(&plan, "description").unwrap().value, vec![json!("loader")]);
        assert_eq!(find(&plan, "is_family").unwrap().value, vec![json!(true)]);
        assert!(find(&plan, "name").is_none());
    }

    #[test]
    fn only_missing_references_are_planned() {
        let schema = schema();
        let identity = IdentityResolver::new(Arc::clone(&schema));
        let instance = Element::new_entity("Malware", Vec::new(), "malware--x".into());
        let white = Element::new_entity("Marking-Definition", Vec::new(), "marking-definition--w".into());
        let red = Element::new_entity("Marking-Definition", Vec::new(), "marking-definition--r".into());
        let mut input = resolved("Malware", json!({}));
        input
            .refs
            .insert("object-marking".into(), vec![white.clone(), red.clone()]);
        let existing: HashSet<(String, ObjectId)> =
            [("object-marking".to_string(), white.internal_id)].into_iter().collect();

        let plan = plan_upsert(&schema, &identity, &instance, &input, &existing);
        assert_eq!(plan.references.len(), 1);
        assert_eq!(plan.references[0].1.internal_id, red.internal_id);
    }

    #[test]
    fn open_bounds() {
        assert_eq!(
            extended_bound(
                Some(&json!(dates::FROM_START)),
                Some(&json!("2020-01-01T00:00:00.000Z")),
                true
            ),
            Some(json!("2020-01-01T00:00:00.000Z"))
        );
        assert!(extended_bound(
            Some(&json!("2020-01-01T00:00:00.000Z")),
            Some(&json!(dates::FROM_START)),
            true
        )
        .is_none());
        assert_eq!(
            extended_bound(
                Some(&json!("2020-01-01T00:00:00.000Z")),
                Some(&json!("2021-01-01T00:00:00.000Z")),
                false
            ),
            Some(json!("2021-01-01T00:00:00.000Z"))
        );
    }
}
