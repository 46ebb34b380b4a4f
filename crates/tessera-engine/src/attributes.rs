//! Attribute update engine.
//!
//! Turns a list of edit inputs into the minimal set of changes against an
//! instance: inputs that would not change anything are dropped, the
//! surviving ones are normalised to full replacement values, and the
//! derived fields they impact (date shadows, clocks, alias ids, revocation,
//! standard id) are appended.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use tessera_core::dates;
use tessera_core::schema::{is_empty_value, AttributeDefinition};
use tessera_core::types::{is_rule_key, KEY_ALIAS_IDS, KEY_STANDARD_ID, KEY_STIX_IDS, KEY_UPDATED_AT};
use tessera_core::{AttributeKind, Attributes, DocumentPatch, EditInput, EditOperation, Element, SchemaRegistry};

use crate::error::{EngineError, Result};
use crate::identity::IdentityResolver;

/// Event key reporting a standard id change.
pub const EVENT_KEY_ID: &str = "id";

#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// Changes reported in the update event, each with its previous value.
    pub updated_inputs: Vec<EditInput>,
    /// Every field written to the index, derived ones included.
    pub impacted_inputs: Vec<EditInput>,
    pub updated_instance: Element,
    patch: DocumentPatch,
}

impl UpdateOutcome {
    fn unchanged(instance: &Element) -> Self {
        Self {
            updated_inputs: Vec::new(),
            impacted_inputs: Vec::new(),
            updated_instance: instance.clone(),
            patch: DocumentPatch::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.impacted_inputs.is_empty()
    }

    /// Partial update document for the index.
    pub fn document_patch(&self) -> &DocumentPatch {
        &self.patch
    }
}

#[derive(Clone)]
pub struct AttributeEngine {
    schema: Arc<SchemaRegistry>,
    identity: IdentityResolver,
}

impl AttributeEngine {
    pub fn new(schema: Arc<SchemaRegistry>, identity: IdentityResolver) -> Self {
        Self { schema, identity }
    }

    /// Compute the effective update of `instance`. With `force`, inputs are
    /// applied even when they match the current values.
    pub fn compute_update(
        &self,
        instance: &Element,
        inputs: &[EditInput],
        force: bool,
    ) -> Result<UpdateOutcome> {
        let mut seen = HashSet::new();
        for input in inputs {
            if !seen.insert(input.key.as_str()) {
                return Err(EngineError::Unsupported(format!(
                    "Cannot update {} twice in the same request",
                    input.key
                )));
            }
        }

        let entity_type = instance.entity_type.as_str();
        let mut working = instance.clone();
        let mut changes: Vec<EditInput> = Vec::new();
        for input in inputs {
            let Some(change) = self.rebuild_input(&working, input, force)? else {
                continue;
            };
            let mut step = DocumentPatch::new();
            step.insert(change.key.clone(), self.stored_value(entity_type, &change));
            working.apply_patch(&step)?;
            // Several dictionary paths collapse onto one dictionary change.
            match changes.iter_mut().find(|c| c.key == change.key) {
                Some(existing) => existing.value = change.value,
                None => changes.push(change),
            }
        }

        if changes.is_empty() {
            tracing::debug!(id = %instance.internal_id, "Update is a no-op");
            return Ok(UpdateOutcome::unchanged(instance));
        }

        let mut cascade = Cascade::new(instance);
        for change in &changes {
            let value = self.stored_value(entity_type, change);
            cascade.patch.insert(change.key.clone(), value);
        }
        cascade.updated.extend(changes.iter().cloned());
        cascade.impacted.extend(changes.iter().cloned());
        self.derive(&working, &changes, &mut cascade);

        let mut updated_instance = instance.clone();
        updated_instance.apply_patch(&cascade.patch)?;
        Ok(UpdateOutcome {
            updated_inputs: cascade.updated,
            impacted_inputs: cascade.impacted,
            updated_instance,
            patch: cascade.patch,
        })
    }

    /// Normalise one input against the current state, or `None` for a no-op.
    fn rebuild_input(
        &self,
        instance: &Element,
        input: &EditInput,
        force: bool,
    ) -> Result<Option<EditInput>> {
        let key = input.key.as_str();
        let entity_type = instance.entity_type.as_str();

        if is_rule_key(key) {
            let current = instance.field(key).unwrap_or(Value::Array(Vec::new()));
            let next = Value::Array(input.value.clone());
            if !force && current == next {
                return Ok(None);
            }
            return Ok(Some(
                EditInput::replace(key, input.value.clone()).with_previous(items_of(&current)),
            ));
        }

        if let Some((base, path)) = key.split_once('.') {
            return self.rebuild_dictionary_path(instance, input, base, path, force);
        }

        let attr = self.schema.attribute(entity_type, key).ok_or_else(|| {
            EngineError::Functional(format!("{key} is not an attribute of {entity_type}"))
        })?;
        if attr.kind == AttributeKind::Dictionary {
            return Err(EngineError::Unsupported(format!(
                "Dictionary {key} can only be updated through {key}.<key> paths"
            )));
        }

        let values: Vec<Value> = input
            .value
            .iter()
            .cloned()
            .map(|v| attr.kind.coerce(v))
            .filter(|v| !is_empty_value(v))
            .map(|v| lowercase_if(key == KEY_STIX_IDS, v))
            .collect();

        if attr.multiple {
            let current = items_of(&instance.field(key).unwrap_or(Value::Null));
            let next = match input.operation {
                EditOperation::Add => union(&current, &values),
                EditOperation::Remove => current
                    .iter()
                    .filter(|v| !values.iter().any(|r| attr.kind.equals(v, r)))
                    .cloned()
                    .collect(),
                EditOperation::Replace => union(&[], &values),
            };
            if !force && same_set(&current, &next) {
                return Ok(None);
            }
            return Ok(Some(EditInput::replace(key, next).with_previous(current)));
        }

        if input.operation != EditOperation::Replace {
            return Err(EngineError::Unsupported(format!(
                "{key} is single-valued and only supports replace"
            )));
        }
        let next = values.into_iter().next().or_else(|| open_bound(attr));
        let current = instance.field(key).filter(|v| !is_empty_value(v));
        if !force && same_scalar(attr, current.as_ref(), next.as_ref()) {
            return Ok(None);
        }
        Ok(Some(
            EditInput::replace(key, next.into_iter().collect())
                .with_previous(current.into_iter().collect()),
        ))
    }

    fn rebuild_dictionary_path(
        &self,
        instance: &Element,
        input: &EditInput,
        base: &str,
        path: &str,
        force: bool,
    ) -> Result<Option<EditInput>> {
        let entity_type = instance.entity_type.as_str();
        if !self.schema.is_dictionary(entity_type, base) {
            return Err(EngineError::Unsupported(format!(
                "{} is not a dictionary path of {entity_type}",
                input.key
            )));
        }
        if path.contains('.') || path.is_empty() {
            return Err(EngineError::Unsupported(format!(
                "Only single level dictionary paths are supported, got {}",
                input.key
            )));
        }
        if input.operation != EditOperation::Replace {
            return Err(EngineError::Unsupported(format!(
                "Dictionary path {} only supports replace",
                input.key
            )));
        }

        let current: Map<String, Value> = instance
            .field(base)
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        let mut next = current.clone();
        match input.value.first().filter(|v| !is_empty_value(v)) {
            Some(value) => {
                next.insert(path.to_string(), value.clone());
            }
            None => {
                next.remove(path);
            }
        }
        if !force && next == current {
            return Ok(None);
        }
        let as_values = |map: Map<String, Value>| -> Vec<Value> {
            if map.is_empty() {
                Vec::new()
            } else {
                vec![Value::Object(map)]
            }
        };
        Ok(Some(
            EditInput::replace(base, as_values(next)).with_previous(as_values(current)),
        ))
    }

    /// Fields derived from the direct changes.
    fn derive(&self, working: &Element, changes: &[EditInput], cascade: &mut Cascade) {
        let entity_type = working.entity_type.as_str();
        let changed: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
        let now = dates::now_string();

        for change in changes {
            let is_stats = self
                .schema
                .attribute(entity_type, &change.key)
                .is_some_and(|a| a.stats_date);
            if is_stats {
                let value = change.value.first().cloned().unwrap_or(Value::Null);
                for (key, shadow) in dates::shadow_fields(&change.key, &value) {
                    cascade.set(key, shadow, false);
                }
            }
        }

        if !changed.contains(&KEY_UPDATED_AT) {
            cascade.set(KEY_UPDATED_AT.into(), Value::String(now.clone()), false);
        }
        if self.schema.has_domain_clock(entity_type) && !changed.contains(&"modified") {
            cascade.set("modified".into(), Value::String(now.clone()), false);
        }

        if let Some(alias_field) = self.schema.alias_field(entity_type) {
            if changed.contains(&"name") || changed.contains(&alias_field) {
                let alias_ids = self.identity.alias_ids_of(entity_type, &working.attributes);
                if alias_ids != working.alias_ids {
                    let value = Value::Array(alias_ids.into_iter().map(Value::String).collect());
                    cascade.set(KEY_ALIAS_IDS.into(), value, false);
                }
            }
        }

        if changed.contains(&"valid_until") {
            let expired = working
                .attribute("valid_until")
                .and_then(dates::parse)
                .is_some_and(|until| until < dates::now());
            let revoked = working.attribute("revoked").and_then(Value::as_bool) == Some(true);
            if expired != revoked && self.schema.attribute(entity_type, "revoked").is_some() {
                cascade.set("revoked".into(), Value::Bool(expired), true);
            }
            let detection_flag = self
                .schema
                .entity(entity_type)
                .is_some_and(|e| e.detection_flag);
            let detecting = working.attribute("x_opencti_detection").and_then(Value::as_bool);
            if detection_flag && expired && detecting != Some(false) {
                cascade.set("x_opencti_detection".into(), Value::Bool(false), true);
            }
        }

        if !working.is_relation() && self.identity.contributes(entity_type, &changed) {
            if let Some(standard_id) = self.identity.content_id(entity_type, &working.attributes) {
                if standard_id != working.standard_id {
                    tracing::debug!(
                        id = %working.internal_id,
                        previous = %working.standard_id,
                        standard_id = %standard_id,
                        "Identity changed"
                    );
                    cascade.patch.insert(KEY_STANDARD_ID.into(), Value::String(standard_id.clone()));
                    cascade.impacted.push(
                        EditInput::replace(KEY_STANDARD_ID, vec![Value::String(standard_id.clone())])
                            .with_previous(vec![Value::String(working.standard_id.clone())]),
                    );
                    cascade.updated.push(
                        EditInput::replace(EVENT_KEY_ID, vec![Value::String(standard_id)])
                            .with_previous(vec![Value::String(working.standard_id.clone())]),
                    );
                }
            }
        }
    }

    /// Value stored in the document for a normalised change.
    fn stored_value(&self, entity_type: &str, change: &EditInput) -> Value {
        if is_rule_key(&change.key) || self.schema.is_multiple(entity_type, &change.key) {
            return if change.value.is_empty() {
                Value::Null
            } else {
                Value::Array(change.value.clone())
            };
        }
        change.value.first().cloned().unwrap_or(Value::Null)
    }
}

/// Derived changes accumulated on top of the direct ones.
struct Cascade {
    original: Element,
    patch: DocumentPatch,
    updated: Vec<EditInput>,
    impacted: Vec<EditInput>,
}

impl Cascade {
    fn new(original: &Element) -> Self {
        Self {
            original: original.clone(),
            patch: DocumentPatch::new(),
            updated: Vec::new(),
            impacted: Vec::new(),
        }
    }

    fn set(&mut self, key: String, value: Value, report: bool) {
        let previous = items_of(&self.original.field(&key).unwrap_or(Value::Null));
        let input = EditInput::replace(key.clone(), items_of(&value)).with_previous(previous);
        self.patch.insert(key, value);
        if report {
            self.updated.push(input.clone());
        }
        self.impacted.push(input);
    }
}

/// Convert a flat `{key: value}` patch into edit inputs.
pub fn inputs_from_patch(
    patch: &Attributes,
    operations: &BTreeMap<String, EditOperation>,
) -> Vec<EditInput> {
    patch
        .iter()
        .map(|(key, value)| {
            let operation = operations.get(key).copied().unwrap_or_default();
            EditInput::new(key.clone(), items_of(value), operation)
        })
        .collect()
}

fn items_of(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn lowercase_if(condition: bool, value: Value) -> Value {
    match value {
        Value::String(s) if condition => Value::String(s.to_lowercase()),
        other => other,
    }
}

fn open_bound(attr: &AttributeDefinition) -> Option<Value> {
    attr.date_limit
        .map(|limit| Value::String(limit.open_value().to_string()))
}

/// Order-preserving union without duplicates.
fn union(current: &[Value], extra: &[Value]) -> Vec<Value> {
    let mut result: Vec<Value> = Vec::with_capacity(current.len() + extra.len());
    for value in current.iter().chain(extra) {
        if !result.contains(value) {
            result.push(value.clone());
        }
    }
    result
}

fn same_set(a: &[Value], b: &[Value]) -> bool {
    let canonical = |values: &[Value]| {
        let mut rendered: Vec<String> = values.iter().map(Value::to_string).collect();
        rendered.sort();
        rendered.dedup();
        rendered
    };
    canonical(a) == canonical(b)
}

fn same_scalar(attr: &AttributeDefinition, current: Option<&Value>, next: Option<&Value>) -> bool {
    if attr.kind == AttributeKind::Date && dates::is_open(current) && dates::is_open(next) {
        return true;
    }
    match (current, next) {
        (None, None) => true,
        (Some(a), Some(b)) => attr.kind.equals(a, b),
        _ => false,
    }
}
