//! Rule aggregation.
//!
//! Inference passes contribute explanations to `i_rule_<rule>` slots. The
//! aggregated attributes (weight, confidence, time bounds, counts) are always
//! recomputed from every explanation across every slot, so a contribution
//! can be retracted independently of the others.

use std::collections::BTreeMap;

use serde_json::{json, Number, Value};

use tessera_core::schema::{is_empty_value, AggregationOp};
use tessera_core::types::{rule_key, KEY_INFERENCE_WEIGHT};
use tessera_core::{
    dates, AttributeKind, Attributes, DocumentPatch, Element, ObjectId, RuleExplanation,
    SchemaRegistry,
};

use crate::attributes::inputs_from_patch;
use crate::engine::{CreateOutcome, MutationEngine, Transaction, TxState, UpdateResult};
use crate::error::{EngineError, Result};
use crate::locks::{LockScope, ParticipantSet};

/// One explanation contributed by a rule.
#[derive(Debug, Clone)]
pub struct RuleContribution {
    pub rule: String,
    pub explanation: RuleExplanation,
}

impl RuleContribution {
    pub fn new(rule: &str, dependencies: Vec<String>, data: Attributes) -> Self {
        Self {
            rule: rule.to_string(),
            explanation: explanation(rule, dependencies, data),
        }
    }
}

/// Build an explanation, hashing the rule and its sorted dependencies.
pub fn explanation(rule: &str, dependencies: Vec<String>, data: Attributes) -> RuleExplanation {
    RuleExplanation {
        hash: explanation_hash(rule, &dependencies),
        data,
        dependencies,
    }
}

pub fn explanation_hash(rule: &str, dependencies: &[String]) -> String {
    let mut sorted: Vec<String> = dependencies.iter().map(|d| d.to_lowercase()).collect();
    sorted.sort();
    sorted.dedup();
    let canonical = json!({ "rule": rule, "dependencies": sorted });
    blake3::hash(canonical.to_string().as_bytes()).to_hex().to_string()
}

/// Incoming explanations replace existing ones with the same hash. Without
/// `override_all`, the other existing explanations are kept.
pub fn merge_explanations(
    existing: &[RuleExplanation],
    incoming: Vec<RuleExplanation>,
    override_all: bool,
) -> Vec<RuleExplanation> {
    let mut merged = incoming;
    if !override_all {
        let kept: Vec<RuleExplanation> = existing
            .iter()
            .filter(|e| !merged.iter().any(|m| m.hash == e.hash))
            .cloned()
            .collect();
        merged.extend(kept);
    }
    merged
}

/// Derived attributes of an element, computed from all its explanations.
pub fn recompute(schema: &SchemaRegistry, element: &Element) -> Result<DocumentPatch> {
    let weight: usize = element.rules.values().map(Vec::len).sum();
    let mut patch = DocumentPatch::new();
    patch.insert(KEY_INFERENCE_WEIGHT.to_string(), json!(weight));

    for behavior in schema.rule_behaviors() {
        let Some(attr) = schema.attribute(&element.entity_type, &behavior.attribute) else {
            continue;
        };
        let values: Vec<&Value> = element
            .rules
            .values()
            .flatten()
            .filter_map(|e| e.data.get(&behavior.attribute))
            .filter(|v| !is_empty_value(v))
            .collect();
        if values.is_empty() {
            continue;
        }
        let value = aggregate(&behavior.attribute, attr.kind, behavior.operation, &values)?;
        patch.insert(behavior.attribute.clone(), value);
    }
    Ok(patch)
}

fn aggregate(key: &str, kind: AttributeKind, operation: AggregationOp, values: &[&Value]) -> Result<Value> {
    let unsupported = || {
        EngineError::Unsupported(format!("Cannot apply {operation:?} on {kind:?} attribute {key}"))
    };
    match (operation, kind) {
        (AggregationOp::Avg | AggregationOp::Sum, AttributeKind::Numeric) => {
            let numbers = numbers_of(values);
            let sum: f64 = numbers.iter().sum();
            if operation == AggregationOp::Sum {
                Ok(number_value(sum))
            } else {
                Ok(number_value(sum / numbers.len().max(1) as f64))
            }
        }
        (AggregationOp::Min | AggregationOp::Max, AttributeKind::Numeric) => {
            let numbers = numbers_of(values);
            let picked = if operation == AggregationOp::Min {
                numbers.into_iter().reduce(f64::min)
            } else {
                numbers.into_iter().reduce(f64::max)
            };
            Ok(picked.map(number_value).unwrap_or(Value::Null))
        }
        (AggregationOp::Min | AggregationOp::Max, AttributeKind::Date) => {
            let parsed = values.iter().filter_map(|v| dates::parse(v));
            let picked = if operation == AggregationOp::Min {
                parsed.min()
            } else {
                parsed.max()
            };
            Ok(picked
                .map(|d| Value::String(dates::format(&d)))
                .unwrap_or(Value::Null))
        }
        (AggregationOp::Union, _) => {
            let mut union: Vec<Value> = Vec::new();
            for value in values {
                let items = match value {
                    Value::Array(items) => items.clone(),
                    other => vec![(*other).clone()],
                };
                for item in items {
                    if !union.contains(&item) {
                        union.push(item);
                    }
                }
            }
            Ok(Value::Array(union))
        }
        _ => Err(unsupported()),
    }
}

fn numbers_of(values: &[&Value]) -> Vec<f64> {
    values.iter().filter_map(|v| v.as_f64()).collect()
}

/// Integral results are stored as integers.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl MutationEngine {
    /// Create (or reinforce) a relationship derived by a rule. Relationships
    /// looping on a single element are ignored.
    pub async fn create_inferred_relation(
        &self,
        relationship_type: &str,
        input: Attributes,
        contribution: RuleContribution,
    ) -> Result<Option<CreateOutcome>> {
        let mut tx = Transaction::begin("create_inferred_relation");
        let result = self
            .create_relation_in(
                &mut tx,
                &LockScope::default(),
                relationship_type,
                input,
                Some(contribution),
            )
            .await;
        tx.finish(result)
    }

    /// Merge explanations into a rule slot of an existing element.
    pub async fn upsert_rule(
        &self,
        id: &str,
        rule: &str,
        explanations: Vec<RuleExplanation>,
        override_all: bool,
    ) -> Result<UpdateResult> {
        let mut tx = Transaction::begin("upsert_rule");
        let result: Result<UpdateResult> = async {
            let element = self
                .load_by_id(id)
                .await?
                .ok_or_else(|| EngineError::Functional(format!("Cannot find element {id}")))?;
            tx.advance(TxState::Locking);
            let participants: ParticipantSet = [element.internal_id.to_string()].into_iter().collect();
            let tx = &mut tx;
            self.locks
                .with_lock(&participants, |_| async move {
                    let element = self.reload(element.internal_id).await?;
                    self.upsert_rule_in(tx, &element, rule, explanations, override_all)
                        .await
                })
                .await
        }
        .await;
        tx.finish(result)
    }

    pub(crate) async fn upsert_rule_in(
        &self,
        tx: &mut Transaction,
        element: &Element,
        rule: &str,
        explanations: Vec<RuleExplanation>,
        override_all: bool,
    ) -> Result<UpdateResult> {
        tx.advance(TxState::Mutating);
        let key = rule_key(rule);
        let existing = element.rules.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        let merged = merge_explanations(existing, explanations, override_all);

        let mut working = element.clone();
        if merged.is_empty() {
            working.rules.remove(&key);
        } else {
            working.rules.insert(key.clone(), merged.clone());
        }
        let mut patch = recompute(&self.schema, &working)?;
        patch.insert(key, serde_json::to_value(&merged).map_err(tessera_core::CoreError::from)?);

        let attributes: Attributes = patch.into_iter().collect();
        let inputs = inputs_from_patch(&attributes, &BTreeMap::new());
        let outcome = self.attributes.compute_update(element, &inputs, false)?;
        if outcome.is_empty() {
            return Ok(UpdateResult {
                element: element.clone(),
                changes: Vec::new(),
                merged_into: None,
                event: None,
            });
        }
        tx.advance(TxState::Indexing);
        let updated = self
            .store
            .update_element(element.internal_id, outcome.document_patch())
            .await?;
        tracing::debug!(
            id = %updated.internal_id,
            rule,
            explanations = merged.len(),
            "Rule slot updated"
        );
        let event = self
            .publish_update(tx, &updated, outcome.updated_inputs.clone())
            .await?;
        Ok(UpdateResult {
            element: updated,
            changes: outcome.updated_inputs,
            merged_into: None,
            event,
        })
    }

    /// Retract the explanations of `rule` depending on `dependency_id`.
    ///
    /// Best effort: failures are logged, never returned.
    pub async fn delete_inferred_rule_element(&self, rule: &str, element_id: &str, dependency_id: &str) {
        let mut tx = Transaction::begin("delete_inferred_rule_element");
        let result = self
            .retract_rule(&mut tx, rule, element_id, dependency_id)
            .await;
        if let Err(e) = tx.finish(result) {
            tracing::error!(
                rule,
                element_id,
                dependency_id,
                error = %e,
                "Failed to retract inferred element"
            );
        }
    }

    async fn retract_rule(
        &self,
        tx: &mut Transaction,
        rule: &str,
        element_id: &str,
        dependency_id: &str,
    ) -> Result<()> {
        let Some(element) = self.load_by_id(element_id).await? else {
            tracing::debug!(element_id, "Inferred element already gone");
            return Ok(());
        };
        tx.advance(TxState::Locking);
        let participants: ParticipantSet = [element.internal_id.to_string()].into_iter().collect();
        let guard = self.locks.acquire(&LockScope::default(), &participants).await?;
        let element = self.reload(element.internal_id).await?;

        let key = rule_key(rule);
        let Some(explanations) = element.rules.get(&key) else {
            guard.release();
            return Ok(());
        };
        let remaining: Vec<RuleExplanation> = explanations
            .iter()
            .filter(|e| {
                !e.dependencies
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(dependency_id))
            })
            .cloned()
            .collect();
        if remaining.len() == explanations.len() {
            guard.release();
            return Ok(());
        }

        let purely_inferred = element.is_inferred() && element.rules.len() == 1;
        if purely_inferred && remaining.is_empty() {
            tracing::info!(id = %element.internal_id, rule, "Deleting retracted inferred element");
            self.delete_in(tx, &element).await?;
        } else {
            self.upsert_rule_in(tx, &element, rule, remaining, true).await?;
        }
        guard.release();
        Ok(())
    }

    /// Load by internal id, failing when the element disappeared.
    pub(crate) async fn reload(&self, id: ObjectId) -> Result<Element> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| EngineError::Functional(format!("Element {id} no longer exists")))
    }
}
