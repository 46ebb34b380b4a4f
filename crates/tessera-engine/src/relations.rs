//! Relationship creation and deduplication.

use serde_json::Value;

use tessera_core::schema::{Cardinality, RelationFamily};
use tessera_core::types::rule_key;
use tessera_core::{
    dates, Attributes, Connection, Element, EndpointSide, EventPayload, IndexFamily,
};
use tessera_store::{DocumentQuery, FilterOperator};

use crate::engine::{display_name, CreateOutcome, MutationEngine, Transaction, TxState};
use crate::error::{EngineError, Result};
use crate::locks::{LockScope, ParticipantSet};
use crate::references::{ResolvedInput, INPUT_FROM, INPUT_TO};
use crate::rules::{self, RuleContribution};
use crate::upsert::stix_ids_of;

/// Months a manual relationship's bounds are widened by when looking for duplicates.
const DEDUP_WINDOW_MONTHS: i32 = 1;

/// Confidence implied by the reliability of the creator.
pub fn confidence_from_reliability(creator: Option<&Element>) -> i64 {
    let reliability = creator
        .and_then(|c| c.attribute("x_opencti_reliability"))
        .and_then(Value::as_str)
        .map(|r| r.trim().to_uppercase());
    match reliability.as_deref() {
        Some("A") => 85,
        Some("B") => 75,
        Some("C") => 50,
        _ => 15,
    }
}

/// Reject inverted validity windows.
pub fn validate_bounds(relationship_type: &str, family: RelationFamily, data: &Attributes) -> Result<()> {
    let Some((start_key, stop_key)) = family.time_bounds() else {
        return Ok(());
    };
    let start = data.get(start_key).and_then(dates::parse);
    let stop = data.get(stop_key).and_then(dates::parse);
    if let (Some(start), Some(stop)) = (start, stop) {
        if start > stop {
            return Err(EngineError::Database(format!(
                "{relationship_type}: {stop_key} {} is before {start_key} {}",
                dates::format(&stop),
                dates::format(&start)
            )));
        }
    }
    Ok(())
}

fn self_loop(relationship_type: &str) -> EngineError {
    EngineError::Functional(format!(
        "{relationship_type} cannot link an element to itself"
    ))
}

impl MutationEngine {
    pub async fn create_relation(&self, relationship_type: &str, input: Attributes) -> Result<CreateOutcome> {
        let mut tx = Transaction::begin("create_relation");
        let result = self
            .create_relation_in(&mut tx, &LockScope::default(), relationship_type, input, None)
            .await
            .and_then(|created| created.ok_or_else(|| self_loop(relationship_type)));
        tx.finish(result)
    }

    /// Create relationships in order, each under its own participant lock.
    /// Stops at the first failure.
    pub async fn create_relations(&self, inputs: Vec<(String, Attributes)>) -> Result<Vec<CreateOutcome>> {
        let mut outcomes = Vec::with_capacity(inputs.len());
        for (relationship_type, input) in inputs {
            outcomes.push(self.create_relation(&relationship_type, input).await?);
        }
        Ok(outcomes)
    }

    /// Returns `None` when an inferred relationship would loop on one element.
    pub(crate) async fn create_relation_in(
        &self,
        tx: &mut Transaction,
        scope: &LockScope,
        relationship_type: &str,
        input: Attributes,
        rule: Option<RuleContribution>,
    ) -> Result<Option<CreateOutcome>> {
        let definition = self.schema.relation(relationship_type).ok_or_else(|| {
            EngineError::Functional(format!("Unknown relationship type {relationship_type}"))
        })?;
        let family = definition.family;
        let single = definition.cardinality == Cardinality::Single;

        let raw_from = input.get(INPUT_FROM).and_then(Value::as_str).map(str::trim);
        let raw_to = input.get(INPUT_TO).and_then(Value::as_str).map(str::trim);
        let (Some(raw_from), Some(raw_to)) = (raw_from, raw_to) else {
            return Err(EngineError::Functional(format!(
                "{relationship_type} requires both {INPUT_FROM} and {INPUT_TO}"
            )));
        };
        if raw_from.eq_ignore_ascii_case(raw_to) {
            if rule.is_some() {
                tracing::debug!(relationship_type, id = raw_from, "Ignoring inferred self-loop");
                return Ok(None);
            }
            return Err(self_loop(relationship_type));
        }
        validate_bounds(relationship_type, family, &input)?;

        let resolved = self.references.resolve(relationship_type, input).await?;
        let (Some(from), Some(to)) = (resolved.from.clone(), resolved.to.clone()) else {
            return Err(EngineError::Functional(format!(
                "{relationship_type} endpoints could not be resolved"
            )));
        };
        if from.internal_id == to.internal_id {
            if rule.is_some() {
                tracing::debug!(relationship_type, id = %from.internal_id, "Ignoring inferred self-loop");
                return Ok(None);
            }
            return Err(self_loop(relationship_type));
        }
        if !self.schema.relation_allowed(relationship_type, &from, &to) {
            return Err(EngineError::Functional(format!(
                "{relationship_type} is not allowed from {} to {}",
                from.entity_type, to.entity_type
            )));
        }
        if family == RelationFamily::Meta && self.references_back(&to, &from).await? {
            return Err(EngineError::Functional(format!(
                "{relationship_type} would create a reference cycle between {} and {}",
                from.internal_id, to.internal_id
            )));
        }
        let built = self.build_relation(&resolved, &from, &to, rule.as_ref())?;

        tx.advance(TxState::Locking);
        let participants: ParticipantSet = [from.internal_id.to_string(), to.internal_id.to_string()]
            .into_iter()
            .collect();
        let guard = self.locks.acquire(scope, &participants).await?;

        tx.advance(TxState::Mutating);
        if single {
            let current = self
                .relations_of(from.internal_id, Some(EndpointSide::From), &[relationship_type])
                .await?;
            if !current.is_empty() {
                return Err(EngineError::Unsupported(format!(
                    "{} already has a {relationship_type} relationship",
                    from.internal_id
                )));
            }
        }

        let existing = self
            .find_existing_relation(&resolved, &from, &to, rule.is_some())
            .await?;
        let existing = match existing {
            Some(found) => Some(self.lock_found(guard.scope(), &found).await?),
            None => None,
        };
        let outcome = match (existing, rule) {
            (Some((held, existing)), Some(rule)) => {
                let updated = self
                    .upsert_rule_in(tx, &existing, &rule.rule, vec![rule.explanation], false)
                    .await;
                held.release();
                let updated = updated?;
                CreateOutcome {
                    element: updated.element,
                    upserted: true,
                    event: updated.event,
                }
            }
            (Some((held, existing)), None) => {
                let outcome = self.upsert_existing(tx, &existing, &resolved).await;
                held.release();
                outcome?
            }
            (None, _) => self.insert_relation(tx, built, &resolved).await?,
        };
        guard.release();
        Ok(Some(outcome))
    }

    async fn insert_relation(
        &self,
        tx: &mut Transaction,
        relation: Element,
        resolved: &ResolvedInput,
    ) -> Result<CreateOutcome> {
        let meta = self.meta_relations_for(&relation, resolved)?;
        tx.advance(TxState::Indexing);
        let mut documents = Vec::with_capacity(1 + meta.len());
        documents.push(relation.clone());
        documents.extend(meta);
        self.store.index_elements(&documents).await?;

        tx.advance(TxState::Publishing);
        let message = format!("creates a {} relationship `{}`", relation.entity_type, display_name(&relation));
        let event = self
            .publish(
                &relation,
                message,
                EventPayload::Created {
                    element: relation.clone(),
                },
            )
            .await?;
        tracing::info!(
            id = %relation.internal_id,
            relationship_type = %relation.entity_type,
            inferred = relation.is_inferred(),
            "Relationship created"
        );
        Ok(CreateOutcome {
            element: relation,
            upserted: false,
            event: Some(event),
        })
    }

    /// Whether `holder` already carries a meta reference to `target`.
    async fn references_back(&self, holder: &Element, target: &Element) -> Result<bool> {
        let meta = self
            .relations_of(
                holder.internal_id,
                Some(EndpointSide::From),
                &["stix-meta-relationship"],
            )
            .await?;
        Ok(meta.iter().any(|r| r.to_id() == Some(target.internal_id)))
    }

    /// Equivalent relationship already stored between the endpoints.
    ///
    /// Manual relationships match when each bound given in the input is
    /// within a month of the stored one; inferred ones match on endpoints only.
    async fn find_existing_relation(
        &self,
        resolved: &ResolvedInput,
        from: &Element,
        to: &Element,
        inferred: bool,
    ) -> Result<Option<Element>> {
        let relationship_type = resolved.entity_type.as_str();
        let family = if inferred {
            IndexFamily::InferredRelationships
        } else {
            IndexFamily::Relationships
        };
        let mut query = DocumentQuery::new()
            .families(&[family])
            .types(&[relationship_type])
            .connection(Some(EndpointSide::From), &[from.internal_id], &[])
            .connection(Some(EndpointSide::To), &[to.internal_id], &[])
            .first(1);
        let bounds = self
            .schema
            .relation(relationship_type)
            .and_then(|r| r.family.time_bounds());
        if let (false, Some((start_key, stop_key))) = (inferred, bounds) {
            for key in [start_key, stop_key] {
                let value = resolved.data.get(key);
                if dates::is_open(value) {
                    continue;
                }
                if let Some(date) = value.and_then(dates::parse) {
                    let low = dates::shift_months(date, -DEDUP_WINDOW_MONTHS);
                    let high = dates::shift_months(date, DEDUP_WINDOW_MONTHS);
                    query = query
                        .filter(key, vec![Value::String(dates::format(&low))], FilterOperator::Gte)
                        .filter(key, vec![Value::String(dates::format(&high))], FilterOperator::Lte);
                }
            }
        }
        let page = self.store.query(&query).await?;
        Ok(page.elements.into_iter().next())
    }

    fn build_relation(
        &self,
        resolved: &ResolvedInput,
        from: &Element,
        to: &Element,
        rule: Option<&RuleContribution>,
    ) -> Result<Element> {
        let relationship_type = resolved.entity_type.as_str();
        let family = self
            .schema
            .relation(relationship_type)
            .map(|r| r.family)
            .unwrap_or(RelationFamily::Core);
        let connection = Connection {
            from_id: from.internal_id,
            from_type: from.entity_type.clone(),
            to_id: to.internal_id,
            to_type: to.entity_type.clone(),
        };
        let mut relation = Element::new_relation(
            relationship_type,
            self.schema.parent_types(relationship_type),
            self.identity.standard_id(relationship_type, &resolved.data),
            connection,
            rule.is_some(),
        );

        let mut attributes = self.prepare_attributes(relationship_type, &resolved.data);
        attributes
            .entry("spec_version".to_string())
            .or_insert_with(|| Value::String("2.1".into()));
        if family != RelationFamily::Meta {
            let now = dates::now_string();
            let confidence = confidence_from_reliability(resolved.created_by());
            attributes.entry("confidence".to_string()).or_insert(confidence.into());
            attributes.entry("revoked".to_string()).or_insert(Value::Bool(false));
            attributes.entry("lang".to_string()).or_insert_with(|| "en".into());
            attributes
                .entry("description".to_string())
                .or_insert_with(|| Value::String(String::new()));
            attributes
                .entry("created".to_string())
                .or_insert_with(|| Value::String(now.clone()));
            attributes
                .entry("modified".to_string())
                .or_insert_with(|| Value::String(now));
        }
        if let Some((start_key, stop_key)) = family.time_bounds() {
            attributes
                .entry(start_key.to_string())
                .or_insert_with(|| Value::String(dates::FROM_START.into()));
            attributes
                .entry(stop_key.to_string())
                .or_insert_with(|| Value::String(dates::UNTIL_END.into()));
        }
        if family == RelationFamily::Sighting {
            attributes.entry("attribute_count".to_string()).or_insert(1.into());
            attributes
                .entry("x_opencti_negative".to_string())
                .or_insert(Value::Bool(false));
        }
        self.add_date_shadows(relationship_type, &mut attributes);

        relation.stix_ids = stix_ids_of(&resolved.data, &relation.standard_id);
        relation.attributes = attributes;

        if let Some(rule) = rule {
            relation
                .rules
                .insert(rule_key(&rule.rule), vec![rule.explanation.clone()]);
            let mut derived = rules::recompute(&self.schema, &relation)?;
            for (key, value) in derived.clone() {
                if self
                    .schema
                    .attribute(relationship_type, &key)
                    .is_some_and(|a| a.stats_date)
                {
                    derived.extend(dates::shadow_fields(&key, &value));
                }
            }
            relation.apply_patch(&derived)?;
        }
        Ok(relation)
    }
}
