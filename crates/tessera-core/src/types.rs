//! Core element model for the Tessera knowledge graph.
//!
//! Every object, entity or relationship, is an [`Element`] stored in one
//! id-indexed arena. Relationships reference their endpoints by
//! [`ObjectId`], so a relationship may point at another relationship and
//! cyclic shapes need no special handling.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dates;
use crate::error::CoreError;

/// Attribute bag of an element. Keys are kept sorted so serialization is canonical.
pub type Attributes = serde_json::Map<String, Value>;

/// Partial update document. A `Null` value removes the field.
pub type DocumentPatch = BTreeMap<String, Value>;

pub const KEY_INTERNAL_ID: &str = "internal_id";
pub const KEY_STANDARD_ID: &str = "standard_id";
pub const KEY_ENTITY_TYPE: &str = "entity_type";
pub const KEY_ALIAS_IDS: &str = "alias_ids";
pub const KEY_STIX_IDS: &str = "x_opencti_stix_ids";
pub const KEY_CREATED_AT: &str = "created_at";
pub const KEY_UPDATED_AT: &str = "updated_at";
pub const KEY_INFERENCE_WEIGHT: &str = "i_inference_weight";

/// Prefix of every inference rule slot (`i_rule_<rule name>`).
pub const RULE_PREFIX: &str = "i_rule_";

pub fn rule_key(rule: &str) -> String {
    format!("{RULE_PREFIX}{rule}")
}

pub fn is_rule_key(key: &str) -> bool {
    key.starts_with(RULE_PREFIX)
}

// ── Identifiers ──────────────────────────────────────────────────

/// Process-wide unique, immutable identifier of an element.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an internal id, returning `None` for anything that is not a UUID.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Classification ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BaseType {
    Entity,
    Relation,
}

/// Index family an element document lives in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IndexFamily {
    Entities,
    Relationships,
    InferredEntities,
    InferredRelationships,
}

impl IndexFamily {
    pub fn for_base(base: BaseType, inferred: bool) -> Self {
        match (base, inferred) {
            (BaseType::Entity, false) => Self::Entities,
            (BaseType::Entity, true) => Self::InferredEntities,
            (BaseType::Relation, false) => Self::Relationships,
            (BaseType::Relation, true) => Self::InferredRelationships,
        }
    }

    pub fn is_inferred(&self) -> bool {
        matches!(self, Self::InferredEntities | Self::InferredRelationships)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entities => "entities",
            Self::Relationships => "relationships",
            Self::InferredEntities => "inferred_entities",
            Self::InferredRelationships => "inferred_relationships",
        }
    }
}

// ── Relationships ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSide {
    From,
    To,
}

impl EndpointSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::From => Self::To,
            Self::To => Self::From,
        }
    }
}

/// Endpoints of a relationship, with their cached concrete types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub from_id: ObjectId,
    pub from_type: String,
    pub to_id: ObjectId,
    pub to_type: String,
}

impl Connection {
    pub fn endpoint(&self, side: EndpointSide) -> (ObjectId, &str) {
        match side {
            EndpointSide::From => (self.from_id, &self.from_type),
            EndpointSide::To => (self.to_id, &self.to_type),
        }
    }

    /// Which side the given element occupies, if any. `From` wins for self-references.
    pub fn side_of(&self, id: ObjectId) -> Option<EndpointSide> {
        if self.from_id == id {
            Some(EndpointSide::From)
        } else if self.to_id == id {
            Some(EndpointSide::To)
        } else {
            None
        }
    }

    pub fn touches(&self, id: ObjectId) -> bool {
        self.from_id == id || self.to_id == id
    }
}

/// Redirection of one relationship endpoint to another element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub relation_id: ObjectId,
    pub relationship_type: String,
    pub side: EndpointSide,
    pub previous_id: ObjectId,
    pub target_id: ObjectId,
    pub target_type: String,
}

// ── Inference ────────────────────────────────────────────────────

/// One contribution of an inference run to a rule slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleExplanation {
    pub hash: String,
    #[serde(default)]
    pub data: Attributes,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

// ── Edition ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EditOperation {
    #[default]
    Replace,
    Add,
    Remove,
}

/// A single requested attribute change, optionally carrying the value it replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditInput {
    pub key: String,
    pub value: Vec<Value>,
    #[serde(default)]
    pub operation: EditOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Vec<Value>>,
}

impl EditInput {
    pub fn new(key: impl Into<String>, value: Vec<Value>, operation: EditOperation) -> Self {
        Self {
            key: key.into(),
            value,
            operation,
            previous: None,
        }
    }

    pub fn replace(key: impl Into<String>, value: Vec<Value>) -> Self {
        Self::new(key, value, EditOperation::Replace)
    }

    pub fn add(key: impl Into<String>, value: Vec<Value>) -> Self {
        Self::new(key, value, EditOperation::Add)
    }

    pub fn remove(key: impl Into<String>, value: Vec<Value>) -> Self {
        Self::new(key, value, EditOperation::Remove)
    }

    pub fn with_previous(mut self, previous: Vec<Value>) -> Self {
        self.previous = Some(previous);
        self
    }
}

// ── Element ──────────────────────────────────────────────────────

/// An entity or relationship document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Element {
    pub internal_id: ObjectId,
    pub standard_id: String,
    pub entity_type: String,
    #[serde(default)]
    pub parent_types: Vec<String>,
    pub base_type: BaseType,
    pub family: IndexFamily,
    #[serde(default)]
    pub alias_ids: Vec<String>,
    #[serde(default, rename = "x_opencti_stix_ids")]
    pub stix_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rules: BTreeMap<String, Vec<RuleExplanation>>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Element {
    pub fn new_entity(entity_type: &str, parent_types: Vec<String>, standard_id: String) -> Self {
        let now = dates::now();
        Self {
            internal_id: ObjectId::new(),
            standard_id,
            entity_type: entity_type.to_string(),
            parent_types,
            base_type: BaseType::Entity,
            family: IndexFamily::Entities,
            alias_ids: Vec::new(),
            stix_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            connection: None,
            rules: BTreeMap::new(),
            attributes: Attributes::new(),
        }
    }

    pub fn new_relation(
        relationship_type: &str,
        parent_types: Vec<String>,
        standard_id: String,
        connection: Connection,
        inferred: bool,
    ) -> Self {
        let mut element = Self::new_entity(relationship_type, parent_types, standard_id);
        element.base_type = BaseType::Relation;
        element.family = IndexFamily::for_base(BaseType::Relation, inferred);
        element.connection = Some(connection);
        element
    }

    pub fn is_relation(&self) -> bool {
        self.base_type == BaseType::Relation
    }

    pub fn is_inferred(&self) -> bool {
        self.family.is_inferred()
    }

    /// Whether the element is of the given type, directly or through a parent type.
    pub fn is_type(&self, type_name: &str) -> bool {
        self.entity_type.eq_ignore_ascii_case(type_name)
            || self
                .parent_types
                .iter()
                .any(|p| p.eq_ignore_ascii_case(type_name))
    }

    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name").and_then(Value::as_str)
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn from_id(&self) -> Option<ObjectId> {
        self.connection.as_ref().map(|c| c.from_id)
    }

    pub fn to_id(&self) -> Option<ObjectId> {
        self.connection.as_ref().map(|c| c.to_id)
    }

    /// Every identifier this element answers to.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(2 + self.stix_ids.len() + self.alias_ids.len());
        ids.push(self.internal_id.to_string());
        ids.push(self.standard_id.clone());
        ids.extend(self.stix_ids.iter().cloned());
        ids.extend(self.alias_ids.iter().cloned());
        ids
    }

    /// Read any field by its document key, including the structural ones.
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            KEY_INTERNAL_ID => Some(Value::String(self.internal_id.to_string())),
            KEY_STANDARD_ID => Some(Value::String(self.standard_id.clone())),
            KEY_ENTITY_TYPE => Some(Value::String(self.entity_type.clone())),
            KEY_ALIAS_IDS => Some(string_array(&self.alias_ids)),
            KEY_STIX_IDS => Some(string_array(&self.stix_ids)),
            KEY_CREATED_AT => Some(Value::String(dates::format(&self.created_at))),
            KEY_UPDATED_AT => Some(Value::String(dates::format(&self.updated_at))),
            "from_id" => self.from_id().map(|id| Value::String(id.to_string())),
            "to_id" => self.to_id().map(|id| Value::String(id.to_string())),
            "from_type" => self
                .connection
                .as_ref()
                .map(|c| Value::String(c.from_type.clone())),
            "to_type" => self
                .connection
                .as_ref()
                .map(|c| Value::String(c.to_type.clone())),
            k if is_rule_key(k) => self
                .rules
                .get(k)
                .and_then(|entries| serde_json::to_value(entries).ok()),
            k => self.attributes.get(k).cloned(),
        }
    }

    /// Apply a partial update document in place.
    pub fn apply_patch(&mut self, patch: &DocumentPatch) -> Result<(), CoreError> {
        for (key, value) in patch {
            match key.as_str() {
                KEY_INTERNAL_ID | KEY_ENTITY_TYPE => continue,
                KEY_STANDARD_ID => {
                    if let Some(s) = value.as_str() {
                        self.standard_id = s.to_string();
                    }
                }
                KEY_ALIAS_IDS => self.alias_ids = strings_of(value),
                KEY_STIX_IDS => self.stix_ids = strings_of(value),
                KEY_CREATED_AT => self.created_at = date_of(key, value)?,
                KEY_UPDATED_AT => self.updated_at = date_of(key, value)?,
                k if is_rule_key(k) => {
                    let entries: Vec<RuleExplanation> = match value {
                        Value::Null => Vec::new(),
                        v => serde_json::from_value(v.clone())?,
                    };
                    if entries.is_empty() {
                        self.rules.remove(k);
                    } else {
                        self.rules.insert(k.to_string(), entries);
                    }
                }
                k => {
                    if value.is_null() {
                        self.attributes.remove(k);
                    } else {
                        self.attributes.insert(k.to_string(), value.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

fn string_array(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

/// Collect the string members of a scalar or array value.
pub fn strings_of(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn date_of(key: &str, value: &Value) -> Result<DateTime<Utc>, CoreError> {
    dates::parse(value).ok_or_else(|| CoreError::InvalidDate {
        key: key.to_string(),
        value: value.to_string(),
    })
}
