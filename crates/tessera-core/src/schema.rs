//! Schema registry: attribute kinds, identity contributors, and relation rules.
//!
//! The registry is built once at startup, either from the built-in STIX
//! subset or from a definition file, and is then shared read-only by every
//! engine component.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::dates;
use crate::error::CoreError;
use crate::types::{Attributes, Element};

// ── Attribute kinds ──────────────────────────────────────────────

/// Storage kind of an attribute. Each kind owns its coercion and comparison rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Text,
    Numeric,
    Boolean,
    Date,
    Dictionary,
    Json,
}

impl AttributeKind {
    /// Convert raw input into the stored representation.
    pub fn coerce(&self, value: Value) -> Value {
        match self {
            Self::Numeric => match value {
                Value::Number(_) | Value::Null => value,
                Value::String(s) => parse_number(&s),
                _ => Value::Null,
            },
            Self::Boolean => match value {
                Value::Bool(_) | Value::Null => value,
                Value::String(s) => Value::Bool(s.trim().eq_ignore_ascii_case("true")),
                _ => Value::Bool(false),
            },
            Self::Date => match dates::normalize(&value) {
                Some(normalized) => Value::String(normalized),
                None => value,
            },
            Self::Text | Self::Dictionary | Self::Json => value,
        }
    }

    /// Compare two stored values of this kind.
    pub fn equals(&self, a: &Value, b: &Value) -> bool {
        match self {
            Self::Date => match (dates::parse(a), dates::parse(b)) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            Self::Numeric => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            _ => a == b,
        }
    }

    pub fn supports_ordering(&self) -> bool {
        matches!(self, Self::Numeric | Self::Date)
    }
}

fn parse_number(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Empty in the attribute sense: null, blank string, empty list or map.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DateLimit {
    Start,
    End,
}

impl DateLimit {
    /// Sentinel standing for an open bound on this side.
    pub fn open_value(&self) -> &'static str {
        match self {
            Self::Start => dates::FROM_START,
            Self::End => dates::UNTIL_END,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributeDefinition {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default)]
    pub multiple: bool,
    /// Maintains `i_{name}_day|month|year` shadow fields.
    #[serde(default)]
    pub stats_date: bool,
    #[serde(default)]
    pub date_limit: Option<DateLimit>,
}

impl AttributeDefinition {
    pub fn new(name: &str, kind: AttributeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            multiple: false,
            stats_date: false,
            date_limit: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, AttributeKind::Text)
    }

    pub fn multiple(name: &str) -> Self {
        Self {
            multiple: true,
            ..Self::new(name, AttributeKind::Text)
        }
    }

    pub fn numeric(name: &str) -> Self {
        Self::new(name, AttributeKind::Numeric)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, AttributeKind::Boolean)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, AttributeKind::Date)
    }

    pub fn stats_date(name: &str) -> Self {
        Self {
            stats_date: true,
            ..Self::new(name, AttributeKind::Date)
        }
    }

    pub fn dictionary(name: &str) -> Self {
        Self::new(name, AttributeKind::Dictionary)
    }

    pub fn limit(mut self, limit: DateLimit) -> Self {
        self.date_limit = Some(limit);
        self
    }
}

// ── Entity definitions ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    DomainObject,
    CyberObservable,
    MetaObject,
    InternalObject,
}

impl EntityCategory {
    fn parent_types(&self) -> &'static [&'static str] {
        match self {
            Self::DomainObject => &[
                "Basic-Object",
                "Stix-Object",
                "Stix-Core-Object",
                "Stix-Domain-Object",
            ],
            Self::CyberObservable => &[
                "Basic-Object",
                "Stix-Object",
                "Stix-Core-Object",
                "Stix-Cyber-Observable",
            ],
            Self::MetaObject => &["Basic-Object", "Stix-Object", "Stix-Meta-Object"],
            Self::InternalObject => &["Basic-Object", "Internal-Object"],
        }
    }
}

/// A key feeding the standard id. Dictionary contributors may rank their
/// sub-keys; only the first present one is used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdContributor {
    pub key: String,
    #[serde(default)]
    pub preference: Vec<String>,
}

impl IdContributor {
    pub fn key(key: &str) -> Self {
        Self {
            key: key.to_string(),
            preference: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDefinition {
    pub name: String,
    /// STIX type used as standard id prefix.
    pub stix_type: String,
    pub category: EntityCategory,
    #[serde(default)]
    pub parent_types: Vec<String>,
    /// Attribute holding the alternative names, for aliased types.
    #[serde(default)]
    pub alias_field: Option<String>,
    #[serde(default)]
    pub id_contributors: Vec<IdContributor>,
    /// Used when none of the primary contributors is present.
    #[serde(default)]
    pub id_fallback: Vec<IdContributor>,
    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,
    /// Fields replaced when an upsert carries `update: true`.
    #[serde(default)]
    pub upsert_fields: Vec<String>,
    /// Values applied at creation when the input omits them.
    #[serde(default)]
    pub defaults: Attributes,
    /// Detection is disabled once `valid_until` has passed.
    #[serde(default)]
    pub detection_flag: bool,
}

impl EntityDefinition {
    pub fn new(name: &str, stix_type: &str, category: EntityCategory) -> Self {
        Self {
            name: name.to_string(),
            stix_type: stix_type.to_string(),
            category,
            parent_types: Vec::new(),
            alias_field: None,
            id_contributors: Vec::new(),
            id_fallback: Vec::new(),
            attributes: Vec::new(),
            upsert_fields: Vec::new(),
            defaults: Attributes::new(),
            detection_flag: false,
        }
    }

    fn contributors(mut self, keys: &[&str]) -> Self {
        self.id_contributors = keys.iter().map(|k| IdContributor::key(k)).collect();
        self
    }

    fn fallback(mut self, keys: &[&str]) -> Self {
        self.id_fallback = keys.iter().map(|k| IdContributor::key(k)).collect();
        self
    }

    fn ranked(mut self, key: &str, preference: &[&str]) -> Self {
        self.id_contributors.push(IdContributor {
            key: key.to_string(),
            preference: preference.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    fn aliased(mut self, field: &str) -> Self {
        self.alias_field = Some(field.to_string());
        self.attributes.push(AttributeDefinition::multiple(field));
        self
    }

    fn parents(mut self, parents: &[&str]) -> Self {
        self.parent_types = parents.iter().map(|p| p.to_string()).collect();
        self
    }

    fn attrs(mut self, attrs: Vec<AttributeDefinition>) -> Self {
        self.attributes.extend(attrs);
        self
    }

    fn upsert(mut self, fields: &[&str]) -> Self {
        self.upsert_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    fn default_value(mut self, key: &str, value: Value) -> Self {
        self.defaults.insert(key.to_string(), value);
        self
    }

    fn detection(mut self) -> Self {
        self.detection_flag = true;
        self
    }
}

// ── Relation definitions ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationFamily {
    /// Time-bounded by `start_time`/`stop_time`.
    Core,
    /// Time-bounded by `first_seen`/`last_seen`, with an occurrence count.
    Sighting,
    /// Reference edges created from input fields (creator, markings, ...).
    Meta,
}

impl RelationFamily {
    /// Start and end attribute of the validity window.
    pub fn time_bounds(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Core => Some(("start_time", "stop_time")),
            Self::Sighting => Some(("first_seen", "last_seen")),
            Self::Meta => None,
        }
    }

    fn stix_type(&self) -> &'static str {
        match self {
            Self::Core => "relationship",
            Self::Sighting => "sighting",
            Self::Meta => "relationship-meta",
        }
    }

    fn parent_types(&self) -> &'static [&'static str] {
        match self {
            Self::Core => &[
                "basic-relationship",
                "stix-relationship",
                "stix-core-relationship",
            ],
            Self::Sighting => &["basic-relationship", "stix-relationship"],
            Self::Meta => &[
                "basic-relationship",
                "stix-relationship",
                "stix-meta-relationship",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    Single,
    #[default]
    Multiple,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypePair {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationDefinition {
    pub name: String,
    pub family: RelationFamily,
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Input key carrying the references, for meta relations.
    #[serde(default)]
    pub input_key: Option<String>,
    /// Allowed endpoint types; `*` matches anything.
    #[serde(default)]
    pub allowed: Vec<TypePair>,
    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,
}

impl RelationDefinition {
    fn new(name: &str, family: RelationFamily) -> Self {
        Self {
            name: name.to_string(),
            family,
            cardinality: Cardinality::Multiple,
            input_key: None,
            allowed: Vec::new(),
            attributes: Vec::new(),
        }
    }

    fn meta(name: &str, input_key: &str, cardinality: Cardinality) -> Self {
        Self {
            cardinality,
            input_key: Some(input_key.to_string()),
            ..Self::new(name, RelationFamily::Meta)
        }
    }

    fn between(mut self, from: &[&str], to: &[&str]) -> Self {
        for f in from {
            for t in to {
                self.allowed.push(TypePair {
                    from: f.to_string(),
                    to: t.to_string(),
                });
            }
        }
        self
    }

    pub fn is_multiple(&self) -> bool {
        self.cardinality == Cardinality::Multiple
    }
}

// ── Rule behaviours ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationOp {
    Avg,
    Sum,
    Min,
    Max,
    Union,
}

/// How a derived attribute is aggregated across rule contributions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleBehavior {
    pub attribute: String,
    pub operation: AggregationOp,
}

impl RuleBehavior {
    fn new(attribute: &str, operation: AggregationOp) -> Self {
        Self {
            attribute: attribute.to_string(),
            operation,
        }
    }
}

// ── Definition ───────────────────────────────────────────────────

/// Serializable schema description, as read from a definition file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaDefinition {
    /// Attributes every element carries.
    #[serde(default)]
    pub common_attributes: Vec<AttributeDefinition>,
    /// Attributes of STIX domain and meta objects and of core and sighting relations.
    #[serde(default)]
    pub domain_attributes: Vec<AttributeDefinition>,
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    #[serde(default)]
    pub rule_behaviors: Vec<RuleBehavior>,
}

impl SchemaDefinition {
    /// Built-in STIX subset.
    pub fn builtin() -> Self {
        use AttributeDefinition as A;
        use EntityCategory::*;

        let common_attributes = vec![
            A::text("standard_id"),
            A::multiple("alias_ids"),
            A::multiple("x_opencti_stix_ids"),
            A::date("created_at"),
            A::date("updated_at"),
            A::text("spec_version"),
            A::numeric("i_inference_weight"),
        ];
        let domain_attributes = vec![
            A::text("description"),
            A::numeric("confidence"),
            A::boolean("revoked"),
            A::text("lang"),
            A::stats_date("created"),
            A::date("modified"),
        ];

        let entities = vec![
            EntityDefinition::new("Malware", "malware", DomainObject)
                .contributors(&["name"])
                .aliased("aliases")
                .attrs(vec![
                    A::text("name"),
                    A::multiple("malware_types"),
                    A::boolean("is_family"),
                    A::stats_date("first_seen"),
                    A::stats_date("last_seen"),
                    A::multiple("architecture_execution_envs"),
                ])
                .upsert(&["name", "description", "is_family", "malware_types", "first_seen", "last_seen"]),
            EntityDefinition::new("Intrusion-Set", "intrusion-set", DomainObject)
                .contributors(&["name"])
                .aliased("aliases")
                .attrs(vec![
                    A::text("name"),
                    A::multiple("goals"),
                    A::stats_date("first_seen"),
                    A::stats_date("last_seen"),
                    A::text("resource_level"),
                    A::text("primary_motivation"),
                    A::multiple("secondary_motivations"),
                ])
                .upsert(&["name", "description", "goals", "first_seen", "last_seen", "resource_level", "primary_motivation"]),
            EntityDefinition::new("Threat-Actor", "threat-actor", DomainObject)
                .contributors(&["name"])
                .aliased("aliases")
                .attrs(vec![
                    A::text("name"),
                    A::multiple("threat_actor_types"),
                    A::multiple("goals"),
                    A::text("sophistication"),
                    A::stats_date("first_seen"),
                    A::stats_date("last_seen"),
                ])
                .upsert(&["name", "description", "goals", "sophistication", "first_seen", "last_seen"]),
            EntityDefinition::new("Campaign", "campaign", DomainObject)
                .contributors(&["name"])
                .aliased("aliases")
                .attrs(vec![
                    A::text("name"),
                    A::text("objective"),
                    A::stats_date("first_seen"),
                    A::stats_date("last_seen"),
                ])
                .upsert(&["name", "description", "objective", "first_seen", "last_seen"]),
            EntityDefinition::new("Tool", "tool", DomainObject)
                .contributors(&["name"])
                .aliased("aliases")
                .attrs(vec![
                    A::text("name"),
                    A::multiple("tool_types"),
                    A::text("tool_version"),
                ])
                .upsert(&["name", "description", "tool_types", "tool_version"]),
            EntityDefinition::new("Attack-Pattern", "attack-pattern", DomainObject)
                .contributors(&["name", "x_mitre_id"])
                .aliased("aliases")
                .attrs(vec![
                    A::text("name"),
                    A::text("x_mitre_id"),
                    A::multiple("x_mitre_platforms"),
                ])
                .upsert(&["name", "description", "x_mitre_platforms"]),
            EntityDefinition::new("Vulnerability", "vulnerability", DomainObject)
                .contributors(&["name"])
                .aliased("x_opencti_aliases")
                .attrs(vec![A::text("name"), A::numeric("x_opencti_base_score")])
                .upsert(&["name", "description", "x_opencti_base_score"]),
            EntityDefinition::new("Indicator", "indicator", DomainObject)
                .contributors(&["pattern"])
                .attrs(vec![
                    A::text("name"),
                    A::text("pattern"),
                    A::text("pattern_type"),
                    A::multiple("indicator_types"),
                    A::stats_date("valid_from").limit(DateLimit::Start),
                    A::stats_date("valid_until").limit(DateLimit::End),
                    A::boolean("x_opencti_detection"),
                    A::numeric("x_opencti_score"),
                ])
                .upsert(&["name", "description", "valid_from", "valid_until", "x_opencti_score", "x_opencti_detection"])
                .detection(),
            EntityDefinition::new("Report", "report", DomainObject)
                .contributors(&["name", "published"])
                .attrs(vec![
                    A::text("name"),
                    A::stats_date("published"),
                    A::multiple("report_types"),
                ])
                .upsert(&["name", "description", "report_types"]),
            EntityDefinition::new("Organization", "identity", DomainObject)
                .parents(&["Identity"])
                .contributors(&["name", "identity_class"])
                .aliased("x_opencti_aliases")
                .attrs(vec![
                    A::text("name"),
                    A::text("identity_class"),
                    A::text("contact_information"),
                    A::text("x_opencti_reliability"),
                ])
                .upsert(&["name", "description", "contact_information", "x_opencti_reliability"])
                .default_value("identity_class", Value::String("organization".into())),
            EntityDefinition::new("Individual", "identity", DomainObject)
                .parents(&["Identity"])
                .contributors(&["name", "identity_class"])
                .aliased("x_opencti_aliases")
                .attrs(vec![
                    A::text("name"),
                    A::text("identity_class"),
                    A::text("contact_information"),
                    A::text("x_opencti_reliability"),
                ])
                .upsert(&["name", "description", "contact_information", "x_opencti_reliability"])
                .default_value("identity_class", Value::String("individual".into())),
            EntityDefinition::new("Marking-Definition", "marking-definition", MetaObject)
                .contributors(&["definition_type", "definition"])
                .attrs(vec![
                    A::text("definition_type"),
                    A::text("definition"),
                    A::numeric("x_opencti_order"),
                    A::text("x_opencti_color"),
                ]),
            EntityDefinition::new("Label", "label", MetaObject)
                .contributors(&["value"])
                .attrs(vec![A::text("value"), A::text("color")]),
            EntityDefinition::new("Kill-Chain-Phase", "kill-chain-phase", MetaObject)
                .contributors(&["kill_chain_name", "phase_name"])
                .attrs(vec![
                    A::text("kill_chain_name"),
                    A::text("phase_name"),
                    A::numeric("x_opencti_order"),
                ]),
            EntityDefinition::new("External-Reference", "external-reference", MetaObject)
                .contributors(&["url"])
                .fallback(&["source_name", "external_id"])
                .attrs(vec![
                    A::text("source_name"),
                    A::text("external_id"),
                    A::text("url"),
                ]),
            EntityDefinition::new("File", "file", CyberObservable)
                .ranked("hashes", &["MD5", "SHA-1", "SHA-256", "SHA-512"])
                .fallback(&["name"])
                .attrs(vec![
                    A::dictionary("hashes"),
                    A::text("name"),
                    A::numeric("size"),
                    A::text("mime_type"),
                    A::text("x_opencti_description"),
                    A::numeric("x_opencti_score"),
                ])
                .upsert(&["name", "size", "mime_type", "x_opencti_description", "x_opencti_score"]),
            EntityDefinition::new("IPv4-Addr", "ipv4-addr", CyberObservable)
                .contributors(&["value"])
                .attrs(vec![
                    A::text("value"),
                    A::text("x_opencti_description"),
                    A::numeric("x_opencti_score"),
                ])
                .upsert(&["x_opencti_description", "x_opencti_score"]),
            EntityDefinition::new("Domain-Name", "domain-name", CyberObservable)
                .contributors(&["value"])
                .attrs(vec![
                    A::text("value"),
                    A::text("x_opencti_description"),
                    A::numeric("x_opencti_score"),
                ])
                .upsert(&["x_opencti_description", "x_opencti_score"]),
        ];

        let threats = ["Malware", "Intrusion-Set", "Threat-Actor", "Campaign"];
        let core_attrs = || {
            vec![
                A::stats_date("start_time").limit(DateLimit::Start),
                A::stats_date("stop_time").limit(DateLimit::End),
            ]
        };
        let mut relations = vec![
            RelationDefinition::new("uses", RelationFamily::Core)
                .between(&threats, &["Malware", "Tool", "Attack-Pattern"]),
            RelationDefinition::new("targets", RelationFamily::Core).between(
                &["Malware", "Intrusion-Set", "Threat-Actor", "Campaign", "Attack-Pattern"],
                &["Identity", "Vulnerability"],
            ),
            RelationDefinition::new("indicates", RelationFamily::Core).between(
                &["Indicator"],
                &["Malware", "Intrusion-Set", "Threat-Actor", "Campaign", "Tool", "Attack-Pattern"],
            ),
            RelationDefinition::new("attributed-to", RelationFamily::Core)
                .between(&["Intrusion-Set", "Campaign"], &["Threat-Actor", "Intrusion-Set"]),
            RelationDefinition::new("based-on", RelationFamily::Core)
                .between(&["Indicator"], &["Stix-Cyber-Observable"]),
            RelationDefinition::new("related-to", RelationFamily::Core).between(&["*"], &["*"]),
        ];
        for relation in relations.iter_mut() {
            relation.attributes = core_attrs();
        }
        let mut sighting = RelationDefinition::new("stix-sighting-relationship", RelationFamily::Sighting)
            .between(&["*"], &["Identity"]);
        sighting.attributes = vec![
            A::stats_date("first_seen").limit(DateLimit::Start),
            A::stats_date("last_seen").limit(DateLimit::End),
            A::numeric("attribute_count"),
            A::boolean("x_opencti_negative"),
        ];
        relations.push(sighting);
        relations.extend([
            RelationDefinition::meta("created-by", "createdBy", Cardinality::Single)
                .between(&["*"], &["Identity"]),
            RelationDefinition::meta("object-marking", "objectMarking", Cardinality::Multiple)
                .between(&["*"], &["Marking-Definition"]),
            RelationDefinition::meta("object-label", "objectLabel", Cardinality::Multiple)
                .between(&["*"], &["Label"]),
            RelationDefinition::meta("kill-chain-phase", "killChainPhases", Cardinality::Multiple)
                .between(&["*"], &["Kill-Chain-Phase"]),
            RelationDefinition::meta("external-reference", "externalReferences", Cardinality::Multiple)
                .between(&["*"], &["External-Reference"]),
            RelationDefinition::meta("object", "objects", Cardinality::Multiple)
                .between(&["Report"], &["*"]),
        ]);

        let rule_behaviors = vec![
            RuleBehavior::new("confidence", AggregationOp::Avg),
            RuleBehavior::new("start_time", AggregationOp::Min),
            RuleBehavior::new("stop_time", AggregationOp::Max),
            RuleBehavior::new("first_seen", AggregationOp::Min),
            RuleBehavior::new("last_seen", AggregationOp::Max),
            RuleBehavior::new("attribute_count", AggregationOp::Sum),
        ];

        Self {
            common_attributes,
            domain_attributes,
            entities,
            relations,
            rule_behaviors,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────

/// Resolved, read-only schema used by the engines.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    definition: SchemaDefinition,
    entities: HashMap<String, EntityDefinition>,
    relations: HashMap<String, RelationDefinition>,
    attributes: HashMap<String, BTreeMap<String, AttributeDefinition>>,
    parents: HashMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn builtin() -> Self {
        // The built-in definition is covered by tests, so it always validates.
        Self::from_definition(SchemaDefinition::builtin()).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Built-in schema failed validation");
            Self::empty()
        })
    }

    fn empty() -> Self {
        Self {
            definition: SchemaDefinition {
                common_attributes: Vec::new(),
                domain_attributes: Vec::new(),
                entities: Vec::new(),
                relations: Vec::new(),
                rule_behaviors: Vec::new(),
            },
            entities: HashMap::new(),
            relations: HashMap::new(),
            attributes: HashMap::new(),
            parents: HashMap::new(),
        }
    }

    /// Load a schema definition file (TOML or JSON, by extension).
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let definition = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize::<SchemaDefinition>()?;
        Self::from_definition(definition)
    }

    pub fn from_definition(definition: SchemaDefinition) -> Result<Self, CoreError> {
        let mut registry = Self::empty();

        for entity in &definition.entities {
            if registry.entities.contains_key(&entity.name) {
                return Err(CoreError::Schema(format!(
                    "duplicate entity type {}",
                    entity.name
                )));
            }
            let mut parents: Vec<String> = entity
                .category
                .parent_types()
                .iter()
                .map(|p| p.to_string())
                .collect();
            parents.extend(entity.parent_types.iter().cloned());

            let mut attrs = BTreeMap::new();
            for a in &definition.common_attributes {
                attrs.insert(a.name.clone(), a.clone());
            }
            if matches!(
                entity.category,
                EntityCategory::DomainObject | EntityCategory::MetaObject
            ) {
                for a in &definition.domain_attributes {
                    attrs.insert(a.name.clone(), a.clone());
                }
            }
            for a in &entity.attributes {
                validate_attribute(&entity.name, a)?;
                attrs.insert(a.name.clone(), a.clone());
            }
            for contributor in entity.id_contributors.iter().chain(&entity.id_fallback) {
                if !attrs.contains_key(&contributor.key) {
                    return Err(CoreError::Schema(format!(
                        "{} identity contributor {} is not an attribute",
                        entity.name, contributor.key
                    )));
                }
            }
            registry.attributes.insert(entity.name.clone(), attrs);
            registry.parents.insert(entity.name.clone(), parents);
            registry
                .entities
                .insert(entity.name.clone(), entity.clone());
        }

        let known: HashSet<String> = registry
            .parents
            .iter()
            .flat_map(|(name, parents)| std::iter::once(name.clone()).chain(parents.iter().cloned()))
            .collect();

        for relation in &definition.relations {
            if registry.entities.contains_key(&relation.name)
                || registry.relations.contains_key(&relation.name)
            {
                return Err(CoreError::Schema(format!(
                    "duplicate relation type {}",
                    relation.name
                )));
            }
            for pair in &relation.allowed {
                for side in [&pair.from, &pair.to] {
                    if side != "*" && !known.contains(side) {
                        return Err(CoreError::Schema(format!(
                            "relation {} references unknown type {}",
                            relation.name, side
                        )));
                    }
                }
            }
            let mut attrs = BTreeMap::new();
            for a in &definition.common_attributes {
                attrs.insert(a.name.clone(), a.clone());
            }
            if relation.family != RelationFamily::Meta {
                for a in &definition.domain_attributes {
                    attrs.insert(a.name.clone(), a.clone());
                }
            }
            for a in &relation.attributes {
                validate_attribute(&relation.name, a)?;
                attrs.insert(a.name.clone(), a.clone());
            }
            let parents = relation
                .family
                .parent_types()
                .iter()
                .map(|p| p.to_string())
                .collect();
            registry.attributes.insert(relation.name.clone(), attrs);
            registry.parents.insert(relation.name.clone(), parents);
            registry
                .relations
                .insert(relation.name.clone(), relation.clone());
        }

        registry.definition = definition;
        tracing::debug!(
            entities = registry.entities.len(),
            relations = registry.relations.len(),
            "Schema registry built"
        );
        Ok(registry)
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    pub fn entity(&self, entity_type: &str) -> Option<&EntityDefinition> {
        self.entities.get(entity_type)
    }

    pub fn relation(&self, relationship_type: &str) -> Option<&RelationDefinition> {
        self.relations.get(relationship_type)
    }

    pub fn is_relation(&self, type_name: &str) -> bool {
        self.relations.contains_key(type_name)
    }

    pub fn is_known(&self, type_name: &str) -> bool {
        self.entities.contains_key(type_name) || self.relations.contains_key(type_name)
    }

    pub fn parent_types(&self, type_name: &str) -> Vec<String> {
        self.parents.get(type_name).cloned().unwrap_or_default()
    }

    pub fn attribute(&self, type_name: &str, key: &str) -> Option<&AttributeDefinition> {
        self.attributes.get(type_name).and_then(|attrs| attrs.get(key))
    }

    pub fn attributes(&self, type_name: &str) -> impl Iterator<Item = &AttributeDefinition> {
        self.attributes
            .get(type_name)
            .into_iter()
            .flat_map(|attrs| attrs.values())
    }

    pub fn kind_of(&self, type_name: &str, key: &str) -> Option<AttributeKind> {
        self.attribute(type_name, key).map(|a| a.kind)
    }

    pub fn is_multiple(&self, type_name: &str, key: &str) -> bool {
        self.attribute(type_name, key).is_some_and(|a| a.multiple)
    }

    pub fn is_dictionary(&self, type_name: &str, key: &str) -> bool {
        self.kind_of(type_name, key) == Some(AttributeKind::Dictionary)
    }

    /// Standard id prefix of a type.
    pub fn stix_type(&self, type_name: &str) -> String {
        if let Some(entity) = self.entities.get(type_name) {
            return entity.stix_type.clone();
        }
        if let Some(relation) = self.relations.get(type_name) {
            return relation.family.stix_type().to_string();
        }
        type_name.to_lowercase()
    }

    pub fn alias_field(&self, entity_type: &str) -> Option<&str> {
        self.entities
            .get(entity_type)
            .and_then(|e| e.alias_field.as_deref())
    }

    pub fn is_observable(&self, entity_type: &str) -> bool {
        self.entities
            .get(entity_type)
            .is_some_and(|e| e.category == EntityCategory::CyberObservable)
    }

    /// STIX domain clock (`created`/`modified`) is maintained for this type.
    pub fn has_domain_clock(&self, type_name: &str) -> bool {
        match self.entities.get(type_name) {
            Some(e) => matches!(
                e.category,
                EntityCategory::DomainObject | EntityCategory::MetaObject
            ),
            None => self
                .relations
                .get(type_name)
                .is_some_and(|r| r.family != RelationFamily::Meta),
        }
    }

    pub fn upsert_fields(&self, entity_type: &str) -> &[String] {
        self.entities
            .get(entity_type)
            .map(|e| e.upsert_fields.as_slice())
            .unwrap_or(&[])
    }

    /// Whether any of the given attribute keys feeds the standard id.
    pub fn contributes(&self, entity_type: &str, keys: &[&str]) -> bool {
        self.entities.get(entity_type).is_some_and(|e| {
            e.id_contributors
                .iter()
                .chain(&e.id_fallback)
                .any(|c| keys.contains(&c.key.as_str()))
        })
    }

    /// Whether the relation type may link these endpoints.
    pub fn relation_allowed(&self, relationship_type: &str, from: &Element, to: &Element) -> bool {
        let Some(relation) = self.relations.get(relationship_type) else {
            return false;
        };
        relation.allowed.iter().any(|pair| {
            (pair.from == "*" || from.is_type(&pair.from)) && (pair.to == "*" || to.is_type(&pair.to))
        })
    }

    /// Meta relations fed by input reference keys.
    pub fn meta_relations(&self) -> impl Iterator<Item = (&str, &RelationDefinition)> {
        self.definition.relations.iter().filter_map(|r| {
            r.input_key
                .as_deref()
                .map(|key| (key, r))
        })
    }

    pub fn meta_relation_for_input(&self, input_key: &str) -> Option<&RelationDefinition> {
        self.meta_relations()
            .find(|(key, _)| *key == input_key)
            .map(|(_, r)| r)
    }

    pub fn rule_behaviors(&self) -> &[RuleBehavior] {
        &self.definition.rule_behaviors
    }
}

fn validate_attribute(owner: &str, attr: &AttributeDefinition) -> Result<(), CoreError> {
    if attr.multiple && attr.kind == AttributeKind::Dictionary {
        return Err(CoreError::Schema(format!(
            "{owner}.{} cannot be a multiple dictionary",
            attr.name
        )));
    }
    if (attr.stats_date || attr.date_limit.is_some()) && attr.kind != AttributeKind::Date {
        return Err(CoreError::Schema(format!(
            "{owner}.{} has date behaviour but is not a date",
            attr.name
        )));
    }
    Ok(())
}
