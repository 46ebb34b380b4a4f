//! Content-addressed identifiers.
//!
//! A standard id is `{stix-type}--{uuid-v5}` where the UUID is derived from
//! the canonical JSON of the type's contributing attributes. Two inputs
//! describing the same object therefore share a standard id, which is what
//! creation deduplicates on. Aliased types also answer to one alias id per
//! name, shaped like the standard id an entity with that name would have.

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use tessera_core::schema::{is_empty_value, IdContributor};
use tessera_core::types::strings_of;
use tessera_core::{Attributes, ObjectId, SchemaRegistry};

/// Namespace for every deterministic id minted by the engine.
const TESSERA_NS: Uuid = Uuid::from_bytes([
    0x1f, 0x3c, 0x5a, 0x9e, 0x42, 0x7b, 0x4d, 0x20, 0x9a, 0x61, 0xc8, 0x0e, 0x55, 0xd2, 0x3b, 0x74,
]);

/// Input key carrying a caller-provided standard id.
pub const INPUT_STIX_ID: &str = "stix_id";
/// Input key carrying a caller-provided internal id.
pub const INPUT_INTERNAL_ID: &str = "internal_id";

/// Keys whose values are names and get normalised before hashing.
const NAME_KEYS: &[&str] = &["name", "value"];

#[derive(Clone)]
pub struct IdentityResolver {
    schema: Arc<SchemaRegistry>,
}

impl IdentityResolver {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self { schema }
    }

    /// Deterministic standard id for an entity, random for relationships and
    /// for entities carrying none of their contributing attributes.
    pub fn standard_id(&self, entity_type: &str, data: &Attributes) -> String {
        self.content_id(entity_type, data).unwrap_or_else(|| {
            format!("{}--{}", self.schema.stix_type(entity_type), Uuid::new_v4())
        })
    }

    /// Content-derived id, or `None` when no contributing attribute is present.
    pub fn content_id(&self, entity_type: &str, data: &Attributes) -> Option<String> {
        let entity = self.schema.entity(entity_type)?;
        let canonical = canonical_data(&entity.id_contributors, data)
            .or_else(|| canonical_data(&entity.id_fallback, data))?;
        // Map keys are sorted, so this rendering is canonical.
        let json = Value::Object(canonical).to_string();
        Some(format!(
            "{}--{}",
            entity.stix_type,
            Uuid::new_v5(&TESSERA_NS, json.as_bytes())
        ))
    }

    /// One id per distinct normalised name; empty for non-aliased types.
    pub fn alias_ids<S: AsRef<str>>(&self, entity_type: &str, names: &[S]) -> Vec<String> {
        self.alias_ids_with(entity_type, &Attributes::new(), names)
    }

    /// Alias ids for the name and aliases carried by a document. The other
    /// contributors of the document are kept, so an organization alias
    /// stays an organization id.
    pub fn alias_ids_of(&self, entity_type: &str, data: &Attributes) -> Vec<String> {
        let Some(field) = self.schema.alias_field(entity_type) else {
            return Vec::new();
        };
        let mut names: Vec<String> = data.get("name").map(strings_of).unwrap_or_default();
        if let Some(aliases) = data.get(field) {
            names.extend(strings_of(aliases));
        }
        self.alias_ids_with(entity_type, data, &names)
    }

    fn alias_ids_with<S: AsRef<str>>(
        &self,
        entity_type: &str,
        context: &Attributes,
        names: &[S],
    ) -> Vec<String> {
        let Some(entity) = self.schema.entity(entity_type) else {
            return Vec::new();
        };
        if entity.alias_field.is_none() {
            return Vec::new();
        }
        let mut base = entity.defaults.clone();
        for contributor in &entity.id_contributors {
            if let Some(v) = context.get(&contributor.key) {
                base.insert(contributor.key.clone(), v.clone());
            }
        }
        let mut seen: Vec<String> = Vec::new();
        let mut ids = Vec::new();
        for name in names {
            let normalized = normalize_name(name.as_ref());
            if normalized.is_empty() || seen.contains(&normalized) {
                continue;
            }
            let mut data = base.clone();
            data.insert("name".into(), Value::String(normalized.clone()));
            ids.push(self.standard_id(entity_type, &data));
            seen.push(normalized);
        }
        ids
    }

    /// Label references may be free text; ids pass through untouched.
    pub fn label_id(&self, label: &str) -> String {
        if is_an_id(label) {
            return label.to_string();
        }
        let mut data = Attributes::new();
        data.insert("value".into(), Value::String(label.to_string()));
        self.standard_id("Label", &data)
    }

    /// Every id a creation input may already exist under. These form the
    /// participant set of the creation.
    pub fn input_ids(&self, entity_type: &str, data: &Attributes, standard_id: &str) -> Vec<String> {
        let mut ids = Vec::new();
        let mut push = |id: String| {
            let id = id.to_lowercase();
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        };
        if let Some(internal) = data.get(INPUT_INTERNAL_ID).and_then(Value::as_str) {
            push(internal.to_string());
        }
        push(standard_id.to_string());
        if let Some(stix_id) = data.get(INPUT_STIX_ID).and_then(Value::as_str) {
            push(stix_id.to_string());
        }
        if let Some(stix_ids) = data.get(tessera_core::types::KEY_STIX_IDS) {
            strings_of(stix_ids).into_iter().for_each(&mut push);
        }
        self.alias_ids_of(entity_type, data)
            .into_iter()
            .for_each(&mut push);
        ids
    }

    /// Whether any of the keys feeds the standard id. Dictionary paths
    /// (`hashes.MD5`) count for their dictionary.
    pub fn contributes<S: AsRef<str>>(&self, entity_type: &str, keys: &[S]) -> bool {
        let bases: Vec<&str> = keys.iter().map(|k| base_key(k.as_ref())).collect();
        self.schema.contributes(entity_type, &bases)
    }
}

/// Lowercased, trimmed, inner whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Whether a reference string is an id rather than free text.
pub fn is_an_id(value: &str) -> bool {
    if ObjectId::parse(value).is_some() {
        return true;
    }
    match value.split_once("--") {
        Some((prefix, uuid)) => !prefix.is_empty() && Uuid::parse_str(uuid).is_ok(),
        None => false,
    }
}

/// Attribute part of a `dict.key` path.
pub fn base_key(key: &str) -> &str {
    key.split_once('.').map(|(base, _)| base).unwrap_or(key)
}

fn canonical_data(contributors: &[IdContributor], data: &Attributes) -> Option<Map<String, Value>> {
    let mut canonical = Map::new();
    for contributor in contributors {
        let Some(value) = data.get(&contributor.key) else {
            continue;
        };
        if is_empty_value(value) {
            continue;
        }
        if contributor.preference.is_empty() {
            canonical.insert(contributor.key.clone(), canonical_value(&contributor.key, value));
            continue;
        }
        let Some(dict) = value.as_object() else {
            continue;
        };
        let ranked = contributor.preference.iter().find_map(|preferred| {
            dict.iter()
                .find(|(k, v)| k.eq_ignore_ascii_case(preferred) && !is_empty_value(v))
                .map(|(_, v)| (preferred.clone(), v.clone()))
        });
        if let Some((key, v)) = ranked {
            let mut single = Map::new();
            single.insert(key, canonical_hash_value(&v));
            canonical.insert(contributor.key.clone(), Value::Object(single));
        }
    }
    (!canonical.is_empty()).then_some(canonical)
}

fn canonical_value(key: &str, value: &Value) -> Value {
    match value {
        Value::String(s) if NAME_KEYS.contains(&key) => Value::String(normalize_name(s)),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

fn canonical_hash_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_lowercase()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Arc::new(SchemaRegistry::builtin()))
    }

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn standard_id_is_deterministic_and_normalised() {
        let ids = resolver();
        let a = ids.standard_id("Malware", &attrs(json!({"name": "Paradise Ransomware"})));
        let b = ids.standard_id("Malware", &attrs(json!({"name": "  paradise   RANSOMWARE "})));
        assert_eq!(a, b);
        assert!(a.starts_with("malware--"));

        let other = ids.standard_id("Malware", &attrs(json!({"name": "Other"})));
        assert_ne!(a, other);
    }

    #[test]
    fn non_contributing_attributes_do_not_matter() {
        let ids = resolver();
        let a = ids.standard_id("Malware", &attrs(json!({"name": "M", "description": "one"})));
        let b = ids.standard_id("Malware", &attrs(json!({"name": "M", "description": "two"})));
        assert_eq!(a, b);
    }

    #[test]
    fn ranked_hashes_keep_the_preferred_key() {
        let ids = resolver();
        let md5_only = ids.standard_id(
            "File",
            &attrs(json!({"hashes": {"MD5": "ABC"}})),
        );
        let both = ids.standard_id(
            "File",
            &attrs(json!({"hashes": {"SHA-256": "def", "MD5": "abc"}})),
        );
        assert_eq!(md5_only, both);
        assert!(md5_only.starts_with("file--"));
    }

    #[test]
    fn fallback_contributors_apply_when_primary_absent() {
        let ids = resolver();
        let a = ids.standard_id("File", &attrs(json!({"name": "dropper.exe"})));
        let b = ids.standard_id("File", &attrs(json!({"name": "dropper.exe"})));
        assert_eq!(a, b);
    }

    #[test]
    fn relations_get_random_ids() {
        let ids = resolver();
        let a = ids.standard_id("uses", &Attributes::new());
        let b = ids.standard_id("uses", &Attributes::new());
        assert_ne!(a, b);
        assert!(a.starts_with("relationship--"));
    }

    #[test]
    fn alias_id_matches_standard_id_of_same_name() {
        let ids = resolver();
        let standard = ids.standard_id("Malware", &attrs(json!({"name": "Ryuk"})));
        let aliases = ids.alias_ids("Malware", &["RYUK", "ryuk ", "Conti"]);
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases[0], standard);

        let org = ids.standard_id(
            "Organization",
            &attrs(json!({"name": "ACME", "identity_class": "organization"})),
        );
        assert_eq!(ids.alias_ids("Organization", &["acme"]), vec![org]);
        assert!(ids.alias_ids("Indicator", &["x"]).is_empty());
    }

    #[test]
    fn input_ids_collect_every_identifier() {
        let ids = resolver();
        let data = attrs(json!({
            "name": "M",
            "aliases": ["Alt"],
            "stix_id": "malware--0b4b1fd7-0c5f-4b4c-9d5b-3d5a4b7e6c01",
            "x_opencti_stix_ids": ["MALWARE--0B4B1FD7-0C5F-4B4C-9D5B-3D5A4B7E6C01"],
        }));
        let standard = ids.standard_id("Malware", &data);
        let collected = ids.input_ids("Malware", &data, &standard);
        // standard, stix id (once, lowercased), alias of "M" (== standard), alias of "Alt"
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0], standard);
    }

    #[test]
    fn labels_and_ids() {
        let ids = resolver();
        assert!(is_an_id("marking-definition--613f2e26-407d-48c7-9eca-b8e91df99dc9"));
        assert!(is_an_id(&ObjectId::new().to_string()));
        assert!(!is_an_id("ransomware"));
        assert!(ids.label_id("ransomware").starts_with("label--"));
        assert_eq!(ids.label_id("ransomware"), ids.label_id("Ransomware"));
    }

    #[test]
    fn contributes_through_dictionary_paths() {
        let ids = resolver();
        assert!(ids.contributes("File", &["hashes.MD5"]));
        assert!(!ids.contributes("File", &["size"]));
        assert!(ids.contributes("Malware", &["name"]));
    }
}
