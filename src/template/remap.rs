//! Scheduler-provider field remap registry (spec §4.2).
//!
//! Two tables per scheduler: a generic table applied to every provider, and
//! a provider-specific table applied only when the active provider matches.
//! Remapping happens in both directions: inbound template/request fields are
//! renamed to internal names before processing, and the reverse mapping is
//! used at the wire boundary to render external shapes back out.

use std::collections::HashMap;
use std::sync::OnceLock;

/// `external_name -> internal_name` for one (scheduler, provider) pair.
pub struct RemapTable {
    forward: HashMap<&'static str, &'static str>,
}

impl RemapTable {
    fn new(pairs: &[(&'static str, &'static str)]) -> Self {
        Self {
            forward: pairs.iter().copied().collect(),
        }
    }

    pub fn rename(&self, external_key: &str) -> Option<&'static str> {
        self.forward.get(external_key).copied()
    }

    /// The reverse direction, used to render internal records back to the
    /// scheduler's wire shape (spec §8's round-trip law).
    pub fn reverse(&self, internal_key: &str) -> Option<&'static str> {
        self.forward
            .iter()
            .find(|(_, internal)| **internal == internal_key)
            .map(|(external, _)| *external)
    }
}

fn hostfactory_generic() -> &'static RemapTable {
    static TABLE: OnceLock<RemapTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        RemapTable::new(&[
            ("templateId", "template_id"),
            ("vmType", "instance_type"),
            ("vmTypes", "instance_types"),
            ("subnetId", "subnet_ids"),
            ("maxNumber", "max_instances"),
            ("priceType", "price_type"),
            ("instanceTags", "tags"),
        ])
    })
}

fn hostfactory_aws() -> &'static RemapTable {
    static TABLE: OnceLock<RemapTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        RemapTable::new(&[
            ("vmTypesOnDemand", "instance_types_ondemand"),
            ("percentOnDemand", "percent_on_demand"),
            ("fleetRole", "fleet_role"),
        ])
    })
}

/// Look up the internal name for an external field, checking the
/// provider-specific table first, falling back to the generic table (spec
/// §4.2: "generic table... and a provider-specific table... applied when
/// the active provider matches").
pub fn rename_field(scheduler: &str, provider_api: &str, external_key: &str) -> Option<&'static str> {
    if scheduler != "hostfactory" {
        return None;
    }
    if provider_api == "aws" {
        if let Some(renamed) = hostfactory_aws().rename(external_key) {
            return Some(renamed);
        }
    }
    hostfactory_generic().rename(external_key)
}

pub fn reverse_field(scheduler: &str, provider_api: &str, internal_key: &str) -> Option<&'static str> {
    if scheduler != "hostfactory" {
        return None;
    }
    if provider_api == "aws" {
        if let Some(external) = hostfactory_aws().reverse(internal_key) {
            return Some(external);
        }
    }
    hostfactory_generic().reverse(internal_key)
}

/// Apply the renaming + value-shape transforms described in spec §4.2 to a
/// raw external JSON object, producing an internal-name keyed object.
///
/// Transforms applied after renaming: scalar subnet -> list; tag string
/// `k1=v1;k2=v2` -> map. The `instance_types`-derives-`instance_type`
/// invariant is enforced later, in [`crate::domain::template::Template::build`].
pub fn remap_object(
    scheduler: &str,
    provider_api: &str,
    external: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut internal = serde_json::Map::new();

    for (key, value) in external {
        let internal_key = rename_field(scheduler, provider_api, key).unwrap_or(key.as_str());
        let transformed = match internal_key {
            "subnet_ids" => normalize_to_list(value),
            "tags" => normalize_tag_string(value),
            _ => value.clone(),
        };
        internal.insert(internal_key.to_string(), transformed);
    }

    internal
}

fn normalize_to_list(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(_) => value.clone(),
        serde_json::Value::Null => serde_json::Value::Array(vec![]),
        other => serde_json::Value::Array(vec![other.clone()]),
    }
}

fn normalize_tag_string(value: &serde_json::Value) -> serde_json::Value {
    let Some(s) = value.as_str() else {
        return value.clone();
    };
    let mut map = serde_json::Map::new();
    for pair in s.split(';').filter(|p| !p.is_empty()) {
        if let Some((k, v)) = pair.split_once('=') {
            map.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generic_fields_rename_for_any_provider() {
        assert_eq!(rename_field("hostfactory", "aws", "templateId"), Some("template_id"));
        assert_eq!(rename_field("hostfactory", "gcp", "templateId"), Some("template_id"));
    }

    #[test]
    fn aws_only_fields_do_not_rename_for_other_providers() {
        assert_eq!(rename_field("hostfactory", "aws", "fleetRole"), Some("fleet_role"));
        assert_eq!(rename_field("hostfactory", "gcp", "fleetRole"), None);
    }

    #[test]
    fn reverse_mapping_round_trips() {
        let external = "templateId";
        let internal = rename_field("hostfactory", "aws", external).unwrap();
        assert_eq!(reverse_field("hostfactory", "aws", internal), Some(external));
    }

    #[test]
    fn scalar_subnet_id_becomes_a_list() {
        let mut obj = serde_json::Map::new();
        obj.insert("subnetId".to_string(), json!("subnet-aaaa1111bbbb2222c"));
        let internal = remap_object("hostfactory", "aws", &obj);
        assert_eq!(internal["subnet_ids"], json!(["subnet-aaaa1111bbbb2222c"]));
    }

    #[test]
    fn tag_string_becomes_a_map() {
        let mut obj = serde_json::Map::new();
        obj.insert("instanceTags".to_string(), json!("k1=v1;k2=v2"));
        let internal = remap_object("hostfactory", "aws", &obj);
        assert_eq!(internal["tags"], json!({"k1": "v1", "k2": "v2"}));
    }
}
