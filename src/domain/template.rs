//! The `Template` aggregate (spec §3).
//!
//! Templates are configuration data, not transactional: they are loaded (or
//! reloaded on cache expiry) by [`crate::template::TemplateConfigManager`],
//! never mutated in place while cached, and replaced atomically. This module
//! owns the struct and the invariants; the manager in `crate::template` owns
//! discovery, remapping, and caching.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    OnDemand,
    Spot,
    Heterogeneous,
}

impl Default for PriceType {
    fn default() -> Self {
        PriceType::OnDemand
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpotFleetParams {
    pub max_spot_price: Option<String>,
    pub allocation_strategy: Option<String>,
    pub percent_on_demand: Option<u32>,
    pub allocation_strategy_ondemand: Option<String>,
    pub fleet_role: Option<String>,
    pub spot_fleet_request_expiry: Option<u32>,
    pub pools_count: Option<u32>,
    pub launch_template_id: Option<String>,
    pub instance_types_ondemand: Option<IndexMap<String, u32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootVolumeSpec {
    pub size_gb: Option<i32>,
    pub volume_type: Option<String>,
    pub delete_on_termination: Option<bool>,
}

/// A named, immutable configuration describing how to provision a batch of
/// cloud machines (spec glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub provider_api: String,
    pub provider_type: Option<String>,
    pub provider_name: Option<String>,
    pub max_number: u32,
    pub image_id: String,
    pub instance_type: Option<String>,
    pub instance_types: Option<IndexMap<String, u32>>,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub price_type: PriceType,
    pub spot: SpotFleetParams,
    pub instance_profile: Option<String>,
    pub user_data: Option<String>,
    pub tags: HashMap<String, String>,
    pub root_volume: RootVolumeSpec,
    pub use_spot_instances: bool,
    pub use_auto_scaling: bool,
    pub use_fleet: bool,
    pub context: HashMap<String, String>,
    pub is_active: bool,
    pub source_file: Option<String>,
    pub file_priority: u32,
}

impl Template {
    /// Build a template from already-remapped, normalized fields and enforce
    /// the structural invariants from spec §3. `instance_types`-derives-
    /// `instance_type` and the list-normalization of `subnet_ids` are applied
    /// by the remap layer (`crate::template::remap`) before this is called;
    /// this constructor enforces what must hold regardless of where the data
    /// came from.
    pub fn build(mut builder: TemplateBuilder) -> Result<Self> {
        if builder.instance_type.is_none() {
            if let Some(types) = &builder.instance_types {
                // `IndexMap` preserves the order keys were inserted in, which
                // for a template parsed from JSON/YAML is the order they
                // appeared in the source file (spec §3: "stable iteration
                // order over the input"). A plain `HashMap` would make this
                // pick an arbitrary key instead of the first one.
                builder.instance_type = types.keys().next().cloned();
            }
        }

        if builder.price_type == PriceType::Heterogeneous
            && builder.spot.instance_types_ondemand.is_none()
            && builder.spot.percent_on_demand.is_none()
        {
            return Err(ValidationError::Message(
                "heterogeneous price_type requires instance_types_ondemand or percent_on_demand"
                    .to_string(),
            )
            .into());
        }

        if builder.subnet_ids.is_empty() {
            return Err(ValidationError::MissingField("subnet_ids".to_string()).into());
        }

        if builder.max_number == 0 {
            return Err(ValidationError::BelowMinimum {
                field: "max_number".to_string(),
                min: 1,
                actual: 0,
            }
            .into());
        }

        Ok(Template {
            template_id: builder.template_id,
            provider_api: builder.provider_api,
            provider_type: builder.provider_type,
            provider_name: builder.provider_name,
            max_number: builder.max_number,
            image_id: builder.image_id,
            instance_type: builder.instance_type,
            instance_types: builder.instance_types,
            subnet_ids: builder.subnet_ids,
            security_group_ids: builder.security_group_ids,
            price_type: builder.price_type,
            spot: builder.spot,
            instance_profile: builder.instance_profile,
            user_data: builder.user_data,
            tags: builder.tags,
            root_volume: builder.root_volume,
            use_spot_instances: builder.use_spot_instances,
            use_auto_scaling: builder.use_auto_scaling,
            use_fleet: builder.use_fleet,
            context: builder.context,
            is_active: builder.is_active,
            source_file: builder.source_file,
            file_priority: builder.file_priority,
        })
    }
}

/// Mutable scratch form used while assembling a [`Template`] from remapped,
/// possibly partial, external fields.
#[derive(Debug, Clone, Default)]
pub struct TemplateBuilder {
    pub template_id: String,
    pub provider_api: String,
    pub provider_type: Option<String>,
    pub provider_name: Option<String>,
    pub max_number: u32,
    pub image_id: String,
    pub instance_type: Option<String>,
    pub instance_types: Option<IndexMap<String, u32>>,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub price_type: PriceType,
    pub spot: SpotFleetParams,
    pub instance_profile: Option<String>,
    pub user_data: Option<String>,
    pub tags: HashMap<String, String>,
    pub root_volume: RootVolumeSpec,
    pub use_spot_instances: bool,
    pub use_auto_scaling: bool,
    pub use_fleet: bool,
    pub context: HashMap<String, String>,
    pub is_active: bool,
    pub source_file: Option<String>,
    pub file_priority: u32,
}

impl TemplateBuilder {
    pub fn new(template_id: impl Into<String>, provider_api: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            provider_api: provider_api.into(),
            max_number: 1,
            is_active: true,
            use_fleet: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_builder() -> TemplateBuilder {
        let mut b = TemplateBuilder::new("t1", "aws");
        b.image_id = "ami-0abc1234def567890".to_string();
        b.subnet_ids = vec!["subnet-aaaa1111bbbb2222c".to_string()];
        b.instance_type = Some("t3.medium".to_string());
        b.max_number = 5;
        b
    }

    #[test]
    fn instance_type_derives_from_first_instance_types_key() {
        let mut b = base_builder();
        b.instance_type = None;
        let mut types = IndexMap::new();
        types.insert("t2.medium".to_string(), 1);
        b.instance_types = Some(types);

        let template = Template::build(b).unwrap();
        assert_eq!(template.instance_type.as_deref(), Some("t2.medium"));
    }

    #[test]
    fn instance_type_derivation_respects_insertion_order_not_key_sort_order() {
        // "t3.large" sorts before "m5.2xlarge" alphabetically; if the first
        // key were picked from a sorted or hash-randomized map this would be
        // flaky. It must always resolve to whichever key was inserted first.
        let mut b = base_builder();
        b.instance_type = None;
        let mut types = IndexMap::new();
        types.insert("m5.2xlarge".to_string(), 1);
        types.insert("t3.large".to_string(), 2);
        b.instance_types = Some(types);

        let template = Template::build(b).unwrap();
        assert_eq!(template.instance_type.as_deref(), Some("m5.2xlarge"));
    }

    #[test]
    fn heterogeneous_requires_ondemand_split() {
        let mut b = base_builder();
        b.price_type = PriceType::Heterogeneous;
        assert!(Template::build(b).is_err());

        let mut b = base_builder();
        b.price_type = PriceType::Heterogeneous;
        b.spot.percent_on_demand = Some(30);
        assert!(Template::build(b).is_ok());
    }

    #[test]
    fn subnet_ids_must_be_nonempty() {
        let mut b = base_builder();
        b.subnet_ids.clear();
        assert!(Template::build(b).is_err());
    }

    #[test]
    fn max_number_must_be_at_least_one() {
        let mut b = base_builder();
        b.max_number = 0;
        assert!(Template::build(b).is_err());
    }
}
