//! Template validation rules (spec §4.2).

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{PriceType, Template};

fn ami_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ami-[a-f0-9]{8,17}$").unwrap())
}

fn subnet_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^subnet-[a-f0-9]{8,17}$").unwrap())
}

fn security_group_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^sg-[a-f0-9]{8,17}$").unwrap())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub supported_features: Vec<String>,
    pub validation_time: DateTime<Utc>,
    pub provider_instance: Option<String>,
}

/// Validate a resolved [`Template`] per spec §4.2's rule list.
pub fn validate_template(template: &Template) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if template.image_id.is_empty() {
        errors.push("image_id is required".to_string());
    } else if !ami_pattern().is_match(&template.image_id) {
        errors.push(format!("image_id '{}' does not match ami-[a-f0-9]{{8,17}}", template.image_id));
    }

    if !(1..=1000).contains(&template.max_number) {
        errors.push(format!("max_number must be in [1, 1000], got {}", template.max_number));
    }

    if template.subnet_ids.is_empty() {
        errors.push("at least one subnet_id is required".to_string());
    }
    for subnet in &template.subnet_ids {
        if !subnet_pattern().is_match(subnet) {
            errors.push(format!("subnet_id '{subnet}' does not match subnet-[a-f0-9]{{8,17}}"));
        }
    }
    if template.subnet_ids.len() > 2 {
        warnings.push(format!(
            "{} subnets configured; more than 2 may complicate capacity planning",
            template.subnet_ids.len()
        ));
    }

    for sg in &template.security_group_ids {
        if !security_group_pattern().is_match(sg) {
            errors.push(format!("security_group_id '{sg}' does not match sg-[a-f0-9]{{8,17}}"));
        }
    }

    if template.price_type == PriceType::OnDemand {
        if template.spot.max_spot_price.is_some() || template.spot.allocation_strategy.is_some() {
            errors.push("spot parameters are only valid when price_type != ondemand".to_string());
        }
    }

    if template.instance_type.is_none() && template.instance_types.is_none() {
        errors.push("instance_type or instance_types is required".to_string());
    }

    let mut supported_features = Vec::new();
    if template.use_fleet {
        supported_features.push("ec2_fleet".to_string());
    }
    if template.use_spot_instances || template.price_type == PriceType::Spot {
        supported_features.push("spot".to_string());
    }
    if template.use_auto_scaling {
        supported_features.push("auto_scaling".to_string());
    }
    if template.price_type == PriceType::Heterogeneous {
        supported_features.push("heterogeneous_fleet".to_string());
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        supported_features,
        validation_time: Utc::now(),
        provider_instance: template.instance_type.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TemplateBuilder;

    fn valid_builder() -> TemplateBuilder {
        let mut b = TemplateBuilder::new("t1", "aws");
        b.image_id = "ami-0abc1234def567890".to_string();
        b.subnet_ids = vec!["subnet-aaaa1111bbbb2222c".to_string()];
        b.instance_type = Some("t3.medium".to_string());
        b.max_number = 5;
        b
    }

    #[test]
    fn well_formed_template_is_valid() {
        let template = Template::build(valid_builder()).unwrap();
        let report = validate_template(&template);
        assert!(report.is_valid, "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn malformed_ami_id_is_rejected() {
        let mut b = valid_builder();
        b.image_id = "not-an-ami".to_string();
        let template = Template::build(b).unwrap();
        let report = validate_template(&template);
        assert!(!report.is_valid);
    }

    #[test]
    fn max_number_out_of_range_is_rejected() {
        let mut b = valid_builder();
        b.max_number = 5000;
        let template = Template::build(b).unwrap();
        let report = validate_template(&template);
        assert!(!report.is_valid);
    }

    #[test]
    fn spot_params_on_ondemand_template_are_rejected() {
        let mut b = valid_builder();
        b.spot.max_spot_price = Some("0.05".to_string());
        let template = Template::build(b).unwrap();
        let report = validate_template(&template);
        assert!(!report.is_valid);
    }
}
