use eva_protocol::{Attributes, ResourceKind};
use serde_json::Value;

use crate::Policy;

/// Why a single rule refused a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleBreach {
    pub rule: String,
    pub reason: String,
}

/// Evaluate every rule of `policy` against a lease request. The first
/// refusing rule wins; rules this engine does not recognise are advisory.
pub(crate) fn check(policy: &Policy, kind: ResourceKind, attrs: &Attributes) -> Result<(), RuleBreach> {
    for (name, value) in &policy.rules {
        if let Some(reason) = evaluate_rule(name, value, kind, attrs) {
            return Err(RuleBreach {
                rule: name.clone(),
                reason,
            });
        }
    }
    Ok(())
}

/// Reject rule values the evaluator would silently misread.
pub(crate) fn validate(policy: &Policy) -> Result<(), String> {
    if policy.id.trim().is_empty() {
        return Err("policy id is empty".into());
    }
    for (name, value) in &policy.rules {
        match name.as_str() {
            "human_consent_required" | "encryption_required_for" | "denied_kinds" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| format!("rule {name} expects a list of resource kinds"))?;
                for item in items {
                    let slug = item.as_str().unwrap_or_default();
                    if ResourceKind::from_slug(slug).is_none() {
                        return Err(format!("rule {name}: unknown resource kind {item}"));
                    }
                }
            }
            "max_cpu_usage" | "max_memory_usage" if value.as_f64().is_none() => {
                return Err(format!("rule {name} expects a number"));
            }
            _ => {}
        }
    }
    Ok(())
}

fn evaluate_rule(name: &str, value: &Value, kind: ResourceKind, attrs: &Attributes) -> Option<String> {
    match name {
        "human_consent_required" => {
            if kinds_in(value).contains(&kind) && !attr_flag(attrs, "user_consent") {
                return Some(format!("{kind} requires explicit user consent"));
            }
        }
        "encryption_required_for" => {
            if kinds_in(value).contains(&kind) && !attr_flag(attrs, "encrypted") {
                return Some(format!("{kind} requires an encrypted channel"));
            }
        }
        "denied_kinds" => {
            if kinds_in(value).contains(&kind) {
                return Some(format!("{kind} is not permitted under this policy"));
            }
        }
        "max_cpu_usage" => return ceiling(value, kind, attrs, "cpu_usage"),
        "max_memory_usage" => return ceiling(value, kind, attrs, "memory_usage"),
        "experiment_safety_check" => {
            if value.as_bool() == Some(true)
                && kind == ResourceKind::Experimentation
                && attrs
                    .get("risk_level")
                    .and_then(|v| v.as_str())
                    .is_some_and(|r| r.eq_ignore_ascii_case("high"))
            {
                return Some("high-risk experimentation is not permitted".into());
            }
        }
        _ => {}
    }
    None
}

fn ceiling(value: &Value, kind: ResourceKind, attrs: &Attributes, attr: &str) -> Option<String> {
    if kind != ResourceKind::Compute {
        return None;
    }
    let max = value.as_f64()?;
    let requested = attrs.get(attr).and_then(|v| v.as_f64()).unwrap_or(0.0);
    if requested > max {
        Some(format!("requested {attr} {requested} exceeds limit {max}"))
    } else {
        None
    }
}

fn kinds_in(value: &Value) -> Vec<ResourceKind> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(ResourceKind::from_slug)
                .collect()
        })
        .unwrap_or_default()
}

fn attr_flag(attrs: &Attributes, key: &str) -> bool {
    attrs.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eva_protocol::PolicyLevel;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn policy(rules: Value) -> Policy {
        let rules: BTreeMap<String, Value> = serde_json::from_value(rules).unwrap();
        Policy {
            id: "p".into(),
            name: "P".into(),
            description: String::new(),
            level: PolicyLevel::High,
            rules,
            active: true,
        }
    }

    fn attrs(v: Value) -> Attributes {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn consent_rule_only_applies_to_listed_kinds() {
        let p = policy(json!({"human_consent_required": ["device_control"]}));
        assert!(check(&p, ResourceKind::DeviceControl, &Attributes::new()).is_err());
        assert!(check(&p, ResourceKind::DeviceControl, &attrs(json!({"user_consent": true}))).is_ok());
        assert!(check(&p, ResourceKind::Learning, &Attributes::new()).is_ok());
    }

    #[test]
    fn cpu_ceiling_checks_compute_requests() {
        let p = policy(json!({"max_cpu_usage": 80}));
        let breach = check(&p, ResourceKind::Compute, &attrs(json!({"cpu_usage": 95})))
            .expect_err("over the ceiling");
        assert_eq!(breach.rule, "max_cpu_usage");
        assert!(check(&p, ResourceKind::Compute, &attrs(json!({"cpu_usage": 80}))).is_ok());
        assert!(check(&p, ResourceKind::Compute, &Attributes::new()).is_ok());
        assert!(check(&p, ResourceKind::Learning, &attrs(json!({"cpu_usage": 95}))).is_ok());
    }

    #[test]
    fn unknown_rules_are_advisory() {
        let p = policy(json!({"bias_detection": true, "data_retention_limit": 86400}));
        for kind in ResourceKind::ALL {
            assert!(check(&p, kind, &Attributes::new()).is_ok());
        }
    }

    #[test]
    fn validate_flags_malformed_kind_lists() {
        assert!(validate(&policy(json!({"denied_kinds": ["compute", "fs"]}))).is_ok());
        assert!(validate(&policy(json!({"denied_kinds": "compute"}))).is_err());
        assert!(validate(&policy(json!({"human_consent_required": ["warp"]}))).is_err());
        assert!(validate(&policy(json!({"max_cpu_usage": "high"}))).is_err());
    }

    #[test]
    fn high_risk_experimentation_is_refused() {
        let p = policy(json!({"experiment_safety_check": true}));
        assert!(check(
            &p,
            ResourceKind::Experimentation,
            &attrs(json!({"risk_level": "HIGH"}))
        )
        .is_err());
        assert!(check(
            &p,
            ResourceKind::Experimentation,
            &attrs(json!({"risk_level": "low"}))
        )
        .is_ok());
    }
}
