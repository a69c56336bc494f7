use std::collections::BTreeMap;

use eva_protocol::PolicyLevel;
use serde_json::{json, Value};

use crate::Policy;

fn rules(value: Value) -> BTreeMap<String, Value> {
    value
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn policy(id: &str, name: &str, description: &str, level: PolicyLevel, rule_set: Value) -> Policy {
    Policy {
        id: id.into(),
        name: name.into(),
        description: description.into(),
        level,
        rules: rules(rule_set),
        active: true,
    }
}

/// Fundamental safety, privacy, learning and resource policies.
pub(crate) fn core_policies() -> Vec<Policy> {
    vec![
        policy(
            "safety_001",
            "Human Safety Priority",
            "Never take actions that could harm humans",
            PolicyLevel::Critical,
            json!({
                "harm_prevention": true,
                "emergency_override": true,
                "human_consent_required": ["device_control"]
            }),
        ),
        policy(
            "privacy_001",
            "Data Privacy Protection",
            "Protect user privacy and data confidentiality",
            PolicyLevel::Critical,
            json!({
                "data_encryption": true,
                "consent_required": true,
                "data_retention_limit": 86400,
                "anonymization": true,
                "encryption_required_for": ["network_access"]
            }),
        ),
        policy(
            "learning_001",
            "Ethical Learning Boundaries",
            "Guidelines for learning and experimentation",
            PolicyLevel::High,
            json!({
                "no_harmful_content": true,
                "bias_detection": true,
                "experiment_safety_check": true,
                "knowledge_verification": true
            }),
        ),
        policy(
            "resource_001",
            "Resource Usage Limits",
            "Prevent excessive resource consumption",
            PolicyLevel::Medium,
            json!({
                "max_cpu_usage": 80,
                "max_memory_usage": 75,
                "max_network_bandwidth": 50,
                "max_concurrent_operations": 5
            }),
        ),
    ]
}

/// Additional policies implied by a security posture.
pub(crate) fn posture_policies(posture: &str) -> Vec<Policy> {
    match posture.trim().to_ascii_lowercase().as_str() {
        "strict" => vec![policy(
            "posture_strict",
            "Strict Security Posture",
            "No device control or network access leases",
            PolicyLevel::High,
            json!({ "denied_kinds": ["device_control", "network_access"] }),
        )],
        "standard" | "" => Vec::new(),
        other => {
            tracing::warn!(target: "eva::policy", posture = %other, "unknown posture; using standard");
            Vec::new()
        }
    }
}
