use eva_protocol::{Experiment, ExperimentKind, Insights, ResourceKind, RiskLevel};

/// Deterministically derive candidate experiments from a cycle's insights.
///
/// Two baseline experiments are always proposed; the rest depend on which
/// insight lists are populated. Order is stable so filtering preserves it.
pub(crate) fn candidates(insights: &Insights) -> Vec<Experiment> {
    let mut out = vec![
        Experiment {
            id: "exp_001".into(),
            kind: ExperimentKind::PatternRecognition,
            description: "Test new pattern recognition algorithm".into(),
            risk_level: RiskLevel::Low,
            required_resource: Some(ResourceKind::Compute),
        },
        Experiment {
            id: "exp_002".into(),
            kind: ExperimentKind::Optimization,
            description: "Optimize response generation".into(),
            risk_level: RiskLevel::Low,
            required_resource: Some(ResourceKind::Compute),
        },
    ];

    if let Some(pattern) = insights.patterns.first() {
        out.push(Experiment {
            id: "exp_003".into(),
            kind: ExperimentKind::PatternReinforcement,
            description: format!("Reinforce knowledge around {}", pattern.subject),
            risk_level: RiskLevel::Medium,
            required_resource: Some(ResourceKind::Learning),
        });
    }

    if let Some(anomaly) = insights.anomalies.first() {
        out.push(Experiment {
            id: "exp_004".into(),
            kind: ExperimentKind::SystemModification,
            description: format!("Mitigate anomaly: {}", anomaly.description),
            risk_level: RiskLevel::High,
            required_resource: Some(ResourceKind::DeviceControl),
        });
    }

    if !insights.recommendations.is_empty() {
        out.push(Experiment {
            id: "exp_005".into(),
            kind: ExperimentKind::ExternalCommunication,
            description: "Pull additional data sources from external services".into(),
            risk_level: RiskLevel::Medium,
            required_resource: Some(ResourceKind::NetworkAccess),
        });
    }

    out
}

pub(crate) fn is_safe(experiment: &Experiment, disallowed: &[ExperimentKind]) -> bool {
    if experiment.risk_level == RiskLevel::High {
        return false;
    }
    !disallowed.contains(&experiment.kind)
}
