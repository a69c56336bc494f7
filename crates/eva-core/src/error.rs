use eva_knowledge::KnowledgeError;
use eva_policy::PolicyError;

/// Failures that cross the core boundary. Everything else (denials, phase
/// failures, unknown lease ids) is reported as status or data.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("{component} did not report ready")]
    NotReady { component: &'static str },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),
    #[error("orchestrator is already running")]
    AlreadyRunning,
}
