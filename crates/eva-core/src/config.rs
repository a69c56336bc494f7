use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use eva_knowledge::FusionParams;
use eva_policy::PolicyConfig;
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::CoreError;

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub leases: LeaseConfig,
    #[serde(default)]
    pub knowledge: FusionParams,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub killswitch: KillSwitchConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct LeaseConfig {
    /// Ceiling on simultaneously active leases.
    pub max_concurrent: usize,
    pub default_duration_secs: u64,
    /// Expiry monitor cadence.
    pub sweep_interval_secs: u64,
    /// Archived leases kept for inspection.
    pub history_limit: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_duration_secs: 300,
            sweep_interval_secs: 10,
            history_limit: 1024,
        }
    }
}

impl LeaseConfig {
    pub fn default_duration(&self) -> Duration {
        Duration::from_secs(self.default_duration_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CycleConfig {
    pub target_interval_ms: u64,
    /// Floor for the pacing sleep between cycles.
    pub min_interval_ms: u64,
    /// Pause spent in the error state before resuming.
    pub recovery_secs: u64,
    pub archive_limit: usize,
    /// Latency of the simulated experiment executor.
    pub experiment_latency_ms: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            target_interval_ms: 1000,
            min_interval_ms: 100,
            recovery_secs: 5,
            archive_limit: 256,
            experiment_latency_ms: 100,
        }
    }
}

impl CycleConfig {
    pub fn target_interval(&self) -> Duration {
        Duration::from_millis(self.target_interval_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn recovery_pause(&self) -> Duration {
        Duration::from_secs(self.recovery_secs)
    }

    pub fn experiment_latency(&self) -> Duration {
        Duration::from_millis(self.experiment_latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Critical policy violations that engage the switch automatically.
    pub critical_violation_threshold: usize,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            critical_violation_threshold: 3,
        }
    }
}

impl Config {
    /// Apply `EVA_*` environment overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("EVA_MAX_LEASES") {
            self.leases.max_concurrent = v;
        }
        if let Some(v) = env_parse("EVA_LEASE_DEFAULT_SECS") {
            self.leases.default_duration_secs = v;
        }
        if let Some(v) = env_parse("EVA_LEASE_SWEEP_SECS") {
            self.leases.sweep_interval_secs = v;
        }
        if let Some(v) = env_parse("EVA_CYCLE_TARGET_MS") {
            self.cycle.target_interval_ms = v;
        }
        if let Some(v) = env_parse("EVA_CYCLE_MIN_MS") {
            self.cycle.min_interval_ms = v;
        }
        if let Some(v) = env_parse("EVA_RECOVERY_SECS") {
            self.cycle.recovery_secs = v;
        }
        if let Ok(posture) = std::env::var("EVA_POLICY_POSTURE") {
            let posture = posture.trim();
            if !posture.is_empty() {
                self.policy.posture = posture.to_string();
            }
        }
    }

    /// Cross-field checks the schema cannot express.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.leases.default_duration_secs == 0 {
            return Err(CoreError::Config(
                "leases.default_duration_secs must be positive".into(),
            ));
        }
        if self.cycle.min_interval_ms > self.cycle.target_interval_ms {
            return Err(CoreError::Config(format!(
                "cycle.min_interval_ms ({}) exceeds cycle.target_interval_ms ({})",
                self.cycle.min_interval_ms, self.cycle.target_interval_ms
            )));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

static CONFIG_SCHEMA: Lazy<Result<Validator, String>> = Lazy::new(|| {
    validator_for(&config_schema_json()).map_err(|e| e.to_string())
});

/// JSON schema describing the configuration file.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).unwrap_or_default()
}

pub fn write_schema_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

/// Read a TOML config, validate it against the schema, then deserialize.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let raw: toml::Value = toml::from_str(&content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validator = CONFIG_SCHEMA
        .as_ref()
        .map_err(|e| anyhow::anyhow!("config schema unavailable: {e}"))?;
    let validation_errors: Vec<_> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(&content)?;
    Ok(cfg)
}
