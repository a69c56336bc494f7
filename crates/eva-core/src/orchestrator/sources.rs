//! Perception data sources polled at the start of every cycle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use eva_policy::PolicyEngine;
use eva_protocol::{CATEGORY_ENVIRONMENTAL, CATEGORY_SYSTEM_METRICS, CATEGORY_USER_INTERACTIONS};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sysinfo::{Networks, ProcessesToUpdate, System};

const RECENT_COMMANDS: usize = 20;
const NETWORK_ACTIVE_BYTES: u64 = 1024;

#[async_trait]
pub trait PerceptionSource: Send + Sync {
    /// Snapshot key this source fills.
    fn category(&self) -> &str;

    async fn collect(&self) -> Result<Value>;
}

/// Host CPU, memory, process and network activity via `sysinfo`.
pub struct SystemMetricsSource {
    probe: Mutex<(System, Networks)>,
}

impl SystemMetricsSource {
    pub fn new() -> Self {
        Self {
            probe: Mutex::new((System::new_all(), Networks::new_with_refreshed_list())),
        }
    }
}

impl Default for SystemMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PerceptionSource for SystemMetricsSource {
    fn category(&self) -> &str {
        CATEGORY_SYSTEM_METRICS
    }

    async fn collect(&self) -> Result<Value> {
        let mut guard = self.probe.lock();
        let (sys, networks) = &mut *guard;
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        networks.refresh(true);

        let per_core: Vec<f64> = sys.cpus().iter().map(|c| c.cpu_usage() as f64).collect();
        let cpu_usage = if per_core.is_empty() {
            0.0
        } else {
            per_core.iter().sum::<f64>() / per_core.len() as f64
        };
        let total_mem = sys.total_memory();
        let used_mem = total_mem.saturating_sub(sys.available_memory());
        let memory_usage = if total_mem == 0 {
            0.0
        } else {
            used_mem as f64 * 100.0 / total_mem as f64
        };
        let traffic: u64 = networks
            .list()
            .values()
            .map(|data| data.received() + data.transmitted())
            .sum();
        let network_activity = if traffic >= NETWORK_ACTIVE_BYTES {
            "active"
        } else {
            "idle"
        };

        Ok(json!({
            "cpu_usage": cpu_usage,
            "memory_usage": memory_usage,
            "active_processes": sys.processes().len(),
            "network_activity": network_activity,
        }))
    }
}

#[derive(Debug, Default)]
struct InteractionState {
    active_sessions: u64,
    recent_commands: VecDeque<String>,
    preferences: BTreeMap<String, Value>,
}

/// Cloneable handle hosts use to record user activity.
#[derive(Debug, Clone, Default)]
pub struct InteractionTracker {
    inner: Arc<Mutex<InteractionState>>,
}

impl InteractionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.inner.lock().active_sessions += 1;
    }

    pub fn session_ended(&self) {
        let mut state = self.inner.lock();
        state.active_sessions = state.active_sessions.saturating_sub(1);
    }

    pub fn record_command(&self, command: impl Into<String>) {
        let mut state = self.inner.lock();
        state.recent_commands.push_back(command.into());
        while state.recent_commands.len() > RECENT_COMMANDS {
            state.recent_commands.pop_front();
        }
    }

    pub fn set_preference(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().preferences.insert(key.into(), value);
    }

    fn snapshot(&self) -> Value {
        let state = self.inner.lock();
        json!({
            "active_sessions": state.active_sessions,
            "recent_commands": state.recent_commands.iter().collect::<Vec<_>>(),
            "user_preferences": state.preferences,
        })
    }
}

pub struct UserInteractionSource {
    tracker: InteractionTracker,
}

impl UserInteractionSource {
    pub fn new(tracker: InteractionTracker) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl PerceptionSource for UserInteractionSource {
    fn category(&self) -> &str {
        CATEGORY_USER_INTERACTIONS
    }

    async fn collect(&self) -> Result<Value> {
        Ok(self.tracker.snapshot())
    }
}

/// Time of day, host load, external API availability and security posture.
pub struct EnvironmentalSource {
    policy: Option<Arc<PolicyEngine>>,
    external_apis: String,
}

impl EnvironmentalSource {
    pub fn new(policy: Option<Arc<PolicyEngine>>) -> Self {
        Self {
            policy,
            external_apis: "unknown".into(),
        }
    }

    pub fn with_external_apis(mut self, label: impl Into<String>) -> Self {
        self.external_apis = label.into();
        self
    }

    fn load_label() -> &'static str {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        let ratio = System::load_average().one / cores;
        if ratio < 0.3 {
            "idle"
        } else if ratio < 0.7 {
            "moderate"
        } else {
            "high"
        }
    }

    fn security_label(&self) -> &'static str {
        match &self.policy {
            None => "unknown",
            Some(policy) if !policy.enforcement_active() => "fail_open",
            Some(policy) if policy.critical_violation_count() > 0 => "alert",
            Some(_) => "enforced",
        }
    }
}

#[async_trait]
impl PerceptionSource for EnvironmentalSource {
    fn category(&self) -> &str {
        CATEGORY_ENVIRONMENTAL
    }

    async fn collect(&self) -> Result<Value> {
        Ok(json!({
            "time_of_day": chrono::Local::now().format("%H:%M:%S").to_string(),
            "system_load": Self::load_label(),
            "external_apis": self.external_apis,
            "security_status": self.security_label(),
        }))
    }
}

/// A source that always reports the same value.
pub struct FixedSource {
    category: String,
    value: Value,
}

impl FixedSource {
    pub fn new(category: impl Into<String>, value: Value) -> Self {
        Self {
            category: category.into(),
            value,
        }
    }
}

#[async_trait]
impl PerceptionSource for FixedSource {
    fn category(&self) -> &str {
        &self.category
    }

    async fn collect(&self) -> Result<Value> {
        Ok(self.value.clone())
    }
}
