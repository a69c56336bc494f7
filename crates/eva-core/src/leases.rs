//! Time-bounded resource leases.
//!
//! The active table, the archive and the grant counter sit behind one async
//! mutex so that the ceiling check and the insert, and the expiry scan and
//! the revocations, are each a single critical section. Validity uses the
//! monotonic tokio clock; wall-clock timestamps are kept for reporting.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eva_events::Bus;
use eva_policy::PolicyEngine;
use eva_protocol::{Attributes, Experiment, ResourceKind};
use eva_topics as topics;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::tasks::TaskHandle;

pub type LeaseId = String;

const MONITOR_GRACE: Duration = Duration::from_secs(1);
const MAX_LEASE_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub id: LeaseId,
    pub kind: ResourceKind,
    pub attributes: Attributes,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    #[serde(skip)]
    granted_instant: Instant,
    #[serde(skip)]
    expires_instant: Instant,
}

impl Lease {
    pub fn duration(&self) -> Duration {
        self.expires_instant - self.granted_instant
    }

    pub fn expires_instant(&self) -> Instant {
        self.expires_instant
    }

    /// Valid iff active and `now` is before expiry.
    pub fn is_valid_at(&self, now: Instant) -> bool {
        self.active && now < self.expires_instant
    }

    pub fn remaining(&self) -> Duration {
        self.expires_instant.saturating_duration_since(Instant::now())
    }
}

/// Anything that may need a lease before it runs.
pub trait LeaseRequirement {
    fn required_resource(&self) -> Option<ResourceKind>;

    fn lease_attributes(&self) -> Attributes {
        Attributes::new()
    }
}

impl LeaseRequirement for Experiment {
    fn required_resource(&self) -> Option<ResourceKind> {
        self.required_resource
    }

    fn lease_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("experiment_id".into(), Value::from(self.id.clone()));
        attrs.insert("experiment_kind".into(), Value::from(self.kind.as_str()));
        attrs.insert("risk_level".into(), Value::from(self.risk_level.as_str()));
        attrs
    }
}

impl LeaseRequirement for Option<ResourceKind> {
    fn required_resource(&self) -> Option<ResourceKind> {
        *self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseStatus {
    pub active_leases: usize,
    pub total_granted: u64,
    pub active_kinds: Vec<ResourceKind>,
    pub max_concurrent: usize,
    pub utilization_rate: f64,
}

#[derive(Debug, Default)]
struct LeaseTable {
    active: HashMap<LeaseId, Lease>,
    history: VecDeque<Lease>,
    total_granted: u64,
}

impl LeaseTable {
    fn archive(&mut self, mut lease: Lease, limit: usize) {
        lease.active = false;
        self.history.push_back(lease);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct LeaseManager {
    cfg: LeaseConfig,
    policy: Arc<PolicyEngine>,
    bus: Option<Bus>,
    table: Mutex<LeaseTable>,
    seq: AtomicU64,
    monitor: parking_lot::Mutex<Option<TaskHandle>>,
    monitor_shutdown: Arc<Notify>,
    stop_flag: Arc<AtomicBool>,
}

impl LeaseManager {
    pub fn new(cfg: LeaseConfig, policy: Arc<PolicyEngine>, bus: Option<Bus>) -> Self {
        Self {
            cfg,
            policy,
            bus,
            table: Mutex::new(LeaseTable::default()),
            seq: AtomicU64::new(0),
            monitor: parking_lot::Mutex::new(None),
            monitor_shutdown: Arc::new(Notify::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.cfg
    }

    /// Start the expiry monitor. Calling it again while the monitor runs is
    /// a no-op.
    pub fn initialize(self: &Arc<Self>) {
        let mut slot = self.monitor.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.cfg.sweep_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let stop = self.stop_flag.clone();
        let shutdown = self.monitor_shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let notified = shutdown.notified();
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notified => {
                        continue;
                    }
                }
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                // Only held for the sweep itself.
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep_expired().await;
            }
            debug!(target: "eva::leases", "lease expiry monitor stopped");
        });
        *slot = Some(TaskHandle::new("leases.expiry_monitor", handle));
        info!(
            target: "eva::leases",
            max_concurrent = self.cfg.max_concurrent,
            sweep_secs = period.as_secs(),
            "lease manager initialized"
        );
    }

    pub fn is_ready(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn next_id(&self) -> LeaseId {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("lease-{}-{seq}", Utc::now().timestamp_millis())
    }

    fn publish(&self, topic: &str, payload: Value) {
        if let Some(bus) = &self.bus {
            bus.publish(topic, &payload);
        }
    }

    /// Grant a lease unless a policy objects or the ceiling is reached.
    /// Denial is reported as `None`.
    pub async fn request_lease(
        &self,
        kind: ResourceKind,
        duration: Option<Duration>,
        attributes: Attributes,
    ) -> Option<LeaseId> {
        if !self.policy.can_grant_lease(kind, &attributes) {
            warn!(target: "eva::leases", kind = %kind, "lease denied by policy");
            self.publish(
                topics::TOPIC_LEASE_DENIED,
                json!({"kind": kind, "reason": "policy"}),
            );
            return None;
        }

        let mut table = self.table.lock().await;
        if self.stop_flag.load(Ordering::SeqCst) {
            drop(table);
            debug!(target: "eva::leases", kind = %kind, "lease denied: manager shut down");
            self.publish(
                topics::TOPIC_LEASE_DENIED,
                json!({"kind": kind, "reason": "shutdown"}),
            );
            return None;
        }
        if table.active.len() >= self.cfg.max_concurrent {
            warn!(
                target: "eva::leases",
                kind = %kind,
                active = table.active.len(),
                max = self.cfg.max_concurrent,
                "lease denied: concurrency ceiling reached"
            );
            drop(table);
            self.publish(
                topics::TOPIC_LEASE_DENIED,
                json!({"kind": kind, "reason": "capacity"}),
            );
            return None;
        }

        let duration = duration
            .unwrap_or_else(|| self.cfg.default_duration())
            .clamp(Duration::from_millis(1), MAX_LEASE_DURATION);
        let granted_instant = Instant::now();
        let granted_at = Utc::now();
        let expires_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| granted_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let id = self.next_id();
        let lease = Lease {
            id: id.clone(),
            kind,
            attributes,
            granted_at,
            expires_at,
            active: true,
            granted_instant,
            expires_instant: granted_instant + duration,
        };
        table.active.insert(id.clone(), lease);
        table.total_granted += 1;
        drop(table);

        info!(
            target: "eva::leases",
            lease_id = %id,
            kind = %kind,
            duration_secs = duration.as_secs_f64(),
            "lease granted"
        );
        self.publish(
            topics::TOPIC_LEASE_GRANTED,
            json!({"id": id, "kind": kind, "duration_ms": duration.as_millis() as u64}),
        );
        Some(id)
    }

    /// True when `op` needs no lease, already holds a valid one of its kind,
    /// or a single new request for that kind succeeds.
    pub async fn can_execute<O>(&self, op: &O) -> bool
    where
        O: LeaseRequirement + ?Sized,
    {
        let Some(kind) = op.required_resource() else {
            return true;
        };
        if self.has_valid_lease(kind).await {
            return true;
        }
        self.request_lease(kind, None, op.lease_attributes())
            .await
            .is_some()
    }

    pub async fn has_valid_lease(&self, kind: ResourceKind) -> bool {
        let now = Instant::now();
        self.table
            .lock()
            .await
            .active
            .values()
            .any(|lease| lease.kind == kind && lease.is_valid_at(now))
    }

    pub async fn is_lease_valid(&self, id: &str) -> bool {
        let now = Instant::now();
        self.table
            .lock()
            .await
            .active
            .get(id)
            .is_some_and(|lease| lease.is_valid_at(now))
    }

    pub async fn lease(&self, id: &str) -> Option<Lease> {
        self.table.lock().await.active.get(id).cloned()
    }

    /// Revoke one lease. Unknown or already revoked ids return false.
    pub async fn revoke_lease(&self, id: &str) -> bool {
        let mut table = self.table.lock().await;
        let Some(lease) = table.active.remove(id) else {
            return false;
        };
        let kind = lease.kind;
        table.archive(lease, self.cfg.history_limit);
        drop(table);
        info!(target: "eva::leases", lease_id = %id, kind = %kind, "lease revoked");
        self.publish(topics::TOPIC_LEASE_REVOKED, json!({"id": id, "kind": kind}));
        true
    }

    pub async fn revoke_all(&self) -> usize {
        let mut table = self.table.lock().await;
        let ids: Vec<LeaseId> = table.active.keys().cloned().collect();
        for id in &ids {
            if let Some(lease) = table.active.remove(id) {
                table.archive(lease, self.cfg.history_limit);
            }
        }
        drop(table);
        if !ids.is_empty() {
            warn!(target: "eva::leases", count = ids.len(), "all leases revoked");
            for id in &ids {
                self.publish(topics::TOPIC_LEASE_REVOKED, json!({"id": id}));
            }
        }
        ids.len()
    }

    /// One expiry pass: archive every lease whose expiry has been reached.
    pub async fn sweep_expired(&self) -> Vec<LeaseId> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        let expired: Vec<LeaseId> = table
            .active
            .values()
            .filter(|lease| lease.expires_instant <= now)
            .map(|lease| lease.id.clone())
            .collect();
        for id in &expired {
            if let Some(lease) = table.active.remove(id) {
                table.archive(lease, self.cfg.history_limit);
            }
        }
        drop(table);
        for id in &expired {
            info!(target: "eva::leases", lease_id = %id, "lease expired");
            self.publish(topics::TOPIC_LEASE_EXPIRED, json!({"id": id}));
        }
        expired
    }

    /// Read-only summary.
    pub async fn lease_status(&self) -> LeaseStatus {
        let table = self.table.lock().await;
        let mut active_kinds: Vec<ResourceKind> =
            table.active.values().map(|lease| lease.kind).collect();
        active_kinds.sort();
        active_kinds.dedup();
        let active_leases = table.active.len();
        let utilization_rate = if self.cfg.max_concurrent == 0 {
            0.0
        } else {
            active_leases as f64 / self.cfg.max_concurrent as f64
        };
        LeaseStatus {
            active_leases,
            total_granted: table.total_granted,
            active_kinds,
            max_concurrent: self.cfg.max_concurrent,
            utilization_rate,
        }
    }

    pub async fn active_leases(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.table.lock().await.active.values().cloned().collect();
        leases.sort_by_key(|lease| lease.granted_instant);
        leases
    }

    /// Up to `limit` most recently archived leases, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<Lease> {
        let table = self.table.lock().await;
        let skip = table.history.len().saturating_sub(limit);
        table.history.iter().skip(skip).cloned().collect()
    }

    /// Stop and join the expiry monitor, then revoke every lease.
    pub async fn shutdown(&self) {
        info!(target: "eva::leases", "shutting down lease manager");
        self.stop_flag.store(true, Ordering::SeqCst);
        self.monitor_shutdown.notify_waiters();
        let task = self.monitor.lock().take();
        if let Some(task) = task {
            if !task.shutdown_with_grace(MONITOR_GRACE).await {
                debug!(target: "eva::leases", "expiry monitor aborted");
            }
        }
        self.revoke_all().await;
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.monitor_shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eva_protocol::{ExperimentKind, RiskLevel};
    use serde_json::json;

    fn manager(max: usize) -> Arc<LeaseManager> {
        let policy = PolicyEngine::default();
        policy.initialize().unwrap();
        let cfg = LeaseConfig {
            max_concurrent: max,
            ..Default::default()
        };
        Arc::new(LeaseManager::new(cfg, Arc::new(policy), None))
    }

    #[tokio::test(start_paused = true)]
    async fn learning_lease_uses_default_duration() {
        let leases = manager(10);
        let id = leases
            .request_lease(ResourceKind::Learning, None, Attributes::new())
            .await
            .expect("granted");
        assert!(id.starts_with("lease-"));
        let lease = leases.lease(&id).await.unwrap();
        assert_eq!(lease.duration(), Duration::from_secs(300));
        assert_eq!(lease.expires_at - lease.granted_at, chrono::Duration::seconds(300));
        assert!(leases.is_lease_valid(&id).await);
    }

    #[tokio::test]
    async fn ids_are_unique_within_a_millisecond() {
        let leases = manager(10);
        let a = leases
            .request_lease(ResourceKind::Compute, None, Attributes::new())
            .await
            .unwrap();
        let b = leases
            .request_lease(ResourceKind::Compute, None, Attributes::new())
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn revoke_is_one_way() {
        let leases = manager(10);
        let id = leases
            .request_lease(ResourceKind::Learning, None, Attributes::new())
            .await
            .unwrap();
        assert!(leases.revoke_lease(&id).await);
        assert!(!leases.revoke_lease(&id).await);
        assert!(!leases.revoke_lease("lease-unknown").await);
        assert!(!leases.is_lease_valid(&id).await);
        let history = leases.history(10).await;
        assert_eq!(history.len(), 1);
        assert!(!history[0].active);
    }

    #[tokio::test]
    async fn ceiling_denies_extra_requests() {
        let leases = manager(2);
        for _ in 0..2 {
            assert!(leases
                .request_lease(ResourceKind::Learning, None, Attributes::new())
                .await
                .is_some());
        }
        assert!(leases
            .request_lease(ResourceKind::Learning, None, Attributes::new())
            .await
            .is_none());
        let status = leases.lease_status().await;
        assert_eq!(status.active_leases, 2);
        assert_eq!(status.total_granted, 2);
        assert_eq!(status.utilization_rate, 1.0);
        assert_eq!(status.active_kinds, vec![ResourceKind::Learning]);
    }

    #[tokio::test]
    async fn policy_denial_grants_nothing() {
        let leases = manager(10);
        assert!(leases
            .request_lease(ResourceKind::DeviceControl, None, Attributes::new())
            .await
            .is_none());
        let mut consent = Attributes::new();
        consent.insert("user_consent".into(), json!(true));
        assert!(leases
            .request_lease(ResourceKind::DeviceControl, None, consent)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn can_execute_reuses_existing_lease() {
        let leases = manager(10);
        let exp = Experiment {
            id: "exp_001".into(),
            kind: ExperimentKind::PatternRecognition,
            description: String::new(),
            risk_level: RiskLevel::Low,
            required_resource: Some(ResourceKind::Compute),
        };
        assert!(leases.can_execute(&exp).await);
        assert!(leases.can_execute(&exp).await);
        assert_eq!(leases.lease_status().await.total_granted, 1);
        assert!(leases.can_execute(&None::<ResourceKind>).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_archives_expired_leases() {
        let leases = manager(10);
        let short = leases
            .request_lease(
                ResourceKind::Compute,
                Some(Duration::from_secs(5)),
                Attributes::new(),
            )
            .await
            .unwrap();
        let long = leases
            .request_lease(ResourceKind::Learning, None, Attributes::new())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!leases.is_lease_valid(&short).await);
        assert_eq!(leases.sweep_expired().await, vec![short]);
        assert!(leases.is_lease_valid(&long).await);
        assert_eq!(leases.lease_status().await.active_leases, 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let policy = PolicyEngine::default();
        policy.initialize().unwrap();
        let cfg = LeaseConfig {
            history_limit: 2,
            ..Default::default()
        };
        let leases = LeaseManager::new(cfg, Arc::new(policy), None);
        for _ in 0..3 {
            leases
                .request_lease(ResourceKind::Learning, None, Attributes::new())
                .await
                .unwrap();
        }
        assert_eq!(leases.revoke_all().await, 3);
        assert_eq!(leases.history(10).await.len(), 2);
        assert_eq!(leases.history(1).await.len(), 1);
    }

    #[tokio::test]
    async fn events_are_published() {
        let policy = PolicyEngine::default();
        policy.initialize().unwrap();
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let leases = LeaseManager::new(LeaseConfig::default(), Arc::new(policy), Some(bus));
        let id = leases
            .request_lease(ResourceKind::Learning, None, Attributes::new())
            .await
            .unwrap();
        leases.revoke_lease(&id).await;
        let granted = rx.recv().await.unwrap();
        assert_eq!(granted.kind, topics::TOPIC_LEASE_GRANTED);
        assert_eq!(granted.payload["id"], id.as_str());
        assert_eq!(rx.recv().await.unwrap().kind, topics::TOPIC_LEASE_REVOKED);
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_refused() {
        let leases = manager(10);
        leases.initialize();
        leases.shutdown().await;
        assert!(leases
            .request_lease(ResourceKind::Learning, None, Attributes::new())
            .await
            .is_none());
        assert!(!leases.can_execute(&Some(ResourceKind::Compute)).await);
        let status = leases.lease_status().await;
        assert_eq!(status.active_leases, 0);
        assert_eq!(status.total_granted, 0);

        leases.initialize();
        assert!(leases
            .request_lease(ResourceKind::Learning, None, Attributes::new())
            .await
            .is_some());
        leases.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_monitor_does_not_keep_the_manager_alive() {
        let leases = manager(10);
        leases.initialize();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let weak = Arc::downgrade(&leases);
        drop(leases);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(weak.upgrade().is_none());
    }
}
