use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use eva_events::Bus;
use eva_policy::PolicyEngine;
use eva_topics::TOPIC_KILLSWITCH_ENGAGED;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{error, info, warn};

/// Emergency stop. Engaged by an explicit activation or automatically once
/// the policy engine has logged `threshold` critical violations since the
/// last reset.
#[derive(Debug)]
pub struct KillSwitch {
    policy: Arc<PolicyEngine>,
    threshold: usize,
    activated: AtomicBool,
    reason: Mutex<Option<String>>,
    critical_baseline: AtomicUsize,
    auto_tripped: AtomicBool,
    bus: Option<Bus>,
}

impl KillSwitch {
    pub fn new(policy: Arc<PolicyEngine>, threshold: usize, bus: Option<Bus>) -> Self {
        Self {
            policy,
            threshold,
            activated: AtomicBool::new(false),
            reason: Mutex::new(None),
            critical_baseline: AtomicUsize::new(0),
            auto_tripped: AtomicBool::new(false),
            bus,
        }
    }

    pub fn activate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(target: "eva::killswitch", %reason, "emergency kill switch activated");
        self.activated.store(true, Ordering::SeqCst);
        *self.reason.lock() = Some(reason.clone());
        if let Some(bus) = &self.bus {
            bus.publish(
                TOPIC_KILLSWITCH_ENGAGED,
                &json!({"reason": reason, "manual": true}),
            );
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    fn critical_since_reset(&self) -> usize {
        self.policy
            .critical_violation_count()
            .saturating_sub(self.critical_baseline.load(Ordering::SeqCst))
    }

    pub fn is_engaged(&self) -> bool {
        if self.is_activated() {
            return true;
        }
        if self.threshold == 0 {
            return false;
        }
        let critical = self.critical_since_reset();
        if critical < self.threshold {
            return false;
        }
        if !self.auto_tripped.swap(true, Ordering::SeqCst) {
            warn!(
                target: "eva::killswitch",
                critical,
                threshold = self.threshold,
                "kill switch engaged by critical policy violations"
            );
        }
        true
    }

    pub fn reason(&self) -> Option<String> {
        if let Some(reason) = self.reason.lock().clone() {
            return Some(reason);
        }
        self.is_engaged().then(|| {
            format!(
                "{} critical policy violations",
                self.critical_since_reset()
            )
        })
    }

    /// Clear an engagement and re-arm. Returns false when not engaged.
    pub fn reset(&self) -> bool {
        if !self.is_engaged() {
            warn!(target: "eva::killswitch", "kill switch reset requested while not engaged");
            return false;
        }
        self.activated.store(false, Ordering::SeqCst);
        *self.reason.lock() = None;
        self.auto_tripped.store(false, Ordering::SeqCst);
        self.critical_baseline
            .store(self.policy.critical_violation_count(), Ordering::SeqCst);
        info!(target: "eva::killswitch", "kill switch reset and re-armed");
        true
    }
}
