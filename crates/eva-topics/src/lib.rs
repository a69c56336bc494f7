//! Canonical event topic constants shared across the core crates.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Cycle / orchestrator
pub const TOPIC_CYCLE_COMPLETED: &str = "cycle.completed";
pub const TOPIC_CYCLE_FAILED: &str = "cycle.failed";
pub const TOPIC_ORCHESTRATOR_STATE_CHANGED: &str = "orchestrator.state.changed";

// Leases
pub const TOPIC_LEASE_DENIED: &str = "lease.denied";
pub const TOPIC_LEASE_EXPIRED: &str = "lease.expired";
pub const TOPIC_LEASE_GRANTED: &str = "lease.granted";
pub const TOPIC_LEASE_REVOKED: &str = "lease.revoked";

// Safety
pub const TOPIC_KILLSWITCH_ENGAGED: &str = "killswitch.engaged";
