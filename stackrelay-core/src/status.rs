//! Read-model types reported to the status tool

use crate::{Priority, Timestamp, TransportMode};
use serde::{Deserialize, Serialize};

/// Most recently observed quota state for one transport mode.
///
/// Written only by the dispatcher after each upstream response; everything
/// else reads a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    /// Which transport produced this snapshot.
    pub mode: TransportMode,
    /// Remaining calls reported by the upstream, unknown before the first
    /// response.
    pub remaining: Option<u32>,
    /// When the upstream says the quota window resets.
    pub reset_at: Option<Timestamp>,
    /// Server-directed backoff deadline, if one is active.
    pub backoff_until: Option<Timestamp>,
}

impl RateLimitSnapshot {
    /// Empty snapshot for a mode that has not been used yet.
    pub fn unknown(mode: TransportMode) -> Self {
        Self {
            mode,
            remaining: None,
            reset_at: None,
            backoff_until: None,
        }
    }

    /// Whether a server-directed backoff window is still open.
    pub fn is_backing_off(&self, now: Timestamp) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Whether the known remaining quota has dropped below a threshold.
    pub fn below_low_water(&self, threshold: u32) -> bool {
        self.remaining.is_some_and(|left| left < threshold)
    }

    /// Whether the quota window has rolled over since this snapshot.
    pub fn reset_has_passed(&self, now: Timestamp) -> bool {
        self.reset_at.is_some_and(|reset| now >= reset)
    }
}

/// Credential configuration and validation state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStatus {
    /// Whether a non-empty key was supplied at construction.
    pub configured: bool,
    /// Whether a validation probe has run.
    pub validated: bool,
    /// Probe outcome, `None` until tested.
    pub valid: Option<bool>,
    /// Daily quota ceiling reported by the probe.
    pub quota_max: Option<u32>,
    /// Remaining daily quota reported by the probe.
    pub quota_remaining: Option<u32>,
    /// When the probe last ran.
    pub last_validated_at: Option<Timestamp>,
    /// Most recent validation failure, if any.
    pub last_error: Option<String>,
}

/// Point-in-time view of the dispatch layer, consumed by an out-of-scope
/// status-reporting tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Pending entry count per priority band, indexed by `Priority::index`.
    pub pending_by_priority: [usize; 4],
    /// Entries currently being executed by a worker.
    pub in_flight: usize,
    /// Entries waiting out a retry delay.
    pub backing_off: usize,
    /// Requests resolved since construction (success or terminal failure).
    pub completed: u64,
    /// Cache lookups answered without an upstream call.
    pub cache_hits: u64,
    /// Cache lookups that fell through to the queue.
    pub cache_misses: u64,
    /// Live entries in the result cache.
    pub cache_entries: usize,
    /// Mode the selector would pick for the next call.
    pub current_access_mode: TransportMode,
    /// Remaining quota for the current mode, if known.
    pub quota_remaining: Option<u32>,
    /// Credential state (§ authentication status tool).
    pub credentials: CredentialStatus,
}

impl StatusSnapshot {
    /// Pending entries in one priority band.
    pub fn pending(&self, priority: Priority) -> usize {
        self.pending_by_priority[priority.index()]
    }

    /// Pending entries across all bands.
    pub fn total_pending(&self) -> usize {
        self.pending_by_priority.iter().sum()
    }
}

// =============================================================================
// TESTS
// =============================================================================
