//! Quota bookkeeping for both transport modes

use chrono::Duration as ChronoDuration;
use stackrelay_core::{RateLimitSnapshot, Timestamp, TransportMode};
use std::sync::RwLock;
use std::time::Duration;

/// Quota metadata extracted from one upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaUpdate {
    /// Remaining calls, from headers or the response envelope.
    pub remaining: Option<u32>,
    /// Quota window reset time, when reported.
    pub reset_at: Option<Timestamp>,
    /// Server-directed pause before the next call, when reported.
    pub backoff: Option<Duration>,
}

struct ModeState {
    snapshot: RateLimitSnapshot,
    /// Next penalty window to apply when the server rate-limits us without
    /// saying for how long. Doubles on every consecutive rate limit.
    penalty: Duration,
}

const INITIAL_PENALTY: Duration = Duration::from_secs(1);
const MAX_PENALTY: Duration = Duration::from_secs(300);

/// Holds the most recently observed quota snapshot per transport mode.
///
/// Written only by dispatch workers immediately after an upstream response;
/// the access-mode selector reads copies. One lock per resource keeps quota
/// updates from racing each other.
pub struct RateLimitTracker {
    modes: [RwLock<ModeState>; 2],
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            modes: [
                RwLock::new(ModeState {
                    snapshot: RateLimitSnapshot::unknown(TransportMode::Authenticated),
                    penalty: INITIAL_PENALTY,
                }),
                RwLock::new(ModeState {
                    snapshot: RateLimitSnapshot::unknown(TransportMode::Unauthenticated),
                    penalty: INITIAL_PENALTY,
                }),
            ],
        }
    }

    /// Copy of the current snapshot for a mode.
    pub fn snapshot(&self, mode: TransportMode) -> RateLimitSnapshot {
        self.modes[mode.index()]
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot
            .clone()
    }

    /// Record quota metadata from a successful response. Clears any penalty
    /// window and resets the doubling schedule.
    pub fn record_success(&self, mode: TransportMode, update: &QuotaUpdate, now: Timestamp) {
        let mut state = self.modes[mode.index()]
            .write()
            .unwrap_or_else(|e| e.into_inner());

        if update.remaining.is_some() {
            state.snapshot.remaining = update.remaining;
        }
        if update.reset_at.is_some() {
            state.snapshot.reset_at = update.reset_at;
        }
        // A success can still carry a server-directed backoff; honor it.
        state.snapshot.backoff_until = update
            .backoff
            .and_then(|b| ChronoDuration::from_std(b).ok())
            .map(|b| now + b);
        state.penalty = INITIAL_PENALTY;
    }

    /// Record a rate-limit rejection. The server's own backoff wins when
    /// present; otherwise the penalty window is applied and doubled for the
    /// next occurrence.
    pub fn record_rate_limited(
        &self,
        mode: TransportMode,
        server_backoff: Option<Duration>,
        now: Timestamp,
    ) {
        let mut state = self.modes[mode.index()]
            .write()
            .unwrap_or_else(|e| e.into_inner());

        let window = server_backoff.unwrap_or(state.penalty);
        if server_backoff.is_none() {
            state.penalty = (state.penalty * 2).min(MAX_PENALTY);
        }
        if let Ok(window) = ChronoDuration::from_std(window) {
            state.snapshot.backoff_until = Some(now + window);
        }
    }

    /// Remaining quota for a mode, if known.
    pub fn remaining(&self, mode: TransportMode) -> Option<u32> {
        self.snapshot(mode).remaining
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
