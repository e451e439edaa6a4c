//! Access-mode selection

use stackrelay_core::{AccessMode, RateLimitSnapshot, Timestamp, TransportMode};

/// Decides, per outgoing call, whether to attach credentials.
///
/// The decision is a pure function over the configured mode, credential
/// presence, and the authenticated-quota snapshot, so it can be unit tested
/// without any dispatch machinery. Auto mode spends the larger authenticated
/// quota first and falls back to anonymous calls when that quota runs low or
/// the server pushes back, preserving availability instead of hard-failing.
#[derive(Debug, Clone, Copy)]
pub struct AccessModeSelector {
    configured: AccessMode,
    low_water: u32,
}

impl AccessModeSelector {
    pub fn new(configured: AccessMode, low_water: u32) -> Self {
        Self {
            configured,
            low_water,
        }
    }

    /// Resolve the transport mode for one call.
    pub fn choose(
        &self,
        credentials_present: bool,
        auth: &RateLimitSnapshot,
        now: Timestamp,
    ) -> TransportMode {
        match self.configured {
            AccessMode::Unauthenticated => TransportMode::Unauthenticated,
            AccessMode::Authenticated => {
                // An explicit preference still cannot conjure credentials.
                if credentials_present {
                    TransportMode::Authenticated
                } else {
                    TransportMode::Unauthenticated
                }
            }
            AccessMode::Auto => {
                if !credentials_present {
                    return TransportMode::Unauthenticated;
                }
                if auth.is_backing_off(now) {
                    return TransportMode::Unauthenticated;
                }
                // A stale "low quota" reading stops mattering once the
                // window has rolled over.
                if auth.below_low_water(self.low_water) && !auth.reset_has_passed(now) {
                    return TransportMode::Unauthenticated;
                }
                TransportMode::Authenticated
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
