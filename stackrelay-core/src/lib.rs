//! stackrelay Core - Data Types
//!
//! Pure data structures shared across the dispatch layer. This crate contains
//! no I/O and no async code; the queue, cache, and transport live in
//! `stackrelay-dispatch`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod config;
pub mod error;
pub mod request;
pub mod status;

pub use config::{RelayConfig, RetryConfig};
pub use error::{
    ConfigError, DispatchError, RelayError, RelayResult, UpstreamError, ValidationError,
};
pub use request::{ApiRequest, SearchSort};
pub use status::{CredentialStatus, RateLimitSnapshot, StatusSnapshot};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Opaque completed response body, as returned by the upstream API.
pub type Payload = serde_json::Value;

/// Deterministic identity for a logical request.
///
/// Derived from the operation kind and normalized parameters; two requests
/// with the same fingerprint are interchangeable for caching and
/// deduplication. Priority and access mode are deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint over an operation name and its normalized
    /// parameters, rendered as lowercase hex SHA-256.
    pub fn compute(operation: &str, normalized_params: &[(String, String)]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        for (key, value) in normalized_params {
            hasher.update(b"\0");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// The hex digest backing this fingerprint.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full digests are noisy in logs; eight chars is plenty to correlate.
        write!(f, "{}", &self.0[..8.min(self.0.len())])
    }
}

// ============================================================================
// ENUMS
// ============================================================================

/// Priority level for queued requests.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    /// Lowest priority.
    Low = 0,
    /// Normal priority (default).
    #[default]
    Normal = 1,
    /// High priority.
    High = 2,
    /// Served before everything else (highest).
    Urgent = 3,
}

impl Priority {
    /// All priority levels ordered from highest to lowest.
    pub fn all_ordered() -> [Self; 4] {
        [Self::Urgent, Self::High, Self::Normal, Self::Low]
    }

    /// Stable index for per-priority bookkeeping arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Configured transport preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Always attach credentials.
    Authenticated,
    /// Never attach credentials.
    Unauthenticated,
    /// Pick per call based on quota state (default).
    #[default]
    Auto,
}

/// Resolved transport mode for a single physical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// Credentials attached; large but finite shared quota.
    Authenticated,
    /// Anonymous; small per-IP quota.
    Unauthenticated,
}

impl TransportMode {
    /// Stable index for per-mode bookkeeping arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Authenticated => 0,
            Self::Unauthenticated => 1,
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authenticated => write!(f, "authenticated"),
            Self::Unauthenticated => write!(f, "unauthenticated"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let params = vec![("q".to_string(), "rust async".to_string())];
        let a = Fingerprint::compute("search", &params);
        let b = Fingerprint::compute("search", &params);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_operations() {
        let params = vec![("q".to_string(), "rust".to_string())];
        let a = Fingerprint::compute("search", &params);
        let b = Fingerprint::compute("tag_search", &params);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_no_field_collisions() {
        // ("ab", "c") and ("a", "bc") must not hash identically.
        let a = Fingerprint::compute("op", &[("ab".to_string(), "c".to_string())]);
        let b = Fingerprint::compute("op", &[("a".to_string(), "bc".to_string())]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_all_ordered_is_descending() {
        let ordered = Priority::all_ordered();
        for pair in ordered.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn test_fingerprint_display_is_short() {
        let fp = Fingerprint::compute("search", &[]);
        assert_eq!(format!("{}", fp).len(), 8);
        assert_eq!(fp.as_str().len(), 64);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Fingerprints over distinct parameter lists collide only if the
        /// serialized forms are identical.
        #[test]
        fn prop_fingerprint_injective_on_params(
            key in "[a-z]{1,8}",
            v1 in "[a-zA-Z0-9 ]{0,32}",
            v2 in "[a-zA-Z0-9 ]{0,32}",
        ) {
            let a = Fingerprint::compute("op", &[(key.clone(), v1.clone())]);
            let b = Fingerprint::compute("op", &[(key, v2.clone())]);
            if v1 == v2 {
                prop_assert_eq!(a, b);
            } else {
                prop_assert_ne!(a, b);
            }
        }

        /// Fingerprint digests are always 64 lowercase hex characters.
        #[test]
        fn prop_fingerprint_is_hex(op in "[a-z_]{1,16}") {
            let fp = Fingerprint::compute(&op, &[]);
            prop_assert_eq!(fp.as_str().len(), 64);
            prop_assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
