//! Upstream transport seam
//!
//! The dispatcher talks to the upstream through the [`QaTransport`] trait so
//! tests can substitute a scripted transport. The production implementation
//! is [`StackExchangeClient`].

pub mod stackexchange;

pub use stackexchange::StackExchangeClient;

use crate::quota::QuotaUpdate;
use async_trait::async_trait;
use stackrelay_core::{ApiRequest, Payload, RelayResult, TransportMode};

/// One successful physical response: the body plus whatever quota metadata
/// came with it.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub payload: Payload,
    pub quota: QuotaUpdate,
}

/// Result of a credential validation probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialProbe {
    pub quota_max: Option<u32>,
    pub quota_remaining: Option<u32>,
}

/// A transport capable of executing logical requests against the upstream
/// Q&A API. Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait QaTransport: Send + Sync {
    /// Execute one physical call under the given transport mode.
    async fn execute(
        &self,
        request: &ApiRequest,
        mode: TransportMode,
    ) -> RelayResult<TransportReply>;

    /// Issue a cheap authenticated call to check whether the configured
    /// credential is accepted, and with what daily quota.
    async fn probe_credentials(&self) -> RelayResult<CredentialProbe>;
}
