//! stackrelay Dispatch - Outbound Request Dispatch Layer
//!
//! Sits between query handlers (keyword search, tag search, question fetch)
//! and the rate-limited Stack Exchange API, turning many concurrent,
//! possibly-duplicate logical queries into a bounded stream of physical
//! HTTP calls.
//!
//! # Design Philosophy
//!
//! Every shared resource sits behind exactly one synchronization point: the
//! queue's dedup table under one lock, the cache under another, the quota
//! snapshots under a per-mode `RwLock`. Policy decisions (retry, access
//! mode) are pure functions over explicit snapshots, so they unit test
//! without any dispatch machinery.
//!
//! # Example
//!
//! ```ignore
//! let service = DispatchService::new(RelayConfig::default())?;
//!
//! let ticket = service.enqueue(ApiRequest::search("python asyncio"), Priority::Normal)?;
//! let payload = ticket.wait().await?;
//!
//! // A duplicate issued while the first is in flight attaches to the same
//! // physical call; issued after completion, it hits the cache.
//! let again = service.enqueue(ApiRequest::search("python asyncio"), Priority::Urgent)?;
//! assert!(again.is_immediate());
//! ```

pub mod cache;
pub mod mode;
pub mod quota;
pub mod retry;
pub mod service;
pub mod transport;

mod dispatcher;
mod queue;

pub use cache::ResultCache;
pub use mode::AccessModeSelector;
pub use quota::{QuotaUpdate, RateLimitTracker};
pub use retry::{Decision, RetryPolicy};
pub use service::{DispatchService, Ticket};
pub use transport::{CredentialProbe, QaTransport, StackExchangeClient, TransportReply};
