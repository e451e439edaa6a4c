//! Construction root and public surface of the dispatch layer

use crate::cache::ResultCache;
use crate::dispatcher::{run_worker, DispatchContext};
use crate::mode::AccessModeSelector;
use crate::queue::{EnqueueOutcome, RequestQueue, WaiterHandle};
use crate::quota::{QuotaUpdate, RateLimitTracker};
use crate::retry::RetryPolicy;
use crate::transport::{QaTransport, StackExchangeClient};
use chrono::Utc;
use stackrelay_core::{
    ApiRequest, CredentialStatus, DispatchError, Payload, Priority, RelayConfig, RelayError,
    RelayResult, StatusSnapshot, TransportMode,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A caller's handle on one logical request.
///
/// Dropping the ticket (or timing out) abandons the wait but never cancels
/// the underlying call; other waiters and the cache still benefit from it
/// completing.
pub struct Ticket {
    inner: TicketInner,
}

enum TicketInner {
    /// Resolved at enqueue time, straight from the cache.
    Ready(RelayResult<Payload>),
    /// Waiting on a live queue entry.
    Waiting(WaiterHandle),
}

impl Ticket {
    fn ready(result: RelayResult<Payload>) -> Self {
        Self {
            inner: TicketInner::Ready(result),
        }
    }

    fn waiting(handle: WaiterHandle) -> Self {
        Self {
            inner: TicketInner::Waiting(handle),
        }
    }

    /// Whether this ticket was answered from the cache.
    pub fn is_immediate(&self) -> bool {
        matches!(self.inner, TicketInner::Ready(_))
    }

    /// Wait for the result.
    pub async fn wait(self) -> RelayResult<Payload> {
        match self.inner {
            TicketInner::Ready(result) => result,
            TicketInner::Waiting(handle) => handle
                .await
                .unwrap_or_else(|_| Err(DispatchError::Shutdown.into())),
        }
    }

    /// Wait at most `limit`; `None` means the caller gave up, not that the
    /// request failed.
    pub async fn wait_timeout(self, limit: Duration) -> Option<RelayResult<Payload>> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }
}

/// The dispatch layer: bounded worker pool, result cache, quota-aware mode
/// selection, and retry policy behind one `enqueue` call.
pub struct DispatchService {
    ctx: Arc<DispatchContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    credentials: RwLock<CredentialStatus>,
}

impl DispatchService {
    /// Build the service against the real Stack Exchange API.
    ///
    /// Must be called from within a tokio runtime; the worker pool is
    /// spawned here.
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        let transport = Arc::new(StackExchangeClient::new(&config));
        Self::with_transport(config, transport)
    }

    /// Build the service over any transport. This is the seam tests use.
    pub fn with_transport(
        config: RelayConfig,
        transport: Arc<dyn QaTransport>,
    ) -> RelayResult<Self> {
        config.validate().map_err(RelayError::from)?;

        let ctx = Arc::new(DispatchContext {
            queue: Arc::new(RequestQueue::new(config.max_queue_depth)),
            cache: Arc::new(ResultCache::new(config.cache_capacity, config.cache_ttl)),
            tracker: Arc::new(RateLimitTracker::new()),
            selector: AccessModeSelector::new(config.access_mode, config.quota_low_water),
            policy: RetryPolicy::new(config.retry.clone()),
            transport,
            completed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            config,
        });

        let workers = (0..ctx.config.concurrency)
            .map(|worker_id| tokio::spawn(run_worker(Arc::clone(&ctx), worker_id)))
            .collect();

        info!(
            workers = ctx.config.concurrency,
            cache_capacity = ctx.config.cache_capacity,
            "dispatch service started"
        );

        let credentials = RwLock::new(CredentialStatus {
            configured: ctx.config.credentials_present(),
            ..CredentialStatus::default()
        });

        Ok(Self {
            ctx,
            workers: Mutex::new(workers),
            credentials,
        })
    }

    /// Admit one logical request.
    ///
    /// Cache hits resolve the returned ticket immediately. Otherwise the
    /// request either joins a live entry with the same fingerprint (no new
    /// physical call) or becomes a new queue entry.
    pub fn enqueue(&self, request: ApiRequest, priority: Priority) -> RelayResult<Ticket> {
        if self.ctx.shutdown.load(Ordering::Relaxed) {
            return Err(DispatchError::Shutdown.into());
        }
        request.validate().map_err(RelayError::from)?;

        let fingerprint = request.fingerprint();
        if let Some(payload) = self.ctx.cache.lookup(&fingerprint) {
            debug!(%fingerprint, "cache hit");
            return Ok(Ticket::ready(Ok(payload)));
        }

        match self.ctx.queue.enqueue(request, priority)? {
            EnqueueOutcome::Created(handle) | EnqueueOutcome::Attached(handle) => {
                Ok(Ticket::waiting(handle))
            }
        }
    }

    /// Point-in-time view for the status-reporting tool.
    pub fn status(&self) -> StatusSnapshot {
        let (pending_by_priority, in_flight, backing_off) = self.ctx.queue.counts();
        let (cache_hits, cache_misses) = self.ctx.cache.counters();
        let current_access_mode = self.ctx.current_mode();

        StatusSnapshot {
            pending_by_priority,
            in_flight,
            backing_off,
            completed: self.ctx.completed.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_entries: self.ctx.cache.len(),
            current_access_mode,
            quota_remaining: self.ctx.tracker.remaining(current_access_mode),
            credentials: self
                .credentials
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// Probe the configured credential against the upstream and record the
    /// outcome.
    ///
    /// An invalid or absent key is not an error here; the service keeps
    /// running anonymously and the probe result says so.
    pub async fn validate_credentials(&self) -> CredentialStatus {
        if !self.ctx.config.credentials_present() {
            let mut status = self.credentials.write().unwrap_or_else(|e| e.into_inner());
            status.validated = true;
            status.valid = Some(false);
            status.last_validated_at = Some(Utc::now());
            status.last_error = Some("no API key configured".to_string());
            return status.clone();
        }

        let probe = self.ctx.transport.probe_credentials().await;
        let mut status = self.credentials.write().unwrap_or_else(|e| e.into_inner());
        status.validated = true;
        status.last_validated_at = Some(Utc::now());

        match probe {
            Ok(probe) => {
                status.valid = Some(true);
                status.quota_max = probe.quota_max;
                status.quota_remaining = probe.quota_remaining;
                status.last_error = None;

                // The probe carried a fresh quota reading; let the tracker
                // and selector see it too.
                self.ctx.tracker.record_success(
                    TransportMode::Authenticated,
                    &QuotaUpdate {
                        remaining: probe.quota_remaining,
                        reset_at: None,
                        backoff: None,
                    },
                    Utc::now(),
                );
            }
            Err(error) => {
                status.valid = Some(false);
                status.last_error = Some(error.to_string());
            }
        }
        status.clone()
    }

    /// Stop the worker pool. In-flight calls finish; everything still queued
    /// resolves with [`DispatchError::Shutdown`].
    pub async fn shutdown(&self) {
        self.ctx.shutdown.store(true, Ordering::Relaxed);
        self.ctx.queue.wake_all();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        self.ctx.queue.fail_all(DispatchError::Shutdown.into());
        info!("dispatch service stopped");
    }
}

impl Drop for DispatchService {
    fn drop(&mut self) {
        // A dropped service must not leave detached workers spinning.
        self.ctx.shutdown.store(true, Ordering::Relaxed);
        self.ctx.queue.wake_all();
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in workers.drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for DispatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService")
            .field("concurrency", &self.ctx.config.concurrency)
            .field("cache_entries", &self.ctx.cache.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CredentialProbe, TransportReply};
    use async_trait::async_trait;
    use serde_json::json;

    /// Transport that answers every call with the same payload.
    struct FixedTransport {
        calls: AtomicU64,
    }

    #[async_trait]
    impl QaTransport for FixedTransport {
        async fn execute(
            &self,
            _request: &ApiRequest,
            _mode: stackrelay_core::TransportMode,
        ) -> RelayResult<TransportReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TransportReply {
                payload: json!({"items": [{"question_id": 1}]}),
                quota: QuotaUpdate::default(),
            })
        }

        async fn probe_credentials(&self) -> RelayResult<CredentialProbe> {
            Ok(CredentialProbe {
                quota_max: Some(10_000),
                quota_remaining: Some(9_500),
            })
        }
    }

    fn service_with_fixed_transport() -> (DispatchService, Arc<FixedTransport>) {
        let transport = Arc::new(FixedTransport {
            calls: AtomicU64::new(0),
        });
        let service = DispatchService::with_transport(
            RelayConfig::default().with_concurrency(2),
            Arc::clone(&transport) as Arc<dyn QaTransport>,
        )
        .expect("valid config");
        (service, transport)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_resolves_and_caches() {
        let (service, transport) = service_with_fixed_transport();

        let ticket = service
            .enqueue(ApiRequest::search("python asyncio"), Priority::Normal)
            .unwrap();
        assert!(!ticket.is_immediate());
        let payload = ticket.wait().await.unwrap();
        assert_eq!(payload["items"][0]["question_id"], 1);

        // Same fingerprint again: answered from cache, no second call.
        let ticket = service
            .enqueue(ApiRequest::search("python asyncio"), Priority::Urgent)
            .unwrap();
        assert!(ticket.is_immediate());
        assert_eq!(ticket.wait().await.unwrap()["items"][0]["question_id"], 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let status = service.status();
        assert_eq!(status.cache_hits, 1);
        assert_eq!(status.completed, 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_request_fails_fast() {
        let (service, transport) = service_with_fixed_transport();

        let result = service.enqueue(ApiRequest::search("   "), Priority::Normal);
        assert!(matches!(result, Err(RelayError::Validation(_))));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let (service, _transport) = service_with_fixed_transport();
        service.shutdown().await;

        let result = service.enqueue(ApiRequest::search("rust"), Priority::Normal);
        assert!(matches!(
            result,
            Err(RelayError::Dispatch(DispatchError::Shutdown))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_validate_credentials_without_key() {
        let (service, _transport) = service_with_fixed_transport();

        let status = service.validate_credentials().await;
        assert!(!status.configured);
        assert!(status.validated);
        assert_eq!(status.valid, Some(false));
        assert!(status.last_error.is_some());

        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_validate_credentials_with_key_records_quota() {
        let transport = Arc::new(FixedTransport {
            calls: AtomicU64::new(0),
        });
        let service = DispatchService::with_transport(
            RelayConfig::default().with_api_key("key123"),
            transport as Arc<dyn QaTransport>,
        )
        .unwrap();

        let status = service.validate_credentials().await;
        assert!(status.configured);
        assert_eq!(status.valid, Some(true));
        assert_eq!(status.quota_max, Some(10_000));
        assert_eq!(status.quota_remaining, Some(9_500));

        // The probe's quota reading reached the status snapshot.
        let snapshot = service.status();
        assert_eq!(snapshot.quota_remaining, Some(9_500));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let transport = Arc::new(FixedTransport {
            calls: AtomicU64::new(0),
        });
        let result = DispatchService::with_transport(
            RelayConfig::default().with_concurrency(0),
            transport as Arc<dyn QaTransport>,
        );
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
