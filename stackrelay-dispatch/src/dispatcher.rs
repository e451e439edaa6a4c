//! Worker pool draining the request queue

use crate::cache::ResultCache;
use crate::mode::AccessModeSelector;
use crate::queue::{LeasedJob, RequestQueue};
use crate::quota::RateLimitTracker;
use crate::retry::{Decision, RetryPolicy};
use crate::transport::QaTransport;
use chrono::Utc;
use rand::Rng;
use stackrelay_core::{RelayConfig, RelayError, TransportMode, UpstreamError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything a worker needs, shared across the pool.
pub(crate) struct DispatchContext {
    pub config: RelayConfig,
    pub queue: Arc<RequestQueue>,
    pub cache: Arc<ResultCache>,
    pub tracker: Arc<RateLimitTracker>,
    pub selector: AccessModeSelector,
    pub policy: RetryPolicy,
    pub transport: Arc<dyn QaTransport>,
    /// Requests resolved, successfully or terminally.
    pub completed: AtomicU64,
    pub shutdown: AtomicBool,
}

impl DispatchContext {
    /// The transport mode the selector would pick right now.
    pub fn current_mode(&self) -> TransportMode {
        let auth = self.tracker.snapshot(TransportMode::Authenticated);
        self.selector
            .choose(self.config.credentials_present(), &auth, Utc::now())
    }
}

/// One dispatch worker: pop, call, settle, repeat.
pub(crate) async fn run_worker(ctx: Arc<DispatchContext>, worker_id: usize) {
    debug!(worker_id, "dispatch worker started");

    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match ctx.queue.pop_ready() {
            Some(job) => process_job(&ctx, job).await,
            // `Notify` retains a permit from a pre-sleep enqueue, so no
            // wakeup is lost between the pop above and this await.
            None => ctx.queue.ready().await,
        }
    }

    debug!(worker_id, "dispatch worker stopped");
}

async fn process_job(ctx: &Arc<DispatchContext>, job: LeasedJob) {
    let mode = if job.mode_switched {
        // A rate-limited authenticated call already bounced this entry;
        // the immediate re-run goes out anonymously.
        TransportMode::Unauthenticated
    } else {
        ctx.current_mode()
    };

    debug!(
        fingerprint = %job.fingerprint,
        operation = job.request.operation(),
        %mode,
        attempt = job.attempt,
        "dispatching upstream call"
    );

    match ctx.transport.execute(&job.request, mode).await {
        Ok(reply) => {
            ctx.tracker.record_success(mode, &reply.quota, Utc::now());
            ctx.cache
                .store(job.fingerprint.clone(), reply.payload.clone());
            ctx.completed.fetch_add(1, Ordering::Relaxed);
            ctx.queue.resolve(&job.fingerprint, Ok(reply.payload));
        }
        Err(error) => {
            if let RelayError::Upstream(UpstreamError::RateLimited { backoff, .. }) = &error {
                ctx.tracker
                    .record_rate_limited(mode, *backoff, Utc::now());
            }

            match ctx.policy.decide(&error, job.attempt, mode, job.mode_switched) {
                Decision::SwitchMode => {
                    warn!(
                        fingerprint = %job.fingerprint,
                        "authenticated quota exhausted, retrying anonymously"
                    );
                    ctx.queue.mark_mode_switched(&job.fingerprint);
                    ctx.queue.requeue(&job.fingerprint);
                }
                Decision::Retry { delay } => {
                    let delay = delay + jitter(ctx.config.retry.base_backoff);
                    debug!(
                        fingerprint = %job.fingerprint,
                        attempt = job.attempt,
                        ?delay,
                        %error,
                        "scheduling retry"
                    );
                    ctx.queue.schedule_retry(&job.fingerprint);

                    let queue = Arc::clone(&ctx.queue);
                    let fingerprint = job.fingerprint.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        // No-op if the service shut down in the meantime.
                        queue.requeue(&fingerprint);
                    });
                }
                Decision::Fail { error } => {
                    warn!(fingerprint = %job.fingerprint, %error, "request failed terminally");
                    ctx.completed.fetch_add(1, Ordering::Relaxed);
                    ctx.queue.resolve(&job.fingerprint, Err(error));
                }
            }
        }
    }
}

/// Uniform random jitter in `[0, base)`, layered on the policy's
/// deterministic delay.
fn jitter(base: Duration) -> Duration {
    let max_ms = base.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

// =============================================================================
// TESTS
// =============================================================================
