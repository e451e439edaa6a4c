//! Priority-ordered, deduplicating request queue

use stackrelay_core::{
    ApiRequest, DispatchError, Fingerprint, Payload, Priority, RelayResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

type Waiter = oneshot::Sender<RelayResult<Payload>>;

/// Receiver half handed back to a caller for one logical request.
pub type WaiterHandle = oneshot::Receiver<RelayResult<Payload>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Sitting in a priority band, ready to be picked.
    Pending,
    /// A worker owns it; the physical call is running.
    InFlight,
    /// Waiting out a retry delay. Still visible to dedup lookups.
    BackingOff,
}

/// One logical call awaiting dispatch, shared by every caller that asked for
/// the same fingerprint while it was live.
struct QueueEntry {
    request: ApiRequest,
    priority: Priority,
    enqueued_at: Instant,
    attempt: u32,
    mode_switched: bool,
    phase: Phase,
    /// Completion handles in arrival order. Owned exclusively by this entry;
    /// every waiter receives the same eventual result.
    waiters: Vec<Waiter>,
}

/// Work leased to a worker by `pop_ready`.
#[derive(Debug)]
pub(crate) struct LeasedJob {
    pub fingerprint: Fingerprint,
    pub request: ApiRequest,
    pub priority: Priority,
    pub attempt: u32,
    pub mode_switched: bool,
}

/// Result of admitting a request.
pub(crate) enum EnqueueOutcome {
    /// A new entry was created; a worker was woken.
    Created(WaiterHandle),
    /// An entry for this fingerprint was already live; the caller was
    /// attached as an additional waiter and no new physical call will be
    /// made.
    Attached(WaiterHandle),
}

struct QueueState {
    /// Ready fingerprints per priority band, FIFO within a band.
    bands: [VecDeque<Fingerprint>; 4],
    /// Every live entry (pending, in flight, or backing off), keyed by
    /// fingerprint. This is the deduplication table.
    entries: HashMap<Fingerprint, QueueEntry>,
}

/// The shared work queue. All mutation happens under one lock; workers park
/// on the `Notify` when no band has ready work.
pub(crate) struct RequestQueue {
    state: Mutex<QueueState>,
    wakeup: Notify,
    max_depth: Option<usize>,
}

impl RequestQueue {
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                bands: Default::default(),
                entries: HashMap::new(),
            }),
            wakeup: Notify::new(),
            max_depth,
        }
    }

    /// Admit a request: attach to a live entry for the same fingerprint, or
    /// create a new one.
    pub fn enqueue(
        &self,
        request: ApiRequest,
        priority: Priority,
    ) -> Result<EnqueueOutcome, DispatchError> {
        let fingerprint = request.fingerprint();
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = state.entries.get_mut(&fingerprint) {
            entry.waiters.push(tx);
            debug!(%fingerprint, waiters = entry.waiters.len(), "attached waiter to live entry");
            return Ok(EnqueueOutcome::Attached(rx));
        }

        if let Some(limit) = self.max_depth {
            let pending: usize = state.bands.iter().map(VecDeque::len).sum();
            if pending >= limit {
                return Err(DispatchError::QueueSaturated { limit });
            }
        }

        state.entries.insert(
            fingerprint.clone(),
            QueueEntry {
                request,
                priority,
                enqueued_at: Instant::now(),
                attempt: 0,
                mode_switched: false,
                phase: Phase::Pending,
                waiters: vec![tx],
            },
        );
        state.bands[priority.index()].push_back(fingerprint);
        drop(state);

        self.wakeup.notify_one();
        Ok(EnqueueOutcome::Created(rx))
    }

    /// Lease the highest-priority, oldest ready entry to a worker.
    ///
    /// Entries whose waiters have all given up are dropped here, lazily,
    /// without spending an upstream call on them.
    pub fn pop_ready(&self) -> Option<LeasedJob> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        for priority in Priority::all_ordered() {
            while let Some(fingerprint) = state.bands[priority.index()].pop_front() {
                let Some(entry) = state.entries.get_mut(&fingerprint) else {
                    continue;
                };
                if entry.phase != Phase::Pending {
                    continue;
                }
                if entry.waiters.iter().all(Waiter::is_closed) {
                    debug!(%fingerprint, "dropping entry with no remaining waiters");
                    state.entries.remove(&fingerprint);
                    continue;
                }

                entry.phase = Phase::InFlight;
                let job = LeasedJob {
                    fingerprint: fingerprint.clone(),
                    request: entry.request.clone(),
                    priority,
                    attempt: entry.attempt,
                    mode_switched: entry.mode_switched,
                };

                // Notify stores at most one permit, so a burst of enqueues
                // can leave ready work with no pending wakeup. Cascade one.
                let more_ready = state.bands.iter().any(|band| !band.is_empty());
                drop(state);
                if more_ready {
                    self.wakeup.notify_one();
                }
                return Some(job);
            }
        }
        None
    }

    /// Resolve every waiter with the same result and discard the entry.
    pub fn resolve(&self, fingerprint: &Fingerprint, result: RelayResult<Payload>) {
        let entry = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.entries.remove(fingerprint)
        };

        if let Some(entry) = entry {
            debug!(
                %fingerprint,
                waiters = entry.waiters.len(),
                queued_for = ?entry.enqueued_at.elapsed(),
                "resolving entry"
            );
            for waiter in entry.waiters {
                // A closed receiver just means that caller stopped waiting.
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Park a leased entry for a retry delay. It stays in the dedup table,
    /// so late callers still attach instead of spawning a duplicate call.
    pub fn schedule_retry(&self, fingerprint: &Fingerprint) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.entries.get_mut(fingerprint) {
            entry.phase = Phase::BackingOff;
            entry.attempt += 1;
        }
    }

    /// Flag a leased entry for one immediate re-run under the fallback
    /// transport. Does not consume an attempt.
    pub fn mark_mode_switched(&self, fingerprint: &Fingerprint) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.entries.get_mut(fingerprint) {
            entry.phase = Phase::BackingOff;
            entry.mode_switched = true;
        }
    }

    /// Return a parked entry to its priority band.
    pub fn requeue(&self, fingerprint: &Fingerprint) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = state.entries.get_mut(fingerprint) else {
            return;
        };
        entry.phase = Phase::Pending;
        let priority = entry.priority;
        state.bands[priority.index()].push_back(fingerprint.clone());
        drop(state);
        self.wakeup.notify_one();
    }

    /// Resolve every live entry with the given terminal error. Used on
    /// shutdown.
    pub fn fail_all(&self, error: stackrelay_core::RelayError) {
        let entries: Vec<QueueEntry> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for band in &mut state.bands {
                band.clear();
            }
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            for waiter in entry.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// (pending per band, in flight, backing off) counts.
    pub fn counts(&self) -> ([usize; 4], usize, usize) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending = [0usize; 4];
        let mut in_flight = 0;
        let mut backing_off = 0;

        for entry in state.entries.values() {
            match entry.phase {
                Phase::Pending => pending[entry.priority.index()] += 1,
                Phase::InFlight => in_flight += 1,
                Phase::BackingOff => backing_off += 1,
            }
        }
        (pending, in_flight, backing_off)
    }

    /// Wait for ready work. Callers should re-check `pop_ready` after this
    /// resolves.
    pub async fn ready(&self) {
        self.wakeup.notified().await;
    }

    /// Wake every parked worker, e.g. on shutdown.
    pub fn wake_all(&self) {
        self.wakeup.notify_waiters();
    }
}

// =============================================================================
// TESTS
// =============================================================================
