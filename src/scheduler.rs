//! Dispatch queue and pending-batch tracker.
//!
//! One [`Scheduler`] owns both the queue of batches waiting for a worker and
//! the map of batches handed out but not yet acknowledged. A batch is in
//! exactly one of three states:
//!
//! ```text
//!   queued ──next_batch──▶ pending ──on_ack──▶ absent
//!     ▲                       │
//!     └──────sweep_stale──────┘   (same Arc, same batch_id)
//! ```
//!
//! A missing acknowledgment within the deadline is the only failure signal:
//! there is no liveness handshake with workers. A worker that was swept may
//! still report back later; its results are persisted (idempotent per record
//! id) and the late ack is a no-op.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::models::WorkBatch;

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub batch_id: String,
    pub dispatched_at: Instant,
    pub batch: Arc<WorkBatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The batch was in flight and is now done.
    Acked,
    /// A sweep had already put it back on the queue; that copy was dropped.
    Dequeued,
    /// Not tracked: a duplicate or late acknowledgment.
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub pending: usize,
    pub enqueued: u64,
    pub served: u64,
    pub acked: u64,
    pub redelivered: u64,
    pub producer_done: bool,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Arc<WorkBatch>>,
    pending: HashMap<String, PendingEntry>,
    producer_done: bool,
    enqueued: u64,
    served: u64,
    acked: u64,
    redelivered: u64,
}

#[derive(Default)]
pub struct Scheduler {
    state: Mutex<State>,
    changed: Condvar,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a freshly built batch at the back of the queue.
    pub fn enqueue(&self, batch: WorkBatch) {
        let mut st = self.state.lock();
        debug!(batch_id = %batch.batch_id, items = batch.len(), "batch queued");
        st.queue.push_back(Arc::new(batch));
        st.enqueued += 1;
        drop(st);
        self.changed.notify_all();
    }

    /// Pop the next batch and start tracking it. Never blocks.
    pub fn next_batch(&self) -> Option<Arc<WorkBatch>> {
        let mut st = self.state.lock();
        let batch = st.queue.pop_front()?;
        Self::on_dispatch(&mut st, batch.clone());
        drop(st);
        self.changed.notify_all();
        Some(batch)
    }

    /// Record `batch` as handed to a worker now. Runs under the same lock as
    /// the pop, so a batch is always either queued or pending.
    fn on_dispatch(st: &mut State, batch: Arc<WorkBatch>) {
        st.served += 1;
        let entry = PendingEntry {
            batch_id: batch.batch_id.clone(),
            dispatched_at: Instant::now(),
            batch,
        };
        st.pending.insert(entry.batch_id.clone(), entry);
    }

    pub fn on_ack(&self, batch_id: &str) -> AckOutcome {
        let mut st = self.state.lock();
        let outcome = if st.pending.remove(batch_id).is_some() {
            AckOutcome::Acked
        } else if let Some(pos) = st.queue.iter().position(|b| b.batch_id == batch_id) {
            st.queue.remove(pos);
            AckOutcome::Dequeued
        } else {
            AckOutcome::Unknown
        };
        if outcome != AckOutcome::Unknown {
            st.acked += 1;
        }
        drop(st);
        self.changed.notify_all();
        outcome
    }

    /// Re-queue every pending batch older than `deadline`. Returns how many.
    pub fn sweep_stale(&self, deadline: Duration) -> usize {
        let mut st = self.state.lock();
        let stale: Vec<String> = st
            .pending
            .values()
            .filter(|e| e.dispatched_at.elapsed() > deadline)
            .map(|e| e.batch_id.clone())
            .collect();

        for batch_id in &stale {
            if let Some(entry) = st.pending.remove(batch_id) {
                warn!(
                    batch_id = %batch_id,
                    age_secs = entry.dispatched_at.elapsed().as_secs(),
                    "no ack within deadline; re-queueing"
                );
                st.queue.push_back(entry.batch);
                st.redelivered += 1;
            }
        }
        drop(st);

        if !stale.is_empty() {
            info!(requeued = stale.len(), "stale sweep");
            self.changed.notify_all();
        }
        stale.len()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, batch_id: &str) -> bool {
        self.state.lock().pending.contains_key(batch_id)
    }

    /// Block until fewer than `limit` batches are queued, or `timeout` passes.
    /// Returns whether the queue is below `limit`.
    pub fn wait_for_queue_below(&self, limit: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while st.queue.len() >= limit {
            if self.changed.wait_until(&mut st, deadline).timed_out() {
                return st.queue.len() < limit;
            }
        }
        true
    }

    /// Block until any state change, or `timeout` passes.
    pub fn wait_for_change(&self, timeout: Duration) {
        let mut st = self.state.lock();
        let _ = self.changed.wait_for(&mut st, timeout);
    }

    pub fn mark_producer_done(&self) {
        self.state.lock().producer_done = true;
        self.changed.notify_all();
    }

    /// The producer has finished and every batch has been acknowledged.
    pub fn is_drained(&self) -> bool {
        let st = self.state.lock();
        st.producer_done && st.queue.is_empty() && st.pending.is_empty()
    }

    pub fn stats(&self) -> SchedulerStats {
        let st = self.state.lock();
        SchedulerStats {
            queued: st.queue.len(),
            pending: st.pending.len(),
            enqueued: st.enqueued,
            served: st.served,
            acked: st.acked,
            redelivered: st.redelivered,
            producer_done: st.producer_done,
        }
    }
}
