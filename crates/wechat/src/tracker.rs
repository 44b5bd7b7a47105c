//! Per-message delivery tracking.
//!
//! One [`TrackerEntry`] exists per logical message id, owned by the
//! [`MessageTracker`] table and never shared outside it except as `Arc`s
//! handed to delivery attempts and the background computation. The table
//! lock guards entry creation; each entry's mutable fields sit behind the
//! entry's own lock. Neither lock is ever held across an await point.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use {
    tokio::sync::watch,
    tracing::{debug, info},
};

use wegate_common::ConversationKey;

/// Sweep cadence for finished entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// How long a finished entry lingers so late redeliveries of the same id
/// do not relaunch the computation.
const FINISHED_TTL: Duration = Duration::from_secs(600);

/// Lifecycle of one tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Computation dispatched, not finished.
    Pending,
    /// Result available.
    Completed,
    /// Backend error or lifetime cap; the result holds the failure text.
    Failed,
    /// Final answer went through the customer-service message API.
    DeliveredOutOfBand,
    /// Interactive waiting exhausted; a late result is discarded.
    Abandoned,
}

impl Status {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

struct EntryState {
    status: Status,
    result: Option<String>,
    retry_count: u32,
    final_send_claimed: bool,
}

/// Mutable per-message state.
pub struct TrackerEntry {
    started_at: Instant,
    state: Mutex<EntryState>,
    completed_tx: watch::Sender<bool>,
}

impl TrackerEntry {
    fn new() -> Self {
        let (completed_tx, _) = watch::channel(false);
        Self {
            started_at: Instant::now(),
            state: Mutex::new(EntryState {
                status: Status::Pending,
                result: None,
                retry_count: 0,
                final_send_claimed: false,
            }),
            completed_tx,
        }
    }

    /// Entry outside the table, for messages that carry no usable id.
    #[must_use]
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store the computation outcome and fire the completion signal.
    /// Write-once: results arriving after the entry went terminal (for
    /// example after abandonment) are discarded with a log trail.
    pub fn complete(&self, result: String, failed: bool) {
        let fire = {
            let mut state = self.lock();
            match state.status {
                Status::Pending => {
                    state.result = Some(result);
                    state.status = if failed { Status::Failed } else { Status::Completed };
                    true
                },
                status => {
                    info!(?status, "discarding late result for finished message");
                    false
                },
            }
        };
        if fire {
            let _ = self.completed_tx.send(true);
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Whether a result (success or captured failure) is available.
    #[must_use]
    pub fn has_result(&self) -> bool {
        matches!(self.status(), Status::Completed | Status::Failed)
    }

    #[must_use]
    pub fn result(&self) -> Option<String> {
        self.lock().result.clone()
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    /// Claim the right to deliver the final answer. The first caller wins;
    /// every later claim, synchronous or out-of-band, is refused.
    #[must_use]
    pub fn claim_final_send(&self) -> bool {
        let mut state = self.lock();
        if state.final_send_claimed {
            false
        } else {
            state.final_send_claimed = true;
            true
        }
    }

    /// Stop waiting for this message; a still-running computation keeps
    /// going until its lifetime cap but its result will be discarded.
    pub fn mark_abandoned(&self) {
        let mut state = self.lock();
        if state.status == Status::Pending {
            state.status = Status::Abandoned;
        }
    }

    pub fn mark_delivered_out_of_band(&self) {
        self.lock().status = Status::DeliveredOutOfBand;
    }

    /// Bounded wait for the completion signal. The only suspension point a
    /// delivery attempt ever blocks on; returns true when the computation
    /// finished within the budget. Tolerates any number of concurrent
    /// waiters, including none.
    pub async fn wait_completed(&self, budget: Duration) -> bool {
        let mut rx = self.completed_tx.subscribe();
        // wait_for inspects the current value first, so a completion that
        // fired before this call is seen immediately.
        matches!(
            tokio::time::timeout(budget, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }
}

struct WaitingState {
    entry: Arc<TrackerEntry>,
    continue_count: u32,
    max_continue_count: u32,
}

/// Snapshot of a conversation's interactive-waiting state.
pub struct WaitingSnapshot {
    pub entry: Arc<TrackerEntry>,
    pub continue_count: u32,
    pub max_continue_count: u32,
}

struct Inner {
    entries: HashMap<String, Arc<TrackerEntry>>,
    waiting: HashMap<ConversationKey, WaitingState>,
    last_sweep: Instant,
}

impl Inner {
    fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = Instant::now();

        let before = self.entries.len();
        self.entries
            .retain(|_, e| !(e.status().is_terminal() && e.started_at.elapsed() > FINISHED_TTL));
        self.waiting.retain(|_, w| {
            !(w.entry.status().is_terminal() && w.entry.started_at.elapsed() > FINISHED_TTL)
        });

        let removed = before - self.entries.len();
        if removed > 0 {
            info!(removed, remaining = self.entries.len(), "swept finished message entries");
        }
    }
}

/// Table of in-flight messages. One per process; constructed explicitly and
/// passed where needed, never reached through a global.
pub struct MessageTracker {
    inner: Mutex<Inner>,
}

impl Default for MessageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                waiting: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up or create the entry for a tracking id, returning it together
    /// with the delivery attempt number (0 = first). Creation and
    /// first-attempt detection are atomic under the table lock, so exactly
    /// one of any number of racing attempts observes attempt 0.
    pub fn track(&self, tracking_id: &str) -> (Arc<TrackerEntry>, u32) {
        let mut inner = self.lock();
        inner.maybe_sweep();
        if let Some(entry) = inner.entries.get(tracking_id) {
            let entry = Arc::clone(entry);
            drop(inner);
            let attempt = {
                let mut state = entry.lock();
                state.retry_count += 1;
                state.retry_count
            };
            debug!(tracking_id, attempt, "repeat delivery detected");
            (entry, attempt)
        } else {
            let entry = Arc::new(TrackerEntry::new());
            inner.entries.insert(tracking_id.to_string(), Arc::clone(&entry));
            (entry, 0)
        }
    }

    pub fn evict(&self, tracking_id: &str) {
        self.lock().entries.remove(tracking_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Enter interactive-continuation mode for a conversation.
    pub fn set_waiting(
        &self,
        key: ConversationKey,
        entry: Arc<TrackerEntry>,
        max_continue_count: u32,
    ) {
        self.lock().waiting.insert(key, WaitingState {
            entry,
            continue_count: 0,
            max_continue_count,
        });
    }

    #[must_use]
    pub fn waiting(&self, key: &ConversationKey) -> Option<WaitingSnapshot> {
        let inner = self.lock();
        inner.waiting.get(key).map(|w| WaitingSnapshot {
            entry: Arc::clone(&w.entry),
            continue_count: w.continue_count,
            max_continue_count: w.max_continue_count,
        })
    }

    /// Consume one keep-waiting chance; returns the new count.
    pub fn bump_continue(&self, key: &ConversationKey) -> Option<u32> {
        let mut inner = self.lock();
        inner.waiting.get_mut(key).map(|w| {
            w.continue_count += 1;
            w.continue_count
        })
    }

    pub fn clear_waiting(&self, key: &ConversationKey) -> bool {
        self.lock().waiting.remove(key).is_some()
    }
}
