//! Keyed, cancelable delayed execution.
//!
//! Each key holds at most one pending dispatch. Scheduling a key replaces
//! its pending dispatch, so a burst of updates collapses into one action
//! carrying the last payload. When the delay elapses the task removes its
//! own slot under the map lock before running the action; from that point
//! on `cancel` no longer sees it and the action always runs to completion.
//!
//! Callers whose work between arrival and scheduling can interleave take a
//! [`DispatchTicket`] on arrival. Tickets are ordered per key: scheduling
//! with a ticket older than one the key already accepted is a no-op, even
//! after that newer dispatch has run.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const DEFAULT_DEBOUNCE_DELAY: Duration = Duration::from_secs(5);

struct PendingSlot {
    generation: u64,
    cancel_tx: watch::Sender<bool>,
}

/// Per-key bookkeeping. The entry lives while a dispatch is pending or a
/// ticket is outstanding, so `latest` outlives the dispatch it belongs to.
#[derive(Default)]
struct KeyState {
    latest: Option<u64>,
    outstanding: usize,
    pending: Option<PendingSlot>,
}

impl KeyState {
    fn is_idle(&self) -> bool {
        self.outstanding == 0 && self.pending.is_none()
    }
}

type PendingMap = Arc<Mutex<HashMap<String, KeyState>>>;

/// Arrival order reservation for one key. Dropping an unused ticket
/// releases it.
#[must_use = "a ticket only orders dispatches when passed to `schedule_ticket`"]
pub struct DispatchTicket {
    pending: PendingMap,
    key: String,
    generation: u64,
    released: bool,
}

impl DispatchTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn release(&mut self, keys: &mut HashMap<String, KeyState>) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(state) = keys.get_mut(&self.key) {
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.is_idle() {
                keys.remove(&self.key);
            }
        }
    }
}

impl Drop for DispatchTicket {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pending = Arc::clone(&self.pending);
        let mut keys = lock_pending(&pending);
        self.release(&mut keys);
    }
}

pub struct DebounceScheduler<P> {
    delay: Duration,
    next_generation: AtomicU64,
    pending: PendingMap,
    _payload: PhantomData<fn(P)>,
}

impl<P> Default for DebounceScheduler<P>
where
    P: Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_DELAY)
    }
}

impl<P> DebounceScheduler<P>
where
    P: Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_generation: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            _payload: PhantomData,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Reserves the next position in `key`'s arrival order.
    pub fn reserve(&self, key: &str) -> DispatchTicket {
        let mut keys = lock_pending(&self.pending);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        keys.entry(key.to_string()).or_default().outstanding += 1;
        DispatchTicket {
            pending: Arc::clone(&self.pending),
            key: key.to_string(),
            generation,
            released: false,
        }
    }

    /// Arms `action(payload)` for `key` after the delay, cancelling any
    /// dispatch still pending for the same key.
    pub fn schedule<F, Fut>(&self, key: &str, payload: P, action: F)
    where
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let ticket = self.reserve(key);
        self.schedule_ticket(ticket, payload, action);
    }

    /// Like [`Self::schedule`] for the ticket's key. Returns false, and
    /// drops `payload`, when the key already accepted a newer ticket.
    pub fn schedule_ticket<F, Fut>(
        &self,
        mut ticket: DispatchTicket,
        payload: P,
        action: F,
    ) -> bool
    where
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let generation = ticket.generation;
        let key = ticket.key.clone();
        let mut keys = lock_pending(&self.pending);
        let superseded = keys
            .get(&key)
            .and_then(|state| state.latest)
            .is_some_and(|latest| generation < latest);
        if superseded {
            ticket.release(&mut keys);
            debug!(key = %key, generation, "ignored out-of-order dispatch");
            return false;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = keys.entry(key.clone()).or_default();
        if let Some(previous) = state.pending.take() {
            previous.cancel_tx.send_replace(true);
            debug!(key = %key, "replaced pending dispatch");
        }
        state.latest = Some(generation);
        state.pending = Some(PendingSlot {
            generation,
            cancel_tx,
        });
        ticket.release(&mut keys);
        tokio::spawn(run_pending(
            Arc::clone(&self.pending),
            key.clone(),
            generation,
            self.delay,
            cancel_rx,
            payload,
            action,
        ));
        info!(
            key = %key,
            delay_ms = self.delay.as_millis() as u64,
            "scheduled dispatch"
        );
        true
    }

    /// Cancels the pending dispatch for `key`. Returns false when nothing was
    /// pending, including when the dispatch has already started.
    pub fn cancel(&self, key: &str) -> bool {
        let mut keys = lock_pending(&self.pending);
        let Some(state) = keys.get_mut(key) else {
            return false;
        };
        let Some(slot) = state.pending.take() else {
            return false;
        };
        if state.is_idle() {
            keys.remove(key);
        }
        slot.cancel_tx.send_replace(true);
        debug!(key, "cancelled pending dispatch");
        true
    }

    /// Cancels every pending dispatch and returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut keys = lock_pending(&self.pending);
        let mut cancelled = 0;
        for state in keys.values_mut() {
            if let Some(slot) = state.pending.take() {
                slot.cancel_tx.send_replace(true);
                cancelled += 1;
            }
        }
        keys.retain(|_, state| !state.is_idle());
        if cancelled > 0 {
            info!(cancelled, "cancelled all pending dispatches");
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending)
            .values()
            .filter(|state| state.pending.is_some())
            .count()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock_pending(&self.pending)
            .get(key)
            .is_some_and(|state| state.pending.is_some())
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, KeyState>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_pending<P, F, Fut>(
    pending: PendingMap,
    key: String,
    generation: u64,
    delay: Duration,
    mut cancel_rx: watch::Receiver<bool>,
    payload: P,
    action: F,
) where
    F: FnOnce(P) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    tokio::select! {
        _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
            debug!(key = %key, "pending dispatch cancelled before expiry");
            return;
        }
        _ = tokio::time::sleep(delay) => {}
    }

    {
        let mut keys = lock_pending(&pending);
        let Some(state) = keys.get_mut(&key) else {
            debug!(key = %key, "pending dispatch superseded at expiry");
            return;
        };
        let owns_slot = state
            .pending
            .as_ref()
            .is_some_and(|slot| slot.generation == generation);
        if !owns_slot {
            debug!(key = %key, "pending dispatch superseded at expiry");
            return;
        }
        state.pending = None;
        if state.is_idle() {
            keys.remove(&key);
        }
    }

    info!(key = %key, "dispatching after debounce delay");
    match AssertUnwindSafe(action(payload)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(dispatch_error)) => {
            warn!(
                key = %key,
                error = %format!("{dispatch_error:#}"),
                "debounced dispatch failed"
            );
        }
        Err(_) => {
            error!(key = %key, "debounced dispatch panicked");
        }
    }
}
