//! Short-window duplicate suppression keyed by conversation id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(3);
const SWEEP_THRESHOLD: usize = 1_024;

#[derive(Debug, Clone)]
struct DedupEntry {
    content: String,
    seen_at: Instant,
}

#[derive(Debug, Default)]
struct DedupState {
    entries: HashMap<String, DedupEntry>,
    last_sweep: Option<Instant>,
}

/// An update is a duplicate when its content equals the last accepted
/// content for the same key and arrived strictly inside the window.
///
/// Past `SWEEP_THRESHOLD` entries, expired ones are swept at most once per
/// window.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    sweep_threshold: usize,
    state: Mutex<DedupState>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sweep_threshold: SWEEP_THRESHOLD,
            state: Mutex::new(DedupState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true when the update must be suppressed. Accepted updates
    /// replace the stored entry; suppressed ones leave it untouched.
    pub fn check_and_record(&self, key: &str, content: &str, now: Instant) -> bool {
        let mut state = self.lock_state();
        if let Some(entry) = state.entries.get(key) {
            let within_window = now.saturating_duration_since(entry.seen_at) < self.window;
            if within_window && entry.content == content {
                return true;
            }
        }

        state.entries.insert(
            key.to_string(),
            DedupEntry {
                content: content.to_string(),
                seen_at: now,
            },
        );
        let sweep_due = state
            .last_sweep
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window);
        if state.entries.len() > self.sweep_threshold && sweep_due {
            let window = self.window;
            state
                .entries
                .retain(|_, entry| now.saturating_duration_since(entry.seen_at) < window);
            state.last_sweep = Some(now);
        }
        false
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> MutexGuard<'_, DedupState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn with_sweep_threshold(mut self, sweep_threshold: usize) -> Self {
        self.sweep_threshold = sweep_threshold;
        self
    }
}
