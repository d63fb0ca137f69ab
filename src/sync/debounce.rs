use std::collections::BTreeSet;
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Coalesces bursts of path events into batches
///
/// Every event pushes the deadline back by `delay`. The batch is ready once
/// the deadline passes with no new event. Time is passed in explicitly so
/// the caller decides how to wait.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: BTreeSet<String>,
    deadline: Option<Instant>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: BTreeSet::new(),
            deadline: None,
        }
    }

    pub fn push(&mut self, key: impl Into<String>, now: Instant) {
        self.pending.insert(key.into());
        self.deadline = Some(now + self.delay);
    }

    /// When the pending batch becomes ready; `None` when nothing is pending
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take the batch if its deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<Vec<String>> {
        match self.deadline {
            Some(deadline) if now >= deadline => Some(self.flush()),
            _ => None,
        }
    }

    /// Take whatever is pending, ready or not
    pub fn flush(&mut self) -> Vec<String> {
        self.deadline = None;
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}
