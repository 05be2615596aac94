use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::types::AnalysisEntry;

/// Entries retained.
pub const HISTORY_CAPACITY: usize = 50;
/// Entries returned by `/history`.
pub const HISTORY_VIEW: usize = 20;

/// Bounded log of recent `/predict` analyses, in insertion order.
///
/// Once `capacity` is reached the oldest entry is evicted on every append.
/// State lives only in memory and is lost on restart.
#[derive(Debug)]
pub struct History {
    entries: Mutex<VecDeque<AnalysisEntry>>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn append(&self, entry: AnalysisEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AnalysisEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
