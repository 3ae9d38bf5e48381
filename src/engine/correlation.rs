//! Pending IQ table.
//!
//! Maps an outbound IQ's id to the listener waiting for its reply and the
//! instant the entry expires. Every way out of the table (match, expiry,
//! flush) removes the entry, so a listener can never fire twice. Callers
//! invoke the returned listeners after releasing the table's lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::component::IqResultListener;

struct PendingIq {
    listener: Arc<dyn IqResultListener>,
    deadline: Instant,
}

/// Outstanding IQ requests of one engine.
#[derive(Default)]
pub struct PendingIqs {
    entries: HashMap<String, PendingIq>,
}

impl std::fmt::Debug for PendingIqs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingIqs")
            .field("pending", &self.entries.len())
            .finish()
    }
}

impl PendingIqs {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for replies to `id`, expiring after `ttl`.
    ///
    /// Reusing an id that is still pending replaces the earlier listener;
    /// callers must not do that.
    pub fn register(&mut self, id: &str, listener: Arc<dyn IqResultListener>, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        if self
            .entries
            .insert(id.to_string(), PendingIq { listener, deadline })
            .is_some()
        {
            log::warn!("[IQ] Correlation id '{id}' reused while still pending");
        }
    }

    /// Remove and return the listener waiting on `id`.
    pub fn take(&mut self, id: &str) -> Option<Arc<dyn IqResultListener>> {
        self.entries.remove(id).map(|p| p.listener)
    }

    /// Remove and return every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, Arc<dyn IqResultListener>)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|p| (id, p.listener)))
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<(String, Arc<dyn IqResultListener>)> {
        self.entries
            .drain()
            .map(|(id, p)| (id, p.listener))
            .collect()
    }

    /// Whether a listener is registered for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
