//! Job ids a client is still waiting on.
//!
//! An id leaves the set when it completes, fails, is reported `not_found`
//! `not_found_limit` times in a row, or has been waited on longer than `ttl`.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Pending {
    id: String,
    added_at: Instant,
    not_found: u32,
}

#[derive(Debug)]
pub struct OutstandingJobs {
    pending: Vec<Pending>,
    not_found_limit: u32,
    ttl: Duration,
}

impl OutstandingJobs {
    pub fn new(not_found_limit: u32, ttl: Duration) -> Self {
        Self {
            pending: Vec::new(),
            not_found_limit: not_found_limit.max(1),
            ttl,
        }
    }

    /// Add ids in order, skipping ones already present.
    pub fn extend<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Instant::now();
        for id in ids {
            let id = id.into();
            if !self.contains(&id) {
                self.pending.push(Pending {
                    id,
                    added_at: now,
                    not_found: 0,
                });
            }
        }
    }

    pub fn insert(&mut self, id: impl Into<String>) {
        self.extend([id.into()]);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.iter().any(|p| p.id == id)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.id != id);
        self.pending.len() != before
    }

    pub fn ids(&self) -> Vec<String> {
        self.pending.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Count a `not_found` observation. Returns true if the id was dropped.
    pub fn observe_not_found(&mut self, id: &str) -> bool {
        let limit = self.not_found_limit;
        let Some(pending) = self.pending.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        pending.not_found += 1;
        if pending.not_found >= limit {
            self.remove(id);
            return true;
        }
        false
    }

    /// The id was seen in a live state; its `not_found` streak ends.
    pub fn observe_live(&mut self, id: &str) {
        if let Some(pending) = self.pending.iter_mut().find(|p| p.id == id) {
            pending.not_found = 0;
        }
    }

    /// Drop ids waited on longer than the ttl and return them.
    pub fn expire(&mut self) -> Vec<String> {
        let now = Instant::now();
        let ttl = self.ttl;
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|p| now.duration_since(p.added_at) >= ttl);
        self.pending = kept;
        expired.into_iter().map(|p| p.id).collect()
    }
}
