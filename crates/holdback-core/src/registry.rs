//! Bookkeeping for messages that were scheduled but have not fired yet.
//!
//! # Design
//!
//! The live list sits behind a short-lived lock that is only ever held for a
//! copy or a single structural edit. Every read-then-mutate sequence works
//! the same way:
//!
//! 1. take a snapshot (shallow copy of the `Arc`s),
//! 2. scan the snapshot without holding the lock,
//! 3. remove the chosen holder from the live list *by identity*.
//!
//! Step 3 can fail if another thread removed the holder first; the caller
//! that succeeds owns the holder. No scan ever observes a mutation in
//! progress, and no lock is held while holders are finalized or the
//! delivery engine is called.

use std::sync::Arc;
use std::time::Instant;

use looper::MessageId;
use parking_lot::Mutex;
use tracing::debug;

use crate::holder::MessageHolder;

#[derive(Debug, Default)]
pub struct PendingRegistry {
    holders: Mutex<Vec<Arc<MessageHolder>>>,
    verbose: bool,
}

impl PendingRegistry {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self {
            holders: Mutex::new(Vec::new()),
            verbose,
        }
    }

    pub fn add(&self, holder: Arc<MessageHolder>) {
        let mut holders = self.holders.lock();
        holders.push(holder);
        let pending = holders.len();
        drop(holders);
        if self.verbose {
            debug!(pending, "registry add");
        }
    }

    /// Remove exactly this holder. Returns `false` if it was already gone.
    pub fn remove(&self, holder: &Arc<MessageHolder>) -> bool {
        let mut holders = self.holders.lock();
        let Some(index) = holders.iter().position(|h| Arc::ptr_eq(h, holder)) else {
            return false;
        };
        holders.remove(index);
        let pending = holders.len();
        drop(holders);
        if self.verbose {
            debug!(pending, message = %holder.id(), "registry remove");
        }
        true
    }

    /// Remove the first holder, in scheduling order, matching `predicate`.
    pub fn remove_first(
        &self,
        predicate: impl Fn(&MessageHolder) -> bool,
    ) -> Option<Arc<MessageHolder>> {
        loop {
            let candidate = self
                .snapshot()
                .into_iter()
                .find(|holder| predicate(holder))?;
            if self.remove(&candidate) {
                return Some(candidate);
            }
            // Lost the race for this one; rescan.
        }
    }

    /// Remove the first holder for `id` whose deadline has arrived.
    pub fn remove_due(&self, id: MessageId, now: Instant) -> Option<Arc<MessageHolder>> {
        self.remove_first(|holder| holder.matches_id(id) && holder.target_time() <= now)
    }

    /// Point-in-time shallow copy of the live list.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<MessageHolder>> {
        self.holders.lock().clone()
    }

    /// Take every holder out of the registry without finalizing them.
    ///
    /// The caller owns the returned holders.
    pub fn drain(&self) -> Vec<Arc<MessageHolder>> {
        let drained = std::mem::take(&mut *self.holders.lock());
        if self.verbose {
            debug!(drained = drained.len(), "registry drain");
        }
        drained
    }

    /// Remove and finalize every holder. Returns how many were released.
    pub fn clear(&self) -> usize {
        let drained = self.drain();
        for holder in &drained {
            holder.dead();
        }
        drained.len()
    }

    #[must_use]
    pub fn contains(&self, holder: &Arc<MessageHolder>) -> bool {
        self.holders.lock().iter().any(|h| Arc::ptr_eq(h, holder))
    }

    #[must_use]
    pub fn any(&self, predicate: impl Fn(&MessageHolder) -> bool) -> bool {
        self.snapshot().iter().any(|holder| predicate(holder))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.lock().is_empty()
    }
}
