//! Deadline-ordered message queue shared between producers and the
//! dispatch thread.
//!
//! Ordering rules:
//! - front-of-queue messages come before every timed message, newest first;
//! - timed messages are ordered by deadline, then by enqueue order.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::message::Message;

/// Receiver of fired messages.
///
/// `dispatch` runs on the dispatch thread with no queue lock held, so
/// implementations may enqueue or cancel messages re-entrantly.
pub trait MessageTarget: Send + Sync {
    fn dispatch(&self, msg: Message);
}

/// Identity of one bound [`MessageTarget`] within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SlotKey {
    Front(Reverse<u64>),
    At(Instant, u64),
}

impl SlotKey {
    fn is_due(&self, now: Instant) -> bool {
        match self {
            Self::Front(_) => true,
            Self::At(deadline, _) => *deadline <= now,
        }
    }
}

pub(crate) struct Envelope {
    pub(crate) target: TargetId,
    pub(crate) sink: Arc<dyn MessageTarget>,
    pub(crate) msg: Message,
}

#[derive(Default)]
struct QueueState {
    slots: BTreeMap<SlotKey, Envelope>,
    next_seq: u64,
    quitting: bool,
}

impl QueueState {
    fn insert(&mut self, key_for: impl FnOnce(u64) -> SlotKey, envelope: Envelope) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.slots.insert(key_for(seq), envelope);
    }
}

pub(crate) struct MessageQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
    next_target: AtomicU64,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            next_target: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_target(&self) -> TargetId {
        TargetId(self.next_target.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns `false` once the queue is quitting.
    pub(crate) fn enqueue_at(&self, envelope: Envelope, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if state.quitting {
            return false;
        }
        state.insert(|seq| SlotKey::At(deadline, seq), envelope);
        drop(state);
        self.wake.notify_one();
        true
    }

    pub(crate) fn enqueue_front(&self, envelope: Envelope) -> bool {
        let mut state = self.state.lock();
        if state.quitting {
            return false;
        }
        state.insert(|seq| SlotKey::Front(Reverse(seq)), envelope);
        drop(state);
        self.wake.notify_one();
        true
    }

    /// Remove every message bound to `target` for which `predicate` holds.
    pub(crate) fn remove_where(
        &self,
        target: TargetId,
        predicate: impl Fn(&Message) -> bool,
    ) -> usize {
        let mut state = self.state.lock();
        let before = state.slots.len();
        state
            .slots
            .retain(|_, env| env.target != target || !predicate(&env.msg));
        before - state.slots.len()
    }

    pub(crate) fn any_where(&self, target: TargetId, predicate: impl Fn(&Message) -> bool) -> bool {
        self.state
            .lock()
            .slots
            .values()
            .any(|env| env.target == target && predicate(&env.msg))
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub(crate) fn is_quitting(&self) -> bool {
        self.state.lock().quitting
    }

    /// Stop accepting messages, drop everything pending and wake the loop.
    pub(crate) fn quit(&self) -> usize {
        let mut state = self.state.lock();
        state.quitting = true;
        let dropped = std::mem::take(&mut state.slots);
        drop(state);
        self.wake.notify_all();
        dropped.len()
    }

    /// Block until the earliest message is due and pop it.
    ///
    /// Returns `None` when the queue is quitting.
    pub(crate) fn next(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        loop {
            if state.quitting {
                return None;
            }
            let now = Instant::now();
            let head = state.slots.first_key_value().map(|(key, _)| *key);
            match head {
                Some(key) if key.is_due(now) => {
                    return state.slots.remove(&key);
                }
                Some(SlotKey::At(deadline, _)) => {
                    let _ = self.wake.wait_until(&mut state, deadline);
                }
                Some(SlotKey::Front(_)) | None => {
                    self.wake.wait(&mut state);
                }
            }
        }
    }

    /// Pop the earliest message if it is already due, without blocking.
    #[cfg(test)]
    pub(crate) fn try_next(&self, now: Instant) -> Option<Envelope> {
        let mut state = self.state.lock();
        let key = *state.slots.first_key_value()?.0;
        if key.is_due(now) {
            state.slots.remove(&key)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Nop;

    impl MessageTarget for Nop {
        fn dispatch(&self, _msg: Message) {}
    }

    fn envelope(target: TargetId, what: i32) -> Envelope {
        Envelope {
            target,
            sink: Arc::new(Nop),
            msg: Message::with_what(what),
        }
    }

    fn drain_whats(queue: &MessageQueue, now: Instant) -> Vec<i32> {
        std::iter::from_fn(|| queue.try_next(now))
            .map(|env| env.msg.what)
            .collect()
    }

    // ── ordering ───────────────────────────────────────────────

    #[test]
    fn timed_messages_pop_in_deadline_order() {
        let queue = MessageQueue::new();
        let t = queue.allocate_target();
        let base = Instant::now();
        assert!(queue.enqueue_at(envelope(t, 2), base + Duration::from_millis(20)));
        assert!(queue.enqueue_at(envelope(t, 1), base + Duration::from_millis(10)));
        assert!(queue.enqueue_at(envelope(t, 3), base + Duration::from_millis(30)));

        let whats = drain_whats(&queue, base + Duration::from_millis(100));
        assert_eq!(whats, vec![1, 2, 3]);
    }

    #[test]
    fn equal_deadlines_keep_enqueue_order() {
        let queue = MessageQueue::new();
        let t = queue.allocate_target();
        let at = Instant::now();
        for what in 0..5 {
            assert!(queue.enqueue_at(envelope(t, what), at));
        }
        assert_eq!(drain_whats(&queue, at), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn front_messages_jump_the_queue_newest_first() {
        let queue = MessageQueue::new();
        let t = queue.allocate_target();
        let at = Instant::now();
        assert!(queue.enqueue_at(envelope(t, 10), at));
        assert!(queue.enqueue_front(envelope(t, 1)));
        assert!(queue.enqueue_front(envelope(t, 2)));

        assert_eq!(drain_whats(&queue, at), vec![2, 1, 10]);
    }

    #[test]
    fn future_messages_are_not_due() {
        let queue = MessageQueue::new();
        let t = queue.allocate_target();
        let now = Instant::now();
        assert!(queue.enqueue_at(envelope(t, 1), now + Duration::from_secs(60)));
        assert!(queue.try_next(now).is_none());
        assert_eq!(queue.len(), 1);
    }

    // ── removal ────────────────────────────────────────────────

    #[test]
    fn remove_where_only_touches_own_target() {
        let queue = MessageQueue::new();
        let mine = queue.allocate_target();
        let theirs = queue.allocate_target();
        let at = Instant::now();
        assert!(queue.enqueue_at(envelope(mine, 1), at));
        assert!(queue.enqueue_at(envelope(mine, 2), at));
        assert!(queue.enqueue_at(envelope(theirs, 1), at));

        assert_eq!(queue.remove_where(mine, |m| m.what == 1), 1);
        assert!(queue.any_where(theirs, |m| m.what == 1));
        assert!(!queue.any_where(mine, |m| m.what == 1));
        assert_eq!(queue.remove_where(mine, |_| true), 1);
        assert_eq!(queue.len(), 1);
    }

    // ── quitting ───────────────────────────────────────────────

    #[test]
    fn quit_drops_pending_and_rejects_new_messages() {
        let queue = MessageQueue::new();
        let t = queue.allocate_target();
        assert!(queue.enqueue_at(envelope(t, 1), Instant::now()));
        assert_eq!(queue.quit(), 1);
        assert!(queue.is_quitting());
        assert!(!queue.enqueue_at(envelope(t, 2), Instant::now()));
        assert!(!queue.enqueue_front(envelope(t, 3)));
        assert!(queue.next().is_none());
    }
}
