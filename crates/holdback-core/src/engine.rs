//! The seam between the pause-aware controller and whatever actually delivers
//! messages.
//!
//! A [`DeliveryEngine`] is a timer queue bound to one fire target. The
//! controller decides *whether* a message may be scheduled; the engine only
//! decides *when* it fires. Engines may fire stale entries after a
//! cancellation raced with the fire; the controller's fire gate drops those.

use std::time::Instant;

pub use looper::{Message, MessageId, MessageTarget, Runnable};

/// Timed delivery of messages to one bound target.
pub trait DeliveryEngine: Send + Sync {
    /// Queue `msg` to fire at `deadline`. `false` means the engine refused
    /// (for example because its loop has quit).
    fn schedule_at(&self, msg: Message, deadline: Instant) -> bool;

    /// Queue `msg` ahead of everything already queued.
    fn schedule_at_front(&self, msg: Message) -> bool;

    /// Drop every queued message of the bound target.
    fn cancel_all(&self);

    /// Drop queued messages of the bound target matching `predicate`.
    fn cancel_matching(&self, predicate: &dyn Fn(&Message) -> bool);
}

impl DeliveryEngine for looper::Handler {
    fn schedule_at(&self, msg: Message, deadline: Instant) -> bool {
        self.send_at(msg, deadline)
    }

    fn schedule_at_front(&self, msg: Message) -> bool {
        self.send_at_front(msg)
    }

    fn cancel_all(&self) {
        self.remove_all();
    }

    fn cancel_matching(&self, predicate: &dyn Fn(&Message) -> bool) {
        self.remove_matching(predicate);
    }
}
