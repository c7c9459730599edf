//! A deterministic, single-threaded-by-convention delivery engine.
//!
//! Nothing fires on its own: tests move a [`ManualClock`] forward with
//! [`ManualEngine::advance`] and every due message is dispatched on the
//! calling thread, one at a time, with no lock held. Front-of-queue messages
//! fire first (newest first); timed messages fire in deadline order, ties in
//! scheduling order.
//!
//! ```ignore
//! let clock = ManualClock::new();
//! let engine = ManualEngine::new(clock.clone());
//! let handler = MessageHandler::builder()
//!     .clock(clock.clone())
//!     .on_message(|m| println!("{}", m.what))
//!     .bind(engine.bind())?;
//! handler.send_message_delayed(Message::with_what(1), Duration::from_millis(10))?;
//! engine.advance(Duration::from_millis(10));
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::{Clock, ManualClock};
use crate::engine::{DeliveryEngine, Message, MessageId, MessageTarget};

#[derive(Default)]
struct Queued {
    front: VecDeque<Message>,
    timed: BTreeMap<(Instant, u64), Message>,
    next_seq: u64,
    closed: bool,
}

impl Queued {
    fn pop_due(&mut self, now: Instant) -> Option<Message> {
        if let Some(msg) = self.front.pop_front() {
            return Some(msg);
        }
        let key = *self.timed.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.timed.remove(&key)
    }
}

struct Shared {
    clock: ManualClock,
    target: OnceLock<Arc<dyn MessageTarget>>,
    queued: Mutex<Queued>,
}

/// In-memory [`DeliveryEngine`] driven by a [`ManualClock`].
///
/// Clones share the same queue, so a test keeps one handle while the
/// controller owns another.
#[derive(Clone)]
pub struct ManualEngine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ManualEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualEngine")
            .field("pending", &self.pending())
            .field("bound", &self.shared.target.get().is_some())
            .finish()
    }
}

impl ManualEngine {
    #[must_use]
    pub fn new(clock: ManualClock) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                target: OnceLock::new(),
                queued: Mutex::new(Queued::default()),
            }),
        }
    }

    /// Binder for [`MessageHandlerBuilder::bind`](crate::controller::MessageHandlerBuilder::bind).
    ///
    /// Binding twice keeps the first target.
    pub fn bind(&self) -> impl FnOnce(Arc<dyn MessageTarget>) -> Self + use<> {
        let engine = self.clone();
        move |target| {
            let _ = engine.shared.target.set(target);
            engine
        }
    }

    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.shared.clock
    }

    /// Move time forward by `by` and fire everything that became due.
    pub fn advance(&self, by: Duration) -> usize {
        self.shared.clock.advance(by);
        self.run_due()
    }

    /// Fire every message due at the current manual time.
    ///
    /// Messages scheduled by a handler while this runs are picked up in the
    /// same call if they are already due.
    pub fn run_due(&self) -> usize {
        let Some(target) = self.shared.target.get() else {
            return 0;
        };
        let mut fired = 0;
        loop {
            let now = self.shared.clock.now();
            let next = self.shared.queued.lock().pop_due(now);
            let Some(msg) = next else {
                return fired;
            };
            target.dispatch(msg);
            fired += 1;
        }
    }

    /// Hand `msg` straight to the bound target, bypassing the queue.
    ///
    /// Models a timer that fires after its cancellation or after the
    /// controller went away.
    pub fn fire_directly(&self, msg: Message) -> bool {
        match self.shared.target.get() {
            Some(target) => {
                target.dispatch(msg);
                true
            }
            None => false,
        }
    }

    /// Refuse every later schedule and drop what is queued.
    pub fn close(&self) {
        let mut queued = self.shared.queued.lock();
        queued.closed = true;
        queued.front.clear();
        queued.timed.clear();
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        let queued = self.shared.queued.lock();
        queued.front.len() + queued.timed.len()
    }

    /// Queued message ids in the order they would fire.
    #[must_use]
    pub fn scheduled_ids(&self) -> Vec<MessageId> {
        let queued = self.shared.queued.lock();
        queued
            .front
            .iter()
            .chain(queued.timed.values())
            .map(Message::id)
            .collect()
    }

    /// Earliest timed deadline, ignoring front-of-queue entries.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.queued.lock().timed.keys().next().map(|(at, _)| *at)
    }
}

impl DeliveryEngine for ManualEngine {
    fn schedule_at(&self, msg: Message, deadline: Instant) -> bool {
        let mut queued = self.shared.queued.lock();
        if queued.closed {
            return false;
        }
        let seq = queued.next_seq;
        queued.next_seq += 1;
        queued.timed.insert((deadline, seq), msg);
        true
    }

    fn schedule_at_front(&self, msg: Message) -> bool {
        let mut queued = self.shared.queued.lock();
        if queued.closed {
            return false;
        }
        queued.front.push_front(msg);
        true
    }

    fn cancel_all(&self) {
        let mut queued = self.shared.queued.lock();
        queued.front.clear();
        queued.timed.clear();
    }

    fn cancel_matching(&self, predicate: &dyn Fn(&Message) -> bool) {
        let mut queued = self.shared.queued.lock();
        queued.front.retain(|m| !predicate(m));
        queued.timed.retain(|_, m| !predicate(m));
    }
}
