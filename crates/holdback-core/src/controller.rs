//! Pausable delayed dispatch.
//!
//! [`MessageHandler`] wraps a [`DeliveryEngine`] and adds three things the
//! engine does not have: pausing every pending and future delivery, resuming
//! with each message's *remaining* delay, and a terminal kill switch.
//!
//! # States
//!
//! ```text
//!            pause()              kill_self()
//!   Active ──────────► Paused ─────────────► Dead
//!      ▲                  │                   ▲
//!      └──── resume() ────┘                   │
//!      └──────────────── kill_self() ─────────┘
//! ```
//!
//! Every schedule passes the *outgoing gate* and every engine fire passes
//! the *incoming gate*:
//!
//! | State  | outgoing schedule                     | incoming fire                     |
//! |--------|---------------------------------------|-----------------------------------|
//! | Active | holder registered, engine timer set   | holder removed, message delivered |
//! | Paused | holder registered already stopped     | suppressed, holder kept           |
//! | Dead   | discarded                             | suppressed                        |
//!
//! A fire is delivered only if it removed a holder from the registry, so a
//! timer that outlived a cancel, pause or resume can never deliver twice.
//!
//! # Ownership
//!
//! Whoever removes a holder from the registry owns it and must deliver,
//! resubmit or finalize it. Pause, resume and the cancel operations are
//! serialized against each other; scheduling and firing never take that
//! lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{Clock, MonotonicClock};
use crate::config::DispatchConfig;
use crate::engine::{DeliveryEngine, Message, MessageTarget, Runnable};
use crate::error::{Error, Result};
use crate::holder::MessageHolder;
use crate::registry::PendingRegistry;

/// Debug event gated on the handler's own `verbose` setting.
macro_rules! verbose {
    ($inner:expr, $($field:tt)+) => {
        if $inner.config.verbose {
            tracing::debug!(handler = %$inner.config.name, $($field)+);
        }
    };
}

/// Lifecycle state of a [`MessageHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Active,
    Paused,
    /// Terminal.
    Dead,
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Result of the incoming gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The gate consumed the fire; nothing is delivered.
    Suppressed,
    /// Deliver the message to the handler.
    Forwarded,
}

/// What happened to a schedule request.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// Registered and handed to the engine.
    Scheduled,
    /// Registered while paused; the next resume schedules it.
    Held,
    /// The handler is dead; the message was dropped.
    Discarded,
    /// The engine refused the message (its loop has quit).
    Rejected,
}

impl ScheduleOutcome {
    /// The message will be delivered unless cancelled.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Scheduled | Self::Held)
    }

    /// The gate intercepted the request instead of passing it to the engine.
    #[must_use]
    pub const fn is_consumed(self) -> bool {
        matches!(self, Self::Held | Self::Discarded)
    }
}

#[derive(Debug, Clone, Copy)]
enum Placement {
    At(Instant),
    Front,
}

/// Outgoing gate verdict.
enum Admission {
    Discarded,
    Held,
    /// A resume ran while the holder was being parked; schedule again at
    /// the given deadline.
    Raced(Instant),
    Admitted(Arc<MessageHolder>),
}

type Intercept = Box<dyn Fn(&Message) -> bool + Send + Sync>;
type OnMessage = Box<dyn Fn(&Message) + Send + Sync>;

struct Inner {
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    engine: Box<dyn DeliveryEngine>,
    registry: PendingRegistry,
    paused: AtomicBool,
    /// When the current pause began. Holders that slipped past the pause
    /// snapshot are stopped at this instant on resume.
    paused_at: Mutex<Option<Instant>>,
    dead: AtomicBool,
    transition: ReentrantMutex<()>,
    intercept: Option<Intercept>,
    on_message: Option<OnMessage>,
}

impl Inner {
    fn state(&self) -> DispatchState {
        if self.dead.load(Ordering::Acquire) {
            DispatchState::Dead
        } else if self.paused.load(Ordering::Acquire) {
            DispatchState::Paused
        } else {
            DispatchState::Active
        }
    }

    /// Give up a holder this call just registered, if nobody else took it.
    fn withdraw(&self, holder: &Arc<MessageHolder>) {
        if self.registry.remove(holder) {
            holder.dead();
        }
    }

    fn on_outgoing_schedule(&self, msg: &Message, deadline: Instant) -> Admission {
        if self.dead.load(Ordering::Acquire) {
            verbose!(self, message = %msg.id(), what = msg.what, "schedule discarded: dead");
            return Admission::Discarded;
        }

        let holder = Arc::new(MessageHolder::new(msg.clone(), deadline));

        if self.paused.load(Ordering::Acquire) {
            let remaining = holder.stop(self.clock.now());
            self.registry.add(Arc::clone(&holder));

            if self.dead.load(Ordering::Acquire) {
                self.withdraw(&holder);
                return Admission::Discarded;
            }
            if !self.paused.load(Ordering::Acquire) && self.registry.remove(&holder) {
                let now = self.clock.now();
                let delay = holder.resume(now);
                holder.dead();
                verbose!(self, message = %msg.id(), "resume raced a held schedule");
                return Admission::Raced(now.checked_add(delay).unwrap_or(deadline));
            }

            verbose!(
                self,
                message = %msg.id(),
                what = msg.what,
                remaining_ms = remaining.as_millis_signed(),
                pending = self.registry.len(),
                "schedule held while paused"
            );
            return Admission::Held;
        }

        self.registry.add(Arc::clone(&holder));
        if self.dead.load(Ordering::Acquire) {
            self.withdraw(&holder);
            return Admission::Discarded;
        }
        Admission::Admitted(holder)
    }

    fn on_incoming_fire(&self, msg: &Message) -> GateDecision {
        if self.dead.load(Ordering::Acquire) {
            verbose!(self, message = %msg.id(), "fire suppressed: dead");
            return GateDecision::Suppressed;
        }
        if self.paused.load(Ordering::Acquire) {
            verbose!(self, message = %msg.id(), "fire suppressed: paused");
            return GateDecision::Suppressed;
        }
        // Only a holder already due can be claimed. An engine never fires
        // early, so a fire ahead of every holder with this id is a leftover
        // timer from an earlier schedule of the same message.
        let now = self.clock.now();
        match self.registry.remove_due(msg.id(), now) {
            Some(holder) => {
                holder.dead();
                GateDecision::Forwarded
            }
            None => {
                verbose!(self, message = %msg.id(), "stale fire suppressed");
                GateDecision::Suppressed
            }
        }
    }

    fn deliver(&self, msg: &Message) {
        if let Some(callback) = msg.callback() {
            callback.run();
            return;
        }
        if let Some(intercept) = &self.intercept {
            if intercept(msg) {
                return;
            }
        }
        if let Some(on_message) = &self.on_message {
            on_message(msg);
        }
    }

    fn submit(&self, msg: Message, mut placement: Placement) -> ScheduleOutcome {
        loop {
            let deadline = match placement {
                Placement::At(deadline) => deadline,
                Placement::Front => self.clock.now(),
            };
            match self.on_outgoing_schedule(&msg, deadline) {
                Admission::Discarded => return ScheduleOutcome::Discarded,
                Admission::Held => return ScheduleOutcome::Held,
                Admission::Raced(at) => placement = Placement::At(at),
                Admission::Admitted(holder) => {
                    let id = msg.id();
                    let accepted = match placement {
                        Placement::At(deadline) => self.engine.schedule_at(msg, deadline),
                        Placement::Front => self.engine.schedule_at_front(msg),
                    };
                    if accepted {
                        verbose!(
                            self,
                            message = %id,
                            what = holder.what(),
                            pending = self.registry.len(),
                            "scheduled"
                        );
                        return ScheduleOutcome::Scheduled;
                    }
                    self.withdraw(&holder);
                    warn!(handler = %self.config.name, message = %id, "engine rejected schedule");
                    return ScheduleOutcome::Rejected;
                }
            }
        }
    }

    /// Engine first, registry second. A schedule adds its holder before it
    /// places the timer, so a timer that survives the engine cancel belongs
    /// to a holder added after it, and a holder the clear removes can only
    /// leave a stale timer behind.
    fn cancel_all(&self) -> usize {
        let _transition = self.transition.lock();
        self.engine.cancel_all();
        self.registry.clear()
    }

    fn remove_first(&self, predicate: impl Fn(&MessageHolder) -> bool) -> bool {
        let _transition = self.transition.lock();
        let Some(holder) = self.registry.remove_first(predicate) else {
            return false;
        };
        holder.dead();
        let id = holder.id();
        // A resend of the same message keeps its own timer. The removed
        // holder's timer, if earlier, finds nothing due and is suppressed.
        if !self.registry.any(|h| h.matches_id(id)) {
            self.engine.cancel_matching(&|m| m.id() == id);
        }
        verbose!(self, message = %id, pending = self.registry.len(), "removed");
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.engine.cancel_all();
        self.registry.clear();
    }
}

/// The engine's fire target. Holds the controller weakly so the engine
/// never keeps it alive.
struct FireGate {
    inner: Weak<Inner>,
}

impl MessageTarget for FireGate {
    fn dispatch(&self, msg: Message) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.on_incoming_fire(&msg) == GateDecision::Forwarded {
            inner.deliver(&msg);
        }
    }
}

/// Builds a [`MessageHandler`] bound to one delivery engine.
pub struct MessageHandlerBuilder {
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    intercept: Option<Intercept>,
    on_message: Option<OnMessage>,
}

impl Default for MessageHandlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageHandlerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandlerBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("intercept", &self.intercept.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

impl MessageHandlerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
            clock: Arc::new(MonotonicClock),
            intercept: None,
            on_message: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for deadlines. Must be the clock the engine fires by; a
    /// fire is only honored once this clock has reached the deadline.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Runs before the handler; returning `true` marks the message handled.
    #[must_use]
    pub fn intercept(mut self, intercept: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        self.intercept = Some(Box::new(intercept));
        self
    }

    /// Called once for every delivered message that is not a posted
    /// callback and was not intercepted.
    #[must_use]
    pub fn on_message(mut self, on_message: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(on_message));
        self
    }

    /// Bind to an engine. `make_engine` receives the fire target the engine
    /// must dispatch to.
    pub fn bind<E, F>(self, make_engine: F) -> Result<MessageHandler>
    where
        E: DeliveryEngine + 'static,
        F: FnOnce(Arc<dyn MessageTarget>) -> E,
    {
        self.config.validate()?;
        let Self {
            config,
            clock,
            intercept,
            on_message,
        } = self;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let gate: Arc<dyn MessageTarget> = Arc::new(FireGate {
                inner: Weak::clone(weak),
            });
            Inner {
                registry: PendingRegistry::new(config.verbose),
                engine: Box::new(make_engine(gate)),
                config,
                clock,
                paused: AtomicBool::new(false),
                paused_at: Mutex::new(None),
                dead: AtomicBool::new(false),
                transition: ReentrantMutex::new(()),
                intercept,
                on_message,
            }
        });

        verbose!(inner, "handler bound");
        Ok(MessageHandler { inner })
    }

    /// Bind to a [`looper::Looper`].
    pub fn on_looper(self, looper: &looper::Looper) -> Result<MessageHandler> {
        self.bind(|target| looper.handler(target))
    }
}

/// Pause-aware scheduling front end for a [`DeliveryEngine`].
///
/// Cheap to clone; clones control the same handler. Dropping the last clone
/// cancels everything still pending.
#[derive(Clone)]
pub struct MessageHandler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("name", &self.inner.config.name)
            .field("state", &self.inner.state())
            .field("pending", &self.inner.registry.len())
            .finish()
    }
}

impl MessageHandler {
    #[must_use]
    pub fn builder() -> MessageHandlerBuilder {
        MessageHandlerBuilder::new()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    // -- scheduling ----------------------------------------------------------

    pub fn send_message(&self, msg: Message) -> ScheduleOutcome {
        let now = self.inner.clock.now();
        self.inner.submit(msg, Placement::At(now))
    }

    pub fn send_empty_message(&self, what: i32) -> ScheduleOutcome {
        self.send_message(Message::with_what(what))
    }

    /// Schedule `msg` after `delay`.
    ///
    /// # Errors
    ///
    /// [`Error::DeadlineOverflow`] if `now + delay` is not representable.
    pub fn send_message_delayed(&self, msg: Message, delay: Duration) -> Result<ScheduleOutcome> {
        let deadline = self.deadline_after(delay)?;
        Ok(self.inner.submit(msg, Placement::At(deadline)))
    }

    pub fn send_empty_message_delayed(&self, what: i32, delay: Duration) -> Result<ScheduleOutcome> {
        self.send_message_delayed(Message::with_what(what), delay)
    }

    /// Schedule `msg` at an absolute monotonic time. Past times fire as soon
    /// as possible.
    pub fn send_message_at_time(&self, msg: Message, at: Instant) -> ScheduleOutcome {
        self.inner.submit(msg, Placement::At(at))
    }

    /// Schedule `msg` ahead of everything the engine has queued.
    pub fn send_message_at_front_of_queue(&self, msg: Message) -> ScheduleOutcome {
        self.inner.submit(msg, Placement::Front)
    }

    pub fn post(&self, callback: Runnable) -> ScheduleOutcome {
        self.send_message(Message::from_callback(callback))
    }

    /// Run `callback` after `delay`.
    pub fn post_delayed(&self, callback: Runnable, delay: Duration) -> Result<ScheduleOutcome> {
        self.send_message_delayed(Message::from_callback(callback), delay)
    }

    pub fn post_at_time(&self, callback: Runnable, at: Instant) -> ScheduleOutcome {
        self.send_message_at_time(Message::from_callback(callback), at)
    }

    pub fn post_at_front_of_queue(&self, callback: Runnable) -> ScheduleOutcome {
        self.send_message_at_front_of_queue(Message::from_callback(callback))
    }

    fn deadline_after(&self, delay: Duration) -> Result<Instant> {
        self.inner
            .clock
            .now()
            .checked_add(delay)
            .ok_or(Error::DeadlineOverflow { delay })
    }

    // -- gates -----------------------------------------------------------------

    /// Incoming gate, as applied to every engine fire.
    ///
    /// A `Forwarded` result has already consumed the pending entry; the
    /// caller is then responsible for delivering `msg`.
    pub fn on_incoming_fire(&self, msg: &Message) -> GateDecision {
        self.inner.on_incoming_fire(msg)
    }

    // -- lifecycle -----------------------------------------------------------

    /// Stop delivering. Pending messages keep their remaining delay.
    pub fn pause(&self) {
        let inner = &*self.inner;
        let _transition = inner.transition.lock();
        if inner.dead.load(Ordering::Acquire) {
            return;
        }
        if inner
            .paused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let now = inner.clock.now();
        *inner.paused_at.lock() = Some(now);
        let held = inner.registry.snapshot();
        for holder in &held {
            holder.stop(now);
        }
        inner.engine.cancel_all();
        verbose!(inner, held = held.len(), "paused");
    }

    /// Reschedule everything held, each with its remaining delay.
    ///
    /// Messages whose deadline passed before the pause fire immediately.
    pub fn resume(&self) {
        let inner = &*self.inner;
        let _transition = inner.transition.lock();
        if inner.dead.load(Ordering::Acquire) {
            return;
        }
        if inner
            .paused
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let now = inner.clock.now();
        let paused_at = inner.paused_at.lock().take().unwrap_or(now);
        let mut drained = inner.registry.drain();
        drained.sort_by_key(|holder| holder.target_time());
        let resumed = drained.len();

        for holder in drained {
            // No-op unless the holder slipped past the pause snapshot.
            holder.stop_once(paused_at);
            let delay = holder.resume(now);
            let Some(msg) = holder.take_message() else {
                continue;
            };
            holder.dead();
            let deadline = now.checked_add(delay).unwrap_or_else(|| holder.target_time());
            let outcome = inner.submit(msg, Placement::At(deadline));
            verbose!(
                inner,
                message = %holder.id(),
                delay_ms = delay.as_millis() as u64,
                ?outcome,
                "resubmitted"
            );
        }
        verbose!(inner, resumed, "resumed");
    }

    /// Permanently disable this handler and drop everything pending.
    pub fn kill_self(&self) {
        let inner = &*self.inner;
        if inner.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        let released = inner.cancel_all();
        verbose!(inner, released, "killed");
    }

    /// Drop every pending message. The handler stays usable.
    pub fn cancel_all_messages(&self) {
        let released = self.inner.cancel_all();
        verbose!(self.inner, released, "cancelled all");
    }

    /// Remove the first pending message tagged `what`.
    ///
    /// Returns `false` if none is pending. Posted callbacks never match.
    pub fn remove_messages(&self, what: i32) -> bool {
        self.inner.remove_first(|holder| holder.matches_what(what))
    }

    /// Remove the first pending post of `callback`.
    pub fn remove_callbacks(&self, callback: &Runnable) -> bool {
        self.inner
            .remove_first(|holder| holder.matches_callback(callback))
    }

    // -- queries -------------------------------------------------------------

    #[must_use]
    pub fn has_messages(&self, what: i32) -> bool {
        self.inner.registry.any(|holder| holder.matches_what(what))
    }

    #[must_use]
    pub fn has_callbacks(&self, callback: &Runnable) -> bool {
        self.inner
            .registry
            .any(|holder| holder.matches_callback(callback))
    }

    /// Scheduled or held messages not yet delivered.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.inner.state()
    }

    /// A fresh message tagged `what`.
    #[must_use]
    pub fn obtain_message(&self, what: i32) -> Message {
        Message::with_what(what)
    }
}
