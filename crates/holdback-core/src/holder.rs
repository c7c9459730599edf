//! One scheduled message plus its timing state.
//!
//! A holder is created when a send passes the outgoing gate and lives in the
//! [`PendingRegistry`](crate::registry::PendingRegistry) until it is
//! delivered, cancelled, or drained by a resume. Whoever removes it from the
//! registry owns it from then on.

use std::time::{Duration, Instant};

use looper::{Message, MessageId, Runnable};
use parking_lot::Mutex;

/// Time left until a deadline, captured at pause time.
///
/// `Overdue` means the deadline had already passed when the holder was
/// stopped; a plain `Duration` can't express that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RemainingDelay {
    Overdue(Duration),
    Ahead(Duration),
}

impl RemainingDelay {
    /// `target - now`, signed.
    #[must_use]
    pub fn between(target: Instant, now: Instant) -> Self {
        match target.checked_duration_since(now) {
            Some(ahead) => Self::Ahead(ahead),
            None => Self::Overdue(now.duration_since(target)),
        }
    }

    /// Non-negative wait: overdue deadlines fire immediately.
    #[must_use]
    pub const fn clamped(self) -> Duration {
        match self {
            Self::Ahead(ahead) => ahead,
            Self::Overdue(_) => Duration::ZERO,
        }
    }

    /// Signed milliseconds, for logging.
    #[must_use]
    pub fn as_millis_signed(self) -> i128 {
        match self {
            Self::Ahead(d) => d.as_millis() as i128,
            Self::Overdue(d) => -(d.as_millis() as i128),
        }
    }
}

#[derive(Debug)]
pub struct MessageHolder {
    id: MessageId,
    what: i32,
    callback: Option<Runnable>,
    target_time: Instant,
    message: Mutex<Option<Message>>,
    remaining: Mutex<Option<RemainingDelay>>,
}

impl MessageHolder {
    #[must_use]
    pub fn new(message: Message, target_time: Instant) -> Self {
        Self {
            id: message.id(),
            what: message.what,
            callback: message.callback().cloned(),
            target_time,
            message: Mutex::new(Some(message)),
            remaining: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    #[must_use]
    pub const fn what(&self) -> i32 {
        self.what
    }

    #[must_use]
    pub const fn target_time(&self) -> Instant {
        self.target_time
    }

    /// Remaining delay recorded by the last [`stop`](Self::stop).
    #[must_use]
    pub fn remaining_delay(&self) -> Option<RemainingDelay> {
        *self.remaining.lock()
    }

    /// Record `target_time - now`.
    pub fn stop(&self, now: Instant) -> RemainingDelay {
        let remaining = RemainingDelay::between(self.target_time, now);
        *self.remaining.lock() = Some(remaining);
        remaining
    }

    /// Record `target_time - at` unless a stop already recorded one.
    pub fn stop_once(&self, at: Instant) -> RemainingDelay {
        *self
            .remaining
            .lock()
            .get_or_insert_with(|| RemainingDelay::between(self.target_time, at))
    }

    /// Delay to resubmit with.
    ///
    /// Uses the remaining delay recorded at pause time, clamped to zero. A
    /// holder never stopped measures its remaining delay now.
    pub fn resume(&self, now: Instant) -> Duration {
        let mut remaining = self.remaining.lock();
        let recorded = remaining.get_or_insert_with(|| RemainingDelay::between(self.target_time, now));
        let delay = recorded.clamped();
        *remaining = Some(RemainingDelay::Ahead(delay));
        delay
    }

    /// Take the payload out for resubmission. `None` once finalized.
    pub fn take_message(&self) -> Option<Message> {
        self.message.lock().take()
    }

    /// Release the payload. Safe to call more than once.
    pub fn dead(&self) {
        drop(self.message.lock().take());
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.message.lock().is_none()
    }

    #[must_use]
    pub fn matches_id(&self, id: MessageId) -> bool {
        self.id == id
    }

    /// Tag match; posted callbacks never match a tag.
    #[must_use]
    pub fn matches_what(&self, what: i32) -> bool {
        self.callback.is_none() && self.what == what
    }

    #[must_use]
    pub fn matches_callback(&self, callback: &Runnable) -> bool {
        self.callback.as_ref().is_some_and(|own| own.same(callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn holder_at(base: Instant, offset_ms: u64) -> MessageHolder {
        MessageHolder::new(Message::with_what(7), base + MS * offset_ms as u32)
    }

    // -- RemainingDelay --------------------------------------------------------

    #[test]
    fn between_future_deadline_is_ahead() {
        let now = Instant::now();
        let target = now + 40 * MS;
        assert_eq!(RemainingDelay::between(target, now), RemainingDelay::Ahead(40 * MS));
    }

    #[test]
    fn between_past_deadline_is_overdue() {
        let target = Instant::now();
        let now = target + 15 * MS;
        let remaining = RemainingDelay::between(target, now);
        assert_eq!(remaining, RemainingDelay::Overdue(15 * MS));
        assert_eq!(remaining.as_millis_signed(), -15);
    }

    #[test]
    fn exact_deadline_is_zero_ahead() {
        let now = Instant::now();
        assert_eq!(
            RemainingDelay::between(now, now),
            RemainingDelay::Ahead(Duration::ZERO)
        );
    }

    #[test]
    fn clamped_never_goes_negative() {
        assert_eq!(RemainingDelay::Overdue(500 * MS).clamped(), Duration::ZERO);
        assert_eq!(RemainingDelay::Ahead(500 * MS).clamped(), 500 * MS);
    }

    // -- stop / resume ---------------------------------------------------------

    #[test]
    fn stop_records_remaining_delay() {
        let base = Instant::now();
        let holder = holder_at(base, 100);
        assert_eq!(holder.remaining_delay(), None);
        assert_eq!(holder.stop(base + 30 * MS), RemainingDelay::Ahead(70 * MS));
        assert_eq!(holder.remaining_delay(), Some(RemainingDelay::Ahead(70 * MS)));
    }

    #[test]
    fn resume_keeps_positive_remaining_delay() {
        let base = Instant::now();
        let holder = holder_at(base, 100);
        holder.stop(base + 30 * MS);
        // Time spent paused does not count.
        assert_eq!(holder.resume(base + 10_000 * MS), 70 * MS);
    }

    #[test]
    fn resume_clamps_overdue_to_zero() {
        let base = Instant::now();
        let holder = holder_at(base, 10);
        holder.stop(base + 25 * MS);
        assert_eq!(holder.remaining_delay(), Some(RemainingDelay::Overdue(15 * MS)));
        assert_eq!(holder.resume(base + 1_000 * MS), Duration::ZERO);
    }

    #[test]
    fn resume_without_stop_measures_now() {
        let base = Instant::now();
        let holder = holder_at(base, 100);
        assert_eq!(holder.resume(base + 60 * MS), 40 * MS);

        let late = holder_at(base, 100);
        assert_eq!(late.resume(base + 160 * MS), Duration::ZERO);
    }

    #[test]
    fn stop_once_keeps_the_first_recording() {
        let base = Instant::now();
        let holder = holder_at(base, 100);
        assert_eq!(holder.stop_once(base + 20 * MS), RemainingDelay::Ahead(80 * MS));
        assert_eq!(holder.stop_once(base + 90 * MS), RemainingDelay::Ahead(80 * MS));
        assert_eq!(holder.resume(base + 5_000 * MS), 80 * MS);

        let stopped = holder_at(base, 100);
        stopped.stop(base + 50 * MS);
        assert_eq!(stopped.stop_once(base + 10 * MS), RemainingDelay::Ahead(50 * MS));
    }

    // -- payload lifecycle -----------------------------------------------------

    #[test]
    fn dead_is_idempotent() {
        let holder = holder_at(Instant::now(), 0);
        assert!(!holder.is_dead());
        holder.dead();
        holder.dead();
        assert!(holder.is_dead());
        assert!(holder.take_message().is_none());
    }

    #[test]
    fn take_message_hands_out_payload_once() {
        let msg = Message::with_what(3);
        let holder = MessageHolder::new(msg.clone(), Instant::now());
        assert_eq!(holder.take_message().map(|m| m.id()), Some(msg.id()));
        assert!(holder.take_message().is_none());
    }

    // -- matching --------------------------------------------------------------

    #[test]
    fn matching_survives_finalization() {
        let msg = Message::with_what(42);
        let holder = MessageHolder::new(msg.clone(), Instant::now());
        holder.dead();
        assert!(holder.matches_id(msg.id()));
        assert!(holder.matches_what(42));
        assert!(!holder.matches_what(41));
    }

    #[test]
    fn callback_holders_match_by_identity_only() {
        let cb = Runnable::new(|| {});
        let other = Runnable::new(|| {});
        let holder = MessageHolder::new(Message::from_callback(cb.clone()), Instant::now());
        assert!(holder.matches_callback(&cb));
        assert!(!holder.matches_callback(&other));
        // A posted callback carries what == 0 but is not a tagged message.
        assert!(!holder.matches_what(0));
    }
}
