//! A single-threaded dispatch loop.
//!
//! A [`Looper`] owns one named thread that pops messages off a
//! deadline-ordered queue and hands each one to the [`MessageTarget`] it was
//! sent through. Producers on any thread reach the queue via a [`Handler`],
//! which binds one target and can schedule, schedule-at-front, and cancel
//! only that target's messages.
//!
//! ```ignore
//! let looper = Looper::spawn(LooperConfig::default())?;
//! let handler = looper.handler(Arc::new(MyTarget));
//! handler.send_at(Message::with_what(1), Instant::now() + Duration::from_millis(50));
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

mod message;
mod queue;

pub use message::{Message, MessageId, Runnable};
pub use queue::{MessageTarget, TargetId};

use queue::{Envelope, MessageQueue};

#[derive(Debug, Error)]
pub enum LooperError {
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("invalid looper configuration: {0}")]
    InvalidConfig(String),
}

/// Dispatch thread settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LooperConfig {
    /// Name given to the dispatch thread.
    pub thread_name: String,
    /// Stack size for the dispatch thread; platform default when unset.
    pub stack_size: Option<usize>,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            thread_name: "looper".to_string(),
            stack_size: None,
        }
    }
}

impl LooperConfig {
    pub fn validate(&self) -> Result<(), LooperError> {
        if self.thread_name.is_empty() {
            return Err(LooperError::InvalidConfig(
                "thread_name must not be empty".to_string(),
            ));
        }
        if self.thread_name.contains('\0') {
            return Err(LooperError::InvalidConfig(
                "thread_name must not contain NUL bytes".to_string(),
            ));
        }
        if self.stack_size == Some(0) {
            return Err(LooperError::InvalidConfig(
                "stack_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Owner of the dispatch thread. Dropping it quits the loop.
pub struct Looper {
    queue: Arc<MessageQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    name: String,
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("quitting", &self.queue.is_quitting())
            .finish()
    }
}

impl Looper {
    /// Start the dispatch thread.
    pub fn spawn(config: LooperConfig) -> Result<Self, LooperError> {
        config.validate()?;

        let queue = Arc::new(MessageQueue::new());
        let loop_queue = Arc::clone(&queue);
        let mut builder = std::thread::Builder::new().name(config.thread_name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let thread = builder.spawn(move || run_loop(&loop_queue))?;
        let thread_id = thread.thread().id();

        debug!(looper = %config.thread_name, "dispatch thread started");

        Ok(Self {
            queue,
            thread: Mutex::new(Some(thread)),
            thread_id,
            name: config.thread_name,
        })
    }

    /// Bind `target` to this loop.
    pub fn handler(&self, target: Arc<dyn MessageTarget>) -> Handler {
        Handler {
            queue: Arc::clone(&self.queue),
            target: self.queue.allocate_target(),
            sink: target,
        }
    }

    /// Whether the caller is running on the dispatch thread.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Number of queued messages across all targets.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the loop and discard pending messages.
    ///
    /// Joins the dispatch thread unless called from it. Idempotent.
    pub fn quit(&self) {
        let dropped = self.queue.quit();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            debug!(looper = %self.name, dropped, "dispatch thread quitting");
            if !self.is_current_thread() && thread.join().is_err() {
                warn!(looper = %self.name, "dispatch thread panicked");
            }
        }
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        self.quit();
    }
}

fn run_loop(queue: &MessageQueue) {
    while let Some(Envelope { sink, msg, .. }) = queue.next() {
        let id = msg.id();
        if catch_unwind(AssertUnwindSafe(|| sink.dispatch(msg))).is_err() {
            warn!(message = %id, "message target panicked during dispatch");
        }
    }
}

/// Producer-side view of a [`Looper`] bound to one target.
///
/// Cheap to clone; all clones share the same target identity. A handler
/// outliving its looper simply has every send rejected.
#[derive(Clone)]
pub struct Handler {
    queue: Arc<MessageQueue>,
    target: TargetId,
    sink: Arc<dyn MessageTarget>,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Handler {
    fn envelope(&self, msg: Message) -> Envelope {
        Envelope {
            target: self.target,
            sink: Arc::clone(&self.sink),
            msg,
        }
    }

    /// Queue `msg` for dispatch at `deadline`. Returns `false` if the loop quit.
    pub fn send_at(&self, msg: Message, deadline: Instant) -> bool {
        self.queue.enqueue_at(self.envelope(msg), deadline)
    }

    /// Queue `msg` ahead of everything else. Returns `false` if the loop quit.
    pub fn send_at_front(&self, msg: Message) -> bool {
        self.queue.enqueue_front(self.envelope(msg))
    }

    /// Drop every queued message of this target.
    pub fn remove_all(&self) -> usize {
        self.queue.remove_where(self.target, |_| true)
    }

    /// Drop queued messages of this target matching `predicate`.
    pub fn remove_matching(&self, predicate: impl Fn(&Message) -> bool) -> usize {
        self.queue.remove_where(self.target, predicate)
    }

    #[must_use]
    pub fn has_matching(&self, predicate: impl Fn(&Message) -> bool) -> bool {
        self.queue.any_where(self.target, predicate)
    }

    #[must_use]
    pub const fn target_id(&self) -> TargetId {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Forward(flume::Sender<Message>);

    impl MessageTarget for Forward {
        fn dispatch(&self, msg: Message) {
            let _ = self.0.send(msg);
        }
    }

    struct Panics;

    impl MessageTarget for Panics {
        fn dispatch(&self, _msg: Message) {
            panic!("target failure");
        }
    }

    fn spawn_test_looper() -> Looper {
        Looper::spawn(LooperConfig {
            thread_name: "looper-test".to_string(),
            ..LooperConfig::default()
        })
        .unwrap()
    }

    const WAIT: Duration = Duration::from_secs(2);

    // ── config ─────────────────────────────────────────────────

    #[test]
    fn default_config_is_valid() {
        assert!(LooperConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_thread_name_is_rejected() {
        let config = LooperConfig {
            thread_name: String::new(),
            ..LooperConfig::default()
        };
        assert!(matches!(
            Looper::spawn(config),
            Err(LooperError::InvalidConfig(_))
        ));
    }

    #[test]
    fn nul_in_thread_name_is_rejected() {
        let config = LooperConfig {
            thread_name: "bad\0name".to_string(),
            ..LooperConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_parses_from_toml_with_defaults() {
        let config: LooperConfig = toml::from_str("thread_name = \"ui\"").unwrap();
        assert_eq!(config.thread_name, "ui");
        assert_eq!(config.stack_size, None);
    }

    // ── dispatch ───────────────────────────────────────────────

    #[test]
    fn dispatches_in_deadline_order() {
        let looper = spawn_test_looper();
        let (tx, rx) = flume::unbounded();
        let handler = looper.handler(Arc::new(Forward(tx)));
        let base = Instant::now();

        assert!(handler.send_at(Message::with_what(2), base + Duration::from_millis(60)));
        assert!(handler.send_at(Message::with_what(1), base + Duration::from_millis(20)));

        assert_eq!(rx.recv_timeout(WAIT).unwrap().what, 1);
        assert_eq!(rx.recv_timeout(WAIT).unwrap().what, 2);
        assert!(base.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn dispatch_runs_on_looper_thread() {
        struct ThreadName(flume::Sender<Option<String>>);

        impl MessageTarget for ThreadName {
            fn dispatch(&self, _msg: Message) {
                let _ = self.0.send(std::thread::current().name().map(str::to_string));
            }
        }

        let looper = spawn_test_looper();
        let (tx, rx) = flume::unbounded();
        let handler = looper.handler(Arc::new(ThreadName(tx)));
        assert!(handler.send_at_front(Message::obtain()));

        let name = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(name.as_deref(), Some("looper-test"));
        assert!(!looper.is_current_thread());
    }

    #[test]
    fn remove_all_cancels_pending_messages() {
        let looper = spawn_test_looper();
        let (tx, rx) = flume::unbounded();
        let handler = looper.handler(Arc::new(Forward(tx)));
        let later = Instant::now() + Duration::from_millis(100);
        assert!(handler.send_at(Message::with_what(1), later));
        assert!(handler.send_at(Message::with_what(2), later));
        assert!(handler.has_matching(|m| m.what == 2));

        assert_eq!(handler.remove_all(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(250)).is_err());
    }

    #[test]
    fn remove_matching_leaves_other_messages() {
        let looper = spawn_test_looper();
        let (tx, rx) = flume::unbounded();
        let handler = looper.handler(Arc::new(Forward(tx)));
        let at = Instant::now() + Duration::from_millis(30);
        assert!(handler.send_at(Message::with_what(1), at));
        assert!(handler.send_at(Message::with_what(2), at));

        assert_eq!(handler.remove_matching(|m| m.what == 1), 1);
        assert_eq!(rx.recv_timeout(WAIT).unwrap().what, 2);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn panicking_target_does_not_stop_the_loop() {
        let looper = spawn_test_looper();
        let bad = looper.handler(Arc::new(Panics));
        let (tx, rx) = flume::unbounded();
        let good = looper.handler(Arc::new(Forward(tx)));
        let now = Instant::now();

        assert!(bad.send_at(Message::with_what(1), now));
        assert!(good.send_at(Message::with_what(2), now + Duration::from_millis(10)));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().what, 2);
    }

    #[test]
    fn sends_are_rejected_after_quit() {
        let looper = spawn_test_looper();
        let (tx, _rx) = flume::unbounded();
        let handler = looper.handler(Arc::new(Forward(tx)));
        looper.quit();
        looper.quit();
        assert!(!handler.send_at(Message::obtain(), Instant::now()));
        assert!(!handler.send_at_front(Message::obtain()));
        assert_eq!(looper.pending(), 0);
    }

    #[test]
    fn handler_outlives_dropped_looper() {
        let (tx, _rx) = flume::unbounded();
        let handler = {
            let looper = spawn_test_looper();
            looper.handler(Arc::new(Forward(tx)))
        };
        assert!(!handler.send_at(Message::obtain(), Instant::now()));
    }

    #[test]
    fn quit_from_dispatch_thread_does_not_deadlock() {
        let looper = Arc::new(spawn_test_looper());
        let (tx, rx) = flume::unbounded();
        let handler = looper.handler(Arc::new(Forward(tx.clone())));
        let inner = Arc::clone(&looper);

        struct QuitOnDispatch(Arc<Looper>, flume::Sender<Message>);
        impl MessageTarget for QuitOnDispatch {
            fn dispatch(&self, msg: Message) {
                self.0.quit();
                let _ = self.1.send(msg);
            }
        }

        let quitter = looper.handler(Arc::new(QuitOnDispatch(inner, tx)));
        assert!(quitter.send_at(Message::with_what(9), Instant::now()));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().what, 9);
        assert!(!handler.send_at(Message::obtain(), Instant::now()));
    }
}
