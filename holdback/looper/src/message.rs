//! Message payloads carried through the dispatch loop.
//!
//! A [`Message`] is cheap to clone: clones share the same [`MessageId`], so
//! any copy can be used to find, compare, or cancel the original. The only
//! owned data are a few integers; `obj` and `callback` are reference-counted.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a message and all of its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, mostly useful for logging.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// A shared closure posted for execution on the dispatch thread.
///
/// Two `Runnable`s are the same callback when they share the same
/// allocation; cloning keeps that identity.
#[derive(Clone)]
pub struct Runnable(Arc<dyn Fn() + Send + Sync>);

impl Runnable {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the callback on the current thread.
    pub fn run(&self) {
        (self.0)();
    }

    /// Pointer identity comparison.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Runnable")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Unit of work delivered by the dispatch loop.
#[derive(Clone)]
pub struct Message {
    id: MessageId,
    /// User-defined tag, used for matching and cancellation.
    pub what: i32,
    pub arg1: i64,
    pub arg2: i64,
    /// Arbitrary shared payload.
    pub obj: Option<Arc<dyn Any + Send + Sync>>,
    callback: Option<Runnable>,
}

impl Default for Message {
    fn default() -> Self {
        Self::obtain()
    }
}

impl Message {
    /// A blank message with a fresh identity.
    #[must_use]
    pub fn obtain() -> Self {
        Self {
            id: MessageId::next(),
            what: 0,
            arg1: 0,
            arg2: 0,
            obj: None,
            callback: None,
        }
    }

    /// A blank message tagged with `what`.
    #[must_use]
    pub fn with_what(what: i32) -> Self {
        Self {
            what,
            ..Self::obtain()
        }
    }

    /// A message whose delivery runs `callback` instead of a handler.
    #[must_use]
    pub fn from_callback(callback: Runnable) -> Self {
        Self {
            callback: Some(callback),
            ..Self::obtain()
        }
    }

    #[must_use]
    pub fn args(mut self, arg1: i64, arg2: i64) -> Self {
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    #[must_use]
    pub fn obj<T: Any + Send + Sync>(mut self, obj: T) -> Self {
        self.obj = Some(Arc::new(obj));
        self
    }

    /// Copy of this message with a new identity.
    ///
    /// Use this to re-send the same content while the original is still
    /// pending; plain `clone()` keeps the identity.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            id: MessageId::next(),
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    #[must_use]
    pub fn callback(&self) -> Option<&Runnable> {
        self.callback.as_ref()
    }

    /// Downcast the shared payload.
    #[must_use]
    pub fn obj_ref<T: Any>(&self) -> Option<&T> {
        self.obj.as_deref().and_then(|obj| obj.downcast_ref::<T>())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("what", &self.what)
            .field("arg1", &self.arg1)
            .field("arg2", &self.arg2)
            .field("has_obj", &self.obj.is_some())
            .field("callback", &self.callback)
            .finish()
    }
}
