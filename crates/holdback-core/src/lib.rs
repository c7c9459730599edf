//! holdback-core: pausable delayed dispatch
//!
//! This crate wraps a timer-based delivery engine with a pause/resume/kill
//! state machine. Messages scheduled through a [`MessageHandler`] can be
//! paused (keeping their remaining delay), resumed, cancelled selectively by
//! tag or callback identity, or dropped for good with a kill.
//!
//! # Architecture
//!
//! ```text
//! caller ─► MessageHandler ─► outgoing gate ─► PendingRegistry
//!                                   │
//!                                   ▼
//!                            DeliveryEngine (looper / ManualEngine)
//!                                   │ fires
//!                                   ▼
//!           caller's handler ◄─ incoming gate ◄─ FireGate (weak)
//! ```
//!
//! # Modules
//!
//! - `controller`: `MessageHandler`, its builder, the two gates
//! - `registry`: snapshot-and-compare-remove bookkeeping of pending messages
//! - `holder`: one pending message plus its remaining-delay state
//! - `engine`: the `DeliveryEngine` seam, implemented for `looper::Handler`
//! - `manual_engine`: deterministic engine for tests and simulations
//! - `clock`: monotonic and manual clocks
//! - `config`: TOML configuration
//! - `logging`: `tracing-subscriber` setup
//! - `error`: error types
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod holder;
pub mod logging;
pub mod manual_engine;
pub mod registry;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{Config, DispatchConfig};
pub use controller::{
    DispatchState, GateDecision, MessageHandler, MessageHandlerBuilder, ScheduleOutcome,
};
pub use engine::{DeliveryEngine, Message, MessageId, MessageTarget, Runnable};
pub use error::{Error, Result};
pub use manual_engine::ManualEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
