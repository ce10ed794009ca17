//! Core types, error definitions, and event plumbing for Conductor.
//!
//! This crate provides the foundational pieces shared by the orchestrator and
//! the CLI: the unified error type, the clock abstraction used by time-based
//! guards, and the outbound event model.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for every subsystem.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`Clock`] — Source of time; [`SystemClock`] in production, [`ManualClock`] in tests.
//! - [`Event`] / [`EventTopic`] — Lifecycle events published by the orchestrator.
//! - [`EventSink`] — The single outbound capability the orchestrator publishes through.
//! - [`EventBus`] — Broadcast-backed in-process publish/subscribe.
//! - [`JsonlEventLog`] — Append-only JSONL event journal.

/// Clock abstraction.
pub mod clock;
/// Error types.
pub mod error;
/// Event model, sinks, and the in-process bus.
pub mod event;
/// JSONL event journal.
pub mod journal;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConductorError, ConductorResult};
pub use event::{Event, EventBus, EventSink, EventTopic, FanoutSink, NullEventSink, Transition};
pub use journal::JsonlEventLog;
