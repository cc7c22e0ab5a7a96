//! Durable state for the devflow orchestrator
//!
//! A single embedded SQLite database (WAL mode, foreign keys on) is the
//! source of truth for workflows, phases, and the audit event log. The store
//! exposes only typed operations; no SQL leaks to callers.
//!
//! Concurrency model: every write serializes through one `Mutex<Connection>`
//! (the "SQL writer lock"). All store methods are synchronous and never held
//! across an await point; the engine publishes events only after the
//! enclosing transaction has committed, so a subscriber observing an event
//! can always read the resulting row.

mod aggregates;
mod migrations;
mod replay;
mod store;

pub use aggregates::{MetricsAggregate, MetricsSnapshot};
pub use replay::{replay_journal, ReplayStats};
pub use store::{StateError, StateStore};
