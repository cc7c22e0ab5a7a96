//! In-process event bus
//!
//! Copy-on-write pub/sub: the subscriber set is snapshotted under a single
//! lock before dispatch and iterated outside it, so subscribe/unsubscribe
//! during a publish can never corrupt iteration. A concurrent subscription
//! takes effect for subsequent publishes only.
//!
//! A single dispatcher task drains the publish queue, which gives FIFO
//! delivery per subscriber. Synchronous handlers run on a bounded blocking
//! pool (`max_workers`, `0` = inline); cooperative-async handlers are spawned
//! on the ambient runtime. A handler failure is isolated, logged, and never
//! affects other handlers.

mod bus;
mod journal;

pub use bus::{BusError, BusOptions, EventBus, EventFilter};
pub use journal::read_journal;
