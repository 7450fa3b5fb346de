//! Broadcasting modules for real-time event streaming.
//!
//! Each broadcaster wraps a `tokio::sync::broadcast` channel. Sending never
//! blocks and never fails when nobody is subscribed; slow subscribers observe
//! `Lagged` rather than stalling the producer.

pub mod guard_events;
pub mod migration_progress;
pub mod pool_events;

pub use guard_events::{GuardEvent, GuardEventBroadcaster};
pub use migration_progress::{MigrationPhase, MigrationProgressBroadcaster, MigrationProgressEvent};
pub use pool_events::{ExitReason, PoolEvent, PoolEventBroadcaster, RestartReason};
