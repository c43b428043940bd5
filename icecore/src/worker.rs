//! Contract for a cooperatively-scheduled unit of work.
//!
//! A hand-rolled scheduler historically drove each client through a
//! `process(client) -> schedule_ms` callback polled by a shared worker pool.
//! Here, every listener, source, and relay is its own tokio task, so this
//! trait exists only to document the shape such a step function takes --
//! useful for anything that still wants to be driven generically rather than
//! via a bespoke loop.

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait CooperativeTask: Send {
    /// Runs one step of this task. Returning `Some(d)` requests to be
    /// stepped again no sooner than `d`; `None` means the task is done and
    /// may be dropped.
    async fn step(&mut self) -> Option<Duration>;
}
