//! Rill feed: the change-feed listener state machine, its bounded dispatcher
//! and the durable (lease-queue) delivery loops.

#![forbid(unsafe_code)]

mod dispatch;
mod durable;
mod listener;
mod tracker;

pub use dispatch::BoundedDispatcher;
pub use listener::{ChangeFeedListener, ListenerConfig, ListenerState};
pub use tracker::ResumeTracker;
