//! Client-facing entry points into the Task Queue.
//!
//! The [`Dispatcher`] turns a conversation into jobs; the [`Poller`] reports
//! their state back without touching the queue.

pub mod dispatcher;
pub mod poller;

pub use dispatcher::{transcript, Dispatcher};
pub use poller::Poller;
