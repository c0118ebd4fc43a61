//! Pending-stream registry for the beckon relay broker

pub mod streams;

pub use streams::{ClientPoll, PendingStream, StreamError, StreamRegistry, PREBUFFER_LIMIT};
