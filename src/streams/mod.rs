//! Beacon node event stream.
//!
//! [`sse`] parses the raw `text/event-stream` body; [`subscriber`] turns one
//! topic of it into typed events with reconnect and idle-timeout handling.

pub mod sse;
pub mod subscriber;

pub use subscriber::{DecodeFailure, Delivery, EventSubscriber};
