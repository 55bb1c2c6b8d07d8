//! Shared utilities: errors, logging, retry.

pub mod error;
pub mod logging;
pub mod retry;
