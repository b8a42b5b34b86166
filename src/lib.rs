//! Fileflow - message bus plumbing for file-processing pipeline stages
//!
//! Each stage consumes "file created" events from a RabbitMQ topic exchange,
//! processes the referenced file, and announces its output on the same
//! exchange. This crate provides the resilient connection, consumer and
//! publisher every stage shares.

pub mod bus;
pub mod config;
pub mod stage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;
