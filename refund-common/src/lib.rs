pub mod config;
pub mod error;
pub mod health;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod metrics;
pub mod payments;
pub mod refund_request;
pub mod resilience;
pub mod schema;
pub mod topic;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Subject under which the inbound record schema is registered.
pub const REFUND_REQUEST_SCHEMA: &str = "refund-request";
