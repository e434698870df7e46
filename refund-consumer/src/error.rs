use metrics_exporter_prometheus::BuildError;
use rdkafka::error::KafkaError;
use refund_common::error::{CodecError, PaymentError, TransportError};
use thiserror::Error;

/// Enumeration of errors that stop the service from starting or from shutting down cleanly.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("failed to build schema registry client: {0}")]
    RegistryClient(reqwest::Error),
    #[error("failed to load refund request schema: {0}")]
    Schema(#[from] CodecError),
    #[error("failed to set up kafka client: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to subscribe consumer: {0}")]
    Subscription(#[from] TransportError),
    #[error("failed to build payments client: {0}")]
    Payments(#[from] PaymentError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),
    #[error("{loop_name} consumer loop task failed: {reason}")]
    LoopTask { loop_name: String, reason: String },
}
