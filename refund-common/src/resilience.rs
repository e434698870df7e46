//! Routing of messages that failed processing into the retry and error topics.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{info, warn};

use crate::error::{ProcessingError, ResilienceError};
use crate::metrics::{MESSAGES_REPUBLISHED, MESSAGES_SUPPRESSED};
use crate::refund_request::RefundRequest;
use crate::schema::RefundCodec;
use crate::topic::{error_topic, retry_topic};

/// Header carrying the error that sent a message to the retry or error topic.
pub const FAILURE_REASON_HEADER: &str = "refund-failure-reason";

/// Takes over a message the consumer loop failed to process.
#[async_trait]
pub trait ResilienceHandler: Send + Sync {
    /// Republish or drop the message at `offset`. Only fails when republishing does.
    async fn handle_error(
        &self,
        error: &ProcessingError,
        offset: i64,
        payload: &[u8],
    ) -> Result<(), ResilienceError>;

    /// Release whatever the handler holds, flushing pending republications.
    async fn close(&self) -> Result<(), ResilienceError>;
}

/// Which stream a consumer loop is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerRole {
    Primary,
    Retry,
    ErrorQueue,
}

impl ConsumerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerRole::Primary => "primary",
            ConsumerRole::Retry => "retry",
            ConsumerRole::ErrorQueue => "error-queue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Retry,
    Error,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Retry => "retry",
            Destination::Error => "error",
        }
    }
}

/// What to do with a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing worth republishing, log and move on.
    Suppress,
    /// Republish the request, with its attempt count already incremented.
    Republish {
        destination: Destination,
        request: RefundRequest,
    },
    /// Undecodable payload, forwarded untouched to the error topic.
    Park,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    role: ConsumerRole,
    /// Attempts a message may reach before it goes to the error topic.
    max_attempts: i32,
}

impl RetryPolicy {
    pub fn new(role: ConsumerRole, max_attempts: u32) -> Self {
        Self {
            role,
            max_attempts: i32::try_from(max_attempts).unwrap_or(i32::MAX),
        }
    }

    /// Decide where a failed message goes. `decoded` is the payload decoded, if it could be.
    ///
    /// A message keeps cycling through the retry topic with one more attempt each time, until
    /// the attempt count exceeds the maximum. Failures that retrying cannot fix skip straight to
    /// the error topic, as does anything failing while the error queue is being replayed.
    pub fn decide(
        &self,
        error: &ProcessingError,
        payload: &[u8],
        decoded: Option<RefundRequest>,
    ) -> Disposition {
        if payload.is_empty() {
            return Disposition::Suppress;
        }
        let Some(mut request) = decoded else {
            return Disposition::Park;
        };

        request.attempt = request.attempt.saturating_add(1);

        let destination = if self.role == ConsumerRole::ErrorQueue
            || !error.is_retryable()
            || request.attempt > self.max_attempts
        {
            Destination::Error
        } else {
            Destination::Retry
        };

        Disposition::Republish {
            destination,
            request,
        }
    }
}

/// A `ResilienceHandler` republishing to `<base>-retry` and `<base>-error` with a Kafka producer.
pub struct KafkaResilienceHandler {
    producer: FutureProducer,
    codec: Arc<dyn RefundCodec>,
    policy: RetryPolicy,
    retry_topic: String,
    error_topic: String,
    send_timeout: Duration,
}

impl KafkaResilienceHandler {
    pub fn new(
        producer: FutureProducer,
        codec: Arc<dyn RefundCodec>,
        base_topic: &str,
        policy: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            producer,
            codec,
            policy,
            retry_topic: retry_topic(base_topic),
            error_topic: error_topic(base_topic),
            send_timeout,
        }
    }

    async fn publish(
        &self,
        destination: Destination,
        key: Option<&str>,
        payload: Vec<u8>,
        error: &ProcessingError,
    ) -> Result<(), ResilienceError> {
        let topic = match destination {
            Destination::Retry => &self.retry_topic,
            Destination::Error => &self.error_topic,
        };

        let reason = error.to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: FAILURE_REASON_HEADER,
            value: Some(reason.as_str()),
        });

        let mut record: FutureRecord<'_, str, Vec<u8>> =
            FutureRecord::to(topic).payload(&payload).headers(headers);
        if let Some(key) = key {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(error, _)| ResilienceError::Produce {
                topic: topic.clone(),
                error,
            })?;

        metrics::counter!(MESSAGES_REPUBLISHED, "destination" => destination.as_str()).increment(1);
        info!(topic = %topic, partition, offset, "republished failed message");
        Ok(())
    }
}

#[async_trait]
impl ResilienceHandler for KafkaResilienceHandler {
    async fn handle_error(
        &self,
        error: &ProcessingError,
        offset: i64,
        payload: &[u8],
    ) -> Result<(), ResilienceError> {
        let decoded = self.codec.decode(payload).ok();

        match self.policy.decide(error, payload, decoded) {
            Disposition::Suppress => {
                metrics::counter!(MESSAGES_SUPPRESSED).increment(1);
                warn!(offset, error = %error, "dropping failed message without payload");
                Ok(())
            }
            Disposition::Park => {
                warn!(offset, error = %error, "forwarding undecodable message to error topic");
                self.publish(Destination::Error, None, payload.to_vec(), error)
                    .await
            }
            Disposition::Republish {
                destination,
                request,
            } => {
                info!(
                    offset,
                    payment_id = %request.payment_id,
                    attempt = request.attempt,
                    destination = destination.as_str(),
                    error = %error,
                    "republishing failed refund request"
                );
                let bytes =
                    self.codec
                        .encode(&request)
                        .map_err(|error| ResilienceError::Encode {
                            topic: match destination {
                                Destination::Retry => self.retry_topic.clone(),
                                Destination::Error => self.error_topic.clone(),
                            },
                            error,
                        })?;
                self.publish(destination, Some(&request.payment_id), bytes, error)
                    .await
            }
        }
    }

    async fn close(&self) -> Result<(), ResilienceError> {
        info!("flushing republish producer");
        // flush blocks until delivery or timeout, keep it off the runtime's workers.
        let producer = self.producer.clone();
        let timeout = self.send_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(ResilienceError::FlushTask)?
            .map_err(ResilienceError::Flush)
    }
}
