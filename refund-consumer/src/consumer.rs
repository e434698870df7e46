//! The consumer loop: read, process and commit refund requests from one topic.
use std::sync::Arc;
use std::time::{Duration, Instant};

use refund_common::error::{PaymentError, ProcessingError};
use refund_common::health::HealthHandle;
use refund_common::kafka_consumer::{BacklogTail, ConsumedMessage, MessageSource};
use refund_common::metrics::{
    HANDOFF_FAILURES, MESSAGES_RECEIVED, MESSAGES_SKIPPED, OFFSET_COMMIT_FAILURES,
    PAYMENTS_FAILED, PAYMENTS_POSTED, PAYMENT_REQUEST_DURATION, TRANSPORT_ERRORS,
};
use refund_common::payments::PaymentGateway;
use refund_common::refund_request::{RefundPostRequest, RefundRequest};
use refund_common::resilience::ResilienceHandler;
use refund_common::schema::RefundCodec;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Lifecycle of a `ConsumerLoop`. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Draining,
    Closed,
}

/// Why a loop left its running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The shutdown signal arrived, or its sender went away.
    Signalled,
    /// Every message present at start was handled. The signal was awaited afterwards.
    BacklogDrained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    /// Used in logs and as the health component name.
    pub name: String,
    pub topic: String,
    /// Messages below this offset are committed without being processed. -1 skips nothing.
    pub initial_offset: i64,
    /// Pause before each read. Zero disables throttling.
    pub throttle: Duration,
    /// Stop once the backlog present at start has been handled.
    pub drain_backlog: bool,
}

/// Reads messages from a `MessageSource` and turns each one into a refund on the payments API.
/// Failures are handed to a `ResilienceHandler`; nothing that happens to a single message stops
/// the loop.
pub struct ConsumerLoop {
    settings: LoopSettings,
    state: LoopState,
    source: Box<dyn MessageSource>,
    codec: Arc<dyn RefundCodec>,
    gateway: Arc<dyn PaymentGateway>,
    resilience: Box<dyn ResilienceHandler>,
    liveness: HealthHandle,
}

impl ConsumerLoop {
    pub fn new(
        settings: LoopSettings,
        source: Box<dyn MessageSource>,
        codec: Arc<dyn RefundCodec>,
        gateway: Arc<dyn PaymentGateway>,
        resilience: Box<dyn ResilienceHandler>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            settings,
            state: LoopState::Idle,
            source,
            codec,
            gateway,
            resilience,
            liveness,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Consume until `shutdown` fires or, when draining a backlog, until the backlog is handled.
    /// A drained loop releases its clients and then still waits for `shutdown` before returning.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> LoopExit {
        if self.state != LoopState::Idle {
            warn!(name = self.name(), state = ?self.state, "consumer loop cannot run again");
            return LoopExit::Signalled;
        }
        self.state = LoopState::Running;
        info!(
            name = self.name(),
            topic = %self.settings.topic,
            initial_offset = self.settings.initial_offset,
            throttle_ms = self.settings.throttle.as_millis() as u64,
            "consumer loop running"
        );

        let mut backlog = if self.settings.drain_backlog {
            Some(self.capture_backlog().await)
        } else {
            None
        };
        let mut processed: Option<ConsumedMessage> = None;

        let exit = loop {
            self.liveness.report_healthy();

            if let Some(message) = processed.take() {
                self.commit(&message);
            }

            if backlog.as_ref().is_some_and(BacklogTail::is_drained) {
                break LoopExit::BacklogDrained;
            }

            if !self.settings.throttle.is_zero() {
                tokio::select! {
                    _ = &mut shutdown => break LoopExit::Signalled,
                    _ = tokio::time::sleep(self.settings.throttle) => {}
                }
            }

            let received = tokio::select! {
                _ = &mut shutdown => break LoopExit::Signalled,
                received = self.source.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(error) => {
                    metrics::counter!(TRANSPORT_ERRORS, "topic" => self.settings.topic.clone())
                        .increment(1);
                    error!(name = self.name(), error = %error, "failed to receive message");
                    continue;
                }
            };

            if let Some(backlog) = backlog.as_mut() {
                if !backlog.contains(message.partition, message.offset) {
                    info!(
                        name = self.name(),
                        partition = message.partition,
                        offset = message.offset,
                        "reached the end of the backlog for partition"
                    );
                    backlog.finish(message.partition);
                    continue;
                }
            }

            self.process(&message).await;

            if let Some(backlog) = backlog.as_mut() {
                backlog.record(message.partition, message.offset);
            }
            processed = Some(message);
        };

        self.drain().await;

        if exit == LoopExit::BacklogDrained {
            self.liveness.report_completed();
            info!(
                name = self.name(),
                "backlog drained, waiting for shutdown signal"
            );
            _ = shutdown.await;
        }

        self.state = LoopState::Closed;
        info!(name = self.name(), exit = ?exit, "consumer loop closed");
        exit
    }

    /// Close a loop that never ran, releasing its clients.
    pub async fn shutdown(&mut self) {
        if self.state == LoopState::Idle {
            self.drain().await;
            self.state = LoopState::Closed;
        }
    }

    async fn capture_backlog(&mut self) -> BacklogTail {
        match self.source.backlog_tail().await {
            Ok(backlog) => {
                info!(name = self.name(), backlog = ?backlog, "captured backlog tail");
                backlog
            }
            Err(error) => {
                // Without a tail the loop cannot know where to stop, so it handles nothing.
                error!(name = self.name(), error = %error, "failed to capture backlog tail");
                BacklogTail::default()
            }
        }
    }

    async fn process(&self, message: &ConsumedMessage) {
        metrics::counter!(MESSAGES_RECEIVED, "topic" => self.settings.topic.clone()).increment(1);

        let outcome = match self.codec.decode(&message.payload) {
            Err(error) => Err(ProcessingError::Decode(error)),
            Ok(request) if message.offset < self.settings.initial_offset => {
                metrics::counter!(MESSAGES_SKIPPED, "topic" => self.settings.topic.clone())
                    .increment(1);
                debug!(
                    name = self.name(),
                    offset = message.offset,
                    payment_id = %request.payment_id,
                    "skipping message below initial offset"
                );
                Ok(())
            }
            Ok(request) => self
                .post_refund(&request)
                .await
                .map_err(ProcessingError::Payment),
        };

        let Err(error) = outcome else {
            return;
        };

        warn!(
            name = self.name(),
            partition = message.partition,
            offset = message.offset,
            error = %error,
            "failed to process message"
        );
        if let Err(handoff_error) = self
            .resilience
            .handle_error(&error, message.offset, &message.payload)
            .await
        {
            metrics::counter!(HANDOFF_FAILURES, "topic" => self.settings.topic.clone())
                .increment(1);
            error!(
                name = self.name(),
                offset = message.offset,
                error = %handoff_error,
                "failed to hand off message, dropping it"
            );
        }
    }

    async fn post_refund(&self, request: &RefundRequest) -> Result<(), PaymentError> {
        let body = RefundPostRequest::try_from(request)?;
        let labels = [("topic", self.settings.topic.clone())];

        let start = Instant::now();
        let result = self.gateway.post_refund(&request.payment_id, &body).await;
        metrics::histogram!(PAYMENT_REQUEST_DURATION, &labels)
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(()) => {
                metrics::counter!(PAYMENTS_POSTED, &labels).increment(1);
                info!(
                    name = self.name(),
                    payment_id = %request.payment_id,
                    attempt = request.attempt,
                    amount = body.amount,
                    "refund posted"
                );
            }
            Err(_) => metrics::counter!(PAYMENTS_FAILED, &labels).increment(1),
        }
        result
    }

    fn commit(&mut self, message: &ConsumedMessage) {
        if let Err(error) = self.source.commit(message) {
            metrics::counter!(OFFSET_COMMIT_FAILURES, "topic" => self.settings.topic.clone())
                .increment(1);
            error!(
                name = self.name(),
                partition = message.partition,
                offset = message.offset,
                error = %error,
                "failed to commit offset"
            );
        }
    }

    async fn drain(&mut self) {
        self.state = LoopState::Draining;
        info!(name = self.name(), "draining consumer loop");

        if let Err(error) = self.source.close().await {
            error!(name = self.name(), error = %error, "failed to close consumer");
        }
        if let Err(error) = self.resilience.close().await {
            error!(name = self.name(), error = %error, "failed to close republish producer");
        }
    }
}
