//! In-memory collaborators for consumer loop and supervisor tests.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use refund_common::error::{PaymentError, ProcessingError, ResilienceError, TransportError};
use refund_common::health::HealthRegistry;
use refund_common::kafka_consumer::{BacklogTail, ConsumedMessage, MessageSource};
use refund_common::payments::PaymentGateway;
use refund_common::refund_request::RefundPostRequest;
use refund_common::resilience::ResilienceHandler;
use tokio::sync::mpsc;

use crate::consumer::{ConsumerLoop, LoopSettings};

pub use refund_common::test_utils::{codec, refund_request};

pub fn encode(attempt: i32) -> Vec<u8> {
    refund_common::test_utils::encoded_refund_request(attempt)
}

pub fn message(offset: i64, payload: &[u8]) -> ConsumedMessage {
    ConsumedMessage {
        topic: "refund-request".to_owned(),
        partition: 0,
        offset,
        key: None,
        payload: payload.to_vec(),
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not met in time");
}

type Delivery = Result<ConsumedMessage, TransportError>;

/// A `MessageSource` fed through `send`. Clones share the same stream and bookkeeping.
#[derive(Clone)]
pub struct FakeSource {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    committed: Arc<Mutex<Vec<i64>>>,
    closed: Arc<AtomicBool>,
    backlog: Arc<Mutex<BacklogTail>>,
}

impl FakeSource {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            committed: Default::default(),
            closed: Default::default(),
            backlog: Default::default(),
        }
    }

    pub fn boxed(&self) -> Box<dyn MessageSource> {
        Box::new(self.clone())
    }

    pub fn send(&self, delivery: Delivery) {
        self.sender.send(delivery).unwrap();
    }

    pub fn set_backlog(&self, backlog: BacklogTail) {
        *self.backlog.lock().unwrap() = backlog;
    }

    pub fn committed(&self) -> Vec<i64> {
        self.committed.lock().unwrap().clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn recv(&mut self) -> Result<ConsumedMessage, TransportError> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Some(delivery) => delivery,
            None => futures::future::pending().await,
        }
    }

    fn commit(&mut self, message: &ConsumedMessage) -> Result<(), TransportError> {
        self.committed.lock().unwrap().push(message.offset);
        Ok(())
    }

    async fn backlog_tail(&mut self) -> Result<BacklogTail, TransportError> {
        Ok(self.backlog.lock().unwrap().clone())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A `PaymentGateway` answering every call with the same status.
#[derive(Clone)]
pub struct FakeGateway {
    status: Arc<Mutex<StatusCode>>,
    calls: Arc<Mutex<Vec<(String, i64)>>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            status: Arc::new(Mutex::new(StatusCode::CREATED)),
            calls: Default::default(),
        }
    }

    pub fn respond_with(&self, status: StatusCode) {
        *self.status.lock().unwrap() = status;
    }

    /// Payment ids and pence amounts of every call so far.
    pub fn calls(&self) -> Vec<(String, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn post_refund(
        &self,
        payment_id: &str,
        refund: &RefundPostRequest,
    ) -> Result<(), PaymentError> {
        self.calls
            .lock()
            .unwrap()
            .push((payment_id.to_owned(), refund.amount));

        let status = *self.status.lock().unwrap();
        if status == StatusCode::CREATED {
            Ok(())
        } else {
            Err(PaymentError::UnexpectedStatus { status })
        }
    }
}

/// A `ResilienceHandler` recording the offset, error and payload of each handoff.
#[derive(Clone, Default)]
pub struct FakeResilience {
    handled: Arc<Mutex<Vec<(i64, String, Vec<u8>)>>>,
    pub fail: Arc<AtomicBool>,
    pub closed: Arc<AtomicBool>,
}

impl FakeResilience {
    pub fn handled(&self) -> Vec<(i64, String, Vec<u8>)> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResilienceHandler for FakeResilience {
    async fn handle_error(
        &self,
        error: &ProcessingError,
        offset: i64,
        payload: &[u8],
    ) -> Result<(), ResilienceError> {
        self.handled
            .lock()
            .unwrap()
            .push((offset, error.to_string(), payload.to_vec()));

        if self.fail.load(Ordering::SeqCst) {
            Err(ResilienceError::Flush(rdkafka::error::KafkaError::Canceled))
        } else {
            Ok(())
        }
    }

    async fn close(&self) -> Result<(), ResilienceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Fakes shared by every loop a test builds.
pub struct Harness {
    pub gateway: FakeGateway,
    pub resilience: FakeResilience,
    pub liveness: HealthRegistry,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            gateway: FakeGateway::new(),
            resilience: FakeResilience::default(),
            liveness: HealthRegistry::new("liveness"),
        }
    }

    pub fn source(&self) -> FakeSource {
        FakeSource::new()
    }

    pub fn consumer_loop(
        &self,
        settings: LoopSettings,
        source: Box<dyn MessageSource>,
    ) -> ConsumerLoop {
        let liveness = self
            .liveness
            .register(&settings.name, time::Duration::seconds(30));
        ConsumerLoop::new(
            settings,
            source,
            Arc::new(codec()),
            Arc::new(self.gateway.clone()),
            Box::new(self.resilience.clone()),
            liveness,
        )
    }
}
