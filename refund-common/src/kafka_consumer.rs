use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::error::TransportError;
use crate::health::HealthHandle;
use crate::metrics::OFFSET_COMMIT_FAILURES;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// A message read from a topic, detached from the consumer that read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Empty when the message carried no payload at all.
    pub payload: Vec<u8>,
}

/// The offset of the last message in each partition of a topic, at one point in time.
/// Partitions drop out once their last message has been seen; an empty tail means there is
/// nothing left to drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogTail {
    tails: BTreeMap<i32, i64>,
}

impl BacklogTail {
    pub fn new(tails: impl IntoIterator<Item = (i32, i64)>) -> Self {
        Self {
            tails: tails.into_iter().collect(),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.tails.is_empty()
    }

    pub fn tail(&self, partition: i32) -> Option<i64> {
        self.tails.get(&partition).copied()
    }

    /// Whether the message at `offset` was already on the topic when the tail was captured.
    pub fn contains(&self, partition: i32, offset: i64) -> bool {
        self.tail(partition).is_some_and(|tail| offset <= tail)
    }

    /// Record that the message at `offset` was handled. The partition is done once its tail is reached.
    pub fn record(&mut self, partition: i32, offset: i64) {
        if self.tail(partition).is_some_and(|tail| offset >= tail) {
            self.finish(partition);
        }
    }

    pub fn finish(&mut self, partition: i32) {
        _ = self.tails.remove(&partition);
    }
}

/// The narrow slice of a consumer group the consumer loop needs.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next message. Errors are transport level and do not end the stream.
    async fn recv(&mut self) -> Result<ConsumedMessage, TransportError>;

    /// Commit `message` as processed, so the group resumes after it.
    fn commit(&mut self, message: &ConsumedMessage) -> Result<(), TransportError>;

    /// Capture the current tail of the subscribed topic, ignoring partitions whose committed
    /// position is already past it.
    async fn backlog_tail(&mut self) -> Result<BacklogTail, TransportError>;

    /// Leave the group and release the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

pub struct KafkaConsumerContext {
    liveness: HealthHandle,
}

impl ClientContext for KafkaConsumerContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for KafkaConsumerContext {
    // Commits are asynchronous, broker side failures only show up here.
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("committed offsets for {} partitions", offsets.count()),
            Err(error) => {
                if offsets.count() == 0 {
                    metrics::counter!(OFFSET_COMMIT_FAILURES, "topic" => "unknown").increment(1);
                    error!(error = %error, "failed to commit offsets");
                }
                for elem in offsets.elements() {
                    metrics::counter!(OFFSET_COMMIT_FAILURES, "topic" => elem.topic().to_owned())
                        .increment(1);
                    error!(
                        topic = elem.topic(),
                        partition = elem.partition(),
                        offset = ?elem.offset(),
                        error = %error,
                        "failed to commit offset"
                    );
                }
            }
        }
    }
}

/// A `MessageSource` backed by a single-topic rdkafka consumer with manual commits.
pub struct KafkaMessageSource {
    consumer: StreamConsumer<KafkaConsumerContext>,
    topic: String,
}

impl KafkaMessageSource {
    /// Join `group` and subscribe to `topic`. `offset_reset` is where a group without committed
    /// offsets starts: "earliest" or "latest".
    pub fn new(
        config: &KafkaConfig,
        group: &str,
        topic: &str,
        offset_reset: &str,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = config.client_config();
        client_config
            .set("group.id", group)
            .set("auto.offset.reset", offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer<KafkaConsumerContext> =
            client_config.create_with_context(KafkaConsumerContext { liveness })?;

        info!(group, topic, "attempting to join consumer group");
        consumer.subscribe(&[topic])?;

        Ok(Self {
            consumer,
            topic: topic.to_owned(),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn recv(&mut self) -> Result<ConsumedMessage, TransportError> {
        let message = self.consumer.recv().await?;

        Ok(ConsumedMessage {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    fn commit(&mut self, message: &ConsumedMessage) -> Result<(), TransportError> {
        let mut offsets = TopicPartitionList::new();
        // Kafka expects the offset of the next message to read.
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn backlog_tail(&mut self) -> Result<BacklogTail, TransportError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), METADATA_TIMEOUT)?;
        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .ok_or_else(|| TransportError::UnknownTopic(self.topic.clone()))?;

        let mut partitions = TopicPartitionList::new();
        for partition in topic.partitions() {
            partitions.add_partition(&self.topic, partition.id());
        }
        let committed = self
            .consumer
            .committed_offsets(partitions, METADATA_TIMEOUT)?;

        let mut tails = Vec::new();
        for partition in topic.partitions() {
            let (low, high) =
                self.consumer
                    .fetch_watermarks(&self.topic, partition.id(), METADATA_TIMEOUT)?;
            if high <= low {
                continue; // Empty partition
            }
            let tail = high - 1;

            let resume_at = committed
                .find_partition(&self.topic, partition.id())
                .and_then(|elem| match elem.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                });
            if resume_at.is_some_and(|next| next > tail) {
                continue; // Already drained by a previous run
            }

            tails.push((partition.id(), tail));
        }

        Ok(BacklogTail::new(tails))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use rdkafka::error::RDKafkaErrorCode;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::{DefaultProducerContext, FutureProducer, FutureRecord};
    use rdkafka::util::Timeout;

    use super::*;
    use crate::health::HealthRegistry;
    use crate::kafka_producer::tests::{create_mock_kafka, kafka_config};

    const TOPIC: &str = "refund-request-error";

    fn liveness() -> HealthHandle {
        HealthRegistry::new("liveness").register("error-queue", time::Duration::seconds(30))
    }

    async fn mock_topic(
        partitions: i32,
        messages: usize,
    ) -> (MockCluster<'static, DefaultProducerContext>, FutureProducer) {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic(TOPIC, partitions, 1)
            .expect("failed to create mock topic");

        for _ in 0..messages {
            let record = FutureRecord::to(TOPIC)
                .partition(0)
                .key("P1234")
                .payload(b"refund".as_slice());
            producer
                .send(record, Timeout::Never)
                .await
                .expect("failed to produce to mock topic");
        }

        (cluster, producer)
    }

    fn source(
        cluster: &MockCluster<'static, DefaultProducerContext>,
        group: &str,
    ) -> KafkaMessageSource {
        KafkaMessageSource::new(
            &kafka_config(cluster.bootstrap_servers()),
            group,
            TOPIC,
            "earliest",
            liveness(),
        )
        .expect("failed to create message source")
    }

    async fn next_message(source: &mut KafkaMessageSource) -> ConsumedMessage {
        tokio::time::timeout(Duration::from_secs(30), source.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("failed to receive message")
    }

    fn committed_position(source: &KafkaMessageSource, partition: i32) -> Option<i64> {
        let mut partitions = TopicPartitionList::new();
        partitions.add_partition(TOPIC, partition);
        let committed = source
            .consumer
            .committed_offsets(partitions, METADATA_TIMEOUT)
            .ok()?;
        match committed.find_partition(TOPIC, partition)?.offset() {
            Offset::Offset(offset) => Some(offset),
            _ => None,
        }
    }

    async fn wait_for_commit(source: &KafkaMessageSource, partition: i32, position: i64) {
        for _ in 0..100 {
            if committed_position(source, partition) == Some(position) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("offset {position} was never committed on partition {partition}");
    }

    #[tokio::test]
    async fn test_backlog_tail_skips_empty_partitions() {
        let (cluster, _producer) = mock_topic(2, 3).await;
        let mut source = source(&cluster, "tail");

        let backlog = source.backlog_tail().await.unwrap();

        assert_eq!(backlog, BacklogTail::new([(0, 2)]));
    }

    #[tokio::test]
    async fn test_new_group_receives_the_backlog() {
        let (cluster, _producer) = mock_topic(1, 3).await;
        let mut source = source(&cluster, "fresh");

        let message = next_message(&mut source).await;

        assert_eq!(message.topic, TOPIC);
        assert_eq!(message.partition, 0);
        assert_eq!(message.offset, 0);
        assert_eq!(message.key, Some(b"P1234".to_vec()));
        assert_eq!(message.payload, b"refund".to_vec());
    }

    #[tokio::test]
    async fn test_commit_stores_the_next_position() {
        let (cluster, _producer) = mock_topic(1, 3).await;
        let mut first = source(&cluster, "resume");

        let message = next_message(&mut first).await;
        assert_eq!(message.offset, 0);
        first.commit(&message).unwrap();
        wait_for_commit(&first, 0, 1).await;

        first.close().await.unwrap();
        drop(first);

        let mut second = source(&cluster, "resume");
        assert_eq!(next_message(&mut second).await.offset, 1);
    }

    #[tokio::test]
    async fn test_drained_partitions_are_left_out_of_the_tail() {
        let (cluster, _producer) = mock_topic(1, 3).await;
        let mut source = source(&cluster, "drained");
        assert_eq!(
            source.backlog_tail().await.unwrap(),
            BacklogTail::new([(0, 2)])
        );

        for expected in 0..3 {
            let message = next_message(&mut source).await;
            assert_eq!(message.offset, expected);
            source.commit(&message).unwrap();
        }
        wait_for_commit(&source, 0, 3).await;

        assert!(source.backlog_tail().await.unwrap().is_drained());
    }

    #[test]
    fn test_commit_failures_are_counted() {
        let context = KafkaConsumerContext {
            liveness: liveness(),
        };
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(TOPIC, 0, Offset::Offset(4))
            .unwrap();

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            context.commit_callback(
                Err(KafkaError::ConsumerCommit(
                    RDKafkaErrorCode::RebalanceInProgress,
                )),
                &offsets,
            );
            context.commit_callback(Ok(()), &offsets);
        });

        let failures: Vec<u64> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(count) if key.key().name() == OFFSET_COMMIT_FAILURES => {
                    Some(count)
                }
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![1]);
    }

    #[test]
    fn test_backlog_tail_tracks_partitions() {
        let mut backlog = BacklogTail::new([(0, 10), (1, 3)]);
        assert!(!backlog.is_drained());

        assert!(backlog.contains(0, 0));
        assert!(backlog.contains(0, 10));
        assert!(!backlog.contains(0, 11));
        assert!(!backlog.contains(2, 0));

        backlog.record(0, 9);
        assert_eq!(backlog.tail(0), Some(10));

        backlog.record(0, 10);
        assert_eq!(backlog.tail(0), None);
        assert!(!backlog.is_drained());

        backlog.finish(1);
        assert!(backlog.is_drained());
    }

    #[test]
    fn test_empty_backlog_is_drained() {
        assert!(BacklogTail::default().is_drained());
        assert!(BacklogTail::new([]).is_drained());
    }
}
