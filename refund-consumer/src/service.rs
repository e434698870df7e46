//! Builds consumer loops on top of Kafka, the schema registry and the payments API.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use refund_common::health::HealthRegistry;
use refund_common::kafka_consumer::KafkaMessageSource;
use refund_common::kafka_producer::create_kafka_producer;
use refund_common::payments::{PaymentGateway, PaymentsClient};
use refund_common::resilience::{ConsumerRole, KafkaResilienceHandler, RetryPolicy};
use refund_common::schema::AvroCodec;
use refund_common::topic::resolve_topic;
use refund_common::REFUND_REQUEST_SCHEMA;
use tracing::info;

use crate::config::Config;
use crate::consumer::{ConsumerLoop, LoopSettings};
use crate::error::ServiceError;
use crate::supervisor::LoopFactory;

/// How long a loop may go without reporting before it is considered stalled.
const LIVENESS_DEADLINE: time::Duration = time::Duration::seconds(30);

/// Everything a loop of a given role needs to know, derived from `Config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopPlan {
    pub group: String,
    pub offset_reset: &'static str,
    pub settings: LoopSettings,
}

impl LoopPlan {
    pub fn for_role(config: &Config, role: ConsumerRole) -> Self {
        let (group, initial_offset, throttle) = match role {
            ConsumerRole::Primary | ConsumerRole::ErrorQueue => {
                (&config.group_name, config.topic_offset, Duration::ZERO)
            }
            ConsumerRole::Retry => (
                &config.retry_group_name,
                config.retry_topic_offset,
                config.retry_throttle.0,
            ),
        };

        // A new group starts from the newest message, unless it has to seek to an initial
        // offset, in which case it reads from the start and skips what comes before it. The
        // error queue always reads from the start: its backlog is the whole point.
        let offset_reset = if initial_offset == -1 && role != ConsumerRole::ErrorQueue {
            "latest"
        } else {
            "earliest"
        };

        Self {
            group: group.as_str().to_owned(),
            offset_reset,
            settings: LoopSettings {
                name: role.as_str().to_owned(),
                topic: resolve_topic(
                    config.topic.as_str(),
                    role == ConsumerRole::Retry,
                    role == ConsumerRole::ErrorQueue,
                ),
                initial_offset,
                throttle,
                drain_backlog: role == ConsumerRole::ErrorQueue,
            },
        }
    }
}

pub struct KafkaLoopFactory {
    config: Config,
    liveness: HealthRegistry,
    registry_client: reqwest::Client,
    gateway: Arc<dyn PaymentGateway>,
}

impl KafkaLoopFactory {
    pub fn new(config: Config, liveness: HealthRegistry) -> Result<Self, ServiceError> {
        let registry_client = reqwest::Client::builder()
            .timeout(config.payments_api_timeout.0)
            .build()
            .map_err(ServiceError::RegistryClient)?;
        let gateway = PaymentsClient::new(
            config.payments_api_url.as_str(),
            config.payments_api_key.as_str(),
            config.payments_api_timeout.0,
        )?;

        Ok(Self {
            config,
            liveness,
            registry_client,
            gateway: Arc::new(gateway),
        })
    }
}

#[async_trait]
impl LoopFactory for KafkaLoopFactory {
    async fn build(&self, role: ConsumerRole) -> Result<ConsumerLoop, ServiceError> {
        let plan = LoopPlan::for_role(&self.config, role);
        info!(
            role = role.as_str(),
            group = %plan.group,
            topic = %plan.settings.topic,
            "building consumer loop"
        );

        let codec = Arc::new(
            AvroCodec::from_registry(
                &self.registry_client,
                self.config.schema_registry_url.as_str(),
                REFUND_REQUEST_SCHEMA,
            )
            .await?,
        );

        let producer = create_kafka_producer(&self.config.kafka).await?;
        let resilience = KafkaResilienceHandler::new(
            producer,
            codec.clone(),
            self.config.topic.as_str(),
            RetryPolicy::new(role, self.config.maximum_retry_attempts),
            Duration::from_millis(u64::from(self.config.kafka.kafka_message_timeout_ms)),
        );

        let liveness = self
            .liveness
            .register(&plan.settings.name, LIVENESS_DEADLINE);
        let source = KafkaMessageSource::new(
            &self.config.kafka,
            &plan.group,
            &plan.settings.topic,
            plan.offset_reset,
            liveness.clone(),
        )?;

        Ok(ConsumerLoop::new(
            plan.settings,
            Box::new(source),
            codec,
            self.gateway.clone(),
            Box::new(resilience),
            liveness,
        ))
    }
}
