use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use refund_common::config::KafkaConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "SCHEMA_REGISTRY_URL")]
    pub schema_registry_url: NonEmptyString,

    #[envconfig(from = "KAFKA_ZOOKEEPER_ADDR")]
    pub zookeeper_addr: Option<String>,

    #[envconfig(from = "KAFKA_ZOOKEEPER_CHROOT", default = "")]
    pub zookeeper_chroot: String,

    #[envconfig(from = "REFUND_REQUEST_GROUP_NAME", default = "refund-request-consumer")]
    pub group_name: NonEmptyString,

    #[envconfig(
        from = "REFUND_REQUEST_RETRY_GROUP_NAME",
        default = "refund-request-consumer-retry"
    )]
    pub retry_group_name: NonEmptyString,

    #[envconfig(from = "REFUND_REQUEST_TOPIC", default = "refund-request")]
    pub topic: NonEmptyString,

    #[envconfig(from = "REFUND_REQUEST_TOPIC_OFFSET", default = "-1")]
    pub topic_offset: i64,

    #[envconfig(from = "REFUND_REQUEST_RETRY_TOPIC_OFFSET", default = "-1")]
    pub retry_topic_offset: i64,

    #[envconfig(from = "RETRY_THROTTLE_RATE_SECONDS", default = "3")]
    pub retry_throttle: EnvSecondsDuration,

    #[envconfig(from = "MAXIMUM_RETRY_ATTEMPTS", default = "2")]
    pub maximum_retry_attempts: u32,

    #[envconfig(from = "IS_ERROR_QUEUE_CONSUMER", default = "false")]
    pub is_error_queue_consumer: bool,

    #[envconfig(from = "PAYMENTS_API_URL")]
    pub payments_api_url: NonEmptyString,

    #[envconfig(from = "CHS_API_KEY")]
    pub payments_api_key: NonEmptyString,

    #[envconfig(from = "PAYMENTS_API_TIMEOUT_MS", default = "5000")]
    pub payments_api_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Debug is written by hand to keep the API key out of the logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind())
            .field("kafka_hosts", &self.kafka.kafka_hosts)
            .field("schema_registry_url", &self.schema_registry_url)
            .field("zookeeper_addr", &self.zookeeper_addr)
            .field("zookeeper_chroot", &self.zookeeper_chroot)
            .field("group_name", &self.group_name)
            .field("retry_group_name", &self.retry_group_name)
            .field("topic", &self.topic)
            .field("topic_offset", &self.topic_offset)
            .field("retry_topic_offset", &self.retry_topic_offset)
            .field("retry_throttle", &self.retry_throttle)
            .field("maximum_retry_attempts", &self.maximum_retry_attempts)
            .field("is_error_queue_consumer", &self.is_error_queue_consumer)
            .field("payments_api_url", &self.payments_api_url)
            .field("payments_api_timeout", &self.payments_api_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvSecondsDuration(pub time::Duration);

impl FromStr for EnvSecondsDuration {
    type Err = ParseEnvDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let seconds = s.parse::<u64>().map_err(|_| ParseEnvDurationError)?;

        Ok(EnvSecondsDuration(time::Duration::from_secs(seconds)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
