use http::StatusCode;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors raised while fetching the record schema or (de)serializing records with it.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to fetch {subject} schema from registry: {error}")]
    RegistryRequest {
        subject: String,
        error: reqwest::Error,
    },
    #[error("schema registry returned status {status} for {subject}")]
    RegistryStatus { subject: String, status: StatusCode },
    #[error("invalid avro schema: {0}")]
    InvalidSchema(apache_avro::Error),
    #[error("avro decoding failed: {0}")]
    Decode(apache_avro::Error),
    #[error("avro encoding failed: {0}")]
    Encode(apache_avro::Error),
    #[error("decoded refund request is invalid: {0}")]
    InvalidRecord(&'static str),
}

/// Enumeration of errors related to posting a refund to the payments API.
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("unexpected status returned from payments api: [{}]", .status.as_u16())]
    UnexpectedStatus { status: StatusCode },
    #[error("payments api request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("invalid refund amount {amount:?}: {reason}")]
    InvalidAmount { amount: String, reason: &'static str },
    #[error("{0} cannot be used as a payments api base url")]
    InvalidBaseUrl(String),
}

impl PaymentError {
    /// The HTTP status observed, if the request got as far as a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PaymentError::UnexpectedStatus { status } => Some(*status),
            PaymentError::RequestError(error) => error.status(),
            _ => None,
        }
    }

    /// Whether delivering the same request later could succeed. This means: no response at all,
    /// 408, 429 and any 5XX.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::UnexpectedStatus { status } => is_retryable_status(*status),
            PaymentError::RequestError(error) => error.status().map_or(true, is_retryable_status),
            PaymentError::InvalidAmount { .. } | PaymentError::InvalidBaseUrl(_) => false,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Errors reported by the messaging transport while consuming.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("topic {0} was not found in cluster metadata")]
    UnknownTopic(String),
}

/// A message could not be processed. Decode and payment failures are handed to the
/// resilience handler through this single type, so it cannot tell them apart by contract.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("failed to decode refund request: {0}")]
    Decode(#[from] CodecError),
    #[error("failed to post refund: {0}")]
    Payment(#[from] PaymentError),
}

impl ProcessingError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessingError::Decode(_) => false,
            ProcessingError::Payment(error) => error.is_retryable(),
        }
    }
}

/// Errors raised while republishing a failed message.
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("failed to encode message for {topic}: {error}")]
    Encode { topic: String, error: CodecError },
    #[error("failed to produce message to {topic}: {error}")]
    Produce { topic: String, error: KafkaError },
    #[error("failed to flush republish producer: {0}")]
    Flush(KafkaError),
    #[error("republish producer flush task failed: {0}")]
    FlushTask(tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_status_display() {
        let error = PaymentError::UnexpectedStatus {
            status: StatusCode::BAD_REQUEST,
        };
        assert_eq!(
            error.to_string(),
            "unexpected status returned from payments api: [400]"
        );
        assert_eq!(error.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_is_retryable() {
        let status = |status| PaymentError::UnexpectedStatus { status };

        assert!(!status(StatusCode::BAD_REQUEST).is_retryable());
        assert!(!status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!status(StatusCode::OK).is_retryable());
        assert!(status(StatusCode::REQUEST_TIMEOUT).is_retryable());
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(status(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(status(StatusCode::SERVICE_UNAVAILABLE).is_retryable());

        let amount = PaymentError::InvalidAmount {
            amount: "1.234".to_owned(),
            reason: "too many decimal places",
        };
        assert!(!amount.is_retryable());
        assert!(!ProcessingError::from(amount).is_retryable());

        let decode = ProcessingError::from(CodecError::InvalidRecord("empty payment_id"));
        assert!(!decode.is_retryable());
    }
}
