//! Avro encoding of refund requests, with the schema fetched from a schema registry.
use apache_avro::{from_avro_datum, to_avro_datum, Schema};
use serde::Deserialize;
use tracing::info;

use crate::error::CodecError;
use crate::refund_request::RefundRequest;

/// Turns raw payloads into refund requests and back.
pub trait RefundCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<RefundRequest, CodecError>;
    fn encode(&self, request: &RefundRequest) -> Result<Vec<u8>, CodecError>;
}

/// Codec for raw Avro datums, without any framing around them.
#[derive(Debug, Clone)]
pub struct AvroCodec {
    schema: Schema,
}

impl AvroCodec {
    pub fn new(definition: &str) -> Result<Self, CodecError> {
        let schema = Schema::parse_str(definition).map_err(CodecError::InvalidSchema)?;
        Ok(Self { schema })
    }

    /// Build a codec from the latest version of `subject` in the registry.
    pub async fn from_registry(
        client: &reqwest::Client,
        registry_url: &str,
        subject: &str,
    ) -> Result<Self, CodecError> {
        let definition = fetch_schema(client, registry_url, subject).await?;
        let codec = Self::new(&definition)?;
        info!("successfully received {} schema", subject);
        Ok(codec)
    }
}

impl RefundCodec for AvroCodec {
    fn decode(&self, payload: &[u8]) -> Result<RefundRequest, CodecError> {
        let mut reader = payload;
        let value = from_avro_datum(&self.schema, &mut reader, None).map_err(CodecError::Decode)?;
        let request: RefundRequest = apache_avro::from_value(&value).map_err(CodecError::Decode)?;
        request.validate()?;
        Ok(request)
    }

    fn encode(&self, request: &RefundRequest) -> Result<Vec<u8>, CodecError> {
        let value = apache_avro::to_value(request)
            .and_then(|value| value.resolve(&self.schema))
            .map_err(CodecError::Encode)?;
        to_avro_datum(&self.schema, value).map_err(CodecError::Encode)
    }
}

#[derive(Deserialize)]
struct RegisteredSchema {
    schema: String,
}

/// Fetch the latest schema definition registered under `subject`.
pub async fn fetch_schema(
    client: &reqwest::Client,
    registry_url: &str,
    subject: &str,
) -> Result<String, CodecError> {
    let url = format!(
        "{}/subjects/{}/versions/latest",
        registry_url.trim_end_matches('/'),
        subject
    );
    let request_error = |error| CodecError::RegistryRequest {
        subject: subject.to_owned(),
        error,
    };

    let response = client.get(&url).send().await.map_err(request_error)?;
    if !response.status().is_success() {
        return Err(CodecError::RegistryStatus {
            subject: subject.to_owned(),
            status: response.status(),
        });
    }

    let registered: RegisteredSchema = response.json().await.map_err(request_error)?;
    Ok(registered.schema)
}
