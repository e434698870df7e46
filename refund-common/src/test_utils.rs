//! Fixtures shared by the tests of this crate and of the crates built on it.
use crate::refund_request::RefundRequest;
use crate::schema::{AvroCodec, RefundCodec};

/// The schema registered under the refund request subject.
pub const REFUND_REQUEST_SCHEMA: &str = r#"{"type":"record","name":"refund_request","namespace":"payments","fields":[{"name":"attempt","type":"int"},{"name":"payment_id","type":"string"},{"name":"refund_amount","type":"string"},{"name":"refund_reference","type":"string"}]}"#;

pub fn refund_request(attempt: i32) -> RefundRequest {
    RefundRequest {
        attempt,
        payment_id: "P1234".to_owned(),
        refund_amount: "116.32".to_owned(),
        refund_reference: "R-5678".to_owned(),
    }
}

pub fn codec() -> AvroCodec {
    AvroCodec::new(REFUND_REQUEST_SCHEMA).expect("fixture schema is valid")
}

/// `refund_request(attempt)`, Avro encoded.
pub fn encoded_refund_request(attempt: i32) -> Vec<u8> {
    codec()
        .encode(&refund_request(attempt))
        .expect("fixture request encodes")
}
