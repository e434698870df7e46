use serde::{Deserialize, Serialize};

use crate::error::{CodecError, PaymentError};

/// A refund request as decoded from the topic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    /// Number of delivery attempts made before this one.
    pub attempt: i32,
    pub payment_id: String,
    /// Decimal amount in pounds, e.g. "116.32".
    pub refund_amount: String,
    pub refund_reference: String,
}

impl RefundRequest {
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.attempt < 0 {
            return Err(CodecError::InvalidRecord("attempt must not be negative"));
        }
        if self.payment_id.is_empty() {
            return Err(CodecError::InvalidRecord("payment_id must not be empty"));
        }
        Ok(())
    }
}

/// Body of a `POST /payments/{payment_id}/refunds` request.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RefundPostRequest {
    /// Amount in pence.
    pub amount: i64,
    pub refund_reference: String,
}

impl TryFrom<&RefundRequest> for RefundPostRequest {
    type Error = PaymentError;

    fn try_from(request: &RefundRequest) -> Result<Self, Self::Error> {
        Ok(RefundPostRequest {
            amount: amount_to_pence(&request.refund_amount)?,
            refund_reference: request.refund_reference.clone(),
        })
    }
}

/// Convert a decimal amount in pounds into pence. At most two decimal places are accepted, and
/// the result must be positive.
pub fn amount_to_pence(amount: &str) -> Result<i64, PaymentError> {
    let invalid = |reason| PaymentError::InvalidAmount {
        amount: amount.to_owned(),
        reason,
    };

    let trimmed = amount.trim();
    if trimmed.starts_with('-') {
        return Err(invalid("amount must be positive"));
    }

    let (pounds, fraction) = trimmed.split_once('.').unwrap_or((trimmed, "00"));
    if pounds.is_empty() || fraction.is_empty() {
        return Err(invalid("amount is not a decimal number"));
    }
    if !pounds.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid("amount is not a decimal number"));
    }
    if fraction.len() > 2 {
        return Err(invalid("amount has more than two decimal places"));
    }

    let pounds: i64 = pounds
        .parse()
        .map_err(|_| invalid("amount is too large"))?;
    let pence: i64 = format!("{fraction:0<2}")
        .parse()
        .map_err(|_| invalid("amount is not a decimal number"))?;

    let total = pounds
        .checked_mul(100)
        .and_then(|p| p.checked_add(pence))
        .ok_or_else(|| invalid("amount is too large"))?;

    if total == 0 {
        return Err(invalid("amount must be positive"));
    }

    Ok(total)
}
