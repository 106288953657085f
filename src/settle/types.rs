// Settle merchant API DTOs and helper types
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Currencies the gateway accepts at checkout.
pub const SUPPORTED_CURRENCIES: &[&str] = &["NOK"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettlePreconditionError {
    #[error("currency {0} is not supported by Settle")]
    UnsupportedCurrency(String),
    #[error("amount must be non-negative minor units")]
    InvalidAmount,
}

// Enforce supported currency & minor units at the API boundary.
pub fn ensure_minor_units(amount_minor: i64, currency: &str) -> Result<(), SettlePreconditionError> {
    require_supported_currency(currency)?;
    require_non_negative_minor(amount_minor)?;
    Ok(())
}

pub fn require_supported_currency(currency: &str) -> Result<(), SettlePreconditionError> {
    let upper = currency.to_ascii_uppercase();
    if !SUPPORTED_CURRENCIES.contains(&upper.as_str()) {
        return Err(SettlePreconditionError::UnsupportedCurrency(currency.to_string()));
    }
    Ok(())
}

pub fn require_non_negative_minor(amount_minor: i64) -> Result<(), SettlePreconditionError> {
    if amount_minor < 0 {
        return Err(SettlePreconditionError::InvalidAmount);
    }
    Ok(())
}

/// Render minor units as a two-decimal string, e.g. `15000` -> `"150.00"`.
pub fn format_minor(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

// Request bodies

/// Everything the provider needs to open a payment request.
#[derive(Debug, Clone)]
pub struct PaymentRequestParams {
    pub return_url: String,
    pub cancel_url: String,
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
    pub merchant_order_ref: String,
    pub gateway_id: String,
    pub callback_url: String,
    pub requested_scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequestBody {
    pub action: String,
    pub amount: i64,
    pub currency: String,
    pub text: String,
    pub pos_id: String,
    pub pos_tid: String,
    pub callback_uri: String,
    pub success_return_uri: String,
    pub failure_return_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_scope: Option<String>,
}

impl From<&PaymentRequestParams> for CreatePaymentRequestBody {
    fn from(p: &PaymentRequestParams) -> Self {
        Self {
            action: "auth".to_string(),
            amount: p.amount_minor,
            currency: p.currency.to_ascii_uppercase(),
            text: p.description.clone(),
            pos_id: p.gateway_id.clone(),
            pos_tid: p.merchant_order_ref.clone(),
            callback_uri: p.callback_url.clone(),
            success_return_uri: p.return_url.clone(),
            failure_return_uri: p.cancel_url.clone(),
            required_scope: p.requested_scope.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePaymentRequestBody {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl UpdatePaymentRequestBody {
    pub fn capture() -> Self {
        Self {
            action: "capture".to_string(),
            refund_id: None,
            amount: None,
            text: None,
        }
    }

    pub fn refund(refund_sequence: u64, amount_minor: i64, reason: &str) -> Self {
        Self {
            action: "refund".to_string(),
            refund_id: Some(refund_sequence.to_string()),
            amount: Some(amount_minor),
            text: Some(reason.to_string()),
        }
    }
}

// Response shapes

/// Provider accepted a payment request; the customer goes to `redirect_uri`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequestAccepted {
    pub id: String,
    #[serde(rename = "uri")]
    pub redirect_uri: String,
}

/// Outcome status vocabulary. Unknown values are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OutcomeStatus {
    Initiated,
    Auth,
    Captured,
    Completed,
    Cancelled,
    Failed,
    Other(String),
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OutcomeStatus::Initiated => "initiated",
            OutcomeStatus::Auth => "auth",
            OutcomeStatus::Captured => "captured",
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Cancelled => "cancelled",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Other(s) => s,
        }
    }
}

impl From<String> for OutcomeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "initiated" => OutcomeStatus::Initiated,
            "auth" => OutcomeStatus::Auth,
            "captured" => OutcomeStatus::Captured,
            "completed" | "ok" => OutcomeStatus::Completed,
            "cancelled" | "canceled" => OutcomeStatus::Cancelled,
            "failed" | "fail" => OutcomeStatus::Failed,
            _ => OutcomeStatus::Other(s),
        }
    }
}

impl From<OutcomeStatus> for String {
    fn from(s: OutcomeStatus) -> Self {
        s.as_str().to_string()
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome snapshot as returned by `GET .../{tid}/outcome/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub pos_tid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

impl Outcome {
    pub fn user_info(&self) -> Option<&UserInfo> {
        self.permissions.as_ref().and_then(|p| p.user_info.as_ref())
    }

    pub fn shipping_address(&self) -> Option<&ShippingAddress> {
        self.user_info().and_then(|u| u.shipping_address.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub street_address: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub country: String,
}

/// Status code plus decoded body, for calls whose non-success answers still matter.
#[derive(Debug, Clone)]
pub struct ProviderResponse<T> {
    pub status_code: u16,
    pub body: T,
}

/// Free-form error body; `error_description` is the human-readable part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefundResponseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

// Callback envelope

/// Notification body posted by Settle to the callback URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    pub meta: CallbackMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}
