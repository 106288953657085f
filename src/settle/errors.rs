// Settle-specific error types and mappings

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Settle REST error envelope: { error, error_description }
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleErrorEnvelope {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl SettleErrorEnvelope {
    pub fn to_api_error_with_status(self, status: u16) -> SettleApiError {
        SettleApiError::Settle {
            status,
            error: self.error,
            description: self.error_description,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettleApiError {
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("settle error: status={status} error={error:?} description={description:?}")]
    Settle {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl SettleApiError {
    #[cfg(test)]
    pub fn status(&self) -> Option<u16> {
        match self {
            SettleApiError::Settle { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// Helper indicating whether an error is likely transient (transport or 5xx)
pub fn is_transient(e: &SettleApiError) -> bool {
    match e {
        SettleApiError::Http(_) => true,
        SettleApiError::Settle { status, .. } => (500..600).contains(status) || *status == 429,
        _ => false,
    }
}

// Callback-specific errors
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("untrusted outcome uri: {0}")]
    UntrustedUri(String),
    #[error("outcome unavailable: {0}")]
    OutcomeUnavailable(String),
    #[error("unknown order: {0}")]
    UnknownOrder(String),
    #[error("order {0} is not a Settle order")]
    NotSettleOrder(String),
    #[error("permission scope not granted yet for {0}")]
    ScopePending(String),
    #[error("order store failure: {0}")]
    Store(String),
}

impl CallbackError {
    /// Map callback error to HTTP status code.
    ///
    /// Everything past the envelope checks answers 503 so the provider
    /// retries and learns nothing about which check failed.
    pub fn status_code(&self) -> u16 {
        match self {
            CallbackError::MalformedPayload(_) => 400,
            CallbackError::InvalidSignature(_) => 401,
            CallbackError::UntrustedUri(_)
            | CallbackError::OutcomeUnavailable(_)
            | CallbackError::UnknownOrder(_)
            | CallbackError::NotSettleOrder(_)
            | CallbackError::ScopePending(_)
            | CallbackError::Store(_) => 503,
        }
    }
}

impl From<crate::order::StoreError> for CallbackError {
    fn from(e: crate::order::StoreError) -> Self {
        match e {
            crate::order::StoreError::NotFound(id) => CallbackError::UnknownOrder(id),
            other => CallbackError::Store(other.to_string()),
        }
    }
}
