// Settle provider module

pub mod errors;
pub mod rest;
pub mod signing;
pub mod types;

use async_trait::async_trait;
use http::HeaderMap;
use reqwest::Client;
use std::sync::Arc;

use crate::settings::SettleSettings;
use self::errors::SettleApiError;
use self::rest::SettleRestClient;
use self::signing::{CallbackVerifier, SecretSigner, SharedSecretVerifier};
use self::types::{
    Outcome, PaymentRequestAccepted, PaymentRequestParams, ProviderResponse, RefundResponseData,
};

/// Calls the gateway makes against the payment provider.
///
/// Implementations perform network I/O only and never touch orders.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Open a payment request. Any failure means "gateway temporarily unavailable".
    async fn create_payment_request(
        &self,
        params: &PaymentRequestParams,
    ) -> Result<PaymentRequestAccepted, SettleApiError>;

    /// Authoritative outcome for a transaction. `body` is only set on 200.
    async fn fetch_outcome(&self, tid: &str) -> Result<ProviderResponse<Option<Outcome>>, SettleApiError>;

    async fn capture_payment(&self, tid: &str) -> bool;

    /// `refund_sequence` is the per-attempt idempotency key.
    async fn refund_payment(
        &self,
        tid: &str,
        refund_sequence: u64,
        amount_minor: i64,
        reason: &str,
    ) -> Result<ProviderResponse<RefundResponseData>, SettleApiError>;

    fn verify_signature(&self, method: &str, uri: &str, headers: &HeaderMap, body: &[u8]) -> bool;
}

#[derive(Clone)]
pub struct SettleProvider {
    pub(crate) cfg: SettleSettings,
    pub(crate) rest: SettleRestClient,
}

impl SettleProvider {
    // Build reqwest client with rustls and timeout from cfg, store cfg clone.
    pub fn new(cfg: SettleSettings) -> Result<Self, SettleApiError> {
        let timeout = std::time::Duration::from_millis(if cfg.timeout_ms > 0 { cfg.timeout_ms } else { 15_000 });
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .danger_accept_invalid_certs(cfg.accept_invalid_certs())
            .build()
            .map_err(|e| SettleApiError::Http(e.to_string()))?;

        let verifier = if cfg.verify_callbacks {
            Some(
                CallbackVerifier::new(cfg.signature_tolerance_seconds)
                    .with_verifier(Arc::new(SharedSecretVerifier::new(cfg.callback_secret.clone()))),
            )
        } else {
            None
        };

        let rest = SettleRestClient::new(
            http,
            cfg.server_base_url(),
            cfg.merchant_id.clone(),
            cfg.user_id.clone(),
            Arc::new(SecretSigner::new(cfg.api_secret.clone())),
        )
        .with_testbed_token(if cfg.test_mode { Some(cfg.testbed_token.clone()) } else { None })
        .with_callback_verifier(verifier);

        Ok(Self { cfg, rest })
    }

    pub fn client(&self) -> Arc<dyn ProviderClient> {
        Arc::new(self.rest.clone())
    }

    pub fn settings(&self) -> &SettleSettings {
        &self.cfg
    }
}
