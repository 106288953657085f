// Settle REST client
// Merchant API v1 endpoints with Settle auth headers. No retries here: callers
// own the retry policy (the provider re-delivers callbacks, checkout reports failure).

use async_trait::async_trait;
use chrono::Utc;
use http::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::settle::errors::{SettleApiError, SettleErrorEnvelope};
use crate::settle::signing::{
    content_digest, format_timestamp, signing_message, CallbackVerifier, RequestSigner,
    HEADER_AUTHORIZATION, HEADER_CONTENT_DIGEST, HEADER_MERCHANT, HEADER_TESTBED_TOKEN,
    HEADER_TIMESTAMP, HEADER_USER,
};
use crate::settle::types::{
    ensure_minor_units, CreatePaymentRequestBody, Outcome, PaymentRequestAccepted,
    PaymentRequestParams, ProviderResponse, RefundResponseData, UpdatePaymentRequestBody,
};
use crate::settle::ProviderClient;

const PAYMENT_REQUEST_PATH: &str = "/merchant/v1/payment_request/";

#[derive(Clone)]
pub struct SettleRestClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
    pub(crate) merchant_id: String,
    pub(crate) user_id: String,
    pub(crate) testbed_token: Option<String>,
    pub(crate) signer: Arc<dyn RequestSigner>,
    pub(crate) callback_verifier: Option<CallbackVerifier>,
}

impl SettleRestClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        merchant_id: impl Into<String>,
        user_id: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            merchant_id: merchant_id.into(),
            user_id: user_id.into(),
            testbed_token: None,
            signer,
            callback_verifier: None,
        }
    }

    pub fn with_testbed_token(mut self, token: impl Into<Option<String>>) -> Self {
        self.testbed_token = token.into().filter(|t| !t.is_empty());
        self
    }

    pub fn with_callback_verifier(mut self, verifier: impl Into<Option<CallbackVerifier>>) -> Self {
        self.callback_verifier = verifier.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn payment_request_url(&self, tid: &str) -> String {
        self.url(&format!("{PAYMENT_REQUEST_PATH}{tid}/"))
    }

    fn outcome_url(&self, tid: &str) -> String {
        self.url(&format!("{PAYMENT_REQUEST_PATH}{tid}/outcome/"))
    }

    fn build_request(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::RequestBuilder, SettleApiError> {
        let timestamp = format_timestamp(Utc::now());
        let mut settle_headers: Vec<(&str, String)> = vec![
            (HEADER_MERCHANT, self.merchant_id.clone()),
            (HEADER_USER, self.user_id.clone()),
            (HEADER_TIMESTAMP, timestamp),
        ];
        if let Some(b) = &body {
            settle_headers.push((HEADER_CONTENT_DIGEST, content_digest(b)));
        }

        let message = signing_message(
            method.as_str(),
            url,
            settle_headers.iter().map(|(k, v)| (*k, v.as_str())),
        );
        let authorization = self.signer.authorization(&message)?;

        let mut req = self
            .http
            .request(method, url)
            .header("Accept", "application/json")
            .header(HEADER_AUTHORIZATION, authorization);
        for (k, v) in settle_headers {
            req = req.header(k, v);
        }
        if let Some(token) = &self.testbed_token {
            req = req.header(HEADER_TESTBED_TOKEN, token);
        }
        if let Some(b) = body {
            req = req.header("Content-Type", "application/json").body(b);
        }
        Ok(req)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(StatusCode, String), SettleApiError> {
        let resp = req.send().await.map_err(|e| SettleApiError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| SettleApiError::Decode(e.to_string()))?;
        Ok((status, text))
    }

    fn map_error(status: StatusCode, body: &str) -> SettleApiError {
        match serde_json::from_str::<SettleErrorEnvelope>(body) {
            Ok(env) => env.to_api_error_with_status(status.as_u16()),
            Err(_) => SettleApiError::Settle {
                status: status.as_u16(),
                error: None,
                description: None,
            },
        }
    }

    fn decode<T: DeserializeOwned>(text: &str) -> Result<T, SettleApiError> {
        serde_json::from_str(text).map_err(|e| SettleApiError::Decode(e.to_string()))
    }

    fn encode<T: serde::Serialize>(body: &T) -> Result<Vec<u8>, SettleApiError> {
        serde_json::to_vec(body).map_err(|e| SettleApiError::Decode(e.to_string()))
    }

    async fn update_payment_request(
        &self,
        tid: &str,
        body: &UpdatePaymentRequestBody,
    ) -> Result<(StatusCode, String), SettleApiError> {
        let url = self.payment_request_url(tid);
        let req = self.build_request(Method::PUT, &url, Some(Self::encode(body)?))?;
        self.send(req).await
    }
}

#[async_trait]
impl ProviderClient for SettleRestClient {
    // POST /merchant/v1/payment_request/
    #[instrument(skip(self, params), fields(method="POST", path=PAYMENT_REQUEST_PATH, pos_tid=%params.merchant_order_ref))]
    async fn create_payment_request(
        &self,
        params: &PaymentRequestParams,
    ) -> Result<PaymentRequestAccepted, SettleApiError> {
        ensure_minor_units(params.amount_minor, &params.currency)
            .map_err(|e| SettleApiError::Precondition(e.to_string()))?;

        let body = CreatePaymentRequestBody::from(params);
        info!(
            target: "settle",
            method = "POST",
            path = PAYMENT_REQUEST_PATH,
            amount_minor = params.amount_minor,
            currency = %params.currency,
            pos_tid = %params.merchant_order_ref,
            required_scope = params.requested_scope.as_deref().unwrap_or(""),
            "settle request"
        );

        let url = self.url(PAYMENT_REQUEST_PATH);
        let req = self.build_request(Method::POST, &url, Some(Self::encode(&body)?))?;
        let (status, text) = self.send(req).await?;
        if status.is_success() {
            Self::decode::<PaymentRequestAccepted>(&text)
        } else {
            warn!(target: "settle", status = status.as_u16(), body = %text, "payment request rejected");
            Err(Self::map_error(status, &text))
        }
    }

    // GET /merchant/v1/payment_request/{tid}/outcome/
    #[instrument(skip(self), fields(method="GET", path="/merchant/v1/payment_request/{tid}/outcome/", tid=%tid))]
    async fn fetch_outcome(&self, tid: &str) -> Result<ProviderResponse<Option<Outcome>>, SettleApiError> {
        let url = self.outcome_url(tid);
        let req = self.build_request(Method::GET, &url, None)?;
        let (status, text) = self.send(req).await?;
        info!(target: "settle", tid = %tid, status = status.as_u16(), "settle outcome");

        let body = if status == StatusCode::OK {
            Some(Self::decode::<Outcome>(&text)?)
        } else {
            None
        };
        Ok(ProviderResponse {
            status_code: status.as_u16(),
            body,
        })
    }

    // PUT /merchant/v1/payment_request/{tid}/ {action: capture}
    #[instrument(skip(self), fields(method="PUT", tid=%tid))]
    async fn capture_payment(&self, tid: &str) -> bool {
        match self.update_payment_request(tid, &UpdatePaymentRequestBody::capture()).await {
            Ok((status, _)) if status == StatusCode::NO_CONTENT => {
                info!(target: "settle", tid = %tid, "capture accepted");
                true
            }
            Ok((status, text)) => {
                warn!(target: "settle", tid = %tid, status = status.as_u16(), body = %text, "capture rejected");
                false
            }
            Err(e) => {
                warn!(target: "settle", tid = %tid, error = %e, "capture failed");
                false
            }
        }
    }

    // PUT /merchant/v1/payment_request/{tid}/ {action: refund}
    #[instrument(skip(self, reason), fields(method="PUT", tid=%tid, refund_id=refund_sequence))]
    async fn refund_payment(
        &self,
        tid: &str,
        refund_sequence: u64,
        amount_minor: i64,
        reason: &str,
    ) -> Result<ProviderResponse<RefundResponseData>, SettleApiError> {
        let body = UpdatePaymentRequestBody::refund(refund_sequence, amount_minor, reason);
        let (status, text) = self.update_payment_request(tid, &body).await?;
        info!(target: "settle", tid = %tid, refund_id = refund_sequence, status = status.as_u16(), "settle refund");

        // Success bodies are empty; error bodies are best-effort.
        let data = serde_json::from_str::<RefundResponseData>(&text).unwrap_or_default();
        Ok(ProviderResponse {
            status_code: status.as_u16(),
            body: data,
        })
    }

    fn verify_signature(&self, method: &str, uri: &str, headers: &HeaderMap, body: &[u8]) -> bool {
        match &self.callback_verifier {
            Some(v) => match v.verify(method, uri, headers, body) {
                Ok(()) => true,
                Err(e) => {
                    warn!(target: "settle", error = %e, "callback signature rejected");
                    false
                }
            },
            None => {
                warn!(target: "settle", "no callback verifier configured");
                false
            }
        }
    }
}
