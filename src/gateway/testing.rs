// Scripted provider used by gateway and server tests

use async_trait::async_trait;
use http::HeaderMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::order::{OrderStore, META_REFUND_COUNTER};
use crate::settle::errors::SettleApiError;
use crate::settle::types::{
    Outcome, OutcomeStatus, PaymentRequestAccepted, PaymentRequestParams, Permissions,
    ProviderResponse, RefundResponseData, ShippingAddress, UserInfo,
};
use crate::settle::ProviderClient;

pub(crate) fn auth_outcome(order_id: &str) -> Outcome {
    Outcome {
        status: OutcomeStatus::Auth,
        pos_tid: order_id.to_string(),
        permissions: None,
    }
}

pub(crate) fn express_outcome(order_id: &str, name: Option<&str>) -> Outcome {
    Outcome {
        status: OutcomeStatus::Auth,
        pos_tid: order_id.to_string(),
        permissions: Some(Permissions {
            user_info: Some(UserInfo {
                email: Some("jane@example.com".into()),
                phone_number: Some("+4799999999".into()),
                shipping_address: name.map(|n| ShippingAddress {
                    name: n.to_string(),
                    street_address: "Karl Johans gate 1".into(),
                    locality: "Oslo".into(),
                    postal_code: "0154".into(),
                    country: "NO".into(),
                }),
            }),
        }),
    }
}

/// Replays queued outcomes in order; the last one repeats.
pub(crate) struct ScriptedClient {
    outcomes: Mutex<VecDeque<ProviderResponse<Option<Outcome>>>>,
    fetches: AtomicU32,
    capture_ok: AtomicBool,
    captures: AtomicU32,
    accepted: Mutex<Option<PaymentRequestAccepted>>,
    pub(crate) created: Mutex<Vec<PaymentRequestParams>>,
    refund_statuses: Mutex<VecDeque<(u16, RefundResponseData)>>,
    /// (sequence, amount, reason, counter persisted at call time)
    pub(crate) refunds: Mutex<Vec<(u64, i64, String, Option<String>)>>,
    observed_store: Mutex<Option<(Arc<dyn OrderStore>, String)>>,
    signature_ok: AtomicBool,
    pub(crate) verified_urls: Mutex<Vec<String>>,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fetches: AtomicU32::new(0),
            capture_ok: AtomicBool::new(true),
            captures: AtomicU32::new(0),
            accepted: Mutex::new(None),
            created: Mutex::new(Vec::new()),
            refund_statuses: Mutex::new(VecDeque::new()),
            refunds: Mutex::new(Vec::new()),
            observed_store: Mutex::new(None),
            signature_ok: AtomicBool::new(true),
            verified_urls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedClient {
    pub(crate) fn with_outcome(self, status_code: u16, outcome: Outcome) -> Self {
        self.outcomes.lock().unwrap().push_back(ProviderResponse {
            status_code,
            body: Some(outcome),
        });
        self
    }

    pub(crate) fn with_status_only(self, status_code: u16) -> Self {
        self.outcomes.lock().unwrap().push_back(ProviderResponse {
            status_code,
            body: None,
        });
        self
    }

    pub(crate) fn with_capture_result(self, ok: bool) -> Self {
        self.set_capture_result(ok);
        self
    }

    pub(crate) fn set_capture_result(&self, ok: bool) {
        self.capture_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn with_accepted(self, id: &str, redirect_uri: &str) -> Self {
        *self.accepted.lock().unwrap() = Some(PaymentRequestAccepted {
            id: id.to_string(),
            redirect_uri: redirect_uri.to_string(),
        });
        self
    }

    pub(crate) fn with_refund_response(self, status_code: u16, description: Option<&str>) -> Self {
        self.refund_statuses.lock().unwrap().push_back((
            status_code,
            RefundResponseData {
                error: description.map(|_| "refund_rejected".to_string()),
                error_description: description.map(str::to_string),
            },
        ));
        self
    }

    pub(crate) fn with_signature_result(self, ok: bool) -> Self {
        self.signature_ok.store(ok, Ordering::SeqCst);
        self
    }

    /// Record the refund counter of `order_id` at each refund call.
    pub(crate) fn observe_counter(&self, store: Arc<dyn OrderStore>, order_id: &str) {
        *self.observed_store.lock().unwrap() = Some((store, order_id.to_string()));
    }

    pub(crate) fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn capture_count(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn create_payment_request(
        &self,
        params: &PaymentRequestParams,
    ) -> Result<PaymentRequestAccepted, SettleApiError> {
        self.created.lock().unwrap().push(params.clone());
        self.accepted
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SettleApiError::Http("connection refused".into()))
    }

    async fn fetch_outcome(&self, _tid: &str) -> Result<ProviderResponse<Option<Outcome>>, SettleApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().unwrap();
        let next = if outcomes.len() > 1 {
            outcomes.pop_front()
        } else {
            outcomes.front().cloned()
        };
        next.ok_or_else(|| SettleApiError::Http("no outcome scripted".into()))
    }

    async fn capture_payment(&self, _tid: &str) -> bool {
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.capture_ok.load(Ordering::SeqCst)
    }

    async fn refund_payment(
        &self,
        _tid: &str,
        refund_sequence: u64,
        amount_minor: i64,
        reason: &str,
    ) -> Result<ProviderResponse<RefundResponseData>, SettleApiError> {
        let observed = self.observed_store.lock().unwrap().clone();
        let persisted = match observed {
            Some((store, id)) => store
                .get(&id)
                .await
                .ok()
                .and_then(|o| o.metadata.get(META_REFUND_COUNTER).cloned()),
            None => None,
        };
        self.refunds
            .lock()
            .unwrap()
            .push((refund_sequence, amount_minor, reason.to_string(), persisted));

        let (status_code, body) = self
            .refund_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((204, RefundResponseData::default()));
        Ok(ProviderResponse { status_code, body })
    }

    fn verify_signature(&self, _method: &str, uri: &str, _headers: &HeaderMap, _body: &[u8]) -> bool {
        self.verified_urls.lock().unwrap().push(uri.to_string());
        self.signature_ok.load(Ordering::SeqCst)
    }
}
