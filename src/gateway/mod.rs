//! Payment flow controller.
//!
//! [`SettleGateway`] ties the provider client, the order store and the
//! outcome reconciler together behind the [`PaymentGateway`] capability
//! trait the HTTP layer talks to.

pub mod locks;
pub mod reconcile;
pub mod retry;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use http::HeaderMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use self::reconcile::{OutcomeReconciler, ReconcilerSettings};
use self::retry::{PollPolicy, Sleeper};
use crate::order::{
    Order, OrderStore, PaymentMethod, StoreError, META_REFUND_COUNTER, META_SETTLE_REDIRECT_URI,
    META_SETTLE_TID,
};
use crate::settings::{ConfigError, SettleSettings};
use crate::settle::errors::{is_transient, CallbackError};
use crate::settle::types::{format_minor, require_supported_currency, CallbackEnvelope, PaymentRequestParams};
use crate::settle::ProviderClient;

pub const GATEWAY_ID: &str = "settle";

/// Permission scope requested for express checkout.
pub const EXPRESS_SCOPE: &str = "email phone shipping_address";

pub const UNAVAILABLE_MESSAGE: &str = "We are currently experiencing problems trying to connect to this payment gateway. Sorry for the inconvenience.";

const GENERIC_REFUND_FAILURE: &str = "Refund failed";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{}", UNAVAILABLE_MESSAGE)]
    Unavailable,
    #[error("gateway disabled: {0}")]
    Disabled(#[from] ConfigError),
    #[error("order {0} is not a Settle order")]
    NotSettleOrder(String),
    #[error("order {0} has no Settle transaction")]
    MissingTransaction(String),
    #[error("{0}")]
    RefundRejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Not a Settle order, nothing to capture, or already paid.
    Skipped,
    Captured,
    Failed,
}

impl CaptureOutcome {
    pub fn captured(self) -> bool {
        self == CaptureOutcome::Captured
    }
}

/// What the host can ask of a payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn id(&self) -> &'static str;

    fn validate_configuration(&self) -> Result<(), ConfigError>;

    /// Open a payment request and return the URL the customer is sent to.
    async fn create_request(&self, order_id: &str) -> Result<String, GatewayError>;

    /// Handle a provider notification. The error decides the HTTP status.
    async fn handle_callback(
        &self,
        method: &str,
        uri: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), CallbackError>;

    async fn capture(&self, order_id: &str) -> Result<CaptureOutcome, GatewayError>;

    async fn refund(&self, order_id: &str, amount_minor: i64, reason: &str) -> Result<(), GatewayError>;
}

/// One line per item: `qty \t name \t amount \n`.
pub fn order_description(order: &Order) -> String {
    order
        .line_items
        .iter()
        .map(|item| {
            format!(
                "{}\t{}\t{}\n",
                item.quantity,
                item.name,
                format_minor(item.subtotal_minor + item.tax_minor)
            )
        })
        .collect()
}

/// Parse the notification envelope, returning the resource URI.
pub fn parse_callback(body: &[u8]) -> Result<String, CallbackError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(CallbackError::MalformedPayload("empty body".into()));
    }
    let envelope: CallbackEnvelope =
        serde_json::from_slice(body).map_err(|e| CallbackError::MalformedPayload(e.to_string()))?;
    match (envelope.meta.id, envelope.meta.uri) {
        (Some(id), Some(uri)) if !id.is_empty() && !uri.is_empty() => {
            debug!(target: "settle", callback_id = %id, uri = %uri, event = ?envelope.meta.event, "callback identified");
            Ok(uri)
        }
        _ => Err(CallbackError::MalformedPayload("missing meta.id or meta.uri".into())),
    }
}

/// Absolute URL the provider signed: the request path and query on the
/// scheme and host of the configured callback URL.
pub fn callback_signed_url(callback_url: &str, request_uri: &str) -> String {
    let Ok(request) = request_uri.parse::<http::Uri>() else {
        return request_uri.to_string();
    };
    if request.scheme().is_some() {
        return request_uri.to_string();
    }
    let Ok(base) = callback_url.parse::<http::Uri>() else {
        return request_uri.to_string();
    };
    match (base.scheme_str(), base.authority(), request.path_and_query()) {
        (Some(scheme), Some(authority), Some(path)) => format!("{}://{}{}", scheme, authority, path),
        _ => request_uri.to_string(),
    }
}

pub struct SettleGateway {
    settings: SettleSettings,
    store_currency: String,
    client: Arc<dyn ProviderClient>,
    store: Arc<dyn OrderStore>,
    reconciler: OutcomeReconciler,
}

impl SettleGateway {
    pub fn new(
        settings: SettleSettings,
        store_currency: impl Into<String>,
        client: Arc<dyn ProviderClient>,
        store: Arc<dyn OrderStore>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let reconciler = OutcomeReconciler::new(
            client.clone(),
            store.clone(),
            sleeper,
            ReconcilerSettings {
                test_mode: settings.test_mode,
                server_base_url: settings.server_base_url(),
                autocapture: settings.autocapture,
                scope_poll: PollPolicy {
                    attempts: settings.scope_poll_attempts,
                    interval: settings.scope_poll_interval,
                    timeout: settings.scope_wait_timeout,
                },
            },
        );
        Self {
            settings,
            store_currency: store_currency.into(),
            client,
            store,
            reconciler,
        }
    }

    async fn settle_order(&self, order_id: &str) -> Result<Order, GatewayError> {
        self.validate_configuration()?;
        let order = self.store.get(order_id).await?;
        if !order.payment_method.is_settle() {
            return Err(GatewayError::NotSettleOrder(order.id));
        }
        Ok(order)
    }

    fn payment_params(&self, order: &Order) -> PaymentRequestParams {
        PaymentRequestParams {
            return_url: self.settings.return_url(&order.id),
            cancel_url: self.settings.cancel_url(&order.id),
            amount_minor: order.total_minor,
            currency: order.currency.clone(),
            description: order_description(order),
            merchant_order_ref: order.id.clone(),
            gateway_id: GATEWAY_ID.to_string(),
            callback_url: self.settings.callback_url.clone(),
            requested_scope: match order.payment_method {
                PaymentMethod::SettleExpress => Some(EXPRESS_SCOPE.to_string()),
                _ => None,
            },
        }
    }

    /// Redirect recorded by an earlier request for this order, if any.
    async fn stored_redirect(&self, order_id: &str) -> Result<Option<String>, GatewayError> {
        let order = self.store.get(order_id).await?;
        Ok(order.meta(META_SETTLE_REDIRECT_URI).map(str::to_string))
    }
}

#[async_trait]
impl PaymentGateway for SettleGateway {
    fn id(&self) -> &'static str {
        GATEWAY_ID
    }

    fn validate_configuration(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        require_supported_currency(&self.store_currency)
            .map_err(|_| ConfigError::UnsupportedCurrency(self.store_currency.clone()))
    }

    #[instrument(skip(self))]
    async fn create_request(&self, order_id: &str) -> Result<String, GatewayError> {
        let order = self.settle_order(order_id).await?;

        if order.settle_tid().is_some() {
            return match order.meta(META_SETTLE_REDIRECT_URI) {
                Some(uri) => {
                    debug!(order_id = %order_id, "payment request already open");
                    Ok(uri.to_string())
                }
                None => {
                    warn!(order_id = %order_id, "transaction recorded without redirect");
                    Err(GatewayError::Unavailable)
                }
            };
        }

        let params = self.payment_params(&order);
        let accepted = match self.client.create_payment_request(&params).await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(
                    order_id = %order_id,
                    transient = is_transient(&e),
                    error = %e,
                    "create payment request failed"
                );
                return Err(GatewayError::Unavailable);
            }
        };

        if !self
            .store
            .set_metadata_if_absent(order_id, META_SETTLE_TID, &accepted.id)
            .await?
        {
            // A concurrent checkout won; its request is the one the order tracks.
            info!(order_id = %order_id, tid = %accepted.id, "discarding duplicate payment request");
            return self.stored_redirect(order_id).await?.ok_or(GatewayError::Unavailable);
        }
        self.store
            .set_metadata(order_id, META_SETTLE_REDIRECT_URI, &accepted.redirect_uri)
            .await?;

        info!(order_id = %order_id, tid = %accepted.id, "payment request created");
        Ok(accepted.redirect_uri)
    }

    async fn handle_callback(
        &self,
        method: &str,
        uri: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), CallbackError> {
        let resource_uri = parse_callback(body)?;

        if self.settings.verify_callbacks {
            let signed_url = callback_signed_url(&self.settings.callback_url, uri);
            if !self.client.verify_signature(method, &signed_url, headers, body) {
                return Err(CallbackError::InvalidSignature("signature check failed".into()));
            }
        }

        if let Err(e) = self.validate_configuration() {
            warn!(error = %e, "callback received while gateway is disabled");
            return Err(CallbackError::OutcomeUnavailable(e.to_string()));
        }

        self.reconciler.reconcile(&resource_uri).await
    }

    #[instrument(skip(self))]
    async fn capture(&self, order_id: &str) -> Result<CaptureOutcome, GatewayError> {
        let order = match self.settle_order(order_id).await {
            Ok(order) => order,
            Err(GatewayError::NotSettleOrder(_)) => return Ok(CaptureOutcome::Skipped),
            Err(e) => return Err(e),
        };
        if order.transaction_id.is_some() {
            return Ok(CaptureOutcome::Skipped);
        }
        if order.settle_tid().is_none() {
            return Err(GatewayError::MissingTransaction(order.id));
        }
        Ok(self.reconciler.capture_manually(order_id).await?)
    }

    #[instrument(skip(self, reason))]
    async fn refund(&self, order_id: &str, amount_minor: i64, reason: &str) -> Result<(), GatewayError> {
        let order = self.settle_order(order_id).await?;
        let tid = order
            .settle_tid()
            .ok_or_else(|| GatewayError::MissingTransaction(order.id.clone()))?;

        // Persist the sequence before calling out so a retry never reuses it.
        let sequence = self.store.increment_counter(order_id, META_REFUND_COUNTER).await?;

        let resp = match self.client.refund_payment(tid, sequence, amount_minor, reason).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(order_id = %order_id, sequence = sequence, error = %e, "refund request failed");
                return Err(GatewayError::RefundRejected(GENERIC_REFUND_FAILURE.to_string()));
            }
        };

        if resp.status_code == 204 {
            self.store
                .add_note(
                    order_id,
                    &format!("Settle refund {} of {} completed", sequence, format_minor(amount_minor)),
                )
                .await?;
            info!(order_id = %order_id, sequence = sequence, "refund accepted");
            return Ok(());
        }

        warn!(order_id = %order_id, sequence = sequence, status = resp.status_code, "refund rejected");
        Err(GatewayError::RefundRejected(
            resp.body
                .error_description
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| GENERIC_REFUND_FAILURE.to_string()),
        ))
    }
}
