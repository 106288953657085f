//! Payment outcome reconciliation.
//!
//! A callback only names a resource URI. Everything applied to the order is
//! derived from the outcome fetched from the provider, never from the
//! callback body.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::locks::TransactionLocks;
use super::CaptureOutcome;
use super::retry::{poll_until, PollPolicy, Sleeper};
use crate::order::{
    Order, OrderStatus, OrderStore, PaymentMethod, META_BILLING_EMAIL, META_BILLING_PHONE,
    META_PAYMENT_STATUS, META_SHIPPING_ADDRESS_1, META_SHIPPING_CITY, META_SHIPPING_COUNTRY,
    META_SHIPPING_FIRST_NAME, META_SHIPPING_FULL_NAME, META_SHIPPING_LAST_NAME,
    META_SHIPPING_POSTCODE, StoreError,
};
use crate::settle::errors::CallbackError;
use crate::settle::types::{Outcome, OutcomeStatus};
use crate::settle::ProviderClient;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub test_mode: bool,
    /// Provider base URL without trailing slash.
    pub server_base_url: String,
    pub autocapture: bool,
    pub scope_poll: PollPolicy,
}

/// Which path triggered a capture; only changes the order notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTrigger {
    Automatic,
    Manual,
}

impl CaptureTrigger {
    fn completed_note(self) -> &'static str {
        match self {
            CaptureTrigger::Automatic => "Settle automatic capture completed",
            CaptureTrigger::Manual => "Settle manual capture completed",
        }
    }

    fn failed_note(self) -> &'static str {
        match self {
            CaptureTrigger::Automatic => "Settle automatic capture failed",
            CaptureTrigger::Manual => "Settle manual capture failed",
        }
    }

    fn failed_status_note(self) -> &'static str {
        match self {
            CaptureTrigger::Automatic => "Settle capture failed",
            CaptureTrigger::Manual => "Settle manual capture failed",
        }
    }
}

/// Transaction id is the third-from-last path segment: `.../{tid}/outcome/`.
pub fn transaction_id_from_uri(uri: &str) -> Option<&str> {
    let parts: Vec<&str> = uri.split('/').collect();
    if parts.len() < 3 {
        return None;
    }
    let tid = parts[parts.len() - 3];
    if tid.is_empty() {
        None
    } else {
        Some(tid)
    }
}

/// Exactly two space-separated tokens map to first/last name. Anything else
/// keeps the whole string as the last name.
pub fn split_shipping_name(full_name: &str) -> (String, String) {
    let pieces: Vec<&str> = full_name.split(' ').collect();
    if pieces.len() == 2 {
        (pieces[0].to_string(), pieces[1].to_string())
    } else {
        (String::new(), full_name.to_string())
    }
}

/// Capture `tid` and finalize the order, or mark it failed.
///
/// Returns whether the provider accepted the capture. The completion note is
/// only written once the transaction id is recorded on the order.
pub async fn capture_and_complete(
    client: &dyn ProviderClient,
    store: &dyn OrderStore,
    order_id: &str,
    tid: &str,
    trigger: CaptureTrigger,
) -> Result<bool, StoreError> {
    if client.capture_payment(tid).await {
        if store.complete_payment(order_id, tid).await? {
            store.add_note(order_id, trigger.completed_note()).await?;
        } else {
            info!(order_id = %order_id, tid = %tid, "payment already completed by a concurrent delivery");
        }
        return Ok(true);
    }

    warn!(order_id = %order_id, tid = %tid, trigger = ?trigger, "capture failed");
    store.add_note(order_id, trigger.failed_note()).await?;
    store
        .update_status(order_id, OrderStatus::Failed, Some(trigger.failed_status_note()))
        .await?;
    Ok(false)
}

pub struct OutcomeReconciler {
    client: Arc<dyn ProviderClient>,
    store: Arc<dyn OrderStore>,
    locks: Arc<TransactionLocks>,
    sleeper: Arc<dyn Sleeper>,
    settings: ReconcilerSettings,
}

impl OutcomeReconciler {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        store: Arc<dyn OrderStore>,
        sleeper: Arc<dyn Sleeper>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            client,
            store,
            locks: Arc::new(TransactionLocks::new()),
            sleeper,
            settings,
        }
    }

    /// Reconcile the outcome behind `uri`.
    ///
    /// `Ok` means the notification was handled and must not be re-delivered,
    /// even when the capture itself failed. Any `Err` asks for a retry.
    #[instrument(skip(self), fields(test_mode = self.settings.test_mode))]
    pub async fn reconcile(&self, uri: &str) -> Result<(), CallbackError> {
        debug!(target: "settle", uri = %uri, "reconciling outcome");

        let expected_prefix = format!("{}/", self.settings.server_base_url);
        if !self.settings.test_mode && !uri.starts_with(&expected_prefix) {
            warn!(target: "settle", uri = %uri, expected = %expected_prefix, "outcome uri does not match provider");
            return Err(CallbackError::UntrustedUri(uri.to_string()));
        }

        let tid = transaction_id_from_uri(uri)
            .ok_or_else(|| CallbackError::UntrustedUri(uri.to_string()))?
            .to_string();

        let _guard = self.locks.acquire(&tid).await;

        let mut outcome = self.fetch(&tid).await?;

        let order = self.store.get(&outcome.pos_tid).await?;
        if !order.payment_method.is_settle() {
            warn!(order_id = %order.id, method = %order.payment_method.as_str(), "outcome for non-Settle order");
            return Err(CallbackError::NotSettleOrder(order.id));
        }
        if order.settle_tid() != Some(tid.as_str()) {
            warn!(
                order_id = %order.id,
                tid = %tid,
                recorded = ?order.settle_tid(),
                "outcome transaction does not belong to order"
            );
            return Err(CallbackError::UntrustedUri(uri.to_string()));
        }

        self.store
            .set_metadata(&order.id, META_PAYMENT_STATUS, outcome.status.as_str())
            .await?;

        let express_auth =
            order.payment_method == PaymentMethod::SettleExpress && outcome.status == OutcomeStatus::Auth;
        if express_auth {
            if outcome.shipping_address().is_none() {
                outcome = self.wait_for_scope(&tid).await?;
            }
            self.project_permissions(&order.id, &outcome).await?;
        }

        if outcome.status == OutcomeStatus::Auth {
            self.handle_auth(&order, &tid).await?;
        } else {
            debug!(order_id = %order.id, status = %outcome.status, "outcome acknowledged");
        }
        Ok(())
    }

    /// Merchant-initiated capture for an order with a recorded transaction.
    ///
    /// Runs under the same transaction lock as callbacks and re-reads the
    /// order once the lock is held.
    pub async fn capture_manually(&self, order_id: &str) -> Result<CaptureOutcome, StoreError> {
        let tid = match self.store.get(order_id).await?.settle_tid() {
            Some(tid) => tid.to_string(),
            None => return Ok(CaptureOutcome::Skipped),
        };
        let _guard = self.locks.acquire(&tid).await;

        let order = self.store.get(order_id).await?;
        if !order.payment_method.is_settle() || order.transaction_id.is_some() {
            debug!(order_id = %order_id, "manual capture not applicable");
            return Ok(CaptureOutcome::Skipped);
        }

        let captured = capture_and_complete(
            self.client.as_ref(),
            self.store.as_ref(),
            order_id,
            &tid,
            CaptureTrigger::Manual,
        )
        .await?;
        Ok(if captured {
            CaptureOutcome::Captured
        } else {
            CaptureOutcome::Failed
        })
    }

    async fn fetch(&self, tid: &str) -> Result<Outcome, CallbackError> {
        let resp = self
            .client
            .fetch_outcome(tid)
            .await
            .map_err(|e| CallbackError::OutcomeUnavailable(e.to_string()))?;
        match resp.body {
            Some(outcome) if resp.status_code == 200 => Ok(outcome),
            _ => {
                warn!(target: "settle", tid = %tid, status = resp.status_code, "outcome fetch failed");
                Err(CallbackError::OutcomeUnavailable(format!(
                    "status {} for {}",
                    resp.status_code, tid
                )))
            }
        }
    }

    /// Express payments may be authorized before the permission grant lands.
    async fn wait_for_scope(&self, tid: &str) -> Result<Outcome, CallbackError> {
        let client = &self.client;
        let found = poll_until(
            "scope",
            self.sleeper.as_ref(),
            self.settings.scope_poll,
            |_| async move {
                debug!(target: "settle", tid = %tid, "no scope in outcome, trying again");
                match client.fetch_outcome(tid).await {
                    Ok(resp) if resp.status_code == 200 => resp.body,
                    _ => None,
                }
            },
            |outcome: &Outcome| outcome.shipping_address().is_some(),
        )
        .await;

        found.ok_or_else(|| {
            info!(target: "settle", tid = %tid, "outcome not updated with scopes yet, asking for a retry");
            CallbackError::ScopePending(tid.to_string())
        })
    }

    async fn project_permissions(&self, order_id: &str, outcome: &Outcome) -> Result<(), CallbackError> {
        let Some(info) = outcome.user_info() else {
            return Ok(());
        };
        let store = &self.store;
        store
            .set_metadata(order_id, META_BILLING_EMAIL, info.email.as_deref().unwrap_or(""))
            .await?;
        store
            .set_metadata(order_id, META_BILLING_PHONE, info.phone_number.as_deref().unwrap_or(""))
            .await?;

        if let Some(address) = &info.shipping_address {
            let (first, last) = split_shipping_name(&address.name);
            store.set_metadata(order_id, META_SHIPPING_FIRST_NAME, &first).await?;
            store.set_metadata(order_id, META_SHIPPING_LAST_NAME, &last).await?;
            store.set_metadata(order_id, META_SHIPPING_FULL_NAME, &address.name).await?;
            store
                .set_metadata(order_id, META_SHIPPING_ADDRESS_1, &address.street_address)
                .await?;
            store.set_metadata(order_id, META_SHIPPING_CITY, &address.locality).await?;
            store
                .set_metadata(order_id, META_SHIPPING_POSTCODE, &address.postal_code)
                .await?;
            store.set_metadata(order_id, META_SHIPPING_COUNTRY, &address.country).await?;
        }
        debug!(order_id = %order_id, "projected permission scope onto order");
        Ok(())
    }

    async fn handle_auth(&self, order: &Order, tid: &str) -> Result<(), CallbackError> {
        let settled = matches!(
            order.status,
            OrderStatus::Completed | OrderStatus::Failed | OrderStatus::Refunded
        );
        if settled || order.transaction_id.is_some() {
            info!(order_id = %order.id, status = %order.status, "order already settled, acknowledging auth");
            return Ok(());
        }

        if order.status != OrderStatus::Processing {
            self.store
                .update_status(&order.id, OrderStatus::Processing, Some("Settle payment status : auth"))
                .await?;
        }

        if self.settings.autocapture {
            capture_and_complete(
                self.client.as_ref(),
                self.store.as_ref(),
                &order.id,
                tid,
                CaptureTrigger::Automatic,
            )
            .await?;
        }
        Ok(())
    }
}
