//! Order records as the host's order store exposes them.
//!
//! The gateway never owns orders; it reads and annotates them through
//! [`OrderStore`]. [`database::RedbOrderStore`] is the embedded
//! implementation used when the service runs standalone.

pub mod database;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// Metadata keys shared with the host
pub const META_SETTLE_TID: &str = "settle_tid";
pub const META_SETTLE_REDIRECT_URI: &str = "settle_redirect_uri";
pub const META_PAYMENT_STATUS: &str = "payment_status";
pub const META_REFUND_COUNTER: &str = "settle_refund_counter";
pub const META_PAID_DATE: &str = "_paid_date";
pub const META_BILLING_EMAIL: &str = "_billing_email";
pub const META_BILLING_PHONE: &str = "_billing_phone";
pub const META_SHIPPING_FULL_NAME: &str = "_shipping_full_name";
pub const META_SHIPPING_FIRST_NAME: &str = "_shipping_first_name";
pub const META_SHIPPING_LAST_NAME: &str = "_shipping_last_name";
pub const META_SHIPPING_ADDRESS_1: &str = "_shipping_address_1";
pub const META_SHIPPING_CITY: &str = "_shipping_city";
pub const META_SHIPPING_POSTCODE: &str = "_shipping_postcode";
pub const META_SHIPPING_COUNTRY: &str = "_shipping_country";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl OrderStatus {
    /// Statuses only move forward; re-applying the current one is allowed.
    /// A failed order can still complete when a later capture succeeds.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Completed)
                | (Completed, Refunded)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Processing => write!(f, "processing"),
            OrderStatus::Completed => write!(f, "completed"),
            OrderStatus::Failed => write!(f, "failed"),
            OrderStatus::Refunded => write!(f, "refunded"),
        }
    }
}

/// Payment method recorded on the order at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentMethod {
    Settle,
    SettleExpress,
    Other(String),
}

impl PaymentMethod {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentMethod::Settle => "settle",
            PaymentMethod::SettleExpress => "settle_express",
            PaymentMethod::Other(s) => s,
        }
    }

    pub fn is_settle(&self) -> bool {
        matches!(self, PaymentMethod::Settle | PaymentMethod::SettleExpress)
    }
}

impl From<String> for PaymentMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            "settle" => PaymentMethod::Settle,
            "settle_express" => PaymentMethod::SettleExpress,
            _ => PaymentMethod::Other(s),
        }
    }
}

impl From<PaymentMethod> for String {
    fn from(m: PaymentMethod) -> Self {
        m.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub quantity: u32,
    pub name: String,
    pub subtotal_minor: i64,
    #[serde(default)]
    pub tax_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub total_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    pub status: OrderStatus,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Order {
    #[cfg(test)]
    pub fn new(id: impl Into<String>, total_minor: i64, currency: impl Into<String>, payment_method: PaymentMethod) -> Self {
        Self {
            id: id.into(),
            total_minor,
            currency: currency.into(),
            line_items: Vec::new(),
            status: OrderStatus::Pending,
            transaction_id: None,
            payment_method,
            metadata: BTreeMap::new(),
            notes: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_line_item(mut self, item: LineItem) -> Self {
        self.line_items.push(item);
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn settle_tid(&self) -> Option<&str> {
        self.meta(META_SETTLE_TID)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order {0} not found")]
    NotFound(String),
    #[error("order {id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The host's order store.
///
/// Every mutating call is applied atomically to a single order.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Order, StoreError>;

    /// Hand-off point for orders created by the host at checkout.
    async fn insert(&self, order: Order) -> Result<(), StoreError>;

    /// Move the order to `status`, optionally recording a note with it.
    async fn update_status(&self, id: &str, status: OrderStatus, note: Option<&str>) -> Result<(), StoreError>;

    async fn set_metadata(&self, id: &str, key: &str, value: &str) -> Result<(), StoreError>;

    /// Set `key` only when it is absent or empty. Returns whether the value was written.
    async fn set_metadata_if_absent(&self, id: &str, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Increment an integer metadata counter and persist it, returning the new value.
    async fn increment_counter(&self, id: &str, key: &str) -> Result<u64, StoreError>;

    async fn add_note(&self, id: &str, note: &str) -> Result<(), StoreError>;

    /// Record the transaction id and mark the order paid, only if no
    /// transaction id is recorded yet. Returns `false` when another
    /// completion already won.
    async fn complete_payment(&self, id: &str, transaction_id: &str) -> Result<bool, StoreError>;
}
