//! Embedded order store
//!
//! Uses redb to keep orders as JSON documents keyed by order id. redb
//! serializes write transactions, so each read-modify-write below is atomic.

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::sync::Arc;

use super::{Order, OrderStatus, OrderStore, StoreError, META_PAID_DATE};

/// Key: order id
/// Value: serialized Order JSON
const ORDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");

fn backend<E: Into<redb::Error>>(e: E) -> StoreError {
    StoreError::Backend(e.into().to_string())
}

/// Database wrapper for order storage
#[derive(Clone)]
pub struct RedbOrderStore {
    db: Arc<Database>,
}

impl RedbOrderStore {
    /// Create a new database instance or open an existing one
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        let db = Database::create(path).map_err(backend)?;
        Self::init(db)
    }

    /// Volatile store, used by tests.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, StoreError> {
        // Create tables if they don't exist
        let write_txn = db.begin_write().map_err(backend)?;
        {
            let _table = write_txn.open_table(ORDERS_TABLE).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        tracing::info!("Order store initialized with orders table");

        Ok(Self { db: Arc::new(db) })
    }

    /// Read-modify-write one order inside a single write transaction.
    /// An error from `f` aborts the transaction.
    fn mutate<T, F>(&self, id: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Order) -> Result<T, StoreError>,
    {
        let write_txn = self.db.begin_write().map_err(backend)?;
        let out = {
            let mut table = write_txn.open_table(ORDERS_TABLE).map_err(backend)?;
            let raw = table
                .get(id)
                .map_err(backend)?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let mut order: Order = serde_json::from_slice(&raw)?;
            let out = f(&mut order)?;
            let value = serde_json::to_vec(&order)?;
            table.insert(id, value.as_slice()).map_err(backend)?;
            out
        };
        write_txn.commit().map_err(backend)?;
        Ok(out)
    }

    pub fn order_count(&self) -> Result<u64, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(ORDERS_TABLE).map_err(backend)?;
        table.len().map_err(backend)
    }
}

fn apply_status(order: &mut Order, status: OrderStatus) -> Result<(), StoreError> {
    if !order.status.can_transition_to(status) {
        return Err(StoreError::InvalidTransition {
            id: order.id.clone(),
            from: order.status,
            to: status,
        });
    }
    order.status = status;
    Ok(())
}

#[async_trait]
impl OrderStore for RedbOrderStore {
    async fn get(&self, id: &str) -> Result<Order, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(ORDERS_TABLE).map_err(backend)?;

        match table.get(id).map_err(backend)? {
            Some(curr) => Ok(serde_json::from_slice(curr.value())?),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn insert(&self, order: Order) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(ORDERS_TABLE).map_err(backend)?;
            let value = serde_json::to_vec(&order)?;
            table.insert(order.id.as_str(), value.as_slice()).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        tracing::debug!(order_id = %order.id, "Inserted order");
        Ok(())
    }

    async fn update_status(&self, id: &str, status: OrderStatus, note: Option<&str>) -> Result<(), StoreError> {
        self.mutate(id, |order| {
            apply_status(order, status)?;
            if let Some(note) = note {
                order.notes.push(note.to_string());
            }
            Ok(())
        })
    }

    async fn set_metadata(&self, id: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.mutate(id, |order| {
            order.metadata.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn set_metadata_if_absent(&self, id: &str, key: &str, value: &str) -> Result<bool, StoreError> {
        self.mutate(id, |order| {
            if order.meta(key).is_some() {
                return Ok(false);
            }
            order.metadata.insert(key.to_string(), value.to_string());
            Ok(true)
        })
    }

    async fn increment_counter(&self, id: &str, key: &str) -> Result<u64, StoreError> {
        self.mutate(id, |order| {
            let current = order
                .meta(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let next = current + 1;
            order.metadata.insert(key.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn add_note(&self, id: &str, note: &str) -> Result<(), StoreError> {
        self.mutate(id, |order| {
            order.notes.push(note.to_string());
            Ok(())
        })
    }

    async fn complete_payment(&self, id: &str, transaction_id: &str) -> Result<bool, StoreError> {
        self.mutate(id, |order| {
            if order.transaction_id.as_deref().is_some_and(|t| !t.is_empty()) {
                return Ok(false);
            }
            apply_status(order, OrderStatus::Completed)?;
            order.transaction_id = Some(transaction_id.to_string());
            order
                .metadata
                .insert(META_PAID_DATE.to_string(), Utc::now().format("%Y-%m-%d %H:%M:%S").to_string());
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{LineItem, PaymentMethod, META_REFUND_COUNTER, META_SETTLE_TID};

    fn order(id: &str) -> Order {
        Order::new(id, 15000, "NOK", PaymentMethod::Settle).with_line_item(LineItem {
            quantity: 1,
            name: "Coffee".into(),
            subtotal_minor: 12000,
            tax_minor: 3000,
        })
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = RedbOrderStore::in_memory().unwrap();
        store.insert(order("1")).await.unwrap();
        let loaded = store.get("1").await.unwrap();
        assert_eq!(loaded, order("1"));
        assert_eq!(store.order_count().unwrap(), 1);
        assert!(matches!(store.get("2").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_status_rejects_regression() {
        let store = RedbOrderStore::in_memory().unwrap();
        store.insert(order("1")).await.unwrap();
        store
            .update_status("1", OrderStatus::Failed, Some("capture failed"))
            .await
            .unwrap();
        let err = store
            .update_status("1", OrderStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let loaded = store.get("1").await.unwrap();
        assert_eq!(loaded.status, OrderStatus::Failed);
        assert_eq!(loaded.notes, vec!["capture failed".to_string()]);
    }

    #[tokio::test]
    async fn test_set_metadata_if_absent_writes_once() {
        let store = RedbOrderStore::in_memory().unwrap();
        store.insert(order("1")).await.unwrap();
        assert!(store.set_metadata_if_absent("1", META_SETTLE_TID, "tid_a").await.unwrap());
        assert!(!store.set_metadata_if_absent("1", META_SETTLE_TID, "tid_b").await.unwrap());
        assert_eq!(store.get("1").await.unwrap().settle_tid(), Some("tid_a"));
    }

    #[tokio::test]
    async fn test_increment_counter_persists() {
        let store = RedbOrderStore::in_memory().unwrap();
        store.insert(order("1")).await.unwrap();
        assert_eq!(store.increment_counter("1", META_REFUND_COUNTER).await.unwrap(), 1);
        assert_eq!(store.increment_counter("1", META_REFUND_COUNTER).await.unwrap(), 2);
        assert_eq!(
            store.get("1").await.unwrap().meta(META_REFUND_COUNTER),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_complete_payment_sets_transaction_id_once() {
        let store = RedbOrderStore::in_memory().unwrap();
        store.insert(order("1")).await.unwrap();
        store.update_status("1", OrderStatus::Processing, None).await.unwrap();

        assert!(store.complete_payment("1", "tid_a").await.unwrap());
        assert!(!store.complete_payment("1", "tid_b").await.unwrap());

        let loaded = store.get("1").await.unwrap();
        assert_eq!(loaded.status, OrderStatus::Completed);
        assert_eq!(loaded.transaction_id.as_deref(), Some("tid_a"));
        assert!(loaded.meta(META_PAID_DATE).is_some());
    }

    #[tokio::test]
    async fn test_complete_payment_recovers_failed_order() {
        let store = RedbOrderStore::in_memory().unwrap();
        store.insert(order("1")).await.unwrap();
        store
            .update_status("1", OrderStatus::Failed, Some("Settle capture failed"))
            .await
            .unwrap();

        assert!(store.complete_payment("1", "tid_a").await.unwrap());
        let loaded = store.get("1").await.unwrap();
        assert_eq!(loaded.status, OrderStatus::Completed);
        assert_eq!(loaded.transaction_id.as_deref(), Some("tid_a"));
    }

    #[tokio::test]
    async fn test_concurrent_completions_have_one_winner() {
        let store = RedbOrderStore::in_memory().unwrap();
        store.insert(order("1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.complete_payment("1", &format!("tid_{i}")).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
