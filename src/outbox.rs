//! Outbox writer and event payloads.
//!
//! Events are appended inside the caller's transaction and commit with the
//! business change they describe. Nothing here performs external I/O.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::Amount;
use crate::ids::Clock;
use crate::model::{CustomerId, LedgerType, OrderId, OutboxEvent, OutboxId, PayMethod};
use crate::runner::Ctx;
use crate::store::{Store, StoreError};

pub const ORDER_PLACED: &str = "order.placed";
pub const ORDER_PAID: &str = "order.paid";
pub const ORDER_REFUNDED: &str = "order.refunded";
pub const ORDER_CANCELLED: &str = "order.cancelled";
pub const WALLET_CREDITED: &str = "wallet.credited";
pub const WALLET_DEBITED: &str = "wallet.debited";
pub const CUSTOMER_CREATED: &str = "customer.created";
pub const CUSTOMER_UPDATED: &str = "customer.updated";

/// Payload of `order.placed` and `order.paid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderEvent {
    pub order_id: OrderId,
    pub order_no: String,
    pub customer_id: CustomerId,
    pub final_amount: Amount,
    pub pay_method: PayMethod,
    pub timestamp: i64,
}

/// Payload of `order.refunded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRefundedEvent {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub amount: Amount,
    pub reason: String,
    pub timestamp: i64,
}

/// Payload of `order.cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderCancelledEvent {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub reason: String,
    pub timestamp: i64,
}

/// Payload of `wallet.credited` and `wallet.debited`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletEvent {
    pub customer_id: CustomerId,
    pub amount: Amount,
    pub bonus: Amount,
    pub balance_after: Amount,
    #[serde(rename = "type")]
    pub tx_type: LedgerType,
    pub idempotency_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxWriter;

impl OutboxWriter {
    /// Append a raw event row to the live transaction.
    pub async fn append(
        &self,
        ctx: &mut Ctx,
        event_type: &str,
        payload: &[u8],
    ) -> Result<OutboxId, StoreError> {
        ctx.tx()?.insert_outbox(event_type, payload).await
    }

    /// Append an event with a JSON payload.
    pub async fn append_json<T: Serialize + Sync>(
        &self,
        ctx: &mut Ctx,
        event_type: &str,
        payload: &T,
    ) -> Result<OutboxId, StoreError> {
        let bytes = serde_json::to_vec(payload)?;
        self.append(ctx, event_type, &bytes).await
    }
}

/// Committed-side access for a dispatcher.
#[derive(Clone)]
pub struct OutboxReader {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl OutboxReader {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Oldest unprocessed events first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        self.store.outbox_pending(limit).await
    }

    /// Stamp the rows as processed now. Returns how many were newly marked;
    /// redelivered ids are ignored.
    pub async fn mark_processed(&self, ids: &[OutboxId]) -> Result<usize, StoreError> {
        let marked = self
            .store
            .mark_outbox_processed(ids, self.clock.now_secs())
            .await?;
        debug!(requested = ids.len(), marked, "outbox rows processed");
        Ok(marked)
    }
}
