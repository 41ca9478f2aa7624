use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{OrderFilter, Store, StoreError, queries};
use crate::Amount;
use crate::model::{
    CustomerId, Order, OrderId, OrderItem, OrderStatus, OutboxId, PageRequest,
    Product, ProductId, Wallet, WalletId, WalletTransaction,
};

/// A live transaction on its own connection.
///
/// Reads see committed rows plus this transaction's own writes. Dropping a
/// transaction without committing rolls it back.
pub struct Tx {
    id: u64,
    store: Store,
    conn: Option<PoolConnection<Sqlite>>,
    deadline: Option<Instant>,
    savepoints: Vec<String>,
    next_savepoint: u32,
}

impl Tx {
    pub(super) fn new(
        id: u64,
        store: Store,
        conn: PoolConnection<Sqlite>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            store,
            conn: Some(conn),
            deadline,
            savepoints: Vec::new(),
            next_savepoint: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Stamp this transaction's outbox rows with the commit time, then commit.
    /// A passed deadline rolls back instead.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        let mut conn = self.conn.take().ok_or(StoreError::NoTransaction)?;
        if self.deadline_passed() {
            debug!(tx = self.id, "deadline passed before commit, rolling back");
            roll_back(conn, self.id).await;
            return Err(StoreError::DeadlineExceeded);
        }
        let commit_ts = self.store.now_secs();
        match commit_on(&mut conn, commit_ts).await {
            Ok(stamped) => {
                debug!(tx = self.id, outbox = stamped, commit_ts, "commit");
                Ok(())
            }
            Err(e) => {
                roll_back(conn, self.id).await;
                Err(e)
            }
        }
    }

    pub async fn rollback(mut self) {
        if let Some(conn) = self.conn.take() {
            roll_back(conn, self.id).await;
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The connection for the next statement; fails once the deadline passed.
    fn conn(&mut self) -> Result<&mut SqliteConnection, StoreError> {
        if self.deadline_passed() {
            debug!(tx = self.id, "deadline exceeded inside transaction");
            return Err(StoreError::DeadlineExceeded);
        }
        self.conn.as_deref_mut().ok_or(StoreError::NoTransaction)
    }
}

async fn commit_on(conn: &mut SqliteConnection, commit_ts: i64) -> Result<u64, StoreError> {
    let stamped = queries::stamp_outbox(conn, commit_ts).await?;
    sqlx::query("COMMIT").execute(&mut *conn).await?;
    Ok(stamped)
}

async fn roll_back(mut conn: PoolConnection<Sqlite>, id: u64) {
    match sqlx::query("ROLLBACK").execute(&mut *conn).await {
        Ok(_) => debug!(tx = id, "rollback"),
        Err(e) => warn!(tx = id, error = %e, "rollback failed"),
    }
}

/// Savepoints
impl Tx {
    /// Create a savepoint; names are unique within the transaction.
    pub async fn savepoint(&mut self) -> Result<String, StoreError> {
        self.next_savepoint += 1;
        let name = format!("sp_{}_{}", self.id, self.next_savepoint);
        let sql = format!("SAVEPOINT {name}");
        sqlx::query(&sql).persistent(false).execute(self.conn()?).await?;
        self.savepoints.push(name.clone());
        Ok(name)
    }

    /// Keep the work done since `name` and forget the savepoint.
    pub async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let pos = self.savepoint_pos(name)?;
        let sql = format!("RELEASE SAVEPOINT {name}");
        sqlx::query(&sql).persistent(false).execute(self.conn()?).await?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    /// Discard writes made since `name`; the transaction stays usable.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let pos = self.savepoint_pos(name)?;
        let rollback = format!("ROLLBACK TO SAVEPOINT {name}");
        sqlx::query(&rollback).persistent(false).execute(self.conn()?).await?;
        let release = format!("RELEASE SAVEPOINT {name}");
        sqlx::query(&release).persistent(false).execute(self.conn()?).await?;
        self.savepoints.truncate(pos);
        debug!(tx = self.id, savepoint = name, "rollback to savepoint");
        Ok(())
    }

    fn savepoint_pos(&self, name: &str) -> Result<usize, StoreError> {
        self.savepoints
            .iter()
            .position(|sp| sp == name)
            .ok_or_else(|| StoreError::SavepointNotFound(name.to_string()))
    }
}

/// Customers and products
impl Tx {
    pub async fn customer_exists(&mut self, id: CustomerId) -> Result<bool, StoreError> {
        queries::customer_exists(self.conn()?, id).await
    }

    pub async fn products(&mut self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        queries::products(self.conn()?, ids).await
    }
}

/// Wallets
impl Tx {
    pub async fn wallet(&mut self, customer: CustomerId) -> Result<Option<Wallet>, StoreError> {
        queries::wallet(self.conn()?, customer).await
    }

    /// `SELECT ... FOR UPDATE` on the customer's wallet row. The transaction
    /// already holds the database write lock, so a plain read is enough.
    pub async fn wallet_for_update(
        &mut self,
        customer: CustomerId,
    ) -> Result<Option<Wallet>, StoreError> {
        self.wallet(customer).await
    }

    /// Insert an empty active wallet for `customer`.
    pub async fn insert_wallet(&mut self, customer: CustomerId, now: i64) -> Result<Wallet, StoreError> {
        queries::insert_wallet(self.conn()?, customer, now).await
    }

    /// Write back balance, status and `updated_at`.
    pub async fn update_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError> {
        queries::update_wallet(self.conn()?, wallet).await
    }
}

/// Ledger
impl Tx {
    pub async fn ledger_by_key(&mut self, key: &str) -> Result<Option<WalletTransaction>, StoreError> {
        queries::ledger_by_key(self.conn()?, key).await
    }

    /// Append a ledger row. A key another transaction already committed fails
    /// with a uniqueness violation; only the statement is undone.
    pub async fn insert_ledger(
        &mut self,
        row: WalletTransaction,
    ) -> Result<WalletTransaction, StoreError> {
        queries::insert_ledger(self.conn()?, row).await
    }

    pub async fn ledger_page(
        &mut self,
        wallet: WalletId,
        page: PageRequest,
    ) -> Result<(Vec<WalletTransaction>, usize), StoreError> {
        queries::ledger_page(self.conn()?, wallet, page).await
    }

    pub async fn ledger_sum(&mut self, wallet: WalletId) -> Result<Amount, StoreError> {
        queries::ledger_sum(self.conn()?, wallet).await
    }
}

/// Orders
impl Tx {
    pub async fn order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        queries::order(self.conn()?, id).await
    }

    pub async fn order_for_update(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.order(id).await
    }

    pub async fn order_by_idem(
        &mut self,
        customer: CustomerId,
        key: &str,
    ) -> Result<Option<Order>, StoreError> {
        queries::order_by_idem(self.conn()?, customer, key).await
    }

    /// Insert an order. Unique on `order_no` and on `(customer_id, idempotency_key)`.
    pub async fn insert_order(&mut self, order: Order) -> Result<Order, StoreError> {
        queries::insert_order(self.conn()?, order).await
    }

    pub async fn update_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<Order, StoreError> {
        queries::update_order_status(self.conn()?, id, status).await?;
        self.order(id)
            .await?
            .ok_or_else(|| StoreError::RowNotFound(format!("order {id}")))
    }

    pub async fn insert_items(&mut self, items: Vec<OrderItem>) -> Result<Vec<OrderItem>, StoreError> {
        let mut inserted = Vec::with_capacity(items.len());
        for item in items {
            inserted.push(queries::insert_item(self.conn()?, item).await?);
        }
        Ok(inserted)
    }

    pub async fn order_items(&mut self, order: OrderId) -> Result<Vec<OrderItem>, StoreError> {
        queries::order_items(self.conn()?, order).await
    }

    pub async fn orders_page(
        &mut self,
        filter: &OrderFilter,
        page: PageRequest,
    ) -> Result<(Vec<Order>, usize), StoreError> {
        queries::orders_page(self.conn()?, filter, page).await
    }
}

/// Outbox
impl Tx {
    /// Append an outbox row; `created_at` is stamped with the commit time.
    pub async fn insert_outbox(&mut self, event_type: &str, payload: &[u8]) -> Result<OutboxId, StoreError> {
        queries::insert_outbox(self.conn()?, event_type, payload).await
    }

    /// Event types of the outbox rows written so far by this transaction.
    pub async fn pending_outbox(&mut self) -> Result<Vec<String>, StoreError> {
        queries::unstamped_outbox(self.conn()?).await
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(tx = self.id, "dropped without commit, rolling back");
                handle.spawn(roll_back(conn, self.id));
            }
            Err(_) => {
                warn!(tx = self.id, "dropped outside a runtime, closing connection");
                drop(conn.detach());
            }
        }
    }
}
