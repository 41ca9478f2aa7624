//! Transactional store on SQLite.
//!
//! Every [`Tx`] owns one pooled connection and opens with the begin statement
//! picked by the configured isolation, so a transaction holds the database
//! write lock from its first statement until commit or rollback. Writers are
//! therefore serialized; readers outside a transaction see committed rows
//! only. Unique indexes from `migrations/` are the final word on duplicates.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{Isolation, StoreConfig};
use crate::ids::Clock;
use crate::model::{
    CustomerId, Order, OrderId, OrderItem, OrderStatus, OutboxEvent, OutboxId, PageRequest,
    PayMethod, Product, ProductId, Wallet, WalletId, WalletTransaction,
};

mod error;
pub use error::{
    LEDGER_IDEMPOTENCY_KEY, ORDER_CUSTOMER_IDEMPOTENCY_KEY, ORDER_NO, StoreError, UNKNOWN_INDEX,
    WALLET_CUSTOMER,
};

mod queries;

mod tx;
pub use tx::Tx;

/// Filter for order listings.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub customer_id: Option<CustomerId>,
    pub status: Option<OrderStatus>,
    pub pay_method: Option<PayMethod>,
}

struct Inner {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    isolation: Isolation,
    statement_timeout: Duration,
    next_tx: AtomicU64,
}

/// Handle to the store; cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Open the database named by `config.url` and apply pending migrations.
    ///
    /// An in-memory database lives on a single pooled connection that is
    /// never recycled; transactions then queue for that connection.
    pub async fn connect(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let timeout = config.statement_timeout();
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(timeout);
        let pool_options = SqlitePoolOptions::new().acquire_timeout(timeout);
        let pool_options = if config.is_in_memory() {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            pool_options.max_connections(config.max_connections)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!().run(&pool).await?;
        info!(url = %config.url, isolation = ?config.isolation, "store ready");

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                clock,
                isolation: config.isolation,
                statement_timeout: timeout,
                next_tx: AtomicU64::new(1),
            }),
        })
    }

    /// Start a transaction. `deadline` bounds the wait for a connection and is
    /// checked again before every statement and at commit.
    pub async fn begin(&self, deadline: Option<Instant>) -> Result<Tx, StoreError> {
        let id = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);
        let (wait, bounded_by_deadline) = self.wait_bound(deadline)?;
        let mut conn = match tokio::time::timeout(wait, self.inner.pool.acquire()).await {
            Ok(conn) => conn?,
            Err(_) if bounded_by_deadline => {
                debug!(tx = id, "deadline exceeded waiting for a connection");
                return Err(StoreError::DeadlineExceeded);
            }
            Err(_) => {
                debug!(tx = id, "connection wait timed out");
                return Err(StoreError::LockTimeout);
            }
        };
        sqlx::query(self.inner.isolation.begin_statement())
            .execute(&mut *conn)
            .await?;
        debug!(tx = id, isolation = ?self.inner.isolation, "begin");
        Ok(Tx::new(id, self.clone(), conn, deadline))
    }

    pub fn isolation(&self) -> Isolation {
        self.inner.isolation
    }

    /// `min(statement_timeout, time left to the deadline)`, and whether the
    /// deadline is the tighter bound.
    fn wait_bound(&self, deadline: Option<Instant>) -> Result<(Duration, bool), StoreError> {
        let statement = self.inner.statement_timeout;
        match deadline {
            None => Ok((statement, false)),
            Some(deadline) => {
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .filter(|d| !d.is_zero())
                    .ok_or(StoreError::DeadlineExceeded)?;
                if remaining < statement {
                    Ok((remaining, true))
                } else {
                    Ok((statement, false))
                }
            }
        }
    }

    fn now_secs(&self) -> i64 {
        self.inner.clock.now_secs()
    }

    async fn acquire(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        Ok(self.inner.pool.acquire().await?)
    }
}

/// Reference data owned by collaborators outside the core (customer and
/// catalog management). The core itself never calls these.
impl Store {
    pub async fn insert_customer(&self, id: CustomerId) -> Result<(), StoreError> {
        let mut conn = self.acquire().await?;
        queries::insert_customer(&mut conn, id).await
    }

    pub async fn upsert_product(&self, product: &Product) -> Result<(), StoreError> {
        let mut conn = self.acquire().await?;
        queries::upsert_product(&mut conn, product).await
    }
}

/// Committed-state reads. Inside a transaction use the [`Tx`] methods instead;
/// an in-memory store has one connection and the transaction holds it.
impl Store {
    pub async fn customer_exists(&self, id: CustomerId) -> Result<bool, StoreError> {
        let mut conn = self.acquire().await?;
        queries::customer_exists(&mut conn, id).await
    }

    pub async fn products(&self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::products(&mut conn, ids).await
    }

    pub async fn wallet(&self, customer: CustomerId) -> Result<Option<Wallet>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::wallet(&mut conn, customer).await
    }

    pub async fn wallets(&self) -> Result<Vec<Wallet>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::wallets(&mut conn).await
    }

    /// Ledger rows of a wallet in insertion order.
    pub async fn ledger(&self, wallet: WalletId) -> Result<Vec<WalletTransaction>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::ledger(&mut conn, wallet).await
    }

    pub async fn ledger_page(
        &self,
        wallet: WalletId,
        page: PageRequest,
    ) -> Result<(Vec<WalletTransaction>, usize), StoreError> {
        let mut conn = self.acquire().await?;
        queries::ledger_page(&mut conn, wallet, page).await
    }

    pub async fn ledger_sum(&self, wallet: WalletId) -> Result<crate::Amount, StoreError> {
        let mut conn = self.acquire().await?;
        queries::ledger_sum(&mut conn, wallet).await
    }

    pub async fn ledger_by_key(&self, key: &str) -> Result<Option<WalletTransaction>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::ledger_by_key(&mut conn, key).await
    }

    pub async fn ledger_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.acquire().await?;
        queries::ledger_len(&mut conn).await
    }

    pub async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::order(&mut conn, id).await
    }

    pub async fn order_by_idem(
        &self,
        customer: CustomerId,
        key: &str,
    ) -> Result<Option<Order>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::order_by_idem(&mut conn, customer, key).await
    }

    /// An order and its items, read on one connection.
    pub async fn order_with_items(
        &self,
        id: OrderId,
    ) -> Result<Option<(Order, Vec<OrderItem>)>, StoreError> {
        let mut conn = self.acquire().await?;
        let Some(order) = queries::order(&mut conn, id).await? else {
            return Ok(None);
        };
        let items = queries::order_items(&mut conn, id).await?;
        Ok(Some((order, items)))
    }

    pub async fn order_items(&self, order: OrderId) -> Result<Vec<OrderItem>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::order_items(&mut conn, order).await
    }

    pub async fn orders_page(
        &self,
        filter: &OrderFilter,
        page: PageRequest,
    ) -> Result<(Vec<Order>, usize), StoreError> {
        let mut conn = self.acquire().await?;
        queries::orders_page(&mut conn, filter, page).await
    }

    pub async fn order_count(&self) -> Result<usize, StoreError> {
        let mut conn = self.acquire().await?;
        queries::order_count(&mut conn).await
    }

    pub async fn item_count(&self) -> Result<usize, StoreError> {
        let mut conn = self.acquire().await?;
        queries::item_count(&mut conn).await
    }

    pub async fn outbox(&self) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::outbox(&mut conn).await
    }

    pub async fn outbox_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut conn = self.acquire().await?;
        queries::outbox_pending(&mut conn, limit).await
    }

    /// Stamp `processed_at` on the given rows; already processed rows keep their stamp.
    pub async fn mark_outbox_processed(
        &self,
        ids: &[OutboxId],
        at: i64,
    ) -> Result<usize, StoreError> {
        let mut conn = self.acquire().await?;
        queries::mark_outbox_processed(&mut conn, ids, at).await
    }
}
