//! SQL for every table, shared by pooled reads and live transactions.

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use super::{OrderFilter, StoreError};
use crate::Amount;
use crate::model::{
    CustomerId, Order, OrderId, OrderItem, OrderStatus, OutboxEvent, OutboxId, PageRequest,
    ParseEnumError, Product, ProductId, Wallet, WalletId, WalletStatus, WalletTransaction,
};

const WALLET_COLUMNS: &str = "id, customer_id, balance, status, updated_at";
const LEDGER_COLUMNS: &str = "id, wallet_id, direction, amount, type, biz_ref_type, biz_ref_id, \
     idempotency_key, operator_id, reason_code, note, created_at";
const ORDER_COLUMNS: &str = "id, order_no, customer_id, status, pay_method, total_amount, \
     discount_amount, final_amount, remark, channel, assigned_to, source_ref, idempotency_key, \
     created_at";
const ITEM_COLUMNS: &str = "id, order_id, product_id, product_name_snapshot, \
     unit_price_snapshot, duration_min_snapshot, quantity, final_price";
const OUTBOX_COLUMNS: &str = "id, event_type, payload, created_at, processed_at";

fn amount(row: &SqliteRow, column: &str) -> Result<Amount, StoreError> {
    Ok(Amount::from_minor(row.try_get(column)?))
}

fn wallet_from_row(row: &SqliteRow) -> Result<Wallet, StoreError> {
    let code: i64 = row.try_get("status")?;
    let status = i8::try_from(code)
        .ok()
        .and_then(WalletStatus::from_code)
        .ok_or_else(|| ParseEnumError {
            kind: "wallet status",
            value: code.to_string(),
        })?;
    Ok(Wallet {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        balance: amount(row, "balance")?,
        status,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ledger_from_row(row: &SqliteRow) -> Result<WalletTransaction, StoreError> {
    Ok(WalletTransaction {
        id: row.try_get("id")?,
        wallet_id: row.try_get("wallet_id")?,
        direction: row.try_get::<String, _>("direction")?.parse()?,
        amount: amount(row, "amount")?,
        tx_type: row.try_get::<String, _>("type")?.parse()?,
        biz_ref_type: row.try_get("biz_ref_type")?,
        biz_ref_id: row.try_get("biz_ref_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        operator_id: row.try_get("operator_id")?,
        reason_code: row.try_get("reason_code")?,
        note: row.try_get("note")?,
        created_at: row.try_get("created_at")?,
    })
}

fn order_from_row(row: &SqliteRow) -> Result<Order, StoreError> {
    Ok(Order {
        id: row.try_get("id")?,
        order_no: row.try_get("order_no")?,
        customer_id: row.try_get("customer_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        pay_method: row.try_get::<String, _>("pay_method")?.parse()?,
        total_amount: amount(row, "total_amount")?,
        discount_amount: amount(row, "discount_amount")?,
        final_amount: amount(row, "final_amount")?,
        remark: row.try_get("remark")?,
        channel: row.try_get("channel")?,
        assigned_to: row.try_get("assigned_to")?,
        source_ref: row.try_get("source_ref")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<OrderItem, StoreError> {
    Ok(OrderItem {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        product_id: row.try_get("product_id")?,
        product_name_snapshot: row.try_get("product_name_snapshot")?,
        unit_price_snapshot: amount(row, "unit_price_snapshot")?,
        duration_min_snapshot: row.try_get("duration_min_snapshot")?,
        quantity: row.try_get("quantity")?,
        final_price: amount(row, "final_price")?,
    })
}

fn product_from_row(row: &SqliteRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        price: amount(row, "price")?,
        duration_min: row.try_get("duration_min")?,
        sellable: row.try_get("sellable")?,
    })
}

fn outbox_from_row(row: &SqliteRow) -> Result<OutboxEvent, StoreError> {
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get::<Option<i64>, _>("created_at")?.unwrap_or_default(),
        processed_at: row.try_get("processed_at")?,
    })
}

fn collect<T>(
    rows: Vec<SqliteRow>,
    map: fn(&SqliteRow) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    rows.iter().map(map).collect()
}

fn count(n: i64) -> usize {
    usize::try_from(n).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Customers and products
// ---------------------------------------------------------------------------

pub async fn insert_customer(conn: &mut SqliteConnection, id: CustomerId) -> Result<(), StoreError> {
    sqlx::query("INSERT OR IGNORE INTO customers (id) VALUES (?)")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn customer_exists(
    conn: &mut SqliteConnection,
    id: CustomerId,
) -> Result<bool, StoreError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM customers WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

pub async fn upsert_product(conn: &mut SqliteConnection, product: &Product) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO products (id, name, price, duration_min, sellable) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT (id) DO UPDATE SET name = excluded.name, price = excluded.price, \
         duration_min = excluded.duration_min, sellable = excluded.sellable",
    )
    .bind(product.id)
    .bind(&product.name)
    .bind(product.price.minor())
    .bind(product.duration_min)
    .bind(product.sellable)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// One batched read; unknown ids are absent from the result.
pub async fn products(
    conn: &mut SqliteConnection,
    ids: &[ProductId],
) -> Result<Vec<Product>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("SELECT id, name, price, duration_min, sellable FROM products WHERE id IN (");
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(") ORDER BY id");
    let rows = qb.build().fetch_all(&mut *conn).await?;
    collect(rows, product_from_row)
}

// ---------------------------------------------------------------------------
// Wallets
// ---------------------------------------------------------------------------

pub async fn wallet(
    conn: &mut SqliteConnection,
    customer: CustomerId,
) -> Result<Option<Wallet>, StoreError> {
    let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE customer_id = ?");
    sqlx::query(&sql)
        .bind(customer)
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(wallet_from_row)
        .transpose()
}

pub async fn wallets(conn: &mut SqliteConnection) -> Result<Vec<Wallet>, StoreError> {
    let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets ORDER BY id");
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    collect(rows, wallet_from_row)
}

pub async fn insert_wallet(
    conn: &mut SqliteConnection,
    customer: CustomerId,
    now: i64,
) -> Result<Wallet, StoreError> {
    let status = WalletStatus::Active;
    let id = sqlx::query(
        "INSERT INTO wallets (customer_id, balance, status, updated_at) VALUES (?1, 0, ?2, ?3)",
    )
    .bind(customer)
    .bind(status.code())
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(Wallet {
        id,
        customer_id: customer,
        balance: Amount::ZERO,
        status,
        updated_at: now,
    })
}

pub async fn update_wallet(conn: &mut SqliteConnection, wallet: &Wallet) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE wallets SET balance = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
    )
    .bind(wallet.balance.minor())
    .bind(wallet.status.code())
    .bind(wallet.updated_at)
    .bind(wallet.id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::RowNotFound(format!("wallet {}", wallet.id)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub async fn ledger_by_key(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<Option<WalletTransaction>, StoreError> {
    let sql = format!("SELECT {LEDGER_COLUMNS} FROM wallet_transactions WHERE idempotency_key = ?");
    sqlx::query(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(ledger_from_row)
        .transpose()
}

/// Ledger rows of a wallet in insertion order.
pub async fn ledger(
    conn: &mut SqliteConnection,
    wallet: WalletId,
) -> Result<Vec<WalletTransaction>, StoreError> {
    let sql =
        format!("SELECT {LEDGER_COLUMNS} FROM wallet_transactions WHERE wallet_id = ? ORDER BY id");
    let rows = sqlx::query(&sql).bind(wallet).fetch_all(&mut *conn).await?;
    collect(rows, ledger_from_row)
}

/// One page of a wallet's ledger, newest first, plus the row count.
pub async fn ledger_page(
    conn: &mut SqliteConnection,
    wallet: WalletId,
    page: PageRequest,
) -> Result<(Vec<WalletTransaction>, usize), StoreError> {
    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions WHERE wallet_id = ?")
            .bind(wallet)
            .fetch_one(&mut *conn)
            .await?;
    let sql = format!(
        "SELECT {LEDGER_COLUMNS} FROM wallet_transactions WHERE wallet_id = ? \
         ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
    );
    let rows = sqlx::query(&sql)
        .bind(wallet)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&mut *conn)
        .await?;
    Ok((collect(rows, ledger_from_row)?, count(total)))
}

/// `Σcredit − Σdebit` over a wallet's ledger.
pub async fn ledger_sum(conn: &mut SqliteConnection, wallet: WalletId) -> Result<Amount, StoreError> {
    let sum: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(CASE direction WHEN 'credit' THEN amount ELSE -amount END), 0) \
         FROM wallet_transactions WHERE wallet_id = ?",
    )
    .bind(wallet)
    .fetch_one(&mut *conn)
    .await?;
    Ok(Amount::from_minor(sum))
}

pub async fn ledger_len(conn: &mut SqliteConnection) -> Result<usize, StoreError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count(n))
}

/// Append a ledger row; the unique index on `idempotency_key` rejects repeats.
pub async fn insert_ledger(
    conn: &mut SqliteConnection,
    mut row: WalletTransaction,
) -> Result<WalletTransaction, StoreError> {
    row.id = sqlx::query(
        "INSERT INTO wallet_transactions (wallet_id, direction, amount, type, biz_ref_type, \
         biz_ref_id, idempotency_key, operator_id, reason_code, note, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )
    .bind(row.wallet_id)
    .bind(row.direction.as_str())
    .bind(row.amount.minor())
    .bind(row.tx_type.as_str())
    .bind(&row.biz_ref_type)
    .bind(row.biz_ref_id)
    .bind(&row.idempotency_key)
    .bind(row.operator_id)
    .bind(&row.reason_code)
    .bind(&row.note)
    .bind(row.created_at)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(row)
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

pub async fn order(conn: &mut SqliteConnection, id: OrderId) -> Result<Option<Order>, StoreError> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?");
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(order_from_row)
        .transpose()
}

pub async fn order_by_idem(
    conn: &mut SqliteConnection,
    customer: CustomerId,
    key: &str,
) -> Result<Option<Order>, StoreError> {
    let sql =
        format!("SELECT {ORDER_COLUMNS} FROM orders WHERE customer_id = ? AND idempotency_key = ?");
    sqlx::query(&sql)
        .bind(customer)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(order_from_row)
        .transpose()
}

/// Unique on `order_no` and on `(customer_id, idempotency_key)`.
pub async fn insert_order(conn: &mut SqliteConnection, mut order: Order) -> Result<Order, StoreError> {
    order.id = sqlx::query(
        "INSERT INTO orders (order_no, customer_id, status, pay_method, total_amount, \
         discount_amount, final_amount, remark, channel, assigned_to, source_ref, \
         idempotency_key, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )
    .bind(&order.order_no)
    .bind(order.customer_id)
    .bind(order.status.as_str())
    .bind(order.pay_method.as_str())
    .bind(order.total_amount.minor())
    .bind(order.discount_amount.minor())
    .bind(order.final_amount.minor())
    .bind(&order.remark)
    .bind(&order.channel)
    .bind(order.assigned_to)
    .bind(&order.source_ref)
    .bind(&order.idempotency_key)
    .bind(order.created_at)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(order)
}

pub async fn update_order_status(
    conn: &mut SqliteConnection,
    id: OrderId,
    status: OrderStatus,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE orders SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::RowNotFound(format!("order {id}")));
    }
    Ok(())
}

pub async fn insert_item(conn: &mut SqliteConnection, mut item: OrderItem) -> Result<OrderItem, StoreError> {
    item.id = sqlx::query(
        "INSERT INTO order_items (order_id, product_id, product_name_snapshot, \
         unit_price_snapshot, duration_min_snapshot, quantity, final_price) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(item.order_id)
    .bind(item.product_id)
    .bind(&item.product_name_snapshot)
    .bind(item.unit_price_snapshot.minor())
    .bind(item.duration_min_snapshot)
    .bind(item.quantity)
    .bind(item.final_price.minor())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(item)
}

pub async fn order_items(
    conn: &mut SqliteConnection,
    order: OrderId,
) -> Result<Vec<OrderItem>, StoreError> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = ? ORDER BY id");
    let rows = sqlx::query(&sql).bind(order).fetch_all(&mut *conn).await?;
    collect(rows, item_from_row)
}

fn push_order_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &OrderFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(customer) = filter.customer_id {
        qb.push(" AND customer_id = ").push_bind(customer);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(method) = filter.pay_method {
        qb.push(" AND pay_method = ").push_bind(method.as_str());
    }
}

/// One page of matching orders, newest first, plus the match count.
pub async fn orders_page(
    conn: &mut SqliteConnection,
    filter: &OrderFilter,
    page: PageRequest,
) -> Result<(Vec<Order>, usize), StoreError> {
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM orders");
    push_order_filter(&mut qb, filter);
    let total: i64 = qb.build_query_scalar::<i64>().fetch_one(&mut *conn).await?;

    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(format!("SELECT {ORDER_COLUMNS} FROM orders"));
    push_order_filter(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(page.limit())
        .push(" OFFSET ")
        .push_bind(page.offset());
    let rows = qb.build().fetch_all(&mut *conn).await?;
    Ok((collect(rows, order_from_row)?, count(total)))
}

pub async fn order_count(conn: &mut SqliteConnection) -> Result<usize, StoreError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count(n))
}

pub async fn item_count(conn: &mut SqliteConnection) -> Result<usize, StoreError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM order_items")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count(n))
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Insert with `created_at` unset; commit stamps it.
pub async fn insert_outbox(
    conn: &mut SqliteConnection,
    event_type: &str,
    payload: &[u8],
) -> Result<OutboxId, StoreError> {
    let id = sqlx::query("INSERT INTO outbox (event_type, payload) VALUES (?, ?)")
        .bind(event_type)
        .bind(payload)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Event types of rows this transaction has written and not yet committed.
pub async fn unstamped_outbox(conn: &mut SqliteConnection) -> Result<Vec<String>, StoreError> {
    let types: Vec<String> =
        sqlx::query_scalar("SELECT event_type FROM outbox WHERE created_at IS NULL ORDER BY id")
            .fetch_all(&mut *conn)
            .await?;
    Ok(types)
}

pub async fn stamp_outbox(conn: &mut SqliteConnection, commit_ts: i64) -> Result<u64, StoreError> {
    let result = sqlx::query("UPDATE outbox SET created_at = ? WHERE created_at IS NULL")
        .bind(commit_ts)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn outbox(conn: &mut SqliteConnection) -> Result<Vec<OutboxEvent>, StoreError> {
    let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY id");
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    collect(rows, outbox_from_row)
}

pub async fn outbox_pending(
    conn: &mut SqliteConnection,
    limit: usize,
) -> Result<Vec<OutboxEvent>, StoreError> {
    let sql = format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE processed_at IS NULL ORDER BY id LIMIT ?"
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = sqlx::query(&sql).bind(limit).fetch_all(&mut *conn).await?;
    collect(rows, outbox_from_row)
}

/// Stamp `processed_at`; rows already processed keep their stamp.
pub async fn mark_outbox_processed(
    conn: &mut SqliteConnection,
    ids: &[OutboxId],
    at: i64,
) -> Result<usize, StoreError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE outbox SET processed_at = ");
    qb.push_bind(at).push(" WHERE processed_at IS NULL AND id IN (");
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");
    let result = qb.build().execute(&mut *conn).await?;
    Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
}
