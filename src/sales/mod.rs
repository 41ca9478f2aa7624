//! Order placement and lifecycle.
//!
//! Placing an order snapshots the catalog outside the transaction, then inside
//! one transaction inserts the order with its items, pays it from the wallet
//! when asked to, and appends the outbox events. Every later status change
//! happens under the order's row lock.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::Amount;
use crate::catalog::Catalog;
use crate::idem::{self, IdemDeriver};
use crate::ids::{Clock, IdGen};
use crate::model::{
    CustomerId, Order, OrderId, OrderItem, OrderStatus, Page, PageRequest, PayMethod, Product,
    ProductId, WalletTransaction,
};
use crate::outbox::{
    ORDER_CANCELLED, ORDER_PAID, ORDER_PLACED, ORDER_REFUNDED, OrderCancelledEvent, OrderEvent,
    OrderRefundedEvent, OutboxWriter,
};
use crate::runner::{Ctx, TxRunner};
use crate::store::{ORDER_CUSTOMER_IDEMPOTENCY_KEY, ORDER_NO, OrderFilter};
use crate::wallet::{DebitForOrderRequest, RefundCreditRequest, WalletService};

mod error;
pub use error::OrderError;

/// Order-number generations tried before giving up.
pub const MAX_ORDER_NO_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub qty: u32,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub customer_id: CustomerId,
    pub channel: String,
    pub pay_method: PayMethod,
    pub items: Vec<OrderLine>,
    pub discount: Amount,
    /// Caller key; `(customer_id, idem)` identifies the order across retries.
    pub idem: String,
    pub remark: String,
    pub assigned_to: Option<i64>,
    pub source_ref: Option<String>,
}

impl PlaceOrderRequest {
    pub fn new(
        customer_id: CustomerId,
        pay_method: PayMethod,
        items: Vec<OrderLine>,
        idem: impl Into<String>,
    ) -> Self {
        Self {
            customer_id,
            channel: String::new(),
            pay_method,
            items,
            discount: Amount::ZERO,
            idem: idem.into(),
            remark: String::new(),
            assigned_to: None,
            source_ref: None,
        }
    }

    pub fn discount(mut self, discount: Amount) -> Self {
        self.discount = discount;
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    fn validate(&self) -> Result<(), OrderError> {
        if self.items.is_empty() {
            return Err(OrderError::InvalidParam("order has no items".into()));
        }
        if let Some(line) = self.items.iter().find(|l| l.qty == 0) {
            return Err(OrderError::InvalidParam(format!(
                "quantity for product {} must be at least 1",
                line.product_id
            )));
        }
        if self.discount.is_negative() {
            return Err(OrderError::InvalidParam("discount must not be negative".into()));
        }
        idem::validate_caller(&self.idem)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    /// The order already existed for this `(customer_id, idem)`.
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct RefundOrderRequest {
    pub order_id: OrderId,
    pub reason: String,
    /// Makes a retried refund idempotent. Without it every call derives a
    /// fresh wallet key.
    pub idem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundedOrder {
    pub order: Order,
    /// The wallet credit, when the order was wallet-paid.
    pub wallet_entry: Option<WalletTransaction>,
    pub replayed: bool,
}

/// Snapshot of an order's lines and totals, computed before the transaction.
struct Quote {
    items: Vec<OrderItem>,
    total: Amount,
    discount: Amount,
    final_amount: Amount,
}

#[derive(Clone)]
pub struct SalesService {
    runner: TxRunner,
    catalog: Arc<dyn Catalog>,
    wallet: WalletService,
    outbox: OutboxWriter,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    deriver: IdemDeriver,
}

/// Public API
impl SalesService {
    pub fn new(
        runner: TxRunner,
        catalog: Arc<dyn Catalog>,
        wallet: WalletService,
        outbox: OutboxWriter,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        deriver: IdemDeriver,
    ) -> Self {
        Self {
            runner,
            catalog,
            wallet,
            outbox,
            clock,
            ids,
            deriver,
        }
    }

    /// Place an order, paying it from the wallet when `pay_method` is wallet.
    ///
    /// A repeated `(customer_id, idem)` returns the existing order and writes
    /// nothing.
    pub async fn place_order(
        &self,
        ctx: &mut Ctx,
        req: &PlaceOrderRequest,
    ) -> Result<PlacedOrder, OrderError> {
        let result = self.place_order_inner(ctx, req).await;
        match &result {
            Ok(placed) if placed.replayed => {
                info!(customer = %req.customer_id, key = %req.idem, order = %placed.order.id, "place_order replayed");
            }
            Ok(placed) => {
                info!(
                    customer = %req.customer_id,
                    key = %req.idem,
                    order = %placed.order.id,
                    status = %placed.order.status,
                    amount = %placed.order.final_amount,
                    "place_order applied"
                );
            }
            Err(e) => {
                info!(customer = %req.customer_id, key = %req.idem, reason = %e, "place_order skipped");
            }
        }
        result
    }

    /// Refund a paid or completed order, crediting the wallet for wallet-paid
    /// orders.
    pub async fn refund_order(
        &self,
        ctx: &mut Ctx,
        req: &RefundOrderRequest,
    ) -> Result<RefundedOrder, OrderError> {
        let result = self.refund(ctx, req).await;
        Self::log_result("refund_order", req.order_id, &result);
        result
    }

    /// `pending → cancelled`.
    pub async fn cancel_order(
        &self,
        ctx: &mut Ctx,
        order_id: OrderId,
        reason: &str,
    ) -> Result<Order, OrderError> {
        let result = self
            .transition(ctx, order_id, OrderStatus::Cancelled, reason)
            .await;
        Self::log_result("cancel_order", order_id, &result);
        result
    }

    /// `paid → completed`.
    pub async fn complete_order(
        &self,
        ctx: &mut Ctx,
        order_id: OrderId,
    ) -> Result<Order, OrderError> {
        let result = self
            .transition(ctx, order_id, OrderStatus::Completed, "")
            .await;
        Self::log_result("complete_order", order_id, &result);
        result
    }

    /// `pending → paid` for orders settled outside the wallet.
    pub async fn confirm_payment(
        &self,
        ctx: &mut Ctx,
        order_id: OrderId,
    ) -> Result<Order, OrderError> {
        let result = self.transition(ctx, order_id, OrderStatus::Paid, "").await;
        Self::log_result("confirm_payment", order_id, &result);
        result
    }

    /// The order and its items, read from one consistent view.
    pub async fn get_order(
        &self,
        ctx: &mut Ctx,
        order_id: OrderId,
    ) -> Result<(Order, Vec<OrderItem>), OrderError> {
        let found = match ctx.live_tx() {
            Some(tx) => match tx.order(order_id).await? {
                Some(order) => Some((order, tx.order_items(order_id).await?)),
                None => None,
            },
            None => self.runner.store().order_with_items(order_id).await?,
        };
        found.ok_or(OrderError::OrderNotFound(order_id))
    }

    /// Orders matching `filter`, newest first.
    pub async fn list_orders(
        &self,
        ctx: &mut Ctx,
        filter: &OrderFilter,
        page: PageRequest,
    ) -> Result<Page<Order>, OrderError> {
        if !page.is_valid() {
            return Err(OrderError::InvalidParam(format!(
                "page must be >= 1 and page_size within 1..={}",
                PageRequest::MAX_PAGE_SIZE
            )));
        }
        let (orders, total) = match ctx.live_tx() {
            Some(tx) => tx.orders_page(filter, page).await?,
            None => self.runner.store().orders_page(filter, page).await?,
        };
        Ok(Page::new(orders, total, page))
    }
}

/// Private API
impl SalesService {
    fn log_result<T>(op: &str, order_id: OrderId, result: &Result<T, OrderError>) {
        match result {
            Ok(_) => info!(order = %order_id, "{op} applied"),
            Err(e) => info!(order = %order_id, reason = %e, "{op} skipped"),
        }
    }

    async fn place_order_inner(
        &self,
        ctx: &mut Ctx,
        req: &PlaceOrderRequest,
    ) -> Result<PlacedOrder, OrderError> {
        req.validate()?;

        if let Some(existing) = self.find_by_idem(ctx, req.customer_id, &req.idem).await? {
            return Ok(existing);
        }

        // catalog reads stay outside the transaction
        let mut ids: Vec<ProductId> = req.items.iter().map(|l| l.product_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let products = self.catalog.products(ctx, &ids).await?;
        let quote = Self::quote(req, products);

        let scope = self.runner.begin(ctx).await?;
        let result = self.place_in_tx(ctx, req, quote).await;
        self.runner.finish(ctx, scope, result).await
    }

    async fn find_by_idem(
        &self,
        ctx: &mut Ctx,
        customer: CustomerId,
        key: &str,
    ) -> Result<Option<PlacedOrder>, OrderError> {
        let found = match ctx.live_tx() {
            Some(tx) => match tx.order_by_idem(customer, key).await? {
                Some(order) => {
                    let items = tx.order_items(order.id).await?;
                    Some((order, items))
                }
                None => None,
            },
            None => {
                let store = self.runner.store();
                match store.order_by_idem(customer, key).await? {
                    Some(order) => {
                        let items = store.order_items(order.id).await?;
                        Some((order, items))
                    }
                    None => None,
                }
            }
        };
        Ok(found.map(|(order, items)| PlacedOrder {
            order,
            items,
            replayed: true,
        }))
    }

    /// Resolve lines against the catalog and compute totals.
    fn quote(req: &PlaceOrderRequest, products: Vec<Product>) -> Result<Quote, OrderError> {
        let by_id: HashMap<ProductId, Product> =
            products.into_iter().map(|p| (p.id, p)).collect();

        let mut items = Vec::with_capacity(req.items.len());
        let mut total = Amount::ZERO;
        for line in &req.items {
            let product = by_id
                .get(&line.product_id)
                .ok_or(OrderError::ProductNotFound(line.product_id))?;
            if !product.sellable {
                return Err(OrderError::ProductNotSellable(product.id));
            }
            let final_price = product
                .price
                .checked_mul(line.qty)
                .ok_or_else(|| OrderError::InvalidParam("order total overflows".into()))?;
            total = total
                .checked_add(final_price)
                .ok_or_else(|| OrderError::InvalidParam("order total overflows".into()))?;
            items.push(OrderItem {
                id: 0,
                order_id: 0,
                product_id: product.id,
                product_name_snapshot: product.name.clone(),
                unit_price_snapshot: product.price,
                duration_min_snapshot: product.duration_min,
                quantity: line.qty,
                final_price,
            });
        }

        if req.discount > total {
            return Err(OrderError::InvalidParam(format!(
                "discount {} exceeds order total {}",
                req.discount, total
            )));
        }
        Ok(Quote {
            items,
            total,
            discount: req.discount,
            final_amount: total.saturating_sub_floor(req.discount),
        })
    }

    async fn place_in_tx(
        &self,
        ctx: &mut Ctx,
        req: &PlaceOrderRequest,
        quote: Result<Quote, OrderError>,
    ) -> Result<PlacedOrder, OrderError> {
        let now = self.clock.now();
        let tx = ctx.tx()?;
        if !tx.customer_exists(req.customer_id).await? {
            return Err(OrderError::CustomerNotFound(req.customer_id));
        }
        let quote = quote?;

        let mut attempt = 1;
        let mut order = loop {
            let draft = Order {
                id: 0,
                order_no: self.ids.order_no(now),
                customer_id: req.customer_id,
                status: OrderStatus::Pending,
                pay_method: req.pay_method,
                total_amount: quote.total,
                discount_amount: quote.discount,
                final_amount: quote.final_amount,
                remark: req.remark.clone(),
                channel: req.channel.clone(),
                assigned_to: req.assigned_to,
                source_ref: req.source_ref.clone(),
                idempotency_key: req.idem.clone(),
                created_at: now.timestamp(),
            };
            match tx.insert_order(draft).await {
                Ok(order) => break order,
                Err(e) if e.is_unique_violation(ORDER_CUSTOMER_IDEMPOTENCY_KEY) => {
                    // a concurrent call with the same key committed first
                    warn!(customer = %req.customer_id, key = %req.idem, "idempotency race resolved as replay");
                    let order = tx.order_by_idem(req.customer_id, &req.idem).await?.ok_or(e)?;
                    let items = tx.order_items(order.id).await?;
                    return Ok(PlacedOrder {
                        order,
                        items,
                        replayed: true,
                    });
                }
                Err(e) if e.is_unique_violation(ORDER_NO) => {
                    warn!(customer = %req.customer_id, attempt, "order number collision");
                    if attempt >= MAX_ORDER_NO_ATTEMPTS {
                        return Err(OrderError::OrderNoExhausted);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let items = tx
            .insert_items(
                quote
                    .items
                    .into_iter()
                    .map(|item| OrderItem {
                        order_id: order.id,
                        ..item
                    })
                    .collect(),
            )
            .await?;

        if order.pay_method == PayMethod::Wallet && order.final_amount.is_positive() {
            let debit = DebitForOrderRequest {
                customer_id: order.customer_id,
                order_id: order.id,
                amount: order.final_amount,
                idem: self.deriver.derive(idem::ORDER_PAY, order.id, &req.idem),
            };
            self.wallet.debit_for_order(ctx, &debit).await?;
            order = ctx
                .tx()?
                .update_order_status(order.id, OrderStatus::Paid)
                .await?;
        }

        self.append_order_event(ctx, ORDER_PLACED, &order).await?;
        if order.status == OrderStatus::Paid {
            self.append_order_event(ctx, ORDER_PAID, &order).await?;
        }

        Ok(PlacedOrder {
            order,
            items,
            replayed: false,
        })
    }

    async fn refund(
        &self,
        ctx: &mut Ctx,
        req: &RefundOrderRequest,
    ) -> Result<RefundedOrder, OrderError> {
        if let Some(key) = &req.idem {
            idem::validate_caller(key)?;
        }
        let scope = self.runner.begin(ctx).await?;
        let result = self.refund_in_tx(ctx, req).await;
        self.runner.finish(ctx, scope, result).await
    }

    async fn refund_in_tx(
        &self,
        ctx: &mut Ctx,
        req: &RefundOrderRequest,
    ) -> Result<RefundedOrder, OrderError> {
        let tx = ctx.tx()?;
        let peek = tx
            .order(req.order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(req.order_id))?;
        let to_wallet = peek.pay_method == PayMethod::Wallet && peek.final_amount.is_positive();
        if to_wallet {
            // wallet row before order row
            tx.wallet_for_update(peek.customer_id).await?;
        }

        let order = tx
            .order_for_update(req.order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(req.order_id))?;

        if order.status == OrderStatus::Refunded {
            if let Some(key) = &req.idem {
                let wallet_key = self.deriver.derive(idem::ORDER_REFUND, order.id, key);
                if let Some(entry) = tx.ledger_by_key(&wallet_key).await? {
                    return Ok(RefundedOrder {
                        order,
                        wallet_entry: Some(entry),
                        replayed: true,
                    });
                }
            }
            return Err(OrderError::OrderStatusInvalid {
                order_id: order.id,
                from: order.status,
                to: OrderStatus::Refunded,
            });
        }
        if !order.status.can_transition_to(OrderStatus::Refunded) {
            return Err(OrderError::OrderCannotRefund {
                order_id: order.id,
                status: order.status,
            });
        }

        let order = tx
            .update_order_status(order.id, OrderStatus::Refunded)
            .await?;

        let wallet_entry = if to_wallet {
            let key = match &req.idem {
                Some(key) => self.deriver.derive(idem::ORDER_REFUND, order.id, key),
                None => {
                    let nanos = self.clock.now_nanos().to_string();
                    self.deriver.derive(idem::ORDER_REFUND, order.id, &nanos)
                }
            };
            let credit = RefundCreditRequest {
                customer_id: order.customer_id,
                order_id: order.id,
                amount: order.final_amount,
                idem: key,
                reason: req.reason.clone(),
            };
            Some(self.wallet.credit_for_refund(ctx, &credit).await?.entry)
        } else {
            None
        };

        let event = OrderRefundedEvent {
            order_id: order.id,
            customer_id: order.customer_id,
            amount: order.final_amount,
            reason: req.reason.clone(),
            timestamp: self.clock.now_secs(),
        };
        self.outbox.append_json(ctx, ORDER_REFUNDED, &event).await?;

        Ok(RefundedOrder {
            order,
            wallet_entry,
            replayed: false,
        })
    }

    async fn transition(
        &self,
        ctx: &mut Ctx,
        order_id: OrderId,
        to: OrderStatus,
        reason: &str,
    ) -> Result<Order, OrderError> {
        let scope = self.runner.begin(ctx).await?;
        let result = self.transition_in_tx(ctx, order_id, to, reason).await;
        self.runner.finish(ctx, scope, result).await
    }

    /// Move a locked order along the status graph and record the event the
    /// target status publishes.
    async fn transition_in_tx(
        &self,
        ctx: &mut Ctx,
        order_id: OrderId,
        to: OrderStatus,
        reason: &str,
    ) -> Result<Order, OrderError> {
        let tx = ctx.tx()?;
        let order = tx
            .order_for_update(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))?;
        if !order.status.can_transition_to(to) {
            return Err(OrderError::OrderStatusInvalid {
                order_id,
                from: order.status,
                to,
            });
        }
        let order = tx.update_order_status(order_id, to).await?;

        match to {
            OrderStatus::Paid => self.append_order_event(ctx, ORDER_PAID, &order).await?,
            OrderStatus::Cancelled => {
                let event = OrderCancelledEvent {
                    order_id,
                    customer_id: order.customer_id,
                    reason: reason.to_string(),
                    timestamp: self.clock.now_secs(),
                };
                self.outbox.append_json(ctx, ORDER_CANCELLED, &event).await?;
            }
            _ => {}
        }
        Ok(order)
    }

    async fn append_order_event(
        &self,
        ctx: &mut Ctx,
        event_type: &str,
        order: &Order,
    ) -> Result<(), OrderError> {
        let event = OrderEvent {
            order_id: order.id,
            order_no: order.order_no.clone(),
            customer_id: order.customer_id,
            final_amount: order.final_amount,
            pay_method: order.pay_method,
            timestamp: self.clock.now_secs(),
        };
        self.outbox.append_json(ctx, event_type, &event).await?;
        Ok(())
    }
}
