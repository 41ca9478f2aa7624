//! Core domain types: wallets, the ledger, orders, products and outbox rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Amount;

/// Customer identifier.
pub type CustomerId = i64;

/// Product identifier.
pub type ProductId = i64;

/// Order identifier.
pub type OrderId = i64;

/// Wallet identifier.
pub type WalletId = i64;

/// Ledger row identifier.
pub type LedgerId = i64;

/// Order item identifier.
pub type OrderItemId = i64;

/// Outbox row identifier.
pub type OutboxId = i64;

/// Error returned when a stored enum value does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Wallet status as persisted (`1` active, `0` frozen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Frozen,
    #[default]
    Active,
}

impl WalletStatus {
    pub const fn code(self) -> i8 {
        match self {
            WalletStatus::Frozen => 0,
            WalletStatus::Active => 1,
        }
    }

    pub const fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(WalletStatus::Frozen),
            1 => Some(WalletStatus::Active),
            _ => None,
        }
    }
}

/// One row per customer; `balance` caches the ledger sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wallet {
    pub id: WalletId,
    pub customer_id: CustomerId,
    pub balance: Amount,
    pub status: WalletStatus,
    pub updated_at: i64,
}

impl Wallet {
    pub fn is_frozen(&self) -> bool {
        self.status == WalletStatus::Frozen
    }
}

/// Direction of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

string_enum!(Direction, "direction", {
    Credit => "credit",
    Debit => "debit",
});

/// Business type of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerType {
    Recharge,
    OrderPay,
    OrderRefund,
    AdjustIn,
    AdjustOut,
    Correction,
}

string_enum!(LedgerType, "ledger type", {
    Recharge => "recharge",
    OrderPay => "order_pay",
    OrderRefund => "order_refund",
    AdjustIn => "adjust_in",
    AdjustOut => "adjust_out",
    Correction => "correction",
});

/// Append-only ledger row. The ledger is the source of truth for balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletTransaction {
    pub id: LedgerId,
    pub wallet_id: WalletId,
    pub direction: Direction,
    /// Always positive.
    pub amount: Amount,
    #[serde(rename = "type")]
    pub tx_type: LedgerType,
    pub biz_ref_type: String,
    pub biz_ref_id: i64,
    pub idempotency_key: String,
    pub operator_id: i64,
    pub reason_code: String,
    pub note: String,
    pub created_at: i64,
}

impl WalletTransaction {
    /// Contribution of this row to the wallet balance.
    pub fn signed_amount(&self) -> Amount {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => Amount::ZERO - self.amount,
        }
    }
}

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Completed,
    Refunded,
    Cancelled,
}

string_enum!(OrderStatus, "order status", {
    Pending => "pending",
    Paid => "paid",
    Completed => "completed",
    Refunded => "refunded",
    Cancelled => "cancelled",
});

impl OrderStatus {
    /// Permitted edges: `pending → paid | cancelled`, `paid → completed | refunded`,
    /// `completed → refunded`.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Cancelled)
                | (Paid, Completed)
                | (Paid, Refunded)
                | (Completed, Refunded)
        )
    }
}

/// How an order is paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayMethod {
    Wallet,
    Cash,
    Online,
}

string_enum!(PayMethod, "pay method", {
    Wallet => "wallet",
    Cash => "cash",
    Online => "online",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: OrderId,
    /// `ORD` + `YYYYMMDDhhmmss` + 6 digits.
    pub order_no: String,
    pub customer_id: CustomerId,
    pub status: OrderStatus,
    pub pay_method: PayMethod,
    pub total_amount: Amount,
    pub discount_amount: Amount,
    pub final_amount: Amount,
    pub remark: String,
    pub channel: String,
    pub assigned_to: Option<i64>,
    pub source_ref: Option<String>,
    /// Caller key; `(customer_id, idempotency_key)` is unique.
    pub idempotency_key: String,
    pub created_at: i64,
}

/// Order line with the product attributes captured at placement time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub product_name_snapshot: String,
    pub unit_price_snapshot: Amount,
    pub duration_min_snapshot: i32,
    pub quantity: u32,
    pub final_price: Amount,
}

/// Catalog product as seen by the core (read-only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Amount,
    #[serde(default)]
    pub duration_min: i32,
    pub sellable: bool,
}

/// Append-only event row, dispatched later by an external component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    pub id: OutboxId,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

/// 1-based page request; `page_size` must be within `1..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    pub fn is_valid(&self) -> bool {
        self.page >= 1 && (1..=Self::MAX_PAGE_SIZE).contains(&self.page_size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }
}

/// A page of results plus the total number of matching rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Wrap one page of rows already limited and offset by the query.
    pub fn new(items: Vec<T>, total: usize, req: PageRequest) -> Self {
        Self {
            items,
            total,
            page: req.page,
            page_size: req.page_size,
        }
    }
}
