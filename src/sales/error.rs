//! Error types for order operations.

use thiserror::Error;

use crate::error::{ErrorCode, ErrorKind};
use crate::idem::IdemKeyError;
use crate::model::{CustomerId, OrderId, OrderStatus, ProductId};
use crate::store::StoreError;
use crate::wallet::WalletError;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("customer {0} not found")]
    CustomerNotFound(CustomerId),

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("product {0} is not sellable")]
    ProductNotSellable(ProductId),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("order {order_id} cannot move from {from} to {to}")]
    OrderStatusInvalid {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("order {order_id} cannot be refunded in status {status}")]
    OrderCannotRefund {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error("could not allocate a unique order number")]
    OrderNoExhausted,

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<IdemKeyError> for OrderError {
    fn from(e: IdemKeyError) -> Self {
        OrderError::InvalidParam(e.to_string())
    }
}

impl ErrorCode for OrderError {
    fn kind(&self) -> ErrorKind {
        match self {
            OrderError::InvalidParam(_) => ErrorKind::InvalidParam,
            OrderError::CustomerNotFound(_)
            | OrderError::ProductNotFound(_)
            | OrderError::OrderNotFound(_) => ErrorKind::ResourceNotFound,
            OrderError::ProductNotSellable(_)
            | OrderError::OrderStatusInvalid { .. }
            | OrderError::OrderCannotRefund { .. } => ErrorKind::ConflictOrState,
            OrderError::OrderNoExhausted => ErrorKind::Internal,
            OrderError::Wallet(e) => e.kind(),
            OrderError::Store(e) => e.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            OrderError::InvalidParam(_) => "invalid_param",
            OrderError::CustomerNotFound(_) => "customer_not_found",
            OrderError::ProductNotFound(_) => "product_not_found",
            OrderError::ProductNotSellable(_) => "product_not_sellable",
            OrderError::OrderNotFound(_) => "order_not_found",
            OrderError::OrderStatusInvalid { .. } => "order_status_invalid",
            OrderError::OrderCannotRefund { .. } => "order_cannot_refund",
            OrderError::OrderNoExhausted => "internal",
            OrderError::Wallet(e) => e.code(),
            OrderError::Store(e) => e.code(),
        }
    }
}
