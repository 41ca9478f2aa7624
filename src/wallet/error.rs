//! Error types for wallet operations.

use thiserror::Error;

use crate::Amount;
use crate::error::{ErrorCode, ErrorKind};
use crate::idem::IdemKeyError;
use crate::model::CustomerId;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("wallet for customer {0} not found")]
    WalletNotFound(CustomerId),

    #[error("wallet for customer {0} is frozen")]
    WalletFrozen(CustomerId),

    #[error("insufficient balance for customer {customer}: requested {requested}")]
    InsufficientBalance {
        customer: CustomerId,
        requested: Amount,
    },

    #[error("idempotency key {0} was already used for a different request")]
    IdempotencyConflict(String),

    #[error("balance overflow for customer {0}")]
    Overflow(CustomerId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<IdemKeyError> for WalletError {
    fn from(e: IdemKeyError) -> Self {
        WalletError::InvalidParam(e.to_string())
    }
}

impl ErrorCode for WalletError {
    fn kind(&self) -> ErrorKind {
        match self {
            WalletError::InvalidParam(_) | WalletError::IdempotencyConflict(_) => {
                ErrorKind::InvalidParam
            }
            WalletError::WalletNotFound(_) => ErrorKind::ResourceNotFound,
            WalletError::WalletFrozen(_) | WalletError::InsufficientBalance { .. } => {
                ErrorKind::BusinessRule
            }
            WalletError::Overflow(_) => ErrorKind::Internal,
            WalletError::Store(e) => e.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            WalletError::InvalidParam(_) => "invalid_param",
            WalletError::WalletNotFound(_) => "wallet_not_found",
            WalletError::WalletFrozen(_) => "wallet_frozen",
            WalletError::InsufficientBalance { .. } => "insufficient_balance",
            WalletError::IdempotencyConflict(_) => "idempotency_conflict",
            WalletError::Overflow(_) => "internal",
            WalletError::Store(e) => e.code(),
        }
    }
}
