//! Batch driver: applies a stream of commands against an [`App`].
//!
//! A failing command never stops the batch; the services log every outcome.

use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::Amount;
use crate::app::App;
use crate::model::{CustomerId, OrderId, PayMethod, ProductId, WalletStatus};
use crate::runner::Ctx;
use crate::sales::{OrderError, OrderLine, PlaceOrderRequest, RefundOrderRequest};
use crate::store::StoreError;
use crate::wallet::{CreditRequest, WalletError};

/// One row of a batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Recharge {
        customer: CustomerId,
        amount: Amount,
        key: String,
    },
    Order {
        customer: CustomerId,
        product: ProductId,
        qty: u32,
        pay_method: PayMethod,
        discount: Amount,
        key: String,
    },
    Refund {
        order: OrderId,
        key: Option<String>,
    },
    Cancel {
        order: OrderId,
    },
    Complete {
        order: OrderId,
    },
    Freeze {
        customer: CustomerId,
    },
    Unfreeze {
        customer: CustomerId,
    },
}

impl Command {
    /// Customer the command acts for, when it names one.
    pub fn customer(&self) -> Option<CustomerId> {
        match self {
            Command::Recharge { customer, .. }
            | Command::Order { customer, .. }
            | Command::Freeze { customer }
            | Command::Unfreeze { customer } => Some(*customer),
            Command::Refund { .. } | Command::Cancel { .. } | Command::Complete { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts of commands applied and skipped by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub applied: usize,
    pub skipped: usize,
}

pub struct Batch {
    app: App,
}

impl Batch {
    pub fn new(app: App) -> Self {
        Self { app }
    }

    /// Run every command of the stream in order.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) -> Summary {
        let mut summary = Summary::default();
        while let Some(command) = stream.next().await {
            // errors are already logged by the services
            match self.apply(command).await {
                Ok(()) => summary.applied += 1,
                Err(_) => summary.skipped += 1,
            }
        }
        summary
    }

    /// Apply a single command in its own transaction.
    pub async fn apply(&self, command: Command) -> Result<(), BatchError> {
        // the batch file stands in for customer management
        if let Some(customer) = command.customer() {
            self.app.store.insert_customer(customer).await?;
        }
        debug!(?command, "apply");

        let mut ctx = Ctx::new();
        match command {
            Command::Recharge {
                customer,
                amount,
                key,
            } => {
                self.app
                    .wallet
                    .credit(&mut ctx, &CreditRequest::new(customer, amount, key))
                    .await?;
            }
            Command::Order {
                customer,
                product,
                qty,
                pay_method,
                discount,
                key,
            } => {
                let req = PlaceOrderRequest::new(
                    customer,
                    pay_method,
                    vec![OrderLine {
                        product_id: product,
                        qty,
                    }],
                    key,
                )
                .discount(discount)
                .channel("batch");
                self.app.sales.place_order(&mut ctx, &req).await?;
            }
            Command::Refund { order, key } => {
                let req = RefundOrderRequest {
                    order_id: order,
                    reason: "batch".into(),
                    idem: key,
                };
                self.app.sales.refund_order(&mut ctx, &req).await?;
            }
            Command::Cancel { order } => {
                self.app.sales.cancel_order(&mut ctx, order, "batch").await?;
            }
            Command::Complete { order } => {
                self.app.sales.complete_order(&mut ctx, order).await?;
            }
            Command::Freeze { customer } => {
                self.app
                    .wallet
                    .set_status(&mut ctx, customer, WalletStatus::Frozen)
                    .await?;
            }
            Command::Unfreeze { customer } => {
                self.app
                    .wallet
                    .set_status(&mut ctx, customer, WalletStatus::Active)
                    .await?;
            }
        }
        Ok(())
    }
}
