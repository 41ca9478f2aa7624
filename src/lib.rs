pub mod amount;
pub mod app;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod csv;
pub mod error;
pub mod idem;
pub mod ids;
pub mod model;
pub mod outbox;
pub mod runner;
pub mod sales;
pub mod store;
pub mod wallet;

pub use amount::Amount;
pub use app::App;
pub use error::{ErrorCode, ErrorKind};
pub use runner::{Ctx, TxRunner};
pub use sales::{OrderError, SalesService};
pub use wallet::{WalletError, WalletService};
