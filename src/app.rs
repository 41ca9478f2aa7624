//! Wires the store and services together from a loaded [`Config`].

use std::sync::Arc;

use crate::config::Config;
use crate::idem::IdemDeriver;
use crate::ids::{Clock, IdGen, RandomIdGen, SystemClock};
use crate::outbox::{OutboxReader, OutboxWriter};
use crate::runner::TxRunner;
use crate::sales::SalesService;
use crate::store::{Store, StoreError};
use crate::wallet::WalletService;

#[derive(Clone)]
pub struct App {
    pub store: Store,
    pub wallet: WalletService,
    pub sales: SalesService,
    pub outbox: OutboxReader,
}

impl App {
    /// System clock and random order numbers.
    pub async fn new(config: &Config) -> Result<Self, StoreError> {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(RandomIdGen)).await
    }

    /// Connect the store (applying migrations) and build the services on it.
    pub async fn with_parts(
        config: &Config,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
    ) -> Result<Self, StoreError> {
        let store = Store::connect(&config.store, clock.clone()).await?;
        let runner = TxRunner::new(store.clone());
        let deriver = IdemDeriver::new(config.idempotency.hash);
        let wallet = WalletService::new(runner.clone(), OutboxWriter, clock.clone(), deriver);
        let sales = SalesService::new(
            runner,
            Arc::new(store.clone()),
            wallet.clone(),
            OutboxWriter,
            clock.clone(),
            ids,
            deriver,
        );
        Ok(Self {
            outbox: OutboxReader::new(store.clone(), clock),
            store,
            wallet,
            sales,
        })
    }
}
