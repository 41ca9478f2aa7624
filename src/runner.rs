//! Transaction scoping and the per-call context.
//!
//! Services bracket their transactional work with [`TxRunner::begin`] and
//! [`TxRunner::finish`]:
//!
//! ```ignore
//! let scope = self.runner.begin(ctx).await?;
//! let result = self.do_work(ctx).await;
//! self.runner.finish(ctx, scope, result).await
//! ```
//!
//! The outermost scope begins and commits (or rolls back) the transaction.
//! A scope opened while a transaction is already live joins it, so an error in
//! the inner block rolls back the whole outer transaction.
//!
//! The root scope holds a guard. If the future running the scope is dropped
//! before `finish`, the guard goes with it and the transaction left in the
//! context counts as abandoned: it is invisible to later calls and rolled back
//! by the next one that touches the context.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::{Store, StoreError, Tx};

struct LiveTx {
    tx: Tx,
    owner: Weak<()>,
}

impl LiveTx {
    fn abandoned(&self) -> bool {
        self.owner.strong_count() == 0
    }
}

/// Per-call context: deadline, acting operator and the live transaction.
#[derive(Default)]
pub struct Ctx {
    deadline: Option<Instant>,
    operator_id: i64,
    tx: Option<LiveTx>,
}

impl Ctx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::default().deadline(Instant::now() + timeout)
    }

    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }

    pub fn operator(mut self, operator_id: i64) -> Self {
        self.operator_id = operator_id;
        self
    }

    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn operator_id(&self) -> i64 {
        self.operator_id
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.as_ref().is_some_and(|live| !live.abandoned())
    }

    /// The live transaction; fails outside a transactional scope.
    pub fn tx(&mut self) -> Result<&mut Tx, StoreError> {
        self.live_tx().ok_or(StoreError::NoTransaction)
    }

    /// The live transaction, if any, for read paths that work either way.
    pub fn live_tx(&mut self) -> Option<&mut Tx> {
        self.discard_abandoned();
        self.tx.as_mut().map(|live| &mut live.tx)
    }

    /// Roll back a transaction whose root scope was dropped without finishing.
    fn discard_abandoned(&mut self) {
        if let Some(live) = self.tx.take_if(|live| live.abandoned()) {
            warn!(tx = live.tx.id(), "discarding transaction abandoned by a cancelled call");
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Keeps the root scope's transaction alive in the context.
#[derive(Debug)]
pub struct RootGuard(Arc<()>);

/// How a scope relates to the transaction it runs in.
#[derive(Debug)]
#[must_use = "a scope must be closed with TxRunner::finish"]
pub enum TxScope {
    /// This scope began the transaction and ends it.
    Root(RootGuard),
    /// Joined a live transaction; the owner commits.
    Joined,
    /// Nested savepoint inside a live transaction.
    Savepoint(String),
}

#[derive(Clone)]
pub struct TxRunner {
    store: Store,
}

impl TxRunner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Open a scope, beginning a transaction only if none is live.
    pub async fn begin(&self, ctx: &mut Ctx) -> Result<TxScope, StoreError> {
        ctx.discard_abandoned();
        if ctx.tx.is_some() {
            return Ok(TxScope::Joined);
        }
        if ctx.expired() {
            return Err(StoreError::DeadlineExceeded);
        }
        let tx = self.store.begin(ctx.deadline).await?;
        let guard = RootGuard(Arc::new(()));
        ctx.tx = Some(LiveTx {
            tx,
            owner: Arc::downgrade(&guard.0),
        });
        Ok(TxScope::Root(guard))
    }

    /// Open a savepoint scope. Rolling it back keeps the outer transaction
    /// alive. Without a live transaction this is a plain root scope.
    pub async fn begin_savepoint(&self, ctx: &mut Ctx) -> Result<TxScope, StoreError> {
        if let Some(tx) = ctx.live_tx() {
            let name = tx.savepoint().await?;
            return Ok(TxScope::Savepoint(name));
        }
        self.begin(ctx).await
    }

    /// Close a scope with the outcome of its block.
    ///
    /// - `Root`: commit on `Ok`, roll back on `Err`.
    /// - `Joined`: pass the outcome through; the owner decides.
    /// - `Savepoint`: release on `Ok`, roll back to the savepoint on `Err`.
    pub async fn finish<T, E>(
        &self,
        ctx: &mut Ctx,
        scope: TxScope,
        result: Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        match scope {
            TxScope::Joined => result,
            TxScope::Root(_guard) => {
                let tx = ctx
                    .tx
                    .take()
                    .map(|live| live.tx)
                    .ok_or(StoreError::NoTransaction)?;
                match result {
                    Ok(value) => {
                        tx.commit().await?;
                        Ok(value)
                    }
                    Err(e) => {
                        tx.rollback().await;
                        Err(e)
                    }
                }
            }
            TxScope::Savepoint(name) => {
                let tx = ctx.tx()?;
                match result {
                    Ok(value) => {
                        tx.release_savepoint(&name).await?;
                        Ok(value)
                    }
                    Err(e) => {
                        debug!(savepoint = %name, "savepoint block failed");
                        tx.rollback_to_savepoint(&name).await?;
                        Err(e)
                    }
                }
            }
        }
    }
}
