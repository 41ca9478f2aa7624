//! Wallet ledger service.
//!
//! Every balance change is an appended ledger row plus an update of the
//! cached balance on the wallet row, both under the wallet's row lock and in
//! the same transaction. Each mutating call carries an idempotency key; a
//! repeated key is a no-op that returns the original row.

use std::sync::Arc;

use tracing::{info, warn};

use crate::Amount;
use crate::idem::{self, IdemDeriver};
use crate::ids::Clock;
use crate::model::{
    CustomerId, Direction, LedgerType, OrderId, Page, PageRequest, Wallet, WalletId,
    WalletStatus, WalletTransaction,
};
use crate::outbox::{OutboxWriter, WALLET_CREDITED, WALLET_DEBITED, WalletEvent};
use crate::runner::{Ctx, TxRunner};
use crate::store::{LEDGER_IDEMPOTENCY_KEY, Store, Tx};

mod error;
pub use error::WalletError;

pub const BIZ_REF_ORDER: &str = "order";
pub const BIZ_REF_MANUAL: &str = "manual";

/// Longest ledger note accepted, in characters.
pub const MAX_NOTE_LEN: usize = 255;

/// Top up a wallet (`type=recharge`), creating the wallet if needed.
#[derive(Debug, Clone)]
pub struct CreditRequest {
    pub customer_id: CustomerId,
    pub amount: Amount,
    pub reason: String,
    pub idem: String,
    /// Promotional extra, booked as a separate `correction` row.
    pub bonus: Amount,
    pub note: String,
}

impl CreditRequest {
    pub fn new(customer_id: CustomerId, amount: Amount, idem: impl Into<String>) -> Self {
        Self {
            customer_id,
            amount,
            reason: String::new(),
            idem: idem.into(),
            bonus: Amount::ZERO,
            note: String::new(),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn bonus(mut self, bonus: Amount) -> Self {
        self.bonus = bonus;
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct DebitForOrderRequest {
    pub customer_id: CustomerId,
    pub order_id: OrderId,
    pub amount: Amount,
    pub idem: String,
}

#[derive(Debug, Clone)]
pub struct RefundCreditRequest {
    pub customer_id: CustomerId,
    pub order_id: OrderId,
    pub amount: Amount,
    pub idem: String,
    pub reason: String,
}

/// Manual adjustment: `adjust_in` for credits, `adjust_out` for debits.
#[derive(Debug, Clone)]
pub struct AdjustRequest {
    pub customer_id: CustomerId,
    pub direction: Direction,
    pub amount: Amount,
    pub reason: String,
    pub idem: String,
    pub note: String,
}

/// Result of a mutating wallet call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub entry: WalletTransaction,
    pub balance_after: Amount,
    /// The key had already been applied; nothing was written.
    pub replayed: bool,
}

/// Outcome of recomputing a wallet balance from its ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerAudit {
    pub balance: Amount,
    pub ledger_sum: Amount,
}

impl LedgerAudit {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum
    }
}

/// What to do when the customer has no wallet yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingWallet {
    Create,
    Fail,
}

/// Which idempotency namespace a posting's key must come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    /// Supplied by an external caller; the derived-key prefixes are off limits.
    Caller,
    /// Derived by the core from an order id.
    Derived,
}

/// Internal description of one ledger posting.
struct Entry<'a> {
    op: &'static str,
    key_source: KeySource,
    customer_id: CustomerId,
    direction: Direction,
    amount: Amount,
    tx_type: LedgerType,
    biz_ref: (&'static str, i64),
    idem: &'a str,
    reason: &'a str,
    note: &'a str,
    bonus: Amount,
    missing_wallet: MissingWallet,
    event: Option<&'static str>,
}

impl Entry<'_> {
    fn validate(&self) -> Result<(), WalletError> {
        if !self.amount.is_positive() {
            return Err(WalletError::InvalidParam(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.bonus.is_negative() {
            return Err(WalletError::InvalidParam(format!(
                "bonus must not be negative, got {}",
                self.bonus
            )));
        }
        if self.note.chars().count() > MAX_NOTE_LEN {
            return Err(WalletError::InvalidParam(format!(
                "note must be at most {MAX_NOTE_LEN} characters"
            )));
        }
        match self.key_source {
            KeySource::Caller => idem::validate_caller(self.idem)?,
            KeySource::Derived => idem::validate(self.idem)?,
        }
        Ok(())
    }

    /// Whether `existing`, found under this entry's key, records a different
    /// request than this one.
    fn conflicts_with(&self, existing: &WalletTransaction, wallet: Option<WalletId>) -> bool {
        existing.tx_type != self.tx_type
            || existing.direction != self.direction
            || existing.amount != self.amount
            || Some(existing.wallet_id) != wallet
    }
}

#[derive(Clone)]
pub struct WalletService {
    runner: TxRunner,
    outbox: OutboxWriter,
    clock: Arc<dyn Clock>,
    deriver: IdemDeriver,
}

/// Public API
impl WalletService {
    pub fn new(
        runner: TxRunner,
        outbox: OutboxWriter,
        clock: Arc<dyn Clock>,
        deriver: IdemDeriver,
    ) -> Self {
        Self {
            runner,
            outbox,
            clock,
            deriver,
        }
    }

    /// Recharge a wallet. Duplicate keys resolve to a no-op success.
    pub async fn credit(&self, ctx: &mut Ctx, req: &CreditRequest) -> Result<Posting, WalletError> {
        self.post(
            ctx,
            Entry {
                op: "credit",
                key_source: KeySource::Caller,
                customer_id: req.customer_id,
                direction: Direction::Credit,
                amount: req.amount,
                tx_type: LedgerType::Recharge,
                biz_ref: (BIZ_REF_MANUAL, 0),
                idem: &req.idem,
                reason: &req.reason,
                note: &req.note,
                bonus: req.bonus,
                missing_wallet: MissingWallet::Create,
                event: Some(WALLET_CREDITED),
            },
        )
        .await
    }

    /// Pay an order from the wallet. The wallet must exist, be active and
    /// cover the amount; all checks happen under the row lock.
    pub async fn debit_for_order(
        &self,
        ctx: &mut Ctx,
        req: &DebitForOrderRequest,
    ) -> Result<Posting, WalletError> {
        self.post(
            ctx,
            Entry {
                op: "debit_for_order",
                key_source: KeySource::Derived,
                customer_id: req.customer_id,
                direction: Direction::Debit,
                amount: req.amount,
                tx_type: LedgerType::OrderPay,
                biz_ref: (BIZ_REF_ORDER, req.order_id),
                idem: &req.idem,
                reason: "",
                note: "",
                bonus: Amount::ZERO,
                missing_wallet: MissingWallet::Fail,
                event: None,
            },
        )
        .await
    }

    /// Return an order payment to the wallet, creating the wallet if it is gone.
    pub async fn credit_for_refund(
        &self,
        ctx: &mut Ctx,
        req: &RefundCreditRequest,
    ) -> Result<Posting, WalletError> {
        self.post(
            ctx,
            Entry {
                op: "credit_for_refund",
                key_source: KeySource::Derived,
                customer_id: req.customer_id,
                direction: Direction::Credit,
                amount: req.amount,
                tx_type: LedgerType::OrderRefund,
                biz_ref: (BIZ_REF_ORDER, req.order_id),
                idem: &req.idem,
                reason: &req.reason,
                note: "",
                bonus: Amount::ZERO,
                missing_wallet: MissingWallet::Create,
                event: None,
            },
        )
        .await
    }

    /// Manual balance adjustment in either direction.
    pub async fn adjust(&self, ctx: &mut Ctx, req: &AdjustRequest) -> Result<Posting, WalletError> {
        let (tx_type, missing_wallet, event) = match req.direction {
            Direction::Credit => (LedgerType::AdjustIn, MissingWallet::Create, WALLET_CREDITED),
            Direction::Debit => (LedgerType::AdjustOut, MissingWallet::Fail, WALLET_DEBITED),
        };
        self.post(
            ctx,
            Entry {
                op: "adjust",
                key_source: KeySource::Caller,
                customer_id: req.customer_id,
                direction: req.direction,
                amount: req.amount,
                tx_type,
                biz_ref: (BIZ_REF_MANUAL, 0),
                idem: &req.idem,
                reason: &req.reason,
                note: &req.note,
                bonus: Amount::ZERO,
                missing_wallet,
                event: Some(event),
            },
        )
        .await
    }

    /// Freeze or unfreeze a wallet. Frozen wallets reject debits only.
    pub async fn set_status(
        &self,
        ctx: &mut Ctx,
        customer_id: CustomerId,
        status: WalletStatus,
    ) -> Result<Wallet, WalletError> {
        let scope = self.runner.begin(ctx).await?;
        let result = self.set_status_in_tx(ctx, customer_id, status).await;
        let result = self.runner.finish(ctx, scope, result).await;
        match &result {
            Ok(_) => info!(customer = %customer_id, status = ?status, "wallet status changed"),
            Err(e) => info!(customer = %customer_id, reason = %e, "wallet status change skipped"),
        }
        result
    }

    /// Current balance; zero when the customer has no wallet.
    pub async fn balance(&self, ctx: &mut Ctx, customer_id: CustomerId) -> Result<Amount, WalletError> {
        let wallet = self.wallet(ctx, customer_id).await?;
        Ok(wallet.map(|w| w.balance).unwrap_or_default())
    }

    /// The customer's wallet as seen by the live transaction, or committed
    /// state outside one.
    pub async fn wallet(
        &self,
        ctx: &mut Ctx,
        customer_id: CustomerId,
    ) -> Result<Option<Wallet>, WalletError> {
        let wallet = match ctx.live_tx() {
            Some(tx) => tx.wallet(customer_id).await?,
            None => self.store().wallet(customer_id).await?,
        };
        Ok(wallet)
    }

    /// Ledger rows, newest first.
    pub async fn history(
        &self,
        ctx: &mut Ctx,
        customer_id: CustomerId,
        page: PageRequest,
    ) -> Result<Page<WalletTransaction>, WalletError> {
        if !page.is_valid() {
            return Err(WalletError::InvalidParam(format!(
                "page must be >= 1 and page_size within 1..={}",
                PageRequest::MAX_PAGE_SIZE
            )));
        }
        let Some(wallet) = self.wallet(ctx, customer_id).await? else {
            return Ok(Page::new(Vec::new(), 0, page));
        };
        let (rows, total) = match ctx.live_tx() {
            Some(tx) => tx.ledger_page(wallet.id, page).await?,
            None => self.store().ledger_page(wallet.id, page).await?,
        };
        Ok(Page::new(rows, total, page))
    }

    /// Recompute the balance from the ledger and compare it with the cached one.
    pub async fn verify_ledger(
        &self,
        ctx: &mut Ctx,
        customer_id: CustomerId,
    ) -> Result<LedgerAudit, WalletError> {
        let wallet = self
            .wallet(ctx, customer_id)
            .await?
            .ok_or(WalletError::WalletNotFound(customer_id))?;
        let ledger_sum = match ctx.live_tx() {
            Some(tx) => tx.ledger_sum(wallet.id).await?,
            None => self.store().ledger_sum(wallet.id).await?,
        };
        let audit = LedgerAudit {
            balance: wallet.balance,
            ledger_sum,
        };
        if !audit.is_consistent() {
            warn!(
                customer = %customer_id,
                balance = %audit.balance,
                ledger_sum = %audit.ledger_sum,
                "wallet balance diverges from ledger"
            );
        }
        Ok(audit)
    }
}

/// Private API
impl WalletService {
    fn store(&self) -> &Store {
        self.runner.store()
    }

    fn log_result(entry: &Entry<'_>, result: &Result<Posting, WalletError>) {
        match result {
            Ok(posting) if posting.replayed => {
                info!(
                    customer = %entry.customer_id,
                    key = entry.idem,
                    amount = %entry.amount,
                    "{} replayed", entry.op
                );
            }
            Ok(posting) => {
                info!(
                    customer = %entry.customer_id,
                    key = entry.idem,
                    amount = %entry.amount,
                    balance = %posting.balance_after,
                    "{} applied", entry.op
                );
            }
            Err(e) => {
                info!(
                    customer = %entry.customer_id,
                    key = entry.idem,
                    amount = %entry.amount,
                    reason = %e,
                    "{} skipped", entry.op
                );
            }
        }
    }

    async fn post(&self, ctx: &mut Ctx, entry: Entry<'_>) -> Result<Posting, WalletError> {
        let result = self.validated_post(ctx, &entry).await;
        Self::log_result(&entry, &result);
        result
    }

    async fn validated_post(&self, ctx: &mut Ctx, entry: &Entry<'_>) -> Result<Posting, WalletError> {
        entry.validate()?;
        let scope = self.runner.begin(ctx).await?;
        let result = self.post_in_tx(ctx, entry).await;
        self.runner.finish(ctx, scope, result).await
    }

    /// The ledger posting skeleton:
    /// - Look up the idempotency key; a hit for the same request returns the
    ///   existing row, a hit for a different one is a conflict
    /// - Lock the wallet row (creating the wallet if allowed)
    /// - For debits, check status and balance under the lock
    /// - Append the ledger row(s), then update the cached balance
    async fn post_in_tx(&self, ctx: &mut Ctx, entry: &Entry<'_>) -> Result<Posting, WalletError> {
        let operator_id = ctx.operator_id();
        let now = self.clock.now_secs();
        let tx = ctx.tx()?;

        if let Some(existing) = tx.ledger_by_key(entry.idem).await? {
            return Self::replayed(tx, entry, existing).await;
        }

        let mut wallet = match tx.wallet_for_update(entry.customer_id).await? {
            Some(wallet) => wallet,
            None if entry.missing_wallet == MissingWallet::Create => {
                tx.insert_wallet(entry.customer_id, now).await?
            }
            None => return Err(WalletError::WalletNotFound(entry.customer_id)),
        };

        if entry.direction == Direction::Debit {
            if wallet.is_frozen() {
                return Err(WalletError::WalletFrozen(entry.customer_id));
            }
            if wallet.balance < entry.amount {
                return Err(WalletError::InsufficientBalance {
                    customer: entry.customer_id,
                    requested: entry.amount,
                });
            }
        }

        let row = WalletTransaction {
            id: 0,
            wallet_id: wallet.id,
            direction: entry.direction,
            amount: entry.amount,
            tx_type: entry.tx_type,
            biz_ref_type: entry.biz_ref.0.to_string(),
            biz_ref_id: entry.biz_ref.1,
            idempotency_key: entry.idem.to_string(),
            operator_id,
            reason_code: entry.reason.to_string(),
            note: entry.note.to_string(),
            created_at: now,
        };
        let inserted = match tx.insert_ledger(row).await {
            Ok(inserted) => inserted,
            Err(e) if e.is_unique_violation(LEDGER_IDEMPOTENCY_KEY) => {
                // lost the race against a concurrent call with the same key
                warn!(customer = %entry.customer_id, key = entry.idem, "idempotency race resolved as replay");
                let existing = tx.ledger_by_key(entry.idem).await?.ok_or(e)?;
                return Self::replayed(tx, entry, existing).await;
            }
            Err(e) => return Err(e.into()),
        };

        let mut delta = inserted.signed_amount();
        if entry.bonus.is_positive() {
            let bonus_row = WalletTransaction {
                id: 0,
                direction: Direction::Credit,
                amount: entry.bonus,
                tx_type: LedgerType::Correction,
                idempotency_key: self.deriver.derive(idem::BONUS, entry.customer_id, entry.idem),
                ..inserted.clone()
            };
            tx.insert_ledger(bonus_row).await?;
            delta += entry.bonus;
        }

        let balance = wallet
            .balance
            .checked_add(delta)
            .ok_or(WalletError::Overflow(entry.customer_id))?;
        if balance.is_negative() {
            return Err(WalletError::InsufficientBalance {
                customer: entry.customer_id,
                requested: entry.amount,
            });
        }
        wallet.balance = balance;
        wallet.updated_at = now;
        tx.update_wallet(&wallet).await?;

        if let Some(event_type) = entry.event {
            let event = WalletEvent {
                customer_id: entry.customer_id,
                amount: entry.amount,
                bonus: entry.bonus,
                balance_after: balance,
                tx_type: entry.tx_type,
                idempotency_key: entry.idem.to_string(),
                timestamp: now,
            };
            self.outbox.append_json(ctx, event_type, &event).await?;
        }

        Ok(Posting {
            entry: inserted,
            balance_after: balance,
            replayed: false,
        })
    }

    /// Resolve a key hit. The stored row must record the same request.
    async fn replayed(
        tx: &mut Tx,
        entry: &Entry<'_>,
        existing: WalletTransaction,
    ) -> Result<Posting, WalletError> {
        let wallet = tx.wallet(entry.customer_id).await?;
        if entry.conflicts_with(&existing, wallet.as_ref().map(|w| w.id)) {
            warn!(
                customer = %entry.customer_id,
                key = entry.idem,
                stored_type = %existing.tx_type,
                stored_amount = %existing.amount,
                "idempotency key reused with different arguments"
            );
            return Err(WalletError::IdempotencyConflict(entry.idem.to_string()));
        }
        Ok(Posting {
            balance_after: wallet.map(|w| w.balance).unwrap_or_default(),
            entry: existing,
            replayed: true,
        })
    }

    async fn set_status_in_tx(
        &self,
        ctx: &mut Ctx,
        customer_id: CustomerId,
        status: WalletStatus,
    ) -> Result<Wallet, WalletError> {
        let now = self.clock.now_secs();
        let tx = ctx.tx()?;
        let mut wallet = tx
            .wallet_for_update(customer_id)
            .await?
            .ok_or(WalletError::WalletNotFound(customer_id))?;
        wallet.status = status;
        wallet.updated_at = now;
        tx.update_wallet(&wallet).await?;
        Ok(wallet)
    }
}

#[cfg(test)]
mod tests;
