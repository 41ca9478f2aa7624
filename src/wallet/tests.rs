use std::sync::Arc;

use chrono::{TimeDelta, TimeZone, Utc};

use super::*;
use crate::config::StoreConfig;
use crate::error::{ErrorCode, ErrorKind};
use crate::ids::FixedClock;
use crate::store::StoreError;

async fn setup_with(config: &StoreConfig) -> (Store, WalletService, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ));
    let store = Store::connect(config, clock.clone()).await.unwrap();
    let service = WalletService::new(
        TxRunner::new(store.clone()),
        OutboxWriter,
        clock.clone(),
        IdemDeriver::default(),
    );
    (store, service, clock)
}

async fn setup() -> (Store, WalletService, Arc<FixedClock>) {
    setup_with(&StoreConfig::default()).await
}

/// A store on a database file, for reads of committed state while another
/// transaction is open.
async fn file_setup() -> (Store, WalletService, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        url: format!("sqlite://{}", dir.path().join("wallet.db").display()),
        ..StoreConfig::default()
    };
    let (store, service, _) = setup_with(&config).await;
    (store, service, dir)
}

fn cents(v: i64) -> Amount {
    Amount::from_minor(v)
}

async fn recharge(service: &WalletService, customer: CustomerId, amount: i64, key: &str) -> Posting {
    service
        .credit(&mut Ctx::new(), &CreditRequest::new(customer, cents(amount), key))
        .await
        .unwrap()
}

// credit

#[tokio::test]
async fn credit_creates_wallet_and_ledger_row() {
    let (store, service, _) = setup().await;

    let posting = recharge(&service, 1, 10_000, "R1").await;

    assert!(!posting.replayed);
    assert_eq!(posting.balance_after, cents(10_000));
    assert_eq!(posting.entry.tx_type, LedgerType::Recharge);
    assert_eq!(posting.entry.direction, Direction::Credit);
    assert_eq!(posting.entry.biz_ref_type, BIZ_REF_MANUAL);
    assert_eq!(service.balance(&mut Ctx::new(), 1).await.unwrap(), cents(10_000));
    assert_eq!(store.ledger_len().await.unwrap(), 1);

    let events = store.outbox().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, WALLET_CREDITED);
}

#[tokio::test]
async fn credit_with_same_key_is_a_no_op() {
    let (store, service, _) = setup().await;

    let first = recharge(&service, 1, 10_000, "R1").await;
    let second = recharge(&service, 1, 10_000, "R1").await;

    assert!(second.replayed);
    assert_eq!(second.entry.id, first.entry.id);
    assert_eq!(second.balance_after, cents(10_000));
    assert_eq!(store.ledger_len().await.unwrap(), 1);
    assert_eq!(store.outbox().await.unwrap().len(), 1);
}

#[tokio::test]
async fn credit_bonus_is_booked_as_correction() {
    let (store, service, _) = setup().await;
    let req = CreditRequest::new(1, cents(10_000), "R1")
        .bonus(cents(1_000))
        .reason("promo");

    let posting = service.credit(&mut Ctx::new(), &req).await.unwrap();
    assert_eq!(posting.balance_after, cents(11_000));

    let wallet = store.wallet(1).await.unwrap().unwrap();
    let rows = store.ledger(wallet.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(
        rows.iter()
            .any(|r| r.tx_type == LedgerType::Correction && r.amount == cents(1_000))
    );
    assert!(service.verify_ledger(&mut Ctx::new(), 1).await.unwrap().is_consistent());

    // replay does not book the bonus twice
    service.credit(&mut Ctx::new(), &req).await.unwrap();
    assert_eq!(store.ledger(wallet.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn credit_rejects_bad_input() {
    let (store, service, _) = setup().await;
    let mut ctx = Ctx::new();

    let zero = service
        .credit(&mut ctx, &CreditRequest::new(1, Amount::ZERO, "R1"))
        .await;
    assert!(matches!(zero, Err(WalletError::InvalidParam(_))));

    let bad_key = service
        .credit(&mut ctx, &CreditRequest::new(1, cents(100), "has space"))
        .await;
    assert!(matches!(bad_key, Err(WalletError::InvalidParam(_))));

    let negative_bonus = service
        .credit(
            &mut ctx,
            &CreditRequest::new(1, cents(100), "R2").bonus(cents(-1)),
        )
        .await;
    assert!(matches!(negative_bonus, Err(WalletError::InvalidParam(_))));

    assert!(store.wallet(1).await.unwrap().is_none());
    assert_eq!(store.ledger_len().await.unwrap(), 0);
}

#[tokio::test]
async fn note_length_is_bounded() {
    let (store, service, _) = setup().await;
    let mut ctx = Ctx::new();

    let longest = "n".repeat(MAX_NOTE_LEN);
    let ok = service
        .credit(&mut ctx, &CreditRequest::new(1, cents(100), "R1").note(longest))
        .await;
    assert!(ok.is_ok());

    // characters, not bytes
    let accented = "é".repeat(MAX_NOTE_LEN);
    let ok = service
        .credit(&mut ctx, &CreditRequest::new(1, cents(100), "R2").note(accented))
        .await;
    assert!(ok.is_ok());

    let too_long = "n".repeat(MAX_NOTE_LEN + 1);
    let err = service
        .credit(&mut ctx, &CreditRequest::new(1, cents(100), "R3").note(too_long.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::InvalidParam(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidParam);

    let adjust = AdjustRequest {
        customer_id: 1,
        direction: Direction::Credit,
        amount: cents(50),
        reason: "goodwill".into(),
        idem: "A1".into(),
        note: too_long,
    };
    assert!(matches!(
        service.adjust(&mut ctx, &adjust).await,
        Err(WalletError::InvalidParam(_))
    ));
    assert_eq!(store.ledger_len().await.unwrap(), 2);
}

#[tokio::test]
async fn caller_keys_in_derived_namespaces_are_rejected() {
    let (store, service, _) = setup().await;
    let mut ctx = Ctx::new();

    for key in ["order_pay:1:K1", "order_refund:1:K1", "bonus:1:R1"] {
        let err = service
            .credit(&mut ctx, &CreditRequest::new(1, cents(100), key))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidParam(_)), "{key}");
    }

    let adjust = AdjustRequest {
        customer_id: 1,
        direction: Direction::Credit,
        amount: cents(100),
        reason: String::new(),
        idem: "order_pay:2:K".into(),
        note: String::new(),
    };
    assert!(matches!(
        service.adjust(&mut ctx, &adjust).await,
        Err(WalletError::InvalidParam(_))
    ));
    assert_eq!(store.ledger_len().await.unwrap(), 0);
}

#[tokio::test]
async fn key_reused_for_another_request_is_a_conflict() {
    let (store, service, _) = setup().await;
    recharge(&service, 1, 10_000, "R1").await;

    // different amount under the same key
    let err = service
        .credit(&mut Ctx::new(), &CreditRequest::new(1, cents(9_999), "R1"))
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::IdempotencyConflict(ref key) if key == "R1"));
    assert_eq!(err.kind(), ErrorKind::InvalidParam);
    assert_eq!(err.code(), "idempotency_conflict");

    // a debit must not be satisfied by a credit row
    let debit = DebitForOrderRequest {
        customer_id: 1,
        order_id: 3,
        amount: cents(10_000),
        idem: "R1".into(),
    };
    assert!(matches!(
        service.debit_for_order(&mut Ctx::new(), &debit).await,
        Err(WalletError::IdempotencyConflict(_))
    ));

    // nor by another customer's row
    recharge(&service, 2, 500, "R2").await;
    assert!(matches!(
        service
            .credit(&mut Ctx::new(), &CreditRequest::new(1, cents(500), "R2"))
            .await,
        Err(WalletError::IdempotencyConflict(_))
    ));

    assert_eq!(store.wallet(1).await.unwrap().unwrap().balance, cents(10_000));
    assert_eq!(store.ledger_len().await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_credits_with_same_key_apply_once() {
    let (store, service, _) = setup().await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .credit(&mut Ctx::new(), &CreditRequest::new(1, cents(500), "SAME"))
                    .await
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        let posting = handle.await.unwrap().unwrap();
        if !posting.replayed {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(store.ledger_len().await.unwrap(), 1);
    assert_eq!(store.wallet(1).await.unwrap().unwrap().balance, cents(500));
}

// debit_for_order

#[tokio::test]
async fn debit_reduces_balance() {
    let (store, service, _) = setup().await;
    recharge(&service, 1, 10_000, "R1").await;

    let req = DebitForOrderRequest {
        customer_id: 1,
        order_id: 42,
        amount: cents(4_000),
        idem: "order_pay:42:K1".into(),
    };
    let posting = service.debit_for_order(&mut Ctx::new(), &req).await.unwrap();

    assert_eq!(posting.balance_after, cents(6_000));
    assert_eq!(posting.entry.tx_type, LedgerType::OrderPay);
    assert_eq!(posting.entry.biz_ref_type, BIZ_REF_ORDER);
    assert_eq!(posting.entry.biz_ref_id, 42);
    // order payments publish order events, not wallet events
    assert_eq!(store.outbox().await.unwrap().len(), 1);
}

#[tokio::test]
async fn debit_with_insufficient_balance_writes_nothing() {
    let (store, service, _) = setup().await;
    recharge(&service, 1, 1_000, "R1").await;

    let req = DebitForOrderRequest {
        customer_id: 1,
        order_id: 1,
        amount: cents(1_001),
        idem: "D1".into(),
    };
    let err = service
        .debit_for_order(&mut Ctx::new(), &req)
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::InsufficientBalance { customer: 1, .. }));
    assert_eq!(err.kind(), ErrorKind::BusinessRule);
    assert_eq!(err.code(), "insufficient_balance");
    assert_eq!(store.wallet(1).await.unwrap().unwrap().balance, cents(1_000));
    assert_eq!(store.ledger_len().await.unwrap(), 1);
}

#[tokio::test]
async fn debit_exact_balance_reaches_zero() {
    let (_, service, _) = setup().await;
    recharge(&service, 1, 1_000, "R1").await;

    let req = DebitForOrderRequest {
        customer_id: 1,
        order_id: 1,
        amount: cents(1_000),
        idem: "D1".into(),
    };
    let posting = service.debit_for_order(&mut Ctx::new(), &req).await.unwrap();
    assert_eq!(posting.balance_after, Amount::ZERO);
}

#[tokio::test]
async fn debit_without_wallet_fails() {
    let (store, service, _) = setup().await;
    let req = DebitForOrderRequest {
        customer_id: 9,
        order_id: 1,
        amount: cents(100),
        idem: "D1".into(),
    };
    let err = service
        .debit_for_order(&mut Ctx::new(), &req)
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::WalletNotFound(9)));
    assert!(store.wallet(9).await.unwrap().is_none());
}

#[tokio::test]
async fn frozen_wallet_rejects_debits_but_accepts_credits() {
    let (_, service, _) = setup().await;
    recharge(&service, 1, 5_000, "R1").await;
    service
        .set_status(&mut Ctx::new(), 1, WalletStatus::Frozen)
        .await
        .unwrap();

    let req = DebitForOrderRequest {
        customer_id: 1,
        order_id: 1,
        amount: cents(100),
        idem: "D1".into(),
    };
    let err = service
        .debit_for_order(&mut Ctx::new(), &req)
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::WalletFrozen(1)));

    let posting = recharge(&service, 1, 100, "R2").await;
    assert_eq!(posting.balance_after, cents(5_100));

    service
        .set_status(&mut Ctx::new(), 1, WalletStatus::Active)
        .await
        .unwrap();
    assert!(service.debit_for_order(&mut Ctx::new(), &req).await.is_ok());
}

#[tokio::test]
async fn set_status_requires_wallet() {
    let (_, service, _) = setup().await;
    let err = service
        .set_status(&mut Ctx::new(), 3, WalletStatus::Frozen)
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::WalletNotFound(3)));
}

// credit_for_refund / adjust

#[tokio::test]
async fn refund_credit_creates_missing_wallet_without_event() {
    let (store, service, _) = setup().await;
    let req = RefundCreditRequest {
        customer_id: 5,
        order_id: 77,
        amount: cents(2_500),
        idem: "order_refund:77:1".into(),
        reason: "customer_request".into(),
    };

    let posting = service
        .credit_for_refund(&mut Ctx::new(), &req)
        .await
        .unwrap();

    assert_eq!(posting.balance_after, cents(2_500));
    assert_eq!(posting.entry.tx_type, LedgerType::OrderRefund);
    assert_eq!(posting.entry.reason_code, "customer_request");
    assert!(store.outbox().await.unwrap().is_empty());
}

#[tokio::test]
async fn adjust_uses_direction_specific_types() {
    let (store, service, _) = setup().await;
    let mut ctx = Ctx::new().operator(7);

    let adjust_in = AdjustRequest {
        customer_id: 1,
        direction: Direction::Credit,
        amount: cents(300),
        reason: "goodwill".into(),
        idem: "A1".into(),
        note: "desk".into(),
    };
    let posting = service.adjust(&mut ctx, &adjust_in).await.unwrap();
    assert_eq!(posting.entry.tx_type, LedgerType::AdjustIn);
    assert_eq!(posting.entry.operator_id, 7);

    let adjust_out = AdjustRequest {
        direction: Direction::Debit,
        amount: cents(100),
        idem: "A2".into(),
        ..adjust_in.clone()
    };
    let posting = service.adjust(&mut ctx, &adjust_out).await.unwrap();
    assert_eq!(posting.entry.tx_type, LedgerType::AdjustOut);
    assert_eq!(posting.balance_after, cents(200));

    let too_much = AdjustRequest {
        amount: cents(1_000),
        idem: "A3".into(),
        ..adjust_out
    };
    assert!(matches!(
        service.adjust(&mut ctx, &too_much).await,
        Err(WalletError::InsufficientBalance { .. })
    ));

    let types: Vec<_> = store
        .outbox()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec![WALLET_CREDITED, WALLET_DEBITED]);
}

// transactions

#[tokio::test]
async fn joined_credit_rolls_back_with_outer_transaction() {
    let (store, service, _dir) = file_setup().await;
    let runner = TxRunner::new(store.clone());
    let mut ctx = Ctx::new();

    let scope = runner.begin(&mut ctx).await.unwrap();
    let posting = service
        .credit(&mut ctx, &CreditRequest::new(1, cents(100), "R1"))
        .await
        .unwrap();
    assert_eq!(service.balance(&mut ctx, 1).await.unwrap(), posting.balance_after);
    assert_eq!(service.balance(&mut Ctx::new(), 1).await.unwrap(), Amount::ZERO);

    let result: Result<(), WalletError> = Err(WalletError::InvalidParam("abort".into()));
    assert!(runner.finish(&mut ctx, scope, result).await.is_err());

    assert!(store.wallet(1).await.unwrap().is_none());
    assert_eq!(store.ledger_len().await.unwrap(), 0);
    assert!(store.outbox().await.unwrap().is_empty());
}

#[tokio::test]
async fn reads_inside_a_transaction_see_its_writes() {
    let (store, service, _) = setup().await;
    let runner = TxRunner::new(store.clone());
    let mut ctx = Ctx::new();

    let scope = runner.begin(&mut ctx).await.unwrap();
    let credited = service
        .credit(&mut ctx, &CreditRequest::new(1, cents(700), "R1"))
        .await;
    assert!(credited.is_ok());
    let history = service.history(&mut ctx, 1, PageRequest::new(1, 20)).await;
    let audit = service.verify_ledger(&mut ctx, 1).await;
    runner
        .finish::<_, WalletError>(&mut ctx, scope, Ok(()))
        .await
        .unwrap();

    assert_eq!(history.unwrap().total, 1);
    assert_eq!(audit.unwrap().ledger_sum, cents(700));
}

#[tokio::test]
async fn expired_deadline_is_transient() {
    let (_, service, _) = setup().await;
    let mut ctx = Ctx::new().deadline(tokio::time::Instant::now());
    let err = service
        .credit(&mut ctx, &CreditRequest::new(1, cents(100), "R1"))
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::Store(StoreError::DeadlineExceeded)));
    assert!(err.kind().is_retryable());
}

// reads

#[tokio::test]
async fn history_is_newest_first_and_paged() {
    let (_, service, clock) = setup().await;
    for i in 0..5 {
        recharge(&service, 1, 100 * (i + 1), &format!("R{i}")).await;
        clock.advance(TimeDelta::seconds(1));
    }

    let first = service.history(&mut Ctx::new(), 1, PageRequest::new(1, 2)).await.unwrap();
    assert_eq!(first.total, 5);
    let amounts: Vec<_> = first.items.iter().map(|r| r.amount).collect();
    assert_eq!(amounts, vec![cents(500), cents(400)]);

    let last = service.history(&mut Ctx::new(), 1, PageRequest::new(3, 2)).await.unwrap();
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.items[0].amount, cents(100));

    let empty = service.history(&mut Ctx::new(), 2, PageRequest::new(1, 20)).await.unwrap();
    assert_eq!(empty.total, 0);

    assert!(matches!(
        service.history(&mut Ctx::new(), 1, PageRequest::new(0, 20)).await,
        Err(WalletError::InvalidParam(_))
    ));
    assert!(matches!(
        service.history(&mut Ctx::new(), 1, PageRequest::new(1, 101)).await,
        Err(WalletError::InvalidParam(_))
    ));
}

#[tokio::test]
async fn balance_of_unknown_customer_is_zero() {
    let (_, service, _) = setup().await;
    let mut ctx = Ctx::new();
    assert_eq!(service.balance(&mut ctx, 404).await.unwrap(), Amount::ZERO);
    assert!(service.wallet(&mut ctx, 404).await.unwrap().is_none());
    assert!(matches!(
        service.verify_ledger(&mut ctx, 404).await,
        Err(WalletError::WalletNotFound(404))
    ));
}
