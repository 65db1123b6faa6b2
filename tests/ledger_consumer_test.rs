//! Ledger reconciliation and idempotent consumption against a real
//! Postgres. Skips cleanly when DATABASE_URL is not set.

use bigdecimal::BigDecimal;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use settlecore::consumer::{ConsumeOutcome, EventConsumer};
use settlecore::db::models::{ACCOUNT_KIND_BALANCE, ACCOUNT_KIND_STOCK};
use settlecore::db::queries;
use settlecore::domain::events::{
    KIND_SETTLEMENT_APPROVED, KIND_SETTLEMENT_CANCELLED, KIND_STOCK_ADJUSTMENT_REQUESTED,
};
use settlecore::domain::{DomainEvent, EventEnvelope, EventRouter};
use settlecore::ledger::Reconciler;
use settlecore::outbox::OutboxRecorder;

async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to test database");

    Migrator::new(Path::new("./migrations"))
        .await
        .expect("load migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Some(pool)
}

fn consumer(pool: PgPool) -> EventConsumer {
    EventConsumer::new(
        pool.clone(),
        Reconciler::new(pool),
        OutboxRecorder::new(EventRouter::standard()),
        "test-consumer",
    )
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

#[tokio::test]
async fn test_delta_history_replays_to_cached_quantity() {
    let Some(pool) = test_pool().await else { return };

    let owner = unique("product");
    let account = queries::insert_account(&pool, ACCOUNT_KIND_STOCK, &owner)
        .await
        .expect("create account");

    let reconciler = Reconciler::new(pool.clone());
    for (amount, reason) in [(20, "initial stock"), (-5, "order placed"), (3, "restock")] {
        let mut tx = pool.begin().await.expect("begin");
        reconciler
            .apply_delta(&mut tx, account.id, BigDecimal::from(amount), reason)
            .await
            .expect("apply delta");
        tx.commit().await.expect("commit");
    }

    let view = reconciler.recompute(account.id).await.expect("recompute");
    assert_eq!(view.cached_quantity, BigDecimal::from(18));
    assert_eq!(view.recomputed_quantity, BigDecimal::from(18));
    assert!(view.consistent);
}

#[tokio::test]
async fn test_recompute_detects_corrupted_cache() {
    let Some(pool) = test_pool().await else { return };

    let owner = unique("product");
    let account = queries::insert_account(&pool, ACCOUNT_KIND_STOCK, &owner)
        .await
        .expect("create account");

    let reconciler = Reconciler::new(pool.clone());
    let mut tx = pool.begin().await.expect("begin");
    reconciler
        .apply_delta(&mut tx, account.id, BigDecimal::from(10), "seed")
        .await
        .expect("apply delta");
    tx.commit().await.expect("commit");

    // Corrupt the cached field behind the reconciler's back.
    sqlx::query("UPDATE ledger_accounts SET current_quantity = 999 WHERE id = $1")
        .bind(account.id)
        .execute(&pool)
        .await
        .expect("corrupt");

    let view = reconciler.recompute(account.id).await.expect("recompute");
    assert!(!view.consistent);
    assert_eq!(view.recomputed_quantity, BigDecimal::from(10));
}

#[tokio::test]
async fn test_rolled_back_delta_leaves_no_trace() {
    let Some(pool) = test_pool().await else { return };

    let owner = unique("product");
    let account = queries::insert_account(&pool, ACCOUNT_KIND_STOCK, &owner)
        .await
        .expect("create account");

    let reconciler = Reconciler::new(pool.clone());
    {
        let mut tx = pool.begin().await.expect("begin");
        reconciler
            .apply_delta(&mut tx, account.id, BigDecimal::from(42), "doomed")
            .await
            .expect("apply delta");
        tx.rollback().await.expect("rollback");
    }

    let view = reconciler.recompute(account.id).await.expect("recompute");
    assert_eq!(view.cached_quantity, BigDecimal::from(0));
    assert_eq!(view.recomputed_quantity, BigDecimal::from(0));

    let deltas: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_deltas WHERE account_id = $1")
        .bind(account.id)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(deltas, 0);
}

#[tokio::test]
async fn test_duplicate_event_applies_effect_once() {
    let Some(pool) = test_pool().await else { return };

    let merchant = unique("merchant");
    queries::insert_account(&pool, ACCOUNT_KIND_BALANCE, &merchant)
        .await
        .expect("create account");

    let event = DomainEvent::new(
        KIND_SETTLEMENT_APPROVED,
        unique("order"),
        serde_json::json!({"merchantId": merchant, "amount": "10000"}),
    );
    let envelope = EventEnvelope::wrap(&event);

    let consumer = consumer(pool.clone());
    assert_eq!(
        consumer.consume(&envelope).await.expect("first delivery"),
        ConsumeOutcome::Applied
    );
    assert_eq!(
        consumer.consume(&envelope).await.expect("redelivery"),
        ConsumeOutcome::Skipped
    );

    let reconciler = Reconciler::new(pool.clone());
    let mut tx = pool.begin().await.expect("begin");
    let account = queries::lock_account_by_owner(&mut tx, ACCOUNT_KIND_BALANCE, &merchant)
        .await
        .expect("query")
        .expect("account");
    tx.commit().await.expect("commit");
    assert_eq!(account.current_quantity, BigDecimal::from(10_000));

    let view = reconciler.recompute(account.id).await.expect("recompute");
    assert!(view.consistent);
}

#[tokio::test]
async fn test_cancellation_event_reverses_balance() {
    let Some(pool) = test_pool().await else { return };

    let merchant = unique("merchant");
    queries::insert_account(&pool, ACCOUNT_KIND_BALANCE, &merchant)
        .await
        .expect("create account");

    let consumer = consumer(pool.clone());
    let order = unique("order");

    let approved = EventEnvelope::wrap(&DomainEvent::new(
        KIND_SETTLEMENT_APPROVED,
        order.clone(),
        serde_json::json!({"merchantId": merchant, "amount": "5000.50"}),
    ));
    consumer.consume(&approved).await.expect("approve");

    let cancelled = EventEnvelope::wrap(&DomainEvent::new(
        KIND_SETTLEMENT_CANCELLED,
        order,
        serde_json::json!({"merchantId": merchant, "amount": "5000.50"}),
    ));
    consumer.consume(&cancelled).await.expect("cancel");

    let mut tx = pool.begin().await.expect("begin");
    let account = queries::lock_account_by_owner(&mut tx, ACCOUNT_KIND_BALANCE, &merchant)
        .await
        .expect("query")
        .expect("account");
    tx.commit().await.expect("commit");
    assert_eq!(account.current_quantity, BigDecimal::from_str("0").unwrap());
}

#[tokio::test]
async fn test_stock_adjustment_emits_synchronized_event() {
    let Some(pool) = test_pool().await else { return };

    let product = unique("product");
    queries::insert_account(&pool, ACCOUNT_KIND_STOCK, &product)
        .await
        .expect("create account");

    let envelope = EventEnvelope::wrap(&DomainEvent::new(
        KIND_STOCK_ADJUSTMENT_REQUESTED,
        product.clone(),
        serde_json::json!({"productRef": product, "delta": -3, "reason": "order placed"}),
    ));
    consumer(pool.clone()).consume(&envelope).await.expect("consume");

    // Effect and follow-on event committed together.
    let emitted: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox_events WHERE aggregate_id = $1 AND event_type = 'product.stock.synchronized'",
    )
    .bind(&product)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(emitted, 1);
}

#[tokio::test]
async fn test_consumer_rolls_back_marker_on_effect_failure() {
    let Some(pool) = test_pool().await else { return };

    // No account provisioned for this merchant: the effect fails.
    let merchant = unique("ghost");
    let envelope = EventEnvelope::wrap(&DomainEvent::new(
        KIND_SETTLEMENT_APPROVED,
        unique("order"),
        serde_json::json!({"merchantId": merchant, "amount": "100"}),
    ));

    let consumer = consumer(pool.clone());
    assert!(consumer.consume(&envelope).await.is_err());

    // Marker must not survive a failed effect; redelivery gets a clean run.
    let markers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_events WHERE event_id = $1")
        .bind(&envelope.event_id)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(markers, 0);

    queries::insert_account(&pool, ACCOUNT_KIND_BALANCE, &merchant)
        .await
        .expect("create account");
    assert_eq!(
        consumer.consume(&envelope).await.expect("retry succeeds"),
        ConsumeOutcome::Applied
    );
}
