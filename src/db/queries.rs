use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Result, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::db::models::{
    LedgerAccount, LedgerDelta, OutboxEvent, ProcessedEvent, SettledTransaction, SettlementJob,
    TransactionRecord,
};
use crate::domain::TransactionStatus;

// --- Transaction record queries ---

pub async fn insert_record(
    executor: &mut SqlxTransaction<'_, Postgres>,
    record: &TransactionRecord,
) -> Result<TransactionRecord> {
    sqlx::query_as::<_, TransactionRecord>(
        r#"
        INSERT INTO transaction_records (
            id, reference, external_ref, merchant_id, order_ref, kind, amount, status,
            origin_reference, approval_no, fail_reason, callback_url, echo,
            requested_at, ack_received_at, processing_started_at, processed_at, attempt_count
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        RETURNING *
        "#,
    )
    .bind(record.id)
    .bind(&record.reference)
    .bind(&record.external_ref)
    .bind(&record.merchant_id)
    .bind(&record.order_ref)
    .bind(&record.kind)
    .bind(&record.amount)
    .bind(&record.status)
    .bind(&record.origin_reference)
    .bind(&record.approval_no)
    .bind(&record.fail_reason)
    .bind(&record.callback_url)
    .bind(&record.echo)
    .bind(record.requested_at)
    .bind(record.ack_received_at)
    .bind(record.processing_started_at)
    .bind(record.processed_at)
    .bind(record.attempt_count)
    .fetch_one(&mut **executor)
    .await
}

pub async fn get_record_by_reference(
    pool: &PgPool,
    reference: &str,
) -> Result<Option<TransactionRecord>> {
    sqlx::query_as::<_, TransactionRecord>(
        "SELECT * FROM transaction_records WHERE reference = $1",
    )
    .bind(reference)
    .fetch_optional(pool)
    .await
}

/// Exact-reference resolution only: our generated reference first, then the
/// counterparty's tid. No heuristic fallback.
pub async fn resolve_record(
    executor: &mut SqlxTransaction<'_, Postgres>,
    reference: Option<&str>,
    external_ref: &str,
) -> Result<Option<TransactionRecord>> {
    if let Some(reference) = reference {
        let found = sqlx::query_as::<_, TransactionRecord>(
            "SELECT * FROM transaction_records WHERE reference = $1",
        )
        .bind(reference)
        .fetch_optional(&mut **executor)
        .await?;
        if found.is_some() {
            return Ok(found);
        }
    }

    sqlx::query_as::<_, TransactionRecord>(
        "SELECT * FROM transaction_records WHERE external_ref = $1",
    )
    .bind(external_ref)
    .fetch_optional(&mut **executor)
    .await
}

/// Record the counterparty's ack: the external reference is assigned once
/// and only while the record is still PENDING.
pub async fn mark_acknowledged(pool: &PgPool, id: Uuid, external_ref: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE transaction_records
        SET external_ref = $2, ack_received_at = NOW(), attempt_count = attempt_count + 1
        WHERE id = $1 AND status = 'PENDING' AND external_ref IS NULL
        "#,
    )
    .bind(id)
    .bind(external_ref)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// CAS finalization. Zero rows affected means another caller already moved
/// the record on; the caller treats that as the concurrency signal it is.
pub async fn cas_finalize_record(
    executor: &mut SqlxTransaction<'_, Postgres>,
    id: Uuid,
    expected: TransactionStatus,
    new: TransactionStatus,
    approval_no: Option<&str>,
    fail_reason: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE transaction_records
        SET status = $3, approval_no = $4, fail_reason = $5, processed_at = NOW()
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(id)
    .bind(expected.as_str())
    .bind(new.as_str())
    .bind(approval_no)
    .bind(fail_reason)
    .execute(&mut **executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn cas_fail_record(
    pool: &PgPool,
    id: Uuid,
    expected: TransactionStatus,
    fail_reason: &str,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE transaction_records
        SET status = 'FAILED', fail_reason = $3, processed_at = NOW()
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(id)
    .bind(expected.as_str())
    .bind(fail_reason)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// --- Settled transaction queries ---

pub async fn insert_settled(
    executor: &mut SqlxTransaction<'_, Postgres>,
    settled: &SettledTransaction,
) -> Result<SettledTransaction> {
    sqlx::query_as::<_, SettledTransaction>(
        r#"
        INSERT INTO settled_transactions (
            id, record_id, merchant_id, order_ref, amount, status,
            approval_no, origin_settled_id, settled_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(settled.id)
    .bind(settled.record_id)
    .bind(&settled.merchant_id)
    .bind(&settled.order_ref)
    .bind(&settled.amount)
    .bind(&settled.status)
    .bind(&settled.approval_no)
    .bind(settled.origin_settled_id)
    .bind(settled.settled_at)
    .fetch_one(&mut **executor)
    .await
}

pub async fn get_settled(pool: &PgPool, id: Uuid) -> Result<Option<SettledTransaction>> {
    sqlx::query_as::<_, SettledTransaction>("SELECT * FROM settled_transactions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_settled_by_record(
    pool: &PgPool,
    record_id: Uuid,
) -> Result<Option<SettledTransaction>> {
    sqlx::query_as::<_, SettledTransaction>(
        "SELECT * FROM settled_transactions WHERE record_id = $1",
    )
    .bind(record_id)
    .fetch_optional(pool)
    .await
}

/// The settled transaction behind a gateway reference, used to validate
/// cancellation requests.
pub async fn get_settled_for_reference(
    pool: &PgPool,
    reference: &str,
) -> Result<Option<SettledTransaction>> {
    sqlx::query_as::<_, SettledTransaction>(
        r#"
        SELECT s.* FROM settled_transactions s
        JOIN transaction_records r ON r.id = s.record_id
        WHERE r.reference = $1
        "#,
    )
    .bind(reference)
    .fetch_optional(pool)
    .await
}

/// The cancellation row for a settled transaction, if one was ever
/// materialized. At most one exists per origin.
pub async fn get_cancellation_for_settled(
    pool: &PgPool,
    origin_settled_id: Uuid,
) -> Result<Option<SettledTransaction>> {
    sqlx::query_as::<_, SettledTransaction>(
        "SELECT * FROM settled_transactions WHERE origin_settled_id = $1",
    )
    .bind(origin_settled_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_cancellation_for_settled_in_tx(
    executor: &mut SqlxTransaction<'_, Postgres>,
    origin_settled_id: Uuid,
) -> Result<Option<SettledTransaction>> {
    sqlx::query_as::<_, SettledTransaction>(
        "SELECT * FROM settled_transactions WHERE origin_settled_id = $1",
    )
    .bind(origin_settled_id)
    .fetch_optional(&mut **executor)
    .await
}

/// A cancel record for this origin that has not definitively failed,
/// i.e. one that is pending, in flight or already succeeded.
pub async fn find_active_cancel_record(
    pool: &PgPool,
    origin_reference: &str,
) -> Result<Option<TransactionRecord>> {
    sqlx::query_as::<_, TransactionRecord>(
        r#"
        SELECT * FROM transaction_records
        WHERE kind = 'cancel' AND origin_reference = $1 AND status <> 'FAILED'
        LIMIT 1
        "#,
    )
    .bind(origin_reference)
    .fetch_optional(pool)
    .await
}

/// Same lookup inside an open transaction, for linking a cancellation's
/// origin while the cancel outcome is being committed.
pub async fn get_settled_for_reference_in_tx(
    executor: &mut SqlxTransaction<'_, Postgres>,
    reference: &str,
) -> Result<Option<SettledTransaction>> {
    sqlx::query_as::<_, SettledTransaction>(
        r#"
        SELECT s.* FROM settled_transactions s
        JOIN transaction_records r ON r.id = s.record_id
        WHERE r.reference = $1
        "#,
    )
    .bind(reference)
    .fetch_optional(&mut **executor)
    .await
}

// --- Outbox queries ---

pub async fn insert_outbox_event(
    executor: &mut SqlxTransaction<'_, Postgres>,
    event: &OutboxEvent,
) -> Result<OutboxEvent> {
    sqlx::query_as::<_, OutboxEvent>(
        r#"
        INSERT INTO outbox_events (
            id, event_id, event_type, aggregate_id, topic, payload,
            status, retry_count, published_at, error_message, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(event.id)
    .bind(&event.event_id)
    .bind(&event.event_type)
    .bind(&event.aggregate_id)
    .bind(&event.topic)
    .bind(&event.payload)
    .bind(&event.status)
    .bind(event.retry_count)
    .bind(event.published_at)
    .bind(&event.error_message)
    .bind(event.created_at)
    .fetch_one(&mut **executor)
    .await
}

/// Oldest-first PENDING batch for the dispatcher.
pub async fn get_pending_outbox_events(pool: &PgPool, limit: i64) -> Result<Vec<OutboxEvent>> {
    sqlx::query_as::<_, OutboxEvent>(
        "SELECT * FROM outbox_events WHERE status = 'PENDING' ORDER BY created_at ASC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn mark_outbox_published(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'PUBLISHED', published_at = NOW(), error_message = NULL
        WHERE id = $1 AND status = 'PENDING'
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Bump the retry counter; entries that exhaust their retries land in
/// FAILED for operator inspection, never silently dropped.
pub async fn mark_outbox_failed(
    pool: &PgPool,
    id: Uuid,
    error: &str,
    max_retry: i32,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET retry_count = retry_count + 1,
            error_message = $2,
            status = CASE WHEN retry_count + 1 >= $3 THEN 'FAILED' ELSE status END
        WHERE id = $1 AND status = 'PENDING'
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(max_retry)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_published_outbox_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM outbox_events WHERE status = 'PUBLISHED' AND published_at < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn outbox_status_counts(
    pool: &PgPool,
) -> Result<std::collections::HashMap<String, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().collect())
}

// --- Processed event queries ---

/// Insert the dedup marker. Returns false when the marker already existed,
/// which is the whole idempotency mechanism: the unique constraint on
/// event_id decides, no in-memory locking involved.
pub async fn try_insert_processed_marker(
    executor: &mut SqlxTransaction<'_, Postgres>,
    event: &ProcessedEvent,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO processed_events (id, event_id, event_type, consumed_by, processed_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event.id)
    .bind(&event.event_id)
    .bind(&event.event_type)
    .bind(&event.consumed_by)
    .bind(event.processed_at)
    .execute(&mut **executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

// --- Ledger queries ---

pub async fn insert_account(
    pool: &PgPool,
    kind: &str,
    owner_ref: &str,
) -> Result<LedgerAccount> {
    sqlx::query_as::<_, LedgerAccount>(
        r#"
        INSERT INTO ledger_accounts (id, kind, owner_ref, current_quantity, created_at, updated_at)
        VALUES ($1, $2, $3, 0, NOW(), NOW())
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(kind)
    .bind(owner_ref)
    .fetch_one(pool)
    .await
}

pub async fn get_account(pool: &PgPool, id: Uuid) -> Result<Option<LedgerAccount>> {
    sqlx::query_as::<_, LedgerAccount>("SELECT * FROM ledger_accounts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Exclusive row lock for the reconciler write path. Scoped to the single
/// aggregate row; the caller must not hold it across network calls.
pub async fn lock_account(
    executor: &mut SqlxTransaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<LedgerAccount>> {
    sqlx::query_as::<_, LedgerAccount>("SELECT * FROM ledger_accounts WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **executor)
        .await
}

pub async fn lock_account_by_owner(
    executor: &mut SqlxTransaction<'_, Postgres>,
    kind: &str,
    owner_ref: &str,
) -> Result<Option<LedgerAccount>> {
    sqlx::query_as::<_, LedgerAccount>(
        "SELECT * FROM ledger_accounts WHERE kind = $1 AND owner_ref = $2 FOR UPDATE",
    )
    .bind(kind)
    .bind(owner_ref)
    .fetch_optional(&mut **executor)
    .await
}

pub async fn insert_delta(
    executor: &mut SqlxTransaction<'_, Postgres>,
    delta: &LedgerDelta,
) -> Result<LedgerDelta> {
    sqlx::query_as::<_, LedgerDelta>(
        r#"
        INSERT INTO ledger_deltas (id, account_id, amount, reason, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(delta.id)
    .bind(delta.account_id)
    .bind(&delta.amount)
    .bind(&delta.reason)
    .bind(delta.created_at)
    .fetch_one(&mut **executor)
    .await
}

pub async fn sum_deltas_in_tx(
    executor: &mut SqlxTransaction<'_, Postgres>,
    account_id: Uuid,
) -> Result<bigdecimal::BigDecimal> {
    let total: Option<bigdecimal::BigDecimal> = sqlx::query_scalar(
        "SELECT SUM(amount) FROM ledger_deltas WHERE account_id = $1",
    )
    .bind(account_id)
    .fetch_one(&mut **executor)
    .await?;

    Ok(total.unwrap_or_else(|| bigdecimal::BigDecimal::from(0)))
}

pub async fn sum_deltas(pool: &PgPool, account_id: Uuid) -> Result<bigdecimal::BigDecimal> {
    let total: Option<bigdecimal::BigDecimal> = sqlx::query_scalar(
        "SELECT SUM(amount) FROM ledger_deltas WHERE account_id = $1",
    )
    .bind(account_id)
    .fetch_one(pool)
    .await?;

    Ok(total.unwrap_or_else(|| bigdecimal::BigDecimal::from(0)))
}

pub async fn update_account_quantity(
    executor: &mut SqlxTransaction<'_, Postgres>,
    id: Uuid,
    quantity: &bigdecimal::BigDecimal,
) -> Result<LedgerAccount> {
    sqlx::query_as::<_, LedgerAccount>(
        r#"
        UPDATE ledger_accounts
        SET current_quantity = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(quantity)
    .fetch_one(&mut **executor)
    .await
}

// --- Settlement job queries (simulator side) ---

pub async fn insert_job(pool: &PgPool, job: &SettlementJob) -> Result<SettlementJob> {
    sqlx::query_as::<_, SettlementJob>(
        r#"
        INSERT INTO settlement_jobs (
            id, tid, merchant_id, order_ref, amount, status, approval_no, fail_reason,
            callback_url, echo, requested_at, processing_started_at, processed_at,
            webhook_status, webhook_attempts, webhook_last_error, webhook_sent_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        RETURNING *
        "#,
    )
    .bind(job.id)
    .bind(&job.tid)
    .bind(&job.merchant_id)
    .bind(&job.order_ref)
    .bind(&job.amount)
    .bind(&job.status)
    .bind(&job.approval_no)
    .bind(&job.fail_reason)
    .bind(&job.callback_url)
    .bind(&job.echo)
    .bind(job.requested_at)
    .bind(job.processing_started_at)
    .bind(job.processed_at)
    .bind(&job.webhook_status)
    .bind(job.webhook_attempts)
    .bind(&job.webhook_last_error)
    .bind(job.webhook_sent_at)
    .fetch_one(pool)
    .await
}

pub async fn get_job_by_tid(pool: &PgPool, tid: &str) -> Result<Option<SettlementJob>> {
    sqlx::query_as::<_, SettlementJob>("SELECT * FROM settlement_jobs WHERE tid = $1")
        .bind(tid)
        .fetch_optional(pool)
        .await
}

/// Candidates for the polling worker: PENDING rows plus PROCESSING rows
/// whose claim timestamp exceeds the staleness threshold (crashed worker),
/// oldest first, bounded.
pub async fn get_claim_candidates(
    pool: &PgPool,
    limit: i64,
    stale_after_secs: i64,
) -> Result<Vec<SettlementJob>> {
    let stale_cutoff = Utc::now() - Duration::seconds(stale_after_secs);

    sqlx::query_as::<_, SettlementJob>(
        r#"
        SELECT * FROM settlement_jobs
        WHERE status = 'PENDING'
           OR (status = 'PROCESSING' AND processing_started_at < $2)
        ORDER BY requested_at ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .bind(stale_cutoff)
    .fetch_all(pool)
    .await
}

/// CAS claim into PROCESSING. For a stale PROCESSING candidate the expected
/// status is PROCESSING itself, guarded by the old claim timestamp so two
/// sweepers cannot both reclaim it.
pub async fn cas_claim_job(
    pool: &PgPool,
    id: Uuid,
    expected: TransactionStatus,
    expected_claimed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE settlement_jobs
        SET status = 'PROCESSING', processing_started_at = NOW()
        WHERE id = $1 AND status = $2
          AND processing_started_at IS NOT DISTINCT FROM $3
        "#,
    )
    .bind(id)
    .bind(expected.as_str())
    .bind(expected_claimed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn cas_finalize_job(
    pool: &PgPool,
    id: Uuid,
    new: TransactionStatus,
    approval_no: Option<&str>,
    fail_reason: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE settlement_jobs
        SET status = $2, approval_no = $3, fail_reason = $4, processed_at = NOW()
        WHERE id = $1 AND status = 'PROCESSING'
        "#,
    )
    .bind(id)
    .bind(new.as_str())
    .bind(approval_no)
    .bind(fail_reason)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delivery bookkeeping is independent of the settlement decision: a failed
/// webhook never reverts the outcome.
pub async fn record_webhook_outcome(
    pool: &PgPool,
    id: Uuid,
    delivered: bool,
    error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE settlement_jobs
        SET webhook_status = $2,
            webhook_attempts = webhook_attempts + 1,
            webhook_last_error = $3,
            webhook_sent_at = CASE WHEN $4 THEN NOW() ELSE webhook_sent_at END
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(if delivered { "sent" } else { "failed" })
    .bind(error)
    .bind(delivered)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn job_status_counts(
    pool: &PgPool,
) -> Result<std::collections::HashMap<String, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM settlement_jobs GROUP BY status")
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().collect())
}
