use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{SettledStatus, TransactionKind, TransactionStatus};

/// Communication truth: one row per outbound settlement attempt. The
/// `reference` is generated at submission time because the counterparty's
/// own transaction id is unknown until it responds; `external_ref` is
/// assigned once, on ack, and is unique from then on.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub reference: String,
    pub external_ref: Option<String>,
    pub merchant_id: String,
    pub order_ref: String,
    pub kind: String,
    pub amount: BigDecimal,
    pub status: String,
    pub origin_reference: Option<String>,
    pub approval_no: Option<String>,
    pub fail_reason: Option<String>,
    pub callback_url: String,
    pub echo: Option<serde_json::Value>,
    pub requested_at: DateTime<Utc>,
    pub ack_received_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
}

impl TransactionRecord {
    pub fn new(
        merchant_id: String,
        order_ref: String,
        kind: TransactionKind,
        amount: BigDecimal,
        callback_url: String,
        echo: Option<serde_json::Value>,
        origin_reference: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference: generate_reference(&merchant_id),
            external_ref: None,
            merchant_id,
            order_ref,
            kind: kind.as_str().to_string(),
            amount,
            status: TransactionStatus::Pending.as_str().to_string(),
            origin_reference,
            approval_no: None,
            fail_reason: None,
            callback_url,
            echo,
            requested_at: Utc::now(),
            ack_received_at: None,
            processing_started_at: None,
            processed_at: None,
            attempt_count: 0,
        }
    }

    pub fn status(&self) -> Option<TransactionStatus> {
        TransactionStatus::parse(&self.status)
    }

    pub fn kind(&self) -> Option<TransactionKind> {
        TransactionKind::parse(&self.kind)
    }
}

/// Idempotency reference embedding requester, time and randomness, created
/// before any external id exists.
pub fn generate_reference(merchant_id: &str) -> String {
    let date = Utc::now().format("%Y%m%d%H%M%S");
    let nonce: u64 = rand::thread_rng().gen_range(0..0xFFFF_FFFF);
    format!("GW_{}_{}_{:08x}", merchant_id, date, nonce)
}

/// Business truth: materialized only for a definite approved or cancelled
/// outcome, exactly one per terminal SUCCESS record. Failures never get one.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettledTransaction {
    pub id: Uuid,
    pub record_id: Uuid,
    pub merchant_id: String,
    pub order_ref: String,
    pub amount: BigDecimal,
    pub status: String,
    pub approval_no: Option<String>,
    pub origin_settled_id: Option<Uuid>,
    pub settled_at: DateTime<Utc>,
}

impl SettledTransaction {
    pub fn from_record(
        record: &TransactionRecord,
        status: SettledStatus,
        origin_settled_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id: record.id,
            merchant_id: record.merchant_id.clone(),
            order_ref: record.order_ref.clone(),
            amount: record.amount.clone(),
            status: status.as_str().to_string(),
            approval_no: record.approval_no.clone(),
            origin_settled_id,
            settled_at: Utc::now(),
        }
    }
}

/// Aggregate cache. `current_quantity` may only change through the
/// reconciler write path; a direct write bypassing a delta is a
/// correctness violation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: Uuid,
    pub kind: String,
    pub owner_ref: String,
    pub current_quantity: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const ACCOUNT_KIND_STOCK: &str = "product_stock";
pub const ACCOUNT_KIND_BALANCE: &str = "account_balance";

/// One immutable signed quantity change.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerDelta {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: BigDecimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub published_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub consumed_by: String,
    pub processed_at: DateTime<Utc>,
}

/// Simulator-side job: the counterparty's own view of a settlement request.
/// Webhook bookkeeping fields are maintained independently of the
/// settlement decision.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettlementJob {
    pub id: Uuid,
    pub tid: String,
    pub merchant_id: String,
    pub order_ref: String,
    pub amount: BigDecimal,
    pub status: String,
    pub approval_no: Option<String>,
    pub fail_reason: Option<String>,
    pub callback_url: String,
    pub echo: Option<serde_json::Value>,
    pub requested_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub webhook_status: String,
    pub webhook_attempts: i32,
    pub webhook_last_error: Option<String>,
    pub webhook_sent_at: Option<DateTime<Utc>>,
}

impl SettlementJob {
    pub fn new(
        merchant_id: String,
        order_ref: String,
        amount: BigDecimal,
        callback_url: String,
        echo: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tid: generate_tid(),
            merchant_id,
            order_ref,
            amount,
            status: TransactionStatus::Pending.as_str().to_string(),
            approval_no: None,
            fail_reason: None,
            callback_url,
            echo,
            requested_at: Utc::now(),
            processing_started_at: None,
            processed_at: None,
            webhook_status: "none".to_string(),
            webhook_attempts: 0,
            webhook_last_error: None,
            webhook_sent_at: None,
        }
    }
}

pub fn generate_tid() -> String {
    let date = Utc::now().format("%Y%m%d");
    let nonce: u32 = rand::thread_rng().gen_range(10_000_000..100_000_000);
    format!("SIM_{}_{}", date, nonce)
}
