//! Idempotent event consumer. At-most-once effect application on top of an
//! at-least-once bus: a dedup marker is inserted in the same transaction as
//! the effect, and the storage-level unique constraint on the event id is
//! the only lock involved. Any number of concurrent consumer instances is
//! safe.

use bigdecimal::BigDecimal;
use chrono::Utc;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::models::{ProcessedEvent, ACCOUNT_KIND_BALANCE, ACCOUNT_KIND_STOCK};
use crate::db::queries;
use crate::domain::events::{
    KIND_BALANCE_SYNCHRONIZED, KIND_SETTLEMENT_APPROVED, KIND_SETTLEMENT_CANCELLED,
    KIND_SETTLEMENT_FAILED, KIND_STOCK_ADJUSTMENT_REQUESTED, KIND_STOCK_SYNCHRONIZED,
};
use crate::domain::{DomainEvent, EventEnvelope};
use crate::error::AppError;
use crate::ledger::Reconciler;
use crate::outbox::OutboxRecorder;

#[derive(Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Applied,
    /// The marker already existed: a duplicate delivery, absorbed silently.
    Skipped,
}

#[derive(Clone)]
pub struct EventConsumer {
    pool: PgPool,
    reconciler: Reconciler,
    recorder: OutboxRecorder,
    consumer_name: String,
}

impl EventConsumer {
    pub fn new(
        pool: PgPool,
        reconciler: Reconciler,
        recorder: OutboxRecorder,
        consumer_name: &str,
    ) -> Self {
        Self {
            pool,
            reconciler,
            recorder,
            consumer_name: consumer_name.to_string(),
        }
    }

    /// One top-level transaction per inbound event: marker insert, ledger
    /// effect and follow-on outbox events commit together or not at all.
    pub async fn consume(&self, envelope: &EventEnvelope) -> Result<ConsumeOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let marker = ProcessedEvent {
            id: Uuid::new_v4(),
            event_id: envelope.event_id.clone(),
            event_type: envelope.event_type.clone(),
            consumed_by: self.consumer_name.clone(),
            processed_at: Utc::now(),
        };

        if !queries::try_insert_processed_marker(&mut tx, &marker).await? {
            tx.commit().await?;
            debug!(event_id = %envelope.event_id, "event already processed, skipping");
            return Ok(ConsumeOutcome::Skipped);
        }

        self.apply_effect(&mut tx, envelope).await?;
        tx.commit().await?;

        info!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "event applied"
        );
        Ok(ConsumeOutcome::Applied)
    }

    async fn apply_effect(
        &self,
        tx: &mut SqlxTransaction<'_, Postgres>,
        envelope: &EventEnvelope,
    ) -> Result<(), AppError> {
        match envelope.event_type.as_str() {
            KIND_SETTLEMENT_APPROVED => {
                let merchant = required_str(&envelope.payload, "merchantId")?;
                let amount = required_amount(&envelope.payload, "amount")?;

                let account = self
                    .reconciler
                    .apply_delta_by_owner(
                        tx,
                        ACCOUNT_KIND_BALANCE,
                        merchant,
                        amount.clone(),
                        &format!("settlement approved for {}", envelope.aggregate_id),
                    )
                    .await?;

                self.recorder
                    .record(
                        tx,
                        &DomainEvent::new(
                            KIND_BALANCE_SYNCHRONIZED,
                            merchant,
                            json!({
                                "merchantId": merchant,
                                "balance": account.current_quantity.to_string(),
                            }),
                        ),
                    )
                    .await?;
            }
            KIND_SETTLEMENT_CANCELLED => {
                let merchant = required_str(&envelope.payload, "merchantId")?;
                let amount = required_amount(&envelope.payload, "amount")?;

                let account = self
                    .reconciler
                    .apply_delta_by_owner(
                        tx,
                        ACCOUNT_KIND_BALANCE,
                        merchant,
                        -amount.clone(),
                        &format!("settlement cancelled for {}", envelope.aggregate_id),
                    )
                    .await?;

                self.recorder
                    .record(
                        tx,
                        &DomainEvent::new(
                            KIND_BALANCE_SYNCHRONIZED,
                            merchant,
                            json!({
                                "merchantId": merchant,
                                "balance": account.current_quantity.to_string(),
                            }),
                        ),
                    )
                    .await?;
            }
            KIND_STOCK_ADJUSTMENT_REQUESTED => {
                let product = required_str(&envelope.payload, "productRef")?;
                let delta = required_amount(&envelope.payload, "delta")?;
                let reason = envelope.payload["reason"]
                    .as_str()
                    .unwrap_or("stock adjustment")
                    .to_string();

                let account = self
                    .reconciler
                    .apply_delta_by_owner(tx, ACCOUNT_KIND_STOCK, product, delta, &reason)
                    .await?;

                self.recorder
                    .record(
                        tx,
                        &DomainEvent::new(
                            KIND_STOCK_SYNCHRONIZED,
                            product,
                            json!({
                                "productRef": product,
                                "stock": account.current_quantity.to_string(),
                            }),
                        ),
                    )
                    .await?;
            }
            KIND_SETTLEMENT_FAILED => {
                // Nothing to reconcile; the marker alone records the fact.
                debug!(aggregate_id = %envelope.aggregate_id, "settlement failure recorded");
            }
            other => {
                warn!(event_type = other, "no handler for event kind, marker recorded");
            }
        }

        Ok(())
    }
}

fn required_str<'a>(payload: &'a serde_json::Value, field: &str) -> Result<&'a str, AppError> {
    payload[field]
        .as_str()
        .ok_or_else(|| AppError::Validation(format!("event payload missing '{}'", field)))
}

fn required_amount(payload: &serde_json::Value, field: &str) -> Result<BigDecimal, AppError> {
    let raw = match &payload[field] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => {
            return Err(AppError::Validation(format!(
                "event payload missing '{}'",
                field
            )))
        }
    };

    BigDecimal::from_str(&raw)
        .map_err(|_| AppError::Validation(format!("'{}' is not a valid amount: {}", field, raw)))
}
