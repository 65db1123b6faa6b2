//! Gateway client: the requester side of the pipeline. Owns the
//! communication-truth records, submits settlement requests to the
//! counterparty, and routes inbound webhooks back into the transaction
//! state machine, materializing business truth on definite outcomes.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::models::{SettledTransaction, TransactionRecord};
use crate::db::queries;
use crate::domain::events::{
    KIND_SETTLEMENT_APPROVED, KIND_SETTLEMENT_CANCELLED, KIND_SETTLEMENT_FAILED,
};
use crate::domain::{DomainEvent, SettledStatus, TransactionKind, TransactionStatus};
use crate::error::AppError;
use crate::outbox::OutboxRecorder;
use crate::webhook::WebhookPayload;

pub const CODE_ACK_OK: &str = "ACK_OK";
pub const CODE_GATEWAY_UNREACHABLE: &str = "PG_UNREACHABLE";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub merchant_id: String,
    pub order_ref: String,
    pub amount: BigDecimal,
    /// Where the counterparty should deliver the settlement webhook.
    /// Defaults to this service's own callback route.
    pub callback_url: Option<String>,
    pub echo: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub status: String,
    pub code: String,
    pub generated_transaction_id: String,
    pub amount: BigDecimal,
    pub echo: Option<serde_json::Value>,
    pub message: String,
}

/// Ack shape returned by the counterparty's accept endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CounterpartyAck {
    #[allow(dead_code)]
    status: String,
    #[allow(dead_code)]
    code: String,
    transaction_id: String,
}

#[derive(Debug)]
pub enum WebhookResult {
    Finalized(TransactionRecord),
    /// The record was already terminal: a duplicate delivery, absorbed.
    Duplicate,
}

#[derive(Clone)]
pub struct GatewayClient {
    pool: PgPool,
    client: reqwest::Client,
    gateway_base_url: String,
    default_callback_url: String,
    recorder: OutboxRecorder,
}

impl GatewayClient {
    pub fn new(
        pool: PgPool,
        gateway_base_url: String,
        default_callback_url: String,
        recorder: OutboxRecorder,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            pool,
            client,
            gateway_base_url,
            default_callback_url,
            recorder,
        })
    }

    /// Submit a settlement request. The record (with its generated
    /// idempotency reference) is committed before the outbound call so an
    /// early webhook can always be resolved; the counterparty's id is
    /// attached once the ack arrives.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, AppError> {
        if request.amount <= BigDecimal::from(0) {
            return Err(AppError::Validation("amount must be positive".to_string()));
        }
        if request.merchant_id.is_empty() || request.order_ref.is_empty() {
            return Err(AppError::Validation(
                "merchantId and orderRef are required".to_string(),
            ));
        }

        let callback_url = request
            .callback_url
            .clone()
            .unwrap_or_else(|| self.default_callback_url.clone());
        url::Url::parse(&callback_url)
            .map_err(|_| AppError::Validation("callbackUrl is not a valid URL".to_string()))?;

        let record = TransactionRecord::new(
            request.merchant_id,
            request.order_ref,
            TransactionKind::Approve,
            request.amount,
            callback_url,
            request.echo,
            None,
        );

        self.submit_record(record).await
    }

    /// Submit a cancellation for a previously approved settlement. Creates
    /// a fresh cancel record referencing the origin; the outcome arrives by
    /// webhook like any other settlement.
    pub async fn submit_cancel(&self, origin_reference: &str) -> Result<SubmitResponse, AppError> {
        let origin = queries::get_settled_for_reference(&self.pool, origin_reference)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("no settled transaction for {}", origin_reference))
            })?;

        if SettledStatus::parse(&origin.status) != Some(SettledStatus::Approved) {
            return Err(AppError::InvalidState(format!(
                "settled transaction for {} is {}, not APPROVED",
                origin_reference, origin.status
            )));
        }

        // A settled transaction may be cancelled at most once.
        if queries::get_cancellation_for_settled(&self.pool, origin.id)
            .await?
            .is_some()
        {
            return Err(AppError::InvalidState(format!(
                "settled transaction for {} is already cancelled",
                origin_reference
            )));
        }
        if queries::find_active_cancel_record(&self.pool, origin_reference)
            .await?
            .is_some()
        {
            return Err(AppError::InvalidState(format!(
                "a cancellation for {} is already in flight",
                origin_reference
            )));
        }

        let origin_record = queries::get_record_by_reference(&self.pool, origin_reference)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("record {}", origin_reference)))?;

        let record = TransactionRecord::new(
            origin.merchant_id.clone(),
            origin.order_ref.clone(),
            TransactionKind::Cancel,
            origin.amount.clone(),
            origin_record.callback_url.clone(),
            None,
            Some(origin_reference.to_string()),
        );

        self.submit_record(record).await
    }

    async fn submit_record(&self, record: TransactionRecord) -> Result<SubmitResponse, AppError> {
        let mut tx = self.pool.begin().await?;
        let record = queries::insert_record(&mut tx, &record).await?;
        tx.commit().await?;

        info!(
            reference = %record.reference,
            order_ref = %record.order_ref,
            kind = %record.kind,
            amount = %record.amount,
            "settlement request recorded"
        );

        // Our reference rides along in the echo so the webhook can resolve
        // the record even if it beats the ack.
        let mut echo = record.echo.clone().unwrap_or_else(|| json!({}));
        echo["reference"] = json!(record.reference);

        let accept_url = format!(
            "{}/pg/transactions",
            self.gateway_base_url.trim_end_matches('/')
        );
        let body = json!({
            "merchantId": record.merchant_id,
            "orderRef": record.order_ref,
            "amount": record.amount.to_string(),
            "callbackUrl": record.callback_url,
            "echo": echo,
        });

        match self.request_ack(&accept_url, &body).await {
            Ok(ack) => {
                let updated =
                    queries::mark_acknowledged(&self.pool, record.id, &ack.transaction_id).await?;
                if updated == 0 {
                    // The webhook finalized the record before the ack
                    // landed; the external ref it carried already won.
                    warn!(reference = %record.reference, "ack arrived after finalization");
                }

                Ok(SubmitResponse {
                    status: TransactionStatus::Pending.as_str().to_string(),
                    code: CODE_ACK_OK.to_string(),
                    generated_transaction_id: record.reference,
                    amount: record.amount,
                    echo: record.echo,
                    message: "Settlement request accepted".to_string(),
                })
            }
            Err(e) => {
                // The counterparty is unreachable; record the failure and
                // answer without blocking on retries. The caller resubmits
                // on its own schedule.
                error!(reference = %record.reference, "counterparty call failed: {}", e);
                queries::cas_fail_record(
                    &self.pool,
                    record.id,
                    TransactionStatus::Pending,
                    CODE_GATEWAY_UNREACHABLE,
                )
                .await?;

                Ok(SubmitResponse {
                    status: TransactionStatus::Failed.as_str().to_string(),
                    code: CODE_GATEWAY_UNREACHABLE.to_string(),
                    generated_transaction_id: record.reference,
                    amount: record.amount,
                    echo: record.echo,
                    message: "Counterparty unreachable, request not settled".to_string(),
                })
            }
        }
    }

    async fn request_ack(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<CounterpartyAck> {
        let response = self.client.post(url).json(body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("accept endpoint returned status {}", response.status());
        }
        Ok(response.json::<CounterpartyAck>().await?)
    }

    /// Route an inbound settlement webhook into the state machine.
    ///
    /// Resolution is by exact reference only: the echoed gateway reference
    /// first, then the counterparty's transaction id. A payload matching
    /// neither is a data-integrity anomaly: logged and rejected with a
    /// client error so the sender's retry policy applies. A CAS miss on
    /// finalization means the record was already terminal; the duplicate
    /// is absorbed silently.
    pub async fn handle_webhook(&self, payload: &WebhookPayload) -> Result<WebhookResult, AppError> {
        let mut tx = self.pool.begin().await?;

        let record = queries::resolve_record(
            &mut tx,
            payload.echoed_reference(),
            &payload.transaction_id,
        )
        .await?
        .ok_or_else(|| {
            error!(
                transaction_id = %payload.transaction_id,
                "webhook cannot be resolved to any transaction record"
            );
            AppError::UnresolvableWebhook(payload.transaction_id.clone())
        })?;

        // Webhook may beat the ack; attach the external id while the
        // record is still PENDING.
        if record.external_ref.is_none() {
            sqlx::query(
                r#"
                UPDATE transaction_records SET external_ref = $2
                WHERE id = $1 AND external_ref IS NULL AND status = 'PENDING'
                "#,
            )
            .bind(record.id)
            .bind(&payload.transaction_id)
            .execute(&mut *tx)
            .await?;
        }

        let (new_status, approval_no, fail_reason) = match payload.status.as_str() {
            "SUCCESS" => (
                TransactionStatus::Success,
                payload.approval_no.as_deref(),
                None,
            ),
            "FAILED" => (
                TransactionStatus::Failed,
                None,
                Some(payload.message.as_str()),
            ),
            other => {
                return Err(AppError::BadRequest(format!(
                    "unknown webhook status {}",
                    other
                )))
            }
        };

        let updated = queries::cas_finalize_record(
            &mut tx,
            record.id,
            TransactionStatus::Pending,
            new_status,
            approval_no,
            fail_reason,
        )
        .await?;

        if updated == 0 {
            // Already terminal: same webhook delivered twice.
            tx.commit().await?;
            info!(reference = %record.reference, "duplicate webhook absorbed");
            return Ok(WebhookResult::Duplicate);
        }

        let mut record = record;
        record.status = new_status.as_str().to_string();
        record.approval_no = approval_no.map(str::to_string);
        record.fail_reason = fail_reason.map(str::to_string);

        match new_status {
            TransactionStatus::Success => {
                let settled = self.materialize_settled(&mut tx, &record).await?;
                let kind = match SettledStatus::parse(&settled.status) {
                    Some(SettledStatus::Cancelled) => KIND_SETTLEMENT_CANCELLED,
                    _ => KIND_SETTLEMENT_APPROVED,
                };
                self.recorder
                    .record(
                        &mut tx,
                        &DomainEvent::new(
                            kind,
                            &record.order_ref,
                            json!({
                                "merchantId": record.merchant_id,
                                "orderRef": record.order_ref,
                                "amount": record.amount.to_string(),
                                "reference": record.reference,
                                "settledId": settled.id,
                            }),
                        ),
                    )
                    .await?;
            }
            TransactionStatus::Failed => {
                // Failures stay communication-truth only; no settled row.
                self.recorder
                    .record(
                        &mut tx,
                        &DomainEvent::new(
                            KIND_SETTLEMENT_FAILED,
                            &record.order_ref,
                            json!({
                                "merchantId": record.merchant_id,
                                "orderRef": record.order_ref,
                                "amount": record.amount.to_string(),
                                "reference": record.reference,
                                "reason": record.fail_reason,
                            }),
                        ),
                    )
                    .await?;
            }
            _ => unreachable!("webhook finalization only targets terminal states"),
        }

        tx.commit().await?;
        info!(
            reference = %record.reference,
            status = %record.status,
            "settlement webhook finalized"
        );
        Ok(WebhookResult::Finalized(record))
    }

    async fn materialize_settled(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &TransactionRecord,
    ) -> Result<SettledTransaction, AppError> {
        let (status, origin_settled_id) = match record.kind() {
            Some(TransactionKind::Cancel) => {
                let origin_reference = record.origin_reference.as_deref().ok_or_else(|| {
                    AppError::Internal(format!(
                        "cancel record {} has no origin reference",
                        record.reference
                    ))
                })?;
                let origin =
                    queries::get_settled_for_reference_in_tx(tx, origin_reference)
                        .await?
                        .ok_or_else(|| {
                            AppError::Internal(format!(
                                "origin settled transaction missing for {}",
                                origin_reference
                            ))
                        })?;

                // Racing cancel webhooks: the loser rolls back here; the
                // unique index on origin_settled_id backstops this check.
                if queries::get_cancellation_for_settled_in_tx(tx, origin.id)
                    .await?
                    .is_some()
                {
                    return Err(AppError::InvalidState(format!(
                        "settled transaction for {} is already cancelled",
                        origin_reference
                    )));
                }

                (SettledStatus::Cancelled, Some(origin.id))
            }
            _ => (SettledStatus::Approved, None),
        };

        let settled = SettledTransaction::from_record(record, status, origin_settled_id);
        Ok(queries::insert_settled(tx, &settled).await?)
    }

    pub async fn get_status(
        &self,
        reference: &str,
    ) -> Result<(TransactionRecord, Option<SettledTransaction>), AppError> {
        let record = queries::get_record_by_reference(&self.pool, reference)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("transaction {}", reference)))?;
        let settled = queries::get_settled_by_record(&self.pool, record.id).await?;
        Ok((record, settled))
    }
}
