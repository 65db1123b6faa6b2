//! Settlement simulator: the counterparty side of the pipeline. Accepts a
//! request with an immediate acknowledgement (not a result), then a
//! fixed-interval polling worker CAS-claims PENDING jobs, resolves an
//! outcome and delivers a signed webhook. Multiple worker instances may run
//! against the same pool; correctness rests on the CAS row updates alone.

use bigdecimal::BigDecimal;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::db::models::SettlementJob;
use crate::db::queries;
use crate::domain::TransactionStatus;
use crate::error::AppError;
use crate::webhook::{self, WebhookPayload};

const FAIL_REASONS: &[&str] = &[
    "INSUFFICIENT_BALANCE",
    "INVALID_CARD",
    "EXPIRED_CARD",
    "LIMIT_EXCEEDED",
    "SYSTEM_ERROR",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Approved { approval_no: String },
    Declined { reason: String },
}

/// Decides how a claimed job settles. Injected so tests can force either
/// outcome; the default mimics a real counterparty with a configured
/// approval rate.
pub trait SettlementDecider: Send + Sync {
    fn decide(&self, job: &SettlementJob) -> SettlementOutcome;
}

pub struct RandomDecider {
    approval_rate: u8,
}

impl RandomDecider {
    pub fn new(approval_rate: u8) -> Self {
        Self { approval_rate }
    }
}

impl SettlementDecider for RandomDecider {
    fn decide(&self, _job: &SettlementJob) -> SettlementOutcome {
        let mut rng = rand::thread_rng();
        if rng.gen_range(0..100) < self.approval_rate {
            SettlementOutcome::Approved {
                approval_no: format!("AP{}", Utc::now().timestamp_millis()),
            }
        } else {
            let reason = FAIL_REASONS[rng.gen_range(0..FAIL_REASONS.len())];
            SettlementOutcome::Declined {
                reason: reason.to_string(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequest {
    pub merchant_id: String,
    pub order_ref: String,
    pub amount: BigDecimal,
    pub callback_url: String,
    pub echo: Option<serde_json::Value>,
}

/// Acknowledgement only: the definite result arrives later via webhook.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptResponse {
    pub status: String,
    pub code: String,
    pub transaction_id: String,
    pub amount: BigDecimal,
    pub echo: Option<serde_json::Value>,
    pub message: String,
}

#[derive(Clone)]
pub struct Simulator {
    pool: PgPool,
    decider: Arc<dyn SettlementDecider>,
    client: reqwest::Client,
    webhook_secret: String,
    batch_size: i64,
    stale_claim_secs: i64,
}

impl Simulator {
    pub fn new(
        pool: PgPool,
        decider: Arc<dyn SettlementDecider>,
        webhook_secret: String,
        webhook_timeout: Duration,
        batch_size: i64,
        stale_claim_secs: i64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(webhook_timeout).build()?;
        Ok(Self {
            pool,
            decider,
            client,
            webhook_secret,
            batch_size,
            stale_claim_secs,
        })
    }

    /// Accept a settlement request: persist PENDING, ack immediately.
    pub async fn accept(&self, request: AcceptRequest) -> Result<AcceptResponse, AppError> {
        if request.amount <= BigDecimal::from(0) {
            return Err(AppError::Validation("amount must be positive".to_string()));
        }
        url::Url::parse(&request.callback_url)
            .map_err(|_| AppError::Validation("callbackUrl is not a valid URL".to_string()))?;

        let job = SettlementJob::new(
            request.merchant_id,
            request.order_ref,
            request.amount,
            request.callback_url,
            request.echo,
        );
        let inserted = queries::insert_job(&self.pool, &job).await?;

        info!(
            tid = %inserted.tid,
            order_ref = %inserted.order_ref,
            amount = %inserted.amount,
            "settlement request accepted"
        );

        Ok(AcceptResponse {
            status: "PENDING".to_string(),
            code: "ACK_OK".to_string(),
            transaction_id: inserted.tid,
            amount: inserted.amount,
            echo: inserted.echo,
            message: "Settlement request received and processing".to_string(),
        })
    }

    /// Polling worker loop. Fixed-delay semantics: the next pass starts
    /// only after the previous one finished.
    pub async fn run(self, poll_interval: Duration) {
        info!("Settlement polling worker started");
        loop {
            if let Err(e) = self.process_batch().await {
                error!("Settlement batch error: {}", e);
            }
            sleep(poll_interval).await;
        }
    }

    /// One polling pass: claim-and-settle an oldest-first bounded batch of
    /// PENDING jobs plus stale PROCESSING leftovers from crashed workers.
    /// A losing CAS just moves on to the next candidate.
    pub async fn process_batch(&self) -> anyhow::Result<usize> {
        let candidates =
            queries::get_claim_candidates(&self.pool, self.batch_size, self.stale_claim_secs)
                .await?;

        if candidates.is_empty() {
            return Ok(0);
        }

        debug!("Processing {} settlement candidate(s)", candidates.len());
        let mut settled = 0usize;

        for job in candidates {
            match self.settle_one(&job).await {
                Ok(true) => settled += 1,
                Ok(false) => {} // lost the claim race
                Err(e) => {
                    error!(tid = %job.tid, "failed to settle job: {}", e);
                }
            }
        }

        Ok(settled)
    }

    async fn settle_one(&self, job: &SettlementJob) -> anyhow::Result<bool> {
        let expected = TransactionStatus::parse(&job.status)
            .ok_or_else(|| anyhow::anyhow!("unknown job status {}", job.status))?;

        let claimed = queries::cas_claim_job(
            &self.pool,
            job.id,
            expected,
            job.processing_started_at,
        )
        .await?;

        if claimed == 0 {
            debug!(tid = %job.tid, "job already claimed by another worker");
            return Ok(false);
        }

        let outcome = self.decider.decide(job);
        let finalized = match &outcome {
            SettlementOutcome::Approved { approval_no } => {
                queries::cas_finalize_job(
                    &self.pool,
                    job.id,
                    TransactionStatus::Success,
                    Some(approval_no),
                    None,
                )
                .await?
            }
            SettlementOutcome::Declined { reason } => {
                queries::cas_finalize_job(
                    &self.pool,
                    job.id,
                    TransactionStatus::Failed,
                    None,
                    Some(reason),
                )
                .await?
            }
        };

        if finalized == 0 {
            debug!(tid = %job.tid, "finalize CAS lost, job already settled");
            return Ok(false);
        }

        match &outcome {
            SettlementOutcome::Approved { approval_no } => {
                info!(tid = %job.tid, approval_no, "settlement approved");
            }
            SettlementOutcome::Declined { reason } => {
                warn!(tid = %job.tid, reason, "settlement declined");
            }
        }

        // Fire-and-forget: the webhook holds no storage lock and its
        // failure never reverts the settlement outcome.
        let delivery = WebhookDelivery {
            pool: self.pool.clone(),
            client: self.client.clone(),
            secret: self.webhook_secret.clone(),
        };
        let job = job.clone();
        tokio::spawn(async move {
            delivery.deliver(&job, &outcome).await;
        });

        Ok(true)
    }

    /// Operational aid: force re-delivery for an already settled tid.
    pub async fn resend_webhook(&self, tid: &str) -> Result<(), AppError> {
        let job = queries::get_job_by_tid(&self.pool, tid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("settlement job {}", tid)))?;

        let outcome = match TransactionStatus::parse(&job.status) {
            Some(TransactionStatus::Success) => SettlementOutcome::Approved {
                approval_no: job.approval_no.clone().unwrap_or_default(),
            },
            Some(TransactionStatus::Failed) => SettlementOutcome::Declined {
                reason: job
                    .fail_reason
                    .clone()
                    .unwrap_or_else(|| "SYSTEM_ERROR".to_string()),
            },
            _ => {
                return Err(AppError::InvalidState(format!(
                    "job {} is not settled yet",
                    tid
                )))
            }
        };

        let delivery = WebhookDelivery {
            pool: self.pool.clone(),
            client: self.client.clone(),
            secret: self.webhook_secret.clone(),
        };
        delivery.deliver(&job, &outcome).await;
        Ok(())
    }
}

struct WebhookDelivery {
    pool: PgPool,
    client: reqwest::Client,
    secret: String,
}

impl WebhookDelivery {
    async fn deliver(&self, job: &SettlementJob, outcome: &SettlementOutcome) {
        let payload = build_payload(job, outcome);

        let result = self.post(&job.callback_url, &payload).await;
        let (delivered, error) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        if let Some(err) = &error {
            warn!(tid = %job.tid, url = %job.callback_url, "webhook delivery failed: {}", err);
        } else {
            info!(tid = %job.tid, url = %job.callback_url, "webhook delivered");
        }

        if let Err(e) =
            queries::record_webhook_outcome(&self.pool, job.id, delivered, error.as_deref()).await
        {
            error!(tid = %job.tid, "failed to record webhook outcome: {}", e);
        }
    }

    async fn post(&self, url: &str, payload: &WebhookPayload) -> anyhow::Result<()> {
        let body = serde_json::to_vec(payload)?;
        let signature = webhook::sign(&self.secret, &body);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(webhook::SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("callback returned status {}", response.status());
        }
        Ok(())
    }
}

pub fn build_payload(job: &SettlementJob, outcome: &SettlementOutcome) -> WebhookPayload {
    match outcome {
        SettlementOutcome::Approved { approval_no } => WebhookPayload {
            status: "SUCCESS".to_string(),
            code: "0000".to_string(),
            transaction_id: job.tid.clone(),
            approval_no: Some(approval_no.clone()),
            amount: job.amount.clone(),
            echo: job.echo.clone(),
            message: "Settlement approved successfully".to_string(),
        },
        SettlementOutcome::Declined { reason } => WebhookPayload {
            status: "FAILED".to_string(),
            code: "E001".to_string(),
            transaction_id: job.tid.clone(),
            approval_no: None,
            amount: job.amount.clone(),
            echo: job.echo.clone(),
            message: format!("Settlement failed: {}", reason),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> SettlementJob {
        SettlementJob::new(
            "merchant-1".to_string(),
            "order-1".to_string(),
            BigDecimal::from(10_000),
            "http://localhost/cb".to_string(),
            Some(serde_json::json!({"reference": "GW_m1_ref"})),
        )
    }

    #[test]
    fn test_random_decider_always_approves_at_100() {
        let decider = RandomDecider::new(100);
        for _ in 0..50 {
            assert!(matches!(
                decider.decide(&job()),
                SettlementOutcome::Approved { .. }
            ));
        }
    }

    #[test]
    fn test_random_decider_always_declines_at_0() {
        let decider = RandomDecider::new(0);
        for _ in 0..50 {
            match decider.decide(&job()) {
                SettlementOutcome::Declined { reason } => {
                    assert!(FAIL_REASONS.contains(&reason.as_str()));
                }
                other => panic!("expected decline, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_approved_payload_shape() {
        let job = job();
        let payload = build_payload(
            &job,
            &SettlementOutcome::Approved {
                approval_no: "AP42".to_string(),
            },
        );
        assert_eq!(payload.status, "SUCCESS");
        assert_eq!(payload.code, "0000");
        assert_eq!(payload.transaction_id, job.tid);
        assert_eq!(payload.approval_no.as_deref(), Some("AP42"));
        assert_eq!(payload.echoed_reference(), Some("GW_m1_ref"));
    }

    #[test]
    fn test_declined_payload_has_no_approval() {
        let payload = build_payload(
            &job(),
            &SettlementOutcome::Declined {
                reason: "LIMIT_EXCEEDED".to_string(),
            },
        );
        assert_eq!(payload.status, "FAILED");
        assert!(payload.approval_no.is_none());
        assert!(payload.message.contains("LIMIT_EXCEEDED"));
    }
}
