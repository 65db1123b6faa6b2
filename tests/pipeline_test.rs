//! End-to-end pipeline tests against a real Postgres. Each test skips
//! cleanly when DATABASE_URL is not set so the suite stays runnable
//! without infrastructure.

use bigdecimal::BigDecimal;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use settlecore::db::models::SettlementJob;
use settlecore::db::queries;
use settlecore::domain::{EventRouter, TransactionStatus};
use settlecore::gateway::{GatewayClient, SubmitRequest, WebhookResult};
use settlecore::outbox::OutboxRecorder;
use settlecore::simulator::{build_payload, SettlementOutcome};
use settlecore::webhook;

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

fn gateway(pool: PgPool, base_url: &str) -> GatewayClient {
    GatewayClient::new(
        pool,
        base_url.to_string(),
        "http://127.0.0.1:3000/callbacks/settlement".to_string(),
        OutboxRecorder::new(EventRouter::standard()),
        Duration::from_secs(2),
    )
    .expect("gateway client")
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

#[tokio::test]
async fn test_submit_records_pending_and_acks() {
    let Some(pool) = test_pool().await else { return };

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/pg/transactions")
        .with_status(202)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status":"PENDING","code":"ACK_OK","transactionId":"SIM_TEST_1"}"#)
        .create_async()
        .await;

    let gateway = gateway(pool.clone(), &server.url());
    let order_ref = unique("order");
    let response = gateway
        .submit(SubmitRequest {
            merchant_id: unique("merchant"),
            order_ref: order_ref.clone(),
            amount: BigDecimal::from(10_000),
            callback_url: None,
            echo: None,
        })
        .await
        .expect("submit");

    assert_eq!(response.status, "PENDING");
    assert_eq!(response.code, "ACK_OK");

    let record = queries::get_record_by_reference(&pool, &response.generated_transaction_id)
        .await
        .expect("query")
        .expect("record exists");
    assert_eq!(record.status, "PENDING");
    assert_eq!(record.external_ref.as_deref(), Some("SIM_TEST_1"));
    assert!(record.ack_received_at.is_some());
}

#[tokio::test]
async fn test_submit_marks_failed_when_counterparty_unreachable() {
    let Some(pool) = test_pool().await else { return };

    // Nothing listens on this port.
    let gateway = gateway(pool.clone(), "http://127.0.0.1:1");
    let response = gateway
        .submit(SubmitRequest {
            merchant_id: unique("merchant"),
            order_ref: unique("order"),
            amount: BigDecimal::from(500),
            callback_url: None,
            echo: None,
        })
        .await
        .expect("submit resolves without error");

    assert_eq!(response.status, "FAILED");
    assert_eq!(response.code, "PG_UNREACHABLE");

    let record = queries::get_record_by_reference(&pool, &response.generated_transaction_id)
        .await
        .expect("query")
        .expect("record exists");
    assert_eq!(record.status, "FAILED");
    assert_eq!(record.fail_reason.as_deref(), Some("PG_UNREACHABLE"));
}

#[tokio::test]
async fn test_webhook_success_materializes_settled_and_outbox() {
    let Some(pool) = test_pool().await else { return };

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/pg/transactions")
        .with_status(202)
        .with_body(r#"{"status":"PENDING","code":"ACK_OK","transactionId":"SIM_TEST_OK"}"#)
        .create_async()
        .await;

    let gateway = gateway(pool.clone(), &server.url());
    let response = gateway
        .submit(SubmitRequest {
            merchant_id: unique("merchant"),
            order_ref: unique("order"),
            amount: BigDecimal::from(25_000),
            callback_url: None,
            echo: None,
        })
        .await
        .expect("submit");
    let reference = response.generated_transaction_id.clone();

    let payload = settlecore::webhook::WebhookPayload {
        status: "SUCCESS".to_string(),
        code: "0000".to_string(),
        transaction_id: "SIM_TEST_OK".to_string(),
        approval_no: Some("AP777".to_string()),
        amount: BigDecimal::from(25_000),
        echo: Some(serde_json::json!({"reference": reference})),
        message: "approved".to_string(),
    };

    let result = gateway.handle_webhook(&payload).await.expect("webhook");
    let WebhookResult::Finalized(record) = result else {
        panic!("expected finalization, got duplicate");
    };
    assert_eq!(record.status, "SUCCESS");
    assert_eq!(record.approval_no.as_deref(), Some("AP777"));

    let settled = queries::get_settled_by_record(&pool, record.id)
        .await
        .expect("query")
        .expect("settled row exists");
    assert_eq!(settled.status, "APPROVED");

    // Duplicate delivery is absorbed, no second settled row.
    let result = gateway.handle_webhook(&payload).await.expect("redelivery");
    assert!(matches!(result, WebhookResult::Duplicate));

    let still_one: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM settled_transactions WHERE record_id = $1")
            .bind(record.id)
            .fetch_one(&pool)
            .await
            .expect("count");
    assert_eq!(still_one, 1);

    // The approval event landed in the outbox as PENDING.
    let pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox_events WHERE aggregate_id = $1 AND event_type = 'settlement.approved'",
    )
    .bind(&record.order_ref)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn test_webhook_failure_keeps_communication_truth_only() {
    let Some(pool) = test_pool().await else { return };

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/pg/transactions")
        .with_status(202)
        .with_body(r#"{"status":"PENDING","code":"ACK_OK","transactionId":"SIM_TEST_NG"}"#)
        .create_async()
        .await;

    let gateway = gateway(pool.clone(), &server.url());
    let response = gateway
        .submit(SubmitRequest {
            merchant_id: unique("merchant"),
            order_ref: unique("order"),
            amount: BigDecimal::from(100),
            callback_url: None,
            echo: None,
        })
        .await
        .expect("submit");

    let payload = settlecore::webhook::WebhookPayload {
        status: "FAILED".to_string(),
        code: "E001".to_string(),
        transaction_id: "SIM_TEST_NG".to_string(),
        approval_no: None,
        amount: BigDecimal::from(100),
        echo: Some(serde_json::json!({"reference": response.generated_transaction_id})),
        message: "Settlement failed: LIMIT_EXCEEDED".to_string(),
    };

    let WebhookResult::Finalized(record) = gateway.handle_webhook(&payload).await.expect("webhook")
    else {
        panic!("expected finalization");
    };
    assert_eq!(record.status, "FAILED");

    let settled = queries::get_settled_by_record(&pool, record.id)
        .await
        .expect("query");
    assert!(settled.is_none(), "failures must not materialize settled rows");
}

#[tokio::test]
async fn test_cancellation_links_origin_and_cannot_repeat() {
    let Some(pool) = test_pool().await else { return };

    let tid_approve = format!("SIM_CXL_A_{}", Uuid::new_v4().simple());
    let tid_cancel = format!("SIM_CXL_C_{}", Uuid::new_v4().simple());

    // Approve leg.
    let mut approve_server = mockito::Server::new_async().await;
    let _approve_ack = approve_server
        .mock("POST", "/pg/transactions")
        .with_status(202)
        .with_body(format!(
            r#"{{"status":"PENDING","code":"ACK_OK","transactionId":"{}"}}"#,
            tid_approve
        ))
        .create_async()
        .await;

    let gateway_approve = gateway(pool.clone(), &approve_server.url());
    let submitted = gateway_approve
        .submit(SubmitRequest {
            merchant_id: unique("merchant"),
            order_ref: unique("order"),
            amount: BigDecimal::from(40_000),
            callback_url: None,
            echo: None,
        })
        .await
        .expect("submit");
    let reference = submitted.generated_transaction_id.clone();

    let approve_payload = settlecore::webhook::WebhookPayload {
        status: "SUCCESS".to_string(),
        code: "0000".to_string(),
        transaction_id: tid_approve,
        approval_no: Some("AP100".to_string()),
        amount: BigDecimal::from(40_000),
        echo: Some(serde_json::json!({"reference": reference})),
        message: "approved".to_string(),
    };
    let WebhookResult::Finalized(record) = gateway_approve
        .handle_webhook(&approve_payload)
        .await
        .expect("approve webhook")
    else {
        panic!("expected finalization");
    };
    let approved = queries::get_settled_by_record(&pool, record.id)
        .await
        .expect("query")
        .expect("approved settled row");
    assert_eq!(approved.status, "APPROVED");

    // Cancel leg: new counterparty ack, same pool.
    let mut cancel_server = mockito::Server::new_async().await;
    let _cancel_ack = cancel_server
        .mock("POST", "/pg/transactions")
        .with_status(202)
        .with_body(format!(
            r#"{{"status":"PENDING","code":"ACK_OK","transactionId":"{}"}}"#,
            tid_cancel
        ))
        .create_async()
        .await;

    let gateway_cancel = gateway(pool.clone(), &cancel_server.url());
    let cancel = gateway_cancel
        .submit_cancel(&reference)
        .await
        .expect("submit cancel");
    assert_eq!(cancel.status, "PENDING");

    let cancel_record = queries::get_record_by_reference(&pool, &cancel.generated_transaction_id)
        .await
        .expect("query")
        .expect("cancel record");
    assert_eq!(cancel_record.kind, "cancel");
    assert_eq!(cancel_record.origin_reference.as_deref(), Some(reference.as_str()));

    // While the cancel is in flight, a second one is refused.
    let err = gateway_cancel
        .submit_cancel(&reference)
        .await
        .expect_err("in-flight cancel must block a second one");
    assert!(matches!(err, settlecore::error::AppError::InvalidState(_)));

    let cancel_payload = settlecore::webhook::WebhookPayload {
        status: "SUCCESS".to_string(),
        code: "0000".to_string(),
        transaction_id: tid_cancel,
        approval_no: Some("AP101".to_string()),
        amount: BigDecimal::from(40_000),
        echo: Some(serde_json::json!({"reference": cancel.generated_transaction_id})),
        message: "cancelled".to_string(),
    };
    let WebhookResult::Finalized(finalized) = gateway_cancel
        .handle_webhook(&cancel_payload)
        .await
        .expect("cancel webhook")
    else {
        panic!("expected finalization");
    };

    let cancelled = queries::get_settled_by_record(&pool, finalized.id)
        .await
        .expect("query")
        .expect("cancelled settled row");
    assert_eq!(cancelled.status, "CANCELLED");
    assert_eq!(cancelled.origin_settled_id, Some(approved.id));

    let emitted: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox_events WHERE aggregate_id = $1 AND event_type = 'settlement.cancelled'",
    )
    .bind(&record.order_ref)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(emitted, 1);

    // Once cancelled, the origin can never be cancelled again.
    let err = gateway_cancel
        .submit_cancel(&reference)
        .await
        .expect_err("cancelled origin must not cancel again");
    assert!(matches!(err, settlecore::error::AppError::InvalidState(_)));

    // A redelivered cancel webhook is absorbed; still one CANCELLED row.
    let result = gateway_cancel
        .handle_webhook(&cancel_payload)
        .await
        .expect("redelivery");
    assert!(matches!(result, WebhookResult::Duplicate));

    let cancellations: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM settled_transactions WHERE origin_settled_id = $1",
    )
    .bind(approved.id)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(cancellations, 1);
}

#[tokio::test]
async fn test_unresolvable_webhook_is_rejected() {
    let Some(pool) = test_pool().await else { return };

    let gateway = gateway(pool.clone(), "http://127.0.0.1:1");
    let payload = settlecore::webhook::WebhookPayload {
        status: "SUCCESS".to_string(),
        code: "0000".to_string(),
        transaction_id: format!("SIM_NOBODY_{}", Uuid::new_v4()),
        approval_no: Some("AP1".to_string()),
        amount: BigDecimal::from(1),
        echo: None,
        message: "approved".to_string(),
    };

    let err = gateway.handle_webhook(&payload).await.expect_err("must fail");
    assert!(matches!(
        err,
        settlecore::error::AppError::UnresolvableWebhook(_)
    ));
}

#[tokio::test]
async fn test_cas_claim_admits_exactly_one_worker() {
    let Some(pool) = test_pool().await else { return };

    let job = SettlementJob::new(
        unique("merchant"),
        unique("order"),
        BigDecimal::from(1_000),
        "http://127.0.0.1:3000/callbacks/settlement".to_string(),
        None,
    );
    let job = queries::insert_job(&pool, &job).await.expect("insert job");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let id = job.id;
        handles.push(tokio::spawn(async move {
            queries::cas_claim_job(&pool, id, TransactionStatus::Pending, None)
                .await
                .expect("cas")
        }));
    }

    let mut winners = 0u64;
    for handle in handles {
        winners += handle.await.expect("join");
    }
    assert_eq!(winners, 1, "exactly one worker may claim a job");
}

#[tokio::test]
async fn test_stale_processing_job_is_reclaimable() {
    let Some(pool) = test_pool().await else { return };

    let job = SettlementJob::new(
        unique("merchant"),
        unique("order"),
        BigDecimal::from(1_000),
        "http://127.0.0.1:3000/callbacks/settlement".to_string(),
        None,
    );
    let job = queries::insert_job(&pool, &job).await.expect("insert job");

    // Simulate a crashed worker: claimed long ago, never finalized.
    sqlx::query(
        "UPDATE settlement_jobs SET status = 'PROCESSING', processing_started_at = NOW() - INTERVAL '1 hour' WHERE id = $1",
    )
    .bind(job.id)
    .execute(&pool)
    .await
    .expect("age the claim");

    let candidates = queries::get_claim_candidates(&pool, 100, 300)
        .await
        .expect("candidates");
    let stale = candidates
        .iter()
        .find(|c| c.id == job.id)
        .expect("stale job is a candidate again");

    let reclaimed = queries::cas_claim_job(
        &pool,
        stale.id,
        TransactionStatus::Processing,
        stale.processing_started_at,
    )
    .await
    .expect("reclaim");
    assert_eq!(reclaimed, 1);

    // A second sweeper holding the old timestamp loses.
    let second = queries::cas_claim_job(
        &pool,
        stale.id,
        TransactionStatus::Processing,
        stale.processing_started_at,
    )
    .await
    .expect("second reclaim");
    assert_eq!(second, 0);
}

#[tokio::test]
async fn test_signed_webhook_round_trip_over_http() {
    // No DB needed: exercises payload signing end to end over a socket.
    let mut server = mockito::Server::new_async().await;
    let secret = "test-secret";

    let job = SettlementJob::new(
        "merchant-sig".to_string(),
        "order-sig".to_string(),
        BigDecimal::from(777),
        format!("{}/callbacks/settlement", server.url()),
        Some(serde_json::json!({"reference": "GW_sig_ref"})),
    );
    let payload = build_payload(
        &job,
        &SettlementOutcome::Approved {
            approval_no: "AP99".to_string(),
        },
    );
    let body = serde_json::to_vec(&payload).expect("serialize");
    let signature = webhook::sign(secret, &body);

    let mock = server
        .mock("POST", "/callbacks/settlement")
        .match_header("x-settlement-signature", signature.as_str())
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let client = reqwest::Client::new();
    client
        .post(format!("{}/callbacks/settlement", server.url()))
        .header("Content-Type", "application/json")
        .header(webhook::SIGNATURE_HEADER, &signature)
        .body(body.clone())
        .send()
        .await
        .expect("post");

    mock.assert_async().await;
    assert!(webhook::verify(secret, &body, &signature));
}
