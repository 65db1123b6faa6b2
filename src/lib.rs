pub mod cli;
pub mod config;
pub mod consumer;
pub mod db;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod ledger;
pub mod outbox;
pub mod simulator;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::consumer::EventConsumer;
use crate::gateway::GatewayClient;
use crate::ledger::Reconciler;
use crate::simulator::Simulator;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub gateway: GatewayClient,
    pub simulator: Simulator,
    pub reconciler: Reconciler,
    pub consumer: EventConsumer,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Gateway side
        .route("/transactions", post(handlers::submit_transaction))
        .route(
            "/transactions/:reference/cancel",
            post(handlers::cancel_transaction),
        )
        .route("/transactions/:reference", get(handlers::get_transaction))
        .route("/callbacks/settlement", post(handlers::settlement_callback))
        .route("/settled/:id", get(handlers::get_settled_transaction))
        // Simulator side
        .route("/pg/transactions", post(handlers::accept_settlement))
        .route("/pg/transactions/:tid", get(handlers::get_settlement_job))
        .route(
            "/pg/transactions/:tid/webhook/resend",
            post(handlers::resend_webhook),
        )
        // Ledger
        .route("/ledger/accounts", post(handlers::create_ledger_account))
        .route("/ledger/accounts/:id", get(handlers::audit_ledger_account))
        // Event ingress
        .route("/events", post(handlers::ingest_event))
        // Operational
        .route("/admin/outbox", get(handlers::outbox_overview))
        .route("/health", get(handlers::health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
