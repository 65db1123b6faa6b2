use clap::Parser;
use sqlx::migrate::Migrator;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

use settlecore::cli::{Cli, Commands, DbCommands, TxCommands};
use settlecore::config::Config;
use settlecore::consumer::EventConsumer;
use settlecore::domain::EventRouter;
use settlecore::gateway::GatewayClient;
use settlecore::ledger::Reconciler;
use settlecore::outbox::{HttpPublisher, LogPublisher, OutboxDispatcher, OutboxRecorder, Publisher};
use settlecore::simulator::{RandomDecider, Simulator};
use settlecore::{cli, create_app, db, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Cli::parse();
    let config = Config::from_env()?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Tx(TxCommands::ResendWebhook { tid }) => {
            config.validate()?;
            let pool = db::create_pool(&config).await?;
            let simulator = build_simulator(&config, pool)?;
            simulator.resend_webhook(&tid).await?;
            println!("✓ Webhook re-delivered for {}", tid);
            Ok(())
        }
        Commands::Tx(TxCommands::Status) => {
            let pool = db::create_pool(&config).await?;
            cli::handle_tx_status(&pool).await
        }
        Commands::Config => cli::handle_config_validate(&config),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let pool = db::create_pool(&config).await?;

    let migrator = Migrator::new(Path::new("./migrations")).await?;
    migrator.run(&pool).await?;
    tracing::info!("Database migrations completed");

    let recorder = OutboxRecorder::new(EventRouter::standard());
    let reconciler = Reconciler::new(pool.clone());
    let consumer = EventConsumer::new(
        pool.clone(),
        reconciler.clone(),
        recorder.clone(),
        "settlecore",
    );

    let gateway = GatewayClient::new(
        pool.clone(),
        config.gateway_base_url.clone(),
        config.callback_url.clone(),
        recorder.clone(),
        Duration::from_millis(config.webhook_timeout_ms),
    )?;

    let simulator = build_simulator(&config, pool.clone())?;

    // Outbox dispatcher: HTTP bus bridge when configured, log sink otherwise.
    let publisher: Arc<dyn Publisher> = match &config.bus_url {
        Some(bus_url) => {
            tracing::info!("Outbox publishing to bus at {}", bus_url);
            Arc::new(HttpPublisher::new(
                bus_url.clone(),
                Duration::from_millis(config.webhook_timeout_ms),
            )?)
        }
        None => {
            tracing::info!("No bus configured, outbox events go to the log sink");
            Arc::new(LogPublisher)
        }
    };

    let dispatcher = OutboxDispatcher::new(pool.clone(), publisher);
    tokio::spawn(dispatcher.run(Duration::from_secs(config.outbox_poll_interval_secs)));

    tokio::spawn(
        simulator
            .clone()
            .run(Duration::from_secs(config.simulator_poll_interval_secs)),
    );

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        gateway,
        simulator,
        reconciler,
        consumer,
    };
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

fn build_simulator(config: &Config, pool: sqlx::PgPool) -> anyhow::Result<Simulator> {
    Simulator::new(
        pool,
        Arc::new(RandomDecider::new(config.simulator_approval_rate)),
        config.webhook_secret.clone(),
        Duration::from_millis(config.webhook_timeout_ms),
        config.simulator_batch_size,
        config.stale_claim_secs,
    )
}
