use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    /// Base URL of the settlement counterparty (the simulator's own routes
    /// when running single-process, a remote gateway otherwise).
    pub gateway_base_url: String,
    /// URL the simulator delivers settlement webhooks to.
    pub callback_url: String,
    /// Shared secret for webhook HMAC signatures.
    pub webhook_secret: String,
    /// Optional bus bridge endpoint for outbox publication. When unset the
    /// dispatcher logs events instead of posting them.
    pub bus_url: Option<String>,
    pub simulator_poll_interval_secs: u64,
    pub simulator_batch_size: i64,
    /// Percentage of settlements the simulator approves (0..=100).
    pub simulator_approval_rate: u8,
    /// PROCESSING rows older than this are considered abandoned and
    /// re-claimed by the next polling pass.
    pub stale_claim_secs: i64,
    pub webhook_timeout_ms: u64,
    pub outbox_poll_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Ok(Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            database_url: env::var("DATABASE_URL")?,
            gateway_base_url: env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
            callback_url: env::var("CALLBACK_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000/callbacks/settlement".to_string()),
            webhook_secret: env::var("WEBHOOK_SECRET")?,
            bus_url: env::var("BUS_URL").ok(),
            simulator_poll_interval_secs: env::var("SIMULATOR_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            simulator_batch_size: env::var("SIMULATOR_BATCH_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            simulator_approval_rate: env::var("SIMULATOR_APPROVAL_RATE")
                .unwrap_or_else(|_| "80".to_string())
                .parse()?,
            stale_claim_secs: env::var("STALE_CLAIM_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            webhook_timeout_ms: env::var("WEBHOOK_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
            outbox_poll_interval_secs: env::var("OUTBOX_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("DATABASE_URL is empty");
        }
        if self.server_port == 0 {
            anyhow::bail!("SERVER_PORT must be greater than 0");
        }
        if self.simulator_approval_rate > 100 {
            anyhow::bail!("SIMULATOR_APPROVAL_RATE must be between 0 and 100");
        }
        url::Url::parse(&self.gateway_base_url)?;
        url::Url::parse(&self.callback_url)?;
        if let Some(bus) = &self.bus_url {
            url::Url::parse(bus)?;
        }
        Ok(())
    }
}
