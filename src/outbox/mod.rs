//! Transactional outbox: events are recorded in the same sqlx transaction
//! as the mutation they announce, then published by a separate dispatcher
//! loop with retries. "Did the fact happen" stays strongly consistent and
//! local; "was it communicated" is eventually consistent.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::models::OutboxEvent;
use crate::db::queries;
use crate::domain::{DomainEvent, EventEnvelope, EventRouter, OutboxStatus};
use crate::error::AppError;

const MAX_RETRY_COUNT: i32 = 3;
const BATCH_SIZE: i64 = 100;
const RETENTION_DAYS: i64 = 30;

/// At-least-once publication to the downstream bus. Duplicate delivery on
/// dispatcher crash/retry is acceptable; consumers dedupe.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

/// Posts envelopes to an HTTP bus bridge, one topic per path segment.
pub struct HttpPublisher {
    client: reqwest::Client,
    bus_url: String,
}

impl HttpPublisher {
    pub fn new(bus_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, bus_url })
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: &EventEnvelope,
    ) -> anyhow::Result<()> {
        let url = format!("{}/topics/{}", self.bus_url.trim_end_matches('/'), topic);
        let response = self
            .client
            .post(&url)
            .header("X-Partition-Key", key)
            .json(envelope)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("bus returned status {}", response.status());
        }
        Ok(())
    }
}

/// Fallback when no bus is configured: publication is a structured log
/// line. Useful for local runs; the outbox rows still track state.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: &EventEnvelope,
    ) -> anyhow::Result<()> {
        info!(
            topic,
            key,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "outbox event published (log sink)"
        );
        Ok(())
    }
}

/// Records domain events as PENDING outbox rows. Holds the routing table;
/// an event kind without a route is a programming error surfaced to the
/// caller so the enclosing transaction rolls back.
#[derive(Clone)]
pub struct OutboxRecorder {
    router: EventRouter,
}

impl OutboxRecorder {
    pub fn new(router: EventRouter) -> Self {
        Self { router }
    }

    pub async fn record(
        &self,
        executor: &mut SqlxTransaction<'_, Postgres>,
        event: &DomainEvent,
    ) -> Result<OutboxEvent, AppError> {
        let topic = self
            .router
            .topic_for(&event.kind)
            .ok_or_else(|| AppError::Internal(format!("no topic route for event kind {}", event.kind)))?
            .to_string();

        let envelope = EventEnvelope::wrap(event);
        let row = OutboxEvent {
            id: Uuid::new_v4(),
            event_id: envelope.event_id.clone(),
            event_type: envelope.event_type.clone(),
            aggregate_id: envelope.aggregate_id.clone(),
            topic,
            payload: envelope.payload.clone(),
            status: OutboxStatus::Pending.as_str().to_string(),
            retry_count: 0,
            published_at: None,
            error_message: None,
            created_at: Utc::now(),
        };

        let inserted = queries::insert_outbox_event(executor, &row).await?;
        debug!(
            event_type = %inserted.event_type,
            event_id = %inserted.event_id,
            topic = %inserted.topic,
            "recorded outbox event"
        );
        Ok(inserted)
    }
}

/// Polls PENDING rows oldest-first and pushes them through the publisher.
pub struct OutboxDispatcher {
    pool: PgPool,
    publisher: std::sync::Arc<dyn Publisher>,
}

impl OutboxDispatcher {
    pub fn new(pool: PgPool, publisher: std::sync::Arc<dyn Publisher>) -> Self {
        Self { pool, publisher }
    }

    pub async fn run(self, poll_interval: Duration) {
        info!("Outbox dispatcher started");
        let mut passes: u64 = 0;

        loop {
            if let Err(e) = self.dispatch_batch().await {
                error!("Outbox dispatch batch error: {}", e);
            }

            // Retention sweep roughly once an hour at the default tick.
            passes += 1;
            if passes % 3600 == 0 {
                if let Err(e) = self.cleanup_published().await {
                    error!("Outbox cleanup error: {}", e);
                }
            }

            sleep(poll_interval).await;
        }
    }

    /// One dispatcher pass. A publish failure affects only that entry;
    /// the rest of the batch still goes out, and the entry is retried on
    /// the next tick until it exhausts its retries.
    pub async fn dispatch_batch(&self) -> anyhow::Result<usize> {
        let pending = queries::get_pending_outbox_events(&self.pool, BATCH_SIZE).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        debug!("Dispatching {} pending outbox event(s)", pending.len());
        let mut published = 0usize;

        for event in pending {
            let envelope = EventEnvelope {
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                aggregate_id: event.aggregate_id.clone(),
                payload: event.payload.clone(),
                occurred_at: event.created_at,
            };

            match self
                .publisher
                .publish(&event.topic, &event.aggregate_id, &envelope)
                .await
            {
                Ok(()) => {
                    queries::mark_outbox_published(&self.pool, event.id).await?;
                    published += 1;
                    debug!(event_id = %event.event_id, topic = %event.topic, "outbox event published");
                }
                Err(e) => {
                    queries::mark_outbox_failed(&self.pool, event.id, &e.to_string(), MAX_RETRY_COUNT)
                        .await?;
                    if event.retry_count + 1 >= MAX_RETRY_COUNT {
                        error!(
                            event_id = %event.event_id,
                            retries = MAX_RETRY_COUNT,
                            "outbox event moved to FAILED: {}", e
                        );
                    } else {
                        warn!(
                            event_id = %event.event_id,
                            retry = event.retry_count + 1,
                            "outbox publish failed, will retry: {}", e
                        );
                    }
                }
            }
        }

        Ok(published)
    }

    pub async fn cleanup_published(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(RETENTION_DAYS);
        let deleted = queries::delete_published_outbox_before(&self.pool, cutoff).await?;
        if deleted > 0 {
            info!("Cleaned up {} published outbox event(s)", deleted);
        }
        Ok(deleted)
    }
}
