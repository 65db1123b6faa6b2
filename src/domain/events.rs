//! Tagged domain events and their routing table.
//!
//! Events are plain `{kind, aggregate_id, payload}` values. The topic an
//! event lands on is decided by the `EventRouter` owned by the publisher,
//! never by the event itself and never by ambient global state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const KIND_SETTLEMENT_APPROVED: &str = "settlement.approved";
pub const KIND_SETTLEMENT_CANCELLED: &str = "settlement.cancelled";
pub const KIND_SETTLEMENT_FAILED: &str = "settlement.failed";
pub const KIND_STOCK_ADJUSTMENT_REQUESTED: &str = "stock.adjustment.requested";
pub const KIND_BALANCE_SYNCHRONIZED: &str = "merchant.balance.synchronized";
pub const KIND_STOCK_SYNCHRONIZED: &str = "product.stock.synchronized";

/// An outbound fact about an aggregate, produced by a mutating call and
/// recorded through the outbox in the same unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(kind: &str, aggregate_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            aggregate_id: aggregate_id.into(),
            payload,
        }
    }
}

/// Wire format carried on the bus. `event_id` is the consumer-side
/// idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn wrap(event: &DomainEvent) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event.kind.clone(),
            aggregate_id: event.aggregate_id.clone(),
            payload: event.payload.clone(),
            occurred_at: Utc::now(),
        }
    }
}

/// Explicit kind -> topic table, injected into the outbox recorder at
/// construction.
#[derive(Debug, Clone)]
pub struct EventRouter {
    routes: Vec<(String, String)>,
}

impl EventRouter {
    pub fn new(routes: Vec<(String, String)>) -> Self {
        Self { routes }
    }

    /// Route table covering every event kind the pipeline emits.
    pub fn standard() -> Self {
        Self::new(vec![
            (KIND_SETTLEMENT_APPROVED.to_string(), "settlement-events".to_string()),
            (KIND_SETTLEMENT_CANCELLED.to_string(), "settlement-events".to_string()),
            (KIND_SETTLEMENT_FAILED.to_string(), "settlement-events".to_string()),
            (KIND_STOCK_ADJUSTMENT_REQUESTED.to_string(), "inventory-events".to_string()),
            (KIND_STOCK_SYNCHRONIZED.to_string(), "inventory-events".to_string()),
            (KIND_BALANCE_SYNCHRONIZED.to_string(), "account-events".to_string()),
        ])
    }

    pub fn topic_for(&self, kind: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, topic)| topic.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_standard_router_covers_all_kinds() {
        let router = EventRouter::standard();
        for kind in [
            KIND_SETTLEMENT_APPROVED,
            KIND_SETTLEMENT_CANCELLED,
            KIND_SETTLEMENT_FAILED,
            KIND_STOCK_ADJUSTMENT_REQUESTED,
            KIND_STOCK_SYNCHRONIZED,
            KIND_BALANCE_SYNCHRONIZED,
        ] {
            assert!(router.topic_for(kind).is_some(), "no route for {}", kind);
        }
    }

    #[test]
    fn test_unknown_kind_has_no_route() {
        let router = EventRouter::standard();
        assert_eq!(router.topic_for("coupon.issued"), None);
    }

    #[test]
    fn test_envelope_carries_event_fields() {
        let event = DomainEvent::new(
            KIND_SETTLEMENT_APPROVED,
            "order-42",
            json!({"amount": "10000"}),
        );
        let envelope = EventEnvelope::wrap(&event);

        assert_eq!(envelope.event_type, KIND_SETTLEMENT_APPROVED);
        assert_eq!(envelope.aggregate_id, "order-42");
        assert_eq!(envelope.payload["amount"], "10000");
        assert!(!envelope.event_id.is_empty());
    }

    #[test]
    fn test_envelopes_get_distinct_event_ids() {
        let event = DomainEvent::new(KIND_SETTLEMENT_FAILED, "order-1", json!({}));
        let a = EventEnvelope::wrap(&event);
        let b = EventEnvelope::wrap(&event);
        assert_ne!(a.event_id, b.event_id);
    }
}
