pub mod events;
pub mod status;

pub use events::{DomainEvent, EventEnvelope, EventRouter};
pub use status::{OutboxStatus, SettledStatus, TransactionKind, TransactionStatus};
