//! Webhook delivery gateway
//!
//! Accepts messaging-platform webhook callbacks over HTTP, appends them to a
//! per-channel durable log, and hands them to polling workers with
//! at-least-once delivery, stale-entry reclaim and a capped delivery count.

pub mod clock;
pub mod config;
pub mod http;
pub mod observability;
pub mod queue;
pub mod simulation;
pub mod store;

pub use clock::{Clock, ProductionClock, SimulatedClock, Timestamp};
pub use config::{ConfigError, GatewayConfig};
pub use queue::{PollOptions, QueueError, WebhookMessage, WebhookQueue, WebhookStreamObject};
pub use store::{EntryId, InMemoryLogStore, LogStore, RedisLogStore, StoreError};
