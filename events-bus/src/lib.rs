//! PHI-safe durable event bus for CareBus services
//!
//! Backed by Redis Streams, this crate gives every service in the process
//! one shared bus supporting:
//! - Publish/subscribe over a closed set of domain event kinds
//! - Independent consumer groups, each receiving every event in order
//! - Competing workers within a group with at-least-once delivery
//! - Mandatory PHI scrubbing of every field before it reaches the wire
//! - A capped dead-letter stream for entries that cannot be parsed
//! - A capped audit stream recording publishes and processed deliveries
//!
//! Delivery is at-least-once, never exactly-once: handlers must be
//! idempotent. Ordering holds per group through a single worker; with
//! multiple workers per group entries are processed concurrently.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use events_bus::{
//!     BusConfig, EventBus, EventEnvelope, EventHandler, EventKind, DEFAULT_CONSUMER_GROUP,
//! };
//!
//! struct ReportingProjection;
//!
//! #[async_trait]
//! impl EventHandler for ReportingProjection {
//!     fn name(&self) -> &str {
//!         "reporting-projection"
//!     }
//!
//!     async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
//!         println!("reporting saw {}", envelope.event_id);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> events_bus::Result<()> {
//!     let bus = EventBus::new(BusConfig::from_env());
//!     bus.connect().await?;
//!
//!     bus.subscribe(
//!         EventKind::AppointmentScheduled,
//!         Arc::new(ReportingProjection),
//!         DEFAULT_CONSUMER_GROUP,
//!     )
//!     .await?;
//!
//!     let envelope =
//!         EventEnvelope::new(EventKind::AppointmentScheduled, "appointment", "appt-17")
//!             .with_metadata("note", "reschedule request from dana@example.com");
//!     bus.publish(envelope, None).await?;
//!
//!     bus.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod broker;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod publisher;
pub mod registry;
pub mod scrub;
pub mod status;
pub mod transport;

pub use audit::*;
pub use broker::*;
pub use bus::*;
pub use config::*;
pub use consumer::*;
pub use dlq::*;
pub use envelope::*;
pub use error::*;
pub use publisher::*;
pub use registry::*;
pub use scrub::*;
pub use status::*;
pub use transport::memory::MemoryTransport;
pub use transport::redis::RedisTransport;
pub use transport::{GroupReader, StreamEntry, StreamInfo, StreamTransport};
