//! MQTT Telemetry Relay
//!
//! Last hop of the device telemetry pipeline. Each queued message carries one
//! JSON document published by a device. The relay writes it to the object store
//! under a time-partitioned key so the scheduled crawler can catalog it, then
//! publishes a human-readable alert to the notification topic.
//!
//! ## Features
//!
//! - **Time-Partitioned Storage**: `{prefix}/YYYY/MM/DD/HH/<timestamp>.json`
//!   keys with microsecond resolution
//! - **Ordered Side Effects**: the object is durable before any alert goes out
//! - **Configurable Partial Failure**: tolerate or surface alert failures after
//!   a successful write
//! - **Two Entry Points**: a long-polling queue consumer and an HTTP invoke API
//!
//! ## Architecture
//!
//! ```text
//! Queue (batch 1)             Object Store              Notification Topic
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Queue        │           │ {prefix}/    │          │ Email        │
//! │ Consumer     │           │   {Y}/{M}/   │          │ Subscribers  │
//! └──────────────┘           │   {D}/{H}/   │          └──────────────┘
//!        │                   └──────────────┘                 ▲
//!        ▼                          ▲                         │
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Relay        │──────────▶│ Durable      │          │ Notifier     │
//! │              │──┐        │ Store        │          │              │
//! └──────────────┘  │        └──────────────┘          └──────────────┘
//!        ▲          │     (1) write                           ▲
//!        │          └─────────────────────────────────────────┘
//! ┌──────────────┐                   (2) alert
//! │ Invoke API   │
//! └──────────────┘
//! ```

pub mod api;
pub mod aws;
pub mod clock;
pub mod config;
pub mod invocation;
pub mod notifier;
pub mod payload;
pub mod queue_consumer;
pub mod relay;
pub mod store;
pub mod topology;

pub use api::AppState;
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use invocation::{InvocationFault, InvocationRecord, QueueRecord};
pub use notifier::{AlertError, Notifier, TopicTarget};
pub use queue_consumer::{MessageOutcome, QueueConsumer};
pub use relay::{Relay, RelayError, RelayResponse};
pub use store::{DurableStore, StoreError, StoreTarget};
pub use topology::{TopologyConfig, TopologyError};
