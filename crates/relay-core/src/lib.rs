//! # relay-core
//!
//! The Relay realtime engine: ordered channel streams, recovery, presence
//! and connection management, independent of any concrete transport.
//!
//! Building blocks:
//!
//! - **Node** - Engine instance owning the broker, hub and configuration
//! - **Client** - One connection's command lifecycle and delivery queue
//! - **Hub** - Registry of connections and channel subscriptions
//! - **Broker** - Publish/history SPI with an in-memory implementation
//! - **StreamStore** - Per-channel ordered publication log with dual TTLs
//! - **PresenceManager** - Who is currently subscribed where
//! - **ChannelMedium** - Optional per-channel delivery layer
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐     ┌──────────┐     ┌─────────────┐
//! │ Transport │────▶│  Client  │────▶│    Node     │
//! └───────────┘     └──────────┘     └─────────────┘
//!                                      │    │    │
//!                           ┌──────────┘    │    └──────────┐
//!                           ▼               ▼               ▼
//!                     ┌──────────┐    ┌──────────┐    ┌──────────┐
//!                     │  Broker  │───▶│   Hub    │    │ Presence │
//!                     └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Publishes flow through the broker, which appends to channel history and
//! dispatches back to the node; the hub fans each publication out to local
//! subscribers through their outbound queues.

pub mod broker;
pub mod client;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod hub;
pub mod medium;
pub mod memory;
pub mod node;
pub mod presence;
pub mod recovery;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use broker::{Broker, BrokerError, BrokerEventHandler, HistoryFilter, PublishOptions};
pub use client::Client;
pub use config::Config;
pub use errors::{Disconnect, Error};
pub use hooks::{
    ConnectEvent, ConnectReply, Credentials, EventHooks, PublishEvent, PublishReply,
    SubscribeEvent, SubscribeOptions, SubscribeReply,
};
pub use hub::Hub;
pub use medium::{ChannelMedium, ChannelMediumOptions};
pub use memory::{MemoryBroker, MemoryBrokerOptions};
pub use node::Node;
pub use presence::{MemoryPresenceManager, PresenceError, PresenceManager, PresenceStats};
pub use stream::StreamStore;
pub use transport::{Transport, TransportError};
