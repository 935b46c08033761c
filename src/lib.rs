//! # meshclient - Desktop Client Core for Meshtastic Networks
//!
//! meshclient is the non-UI half of a desktop client for Meshtastic mesh radios. It keeps a
//! link to a node over TCP, turns what the radio reports into plain domain values, persists
//! them in a local SQLite database, and hands them to a single consumer thread in order.
//!
//! ## Features
//!
//! - **Driver Adapter**: connect/disconnect lifecycle, optional reconnection with backoff, and
//!   guarded translation of driver callbacks (a bad packet becomes a diagnostic, never a crash).
//! - **Event Bridge**: bounded, ordered, thread-safe hand-off from the radio's threads to the
//!   consumer thread, with node-update coalescing under load.
//! - **Consumer Façade**: one object with observers for nodes, messages, connection state and
//!   diagnostics, plus async connect/send helpers.
//! - **State Store**: SQLite in WAL mode, one connection per thread, idempotent upserts and
//!   field-wise node merging.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshclient::client::MeshClient;
//! use meshclient::config::Config;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshclient.toml").await?;
//!     let mut client = MeshClient::new(config)?;
//!     client.subscribe_nodes(|n| println!("{} {}", n.id, n.display_name()));
//!     client.connect("localhost", 4403).await?;
//!     client.run_until(tokio::signal::ctrl_c()).await;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`driver`] - Meshtastic stream framing and the TCP link
//! - [`adapter`] - connection lifecycle and callback translation
//! - [`bridge`] - event queue between driver threads and the consumer
//! - [`client`] - the consumer-side façade
//! - [`storage`] - SQLite persistence
//! - [`model`] - domain types shared by everything above
//! - [`config`] - TOML configuration
//! - [`protobuf`] - the subset of Meshtastic protobuf messages the client speaks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  MeshClient     │ ← consumer thread: store writes, observers
//! └─────────────────┘
//!          ▲ events
//! ┌─────────────────┐
//! │  Event Bridge   │
//! └─────────────────┘
//!          ▲ publish
//! ┌─────────────────┐
//! │  Driver Adapter │ ← driver threads: translation, reconnect
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  TCP driver     │ ← framing, handshake, heartbeat
//! └─────────────────┘
//! ```

pub mod adapter;
pub mod bridge;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod logutil;
pub mod model;
pub mod protobuf;
pub mod storage;

pub use client::MeshClient;
pub use config::Config;
pub use error::{ClientError, ConnectionError, StorageError, TranslationFault};
pub use model::{
    AckStatus, Battery, ChannelInfo, ChannelRole, ConnectionState, ConnectionStatus, Message,
    MessageId, NodeEntry, NodeId, Position,
};
