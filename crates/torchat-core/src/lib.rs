//! # TorChat Core Library
//!
//! Peer-to-peer instant messaging over Tor hidden services, speaking the
//! TorChat line protocol.
//!
//! Every user is identified by their hidden-service id. Two buddies talk
//! over a pair of TCP connections, one dialled by each side through Tor's
//! SOCKS5 proxy, and authenticate each other by echoing random cookies.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Application                │
//! │        (EventMonitor callbacks)         │
//! ├─────────────────────────────────────────┤
//! │   messaging (engine, peers, transfers)  │
//! ├─────────────────────────────────────────┤
//! │   protocol (codec, command table)       │
//! ├─────────────────────────────────────────┤
//! │   tor (SOCKS5 dialer, connections)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use torchat_core::{ChannelMonitor, EngineConfig, EngineEvent, EventMonitor, TorChatEngine};
//!
//! # async fn run() -> torchat_core::Result<()> {
//! let engine = TorChatEngine::new(EngineConfig::with_id("abcdefghijklmnop"))?;
//! let (monitor, mut events) = ChannelMonitor::new();
//! let monitor: Arc<dyn EventMonitor> = monitor;
//! engine.add_monitor(&monitor);
//! engine.start().await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let EngineEvent::IncomingMessage(msg) = event {
//!         println!("{}: {}", msg.buddy_id, msg.message);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod protocol;
pub mod tor;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use messaging::{
    BuddyState, BuddyStateUpdate, ChannelMonitor, EngineEvent, EventMonitor, FileInfo, IncomingMessage,
    MonitorHandle, OtherEvent, OtherEventKind, PeerState, TorChatEngine, TransferState,
};
pub use protocol::Presence;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
