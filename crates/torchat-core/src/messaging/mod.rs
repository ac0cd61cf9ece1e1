//! TorChat messaging engine.
//!
//! ## Components
//!
//! - [`TorChatEngine`]: listener, dialer, request loops and the periodic
//!   peer sweep
//! - [`Peer`]: per-buddy session state machine
//! - [`FileTransfer`]: block-wise file transfer with a send window
//! - [`EventMonitor`]: callbacks into the application
//!
//! A session uses two TCP connections per buddy. Each side dials the other
//! and sends on the connection it dialled, so every line a node receives
//! arrives on an inbound connection.

mod engine;
pub mod file_transfer;
mod handlers;
pub mod monitor;
pub mod peer;

pub use engine::TorChatEngine;
pub use file_transfer::{FileInfo, FileTransfer, Segment, SegmentList, TransferState};
pub use monitor::{
    BuddyStateUpdate, ChannelMonitor, EngineEvent, EventMonitor, IncomingMessage, MonitorHandle,
    MonitorRegistry, OtherEvent, OtherEventKind,
};
pub use peer::{BuddyInfo, BuddyState, Peer, PeerState};
