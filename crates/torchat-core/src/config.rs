//! Engine configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default port of the TorChat hidden service.
pub const DEFAULT_PEER_PORT: u16 = 11009;

/// Default SOCKS5 port of a local Tor daemon.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Macro replaced by the buddy id in the download folder template.
pub const ID_MACRO: &str = "{id}";

/// Configuration consumed by [`crate::messaging::TorChatEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// This node's hidden-service id, without the `.onion` suffix.
    pub my_id: String,
    /// Local listener; Tor forwards the hidden service here.
    pub listen_addr: SocketAddr,
    /// Tor SOCKS5 proxy. `None` dials `<id>.onion` directly (test networks).
    pub tor_proxy: Option<SocketAddr>,
    /// Virtual port dialled on remote hidden services.
    pub peer_port: u16,
    /// Download folder template; `{id}` is replaced by the buddy id.
    pub download_folder: String,
    /// Concurrent file transfers allowed per contact.
    pub max_file_transfers: usize,
    /// Blocks an outbound transfer may have in flight.
    pub max_out_buffers: usize,
    /// Block size offered by outbound transfers.
    pub block_size: usize,
    /// Deadline for dialing and for receiving the greeting.
    pub connect_timeout: Duration,
    /// Period of the peer monitoring sweep.
    pub sweep_interval: Duration,
    /// Silence after which a READY peer is reconnected.
    pub status_timeout: Duration,
    /// Reconnect back-off step.
    pub reconnect_base: Duration,
    /// Reconnect back-off ceiling.
    pub reconnect_max: Duration,
    /// Lower bound of the randomized keep-alive interval.
    pub keepalive_min: Duration,
    /// Upper bound of the randomized keep-alive interval.
    pub keepalive_max: Duration,
    /// Partial reads allowed before a line must be complete.
    pub max_fragments: usize,
    /// Largest encoded line accepted, in bytes.
    pub max_line_length: usize,
    /// Blocks an UNVERIFIED inbound transfer may hold.
    pub max_buffered_blocks: usize,
    /// Start downloads as soon as `filename` arrives.
    pub auto_accept_files: bool,
    /// Sent in the `client` line.
    pub client_name: String,
    /// Sent in the `version` line.
    pub client_version: String,
    /// Sent in the `profile_name` line.
    pub profile_name: String,
    /// Sent in the `profile_text` line.
    pub profile_text: String,
}

/// Whether a `filedata` line for a block of `block_size` bytes, fully
/// escaped and with its header, fits in `max_line_length`.
pub fn block_fits_line(block_size: usize, max_line_length: usize) -> bool {
    block_size <= max_line_length.saturating_sub(256) / 2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            my_id: String::new(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PEER_PORT)),
            tor_proxy: Some(SocketAddr::from(([127, 0, 0, 1], DEFAULT_SOCKS_PORT))),
            peer_port: DEFAULT_PEER_PORT,
            download_folder: format!("~/Downloads/torchat/{}", ID_MACRO),
            max_file_transfers: 5,
            max_out_buffers: 12,
            block_size: 8192,
            connect_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(5),
            status_timeout: Duration::from_secs(130),
            reconnect_base: Duration::from_secs(20),
            reconnect_max: Duration::from_secs(15 * 60),
            keepalive_min: Duration::from_secs(5),
            keepalive_max: Duration::from_secs(110),
            max_fragments: 16,
            max_line_length: 1024 * 1024,
            max_buffered_blocks: 42,
            auto_accept_files: true,
            client_name: "torchat-rs".to_string(),
            client_version: crate::VERSION.to_string(),
            profile_name: String::new(),
            profile_text: String::new(),
        }
    }
}

impl EngineConfig {
    /// Config for `my_id` with every other field at its default.
    pub fn with_id(my_id: impl Into<String>) -> Self {
        Self {
            my_id: my_id.into(),
            ..Default::default()
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !crate::protocol::is_valid_peer_id(&self.my_id) {
            return Err(Error::InvalidArgument(format!("invalid local id '{}'", self.my_id)));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidArgument("block_size must be positive".into()));
        }
        if self.max_out_buffers == 0 {
            return Err(Error::InvalidArgument("max_out_buffers must be positive".into()));
        }
        if self.keepalive_min > self.keepalive_max {
            return Err(Error::InvalidArgument("keepalive_min exceeds keepalive_max".into()));
        }
        if !block_fits_line(self.block_size, self.max_line_length) {
            return Err(Error::InvalidArgument("block_size too large for max_line_length".into()));
        }
        Ok(())
    }

    /// Download folder for `buddy_id`, with the `{id}` macro and a leading
    /// `~` expanded.
    pub fn download_dir(&self, buddy_id: &str) -> PathBuf {
        let folder = self.download_folder.replace(ID_MACRO, buddy_id);
        PathBuf::from(shellexpand::tilde(&folder).into_owned())
    }

    /// Reconnect delay after `attempts` failed attempts:
    /// `min(max(1, attempts) * base, max)`.
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        let step = self.reconnect_base.saturating_mul(attempts.max(1));
        step.min(self.reconnect_max)
    }
}
