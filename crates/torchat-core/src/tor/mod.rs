//! Tor transport.
//!
//! Outbound connections go through the Tor SOCKS5 proxy to
//! `<peer-id>.onion`; inbound connections arrive on the local listener
//! that the hidden service forwards to. Hidden-service setup through the
//! control port is left to the caller.

mod connection;

pub use connection::{
    socks5_connect, Connection, ConnectionHandle, ConnectionReader, Direction, TcpLineReader,
    READ_BUFFER_SIZE,
};

/// Hostname dialled for a peer id.
pub fn onion_hostname(peer_id: &str) -> String {
    format!("{}{}", peer_id, crate::protocol::ONION_SUFFIX)
}
