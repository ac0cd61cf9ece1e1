//! TorChat wire protocol.
//!
//! A line-oriented text protocol over Tor TCP streams. Each line is one
//! command: a verb followed by space-separated arguments.
//!
//! ## Greeting
//!
//! ```text
//! A -> B (A's outbound)   ping <A-id> <A-cookie>
//! B -> A (B's outbound)   ping <B-id> <B-cookie>
//! B -> A                  pong <A-cookie>
//! A -> B                  pong <B-cookie>
//! ```
//!
//! Each node sends on the connection it dialled and listens on the one it
//! accepted, so a `pong` only counts when it arrives on the inbound side.

pub mod codec;
pub mod command;

pub use codec::{encode_line, escape, unescape, LineFramer};
pub use command::{format_line, lookup, Arity, CommandSpec, Request, Validity, Verb, COMMAND_TABLE};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hidden-service suffix appended to peer ids when dialing.
pub const ONION_SUFFIX: &str = ".onion";

/// Check a peer id: a v2 (16 chars) or v3 (56 chars) onion id in lowercase base32.
pub fn is_valid_peer_id(id: &str) -> bool {
    (id.len() == 16 || id.len() == 56) && id.bytes().all(|b| matches!(b, b'a'..=b'z' | b'2'..=b'7'))
}

/// Random alphanumeric cookie of `len` characters.
pub fn random_cookie(len: usize) -> String {
    use rand::distributions::{Alphanumeric, DistString};
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// Coarse presence carried by `status` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Presence {
    /// `available`
    #[default]
    Available,
    /// `away`
    Away,
    /// `xa` (long-time away)
    ExtendedAway,
}

impl Presence {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Available => "available",
            Presence::Away => "away",
            Presence::ExtendedAway => "xa",
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Presence {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "available" => Ok(Presence::Available),
            "away" => Ok(Presence::Away),
            "xa" => Ok(Presence::ExtendedAway),
            other => Err(crate::Error::Protocol(format!("unknown status '{}'", other))),
        }
    }
}
