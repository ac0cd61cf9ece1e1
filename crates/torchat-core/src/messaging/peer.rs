//! Per-peer session state.
//!
//! Every remote identity has one [`Peer`] holding at most one live
//! connection in each direction. Lines are sent on the outbound connection
//! and received on the inbound one.

use crate::error::{Error, Result};
use crate::logging::RedactedId;
use crate::messaging::file_transfer::FileTransfer;
use crate::protocol::{random_cookie, Presence, Validity};
use crate::tor::{ConnectionHandle, Direction};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Length of the cookie sent in our `ping`.
pub const PING_COOKIE_LEN: usize = 64;

/// Session state. Declaration order is the upgrade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerState {
    /// Fresh, or revived after a close.
    Uninitialized,
    /// A greeting arrived on an inbound connection.
    Accepting,
    /// An outbound dial is in progress.
    Connecting,
    /// Outbound connection up, waiting for the inbound `pong`.
    Authenticating,
    /// Cookie handshake complete.
    Authenticated,
    /// Buddy accepted; all commands allowed.
    Ready,
    /// Closed.
    Done,
}

impl PeerState {
    /// Minimum state for a command of the given validity.
    pub fn required_for(validity: Validity) -> Self {
        match validity {
            Validity::Greeting => PeerState::Accepting,
            Validity::Handshake => PeerState::Authenticating,
            Validity::Authenticated => PeerState::Authenticated,
            Validity::Accepted => PeerState::Ready,
        }
    }

    /// Whether a command of the given validity may run in this state.
    pub fn permits(self, validity: Validity) -> bool {
        self != PeerState::Done && self >= Self::required_for(validity)
    }

    /// Whether moving to `next` is a forward step.
    pub fn can_upgrade_to(self, next: PeerState) -> bool {
        next > self
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Uninitialized => "uninitialized",
            PeerState::Accepting => "accepting",
            PeerState::Connecting => "connecting",
            PeerState::Authenticating => "authenticating",
            PeerState::Authenticated => "authenticated",
            PeerState::Ready => "ready",
            PeerState::Done => "done",
        };
        f.write_str(s)
    }
}

/// Presence of a buddy as shown to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuddyState {
    /// No session.
    OffLine,
    /// Handshake in progress.
    Connecting,
    /// Ready.
    OnLine,
}

impl fmt::Display for BuddyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuddyState::OffLine => f.write_str("OFF_LINE"),
            BuddyState::Connecting => f.write_str("CONNECTING"),
            BuddyState::OnLine => f.write_str("ON_LINE"),
        }
    }
}

/// What the buddy told us about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuddyInfo {
    /// From `client`.
    pub client: String,
    /// From `version`.
    pub version: String,
    /// From `profile_name`.
    pub profile_name: String,
    /// From `profile_text`.
    pub profile_text: String,
    /// From the last `status`.
    pub presence: Option<Presence>,
}

/// One remote identity.
#[derive(Debug)]
pub struct Peer {
    pub(crate) id: String,
    pub(crate) state: PeerState,
    pub(crate) initiative: Direction,
    pub(crate) inbound: Option<ConnectionHandle>,
    pub(crate) outbound: Option<ConnectionHandle>,
    pub(crate) my_cookie: String,
    pub(crate) peer_cookie: Option<String>,
    pub(crate) sent_ping: bool,
    pub(crate) got_ping: bool,
    pub(crate) sent_pong: bool,
    pub(crate) got_pong: bool,
    pub(crate) has_been_ready: bool,
    pub(crate) dialing: bool,
    pub(crate) keepalive_at: Option<Instant>,
    pub(crate) status_deadline: Option<Instant>,
    pub(crate) retry_at: Option<Instant>,
    pub(crate) reconnect_count: u32,
    pub(crate) info: BuddyInfo,
    pub(crate) transfers: HashMap<String, FileTransfer>,
}

impl Peer {
    /// A fresh peer with a new local cookie.
    pub fn new(id: impl Into<String>, initiative: Direction) -> Self {
        Self {
            id: id.into(),
            state: PeerState::Uninitialized,
            initiative,
            inbound: None,
            outbound: None,
            my_cookie: random_cookie(PING_COOKIE_LEN),
            peer_cookie: None,
            sent_ping: false,
            got_ping: false,
            sent_pong: false,
            got_pong: false,
            has_been_ready: false,
            dialing: false,
            keepalive_at: None,
            status_deadline: None,
            retry_at: None,
            reconnect_count: 0,
            info: BuddyInfo::default(),
            transfers: HashMap::new(),
        }
    }

    /// Peer id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Who dialled first.
    pub fn initiative(&self) -> Direction {
        self.initiative
    }

    /// Buddy information learned so far.
    pub fn info(&self) -> &BuddyInfo {
        &self.info
    }

    /// Whether the peer was ever READY.
    pub fn has_been_ready(&self) -> bool {
        self.has_been_ready
    }

    /// Reconnect attempts since the last successful handshake.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    /// Presence as shown to the application.
    pub fn buddy_state(&self) -> BuddyState {
        match self.state {
            PeerState::Ready => BuddyState::OnLine,
            PeerState::Uninitialized | PeerState::Done => BuddyState::OffLine,
            _ => BuddyState::Connecting,
        }
    }

    /// Move forward to `next`. Returns `false` (and changes nothing) if
    /// `next` is not past the current state.
    pub fn upgrade_state(&mut self, next: PeerState) -> bool {
        if !self.state.can_upgrade_to(next) {
            return false;
        }
        debug!(peer = %RedactedId(&self.id), from = %self.state, to = %next, "Peer state");
        self.state = next;
        if next == PeerState::Ready {
            self.has_been_ready = true;
        }
        true
    }

    /// Reuse a closed peer for a new session. Keeps the local cookie, the
    /// reconnect counter and the has-been-ready flag.
    pub fn revive(&mut self) {
        if self.state == PeerState::Done {
            debug!(peer = %RedactedId(&self.id), "Reviving peer");
            self.state = PeerState::Uninitialized;
        }
    }

    /// Close both connections and reset to DONE.
    ///
    /// File transfers are left for the caller, which must abort them and
    /// report the outcome. The dialing flag belongs to the dial task and is
    /// left alone.
    pub fn close(&mut self) {
        if self.state < PeerState::Authenticated {
            self.peer_cookie = None;
        }
        if let Some(conn) = self.inbound.take() {
            conn.close();
        }
        if let Some(conn) = self.outbound.take() {
            conn.close();
        }
        self.state = PeerState::Done;
        self.sent_ping = false;
        self.got_ping = false;
        self.sent_pong = false;
        self.got_pong = false;
        self.keepalive_at = None;
        self.status_deadline = None;
    }

    /// Close, then make the peer ready to dial again with outbound initiative.
    pub fn reset_for_reconnect(&mut self) {
        self.close();
        self.state = PeerState::Uninitialized;
        self.initiative = Direction::Outbound;
        self.retry_at = None;
        self.reconnect_count = self.reconnect_count.saturating_add(1);
    }

    /// Whether the inbound connection is live.
    pub fn has_live_inbound(&self) -> bool {
        self.inbound.as_ref().is_some_and(ConnectionHandle::is_connected)
    }

    /// Whether the outbound connection is live.
    pub fn has_live_outbound(&self) -> bool {
        self.outbound.as_ref().is_some_and(ConnectionHandle::is_connected)
    }

    /// Whether either connection is live.
    pub fn is_connected(&self) -> bool {
        self.has_live_inbound() || self.has_live_outbound()
    }

    /// Install the inbound connection. Fails if a live one is present.
    pub fn set_inbound(&mut self, conn: ConnectionHandle) -> Result<()> {
        if self.has_live_inbound() {
            return Err(Error::Protocol("peer already has a live inbound connection".into()));
        }
        self.inbound = Some(conn);
        Ok(())
    }

    /// Install the outbound connection. Fails if a live one is present.
    pub fn set_outbound(&mut self, conn: ConnectionHandle) -> Result<()> {
        if self.has_live_outbound() {
            return Err(Error::Protocol("peer already has a live outbound connection".into()));
        }
        self.outbound = Some(conn);
        Ok(())
    }

    /// Close and forget the connection if it is the given one. Returns
    /// whether anything was detached.
    pub fn detach(&mut self, conn: &ConnectionHandle) -> bool {
        for slot in [&mut self.inbound, &mut self.outbound] {
            if slot.as_ref().is_some_and(|c| c.same_as(conn)) {
                if let Some(c) = slot.take() {
                    c.close();
                }
                return true;
            }
        }
        false
    }

    /// The live outbound connection.
    pub fn outbound(&self) -> Result<&ConnectionHandle> {
        self.outbound
            .as_ref()
            .filter(|c| c.is_connected())
            .ok_or_else(|| Error::NotConnected(format!("no outbound connection to {}", RedactedId(&self.id))))
    }

    /// Queue a line on the outbound connection.
    pub fn send(&self, line: Vec<u8>) -> Result<()> {
        self.outbound()?.send_line(line)
    }

    /// Start the liveness clocks after reaching READY.
    pub fn arm_timers(&mut self, now: Instant, status_timeout: Duration, keepalive: (Duration, Duration)) {
        self.status_deadline = Some(now + status_timeout);
        self.schedule_keepalive(now, keepalive.0, keepalive.1);
    }

    /// Push back the silence deadline after a `status` arrives.
    pub fn status_received(&mut self, now: Instant, status_timeout: Duration) {
        self.status_deadline = Some(now + status_timeout);
    }

    /// Pick the next keep-alive time uniformly in `[min, max]`.
    pub fn schedule_keepalive(&mut self, now: Instant, min: Duration, max: Duration) {
        let delay = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        self.keepalive_at = Some(now + delay);
    }

    /// Active (non-terminal) transfers.
    pub fn active_transfers(&self) -> usize {
        self.transfers.values().filter(|t| !t.state().is_terminal()).count()
    }
}
