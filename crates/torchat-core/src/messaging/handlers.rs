//! Command handlers.
//!
//! [`dispatch`] applies the state gate from the command table and routes
//! the request to its handler. Handlers never close anything themselves;
//! they return an [`Outcome`] that the request loop acts on.

use crate::config::block_fits_line;
use crate::error::{Error, Result};
use crate::logging::{RedactedBytes, RedactedCookie, RedactedId};
use crate::messaging::engine::{EngineInner, SharedPeer, REASON_STOPPED_BY_BUDDY};
use crate::messaging::file_transfer::{block_checksum, failure_reason, FileTransfer, TransferState};
use crate::messaging::monitor::{IncomingMessage, OtherEventKind};
use crate::messaging::peer::{Peer, PeerState};
use crate::protocol::{format_line, Presence, Request, Verb};
use crate::tor::{ConnectionHandle, Direction};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the request loop does after a handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Read the next line.
    Continue,
    /// Close this connection only.
    DropConnection,
    /// Abort one file transfer and tell the buddy.
    AbortTransfer {
        /// Transfer cookie.
        transfer_id: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Close the peer and forget it.
    ClosePeer,
}

/// Gate and handle one request received on `conn`.
pub(crate) async fn dispatch(
    inner: &Arc<EngineInner>,
    shared: &SharedPeer,
    conn: &ConnectionHandle,
    req: &Request,
) -> Result<Outcome> {
    let mut peer = shared.lock().await;
    if !peer.state().permits(req.spec.validity) {
        debug!(
            peer = %RedactedId(peer.id()),
            verb = %req.name_lossy(),
            state = %peer.state(),
            "Command not valid in current state, dropped"
        );
        return Ok(Outcome::Continue);
    }

    match req.verb() {
        Verb::Ping => on_ping(&mut peer, conn, req),
        Verb::Pong => on_pong(inner, &mut peer, conn, req).await,
        Verb::Client => {
            peer.info.client = req.text(0).into_owned();
            notify_if_ready(inner, &peer);
            Ok(Outcome::Continue)
        }
        Verb::Version => {
            peer.info.version = req.text(0).into_owned();
            notify_if_ready(inner, &peer);
            Ok(Outcome::Continue)
        }
        Verb::ProfileName => {
            peer.info.profile_name = req.text(0).into_owned();
            notify_if_ready(inner, &peer);
            Ok(Outcome::Continue)
        }
        Verb::ProfileText => {
            peer.info.profile_text = req.text(0).into_owned();
            notify_if_ready(inner, &peer);
            Ok(Outcome::Continue)
        }
        Verb::ProfileAvatar | Verb::ProfileAvatarAlpha => {
            debug!(peer = %RedactedId(peer.id()), verb = %req.name_lossy(), data = %RedactedBytes(req.arg(0)), "Avatar ignored");
            Ok(Outcome::Continue)
        }
        Verb::AddMe => on_add_me(inner, &mut peer),
        Verb::Status => on_status(inner, &mut peer, req),
        Verb::Message => {
            let message = IncomingMessage {
                buddy_id: peer.id().to_string(),
                message: req.text(0).into_owned(),
            };
            debug!(peer = %RedactedId(peer.id()), len = message.message.len(), "Message received");
            inner.monitors.emit(|m| m.on_incoming_message(&message));
            Ok(Outcome::Continue)
        }
        Verb::Filename => on_filename(inner, &mut peer, req).await,
        Verb::Filedata => on_filedata(inner, &mut peer, req).await,
        Verb::FiledataOk | Verb::FiledataError => on_filedata_reply(inner, &mut peer, req).await,
        Verb::FileStopSending | Verb::FileStopReceiving => {
            let cookie = req.arg_str(0)?;
            if !inner.abort_transfer(&mut peer, cookie, REASON_STOPPED_BY_BUDDY, false).await {
                debug!(transfer = %cookie, "Stop for unknown transfer");
            }
            Ok(Outcome::Continue)
        }
        Verb::RemoveMe => {
            info!(peer = %RedactedId(peer.id()), "Buddy removed us");
            inner.notify_other(peer.id(), OtherEventKind::BuddyRemoved, "buddy sent remove_me");
            Ok(Outcome::ClosePeer)
        }
        Verb::NotImplemented => {
            debug!(peer = %RedactedId(peer.id()), verb = %req.text(0), "Buddy does not implement command");
            Ok(Outcome::Continue)
        }
        Verb::Unknown => {
            debug!(peer = %RedactedId(peer.id()), verb = %req.name_lossy(), "Unknown command");
            if peer.has_live_outbound() {
                peer.send(format_line(Verb::NotImplemented, &[req.name.as_slice()]))?;
            }
            Ok(Outcome::Continue)
        }
    }
}

/// Record the cookie from a `ping` and answer it if we can.
pub(crate) fn accept_ping(peer: &mut Peer, cookie: &str) {
    if peer.peer_cookie.as_deref() != Some(cookie) {
        peer.sent_pong = false;
    }
    peer.peer_cookie = Some(cookie.to_string());
    peer.got_ping = true;
    send_pong_if_due(peer);
}

/// Send our `pong` once a `ping` was received and ours went out first.
pub(crate) fn send_pong_if_due(peer: &mut Peer) {
    if !peer.got_ping || peer.sent_pong || !peer.sent_ping || !peer.has_live_outbound() {
        return;
    }
    let Some(cookie) = peer.peer_cookie.clone() else {
        return;
    };
    match peer.send(format_line(Verb::Pong, &[cookie.as_bytes()])) {
        Ok(()) => {
            debug!(peer = %RedactedId(peer.id()), cookie = %RedactedCookie(&cookie), "Sent pong");
            peer.sent_pong = true;
        }
        Err(e) => debug!(peer = %RedactedId(peer.id()), error = %e, "Could not send pong"),
    }
}

fn on_ping(peer: &mut Peer, conn: &ConnectionHandle, req: &Request) -> Result<Outcome> {
    if conn.direction() == Direction::Outbound {
        debug!(peer = %RedactedId(peer.id()), "Ping on outbound connection ignored");
        return Ok(Outcome::Continue);
    }
    if req.arg(0) != peer.id().as_bytes() {
        warn!(peer = %RedactedId(peer.id()), "Ping with a different id on an established connection");
        return Ok(Outcome::DropConnection);
    }
    let cookie = req.arg_str(1)?;
    if cookie.is_empty() || cookie.contains(' ') {
        return Err(Error::Protocol("malformed ping cookie".into()));
    }
    accept_ping(peer, cookie);
    Ok(Outcome::Continue)
}

async fn on_pong(
    inner: &Arc<EngineInner>,
    peer: &mut Peer,
    conn: &ConnectionHandle,
    req: &Request,
) -> Result<Outcome> {
    // only the buddy's own connection can prove it received our ping
    if conn.direction() == Direction::Outbound {
        debug!(peer = %RedactedId(peer.id()), "Pong on outbound connection ignored");
        return Ok(Outcome::Continue);
    }
    let cookie = req.arg_str(0)?;
    if cookie != peer.my_cookie {
        warn!(peer = %RedactedId(peer.id()), cookie = %RedactedCookie(cookie), "Pong with wrong cookie");
        return Ok(Outcome::DropConnection);
    }
    if peer.got_pong {
        debug!(peer = %RedactedId(peer.id()), "Duplicate pong ignored");
        return Ok(Outcome::Continue);
    }

    peer.got_pong = true;
    peer.reconnect_count = 0;
    peer.retry_at = None;
    info!(peer = %RedactedId(peer.id()), "Peer authenticated");

    send_identification(inner, peer).await?;
    if peer.has_been_ready() {
        peer.upgrade_state(PeerState::Ready);
        arm_timers(inner, peer);
    } else {
        peer.upgrade_state(PeerState::Authenticated);
    }
    inner.notify_state(peer);
    Ok(Outcome::Continue)
}

async fn send_identification(inner: &Arc<EngineInner>, peer: &Peer) -> Result<()> {
    let config = &inner.config;
    let presence = inner.presence().await;
    let lines = [
        format_line(Verb::Client, &[config.client_name.as_bytes()]),
        format_line(Verb::Version, &[config.client_version.as_bytes()]),
        format_line(Verb::ProfileName, &[config.profile_name.as_bytes()]),
        format_line(Verb::ProfileText, &[config.profile_text.as_bytes()]),
        format_line(Verb::Status, &[presence.as_str().as_bytes()]),
        format_line(Verb::AddMe, &[]),
    ];
    for line in lines {
        peer.send(line)?;
    }
    Ok(())
}

fn arm_timers(inner: &EngineInner, peer: &mut Peer) {
    let config = &inner.config;
    peer.arm_timers(
        Instant::now(),
        config.status_timeout,
        (config.keepalive_min, config.keepalive_max),
    );
}

fn notify_if_ready(inner: &EngineInner, peer: &Peer) {
    if peer.state() == PeerState::Ready {
        inner.notify_state(peer);
    }
}

fn on_add_me(inner: &Arc<EngineInner>, peer: &mut Peer) -> Result<Outcome> {
    if peer.state() == PeerState::Ready {
        return Ok(Outcome::Continue);
    }
    let buddy_id = peer.id().to_string();
    if !inner.monitors.approve(|m| m.on_add_new_buddy(&buddy_id)) {
        info!(peer = %RedactedId(&buddy_id), "Buddy request refused");
        return Ok(Outcome::DropConnection);
    }

    peer.upgrade_state(PeerState::Ready);
    arm_timers(inner, peer);
    info!(peer = %RedactedId(&buddy_id), "Buddy ready");
    inner.monitors.emit(|m| m.on_buddy_added(&buddy_id));
    inner.notify_state(peer);
    Ok(Outcome::Continue)
}

fn on_status(inner: &Arc<EngineInner>, peer: &mut Peer, req: &Request) -> Result<Outcome> {
    let presence: Presence = req.arg_str(0)?.parse()?;
    peer.status_received(Instant::now(), inner.config.status_timeout);
    if peer.info.presence != Some(presence) {
        debug!(peer = %RedactedId(peer.id()), %presence, "Presence changed");
        peer.info.presence = Some(presence);
        notify_if_ready(inner, peer);
    }
    Ok(Outcome::Continue)
}

async fn on_filename(inner: &Arc<EngineInner>, peer: &mut Peer, req: &Request) -> Result<Outcome> {
    let config = &inner.config;
    let cookie = req.arg_str(0)?.to_string();
    let length = req.arg_u64(1)?;
    let block_size = usize::try_from(req.arg_u64(2)?).unwrap_or(usize::MAX);
    let name = req.text(3).into_owned();

    if peer.transfers.contains_key(&cookie) {
        debug!(transfer = %cookie, "Duplicate filename ignored");
        return Ok(Outcome::Continue);
    }
    let refuse = if peer.active_transfers() >= config.max_file_transfers {
        Some("too many concurrent transfers")
    } else if block_size == 0 || !block_fits_line(block_size, config.max_line_length) {
        Some("unusable block size")
    } else {
        None
    };
    if let Some(why) = refuse {
        info!(peer = %RedactedId(peer.id()), transfer = %cookie, why, "File refused");
        peer.send(format_line(Verb::FileStopSending, &[cookie.as_bytes()]))?;
        return Ok(Outcome::Continue);
    }

    let mut transfer = FileTransfer::incoming(
        peer.id(),
        &cookie,
        &name,
        length,
        block_size,
        config.max_buffered_blocks,
    )?;
    info!(peer = %RedactedId(peer.id()), transfer = %cookie, length, "Incoming file");
    inner.monitors.emit(|m| m.on_incoming_file_transfer(transfer.info()));

    if !config.auto_accept_files {
        peer.transfers.insert(cookie, transfer);
        return Ok(Outcome::Continue);
    }

    let out = peer.outbound()?.clone();
    let started = transfer.start_download(&config.download_dir(peer.id()), &out).await;
    let state = transfer.state();
    inner.monitors.emit(|m| m.on_file_transfer_update(transfer.info()));
    match started {
        Ok(()) => {
            if state != TransferState::Done {
                peer.transfers.insert(cookie, transfer);
            }
            Ok(Outcome::Continue)
        }
        Err(e) => {
            peer.transfers.insert(cookie.clone(), transfer);
            Ok(Outcome::AbortTransfer {
                transfer_id: cookie,
                reason: failure_reason(&e),
            })
        }
    }
}

/// Split the second `filedata` argument into offset, checksum and payload.
fn split_filedata(arg: &[u8]) -> Result<(u64, &str, &[u8])> {
    let mut parts = arg.splitn(3, |&b| b == b' ');
    let (Some(offset), Some(checksum), Some(data)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::Protocol("filedata expects offset, checksum and data".into()));
    };
    let offset = std::str::from_utf8(offset)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol("filedata offset is not a number".into()))?;
    let checksum =
        std::str::from_utf8(checksum).map_err(|_| Error::Protocol("filedata checksum is not text".into()))?;
    Ok((offset, checksum, data))
}

async fn on_filedata(inner: &Arc<EngineInner>, peer: &mut Peer, req: &Request) -> Result<Outcome> {
    let cookie = req.arg_str(0)?.to_string();
    let (offset, checksum, data) = split_filedata(req.arg(1))?;

    if !peer.transfers.contains_key(&cookie) {
        debug!(transfer = %cookie, offset, "Data for unknown transfer");
        peer.send(format_line(Verb::FileStopSending, &[cookie.as_bytes()]))?;
        return Ok(Outcome::Continue);
    }
    if !block_checksum(data).eq_ignore_ascii_case(checksum) {
        warn!(transfer = %cookie, offset, "Block checksum mismatch, requesting resend");
        peer.send(format_line(
            Verb::FiledataError,
            &[cookie.as_bytes(), offset.to_string().as_bytes()],
        ))?;
        return Ok(Outcome::Continue);
    }

    let out = peer.outbound()?.clone();
    let Some(transfer) = peer.transfers.get_mut(&cookie) else {
        return Ok(Outcome::Continue);
    };
    if transfer.direction() != Direction::Inbound {
        return Err(Error::Protocol("filedata for an outbound transfer".into()));
    }

    if let Err(e) = transfer.on_incoming_data(offset, data, &out).await {
        return Ok(Outcome::AbortTransfer {
            transfer_id: cookie,
            reason: failure_reason(&e),
        });
    }
    let state = transfer.state();
    if state != TransferState::Unverified {
        inner.monitors.emit(|m| m.on_file_transfer_update(transfer.info()));
    }
    if state == TransferState::Done {
        peer.transfers.remove(&cookie);
    }
    Ok(Outcome::Continue)
}

async fn on_filedata_reply(inner: &Arc<EngineInner>, peer: &mut Peer, req: &Request) -> Result<Outcome> {
    let cookie = req.arg_str(0)?.to_string();
    let offset = req.arg_u64(1)?;
    let out = peer.outbound()?.clone();
    let Some(transfer) = peer.transfers.get_mut(&cookie) else {
        debug!(transfer = %cookie, offset, "Reply for unknown transfer");
        return Ok(Outcome::Continue);
    };
    if transfer.direction() != Direction::Outbound {
        return Err(Error::Protocol(format!("{} for an inbound transfer", req.verb().as_str())));
    }

    let result = match req.verb() {
        Verb::FiledataOk => transfer.on_block_acknowledged(offset, &out).await,
        _ => transfer.on_block_error(offset, &out).await,
    };
    if let Err(e) = result {
        return Ok(Outcome::AbortTransfer {
            transfer_id: cookie,
            reason: failure_reason(&e),
        });
    }
    let state = transfer.state();
    inner.monitors.emit(|m| m.on_file_transfer_update(transfer.info()));
    if state == TransferState::Done {
        peer.transfers.remove(&cookie);
    }
    Ok(Outcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::messaging::file_transfer::{REASON_PAST_EOF, REASON_UNALIGNED};
    use crate::messaging::monitor::{ChannelMonitor, EngineEvent, EventMonitor};
    use tokio::sync::mpsc::{Receiver, UnboundedReceiver};

    const ME: &str = "abcdefghijklmnop";
    const BUDDY: &str = "bcdefghijklmnopq";

    struct Fixture {
        inner: Arc<EngineInner>,
        peer: SharedPeer,
        inbound: ConnectionHandle,
        outbound: ConnectionHandle,
        sent: Receiver<Vec<u8>>,
        _inbound_rx: Receiver<Vec<u8>>,
        _monitor: Arc<dyn EventMonitor>,
        events: UnboundedReceiver<EngineEvent>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        async fn new(state: PeerState, approve: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = EngineConfig::with_id(ME);
            config.download_folder = dir.path().join("{id}").to_string_lossy().into_owned();
            let inner = Arc::new(EngineInner::new(config));

            let (monitor, events) = ChannelMonitor::with_policy(approve);
            let monitor: Arc<dyn EventMonitor> = monitor;
            inner.monitors.add(&monitor);

            let peer = inner.get_or_create_peer(BUDDY, Direction::Inbound).await;
            let (inbound, inbound_rx) = ConnectionHandle::new("in", Direction::Inbound);
            let (outbound, sent) = ConnectionHandle::new("out", Direction::Outbound);
            {
                let mut p = peer.lock().await;
                p.set_inbound(inbound.clone()).unwrap();
                p.set_outbound(outbound.clone()).unwrap();
                p.upgrade_state(state);
                p.sent_ping = true;
            }
            Self {
                inner,
                peer,
                inbound,
                outbound,
                sent,
                _inbound_rx: inbound_rx,
                _monitor: monitor,
                events,
                _dir: dir,
            }
        }

        async fn deliver(&self, line: &[u8]) -> Outcome {
            let req = Request::parse(line).unwrap();
            dispatch(&self.inner, &self.peer, &self.inbound, &req).await.unwrap()
        }

        fn sent_lines(&mut self) -> Vec<Request> {
            let mut out = Vec::new();
            while let Ok(line) = self.sent.try_recv() {
                out.push(Request::parse(&line).unwrap());
            }
            out
        }

        fn events(&mut self) -> Vec<EngineEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        async fn state(&self) -> PeerState {
            self.peer.lock().await.state()
        }
    }

    fn messages(events: &[EngineEvent]) -> Vec<IncomingMessage> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::IncomingMessage(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_message_gated_until_ready() {
        let mut fx = Fixture::new(PeerState::Authenticated, true).await;
        assert_eq!(fx.deliver(b"message hello").await, Outcome::Continue);
        assert!(messages(&fx.events()).is_empty());

        fx.peer.lock().await.upgrade_state(PeerState::Ready);
        assert_eq!(fx.deliver(b"message hello").await, Outcome::Continue);
        let received = messages(&fx.events());
        assert_eq!(
            received,
            vec![IncomingMessage {
                buddy_id: BUDDY.to_string(),
                message: "hello".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_pong_on_outbound_never_authenticates() {
        let fx = Fixture::new(PeerState::Authenticating, true).await;
        let cookie = fx.peer.lock().await.my_cookie.clone();
        let req = Request::parse(format!("pong {}", cookie).as_bytes()).unwrap();

        let outcome = dispatch(&fx.inner, &fx.peer, &fx.outbound, &req).await.unwrap();
        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(fx.state().await, PeerState::Authenticating);
    }

    #[tokio::test]
    async fn test_pong_with_wrong_cookie_drops_connection() {
        let fx = Fixture::new(PeerState::Authenticating, true).await;
        assert_eq!(fx.deliver(b"pong not-our-cookie").await, Outcome::DropConnection);
        assert_eq!(fx.state().await, PeerState::Authenticating);
    }

    #[tokio::test]
    async fn test_pong_authenticates_and_identifies() {
        let mut fx = Fixture::new(PeerState::Authenticating, true).await;
        fx.peer.lock().await.reconnect_count = 3;
        let cookie = fx.peer.lock().await.my_cookie.clone();

        assert_eq!(fx.deliver(format!("pong {}", cookie).as_bytes()).await, Outcome::Continue);
        assert_eq!(fx.state().await, PeerState::Authenticated);
        assert_eq!(fx.peer.lock().await.reconnect_count(), 0);

        let verbs: Vec<Verb> = fx.sent_lines().iter().map(Request::verb).collect();
        assert_eq!(
            verbs,
            vec![
                Verb::Client,
                Verb::Version,
                Verb::ProfileName,
                Verb::ProfileText,
                Verb::Status,
                Verb::AddMe
            ]
        );
    }

    #[tokio::test]
    async fn test_pong_returns_known_buddy_to_ready() {
        let fx = Fixture::new(PeerState::Authenticating, true).await;
        let cookie = {
            let mut p = fx.peer.lock().await;
            p.has_been_ready = true;
            p.my_cookie.clone()
        };
        fx.deliver(format!("pong {}", cookie).as_bytes()).await;
        assert_eq!(fx.state().await, PeerState::Ready);
        assert!(fx.peer.lock().await.status_deadline.is_some());
    }

    #[tokio::test]
    async fn test_add_me_makes_ready() {
        let mut fx = Fixture::new(PeerState::Authenticated, true).await;
        assert_eq!(fx.deliver(b"add_me").await, Outcome::Continue);
        assert_eq!(fx.state().await, PeerState::Ready);
        assert!(fx
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::BuddyAdded { buddy_id } if buddy_id == BUDDY)));
    }

    #[tokio::test]
    async fn test_add_me_refused() {
        let fx = Fixture::new(PeerState::Authenticated, false).await;
        assert_eq!(fx.deliver(b"add_me").await, Outcome::DropConnection);
        assert_eq!(fx.state().await, PeerState::Authenticated);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let mut fx = Fixture::new(PeerState::Accepting, true).await;
        fx.deliver(format!("ping {} theircookie", BUDDY).as_bytes()).await;
        let sent = fx.sent_lines();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].verb(), Verb::Pong);
        assert_eq!(sent[0].arg(0), b"theircookie");
    }

    #[tokio::test]
    async fn test_unknown_verb_answered() {
        let mut fx = Fixture::new(PeerState::Accepting, true).await;
        fx.deliver(b"launch_rockets now").await;
        let sent = fx.sent_lines();
        assert_eq!(sent[0].verb(), Verb::NotImplemented);
        assert_eq!(sent[0].text(0), "launch_rockets");
    }

    #[tokio::test]
    async fn test_status_updates_presence() {
        let fx = Fixture::new(PeerState::Ready, true).await;
        fx.deliver(b"status away").await;
        let p = fx.peer.lock().await;
        assert_eq!(p.info().presence, Some(Presence::Away));
        assert!(p.status_deadline.is_some());
    }

    #[tokio::test]
    async fn test_filedata_for_unknown_transfer() {
        let mut fx = Fixture::new(PeerState::Ready, true).await;
        let md5 = block_checksum(b"abc");
        fx.deliver(format!("filedata nosuch 0 {} abc", md5).as_bytes()).await;
        let sent = fx.sent_lines();
        assert_eq!(sent[0].verb(), Verb::FileStopSending);
        assert_eq!(sent[0].arg(0), b"nosuch");
    }

    #[tokio::test]
    async fn test_filedata_bad_checksum_requests_resend() {
        let mut fx = Fixture::new(PeerState::Ready, true).await;
        fx.deliver(b"filename ck 8 8 f.bin").await;
        fx.deliver(b"filedata ck 0 00000000000000000000000000000000 abcdefgh").await;
        let sent = fx.sent_lines();
        assert_eq!(sent.last().unwrap().verb(), Verb::FiledataError);
        assert_eq!(sent.last().unwrap().arg(1), b"0");
    }

    #[tokio::test]
    async fn test_unaligned_filedata_aborts_transfer() {
        let fx = Fixture::new(PeerState::Ready, true).await;
        fx.deliver(b"filename ck 100 8 f.bin").await;
        let md5 = block_checksum(b"abcdefgh");
        let outcome = fx.deliver(format!("filedata ck 3 {} abcdefgh", md5).as_bytes()).await;
        assert_eq!(
            outcome,
            Outcome::AbortTransfer {
                transfer_id: "ck".to_string(),
                reason: REASON_UNALIGNED.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_filedata_offset_near_u64_max_aborts_transfer() {
        let fx = Fixture::new(PeerState::Ready, true).await;
        fx.deliver(b"filename ck 100 8 f.bin").await;
        let md5 = block_checksum(b"abcdefgh");
        let line = format!("filedata ck {} {} abcdefgh", u64::MAX - 7, md5);
        assert_eq!(
            fx.deliver(line.as_bytes()).await,
            Outcome::AbortTransfer {
                transfer_id: "ck".to_string(),
                reason: REASON_PAST_EOF.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_filename_with_huge_block_size_refused() {
        let mut fx = Fixture::new(PeerState::Ready, true).await;
        for (cookie, block_size) in [("ck1", u64::MAX), ("ck2", 1u64 << 63), ("ck3", 0)] {
            let line = format!("filename {} 100 {} f.bin", cookie, block_size);
            assert_eq!(fx.deliver(line.as_bytes()).await, Outcome::Continue);
            let sent = fx.sent_lines();
            assert_eq!(sent[0].verb(), Verb::FileStopSending);
            assert_eq!(sent[0].arg(0), cookie.as_bytes());
        }
        assert!(fx.peer.lock().await.transfers.is_empty());
    }

    #[tokio::test]
    async fn test_filename_beyond_limit_refused() {
        let mut fx = Fixture::new(PeerState::Ready, true).await;
        for i in 0..5 {
            fx.deliver(format!("filename ck{} 100 8 f{}.bin", i, i).as_bytes()).await;
        }
        fx.sent_lines();
        fx.deliver(b"filename ck5 100 8 f5.bin").await;
        let sent = fx.sent_lines();
        assert_eq!(sent[0].verb(), Verb::FileStopSending);
        assert_eq!(sent[0].arg(0), b"ck5");
    }

    #[tokio::test]
    async fn test_stop_sending_aborts_quietly() {
        let mut fx = Fixture::new(PeerState::Ready, true).await;
        fx.deliver(b"filename ck 100 8 f.bin").await;
        fx.sent_lines();
        fx.deliver(b"file_stop_receiving ck").await;
        assert!(fx.peer.lock().await.transfers.is_empty());
        assert!(fx.sent_lines().is_empty());
        assert!(fx.events().iter().any(|e| matches!(
            e,
            EngineEvent::FileTransferUpdate(info) if info.state == TransferState::Aborted
        )));
    }

    #[tokio::test]
    async fn test_remove_me_closes_peer() {
        let fx = Fixture::new(PeerState::Ready, true).await;
        assert_eq!(fx.deliver(b"remove_me").await, Outcome::ClosePeer);
    }

    #[tokio::test]
    async fn test_done_peer_accepts_nothing() {
        let mut fx = Fixture::new(PeerState::Ready, true).await;
        fx.peer.lock().await.close();
        fx.events();
        fx.deliver(b"message hi").await;
        assert!(messages(&fx.events()).is_empty());
    }
}
