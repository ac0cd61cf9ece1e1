//! TorChat protocol engine.
//!
//! Owns the peer table and runs four kinds of tasks:
//! - the accept loop, which validates each inbound greeting and hands the
//!   connection to a request loop;
//! - one outbound dial per peer, which sends our `ping` and then runs the
//!   request loop for the outbound connection;
//! - the sweep, which reconnects dead peers with back-off, forces a
//!   reconnect on status silence and sends keep-alives;
//! - the command loop, which executes application requests posted through
//!   [`TorChatEngine`]'s methods, one at a time and in order.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::logging::RedactedId;
use crate::messaging::file_transfer::{failure_reason, FileTransfer, TransferState};
use crate::messaging::handlers::{self, Outcome};
use crate::messaging::monitor::{
    BuddyStateUpdate, EventMonitor, MonitorHandle, MonitorRegistry, OtherEvent, OtherEventKind,
};
use crate::messaging::peer::{BuddyState, Peer, PeerState};
use crate::protocol::{format_line, is_valid_peer_id, LineFramer, Presence, Request, Verb};
use crate::tor::{onion_hostname, Connection, ConnectionHandle, ConnectionReader, Direction};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex, RwLock};
use tracing::{debug, error, info, warn};

/// Capacity of the application command queue.
const COMMAND_QUEUE_SIZE: usize = 64;

/// Reason reported for transfers cut off by a lost session.
const REASON_DISCONNECTED: &str = "Buddy disconnected";

/// Reason reported for transfers cancelled by the application.
const REASON_CANCELLED: &str = "Cancelled";

/// Reason reported for transfers stopped by the buddy.
pub(crate) const REASON_STOPPED_BY_BUDDY: &str = "Stopped by buddy";

pub(crate) type SharedPeer = Arc<TokioMutex<Peer>>;

/// Application requests, executed by the command loop.
pub(crate) enum EngineCommand {
    /// Dial a buddy.
    Connect {
        /// Buddy id.
        buddy_id: String,
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Close and forget a buddy.
    Disconnect {
        /// Buddy id.
        buddy_id: String,
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Send a chat message.
    SendMessage {
        /// Buddy id.
        buddy_id: String,
        /// Message text.
        text: String,
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Offer a file.
    SendFile {
        /// Buddy id.
        buddy_id: String,
        /// Source path.
        path: PathBuf,
        /// Reply channel; carries the transfer id.
        reply: oneshot::Sender<Result<String>>,
    },
    /// Cancel a transfer.
    AbortFileTransfer {
        /// Buddy id.
        buddy_id: String,
        /// Transfer id.
        transfer_id: String,
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Start a pending download.
    AcceptFileTransfer {
        /// Buddy id.
        buddy_id: String,
        /// Transfer id.
        transfer_id: String,
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Change our presence.
    SetPresence {
        /// New presence.
        presence: Presence,
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Tear everything down.
    Shutdown {
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
}

/// State shared by all engine tasks.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) peers: RwLock<HashMap<String, SharedPeer>>,
    pub(crate) monitors: MonitorRegistry,
    presence: RwLock<Presence>,
    shutdown: watch::Sender<bool>,
    shutdown_reported: AtomicBool,
}

/// A TorChat node.
///
/// Create with [`new`](Self::new), subscribe monitors, then
/// [`start`](Self::start). Every application method posts a request to the
/// engine's command task and waits for its answer.
pub struct TorChatEngine {
    inner: Arc<EngineInner>,
    commands: mpsc::Sender<EngineCommand>,
    command_rx: TokioMutex<Option<mpsc::Receiver<EngineCommand>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl TorChatEngine {
    /// Create an engine. Nothing runs until [`start`](Self::start).
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);

        Ok(Self {
            inner: Arc::new(EngineInner::new(config)),
            commands,
            command_rx: TokioMutex::new(Some(command_rx)),
            local_addr: OnceLock::new(),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Subscribe an event monitor. The engine keeps only a weak reference.
    pub fn add_monitor(&self, monitor: &Arc<dyn EventMonitor>) -> MonitorHandle {
        self.inner.monitors.add(monitor)
    }

    /// Unsubscribe an event monitor.
    pub fn remove_monitor(&self, handle: MonitorHandle) -> bool {
        self.inner.monitors.remove(handle)
    }

    /// Bind the listener and spawn the engine tasks.
    pub async fn start(&self) -> Result<SocketAddr> {
        let command_rx = self
            .command_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Engine("engine already started".into()))?;

        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        info!(addr = %addr, id = %RedactedId(&self.inner.config.my_id), "TorChat engine listening");
        self.inner.monitors.emit(|m| m.on_listening(addr));

        tokio::spawn(accept_loop(self.inner.clone(), listener));
        tokio::spawn(sweep_loop(self.inner.clone()));
        tokio::spawn(command_loop(self.inner.clone(), command_rx));

        Ok(addr)
    }

    /// Dial `buddy_id`. Returns once the dial is started.
    pub async fn connect(&self, buddy_id: &str) -> Result<()> {
        let buddy_id = buddy_id.to_string();
        self.post(|reply| EngineCommand::Connect { buddy_id, reply }).await
    }

    /// Close the session with `buddy_id` and forget the peer.
    pub async fn disconnect(&self, buddy_id: &str) -> Result<()> {
        let buddy_id = buddy_id.to_string();
        self.post(|reply| EngineCommand::Disconnect { buddy_id, reply }).await
    }

    /// Send a chat message to a READY buddy.
    pub async fn send_message(&self, buddy_id: &str, text: &str) -> Result<()> {
        let buddy_id = buddy_id.to_string();
        let text = text.to_string();
        self.post(|reply| EngineCommand::SendMessage { buddy_id, text, reply })
            .await
    }

    /// Offer a file to a READY buddy. Returns the transfer id.
    pub async fn send_file(&self, buddy_id: &str, path: impl Into<PathBuf>) -> Result<String> {
        let buddy_id = buddy_id.to_string();
        let path = path.into();
        self.post(|reply| EngineCommand::SendFile { buddy_id, path, reply })
            .await
    }

    /// Cancel a transfer in either direction.
    pub async fn abort_file_transfer(&self, buddy_id: &str, transfer_id: &str) -> Result<()> {
        let buddy_id = buddy_id.to_string();
        let transfer_id = transfer_id.to_string();
        self.post(|reply| EngineCommand::AbortFileTransfer {
            buddy_id,
            transfer_id,
            reply,
        })
        .await
    }

    /// Start a download that is waiting for approval.
    pub async fn accept_file_transfer(&self, buddy_id: &str, transfer_id: &str) -> Result<()> {
        let buddy_id = buddy_id.to_string();
        let transfer_id = transfer_id.to_string();
        self.post(|reply| EngineCommand::AcceptFileTransfer {
            buddy_id,
            transfer_id,
            reply,
        })
        .await
    }

    /// Change our presence and tell every READY buddy.
    pub async fn set_presence(&self, presence: Presence) -> Result<()> {
        self.post(|reply| EngineCommand::SetPresence { presence, reply }).await
    }

    /// Stop accepting, close every peer and report shutdown. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        match self.post(|reply| EngineCommand::Shutdown { reply }).await {
            Err(Error::Engine(_)) if self.inner.is_shutting_down() => Ok(()),
            other => other,
        }
    }

    /// State of a peer, if known.
    pub async fn peer_state(&self, buddy_id: &str) -> Option<PeerState> {
        let peer = self.inner.peer(buddy_id).await?;
        let state = peer.lock().await.state();
        Some(state)
    }

    /// Every known peer with its application-facing state.
    pub async fn buddies(&self) -> Vec<(String, BuddyState)> {
        let mut out = Vec::new();
        for peer in self.inner.all_peers().await {
            let p = peer.lock().await;
            out.push((p.id().to_string(), p.buddy_state()));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    async fn post<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> EngineCommand) -> Result<T> {
        if self.local_addr.get().is_none() {
            return Err(Error::Engine("engine not started".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::Engine("engine stopped".into()))?;
        rx.await.map_err(|_| Error::Engine("engine stopped".into()))?
    }
}

impl EngineInner {
    pub(crate) fn new(config: EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
            monitors: MonitorRegistry::new(),
            presence: RwLock::new(Presence::default()),
            shutdown,
            shutdown_reported: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn my_id(&self) -> &str {
        &self.config.my_id
    }

    pub(crate) async fn presence(&self) -> Presence {
        *self.presence.read().await
    }

    pub(crate) fn framer(&self) -> LineFramer {
        LineFramer::new(self.config.max_fragments, self.config.max_line_length)
    }

    pub(crate) async fn peer(&self, buddy_id: &str) -> Option<SharedPeer> {
        self.peers.read().await.get(buddy_id).cloned()
    }

    async fn all_peers(&self) -> Vec<SharedPeer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub(crate) async fn get_or_create_peer(&self, buddy_id: &str, initiative: Direction) -> SharedPeer {
        let mut peers = self.peers.write().await;
        peers
            .entry(buddy_id.to_string())
            .or_insert_with(|| {
                debug!(peer = %RedactedId(buddy_id), %initiative, "New peer");
                Arc::new(TokioMutex::new(Peer::new(buddy_id, initiative)))
            })
            .clone()
    }

    async fn is_current(&self, buddy_id: &str, peer: &SharedPeer) -> bool {
        self.peer(buddy_id).await.is_some_and(|p| Arc::ptr_eq(&p, peer))
    }

    /// Report the peer's state to monitors.
    pub(crate) fn notify_state(&self, peer: &Peer) {
        let update = BuddyStateUpdate {
            buddy_id: peer.id().to_string(),
            state: peer.buddy_state(),
            presence: peer.info().presence,
            info: peer.info().clone(),
        };
        self.monitors.emit(|m| m.on_buddy_state_update(&update));
    }

    pub(crate) fn notify_other(&self, buddy_id: &str, kind: OtherEventKind, description: impl Into<String>) {
        let event = OtherEvent::new(buddy_id, kind, description);
        self.monitors.emit(|m| m.on_other_event(&event));
    }

    /// Abort one transfer and drop it from the peer. With `notify` the
    /// buddy is told to stop as well.
    pub(crate) async fn abort_transfer(&self, peer: &mut Peer, transfer_id: &str, reason: &str, notify: bool) -> bool {
        let Some(mut transfer) = peer.transfers.remove(transfer_id) else {
            return false;
        };
        let out = if notify { peer.outbound().ok().cloned() } else { None };
        let aborted = transfer.abort(reason, out.as_ref()).await;
        if aborted {
            self.monitors.emit(|m| m.on_file_transfer_update(transfer.info()));
        }
        aborted
    }

    async fn abort_all_transfers(&self, peer: &mut Peer, reason: &str, notify: bool) {
        let ids: Vec<String> = peer.transfers.keys().cloned().collect();
        for id in ids {
            self.abort_transfer(peer, &id, reason, notify).await;
        }
    }

    /// Abort transfers, close both connections and report the peer offline.
    pub(crate) async fn close_peer(&self, peer: &mut Peer, notify_transfers: bool) {
        self.abort_all_transfers(peer, REASON_DISCONNECTED, notify_transfers).await;
        let was = peer.state();
        peer.close();
        if was != PeerState::Done {
            info!(peer = %RedactedId(peer.id()), "Peer closed");
            self.notify_state(peer);
        }
    }

    /// Close a peer and erase it from the table.
    pub(crate) async fn remove_peer(&self, buddy_id: &str) -> bool {
        let Some(peer) = self.peers.write().await.remove(buddy_id) else {
            return false;
        };
        let mut p = peer.lock().await;
        self.close_peer(&mut p, true).await;
        info!(peer = %RedactedId(buddy_id), "Peer removed");
        true
    }

    /// A request loop ended: forget its connection, and close the peer if
    /// nothing is left.
    async fn connection_lost(&self, peer: &SharedPeer, conn: &ConnectionHandle) {
        let mut p = peer.lock().await;
        if !p.detach(conn) {
            return;
        }
        debug!(peer = %RedactedId(p.id()), direction = %conn.direction(), "Connection lost");
        if !p.is_connected() && !p.dialing {
            self.notify_other(p.id(), OtherEventKind::Disconnecting, "connection lost");
            self.close_peer(&mut p, false).await;
        }
    }

    /// Mark the peer as dialing and spawn the dial, unless one is running.
    fn spawn_dial(self: &Arc<Self>, peer: &mut Peer, shared: SharedPeer) {
        if peer.dialing || self.is_shutting_down() {
            return;
        }
        peer.dialing = true;
        tokio::spawn(dial(self.clone(), shared, peer.id().to_string()));
    }

    // ---- application commands ----

    async fn execute(self: &Arc<Self>, command: EngineCommand) {
        match command {
            EngineCommand::Connect { buddy_id, reply } => {
                let _ = reply.send(self.cmd_connect(&buddy_id).await);
            }
            EngineCommand::Disconnect { buddy_id, reply } => {
                let _ = reply.send(self.cmd_disconnect(&buddy_id).await);
            }
            EngineCommand::SendMessage { buddy_id, text, reply } => {
                let _ = reply.send(self.cmd_send_message(&buddy_id, &text).await);
            }
            EngineCommand::SendFile { buddy_id, path, reply } => {
                let _ = reply.send(self.cmd_send_file(&buddy_id, path).await);
            }
            EngineCommand::AbortFileTransfer {
                buddy_id,
                transfer_id,
                reply,
            } => {
                let _ = reply.send(self.cmd_abort_file_transfer(&buddy_id, &transfer_id).await);
            }
            EngineCommand::AcceptFileTransfer {
                buddy_id,
                transfer_id,
                reply,
            } => {
                let _ = reply.send(self.cmd_accept_file_transfer(&buddy_id, &transfer_id).await);
            }
            EngineCommand::SetPresence { presence, reply } => {
                let _ = reply.send(self.cmd_set_presence(presence).await);
            }
            EngineCommand::Shutdown { reply } => {
                self.cmd_shutdown().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn ready_peer(&self, buddy_id: &str) -> Result<SharedPeer> {
        self.peer(buddy_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("unknown buddy {}", RedactedId(buddy_id))))
    }

    async fn cmd_connect(self: &Arc<Self>, buddy_id: &str) -> Result<()> {
        if !is_valid_peer_id(buddy_id) {
            return Err(Error::InvalidArgument(format!("invalid buddy id '{}'", buddy_id)));
        }
        if buddy_id == self.my_id() {
            return Err(Error::InvalidArgument("cannot connect to self".into()));
        }
        let shared = self.get_or_create_peer(buddy_id, Direction::Outbound).await;
        let mut peer = shared.lock().await;
        if peer.has_live_outbound() {
            debug!(peer = %RedactedId(buddy_id), "Already connected");
            return Ok(());
        }
        peer.revive();
        peer.retry_at = None;
        self.spawn_dial(&mut peer, shared.clone());
        Ok(())
    }

    async fn cmd_disconnect(&self, buddy_id: &str) -> Result<()> {
        if self.remove_peer(buddy_id).await {
            self.notify_other(buddy_id, OtherEventKind::Disconnecting, "disconnected by user");
            Ok(())
        } else {
            Err(Error::NotFound(format!("unknown buddy {}", RedactedId(buddy_id))))
        }
    }

    async fn cmd_send_message(&self, buddy_id: &str, text: &str) -> Result<()> {
        let shared = self.ready_peer(buddy_id).await?;
        let peer = shared.lock().await;
        if peer.state() != PeerState::Ready {
            return Err(Error::NotConnected(format!("{} is not ready", RedactedId(buddy_id))));
        }
        peer.send(format_line(Verb::Message, &[text.as_bytes()]))?;
        debug!(peer = %RedactedId(buddy_id), len = text.len(), "Message queued");
        self.notify_other(buddy_id, OtherEventKind::MessageTransmitted, "message sent");
        Ok(())
    }

    async fn cmd_send_file(&self, buddy_id: &str, path: PathBuf) -> Result<String> {
        let shared = self.ready_peer(buddy_id).await?;
        let mut peer = shared.lock().await;
        if peer.state() != PeerState::Ready {
            return Err(Error::NotConnected(format!("{} is not ready", RedactedId(buddy_id))));
        }
        if peer.active_transfers() >= self.config.max_file_transfers {
            return Err(Error::Transfer("too many concurrent transfers".into()));
        }
        let out = peer.outbound()?.clone();

        let mut transfer = FileTransfer::outgoing(
            buddy_id,
            &path,
            self.config.block_size,
            self.config.max_out_buffers,
        )
        .await?;
        let transfer_id = transfer.cookie().to_string();

        if let Err(e) = transfer.start_sending(&out).await {
            transfer.abort(&failure_reason(&e), Some(&out)).await;
            self.monitors.emit(|m| m.on_file_transfer_update(transfer.info()));
            return Err(e);
        }
        self.monitors.emit(|m| m.on_file_transfer_update(transfer.info()));
        if transfer.state() != TransferState::Done {
            peer.transfers.insert(transfer_id.clone(), transfer);
        }
        Ok(transfer_id)
    }

    async fn cmd_abort_file_transfer(&self, buddy_id: &str, transfer_id: &str) -> Result<()> {
        let shared = self.ready_peer(buddy_id).await?;
        let mut peer = shared.lock().await;
        if self.abort_transfer(&mut peer, transfer_id, REASON_CANCELLED, true).await {
            Ok(())
        } else {
            Err(Error::NotFound(format!("unknown transfer {}", transfer_id)))
        }
    }

    async fn cmd_accept_file_transfer(&self, buddy_id: &str, transfer_id: &str) -> Result<()> {
        let shared = self.ready_peer(buddy_id).await?;
        let mut peer = shared.lock().await;
        let out = peer.outbound()?.clone();
        let folder = self.config.download_dir(buddy_id);
        let transfer = peer
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| Error::NotFound(format!("unknown transfer {}", transfer_id)))?;
        if transfer.direction() != Direction::Inbound || transfer.state() != TransferState::Unverified {
            return Err(Error::InvalidArgument(format!("transfer {} is not pending", transfer_id)));
        }

        let result = transfer.start_download(&folder, &out).await;
        let done = transfer.state() == TransferState::Done;
        match result {
            Ok(()) => {
                self.monitors.emit(|m| m.on_file_transfer_update(transfer.info()));
                if done {
                    peer.transfers.remove(transfer_id);
                }
                Ok(())
            }
            Err(e) => {
                self.abort_transfer(&mut peer, transfer_id, &failure_reason(&e), true).await;
                Err(e)
            }
        }
    }

    async fn cmd_set_presence(&self, presence: Presence) -> Result<()> {
        *self.presence.write().await = presence;
        info!(%presence, "Presence changed");
        let line = format_line(Verb::Status, &[presence.as_str().as_bytes()]);
        for shared in self.all_peers().await {
            let peer = shared.lock().await;
            if peer.state() == PeerState::Ready {
                if let Err(e) = peer.send(line.clone()) {
                    debug!(peer = %RedactedId(peer.id()), error = %e, "Could not send status");
                }
            }
        }
        Ok(())
    }

    async fn cmd_shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down TorChat engine");
        let peers: Vec<SharedPeer> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for shared in peers {
            let mut peer = shared.lock().await;
            self.close_peer(&mut peer, true).await;
        }
        if !self.shutdown_reported.swap(true, Ordering::SeqCst) {
            self.monitors.emit(|m| m.on_shutdown_complete());
        }
        info!("TorChat engine stopped");
    }
}

async fn command_loop(inner: Arc<EngineInner>, mut rx: mpsc::Receiver<EngineCommand>) {
    while let Some(command) = rx.recv().await {
        let stop = matches!(command, EngineCommand::Shutdown { .. });
        inner.execute(command).await;
        if stop {
            break;
        }
    }
    debug!("Command loop stopped");
}

async fn accept_loop(inner: Arc<EngineInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(from = %addr, "Accepted connection");
                    tokio::spawn(handle_inbound(inner.clone(), stream, addr));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Accept loop stopped");
}

/// Run one accepted connection: greeting, peer lookup, then requests.
async fn handle_inbound(inner: Arc<EngineInner>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not disable nagle");
    }
    let (conn, mut reader) = Connection::accepted(format!("in-{}", addr), stream).into_split(inner.framer());

    let greeting = match tokio::time::timeout(inner.config.connect_timeout, reader.get_line()).await {
        Ok(Ok(line)) => line,
        Ok(Err(e)) => {
            debug!(connection = %conn.name(), error = %e, "Connection closed before greeting");
            conn.close();
            return;
        }
        Err(_) => {
            debug!(connection = %conn.name(), "No greeting before timeout");
            conn.close();
            return;
        }
    };

    let (buddy_id, cookie) = match parse_greeting(&greeting) {
        Some(parsed) => parsed,
        None => {
            debug!(connection = %conn.name(), "Malformed greeting dropped");
            conn.close();
            return;
        }
    };
    if buddy_id == inner.my_id() {
        debug!(connection = %conn.name(), "Greeting with our own id dropped");
        conn.close();
        return;
    }
    if !inner.monitors.approve(|m| m.on_incoming_connection(&buddy_id)) {
        info!(peer = %RedactedId(&buddy_id), "Incoming connection refused");
        conn.close();
        return;
    }
    if inner.is_shutting_down() {
        conn.close();
        return;
    }

    let shared = inner.get_or_create_peer(&buddy_id, Direction::Inbound).await;
    {
        let mut peer = shared.lock().await;
        peer.revive();

        if peer.has_live_inbound() {
            if peer.peer_cookie.as_deref() != Some(cookie.as_str()) {
                warn!(peer = %RedactedId(&buddy_id), "Cookie mismatch on new inbound connection, keeping existing");
                conn.close();
                return;
            }
            // both sides run the same comparison and keep the same session
            if inner.my_id() > buddy_id.as_str() {
                debug!(peer = %RedactedId(&buddy_id), "Duplicate inbound connection, keeping existing");
                conn.close();
                return;
            }
            debug!(peer = %RedactedId(&buddy_id), "Duplicate inbound connection, replacing existing");
            if let Some(old) = peer.inbound.take() {
                old.close();
            }
        }

        if let Err(e) = peer.set_inbound(conn.clone()) {
            warn!(peer = %RedactedId(&buddy_id), error = %e, "Could not install inbound connection");
            conn.close();
            return;
        }
        info!(peer = %RedactedId(&buddy_id), "Inbound connection");
        peer.upgrade_state(PeerState::Accepting);
        handlers::accept_ping(&mut peer, &cookie);
        inner.notify_state(&peer);

        if !peer.has_live_outbound() {
            inner.spawn_dial(&mut peer, shared.clone());
        }
    }

    request_loop(inner, shared, conn, reader).await;
}

fn parse_greeting(line: &[u8]) -> Option<(String, String)> {
    let req = Request::parse(line).ok()?;
    if req.verb() != Verb::Ping {
        return None;
    }
    let buddy_id = req.arg_str(0).ok()?;
    let cookie = req.arg_str(1).ok()?;
    if !is_valid_peer_id(buddy_id) || cookie.is_empty() || cookie.contains(' ') {
        return None;
    }
    Some((buddy_id.to_string(), cookie.to_string()))
}

/// Dial a peer, send our greeting and run the outbound request loop.
async fn dial(inner: Arc<EngineInner>, shared: SharedPeer, buddy_id: String) {
    {
        let mut peer = shared.lock().await;
        peer.revive();
        peer.upgrade_state(PeerState::Connecting);
        inner.notify_state(&peer);
    }
    inner.notify_other(&buddy_id, OtherEventKind::Connecting, "dialing");
    info!(peer = %RedactedId(&buddy_id), "Dialing");

    let result = Connection::connect(
        format!("out-{}", RedactedId(&buddy_id)),
        &onion_hostname(&buddy_id),
        inner.config.peer_port,
        inner.config.tor_proxy,
        inner.config.connect_timeout,
    )
    .await;

    let connection = match result {
        Ok(connection) => connection,
        Err(e) => {
            info!(peer = %RedactedId(&buddy_id), error = %e, "Peer unreachable");
            let mut peer = shared.lock().await;
            peer.dialing = false;
            if !peer.is_connected() {
                inner.close_peer(&mut peer, false).await;
            }
            return;
        }
    };

    let (conn, reader) = connection.into_split(inner.framer());
    {
        let mut peer = shared.lock().await;
        peer.dialing = false;
        if inner.is_shutting_down() || !inner.is_current(&buddy_id, &shared).await {
            debug!(peer = %RedactedId(&buddy_id), "Peer gone while dialing");
            conn.close();
            return;
        }
        peer.revive();
        if let Err(e) = peer.set_outbound(conn.clone()) {
            debug!(peer = %RedactedId(&buddy_id), error = %e, "Dropping redundant outbound connection");
            conn.close();
            return;
        }
        peer.upgrade_state(PeerState::Authenticating);

        let ping = format_line(Verb::Ping, &[inner.my_id().as_bytes(), peer.my_cookie.as_bytes()]);
        if let Err(e) = conn.send_line(ping) {
            debug!(peer = %RedactedId(&buddy_id), error = %e, "Could not send ping");
        }
        peer.sent_ping = true;
        handlers::send_pong_if_due(&mut peer);
        inner.notify_state(&peer);
    }

    request_loop(inner, shared, conn, reader).await;
}

/// Process lines from one connection until it closes.
async fn request_loop<R: AsyncRead + Unpin>(
    inner: Arc<EngineInner>,
    shared: SharedPeer,
    conn: ConnectionHandle,
    mut reader: ConnectionReader<R>,
) {
    loop {
        let line = match reader.get_line().await {
            Ok(line) => line,
            Err(e) if e.is_connection_fatal() => {
                debug!(connection = %reader.name(), error = %e, "Request loop ending");
                break;
            }
            Err(e) => {
                warn!(connection = %reader.name(), error = %e, "Unexpected read failure");
                break;
            }
        };
        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection = %reader.name(), error = %e, "Malformed line dropped");
                continue;
            }
        };

        match handlers::dispatch(&inner, &shared, &conn, &request).await {
            Ok(Outcome::Continue) => {}
            Ok(Outcome::DropConnection) => {
                info!(connection = %reader.name(), verb = %request.name_lossy(), "Dropping connection");
                conn.close();
                break;
            }
            Ok(Outcome::AbortTransfer { transfer_id, reason }) => {
                let mut peer = shared.lock().await;
                inner.abort_transfer(&mut peer, &transfer_id, &reason, true).await;
            }
            Ok(Outcome::ClosePeer) => {
                let buddy_id = shared.lock().await.id().to_string();
                if inner.is_current(&buddy_id, &shared).await {
                    inner.remove_peer(&buddy_id).await;
                } else {
                    let mut peer = shared.lock().await;
                    inner.close_peer(&mut peer, false).await;
                }
                break;
            }
            Err(e) if e.should_silent_drop() => {
                debug!(connection = %reader.name(), verb = %request.name_lossy(), error = %e, "Request dropped");
            }
            Err(e) => {
                warn!(connection = %reader.name(), verb = %request.name_lossy(), error = %e, "Handler failed");
            }
        }
    }
    inner.connection_lost(&shared, &conn).await;
}

async fn sweep_loop(inner: Arc<EngineInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut interval = tokio::time::interval(inner.config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => sweep(&inner).await,
            _ = shutdown.changed() => break,
        }
    }
    debug!("Sweep loop stopped");
}

/// One pass over every peer: reconnect back-off, status silence, keep-alive.
pub(crate) async fn sweep(inner: &Arc<EngineInner>) {
    let presence = inner.presence().await;
    let now = Instant::now();

    for shared in inner.all_peers().await {
        let mut peer = shared.lock().await;
        if peer.dialing {
            continue;
        }
        let mut reconnect = false;

        if !peer.is_connected() {
            match peer.retry_at {
                None => {
                    let delay = inner.config.reconnect_delay(peer.reconnect_count());
                    debug!(peer = %RedactedId(peer.id()), delay_secs = delay.as_secs(), "Reconnect scheduled");
                    peer.retry_at = Some(now + delay);
                }
                Some(at) if now >= at => reconnect = true,
                Some(_) => {}
            }
        } else if peer.retry_at.is_some_and(|at| now >= at)
            && peer.state() == PeerState::Ready
            && peer.has_live_inbound()
            && peer.has_live_outbound()
        {
            peer.retry_at = None;
        }

        if peer.state() == PeerState::Ready {
            if peer.status_deadline.is_some_and(|d| now >= d) {
                warn!(peer = %RedactedId(peer.id()), "No status from peer, reconnecting");
                reconnect = true;
            } else if peer.keepalive_at.is_some_and(|k| now >= k) {
                let line = format_line(Verb::Status, &[presence.as_str().as_bytes()]);
                if let Err(e) = peer.send(line) {
                    debug!(peer = %RedactedId(peer.id()), error = %e, "Keep-alive failed");
                }
                peer.schedule_keepalive(now, inner.config.keepalive_min, inner.config.keepalive_max);
            }
        }

        if reconnect {
            inner.abort_all_transfers(&mut peer, REASON_DISCONNECTED, true).await;
            peer.reset_for_reconnect();
            inner.notify_state(&peer);
            inner.spawn_dial(&mut peer, shared.clone());
        }
    }
}
