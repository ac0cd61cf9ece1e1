//! Shared helpers for the integration tests.
//!
//! `MockTor` is a SOCKS5 proxy that resolves `<id>.onion` to local
//! listeners, so two engines can reach each other without a Tor daemon.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use torchat_core::{ChannelMonitor, EngineConfig, EngineEvent, EventMonitor, TorChatEngine};
use tracing_subscriber::EnvFilter;

/// How long a test waits for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

pub const ALICE: &str = "alicealicealice2";
pub const BOB: &str = "bobbobbobbobbob2";
pub const CAROL: &str = "carolcarolcarol2";

/// In-process SOCKS5 proxy routing onion hostnames to local addresses.
pub struct MockTor {
    addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, SocketAddr>>>,
}

impl MockTor {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("proxy addr");
        let routes: Arc<Mutex<HashMap<String, SocketAddr>>> = Arc::default();

        let table = routes.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let table = table.clone();
                tokio::spawn(async move {
                    let _ = serve_socks(stream, table).await;
                });
            }
        });

        Self { addr, routes }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Make `<id>.onion` reach `target`.
    pub fn route(&self, id: &str, target: SocketAddr) {
        self.routes.lock().unwrap().insert(format!("{}.onion", id), target);
    }
}

async fn serve_socks(
    mut client: TcpStream,
    routes: Arc<Mutex<HashMap<String, SocketAddr>>>,
) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    assert_eq!(request[..3], [5, 1, 0]);
    assert_eq!(request[3], 3, "engine must use domain addressing");
    let mut len = [0u8; 1];
    client.read_exact(&mut len).await?;
    let mut host = vec![0u8; len[0] as usize];
    client.read_exact(&mut host).await?;
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;

    let host = String::from_utf8_lossy(&host).into_owned();
    let target = routes.lock().unwrap().get(&host).copied();
    let upstream = match target {
        Some(target) => TcpStream::connect(target).await.ok(),
        None => None,
    };
    let Some(mut upstream) = upstream else {
        // host unreachable
        client.write_all(&[5, 4, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    };
    client.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Route engine logs to the test harness. `RUST_LOG` selects the level;
/// without it nothing is printed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A running engine with a channel monitor attached.
pub struct Node {
    pub id: &'static str,
    pub engine: Arc<TorChatEngine>,
    pub events: UnboundedReceiver<EngineEvent>,
    pub addr: SocketAddr,
    _monitor: Arc<dyn EventMonitor>,
}

/// Config for a test node: ephemeral listener, mock proxy, downloads under `dir`.
pub fn test_config(id: &str, tor: &MockTor, dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::with_id(id);
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.tor_proxy = Some(tor.addr());
    config.download_folder = dir.join("{id}").to_string_lossy().into_owned();
    config.connect_timeout = Duration::from_secs(5);
    config
}

pub async fn start_node(id: &'static str, tor: &MockTor, config: EngineConfig) -> Node {
    start_node_with_policy(id, tor, config, true).await
}

pub async fn start_node_with_policy(
    id: &'static str,
    tor: &MockTor,
    config: EngineConfig,
    approve: bool,
) -> Node {
    init_tracing();
    let engine = Arc::new(TorChatEngine::new(config).expect("create engine"));
    let (monitor, events) = ChannelMonitor::with_policy(approve);
    let monitor: Arc<dyn EventMonitor> = monitor;
    engine.add_monitor(&monitor);
    let addr = engine.start().await.expect("start engine");
    tor.route(id, addr);
    Node {
        id,
        engine,
        events,
        addr,
        _monitor: monitor,
    }
}

impl Node {
    /// Wait for the first event matching `pred`, skipping others.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> EngineEvent
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        let id = self.id;
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} timed out waiting for event", id))
    }

    /// Wait until `buddy` is reported in `state`.
    pub async fn wait_buddy_state(&mut self, buddy: &str, state: torchat_core::BuddyState) {
        self.wait_for(|e| {
            matches!(e, EngineEvent::BuddyStateUpdate(u) if u.buddy_id == buddy && u.state == state)
        })
        .await;
    }
}

/// Start two nodes and bring them to READY with each other.
pub async fn connected_pair(tor: &MockTor, dir: &Path) -> (Node, Node) {
    let mut alice = start_node(ALICE, tor, test_config(ALICE, tor, &dir.join("alice"))).await;
    let mut bob = start_node(BOB, tor, test_config(BOB, tor, &dir.join("bob"))).await;
    alice.engine.connect(BOB).await.expect("connect");
    alice.wait_buddy_state(BOB, torchat_core::BuddyState::OnLine).await;
    bob.wait_buddy_state(ALICE, torchat_core::BuddyState::OnLine).await;
    (alice, bob)
}
