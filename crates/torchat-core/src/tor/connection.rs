//! Peer connections.
//!
//! A [`Connection`] is one TCP stream bound to a peer in one direction:
//! dialled through Tor's SOCKS5 proxy (outbound) or accepted from the
//! hidden-service listener (inbound). Once established it is split into a
//! [`ConnectionReader`], owned by the request loop, and a cloneable
//! [`ConnectionHandle`] whose lines are queued to a writer task.
//!
//! Closing a handle is the only cancellation mechanism: it wakes a reader
//! suspended in [`ConnectionReader::get_line`] and stops the writer.

use crate::error::{Error, Result};
use crate::protocol::codec::{encode_line, LineFramer};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Size of the scratch buffer used for each socket read.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Lines queued for the writer task before `send_line` refuses more.
pub const OUTBOX_CAPACITY: usize = 256;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Accepted from the listener; the remote side dialled us.
    Inbound,
    /// Dialled by this node.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("in"),
            Direction::Outbound => f.write_str("out"),
        }
    }
}

/// Reader half of an established connection over a TCP stream.
pub type TcpLineReader = ConnectionReader<ReadHalf<TcpStream>>;

/// An established, not yet split, connection.
pub struct Connection<S = TcpStream> {
    name: String,
    direction: Direction,
    stream: S,
}

impl Connection<TcpStream> {
    /// Dial `host:port`, through the SOCKS5 `proxy` when one is given.
    ///
    /// The whole attempt (TCP connect plus SOCKS5 negotiation) runs under
    /// `timeout`; on expiry the socket is dropped and [`Error::Timeout`]
    /// returned.
    pub async fn connect(
        name: impl Into<String>,
        host: &str,
        port: u16,
        proxy: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let stream = tokio::time::timeout(timeout, async {
            match proxy {
                Some(proxy) => {
                    let mut stream = TcpStream::connect(proxy).await?;
                    socks5_connect(&mut stream, host, port).await?;
                    Ok::<_, Error>(stream)
                }
                None => Ok(TcpStream::connect((host, port)).await?),
            }
        })
        .await??;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection = %name, error = %e, "Could not disable nagle");
        }

        debug!(connection = %name, host_len = host.len(), via_proxy = proxy.is_some(), "Connected");
        Ok(Self {
            name,
            direction: Direction::Outbound,
            stream,
        })
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a stream accepted from the listener.
    pub fn accepted(name: impl Into<String>, stream: S) -> Self {
        Self::from_stream(name, Direction::Inbound, stream)
    }

    /// Wrap an arbitrary established stream.
    pub fn from_stream(name: impl Into<String>, direction: Direction, stream: S) -> Self {
        Self {
            name: name.into(),
            direction,
            stream,
        }
    }

    /// Connection name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Split into a reader and a handle, spawning the writer task.
    pub fn into_split(self, framer: LineFramer) -> (ConnectionHandle, ConnectionReader<ReadHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        let (handle, outbox) = ConnectionHandle::new(self.name, self.direction);
        tokio::spawn(write_loop(write, outbox, handle.shared.clone()));
        let reader = ConnectionReader::new(read, framer, &handle);
        (handle, reader)
    }
}

struct Shared {
    name: String,
    direction: Direction,
    closed: watch::Sender<bool>,
}

/// Cloneable sending side of a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    outbox: mpsc::Sender<Vec<u8>>,
}

impl ConnectionHandle {
    /// A handle whose lines land in the returned receiver instead of a socket.
    pub(crate) fn new(
        name: impl Into<String>,
        direction: Direction,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (closed, _) = watch::channel(false);
        let handle = Self {
            shared: Arc::new(Shared {
                name: name.into(),
                direction,
                closed,
            }),
            outbox,
        };
        (handle, rx)
    }

    /// Queue one unescaped line for sending.
    ///
    /// Fails with [`Error::NotConnected`] when [`OUTBOX_CAPACITY`] lines are
    /// already waiting, e.g. on a stalled circuit.
    pub fn send_line(&self, line: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Closed);
        }
        self.outbox.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::NotConnected(format!("{}: send queue full", self.shared.name))
            }
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.send_replace(true) {
            debug!(connection = %self.shared.name, "Closing connection");
        }
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        !*self.shared.closed.borrow() && !self.outbox.is_closed()
    }

    /// Connection name used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Direction.
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Whether both handles refer to the same connection.
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.shared.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Receiving side of a connection.
pub struct ConnectionReader<R> {
    reader: R,
    framer: LineFramer,
    buf: Vec<u8>,
    closed: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    fn new(reader: R, framer: LineFramer, handle: &ConnectionHandle) -> Self {
        Self {
            reader,
            framer,
            buf: vec![0u8; READ_BUFFER_SIZE],
            closed: handle.shared.closed.subscribe(),
            shared: handle.shared.clone(),
        }
    }

    /// Read the next decoded line.
    ///
    /// Fails with [`Error::Closed`] once the connection is closed from
    /// either side. Framing and socket errors close the connection.
    pub async fn get_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(line) = self.framer.next_line() {
                return Ok(line);
            }
            if *self.closed.borrow() {
                return Err(Error::Closed);
            }

            let read = tokio::select! {
                read = self.reader.read(&mut self.buf) => read,
                _ = wait_closed(&mut self.closed) => return Err(Error::Closed),
            };

            let result = match read {
                Ok(0) => Err(Error::Closed),
                Ok(n) => self.framer.feed(&self.buf[..n]),
                Err(e) => Err(Error::Io(e)),
            };
            if let Err(e) = result {
                self.shared.closed.send_replace(true);
                return Err(e);
            }
        }
    }

    /// Connection name used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbox: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let mut closed = shared.closed.subscribe();
    loop {
        tokio::select! {
            line = outbox.recv() => match line {
                Some(line) => {
                    if let Err(e) = write_line(&mut writer, &line).await {
                        debug!(connection = %shared.name, error = %e, "Write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = wait_closed(&mut closed) => {
                // lines queued before the close still go out
                while let Ok(line) = outbox.try_recv() {
                    if write_line(&mut writer, &line).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    shared.closed.send_replace(true);
    let _ = writer.shutdown().await;
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(&encode_line(line)).await?;
    writer.flush().await
}

/// SOCKS5 CONNECT to `host:port` over an already open proxy stream.
///
/// No authentication, domain-name addressing. The bound address in the
/// reply is read and discarded.
pub async fn socks5_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = host.as_bytes();
    if host.is_empty() || host.len() > 255 {
        return Err(Error::Socks(format!("invalid hostname length {}", host.len())));
    }

    stream.write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [SOCKS_VERSION, SOCKS_NO_AUTH] {
        return Err(Error::Socks(format!(
            "proxy refused no-auth negotiation (version {}, method {})",
            method[0], method[1]
        )));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00, SOCKS_ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!("unexpected reply version {}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(Error::Socks(format!("connect rejected with status {}", reply[1])));
    }

    let bound_len = match reply[3] {
        SOCKS_ATYP_IPV4 => 4 + 2,
        SOCKS_ATYP_IPV6 => 16 + 2,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(Error::Socks(format!("unknown bound address type {}", other))),
    };
    let mut bound = vec![0u8; bound_len];
    stream.read_exact(&mut bound).await?;

    Ok(())
}
