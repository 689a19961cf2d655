//! Transports: moving opaque MTProto packets over a concrete medium.
//!
//! Every live connection is an actor task owning its socket. The session
//! side holds a [`Link`]: packets go out through a channel and
//! [`TransportEvent`]s come back through another, so receiving is
//! cancel-safe inside `tokio::select!`. Dropping the link tears the actor
//! down.
//!
//! * [`TransportKind::Tcp`]: framed stream ([`tcp`]).
//! * [`TransportKind::Http`]: one `POST /api` per packet ([`http`]).
//! * [`TransportKind::Auto`]: races both with a `req_pq` probe ([`auto`]).

pub mod auto;
pub mod http;
pub mod tcp;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use mtp_proto::transport::FramingKind;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::Config;
use crate::errors::TransportError;
use crate::socks5::Socks5Config;

/// Packets buffered in each direction of a link.
const LINK_CAPACITY: usize = 64;

/// Which medium a connection uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Framed TCP stream.
    Tcp,
    /// HTTP/1.1 `POST /api` on port 80.
    Http,
    /// Try both, keep whichever answers first (TCP preferred).
    #[default]
    Auto,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Auto => "auto",
        })
    }
}

/// What a transport reports to its session.
#[derive(Debug)]
pub enum TransportEvent {
    /// One packet, framing removed.
    Packet(Vec<u8>),
    /// The transport failed; nothing follows.
    Error(TransportError),
}

// ─── Link ────────────────────────────────────────────────────────────────────

/// The session's handle to a transport actor.
pub struct Link {
    kind:     TransportKind,
    peer:     String,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound:  mpsc::Receiver<TransportEvent>,
    token:    CancellationToken,
    _guard:   DropGuard,
}

/// The actor's half of a [`Link`].
pub struct LinkPeer {
    /// Packets the session wants sent.
    pub outbound: mpsc::Receiver<Vec<u8>>,
    /// Where received packets and errors go.
    pub inbound:  mpsc::Sender<TransportEvent>,
    /// Cancelled once the link is dropped or disconnected.
    pub token:    CancellationToken,
}

impl Link {
    /// A connected link and the actor half that serves it.
    ///
    /// `kind` must be the concrete medium ([`TransportKind::Tcp`] or
    /// [`TransportKind::Http`]); `peer` is only used for diagnostics.
    pub fn pair(kind: TransportKind, peer: impl Into<String>) -> (Self, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
        let token = CancellationToken::new();
        let link = Self {
            kind,
            peer: peer.into(),
            outbound: out_tx,
            inbound: in_rx,
            _guard: token.clone().drop_guard(),
            token: token.clone(),
        };
        (link, LinkPeer { outbound: out_rx, inbound: in_tx, token })
    }

    /// The medium this link runs over.
    pub fn kind(&self) -> TransportKind { self.kind }

    /// Queue one packet.
    pub async fn send(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.outbound.send(packet).await.map_err(|_| TransportError::Closed)
    }

    /// Next event; `None` once the actor is gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    /// Whether the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.token.is_cancelled() && !self.outbound.is_closed()
    }

    /// One-line description for logs.
    pub fn debug_state(&self) -> String {
        let state = if self.is_connected() { "connected" } else { "disconnected" };
        let queued = LINK_CAPACITY - self.outbound.capacity();
        format!("{} {} {state}, {queued} queued", self.kind, self.peer)
    }

    /// Stop the actor.
    pub fn disconnect(self) {
        self.token.cancel();
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_state())
    }
}

impl LinkPeer {
    /// Next packet to send; `None` once the link is gone.
    pub async fn recv_outbound(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            packet = self.outbound.recv() => packet,
        }
    }

    /// Hand an event to the session. Returns `false` if it went away.
    pub async fn deliver(&self, event: TransportEvent) -> bool {
        self.inbound.send(event).await.is_ok()
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send + 'a>>;

/// Opens links to a DC. Swap it out to run the client against anything
/// that speaks MTProto, such as an in-memory server.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, dc_id: i32, addr: &'a str) -> ConnectFuture<'a>;
}

/// The network connector: real sockets, optionally through SOCKS5.
#[derive(Clone, Debug)]
pub struct NetConnector {
    pub kind:            TransportKind,
    pub framing:         FramingKind,
    pub socks5:          Option<Socks5Config>,
    pub connect_timeout: Duration,
    /// Port HTTP connections use on the DC's host.
    pub http_port:       u16,
}

impl NetConnector {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            framing: FramingKind::default(),
            socks5: None,
            connect_timeout: Duration::from_secs(8),
            http_port: 80,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            kind: config.transport,
            framing: config.framing,
            socks5: config.socks5.clone(),
            connect_timeout: config.connect_timeout,
            http_port: 80,
        }
    }
}

impl Connector for NetConnector {
    fn connect<'a>(&'a self, dc_id: i32, addr: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            tracing::debug!("[mtp] DC{dc_id}: dialing {addr} over {}", self.kind);
            match self.kind {
                TransportKind::Tcp => tcp::connect(self, addr).await,
                TransportKind::Http => http::connect(self, addr).await,
                TransportKind::Auto => auto::connect(self, addr).await,
            }
        })
    }
}

/// Open a TCP stream to `addr` within the connect timeout and tune it.
pub(crate) async fn dial(net: &NetConnector, addr: &str) -> Result<TcpStream, TransportError> {
    let connecting = async {
        match &net.socks5 {
            Some(proxy) => proxy.connect(addr).await,
            None => Ok(TcpStream::connect(addr).await?),
        }
    };
    let stream = tokio::time::timeout(net.connect_timeout, connecting)
        .await
        .map_err(|_| TransportError::Timeout)??;
    tune(&stream)?;
    Ok(stream)
}

fn tune(stream: &TcpStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    sock.set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_the_link_stops_the_peer() {
        let (link, mut peer) = Link::pair(TransportKind::Tcp, "test");
        link.send(vec![1, 2, 3, 4]).await.unwrap();
        assert_eq!(peer.recv_outbound().await, Some(vec![1, 2, 3, 4]));
        drop(link);
        assert!(peer.token.is_cancelled());
        assert_eq!(peer.recv_outbound().await, None);
        assert!(!peer.deliver(TransportEvent::Packet(vec![0; 4])).await);
    }

    #[tokio::test]
    async fn link_reports_peer_events() {
        let (mut link, peer) = Link::pair(TransportKind::Http, "127.0.0.1:80");
        assert!(link.is_connected());
        assert!(link.debug_state().starts_with("http 127.0.0.1:80 connected"));
        assert!(peer.deliver(TransportEvent::Error(TransportError::Code(-404))).await);
        assert!(matches!(link.recv().await, Some(TransportEvent::Error(TransportError::Code(-404)))));
        drop(peer);
        assert!(link.recv().await.is_none());
    }
}
