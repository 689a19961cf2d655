//! TCP transport: a framed byte stream ([`FramingKind`] picks the framing).
//!
//! [`FramingKind`]: mtp_proto::transport::FramingKind

use mtp_proto::transport::{Framing, error_code};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Link, LinkPeer, NetConnector, TransportEvent, TransportKind, dial};
use crate::errors::TransportError;

const READ_CHUNK: usize = 16 * 1024;

/// Dial `addr` and start the actor.
pub async fn connect(net: &NetConnector, addr: &str) -> Result<Link, TransportError> {
    let stream = dial(net, addr).await?;
    tracing::info!("[mtp] tcp connected to {addr}");
    let (link, peer) = Link::pair(TransportKind::Tcp, addr);
    tokio::spawn(run(stream, net.framing.codec(), peer));
    Ok(link)
}

async fn run(stream: TcpStream, codec: Box<dyn Framing>, mut peer: LinkPeer) {
    match pump(stream, codec, &mut peer).await {
        Ok(()) => tracing::debug!("[mtp] tcp link closed"),
        Err(e) => {
            tracing::warn!("[mtp] tcp link failed: {e}");
            peer.deliver(TransportEvent::Error(e)).await;
        }
    }
}

async fn pump(stream: TcpStream, mut codec: Box<dyn Framing>, peer: &mut LinkPeer) -> Result<(), TransportError> {
    let (mut rd, mut wr) = stream.into_split();
    let mut preamble = Some(codec.preamble());
    let mut out = Vec::new();
    let mut buf = Vec::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            _ = peer.token.cancelled() => return Ok(()),
            packet = peer.outbound.recv() => {
                let Some(packet) = packet else { return Ok(()) };
                out.clear();
                if let Some(p) = preamble.take() {
                    out.extend_from_slice(p);
                }
                codec.encode(&packet, &mut out);
                wr.write_all(&out).await?;
            }
            n = rd.read_buf(&mut buf) => {
                if n? == 0 {
                    return Err(TransportError::Closed);
                }
                while let Some((used, payload)) = codec.decode(&buf)? {
                    buf.drain(..used);
                    if let Some(code) = error_code(&payload) {
                        return Err(TransportError::Code(code));
                    }
                    if !peer.deliver(TransportEvent::Packet(payload)).await {
                        return Ok(());
                    }
                }
                if buf.capacity() - buf.len() < READ_CHUNK / 4 {
                    buf.reserve(READ_CHUNK);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtp_proto::transport::{Full, FramingKind};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap().to_string();
        (l, addr)
    }

    fn connector() -> NetConnector {
        let mut net = NetConnector::new(TransportKind::Tcp);
        net.framing = FramingKind::Full;
        net.connect_timeout = Duration::from_secs(5);
        net
    }

    #[tokio::test]
    async fn full_frames_both_ways() {
        let (l, addr) = listener().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = l.accept().await.unwrap();
            let mut codec = Full::new();
            let mut buf = Vec::new();
            let payload = loop {
                sock.read_buf(&mut buf).await.unwrap();
                if let Some((_, p)) = codec.decode(&buf).unwrap() {
                    break p;
                }
            };
            let mut out = Vec::new();
            let mut reply = payload.clone();
            reply.reverse();
            Full::new().encode(&reply, &mut out);
            sock.write_all(&out).await.unwrap();
            payload
        });

        let mut link = connect(&connector(), &addr).await.unwrap();
        assert_eq!(link.kind(), TransportKind::Tcp);
        link.send(vec![1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        match link.recv().await {
            Some(TransportEvent::Packet(p)) => assert_eq!(p, [8, 7, 6, 5, 4, 3, 2, 1]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.await.unwrap(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn four_byte_packets_are_error_codes() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            let (mut sock, _) = l.accept().await.unwrap();
            let mut out = Vec::new();
            Full::new().encode(&(-404i32).to_le_bytes(), &mut out);
            sock.write_all(&out).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut link = connect(&connector(), &addr).await.unwrap();
        match link.recv().await {
            Some(TransportEvent::Error(e)) => assert!(e.may_be_bad_key(), "{e}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(link.recv().await.is_none());
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            let (sock, _) = l.accept().await.unwrap();
            drop(sock);
        });

        let mut link = connect(&connector(), &addr).await.unwrap();
        assert!(matches!(link.recv().await, Some(TransportEvent::Error(TransportError::Closed | TransportError::Io(_)))));
    }
}
