//! HTTP transport: every packet is the body of a `POST /api`, every answer
//! the body of its response.
//!
//! Requests run concurrently (a long-poll `http_wait` may sit on the
//! server for tens of seconds), at most [`MAX_IN_FLIGHT`] at a time. The
//! [`reqwest::Client`] keeps idle connections alive between them.

use std::time::Duration;

use mtp_proto::transport::{MAX_PACKET_LEN, error_code};
use reqwest::{Client, Proxy, StatusCode, Url, header};
use tokio::task::JoinSet;

use super::{Link, LinkPeer, NetConnector, TransportEvent, TransportKind};
use crate::errors::TransportError;

/// Requests outstanding on one link before further packets wait.
pub const MAX_IN_FLIGHT: usize = 8;

/// `host:port` the HTTP transport talks to for a DC address.
pub fn http_address(addr: &str, port: u16) -> String {
    let host = match addr.rsplit_once(':') {
        Some((host, p)) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => addr,
    };
    format!("{host}:{port}")
}

/// Build a client for the DC's HTTP endpoint and start the actor.
pub async fn connect(net: &NetConnector, addr: &str) -> Result<Link, TransportError> {
    let host = http_address(addr, net.http_port);
    let url = Url::parse(&format!("http://{host}/api")).map_err(|_| TransportError::BadResponse)?;
    let client = client(net)?;
    tracing::info!("[mtp] http link to {host} ready");
    let (link, peer) = Link::pair(TransportKind::Http, host);
    tokio::spawn(run(client, url, peer));
    Ok(link)
}

fn client(net: &NetConnector) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .connect_timeout(net.connect_timeout)
        .pool_max_idle_per_host(MAX_IN_FLIGHT)
        .tcp_nodelay(true)
        .tcp_keepalive(Duration::from_secs(30));
    if let Some(socks5) = &net.socks5 {
        let mut proxy = Url::parse(&format!("socks5h://{}", socks5.proxy_addr))
            .map_err(|e| TransportError::from(std::io::Error::other(e)))?;
        if let Some((user, pass)) = &socks5.auth {
            let bad = |()| TransportError::from(std::io::Error::other("invalid SOCKS5 credentials"));
            proxy.set_username(user).map_err(bad)?;
            proxy.set_password(Some(pass)).map_err(bad)?;
        }
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

async fn run(client: Client, url: Url, mut peer: LinkPeer) {
    let mut inflight: JoinSet<Result<Vec<u8>, TransportError>> = JoinSet::new();

    let failure = loop {
        tokio::select! {
            _ = peer.token.cancelled() => break None,
            packet = peer.outbound.recv(), if inflight.len() < MAX_IN_FLIGHT => {
                let Some(packet) = packet else { break None };
                inflight.spawn(post(client.clone(), url.clone(), packet));
            }
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                let body = match done {
                    Ok(Ok(body)) => body,
                    Ok(Err(e)) => break Some(e),
                    Err(e) => break Some(std::io::Error::other(e).into()),
                };
                if body.is_empty() {
                    continue;
                }
                if let Some(code) = error_code(&body) {
                    break Some(TransportError::Code(code));
                }
                if !peer.deliver(TransportEvent::Packet(body)).await {
                    break None;
                }
            }
        }
    };

    inflight.abort_all();
    let host = url.authority().to_owned();
    match failure {
        None => tracing::debug!("[mtp] http link to {host} closed"),
        Some(e) => {
            tracing::warn!("[mtp] http link to {host} failed: {e}");
            peer.deliver(TransportEvent::Error(e)).await;
        }
    }
}

async fn post(client: Client, url: Url, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
    let response = client
        .post(url)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(body)
        .send()
        .await?;
    if response.status() != StatusCode::OK {
        return Err(TransportError::Http { status: response.status().as_u16() });
    }
    if response.content_length().is_some_and(|len| len > MAX_PACKET_LEN as u64) {
        return Err(TransportError::BadResponse);
    }
    let body = response.bytes().await?;
    if body.len() > MAX_PACKET_LEN {
        return Err(TransportError::BadResponse);
    }
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn http_address_swaps_the_port() {
        assert_eq!(http_address("149.154.167.51:443", 80), "149.154.167.51:80");
        assert_eq!(http_address("[2001:db8::a]:443", 80), "[2001:db8::a]:80");
        assert_eq!(http_address("localhost", 8080), "localhost:8080");
    }

    /// Serve one request per accepted connection with `respond`.
    async fn serve(respond: fn(&[u8]) -> Vec<u8>) -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = l.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    loop {
                        if sock.read_buf(&mut buf).await.unwrap() == 0 {
                            return;
                        }
                        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else { continue };
                        let head = std::str::from_utf8(&buf[..end]).unwrap().to_ascii_lowercase();
                        let len: usize = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .unwrap()
                            .trim()
                            .parse()
                            .unwrap();
                        if buf.len() >= end + 4 + len {
                            let reply = respond(&buf[end + 4..end + 4 + len]);
                            sock.write_all(&reply).await.unwrap();
                            buf.drain(..end + 4 + len);
                        }
                    }
                });
            }
        });
        port
    }

    fn connector(port: u16) -> NetConnector {
        let mut net = NetConnector::new(TransportKind::Http);
        net.http_port = port;
        net.connect_timeout = Duration::from_secs(5);
        net
    }

    #[tokio::test]
    async fn bodies_round_trip_over_keep_alive() {
        let port = serve(|body| {
            let mut reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
            reply.extend(body.iter().rev());
            reply
        })
        .await;

        let mut link = connect(&connector(port), "127.0.0.1:443").await.unwrap();
        assert_eq!(link.kind(), TransportKind::Http);
        for round in 0..3u8 {
            link.send(vec![round, 1, 2, 3, 4, 5, 6, 7]).await.unwrap();
            match link.recv().await {
                Some(TransportEvent::Packet(p)) => assert_eq!(p, [7, 6, 5, 4, 3, 2, 1, round]),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn not_found_hints_at_a_bad_key() {
        let port = serve(|_| b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()).await;

        let mut link = connect(&connector(port), "127.0.0.1:443").await.unwrap();
        link.send(vec![0; 8]).await.unwrap();
        match link.recv().await {
            Some(TransportEvent::Error(e)) => {
                assert!(matches!(e, TransportError::Http { status: 404 }));
                assert!(e.may_be_bad_key());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_statuses_are_plain_errors() {
        let port = serve(|_| b"HTTP/1.1 500 Oops\r\nContent-Length: 0\r\n\r\n".to_vec()).await;

        let mut link = connect(&connector(port), "127.0.0.1:443").await.unwrap();
        link.send(vec![0; 8]).await.unwrap();
        match link.recv().await {
            Some(TransportEvent::Error(e)) => assert!(!e.may_be_bad_key()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_polls_beyond_the_cap_wait_their_turn() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        let held = Arc::new(AtomicUsize::new(0));
        let counter = held.clone();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = l.accept().await.unwrap();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        if sock.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                            return;
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let link = connect(&connector(port), "127.0.0.1:443").await.unwrap();
        for _ in 0..MAX_IN_FLIGHT + 4 {
            link.send(vec![0; 8]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(held.load(Ordering::SeqCst), MAX_IN_FLIGHT);
    }
}
