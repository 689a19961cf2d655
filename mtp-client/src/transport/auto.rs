//! Auto transport: dial TCP and HTTP at once, send the same `req_pq` probe
//! on both and keep whichever answers with our nonce.
//!
//! TCP is preferred: if HTTP answers first, TCP still gets
//! [`WAIT_FOR_BETTER`] to catch up. The losing link is dropped, which stops
//! its actor.

use std::time::Duration;

use mtp_crypto::random_array;
use mtp_proto::{Message, MsgIdClock};
use mtp_tl_types::{Deserializable, Serializable, functions, types};

use super::{Link, NetConnector, TransportEvent, http, tcp};
use crate::errors::TransportError;

/// How long TCP may lag behind a successful HTTP probe.
pub const WAIT_FOR_BETTER: Duration = Duration::from_secs(2);

/// Race both transports to `addr`.
pub async fn connect(net: &NetConnector, addr: &str) -> Result<Link, TransportError> {
    let nonce: [u8; 16] = random_array();
    let probe = Message::plaintext(MsgIdClock::new().next(), functions::ReqPq { nonce }.to_bytes())
        .to_plaintext_bytes();

    let tcp = async {
        let link = tcp::connect(net, addr).await?;
        checked(net, link, probe.clone(), nonce).await
    };
    let http = async {
        let link = http::connect(net, addr).await?;
        checked(net, link, probe.clone(), nonce).await
    };
    tokio::pin!(tcp, http);

    tokio::select! {
        res = &mut tcp => match res {
            Ok(link) => {
                tracing::info!("[mtp] auto transport chose tcp for {addr}");
                Ok(link)
            }
            Err(e) => {
                tracing::debug!("[mtp] tcp probe to {addr} failed ({e}), waiting for http");
                http.await
            }
        },
        res = &mut http => match res {
            Ok(http_link) => match tokio::time::timeout(WAIT_FOR_BETTER, &mut tcp).await {
                Ok(Ok(tcp_link)) => {
                    tracing::info!("[mtp] auto transport chose tcp for {addr} (http answered first)");
                    Ok(tcp_link)
                }
                _ => {
                    tracing::info!("[mtp] auto transport chose http for {addr}");
                    Ok(http_link)
                }
            },
            Err(e) => {
                tracing::debug!("[mtp] http probe to {addr} failed ({e}), waiting for tcp");
                tcp.await
            }
        },
    }
}

/// Send the probe and wait for a `resPQ` echoing `nonce`.
async fn checked(net: &NetConnector, mut link: Link, probe: Vec<u8>, nonce: [u8; 16]) -> Result<Link, TransportError> {
    link.send(probe).await?;
    let event = tokio::time::timeout(net.connect_timeout, link.recv())
        .await
        .map_err(|_| TransportError::Timeout)?;
    match event {
        Some(TransportEvent::Packet(frame)) => {
            let msg = Message::from_plaintext_bytes(&frame).map_err(|_| TransportError::BadResponse)?;
            let res = types::ResPq::from_bytes(&msg.body).map_err(|_| TransportError::BadResponse)?;
            if res.nonce == nonce { Ok(link) } else { Err(TransportError::BadResponse) }
        }
        Some(TransportEvent::Error(e)) => Err(e),
        None => Err(TransportError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use mtp_proto::transport::{Framing, Full};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn res_pq(probe: &[u8]) -> Vec<u8> {
        let req = Message::from_plaintext_bytes(&server_view(probe)).unwrap();
        let nonce: [u8; 16] = req.body[4..20].try_into().unwrap();
        let body = types::ResPq {
            nonce,
            server_nonce: [9; 16],
            pq: vec![1, 2, 3, 4, 5, 6, 7, 8],
            server_public_key_fingerprints: vec![42],
        }
        .to_bytes();
        let mut clock = MsgIdClock::new();
        Message::plaintext(clock.next() | 1, body).to_plaintext_bytes()
    }

    /// `from_plaintext_bytes` wants server parity; flip it to read the
    /// client's frame.
    fn server_view(frame: &[u8]) -> Vec<u8> {
        let mut f = frame.to_vec();
        f[8] |= 1;
        f
    }

    async fn tcp_server(answer: bool) -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = l.accept().await.unwrap();
            let mut codec = Full::new();
            let mut buf = Vec::new();
            loop {
                if sock.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                if let Ok(Some((_, probe))) = codec.decode(&buf) {
                    if answer {
                        let mut out = Vec::new();
                        Full::new().encode(&res_pq(&probe), &mut out);
                        sock.write_all(&out).await.unwrap();
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                }
            }
        });
        port
    }

    async fn http_server() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = l.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    loop {
                        if sock.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else { continue };
                        let body_start = end + 4;
                        let probe_len = 20 + 20;
                        if buf.len() < body_start + probe_len {
                            continue;
                        }
                        let body = res_pq(&buf[body_start..body_start + probe_len]);
                        let mut reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
                        reply.extend(body);
                        sock.write_all(&reply).await.unwrap();
                        buf.clear();
                    }
                });
            }
        });
        port
    }

    fn connector(http_port: u16) -> NetConnector {
        let mut net = NetConnector::new(TransportKind::Auto);
        net.http_port = http_port;
        net.connect_timeout = Duration::from_secs(5);
        net
    }

    #[tokio::test]
    async fn tcp_wins_when_it_answers() {
        let tcp_port = tcp_server(true).await;
        let http_port = http_server().await;
        let link = connect(&connector(http_port), &format!("127.0.0.1:{tcp_port}")).await.unwrap();
        assert_eq!(link.kind(), TransportKind::Tcp);
    }

    #[tokio::test]
    async fn http_is_kept_when_tcp_stays_silent() {
        let tcp_port = tcp_server(false).await;
        let http_port = http_server().await;
        let started = std::time::Instant::now();
        let link = connect(&connector(http_port), &format!("127.0.0.1:{tcp_port}")).await.unwrap();
        assert_eq!(link.kind(), TransportKind::Http);
        assert!(started.elapsed() >= WAIT_FOR_BETTER);
    }
}
