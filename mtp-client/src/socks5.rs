//! SOCKS5 proxy connector.
//!
//! Attach a [`Socks5Config`] to [`crate::Config`] to route every TCP
//! transport through a SOCKS5 proxy.
//!
//! # Example
//! ```rust,no_run
//! use mtp_client::{Config, socks5::Socks5Config};
//!
//! let cfg = Config {
//!     socks5: Some(Socks5Config::new("127.0.0.1:1080")),
//!     ..Default::default()
//! };
//! ```

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::errors::TransportError;

/// SOCKS5 proxy configuration.
#[derive(Clone, Debug)]
pub struct Socks5Config {
    /// Host:port of the SOCKS5 proxy server.
    pub proxy_addr: String,
    /// Optional username and password for proxy authentication.
    pub auth: Option<(String, String)>,
}

impl Socks5Config {
    /// An unauthenticated proxy.
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self { proxy_addr: proxy_addr.into(), auth: None }
    }

    /// A proxy with username/password authentication.
    pub fn with_auth(
        proxy_addr: impl Into<String>,
        username:   impl Into<String>,
        password:   impl Into<String>,
    ) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            auth: Some((username.into(), password.into())),
        }
    }

    /// A [`TcpStream`] tunnelled through the proxy to `target`.
    pub async fn connect(&self, target: &str) -> Result<TcpStream, TransportError> {
        tracing::info!("[mtp] connecting via SOCKS5 {} → {target}", self.proxy_addr);
        let stream = match &self.auth {
            None => Socks5Stream::connect(self.proxy_addr.as_str(), target).await,
            Some((user, pass)) => {
                Socks5Stream::connect_with_password(self.proxy_addr.as_str(), target, user.as_str(), pass.as_str())
                    .await
            }
        }
        .map_err(|e| TransportError::from(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(stream.into_inner())
    }
}
