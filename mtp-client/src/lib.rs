//! # mtp-client
//!
//! Async MTProto connections on tokio.
//!
//! ## Features
//! - TCP (full, intermediate or abridged framing), HTTP long-poll, or an
//!   auto mode racing both with a `req_pq` probe
//! - One task per DC: auth key exchange, encrypted session, resends, acks
//! - Auth keys kept in memory, a flat file, or SQLite (`sqlite-keys`)
//! - Keys the server no longer knows are recreated before anything else is
//!   encrypted with them
//! - Reconnect with configurable backoff and an adaptive receive watchdog
//! - SOCKS5 proxy
//!
//! Payloads are opaque: callers hand in serialized calls and get back
//! serialized answers.

#![deny(unsafe_code)]

mod connection;
mod errors;
mod manager;
mod retry;
mod watchdog;

pub mod dc_options;
pub mod key_store;
pub mod socks5;
pub mod transport;

pub use connection::{ConnectionState, RECREATE_KEY_ID, Update};
pub use dc_options::DcOptions;
pub use errors::{Error, RpcError, TransportError};
pub use key_store::{FileKeyStore, InMemoryKeyStore, KeyStore};
#[cfg(feature = "sqlite-keys")]
pub use key_store::SqliteKeyStore;
pub use manager::{ConnectionManager, RequestHandle};
pub use retry::{Backoff, NoReconnect, ReconnectContext, ReconnectPolicy};
pub use socks5::Socks5Config;
pub use transport::{Connector, Link, LinkPeer, NetConnector, TransportEvent, TransportKind};

pub use mtp_proto::transport::FramingKind;
pub use mtp_proto::{EngineConfig, RequestId};

use std::sync::Arc;
use std::time::Duration;

use mtp_crypto::rsa::PublicKey;

/// Configuration for [`ConnectionManager`].
#[derive(Clone)]
pub struct Config {
    /// Which medium to use (default: auto).
    pub transport:          TransportKind,
    /// TCP framing (default: full).
    pub framing:            FramingKind,
    /// Use the test DCs and the test RSA key.
    pub test_mode:          bool,
    /// DC addresses; `None` picks the built-in table for `test_mode`.
    pub dc_options:         Option<DcOptions>,
    /// RSA keys accepted during key exchange; empty means the built-in key
    /// for `test_mode`.
    pub rsa_keys:           Vec<PublicKey>,
    /// Where auth keys are kept (default: in memory).
    pub key_store:          Arc<dyn KeyStore>,
    /// What to do when a connection is lost (default: [`Backoff`]).
    pub reconnect_policy:   Arc<dyn ReconnectPolicy>,
    /// Optional SOCKS5 proxy every socket goes through.
    pub socks5:             Option<Socks5Config>,
    /// Longest wait for a socket to connect.
    pub connect_timeout:    Duration,
    /// Longest wait for each answer during key exchange.
    pub handshake_timeout:  Duration,
    /// Key exchange attempts before pending requests fail.
    pub handshake_attempts: u32,
    /// Session timing.
    pub engine:             EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport:          TransportKind::Auto,
            framing:            FramingKind::Full,
            test_mode:          false,
            dc_options:         None,
            rsa_keys:           Vec::new(),
            key_store:          Arc::new(InMemoryKeyStore::new()),
            reconnect_policy:   Arc::new(Backoff::default()),
            socks5:             None,
            connect_timeout:    Duration::from_secs(8),
            handshake_timeout:  Duration::from_secs(10),
            handshake_attempts: 5,
            engine:             EngineConfig::default(),
        }
    }
}
