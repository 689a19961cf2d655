//! # mtp: MTProto client core
//!
//! The sub-crates, wired together for convenience:
//!
//! | Sub-crate      | Role                                                   |
//! |----------------|--------------------------------------------------------|
//! | `mtp-tl-types` | TL wire primitives and protocol-level types            |
//! | `mtp-crypto`   | AES-IGE, SHA1 key derivation, RSA, DH checks, AuthKey  |
//! | `mtp-proto`    | Sans-IO key exchange, session engine, framings         |
//! | `mtp-client`   | Transports, per-DC connections, key stores, reconnects |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mtp::{Config, ConnectionManager, RpcError};
//!
//! # async fn f() -> Result<(), mtp::client::Error> {
//! let manager = ConnectionManager::new(Config { test_mode: true, ..Default::default() });
//! let body = manager.submit(2, vec![0; 8], true).await?.await?;
//! if let Some(err) = RpcError::parse(&body) {
//!     eprintln!("server said {err}");
//! }
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`mtp_tl_types`]: wire primitives and protocol types.
pub use mtp_tl_types as tl;

/// Re-export of [`mtp_crypto`]: AES-IGE, SHA1, RSA, DH, AuthKey.
pub use mtp_crypto as crypto;

/// Re-export of [`mtp_proto`]: key exchange, session engine, framings.
pub use mtp_proto as proto;

/// Re-export of [`mtp_client`]: transports and the connection manager.
pub use mtp_client as client;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use mtp_tl_types::{Deserializable, Serializable};
pub use mtp_crypto::AuthKey;
pub use mtp_proto::{Engine, EngineConfig, Handshake};
pub use mtp_client::{Config, ConnectionManager, ConnectionState, RequestHandle, RpcError, TransportKind};
