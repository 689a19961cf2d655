//! Sans-IO MTProto: everything between the bytes on a socket and the
//! serialized calls of an application.
//!
//! This crate handles:
//! * Message ids and plaintext framing ([`message`])
//! * Auth key generation ([`authentication`], driven by [`handshake`])
//! * The encrypted envelope of one session ([`encrypted`])
//! * Request bookkeeping: acks, containers, resends, salts ([`engine`])
//! * TCP framings ([`transport`])
//!
//! It owns no sockets and no clocks; bring your own runtime.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authentication;
pub mod encrypted;
pub mod engine;
pub mod handshake;
pub mod message;
#[cfg(feature = "test-server")]
pub mod server;
pub mod transport;

pub use encrypted::EncryptedSession;
pub use engine::{Engine, EngineConfig, EngineError, Event, Request, RequestId, RestartReason};
pub use handshake::{Handshake, HandshakeError, Progress};
pub use message::{Message, MsgIdClock};
