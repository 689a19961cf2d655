//! Error types for mtp-client.

use std::sync::Arc;
use std::{fmt, io};

use mtp_proto::transport::{ERROR_AUTH_KEY_NOT_FOUND, FrameError};
use mtp_proto::{EngineError, HandshakeError, RestartReason};
use mtp_tl_types::{Deserializable, types};

// ─── TransportError ──────────────────────────────────────────────────────────

/// Why a transport gave up on its connection.
#[derive(Clone, Debug)]
pub enum TransportError {
    /// Socket failure.
    Io(Arc<io::Error>),
    /// The byte stream stopped making sense.
    Frame(FrameError),
    /// The server sent a transport error code instead of a packet.
    Code(i32),
    /// The HTTP endpoint answered with a non-success status.
    Http { status: u16 },
    /// The HTTP response body was missing or too long.
    BadResponse,
    /// No connection within the connect timeout, or no answer in time.
    Timeout,
    /// The peer closed the connection.
    Closed,
}

impl TransportError {
    /// Whether the failure hints that the server does not know our key.
    pub fn may_be_bad_key(&self) -> bool {
        matches!(self, Self::Code(ERROR_AUTH_KEY_NOT_FOUND) | Self::Http { status: 404 })
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)             => write!(f, "I/O error: {e}"),
            Self::Frame(e)          => write!(f, "{e}"),
            Self::Code(code)        => write!(f, "transport error {code}"),
            Self::Http { status }   => write!(f, "HTTP status {status}"),
            Self::BadResponse       => write!(f, "malformed HTTP response"),
            Self::Timeout           => write!(f, "timed out"),
            Self::Closed            => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self { Self::Io(Arc::new(e)) }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self { Self::Frame(e) }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        match e.status() {
            Some(status) => Self::Http { status: status.as_u16() },
            None => Self::Io(Arc::new(io::Error::other(e))),
        }
    }
}

// ─── Error ───────────────────────────────────────────────────────────────────

/// The error a [`RequestHandle`](crate::RequestHandle) resolves to.
#[derive(Clone, Debug)]
pub enum Error {
    /// The connection was lost and the reconnect policy gave up.
    Transport(TransportError),
    /// Every key exchange attempt failed.
    Handshake(HandshakeError),
    /// No ack arrived through every resend.
    RetryExhausted { attempts: u32 },
    /// The session engine rejected the request.
    Engine(EngineError),
    /// No address is known for this DC.
    UnknownDc(i32),
    /// The caller cancelled the request.
    Cancelled,
    /// The connection task is gone (e.g. after shutdown).
    Dropped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e)                => write!(f, "transport: {e}"),
            Self::Handshake(e)                => write!(f, "auth key exchange failed: {e}"),
            Self::RetryExhausted { attempts } => write!(f, "request unacknowledged after {attempts} attempts"),
            Self::Engine(e)                   => write!(f, "{e}"),
            Self::UnknownDc(dc)               => write!(f, "no address for DC {dc}"),
            Self::Cancelled                   => write!(f, "request cancelled"),
            Self::Dropped                     => write!(f, "request dropped"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self { Self::Handshake(e) }
}

impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::RetryExhausted { attempts } => Self::RetryExhausted { attempts },
            other => Self::Engine(other),
        }
    }
}

// ─── Disconnect ──────────────────────────────────────────────────────────────

/// Why a connection task dropped its link.
#[derive(Clone, Debug)]
pub(crate) enum Disconnect {
    Transport(TransportError),
    Restart(RestartReason),
    Watchdog,
    Handshake(HandshakeError),
}

impl Disconnect {
    pub(crate) fn may_be_bad_key(&self) -> bool {
        matches!(self, Self::Transport(e) if e.may_be_bad_key())
    }

    /// The error pending callers see when the reconnect policy gives up.
    pub(crate) fn to_error(&self) -> Error {
        match self {
            Self::Transport(e) => Error::Transport(e.clone()),
            Self::Restart(_) | Self::Watchdog => Error::Transport(TransportError::Timeout),
            Self::Handshake(e) => Error::Handshake(e.clone()),
        }
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Restart(reason) => write!(f, "restart requested: {reason:?}"),
            Self::Watchdog => write!(f, "nothing received in time"),
            Self::Handshake(e) => write!(f, "{e}"),
        }
    }
}

impl From<TransportError> for Disconnect {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}

// ─── RpcError ────────────────────────────────────────────────────────────────

/// An `rpc_error` the server returned for a request.
///
/// Responses are delivered unchanged; use [`RpcError::parse`] on the bytes
/// to tell errors from results. Numeric suffixes are split off the name.
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric suffix removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Read a response body as `rpc_error`, if it is one.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let err = types::RpcError::from_bytes(body).ok()?;
        Some(Self::from_message(err.error_code, &err.error_message))
    }

    /// Split a message like `"FLOOD_WAIT_30"` into name and value.
    pub fn from_message(code: i32, message: &str) -> Self {
        if let Some((name, suffix)) = message.rsplit_once('_') {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self { code, name: name.to_string(), value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with an optional `'*'` at either end.
    ///
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("AUTH_KEY_*")`: prefix match
    /// - `err.is("*_INVALID")`: suffix match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Seconds to wait, if this is a `FLOOD_WAIT_X`.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && self.name == "FLOOD_WAIT" {
            self.value.map(u64::from)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtp_tl_types::Serializable;

    fn rpc_error(code: i32, message: &str) -> Vec<u8> {
        types::RpcError { error_code: code, error_message: message.to_string() }.to_bytes()
    }

    #[test]
    fn flood_wait_value_is_split_off() {
        let err = RpcError::parse(&rpc_error(420, "FLOOD_WAIT_30")).unwrap();
        assert_eq!(err, RpcError { code: 420, name: "FLOOD_WAIT".into(), value: Some(30) });
        assert_eq!(err.flood_wait_seconds(), Some(30));
        assert!(err.is("FLOOD_*"));
    }

    #[test]
    fn plain_names_keep_their_underscores() {
        let err = RpcError::parse(&rpc_error(400, "PEER_ID_INVALID")).unwrap();
        assert_eq!(err.value, None);
        assert!(err.is("*_INVALID"));
        assert_eq!(err.flood_wait_seconds(), None);
    }

    #[test]
    fn results_are_not_errors() {
        assert_eq!(RpcError::parse(&[1, 2, 3, 4, 5, 6, 7, 8]), None);
        assert_eq!(RpcError::parse(&[]), None);
    }

    #[test]
    fn bad_key_hint() {
        assert!(TransportError::Code(-404).may_be_bad_key());
        assert!(TransportError::Http { status: 404 }.may_be_bad_key());
        assert!(!TransportError::Code(-429).may_be_bad_key());
        assert!(!TransportError::Closed.may_be_bad_key());
    }
}
