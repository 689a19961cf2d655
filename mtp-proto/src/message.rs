//! MTProto message framing types and the message-id clock.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Allocates message identifiers.
///
/// An id is the (server-corrected) Unix time scaled by 2³²: the upper 32
/// bits hold whole seconds and the lower 32 bits a sub-second fraction.
/// Client ids are divisible by four and strictly increasing for the life
/// of the clock, even when the wall clock or the offset jumps backwards.
#[derive(Clone, Debug, Default)]
pub struct MsgIdClock {
    time_offset: i32,
    last: i64,
}

impl MsgIdClock {
    /// A clock with no server correction.
    pub fn new() -> Self { Self::default() }

    /// Seconds added to local time to approximate server time.
    pub fn time_offset(&self) -> i32 { self.time_offset }

    /// Replace the correction, e.g. with the handshake's measurement.
    pub fn set_time_offset(&mut self, offset: i32) {
        self.time_offset = offset;
    }

    /// Adopt the time carried in a server-generated `msg_id`.
    ///
    /// Used when the server tells us our ids are too old or too new.
    pub fn sync_with_server(&mut self, server_msg_id: i64) {
        self.sync_with_server_at(server_msg_id, unix_now());
    }

    /// [`sync_with_server`](Self::sync_with_server) against an explicit
    /// local time.
    pub fn sync_with_server_at(&mut self, server_msg_id: i64, local: Duration) {
        let server_secs = server_msg_id >> 32;
        self.time_offset = (server_secs - local.as_secs() as i64) as i32;
        log::debug!("[mtp] time offset adjusted to {}s", self.time_offset);
    }

    /// Best guess of the server's current Unix time, in seconds.
    pub fn server_now(&self) -> i64 {
        unix_now().as_secs() as i64 + self.time_offset as i64
    }

    /// Next client message id.
    pub fn next(&mut self) -> i64 {
        self.next_at(unix_now())
    }

    /// Next client message id for an explicit local time.
    pub fn next_at(&mut self, local: Duration) -> i64 {
        let secs = (local.as_secs() as i64 + self.time_offset as i64) as u64;
        let frac = u64::from(local.subsec_nanos()) << 2;
        let mut id = ((secs << 32) | frac) as i64 & !3;
        if id <= self.last {
            id = self.last + 4;
        }
        self.last = id;
        id
    }
}

fn unix_now() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Seconds encoded in a message id.
pub fn msg_id_time(msg_id: i64) -> i64 {
    msg_id >> 32
}

/// Whether `msg_id` has the low bits of a server-generated message
/// (`1` for answers, `3` for unsolicited messages).
pub fn is_server_msg_id(msg_id: i64) -> bool {
    matches!(msg_id & 3, 1 | 3)
}

// ─── Plaintext framing ───────────────────────────────────────────────────────

/// Why a plaintext frame was rejected.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaintextError {
    /// Fewer than the 20 header bytes.
    TooShort { len: usize },
    /// `auth_key_id` was not zero.
    NotPlaintext { auth_key_id: i64 },
    /// The message id does not look server-generated.
    BadMsgId { msg_id: i64 },
    /// The length field disagrees with the frame size.
    BadLength { declared: u32, actual: usize },
}

impl fmt::Display for PlaintextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "plaintext frame too short ({len} bytes)"),
            Self::NotPlaintext { auth_key_id } => {
                write!(f, "expected plaintext frame, got auth_key_id {auth_key_id:#x}")
            }
            Self::BadMsgId { msg_id } => write!(f, "bad server msg_id {msg_id:#x}"),
            Self::BadLength { declared, actual } => {
                write!(f, "declared length {declared} but {actual} bytes follow")
            }
        }
    }
}

impl std::error::Error for PlaintextError {}

/// A framed MTProto message exchanged before an auth key exists.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: i64,
    /// The serialized TL body (constructor ID + fields).
    pub body: Vec<u8>,
}

impl Message {
    /// Bytes in front of the body: `auth_key_id ‖ message_id ‖ length`.
    pub const HEADER_LEN: usize = 20;

    /// Construct a new plaintext message (used before key exchange).
    pub fn plaintext(id: i64, body: Vec<u8>) -> Self {
        Self { id, body }
    }

    /// Serialize the message into the plaintext wire format:
    ///
    /// ```text
    /// auth_key_id:long  (0 for plaintext)
    /// message_id:long
    /// message_data_length:int
    /// message_data:bytes
    /// ```
    pub fn to_plaintext_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_LEN + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.id.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
        buf
    }

    /// Parse a plaintext frame written by the server.
    pub fn from_plaintext_bytes(frame: &[u8]) -> Result<Self, PlaintextError> {
        if frame.len() < Self::HEADER_LEN {
            return Err(PlaintextError::TooShort { len: frame.len() });
        }
        let auth_key_id = i64::from_le_bytes(le_array(&frame[..8]));
        if auth_key_id != 0 {
            return Err(PlaintextError::NotPlaintext { auth_key_id });
        }
        let id = i64::from_le_bytes(le_array(&frame[8..16]));
        if !is_server_msg_id(id) {
            return Err(PlaintextError::BadMsgId { msg_id: id });
        }
        let declared = u32::from_le_bytes(le_array(&frame[16..20]));
        let body = &frame[Self::HEADER_LEN..];
        if declared as usize != body.len() {
            return Err(PlaintextError::BadLength { declared, actual: body.len() });
        }
        Ok(Self { id, body: body.to_vec() })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_aligned_and_increasing() {
        let mut clock = MsgIdClock::new();
        let t = Duration::new(1_700_000_000, 500);
        let a = clock.next_at(t);
        let b = clock.next_at(t);
        let c = clock.next_at(t - Duration::from_secs(5));
        assert_eq!(a % 4, 0);
        assert!(b > a && c > b);
        assert_eq!(msg_id_time(a), 1_700_000_000);
    }

    #[test]
    fn offset_shifts_id_time() {
        let mut clock = MsgIdClock::new();
        let local = Duration::from_secs(1_000_000);
        clock.sync_with_server_at((1_000_120i64 << 32) | 1, local);
        assert_eq!(clock.time_offset(), 120);
        assert_eq!(msg_id_time(clock.next_at(local)), 1_000_120);
    }

    #[test]
    fn plaintext_roundtrip_requires_server_id() {
        let frame = Message::plaintext(0x10 | 1, vec![1, 2, 3, 4]).to_plaintext_bytes();
        assert_eq!(Message::from_plaintext_bytes(&frame).unwrap().body, [1, 2, 3, 4]);

        let ours = Message::plaintext(0x10, vec![]).to_plaintext_bytes();
        assert_eq!(
            Message::from_plaintext_bytes(&ours),
            Err(PlaintextError::BadMsgId { msg_id: 0x10 })
        );
    }

    #[test]
    fn plaintext_length_mismatch() {
        let mut frame = Message::plaintext(5, vec![0; 8]).to_plaintext_bytes();
        frame.pop();
        assert_eq!(
            Message::from_plaintext_bytes(&frame),
            Err(PlaintextError::BadLength { declared: 8, actual: 7 })
        );
    }
}
