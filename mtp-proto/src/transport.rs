//! Sans-IO transport framings.
//!
//! A [`Framing`] turns MTProto packets into the byte stream a socket
//! carries and back. Decoding works on whatever has been buffered so far
//! and reports how many bytes a complete frame consumed, so the caller
//! owns all I/O.

use std::fmt;

/// Largest packet either side is allowed to send.
pub const MAX_PACKET_LEN: usize = 64 * 1024 * 1024;

/// Transport-level error code sent instead of a packet.
///
/// A four-byte payload is never a valid MTProto message; the server uses it
/// to report a negative error code.
pub fn error_code(payload: &[u8]) -> Option<i32> {
    let b: [u8; 4] = payload.try_into().ok()?;
    Some(i32::from_le_bytes(b))
}

/// `-404`: the server does not know our auth key.
pub const ERROR_AUTH_KEY_NOT_FOUND: i32 = -404;

/// `-429`: too many connections or transport flood.
pub const ERROR_FLOOD: i32 = -429;

/// Errors raised while decoding a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameError {
    /// The length prefix is impossible.
    BadLength { len: usize },
    /// The packet sequence number is not the one expected.
    BadSeq { expected: u32, got: u32 },
    /// CRC32 over the frame did not match.
    BadCrc { expected: u32, got: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLength { len } => write!(f, "bad frame length {len}"),
            Self::BadSeq { expected, got } => write!(f, "bad frame seq: expected {expected}, got {got}"),
            Self::BadCrc { expected, got } => write!(f, "bad frame crc: expected {expected:08x}, got {got:08x}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// A decoded frame and the number of buffered bytes it used.
pub type Decoded = (usize, Vec<u8>);

/// A stream framing.
pub trait Framing: Send {
    /// Bytes to write once, before the first frame.
    fn preamble(&self) -> &'static [u8] { &[] }

    /// Append `payload` as one frame to `out`.
    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>);

    /// Try to decode one frame from the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed.
    fn decode(&mut self, buf: &[u8]) -> Result<Option<Decoded>, FrameError>;
}

/// Which framing a TCP connection speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramingKind {
    /// `len ‖ seq ‖ payload ‖ crc32`.
    #[default]
    Full,
    /// `len ‖ payload`, announced by `0xeeeeeeee`.
    Intermediate,
    /// Length in words, one or four bytes, announced by `0xef`.
    Abridged,
}

impl FramingKind {
    /// A fresh codec of this kind.
    pub fn codec(self) -> Box<dyn Framing> {
        match self {
            Self::Full => Box::new(Full::new()),
            Self::Intermediate => Box::new(Intermediate),
            Self::Abridged => Box::new(Abridged),
        }
    }
}

// ─── Full ─────────────────────────────────────────────────────────────────────

/// The [full] framing with per-direction sequence numbers and CRC32.
///
/// [full]: https://core.telegram.org/mtproto/mtproto-transports#full
#[derive(Debug, Default)]
pub struct Full {
    send_seq: u32,
    recv_seq: u32,
}

impl Full {
    /// Sequence counters start at zero for every connection.
    pub fn new() -> Self { Self::default() }
}

impl Framing for Full {
    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        let len = (payload.len() + 12) as u32;
        out.extend(len.to_le_bytes());
        out.extend(self.send_seq.to_le_bytes());
        out.extend_from_slice(payload);
        let crc = crc32(&out[start..]);
        out.extend(crc.to_le_bytes());
        self.send_seq = self.send_seq.wrapping_add(1);
    }

    fn decode(&mut self, buf: &[u8]) -> Result<Option<Decoded>, FrameError> {
        let Some(len) = buf.get(..4).map(read_u32) else { return Ok(None) };
        let len = len as usize;
        if len < 16 || len % 4 != 0 || len > MAX_PACKET_LEN {
            return Err(FrameError::BadLength { len });
        }
        if buf.len() < len {
            return Ok(None);
        }
        let seq = read_u32(&buf[4..8]);
        if seq != self.recv_seq {
            return Err(FrameError::BadSeq { expected: self.recv_seq, got: seq });
        }
        let got = read_u32(&buf[len - 4..len]);
        let expected = crc32(&buf[..len - 4]);
        if got != expected {
            return Err(FrameError::BadCrc { expected, got });
        }
        self.recv_seq = self.recv_seq.wrapping_add(1);
        Ok(Some((len, buf[8..len - 4].to_vec())))
    }
}

// ─── Intermediate ─────────────────────────────────────────────────────────────

/// `len ‖ payload`.
#[derive(Debug, Default)]
pub struct Intermediate;

impl Framing for Intermediate {
    fn preamble(&self) -> &'static [u8] { &[0xee, 0xee, 0xee, 0xee] }

    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        out.extend((payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }

    fn decode(&mut self, buf: &[u8]) -> Result<Option<Decoded>, FrameError> {
        let Some(len) = buf.get(..4).map(read_u32) else { return Ok(None) };
        let len = len as usize;
        if len < 4 || len > MAX_PACKET_LEN {
            return Err(FrameError::BadLength { len });
        }
        Ok(buf.get(4..4 + len).map(|p| (4 + len, p.to_vec())))
    }
}

// ─── Abridged ─────────────────────────────────────────────────────────────────

/// Length in 4-byte words: one byte below `0x7f`, else `0x7f` and three
/// more bytes.
#[derive(Debug, Default)]
pub struct Abridged;

impl Framing for Abridged {
    fn preamble(&self) -> &'static [u8] { &[0xef] }

    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let words = payload.len() / 4;
        if words < 0x7f {
            out.push(words as u8);
        } else {
            let w = (words as u32).to_le_bytes();
            out.extend([0x7f, w[0], w[1], w[2]]);
        }
        out.extend_from_slice(payload);
    }

    fn decode(&mut self, buf: &[u8]) -> Result<Option<Decoded>, FrameError> {
        let Some(&first) = buf.first() else { return Ok(None) };
        let (header, words) = if first < 0x7f {
            (1, first as usize)
        } else {
            let Some(b) = buf.get(1..4) else { return Ok(None) };
            (4, u32::from_le_bytes([b[0], b[1], b[2], 0]) as usize)
        };
        let len = words * 4;
        if len > MAX_PACKET_LEN {
            return Err(FrameError::BadLength { len });
        }
        Ok(buf.get(header..header + len).map(|p| (header + len, p.to_vec())))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// CRC-32 (IEEE 802.3), as used by the full framing.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn full_frame_layout() {
        let mut codec = Full::new();
        let mut out = Vec::new();
        codec.encode(&[1, 2, 3, 4], &mut out);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &16u32.to_le_bytes());
        assert_eq!(&out[4..8], &0u32.to_le_bytes());
        assert_eq!(&out[12..], &crc32(&out[..12]).to_le_bytes());
    }

    #[test]
    fn full_decode_waits_and_checks_seq() {
        let mut tx = Full::new();
        let mut wire = Vec::new();
        tx.encode(&[9; 8], &mut wire);
        tx.encode(&[7; 4], &mut wire);

        let mut rx = Full::new();
        assert_eq!(rx.decode(&wire[..10]).unwrap(), None);
        let (used, first) = rx.decode(&wire).unwrap().unwrap();
        assert_eq!(first, [9; 8]);
        let (_, second) = rx.decode(&wire[used..]).unwrap().unwrap();
        assert_eq!(second, [7; 4]);

        let mut fresh = Full::new();
        assert_eq!(fresh.decode(&wire[used..]), Err(FrameError::BadSeq { expected: 0, got: 1 }));
    }

    #[test]
    fn full_rejects_corruption() {
        let mut wire = Vec::new();
        Full::new().encode(&[5; 8], &mut wire);
        wire[9] ^= 0xff;
        assert!(matches!(Full::new().decode(&wire), Err(FrameError::BadCrc { .. })));

        let mut short = 8u32.to_le_bytes().to_vec();
        short.extend([0; 4]);
        assert_eq!(Full::new().decode(&short), Err(FrameError::BadLength { len: 8 }));
    }

    #[test]
    fn abridged_long_header() {
        let payload = vec![0u8; 0x7f * 4];
        let mut out = Vec::new();
        Abridged.encode(&payload, &mut out);
        assert_eq!(&out[..4], &[0x7f, 0x7f, 0, 0]);
        assert_eq!(Abridged.decode(&out).unwrap().unwrap().1.len(), payload.len());
    }

    #[test]
    fn intermediate_roundtrip_and_error_code() {
        let mut out = Vec::new();
        Intermediate.encode(&(-404i32).to_le_bytes(), &mut out);
        let (_, payload) = Intermediate.decode(&out).unwrap().unwrap();
        assert_eq!(error_code(&payload), Some(ERROR_AUTH_KEY_NOT_FOUND));
        assert_eq!(error_code(&[0; 8]), None);
    }
}
