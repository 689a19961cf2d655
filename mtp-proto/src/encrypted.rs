//! Encrypted MTProto session (post auth-key).
//!
//! Once the handshake has produced a key, an [`EncryptedSession`] wraps and
//! unwraps every message exchanged on the connection.

use mtp_crypto::{AuthKey, INNER_HEADER_LEN, Side, decrypt_message, encrypt_message, random_array};

use crate::message::is_server_msg_id;

/// Errors that can occur when decrypting a server message.
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// The underlying crypto layer rejected the message.
    Crypto(mtp_crypto::DecryptError),
    /// Session-ID mismatch (possible replay or wrong connection).
    SessionMismatch { got: i64 },
    /// The message id does not have server parity.
    BadMsgId { msg_id: i64 },
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::SessionMismatch { got } => write!(f, "session_id mismatch (got {got:#x})"),
            Self::BadMsgId { msg_id } => write!(f, "bad server msg_id {msg_id:#x}"),
        }
    }
}
impl std::error::Error for DecryptError {}

impl From<mtp_crypto::DecryptError> for DecryptError {
    fn from(e: mtp_crypto::DecryptError) -> Self { Self::Crypto(e) }
}

/// The inner payload extracted from a successfully decrypted server frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    /// `salt` sent by the server.
    pub salt:       i64,
    /// The `session_id` from the frame.
    pub session_id: i64,
    /// The `msg_id` of the inner message.
    pub msg_id:     i64,
    /// `seq_no` of the inner message.
    pub seq_no:     i32,
    /// TL-serialized body of the inner message.
    pub body:       Vec<u8>,
}

/// Per-connection state for the encrypted phase: the key, a random
/// session id, the current server salt and the sequence counter.
pub struct EncryptedSession {
    auth_key:   AuthKey,
    session_id: i64,
    sequence:   i32,
    /// Current server salt to include in outgoing messages.
    pub salt:   i64,
}

impl EncryptedSession {
    /// Start a session on `auth_key` with the given salt.
    pub fn new(auth_key: AuthKey, salt: i64) -> Self {
        Self { auth_key, session_id: i64::from_le_bytes(random_array()), sequence: 0, salt }
    }

    /// Forget the conversation and start a new one on the same key.
    pub fn reset(&mut self) {
        self.session_id = i64::from_le_bytes(random_array());
        self.sequence = 0;
        log::debug!("[mtp] new session id {:#x}", self.session_id);
    }

    /// Return the current session_id.
    pub fn session_id(&self) -> i64 { self.session_id }

    /// The key this session encrypts with.
    pub fn auth_key(&self) -> &AuthKey { &self.auth_key }

    /// Next sequence number.
    ///
    /// Content-related messages get `counter * 2 + 1` and advance the
    /// counter; everything else gets `counter * 2`.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        }
    }

    /// Encrypt one message.
    ///
    /// Layout of the plaintext before encryption:
    /// ```text
    /// salt:       i64
    /// session_id: i64
    /// msg_id:     i64
    /// seq_no:     i32
    /// body_len:   i32
    /// body:       [u8; body_len]
    /// ```
    pub fn pack(&self, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INNER_HEADER_LEN + body.len());
        buf.extend(self.salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(msg_id.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend_from_slice(body);
        encrypt_message(&buf, &self.auth_key, Side::Client)
    }

    /// Decrypt an encrypted server frame.
    pub fn unpack(&self, frame: &[u8]) -> Result<DecryptedMessage, DecryptError> {
        let plain = decrypt_message(frame, &self.auth_key, Side::Server)?;
        let msg = split_inner(&plain);
        if msg.session_id != self.session_id {
            return Err(DecryptError::SessionMismatch { got: msg.session_id });
        }
        if !is_server_msg_id(msg.msg_id) {
            return Err(DecryptError::BadMsgId { msg_id: msg.msg_id });
        }
        Ok(msg)
    }
}

/// Split a decrypted, unpadded inner message into its fields.
///
/// `plain` must be at least [`INNER_HEADER_LEN`] bytes, which
/// `decrypt_message` guarantees.
pub(crate) fn split_inner(plain: &[u8]) -> DecryptedMessage {
    let le8 = |r: std::ops::Range<usize>| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&plain[r]);
        i64::from_le_bytes(b)
    };
    let mut seq = [0u8; 4];
    seq.copy_from_slice(&plain[24..28]);
    DecryptedMessage {
        salt:       le8(0..8),
        session_id: le8(8..16),
        msg_id:     le8(16..24),
        seq_no:     i32::from_le_bytes(seq),
        body:       plain[INNER_HEADER_LEN..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtp_crypto::do_encrypt_message;

    fn key() -> AuthKey {
        AuthKey::from_bytes(std::array::from_fn(|i| (i * 13 + 1) as u8))
    }

    fn server_packet(session: &EncryptedSession, msg_id: i64, body: &[u8]) -> Vec<u8> {
        let mut plain = Vec::new();
        plain.extend(77i64.to_le_bytes());
        plain.extend(session.session_id().to_le_bytes());
        plain.extend(msg_id.to_le_bytes());
        plain.extend(2i32.to_le_bytes());
        plain.extend((body.len() as u32).to_le_bytes());
        plain.extend_from_slice(body);
        do_encrypt_message(&plain, &key(), Side::Server, &[0; 16])
    }

    #[test]
    fn seq_numbers_follow_content_flag() {
        let mut s = EncryptedSession::new(key(), 0);
        assert_eq!(s.next_seq_no(false), 0);
        assert_eq!(s.next_seq_no(true), 1);
        assert_eq!(s.next_seq_no(true), 3);
        assert_eq!(s.next_seq_no(false), 4);
        s.reset();
        assert_eq!(s.next_seq_no(true), 1);
    }

    #[test]
    fn unpack_checks_session_and_parity() {
        let s = EncryptedSession::new(key(), 0);
        let msg = s.unpack(&server_packet(&s, 0x1001, &[1, 2, 3, 4])).unwrap();
        assert_eq!((msg.salt, msg.seq_no, msg.body.as_slice()), (77, 2, &[1u8, 2, 3, 4][..]));

        assert_eq!(
            s.unpack(&server_packet(&s, 0x1000, &[])),
            Err(DecryptError::BadMsgId { msg_id: 0x1000 })
        );

        let mut other = EncryptedSession::new(key(), 0);
        other.reset();
        assert!(matches!(
            s.unpack(&server_packet(&other, 0x1001, &[])),
            Err(DecryptError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn own_packets_do_not_decrypt_as_server() {
        let s = EncryptedSession::new(key(), 5);
        let packet = s.pack(4, 1, &[0; 8]);
        assert!(matches!(s.unpack(&packet), Err(DecryptError::Crypto(_))));
    }
}
