//! Cryptographic primitives for MTProto.
//!
//! Provides:
//! - AES-256-IGE encryption/decryption
//! - the SHA-1 hash macro and message-key helper
//! - Pollard-rho PQ factorization
//! - RSA public keys and the hashed-block encryption used by `req_DH_params`
//! - Diffie-Hellman parameter validation
//! - `AuthKey`: 256-byte shared secret
//! - message envelope encryption / decryption
//! - DH nonce→key derivation

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
pub mod dh;
mod factorize;
pub mod rsa;
mod sha;

pub use auth_key::AuthKey;
pub use factorize::factorize;
pub use sha::msg_key;

#[doc(hidden)]
pub use sha1 as __sha1;

/// Fill `buf` from the operating system's CSPRNG.
pub fn fill_random(buf: &mut [u8]) {
    getrandom::getrandom(buf).expect("getrandom failed");
}

/// A fresh array of random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    fill_random(&mut out);
    out
}

// ─── Message envelope ────────────────────────────────────────────────────────

/// Errors from [`decrypt_message`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The inner `message_data_length` is unaligned, runs past the data,
    /// or leaves more than 15 bytes of padding.
    BadLength { len: u32 },
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::BadLength { len } => write!(f, "bad inner message length {len}"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

/// Who wrote a message; picks the auth key windows used for its AES key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Client → server.
    Client,
    /// Server → client.
    Server,
}

impl Side {
    fn x(self) -> usize { match self { Side::Client => 0, Side::Server => 8 } }
}

/// Bytes before the body in a decrypted message:
/// `salt ‖ session_id ‖ msg_id ‖ seq_no ‖ length`.
pub const INNER_HEADER_LEN: usize = 32;

/// `auth_key_id ‖ msg_key` in front of the ciphertext.
pub const OUTER_HEADER_LEN: usize = 24;

/// Derive the one-time AES key and IV for `msg_key`.
pub fn prepare_aes(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let ak = &auth_key.data;
    let a = sha1!(msg_key, &ak[x..x + 32]);
    let b = sha1!(&ak[32 + x..48 + x], msg_key, &ak[48 + x..64 + x]);
    let c = sha1!(&ak[64 + x..96 + x], msg_key);
    let d = sha1!(msg_key, &ak[96 + x..128 + x]);

    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&a[..8]);
    key[8..20].copy_from_slice(&b[8..20]);
    key[20..].copy_from_slice(&c[4..16]);

    let mut iv = [0u8; 32];
    iv[..12].copy_from_slice(&a[8..20]);
    iv[12..20].copy_from_slice(&b[..8]);
    iv[20..24].copy_from_slice(&c[16..20]);
    iv[24..].copy_from_slice(&d[..8]);

    (key, iv)
}

/// Encrypt a complete inner message (header plus body, unpadded).
///
/// Returns `key_id ‖ msg_key ‖ ciphertext`; padding is random.
pub fn encrypt_message(plaintext: &[u8], auth_key: &AuthKey, side: Side) -> Vec<u8> {
    let padding: [u8; 16] = random_array();
    do_encrypt_message(plaintext, auth_key, side, &padding)
}

/// [`encrypt_message`] with caller-chosen padding bytes.
pub fn do_encrypt_message(plaintext: &[u8], auth_key: &AuthKey, side: Side, padding: &[u8; 16]) -> Vec<u8> {
    let msg_key = msg_key(plaintext);
    let (key, iv) = prepare_aes(auth_key, &msg_key, side);

    let pad = (16 - plaintext.len() % 16) % 16;
    let mut out = Vec::with_capacity(OUTER_HEADER_LEN + plaintext.len() + pad);
    out.extend_from_slice(&auth_key.key_id);
    out.extend_from_slice(&msg_key);
    out.extend_from_slice(plaintext);
    out.extend_from_slice(&padding[..pad]);
    aes::ige_encrypt(&mut out[OUTER_HEADER_LEN..], &key, &iv);
    out
}

/// Decrypt `key_id ‖ msg_key ‖ ciphertext` written by `side`.
///
/// On success returns the inner message without its padding.
pub fn decrypt_message(packet: &[u8], auth_key: &AuthKey, side: Side) -> Result<Vec<u8>, DecryptError> {
    if packet.len() < OUTER_HEADER_LEN + INNER_HEADER_LEN
        || (packet.len() - OUTER_HEADER_LEN) % 16 != 0
    {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != packet[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&packet[8..OUTER_HEADER_LEN]);

    let (key, iv) = prepare_aes(auth_key, &msg_key, side);
    let mut plain = packet[OUTER_HEADER_LEN..].to_vec();
    aes::ige_decrypt(&mut plain, &key, &iv);

    let len = u32::from_le_bytes([plain[28], plain[29], plain[30], plain[31]]);
    let room = plain.len() - INNER_HEADER_LEN;
    if len % 4 != 0 || len as usize > room || room - len as usize > 15 {
        return Err(DecryptError::BadLength { len });
    }
    plain.truncate(INNER_HEADER_LEN + len as usize);

    if sha::msg_key(&plain) != msg_key {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(plain)
}

/// Derive `(key, iv)` from nonces for the handshake's
/// `server_DH_params_ok` / `set_client_DH_params` envelopes.
pub fn generate_key_data_from_nonce(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AuthKey {
        AuthKey::from_bytes(std::array::from_fn(|i| (i * 7 + 3) as u8))
    }

    fn inner(body: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend(1i64.to_le_bytes());
        v.extend(2i64.to_le_bytes());
        v.extend(0x51e5_7ac4_0000_0004i64.to_le_bytes());
        v.extend(1i32.to_le_bytes());
        v.extend((body.len() as u32).to_le_bytes());
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn prepare_aes_known_answer() {
        let mk: [u8; 16] = std::array::from_fn(|i| 0xa0 + i as u8);
        let (k, iv) = prepare_aes(&key(), &mk, Side::Client);
        assert_eq!(
            k.to_vec(),
            hex::decode("75006915073cf5af0c74b1eff9d9cb9b77349e8ba49d3cfcd25fb574623a240f").unwrap()
        );
        assert_eq!(
            iv.to_vec(),
            hex::decode("329834aaec23cc3f064cb89197587388f360e2f5e04a6c697ee46c13c2760552").unwrap()
        );
        let (k, iv) = prepare_aes(&key(), &mk, Side::Server);
        assert_eq!(
            k.to_vec(),
            hex::decode("82aac064a21cc28a1784f13d741c44074f2ca0d49b3787e81a099b3f58fbbeb6").unwrap()
        );
        assert_eq!(
            iv.to_vec(),
            hex::decode("569f78ab2b6e875181990504f329565de4ce06f2ae9454cdcf903a2b7291163a").unwrap()
        );
    }

    #[test]
    fn encrypt_then_decrypt_strips_padding() {
        let plain = inner(&[9, 9, 9, 9, 8, 8, 8, 8]);
        let packet = do_encrypt_message(&plain, &key(), Side::Server, &[0xee; 16]);
        assert_eq!((packet.len() - OUTER_HEADER_LEN) % 16, 0);
        assert_eq!(&packet[..8], &key().key_id());
        assert_eq!(decrypt_message(&packet, &key(), Side::Server).unwrap(), plain);
    }

    #[test]
    fn wrong_side_is_rejected() {
        let plain = inner(&[1, 2, 3, 4]);
        let packet = encrypt_message(&plain, &key(), Side::Client);
        assert!(decrypt_message(&packet, &key(), Side::Server).is_err());
    }

    #[test]
    fn foreign_key_id_is_rejected() {
        let plain = inner(&[1, 2, 3, 4]);
        let mut packet = encrypt_message(&plain, &key(), Side::Server);
        packet[0] ^= 1;
        assert_eq!(decrypt_message(&packet, &key(), Side::Server), Err(DecryptError::AuthKeyMismatch));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let plain = inner(&[0u8; 64]);
        let mut packet = encrypt_message(&plain, &key(), Side::Server);
        let last = packet.len() - 1;
        packet[last] ^= 0x80;
        assert!(decrypt_message(&packet, &key(), Side::Server).is_err());
    }

    #[test]
    fn oversized_padding_is_rejected() {
        let plain = inner(&[7, 7, 7, 7]);
        assert_eq!(plain.len(), 36);
        let mk = msg_key(&plain);
        let (k, iv) = prepare_aes(&key(), &mk, Side::Server);
        let mut packet = key().key_id().to_vec();
        packet.extend_from_slice(&mk);
        packet.extend_from_slice(&plain);
        packet.extend_from_slice(&[0x55; 28]);
        aes::ige_encrypt(&mut packet[OUTER_HEADER_LEN..], &k, &iv);

        assert_eq!(decrypt_message(&packet, &key(), Side::Server), Err(DecryptError::BadLength { len: 4 }));
    }

    #[test]
    fn short_packet_is_invalid() {
        assert_eq!(decrypt_message(&[0u8; 40], &key(), Side::Server), Err(DecryptError::InvalidBuffer));
    }
}
