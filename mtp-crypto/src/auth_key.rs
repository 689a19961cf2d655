//! `AuthKey`: the 2048-bit secret produced by the DH key exchange.

use crate::sha1;

/// An authorization key plus its pre-computed identifiers.
///
/// Values are immutable once built; "no key yet" is `Option<AuthKey>` at
/// the call site, never a half-initialised `AuthKey`.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
    dc_id: i32,
}

impl AuthKey {
    /// Construct from raw 256-byte DH output, not yet bound to a DC.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        Self::new(0, data)
    }

    /// Construct a key that is valid for `dc_id`.
    pub fn new(dc_id: i32, data: [u8; 256]) -> Self {
        let sha = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id, dc_id }
    }

    /// The same secret, bound to `dc_id`.
    pub fn with_dc_id(self, dc_id: i32) -> Self {
        Self { dc_id, ..self }
    }

    /// Parse a stored key; anything but exactly 256 bytes is rejected.
    pub fn from_slice(dc_id: i32, bytes: &[u8]) -> Option<Self> {
        let data: [u8; 256] = bytes.try_into().ok()?;
        Some(Self::new(dc_id, data))
    }

    /// Return the raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; 256] { self.data }

    /// The 8-byte key identifier (SHA-1(key)[12..20]).
    pub fn key_id(&self) -> [u8; 8] { self.key_id }

    /// [`key_id`](Self::key_id) read as the little-endian integer that
    /// appears on the wire.
    pub fn id(&self) -> u64 { u64::from_le_bytes(self.key_id) }

    /// First 64 bits of SHA-1(key); doubles as `retry_id` on `dh_gen_retry`.
    pub fn aux_hash(&self) -> [u8; 8] { self.aux_hash }

    /// The data center this key was created with.
    pub fn dc_id(&self) -> i32 { self.dc_id }

    /// Compute the new-nonce hash needed for `DhGenOk/Retry/Fail` verification.
    pub fn calc_new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let sha = sha1!(new_nonce, [number], &self.aux_hash);
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(dc={}, id={:016x})", self.dc_id, self.id())
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.dc_id == other.dc_id
    }
}

impl Eq for AuthKey {}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> [u8; 256] {
        std::array::from_fn(|i| (i * 7 + 3) as u8)
    }

    #[test]
    fn key_id_is_sha1_tail() {
        let key = AuthKey::from_bytes(secret());
        assert_eq!(hex::encode(key.key_id()), "9ed6e6ef196cc931");
        assert_eq!(key.id(), 3587517436832175774);
        assert_eq!(hex::encode(key.aux_hash()), "6aa0e62cd373dc2e");
    }

    #[test]
    fn key_id_is_stable() {
        let a = AuthKey::new(2, secret());
        let b = AuthKey::from_bytes(secret()).with_dc_id(2);
        assert_eq!(a, b);
        assert_eq!(a.key_id(), b.key_id());
        assert_eq!(a.dc_id(), 2);
    }

    #[test]
    fn from_slice_wants_256_bytes() {
        assert!(AuthKey::from_slice(1, &[0u8; 255]).is_none());
        assert!(AuthKey::from_slice(1, &secret()).is_some());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let s = format!("{:?}", AuthKey::new(4, secret()));
        assert_eq!(s, "AuthKey(dc=4, id=31c96c19efe6d69e)");
    }
}
