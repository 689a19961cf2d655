//! RSA public keys used to authenticate the server during key exchange.
//!
//! Only the public half ever exists on the client. A key that fails to
//! parse is never constructed, so every `PublicKey` in hand is usable.

use num_bigint::BigUint;
use num_traits::Zero;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;

use crate::sha1;

/// Size of an encrypted block for the 2048-bit keys MTProto uses.
pub const BLOCK_LEN: usize = 256;

/// Production server key.
pub const PRODUCTION_KEY_PEM: &str = "\
-----BEGIN RSA PUBLIC KEY-----
MIIBCgKCAQEA6LszBcC1LGzyr992NzE0ieY+BSaOW622Aa9Bd4ZHLl+TuFQ4lo4g
5nKaMBwK/BIb9xUfg0Q29/2mgIR6Zr9krM7HjuIcCzFvDtr+L0GQjae9H0pRB2OO
62cECs5HKhT5DZ98K33vmWiLowc621dQuwKWSQKjWf50XYFw42h21P2KXUGyp2y/
+aEyZ+uVgLLQbRA1dEjSDZ2iGRy12Mk5gpYc397aYp438fsJoHIgJ2lgMv5h7WY9
t6N/byY9Nw9p21Og3AoXSL2q/2IJ1WRUhebgAdGVMlV1fkuOQoEzR7EdpqtQD9Cs
5+bfo3Nhmcyvk5ftB0WkJ9z6bNZ7yxrP8wIDAQAB
-----END RSA PUBLIC KEY-----";

/// Test-environment server key.
pub const TEST_KEY_PEM: &str = "\
-----BEGIN RSA PUBLIC KEY-----
MIIBCgKCAQEAyMEdY1aR+sCR3ZSJrtztKTKqigvO/vBfqACJLZtS7QMgCGXJ6XIR
yy7mx66W0/sOFa7/1mAZtEoIokDP3ShoqF4fVNb6XeqgQfaUHd8wJpDWHcR2OFwv
plUUI1PLTktZ9uW2WE23b+ixNwJjJGwBDJPQEQFBE+vfmH0JP503wr5INS1poWg/
j25sIWeYPHYeOrFp/eXaqhISP6G+q2IeTaWTXpwZj4LzXq5YOpk4bYEQ6mvRq7D1
aHWfYmlEGepfaYR8Q0YqvvhYtMte3ITnuSJs171+GDqpdKcSwHnd6FudwGO4pcCO
j4WcDuXc2CTHgH8gFTNhp/Y8/SpDOhvn9QIDAQAB
-----END RSA PUBLIC KEY-----";

/// An RSA public key `(n, e)` with its cached fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    n: BigUint,
    e: BigUint,
    fingerprint: i64,
}

impl PublicKey {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Self::from_components(
            BigUint::parse_bytes(n.as_bytes(), 10)?,
            BigUint::parse_bytes(e.as_bytes(), 10)?,
        )
    }

    /// Parse a PKCS#1 `RSA PUBLIC KEY` PEM block.
    pub fn from_pem(pem: &str) -> Option<Self> {
        let key = RsaPublicKey::from_pkcs1_pem(pem.trim()).ok()?;
        Self::from_components(
            BigUint::from_bytes_be(&key.n().to_bytes_be()),
            BigUint::from_bytes_be(&key.e().to_bytes_be()),
        )
    }

    /// Build from the raw components; zero values are rejected.
    pub fn from_components(n: BigUint, e: BigUint) -> Option<Self> {
        if n.is_zero() || e.is_zero() {
            return None;
        }
        let fingerprint = compute_fingerprint(&n, &e);
        Some(Self { n, e, fingerprint })
    }

    /// Lower 64 bits of SHA-1 over the TL-serialized `n` and `e`, as the
    /// server lists it in `resPQ`.
    pub fn fingerprint(&self) -> i64 { self.fingerprint }

    /// The modulus.
    pub fn modulus(&self) -> &BigUint { &self.n }

    /// Raw RSA: `block^e mod n`, left-padded to [`BLOCK_LEN`].
    ///
    /// `None` if `block` is not smaller than the modulus or the key is
    /// wider than 2048 bits.
    pub fn encrypt(&self, block: &[u8]) -> Option<[u8; BLOCK_LEN]> {
        let m = BigUint::from_bytes_be(block);
        if m >= self.n {
            return None;
        }
        let c = m.modpow(&self.e, &self.n).to_bytes_be();
        if c.len() > BLOCK_LEN {
            return None;
        }
        let mut out = [0u8; BLOCK_LEN];
        out[BLOCK_LEN - c.len()..].copy_from_slice(&c);
        Some(out)
    }

    /// Encrypt `data` the way `req_DH_params` expects:
    /// `0x00 ‖ SHA1(data) ‖ data ‖ random`, 256 bytes, then raw RSA.
    ///
    /// `None` if `data` does not fit next to its hash.
    pub fn encrypt_hashed(&self, data: &[u8], random: &[u8; BLOCK_LEN - 1]) -> Option<[u8; BLOCK_LEN]> {
        let used = 1 + 20 + data.len();
        if used > BLOCK_LEN {
            return None;
        }
        let mut block = [0u8; BLOCK_LEN];
        block[1..21].copy_from_slice(&sha1!(data));
        block[21..used].copy_from_slice(data);
        block[used..].copy_from_slice(&random[..BLOCK_LEN - used]);
        self.encrypt(&block)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey(fingerprint={}, bits={})", self.fingerprint, self.n.bits())
    }
}

/// The keys shipped with the client for the chosen environment.
pub fn builtin_keys(test_mode: bool) -> Vec<PublicKey> {
    let pems: &[&str] = if test_mode { &[TEST_KEY_PEM] } else { &[PRODUCTION_KEY_PEM] };
    pems.iter().filter_map(|pem| PublicKey::from_pem(pem)).collect()
}

/// First key in `keys` whose fingerprint the server offered.
///
/// Server order wins, mirroring how the fingerprints are listed in `resPQ`.
pub fn find_by_fingerprint<'a>(keys: &'a [PublicKey], offered: &[i64]) -> Option<&'a PublicKey> {
    offered
        .iter()
        .find_map(|fp| keys.iter().find(|k| k.fingerprint == *fp))
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn tl_bytes(data: &[u8], out: &mut Vec<u8>) {
    let header = if data.len() <= 253 {
        out.push(data.len() as u8);
        1
    } else {
        let l = (data.len() as u32).to_le_bytes();
        out.extend_from_slice(&[0xfe, l[0], l[1], l[2]]);
        4
    };
    out.extend_from_slice(data);
    out.resize(out.len() + (4 - (header + data.len()) % 4) % 4, 0);
}

fn compute_fingerprint(n: &BigUint, e: &BigUint) -> i64 {
    let mut buf = Vec::with_capacity(BLOCK_LEN + 16);
    tl_bytes(&n.to_bytes_be(), &mut buf);
    tl_bytes(&e.to_bytes_be(), &mut buf);
    let sha = sha1!(&buf);
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&sha[12..20]);
    i64::from_le_bytes(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_fingerprints() {
        let prod = PublicKey::from_pem(PRODUCTION_KEY_PEM).unwrap();
        assert_eq!(prod.fingerprint(), -3414540481677951611);
        let test = PublicKey::from_pem(TEST_KEY_PEM).unwrap();
        assert_eq!(test.fingerprint(), -5595554452916591101);
        assert_eq!(builtin_keys(true), vec![test]);
    }

    #[test]
    fn garbage_pem_yields_no_key() {
        assert!(PublicKey::from_pem("-----BEGIN RSA PUBLIC KEY-----\n!!!\n-----END").is_none());
        // Valid base64, but no armor and an OCTET STRING inside.
        assert!(PublicKey::from_pem("BAIAAA==").is_none());
        // SubjectPublicKeyInfo is not PKCS#1.
        let spki = PRODUCTION_KEY_PEM.replace("RSA PUBLIC KEY", "PUBLIC KEY");
        assert!(PublicKey::from_pem(&spki).is_none());
        assert!(PublicKey::new("0", "3").is_none());
        assert!(PublicKey::new("12x", "3").is_none());
    }

    #[test]
    fn pem_layout_does_not_change_the_key() {
        use rsa::pkcs1::{EncodeRsaPublicKey, LineEnding};

        let prod = PublicKey::from_pem(PRODUCTION_KEY_PEM).unwrap();
        let reencoded = RsaPublicKey::from_pkcs1_pem(PRODUCTION_KEY_PEM)
            .unwrap()
            .to_pkcs1_pem(LineEnding::CRLF)
            .unwrap();
        let padded = format!("\n  {reencoded}\n");
        assert_eq!(PublicKey::from_pem(&padded), Some(prod.clone()));
        assert_eq!(prod.modulus().bits(), 2048);
    }

    #[test]
    fn textbook_rsa() {
        // n = 61 * 53, e = 17: 65 encrypts to 2790.
        let key = PublicKey::new("3233", "17").unwrap();
        let out = key.encrypt(&[65]).unwrap();
        assert_eq!(&out[254..], &2790u16.to_be_bytes());
        assert!(out[..254].iter().all(|&b| b == 0));
        assert!(key.encrypt(&3233u16.to_be_bytes()).is_none());
    }

    #[test]
    fn hashed_block_limits() {
        let key = PublicKey::from_pem(PRODUCTION_KEY_PEM).unwrap();
        let random = [0x42u8; BLOCK_LEN - 1];
        assert!(key.encrypt_hashed(&[1u8; 235], &random).is_some());
        assert!(key.encrypt_hashed(&[1u8; 236], &random).is_none());
    }

    #[test]
    fn fingerprint_selection_follows_server_order() {
        let keys = builtin_keys(false);
        let fp = keys[0].fingerprint();
        assert_eq!(find_by_fingerprint(&keys, &[1, fp]).map(PublicKey::fingerprint), Some(fp));
        assert!(find_by_fingerprint(&keys, &[1, 2]).is_none());
    }
}
