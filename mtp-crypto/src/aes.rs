//! AES-256 in Infinite Garble Extension mode.
//!
//! The 32-byte IV is two chaining blocks: `iv[..16]` stands in for the
//! previous ciphertext block, `iv[16..]` for the previous plaintext block.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

const BLOCK: usize = 16;

fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    dst.iter_mut().zip(src).for_each(|(d, s)| *d ^= s);
}

fn split_iv(iv: &[u8; 32]) -> ([u8; BLOCK], [u8; BLOCK]) {
    let mut first = [0u8; BLOCK];
    let mut second = [0u8; BLOCK];
    first.copy_from_slice(&iv[..BLOCK]);
    second.copy_from_slice(&iv[BLOCK..]);
    (first, second)
}

/// Encrypt `buffer` in place.
///
/// # Panics
///
/// If `buffer.len()` is not a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert_eq!(buffer.len() % BLOCK, 0, "IGE input must be a multiple of 16 bytes");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let (mut prev_cipher, mut prev_plain) = split_iv(iv);

    for chunk in buffer.chunks_exact_mut(BLOCK) {
        let mut plain = [0u8; BLOCK];
        plain.copy_from_slice(chunk);
        xor_in_place(chunk, &prev_cipher);
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        xor_in_place(chunk, &prev_plain);
        prev_cipher.copy_from_slice(chunk);
        prev_plain = plain;
    }
}

/// Decrypt `buffer` in place.
///
/// # Panics
///
/// If `buffer.len()` is not a multiple of 16.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert_eq!(buffer.len() % BLOCK, 0, "IGE input must be a multiple of 16 bytes");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let (mut prev_cipher, mut prev_plain) = split_iv(iv);

    for chunk in buffer.chunks_exact_mut(BLOCK) {
        let mut ciphertext = [0u8; BLOCK];
        ciphertext.copy_from_slice(chunk);
        xor_in_place(chunk, &prev_plain);
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        xor_in_place(chunk, &prev_cipher);
        prev_plain.copy_from_slice(chunk);
        prev_cipher = ciphertext;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector() -> ([u8; 32], [u8; 32], Vec<u8>) {
        let key = std::array::from_fn(|i| i as u8);
        let iv = std::array::from_fn(|i| 32 + i as u8);
        let plain = (64u8..112).collect();
        (key, iv, plain)
    }

    #[test]
    fn encrypt_known_answer() {
        let (key, iv, mut data) = vector();
        ige_encrypt(&mut data, &key, &iv);
        assert_eq!(
            hex::encode(&data),
            "b6b23cb46d2f43de2c67fc9a3a9e35104fad6ed15177969c1cebc616bcfa482c\
             b220e4d159bedfd570df191a805e9d9d"
        );
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let (key, iv, plain) = vector();
        let mut data = plain.clone();
        ige_encrypt(&mut data, &key, &iv);
        assert_ne!(data, plain);
        ige_decrypt(&mut data, &key, &iv);
        assert_eq!(data, plain);
    }

    #[test]
    #[should_panic(expected = "multiple of 16")]
    fn unaligned_input_panics() {
        let (key, iv, _) = vector();
        ige_encrypt(&mut [0u8; 17], &key, &iv);
    }
}
