/// Calculate the SHA-1 hash of one or more byte slices concatenated.
#[macro_export]
macro_rules! sha1 {
    ( $( $x:expr ),+ ) => {{
        use $crate::__sha1::{Digest, Sha1};
        let mut h = Sha1::new();
        $( h.update($x); )+
        let out: [u8; 20] = h.finalize().into();
        out
    }};
}

/// The 128-bit message key of an unpadded inner message:
/// the middle sixteen bytes of its SHA-1.
pub fn msg_key(plaintext: &[u8]) -> [u8; 16] {
    let sha = sha1!(plaintext);
    let mut out = [0u8; 16];
    out.copy_from_slice(&sha[4..]);
    out
}
