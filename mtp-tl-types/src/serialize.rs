//! The [`Serializable`] trait and its implementations for primitive TL types.
//!
//! Everything is little-endian and 4-byte aligned, per the
//! [MTProto Binary Serialization] rules.
//!
//! [MTProto Binary Serialization]: https://core.telegram.org/mtproto/serialize

use crate::{Blob, RawVec, VECTOR_ID};

/// Serialize `self` into TL binary format.
pub trait Serializable {
    /// Appends the serialized form of `self` to `buf`.
    fn serialize(&self, buf: &mut impl Extend<u8>);

    /// Convenience: allocate a fresh `Vec<u8>` and serialize into it.
    fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.serialize(&mut v);
        v
    }
}

// ─── bool ────────────────────────────────────────────────────────────────────

/// `true`  → `boolTrue#997275b5`
/// `false` → `boolFalse#bc799737`
impl Serializable for bool {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let id: u32 = if *self { 0x997275b5 } else { 0xbc799737 };
        id.serialize(buf);
    }
}

// ─── fixed-width ─────────────────────────────────────────────────────────────

macro_rules! le_serializable {
    ($($t:ty),+) => {$(
        impl Serializable for $t {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                buf.extend(self.to_le_bytes());
            }
        }
    )+};
}

le_serializable!(i32, u32, i64, u64, f64);

/// `int128` / `int256` are written as-is (nonces are opaque byte strings).
impl<const N: usize> Serializable for [u8; N] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.iter().copied());
    }
}

// ─── bytes ───────────────────────────────────────────────────────────────────

/// Write `data` as a TL `bytes` value.
///
/// * `len ≤ 253`: `[len][data][pad]`
/// * `len ≥ 254`: `[0xfe][len: 3 LE bytes][data][pad]`
///
/// The pad brings the whole value to a multiple of 4.
pub fn write_bytes(data: &[u8], buf: &mut impl Extend<u8>) {
    let len = data.len();
    let header = if len <= 253 {
        buf.extend([len as u8]);
        1
    } else {
        let l = (len as u32).to_le_bytes();
        buf.extend([0xfe, l[0], l[1], l[2]]);
        4
    };
    buf.extend(data.iter().copied());
    let padding = (4 - (header + len) % 4) % 4;
    buf.extend(std::iter::repeat_n(0u8, padding));
}

impl Serializable for &[u8] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        write_bytes(self, buf);
    }
}

impl Serializable for Vec<u8> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        write_bytes(self, buf);
    }
}

impl Serializable for String {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        write_bytes(self.as_bytes(), buf);
    }
}

/// Blobs are spliced in verbatim, without a length prefix.
impl Serializable for Blob {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.0.iter().copied());
    }
}

// ─── vectors ─────────────────────────────────────────────────────────────────

/// Boxed `Vector<T>`: constructor id, count, items.
impl<T: Serializable> Serializable for Vec<T> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        VECTOR_ID.serialize(buf);
        RawVec::serialize_items(self, buf);
    }
}

/// Bare `vector<T>`: count, items.
impl<T: Serializable> Serializable for RawVec<T> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        RawVec::serialize_items(&self.0, buf);
    }
}

impl<T: Serializable> RawVec<T> {
    fn serialize_items(items: &[T], buf: &mut impl Extend<u8>) {
        (items.len() as i32).serialize(buf);
        items.iter().for_each(|item| item.serialize(buf));
    }
}
