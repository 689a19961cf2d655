//! The [`Deserializable`] trait, the bounds-checked [`Cursor`], and
//! primitive impls.

use std::fmt;

use crate::{Blob, RawVec, VECTOR_ID};

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur during deserialization.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Ran out of bytes before the type was fully read.
    UnexpectedEof,
    /// Decoded a constructor ID that doesn't match any known variant.
    UnexpectedConstructor { id: u32 },
    /// A length prefix points past the end of the buffer or is negative.
    BadLength { len: i64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::UnexpectedConstructor { id } => {
                write!(f, "unexpected constructor id: {id:#010x}")
            }
            Self::BadLength { len } => write!(f, "bad length prefix: {len}"),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for deserialization.
pub type Result<T> = std::result::Result<T, Error>;

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// A zero-copy reader over an in-memory byte slice.
///
/// Every accessor checks bounds first; malformed input surfaces as an
/// [`Error`], never as a panic.
#[derive(Clone, Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize { self.pos }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize { self.buf.len() - self.pos }

    /// Borrow `n` bytes and advance past them.
    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.read_slice(1)?[0])
    }

    /// Read exactly `out.len()` bytes.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.read_slice(out.len())?);
        Ok(())
    }

    /// Read a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_slice(n).map(drop)
    }

    /// Look at the next little-endian `u32` without consuming it.
    pub fn peek_u32(&self) -> Result<u32> {
        let b = self.buf.get(self.pos..self.pos + 4).ok_or(Error::UnexpectedEof)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Consume a constructor id, failing unless it equals `id`.
    pub fn expect_constructor(&mut self, id: u32) -> Result<()> {
        match u32::deserialize(self)? {
            got if got == id => Ok(()),
            got => Err(Error::UnexpectedConstructor { id: got }),
        }
    }

    /// Everything not yet consumed, without advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Consume all remaining bytes into `out`.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> usize {
        let slice = self.rest();
        out.extend_from_slice(slice);
        self.pos = self.buf.len();
        slice.len()
    }
}

/// Alias used by schema code: `crate::deserialize::Buffer<'_, '_>`.
pub type Buffer<'a, 'b> = &'a mut Cursor<'b>;

// ─── Deserializable ──────────────────────────────────────────────────────────

/// Deserialize a value from TL binary format.
pub trait Deserializable: Sized {
    /// Read `Self` from `buf`, advancing its position.
    fn deserialize(buf: Buffer) -> Result<Self>;

    /// Convenience: deserialize from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::from_slice(bytes);
        Self::deserialize(&mut cursor)
    }
}

// ─── Primitives ───────────────────────────────────────────────────────────────

impl Deserializable for bool {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            0x997275b5 => Ok(true),
            0xbc799737 => Ok(false),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

macro_rules! le_deserializable {
    ($($t:ty),+) => {$(
        impl Deserializable for $t {
            fn deserialize(buf: Buffer) -> Result<Self> {
                Ok(<$t>::from_le_bytes(buf.read_array()?))
            }
        }
    )+};
}

le_deserializable!(i32, u32, i64, u64, f64);

impl<const N: usize> Deserializable for [u8; N] {
    fn deserialize(buf: Buffer) -> Result<Self> {
        buf.read_array()
    }
}

// ─── Bytes / String ───────────────────────────────────────────────────────────

/// Read a TL `bytes` value, borrowing from the underlying buffer.
pub fn read_bytes<'a>(buf: &mut Cursor<'a>) -> Result<&'a [u8]> {
    let first = buf.read_byte()?;
    let (len, header) = if first == 0xfe {
        let [a, b, c] = buf.read_array::<3>()?;
        (u32::from_le_bytes([a, b, c, 0]) as usize, 4)
    } else {
        (first as usize, 1)
    };
    if len > buf.remaining() {
        return Err(Error::BadLength { len: len as i64 });
    }
    let data = buf.read_slice(len)?;
    buf.skip((4 - (header + len) % 4) % 4)?;
    Ok(data)
}

impl Deserializable for Vec<u8> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        read_bytes(buf).map(<[u8]>::to_vec)
    }
}

impl Deserializable for String {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let bytes = read_bytes(buf)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// A blob swallows the rest of the buffer.
impl Deserializable for Blob {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut out = Vec::with_capacity(buf.remaining());
        buf.read_to_end(&mut out);
        Ok(Blob(out))
    }
}

// ─── Vectors ─────────────────────────────────────────────────────────────────

fn read_count(buf: Buffer) -> Result<usize> {
    let len = i32::deserialize(buf)?;
    // Every element takes at least four bytes on the wire.
    if len < 0 || len as usize > buf.remaining() / 4 {
        return Err(Error::BadLength { len: len as i64 });
    }
    Ok(len as usize)
}

impl<T: Deserializable> Deserializable for Vec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        buf.expect_constructor(VECTOR_ID)?;
        let len = read_count(buf)?;
        (0..len).map(|_| T::deserialize(buf)).collect()
    }
}

impl<T: Deserializable> Deserializable for RawVec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let len = read_count(buf)?;
        (0..len).map(|_| T::deserialize(buf)).collect::<Result<_>>().map(RawVec)
    }
}
