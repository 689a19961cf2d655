//! TL serialization and the MTProto service schema.
//!
//! Only the constructors the transport/session core actually speaks live
//! here; application RPC bodies travel as opaque [`Blob`]s.
//!
//! # Overview
//!
//! | Module        | Contents                                                   |
//! |---------------|------------------------------------------------------------|
//! | [`types`]     | Concrete constructors (bare types) as `struct`s            |
//! | [`functions`] | Client calls as `struct`s implementing [`RemoteCall`]      |
//! | [`enums`]     | Boxed types as `enum`s implementing [`Deserializable`]     |
//!
//! # Example
//!
//! ```rust
//! use mtp_tl_types::{functions, Deserializable, Serializable};
//!
//! let req = functions::ReqPq { nonce: [7; 16] };
//! let bytes = req.to_bytes();
//! assert_eq!(&bytes[..4], &0x60469778u32.to_le_bytes());
//! ```

#![deny(unsafe_code)]

#[macro_use]
mod macros;

pub mod deserialize;
pub mod enums;
pub mod functions;
pub mod serialize;
pub mod types;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// Constructor id of the boxed `Vector` type.
pub const VECTOR_ID: u32 = 0x1cb5c415;

/// Bare vector: `vector` (lowercase) as opposed to the boxed `Vector`.
///
/// `msg_container` uses this form for its message list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// Bytes that are passed through without interpretation.
///
/// Reading a `Blob` consumes everything left in the buffer, which is how
/// `rpc_result.result` and container bodies are carried.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self { Self(v) }
}

impl From<Blob> for Vec<u8> {
    fn from(b: Blob) -> Self { b.0 }
}

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every schema object has a unique 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID as specified in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that the client sends as a call.
///
/// `Return` is the type the server answers with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}

/// Peek the constructor id at the start of `body` without consuming it.
pub fn constructor_id(body: &[u8]) -> Option<u32> {
    body.get(..4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
