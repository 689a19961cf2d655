//! Bare constructors of the MTProto service schema.

use crate::deserialize::{Buffer, Error, Result};
use crate::{Blob, Deserializable, RawVec, Serializable};

// ─── Key exchange ────────────────────────────────────────────────────────────

tl_object! {
    /// `resPQ`: the server's answer to `req_pq`.
    ResPq = 0x05162463 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        pq: Vec<u8>,
        server_public_key_fingerprints: Vec<i64>,
    }
}

tl_object! {
    /// `p_q_inner_data`, RSA-encrypted into `req_DH_params`.
    PQInnerData = 0x83c95aec {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
    }
}

tl_object! {
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash: [u8; 16],
    }
}

tl_object! {
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_answer: Vec<u8>,
    }
}

tl_object! {
    /// Decrypted payload of `server_DH_params_ok`.
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        g: i32,
        dh_prime: Vec<u8>,
        g_a: Vec<u8>,
        server_time: i32,
    }
}

tl_object! {
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        retry_id: i64,
        g_b: Vec<u8>,
    }
}

tl_object! {
    DhGenOk = 0x3bcbf734 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash1: [u8; 16],
    }
}

tl_object! {
    DhGenRetry = 0x46dc1fb9 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash2: [u8; 16],
    }
}

tl_object! {
    DhGenFail = 0xa69dae02 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash3: [u8; 16],
    }
}

// ─── Service messages ────────────────────────────────────────────────────────

tl_object! {
    MsgsAck = 0x62d6b459 {
        msg_ids: Vec<i64>,
    }
}

tl_object! {
    BadMsgNotification = 0xa7eff811 {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
    }
}

tl_object! {
    BadServerSalt = 0xedab447b {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
        new_server_salt: i64,
    }
}

tl_object! {
    MsgsStateReq = 0xda69fb52 {
        msg_ids: Vec<i64>,
    }
}

tl_object! {
    /// One state byte per id of the `msgs_state_req` identified by
    /// `req_msg_id`.
    MsgsStateInfo = 0x04deb57d {
        req_msg_id: i64,
        info: Vec<u8>,
    }
}

tl_object! {
    MsgsAllInfo = 0x8cc0d131 {
        msg_ids: Vec<i64>,
        info: Vec<u8>,
    }
}

tl_object! {
    MsgDetailedInfo = 0x276d3ec6 {
        msg_id: i64,
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
}

tl_object! {
    MsgNewDetailedInfo = 0x809db6df {
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
}

tl_object! {
    MsgResendReq = 0x7d861a08 {
        msg_ids: Vec<i64>,
    }
}

tl_object! {
    /// `result` is whatever the call returned, possibly `gzip_packed`.
    RpcResult = 0xf35c6d01 {
        req_msg_id: i64,
        result: Blob,
    }
}

tl_object! {
    RpcError = 0x2144ca19 {
        error_code: i32,
        error_message: String,
    }
}

tl_object! {
    NewSessionCreated = 0x9ec20908 {
        first_msg_id: i64,
        unique_id: i64,
        server_salt: i64,
    }
}

tl_object! {
    Pong = 0x347773c5 {
        msg_id: i64,
        ping_id: i64,
    }
}

tl_object! {
    GzipPacked = 0x3072cfa1 {
        packed_data: Vec<u8>,
    }
}

tl_object! {
    MsgContainer = 0x73f1f8dc {
        messages: RawVec<Message>,
    }
}

// ─── Container entry ─────────────────────────────────────────────────────────

/// One entry of `msg_container`: `msg_id ‖ seqno ‖ bytes ‖ body`.
///
/// Not a boxed type; it has no constructor id of its own.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub msg_id: i64,
    pub seqno: i32,
    pub body: Vec<u8>,
}

impl Message {
    /// Size of the entry header preceding the body.
    pub const HEADER_LEN: usize = 16;

    /// Bytes this entry takes inside a container.
    pub fn wire_len(&self) -> usize {
        Self::HEADER_LEN + self.body.len()
    }
}

impl Serializable for Message {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.msg_id.serialize(buf);
        self.seqno.serialize(buf);
        (self.body.len() as i32).serialize(buf);
        buf.extend(self.body.iter().copied());
    }
}

impl Deserializable for Message {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let msg_id = i64::deserialize(buf)?;
        let seqno = i32::deserialize(buf)?;
        let bytes = i32::deserialize(buf)?;
        if bytes < 0 || bytes % 4 != 0 || bytes as usize > buf.remaining() {
            return Err(Error::BadLength { len: bytes as i64 });
        }
        let body = buf.read_slice(bytes as usize)?.to_vec();
        Ok(Self { msg_id, seqno, body })
    }
}

impl MsgContainer {
    /// Bytes taken by the constructor id and the count.
    pub const HEADER_LEN: usize = 8;
}
