//! An in-memory MTProto server for tests.
//!
//! [`TestServer`] speaks the server half of the key exchange with a fixed
//! RSA key pair, then decrypts client packets and encrypts replies. It does
//! no I/O and keeps no timers; tests drive it frame by frame.

use std::fmt;

use mtp_crypto::rsa::{self, PublicKey};
use mtp_crypto::{AuthKey, Side, aes, decrypt_message, dh, encrypt_message, generate_key_data_from_nonce, random_array, sha1};
use mtp_tl_types::{Cursor, Deserializable, Identifiable, Serializable, constructor_id, enums, functions, types};
use num_bigint::BigUint;

use crate::encrypted::split_inner;
use crate::message::{Message, MsgIdClock};

/// Modulus of the key pair the test server decrypts with.
pub const TEST_RSA_N: &str = "24380471222966417672426490418254708545418837607748784314120388960170496524379314496023130763982936780968261774363805061547334242618488461786780737422931789829014947619808945294559267516759717513130360017069191028675397414326351693802270926424573062125944003119195732071437664165089956253217600334297359984269103842137782325894972980107967256553564821997368938862932928728954898064115596561267032961971255658716474899664092899975565312271385973697080560510119672567484880038922437458150505171427906023069295883130026945211229806491412022772033545820248538350358247430649769852752211298604508742824865552382635965590389";

const TEST_RSA_D: &str = "1621037022660118177633984344683841074304020398794045007381778154232615753009488730280922109709868425821584764053744915935921829839786128022886263687999531168346623041233463221097120835623853228915964169467308541853503276514443406102558792161604545801818835064038564513195441072972206301377781916424321316682961611669724245262835949936523236011697642858671910953797554717049800987494835124208955281807538843936359523555275254939822290105100169948413437148143277310255539113161444792477253348180562879945165711932100922435645097810621774142200479014459114781917393881273252326088948175080489843939073359919648326664323";

/// `pq` handed out in every `resPQ`.
pub const TEST_PQ: u64 = 0x17ED48941A08F981;

/// The public half of the test key pair.
pub fn test_public_key() -> PublicKey {
    match PublicKey::new(TEST_RSA_N, "65537") {
        Some(key) => key,
        None => unreachable!("test modulus is a valid decimal"),
    }
}

/// Why the test server refused a client frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerError {
    /// The frame did not parse.
    Decode(mtp_tl_types::deserialize::Error),
    /// The frame was not a plaintext message.
    NotPlaintext,
    /// The packet did not decrypt under the installed key.
    Decrypt(mtp_crypto::DecryptError),
    /// No auth key has been agreed or installed.
    NoKey,
    /// A handshake check failed.
    Rejected(&'static str),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::NotPlaintext => write!(f, "not a plaintext frame"),
            Self::Decrypt(e) => write!(f, "decrypt: {e}"),
            Self::NoKey => write!(f, "no auth key"),
            Self::Rejected(why) => write!(f, "rejected: {why}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<mtp_tl_types::deserialize::Error> for ServerError {
    fn from(e: mtp_tl_types::deserialize::Error) -> Self { Self::Decode(e) }
}

impl From<mtp_crypto::DecryptError> for ServerError {
    fn from(e: mtp_crypto::DecryptError) -> Self { Self::Decrypt(e) }
}

/// A message the client sent, with containers flattened.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientMessage {
    /// Salt from the envelope.
    pub salt: i64,
    /// Session id from the envelope.
    pub session_id: i64,
    /// The message id.
    pub msg_id: i64,
    /// The sequence number.
    pub seq_no: i32,
    /// Serialized body.
    pub body: Vec<u8>,
    /// Id of the container that carried the message, if any.
    pub container: Option<i64>,
}

impl ClientMessage {
    /// The body's constructor id.
    pub fn constructor_id(&self) -> Option<u32> {
        constructor_id(&self.body)
    }
}

struct Exchange {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    a: BigUint,
    retry_id: i64,
}

/// The server side of one client's key exchange and session.
pub struct TestServer {
    private: BigUint,
    public: PublicKey,
    prime: BigUint,
    exchange: Option<Exchange>,
    /// Answer the next `set_client_DH_params` with `dh_gen_retry`.
    pub retry_once: bool,
    /// Shift applied to `server_time` in `server_DH_inner_data`.
    pub clock_skew: i32,
    auth_key: Option<AuthKey>,
    /// Salt put into replies.
    pub salt: i64,
    session_id: i64,
    sequence: i32,
    clock: MsgIdClock,
}

impl Default for TestServer {
    fn default() -> Self { Self::new() }
}

impl TestServer {
    /// A server holding the test key pair.
    pub fn new() -> Self {
        let prime = BigUint::parse_bytes(dh::KNOWN_GOOD_PRIME.as_bytes(), 16).unwrap_or_default();
        Self {
            private: BigUint::parse_bytes(TEST_RSA_D.as_bytes(), 10).unwrap_or_default(),
            public: test_public_key(),
            prime,
            exchange: None,
            retry_once: false,
            clock_skew: 0,
            auth_key: None,
            salt: 0,
            session_id: 0,
            sequence: 0,
            clock: MsgIdClock::new(),
        }
    }

    /// The key clients must trust to talk to this server.
    pub fn public_key(&self) -> PublicKey { self.public.clone() }

    /// The agreed or installed key.
    pub fn auth_key(&self) -> Option<&AuthKey> { self.auth_key.as_ref() }

    /// Skip the exchange and use `key` directly.
    pub fn install_key(&mut self, key: AuthKey, salt: i64) {
        self.auth_key = Some(key);
        self.salt = salt;
    }

    /// Forget the key, as a server that lost it would.
    pub fn drop_key(&mut self) {
        self.auth_key = None;
    }

    /// The session id of the last packet received.
    pub fn session_id(&self) -> i64 { self.session_id }

    // ── Key exchange ────────────────────────────────────────────────────────

    /// Answer one plaintext handshake frame.
    pub fn handle_plaintext(&mut self, frame: &[u8]) -> Result<Vec<u8>, ServerError> {
        let body = parse_client_plaintext(frame)?;
        let reply = match constructor_id(&body) {
            Some(functions::ReqPq::CONSTRUCTOR_ID) => self.res_pq(functions::ReqPq::from_bytes(&body)?),
            Some(functions::ReqDhParams::CONSTRUCTOR_ID) => {
                self.server_dh_params(functions::ReqDhParams::from_bytes(&body)?)?
            }
            Some(functions::SetClientDhParams::CONSTRUCTOR_ID) => {
                self.dh_gen(functions::SetClientDhParams::from_bytes(&body)?)?
            }
            Some(id) => return Err(mtp_tl_types::deserialize::Error::UnexpectedConstructor { id }.into()),
            None => return Err(mtp_tl_types::deserialize::Error::UnexpectedEof.into()),
        };
        Ok(Message::plaintext(self.next_msg_id(), reply).to_plaintext_bytes())
    }

    fn res_pq(&mut self, req: functions::ReqPq) -> Vec<u8> {
        let server_nonce = random_array();
        self.exchange = Some(Exchange {
            nonce: req.nonce,
            server_nonce,
            new_nonce: [0; 32],
            a: BigUint::from_bytes_be(&random_array::<256>()),
            retry_id: 0,
        });
        types::ResPq {
            nonce: req.nonce,
            server_nonce,
            pq: TEST_PQ.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![self.public.fingerprint()],
        }
        .to_bytes()
    }

    fn server_dh_params(&mut self, req: functions::ReqDhParams) -> Result<Vec<u8>, ServerError> {
        let ex = self.exchange.as_mut().ok_or(ServerError::Rejected("req_DH_params before req_pq"))?;
        if req.nonce != ex.nonce || req.server_nonce != ex.server_nonce {
            return Err(ServerError::Rejected("nonce mismatch"));
        }
        if req.public_key_fingerprint != self.public.fingerprint() {
            return Err(ServerError::Rejected("unknown fingerprint"));
        }
        let p = u64::from_be_bytes(pad_be::<8>(&req.p));
        let q = u64::from_be_bytes(pad_be::<8>(&req.q));
        if p.checked_mul(q) != Some(TEST_PQ) || p > q {
            return Err(ServerError::Rejected("wrong factors"));
        }

        let m = BigUint::from_bytes_be(&req.encrypted_data).modpow(&self.private, self.public.modulus());
        let block = pad_be::<{ rsa::BLOCK_LEN }>(&m.to_bytes_be());
        let mut cur = Cursor::from_slice(&block[21..]);
        let inner = types::PQInnerData::deserialize(&mut cur)?;
        if sha1!(&block[21..21 + cur.pos()]) != block[1..21] {
            return Err(ServerError::Rejected("p_q_inner_data hash"));
        }
        if inner.nonce != ex.nonce || inner.server_nonce != ex.server_nonce {
            return Err(ServerError::Rejected("inner nonce mismatch"));
        }
        ex.new_nonce = inner.new_nonce;

        let g = BigUint::from(3u32);
        let now = self.clock.server_now() as i32;
        let answer = types::ServerDhInnerData {
            nonce: ex.nonce,
            server_nonce: ex.server_nonce,
            g: 3,
            dh_prime: self.prime.to_bytes_be(),
            g_a: g.modpow(&ex.a, &self.prime).to_bytes_be(),
            server_time: now.wrapping_add(self.clock_skew),
        }
        .to_bytes();
        let mut encrypted = sha1!(&answer).to_vec();
        encrypted.extend_from_slice(&answer);
        let pad = (16 - encrypted.len() % 16) % 16;
        encrypted.extend_from_slice(&random_array::<16>()[..pad]);
        let (key, iv) = generate_key_data_from_nonce(&ex.server_nonce, &ex.new_nonce);
        aes::ige_encrypt(&mut encrypted, &key, &iv);

        Ok(types::ServerDhParamsOk {
            nonce: ex.nonce,
            server_nonce: ex.server_nonce,
            encrypted_answer: encrypted,
        }
        .to_bytes())
    }

    fn dh_gen(&mut self, req: functions::SetClientDhParams) -> Result<Vec<u8>, ServerError> {
        let ex = self.exchange.as_mut().ok_or(ServerError::Rejected("set_client_DH_params too early"))?;
        if req.nonce != ex.nonce || req.server_nonce != ex.server_nonce {
            return Err(ServerError::Rejected("nonce mismatch"));
        }
        let mut plain = req.encrypted_data;
        if plain.len() % 16 != 0 || plain.len() < 32 {
            return Err(ServerError::Rejected("unaligned client DH data"));
        }
        let (key, iv) = generate_key_data_from_nonce(&ex.server_nonce, &ex.new_nonce);
        aes::ige_decrypt(&mut plain, &key, &iv);
        let mut cur = Cursor::from_slice(&plain[20..]);
        let inner = types::ClientDhInnerData::deserialize(&mut cur)?;
        if sha1!(&plain[20..20 + cur.pos()]) != plain[..20] {
            return Err(ServerError::Rejected("client_DH_inner_data hash"));
        }
        if inner.retry_id != ex.retry_id {
            return Err(ServerError::Rejected("wrong retry_id"));
        }
        let g_b = BigUint::from_bytes_be(&inner.g_b);
        dh::check_public_value(&g_b, &self.prime).map_err(|_| ServerError::Rejected("g_b out of range"))?;

        let auth_key = AuthKey::from_bytes(pad_be::<256>(&g_b.modpow(&ex.a, &self.prime).to_bytes_be()));
        if std::mem::take(&mut self.retry_once) {
            ex.retry_id = i64::from_le_bytes(auth_key.aux_hash());
            return Ok(types::DhGenRetry {
                nonce: ex.nonce,
                server_nonce: ex.server_nonce,
                new_nonce_hash2: auth_key.calc_new_nonce_hash(&ex.new_nonce, 2),
            }
            .to_bytes());
        }

        let mut salt = [0u8; 8];
        for (i, b) in salt.iter_mut().enumerate() {
            *b = ex.new_nonce[i] ^ ex.server_nonce[i];
        }
        let reply = types::DhGenOk {
            nonce: ex.nonce,
            server_nonce: ex.server_nonce,
            new_nonce_hash1: auth_key.calc_new_nonce_hash(&ex.new_nonce, 1),
        }
        .to_bytes();
        self.salt = i64::from_le_bytes(salt);
        self.auth_key = Some(auth_key);
        self.exchange = None;
        Ok(reply)
    }

    // ── Encrypted traffic ───────────────────────────────────────────────────

    /// Decrypt a client packet and flatten any container in it.
    pub fn decrypt(&mut self, packet: &[u8]) -> Result<Vec<ClientMessage>, ServerError> {
        let key = self.auth_key.as_ref().ok_or(ServerError::NoKey)?;
        let plain = decrypt_message(packet, key, Side::Client)?;
        let msg = split_inner(&plain);
        if msg.session_id != self.session_id {
            self.session_id = msg.session_id;
            self.sequence = 0;
        }
        let top = ClientMessage {
            salt: msg.salt,
            session_id: msg.session_id,
            msg_id: msg.msg_id,
            seq_no: msg.seq_no,
            body: msg.body,
            container: None,
        };
        if top.constructor_id() != Some(types::MsgContainer::CONSTRUCTOR_ID) {
            return Ok(vec![top]);
        }
        let container = types::MsgContainer::from_bytes(&top.body)?;
        Ok(container
            .messages
            .0
            .into_iter()
            .map(|m| ClientMessage {
                salt: top.salt,
                session_id: top.session_id,
                msg_id: m.msg_id,
                seq_no: m.seqno,
                body: m.body,
                container: Some(top.msg_id),
            })
            .collect())
    }

    /// Encrypt `body` as an answer (`msg_id` ending in `01`).
    pub fn reply(&mut self, body: &[u8], content_related: bool) -> Result<Vec<u8>, ServerError> {
        let msg_id = self.next_msg_id();
        self.encrypt(msg_id, body, content_related)
    }

    /// Encrypt `body` under an explicit message id.
    pub fn encrypt(&mut self, msg_id: i64, body: &[u8], content_related: bool) -> Result<Vec<u8>, ServerError> {
        let key = self.auth_key.as_ref().ok_or(ServerError::NoKey)?;
        let seq_no = if content_related {
            self.sequence += 1;
            self.sequence * 2 - 1
        } else {
            self.sequence * 2
        };
        let mut plain = Vec::with_capacity(32 + body.len());
        plain.extend(self.salt.to_le_bytes());
        plain.extend(self.session_id.to_le_bytes());
        plain.extend(msg_id.to_le_bytes());
        plain.extend(seq_no.to_le_bytes());
        plain.extend((body.len() as u32).to_le_bytes());
        plain.extend_from_slice(body);
        Ok(encrypt_message(&plain, key, Side::Server))
    }

    /// `rpc_result` for `req_msg_id` carrying `result`.
    pub fn rpc_result(&mut self, req_msg_id: i64, result: &[u8]) -> Result<Vec<u8>, ServerError> {
        let body = types::RpcResult { req_msg_id, result: result.to_vec().into() }.to_bytes();
        self.reply(&body, true)
    }

    /// `msgs_ack` for the given ids.
    pub fn ack(&mut self, msg_ids: Vec<i64>) -> Result<Vec<u8>, ServerError> {
        self.reply(&types::MsgsAck { msg_ids }.to_bytes(), false)
    }

    /// `bad_server_salt` for `bad_msg_id`, switching to `new_salt`.
    pub fn bad_server_salt(&mut self, bad_msg_id: i64, bad_msg_seqno: i32, new_salt: i64) -> Result<Vec<u8>, ServerError> {
        let body = enums::BadMsgNotification::from(types::BadServerSalt {
            bad_msg_id,
            bad_msg_seqno,
            error_code: 48,
            new_server_salt: new_salt,
        })
        .to_bytes();
        self.salt = new_salt;
        self.reply(&body, false)
    }

    /// A server message id in the answer range.
    pub fn next_msg_id(&mut self) -> i64 {
        self.clock.next() | 1
    }
}

fn parse_client_plaintext(frame: &[u8]) -> Result<Vec<u8>, ServerError> {
    if frame.len() < Message::HEADER_LEN || frame[..8] != [0; 8] {
        return Err(ServerError::NotPlaintext);
    }
    let len = u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]) as usize;
    frame
        .get(Message::HEADER_LEN..Message::HEADER_LEN + len)
        .map(<[u8]>::to_vec)
        .ok_or(ServerError::Decode(mtp_tl_types::deserialize::Error::UnexpectedEof))
}

fn pad_be<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = bytes.len().min(N);
    out[N - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    out
}
