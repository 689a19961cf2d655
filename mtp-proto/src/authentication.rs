//! Sans-IO MTProto authorization key generation.
//!
//! # Flow
//!
//! ```text
//! let (req, s1) = authentication::step1();
//! // send req, receive resp
//! let (req, s2) = authentication::step2(s1, resp, &keys)?;
//! // send req, receive resp
//! let (req, s3) = authentication::step3(s2, resp)?;
//! // send req, receive resp
//! match authentication::finish(&s3, resp) {
//!     Ok(done) => { /* done.auth_key is ready */ }
//!     Err(Error::DhGenRetry { retry_id }) => authentication::retry(s3, retry_id)?,
//!     Err(e) => return Err(e),
//! }
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use mtp_crypto::dh::{self, DhError};
use mtp_crypto::rsa::{self, PublicKey};
use mtp_crypto::{AuthKey, aes, factorize, generate_key_data_from_nonce, random_array, sha1};
use mtp_tl_types::{Cursor, Deserializable, Serializable, enums, functions, types};
use num_bigint::BigUint;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors that can occur during auth key generation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce         { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize        { size: usize },
    PqNotFactorizable    { pq: u64 },
    UnknownFingerprints  { fingerprints: Vec<i64> },
    RsaEncryptionFailed,
    DhParamsFail,
    InvalidServerNonce   { got: [u8; 16], expected: [u8; 16] },
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData   { error: mtp_tl_types::deserialize::Error },
    InvalidDhParams      { error: DhError },
    DhGenRetry           { retry_id: i64 },
    DhGenFail,
    InvalidAnswerHash    { got: [u8; 20], expected: [u8; 20] },
    InvalidNewNonceHash  { got: [u8; 16], expected: [u8; 16] },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { got, expected }
                => write!(f, "nonce mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidPqSize { size }
                => write!(f, "pq size {size} invalid (expected 8)"),
            Self::PqNotFactorizable { pq }
                => write!(f, "could not factorize pq {pq:#x}"),
            Self::UnknownFingerprints { fingerprints }
                => write!(f, "no known fingerprint in {fingerprints:?}"),
            Self::RsaEncryptionFailed
                => write!(f, "p_q_inner_data does not fit in one RSA block"),
            Self::DhParamsFail
                => write!(f, "server returned DH params failure"),
            Self::InvalidServerNonce { got, expected }
                => write!(f, "server_nonce mismatch: got {got:?}, expected {expected:?}"),
            Self::EncryptedResponseNotPadded { len }
                => write!(f, "encrypted answer len {len} is not 16-byte aligned"),
            Self::InvalidDhInnerData { error }
                => write!(f, "DH inner data deserialization error: {error}"),
            Self::InvalidDhParams { error }
                => write!(f, "server DH parameters rejected: {error}"),
            Self::DhGenRetry { retry_id }
                => write!(f, "DH gen retry requested (retry_id {retry_id:#x})"),
            Self::DhGenFail   => write!(f, "DH gen failed"),
            Self::InvalidAnswerHash { got, expected }
                => write!(f, "answer hash mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidNewNonceHash { got, expected }
                => write!(f, "new nonce hash mismatch: got {got:?}, expected {expected:?}"),
        }
    }
}

impl From<DhError> for Error {
    fn from(error: DhError) -> Self {
        Self::InvalidDhParams { error }
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// State after step 1.
#[derive(Debug)]
pub struct Step1 { nonce: [u8; 16] }

/// State after step 2.
#[derive(Debug)]
pub struct Step2 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
}

/// State after step 3; kept across `dh_gen_retry` rounds.
#[derive(Debug)]
pub struct Step3 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
    key:          [u8; 32],
    iv:           [u8; 32],
    dh_prime:     BigUint,
    g:            BigUint,
    g_a:          BigUint,
    gab:          BigUint,
    time_offset:  i32,
}

impl Step3 {
    /// The nonce this exchange was opened with.
    pub fn nonce(&self) -> [u8; 16] { self.nonce }
}

/// The final output of a successful auth key handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    /// The 256-byte authorization key.
    pub auth_key:    [u8; 256],
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
    /// Initial server salt.
    pub first_salt:  i64,
}

// ─── Step 1: req_pq ──────────────────────────────────────────────────────────

/// Generate a `req_pq` request. Returns the request + opaque state.
pub fn step1() -> (functions::ReqPq, Step1) {
    do_step1(&random_array())
}

fn do_step1(random: &[u8; 16]) -> (functions::ReqPq, Step1) {
    let nonce = *random;
    (functions::ReqPq { nonce }, Step1 { nonce })
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Process `ResPQ` and generate `req_DH_params`, encrypting for the first
/// server fingerprint found in `keys`.
pub fn step2(
    data:     Step1,
    response: enums::ResPq,
    keys:     &[PublicKey],
) -> Result<(functions::ReqDhParams, Step2), Error> {
    do_step2(data, response, keys, &random_array())
}

fn do_step2(
    data:     Step1,
    response: enums::ResPq,
    keys:     &[PublicKey],
    random:   &[u8; 32 + rsa::BLOCK_LEN - 1],
) -> Result<(functions::ReqDhParams, Step2), Error> {
    let Step1 { nonce } = data;
    let enums::ResPq::ResPq(res_pq) = response;

    check_nonce(&res_pq.nonce, &nonce)?;

    let pq_bytes: [u8; 8] = res_pq.pq.as_slice().try_into()
        .map_err(|_| Error::InvalidPqSize { size: res_pq.pq.len() })?;
    let pq = u64::from_be_bytes(pq_bytes);
    let (p, q) = factorize(pq).ok_or(Error::PqNotFactorizable { pq })?;

    let mut new_nonce = [0u8; 32];
    new_nonce.copy_from_slice(&random[..32]);
    let mut padding = [0u8; rsa::BLOCK_LEN - 1];
    padding.copy_from_slice(&random[32..]);

    let p_bytes = trim_be(p);
    let q_bytes = trim_be(q);

    let pq_inner = types::PQInnerData {
        pq: res_pq.pq.clone(),
        p: p_bytes.clone(),
        q: q_bytes.clone(),
        nonce,
        server_nonce: res_pq.server_nonce,
        new_nonce,
    }
    .to_bytes();

    let key = rsa::find_by_fingerprint(keys, &res_pq.server_public_key_fingerprints)
        .ok_or_else(|| Error::UnknownFingerprints {
            fingerprints: res_pq.server_public_key_fingerprints.clone(),
        })?;
    let ciphertext = key.encrypt_hashed(&pq_inner, &padding).ok_or(Error::RsaEncryptionFailed)?;

    Ok((
        functions::ReqDhParams {
            nonce,
            server_nonce: res_pq.server_nonce,
            p: p_bytes,
            q: q_bytes,
            public_key_fingerprint: key.fingerprint(),
            encrypted_data: ciphertext.to_vec(),
        },
        Step2 { nonce, server_nonce: res_pq.server_nonce, new_nonce },
    ))
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Process `ServerDhParams` and generate `set_client_DH_params`.
pub fn step3(
    data:     Step2,
    response: enums::ServerDhParams,
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i32).unwrap_or_default();
    do_step3(data, response, &random_array(), now)
}

fn do_step3(
    data:     Step2,
    response: enums::ServerDhParams,
    random:   &[u8; 272],
    now:      i32,
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce } = data;

    let mut server_dh_ok = match response {
        enums::ServerDhParams::Fail(f) => {
            check_nonce(&f.nonce, &nonce)?;
            check_server_nonce(&f.server_nonce, &server_nonce)?;
            let digest = sha1!(&new_nonce);
            let mut expected_hash = [0u8; 16];
            expected_hash.copy_from_slice(&digest[4..]);
            check_new_nonce_hash(&f.new_nonce_hash, &expected_hash)?;
            return Err(Error::DhParamsFail);
        }
        enums::ServerDhParams::Ok(x) => x,
    };

    check_nonce(&server_dh_ok.nonce, &nonce)?;
    check_server_nonce(&server_dh_ok.server_nonce, &server_nonce)?;

    let len = server_dh_ok.encrypted_answer.len();
    if len % 16 != 0 || len < 32 {
        return Err(Error::EncryptedResponseNotPadded { len });
    }

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut server_dh_ok.encrypted_answer, &key, &iv);
    let plain = server_dh_ok.encrypted_answer;

    let mut got_hash = [0u8; 20];
    got_hash.copy_from_slice(&plain[..20]);
    let mut cursor = Cursor::from_slice(&plain[20..]);

    let enums::ServerDhInnerData::ServerDhInnerData(inner) =
        enums::ServerDhInnerData::deserialize(&mut cursor)
            .map_err(|error| Error::InvalidDhInnerData { error })?;

    let expected_hash = sha1!(&plain[20..20 + cursor.pos()]);
    if got_hash != expected_hash {
        return Err(Error::InvalidAnswerHash { got: got_hash, expected: expected_hash });
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
    dh::check_prime_and_generator(&dh_prime, inner.g)?;
    let g = BigUint::from(inner.g as u32);
    let g_a = BigUint::from_bytes_be(&inner.g_a);
    dh::check_public_value(&g_a, &dh_prime)?;

    let state = Step3 {
        nonce,
        server_nonce,
        new_nonce,
        key,
        iv,
        dh_prime,
        g,
        g_a,
        gab: BigUint::default(),
        time_offset: inner.server_time.wrapping_sub(now),
    };
    client_dh_params(state, 0, random)
}

/// Answer `dh_gen_retry`: pick a fresh exponent and resend with `retry_id`.
pub fn retry(data: Step3, retry_id: i64) -> Result<(functions::SetClientDhParams, Step3), Error> {
    client_dh_params(data, retry_id, &random_array())
}

fn client_dh_params(
    mut data: Step3,
    retry_id: i64,
    random:   &[u8; 272],
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = data.g.modpow(&b, &data.dh_prime);
    dh::check_public_value(&g_b, &data.dh_prime)?;
    data.gab = data.g_a.modpow(&b, &data.dh_prime);

    let client_dh_inner = types::ClientDhInnerData {
        nonce: data.nonce,
        server_nonce: data.server_nonce,
        retry_id,
        g_b: g_b.to_bytes_be(),
    }
    .to_bytes();

    let digest = sha1!(&client_dh_inner);
    let pad_len = (16 - ((20 + client_dh_inner.len()) % 16)) % 16;

    let mut hashed = Vec::with_capacity(20 + client_dh_inner.len() + pad_len);
    hashed.extend_from_slice(&digest);
    hashed.extend_from_slice(&client_dh_inner);
    hashed.extend_from_slice(&random[256..256 + pad_len]);

    aes::ige_encrypt(&mut hashed, &data.key, &data.iv);

    Ok((
        functions::SetClientDhParams {
            nonce: data.nonce,
            server_nonce: data.server_nonce,
            encrypted_data: hashed,
        },
        data,
    ))
}

// ─── finish: create_key ──────────────────────────────────────────────────────

/// Finalise the handshake. Returns the ready [`Finished`] on success.
///
/// `dh_gen_retry` comes back as [`Error::DhGenRetry`] carrying the
/// `retry_id` to pass to [`retry`].
pub fn finish(data: &Step3, response: enums::SetClientDhParamsAnswer) -> Result<Finished, Error> {
    let Step3 { nonce, server_nonce, new_nonce, gab, time_offset, .. } = data;

    struct DhData { nonce: [u8; 16], server_nonce: [u8; 16], hash: [u8; 16], num: u8 }

    let dh = match response {
        enums::SetClientDhParamsAnswer::DhGenOk(x)    =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash1, num: 1 },
        enums::SetClientDhParamsAnswer::DhGenRetry(x) =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash2, num: 2 },
        enums::SetClientDhParamsAnswer::DhGenFail(x)  =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash3, num: 3 },
    };

    check_nonce(&dh.nonce, nonce)?;
    check_server_nonce(&dh.server_nonce, server_nonce)?;

    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    key_bytes[256 - gab_bytes.len()..].copy_from_slice(&gab_bytes);

    let auth_key = AuthKey::from_bytes(key_bytes);
    let expected_hash = auth_key.calc_new_nonce_hash(new_nonce, dh.num);
    check_new_nonce_hash(&dh.hash, &expected_hash)?;

    let first_salt = {
        let mut buf = [0u8; 8];
        for ((dst, a), b) in buf.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
            *dst = a ^ b;
        }
        i64::from_le_bytes(buf)
    };

    match dh.num {
        1 => Ok(Finished { auth_key: key_bytes, time_offset: *time_offset, first_salt }),
        2 => Err(Error::DhGenRetry { retry_id: i64::from_le_bytes(auth_key.aux_hash()) }),
        _ => Err(Error::DhGenFail),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn trim_be(v: u64) -> Vec<u8> {
    let b = v.to_be_bytes();
    let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
    b[skip..].to_vec()
}

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNonce { got: *got, expected: *expected })
    }
}
fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidServerNonce { got: *got, expected: *expected })
    }
}
fn check_new_nonce_hash(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNewNonceHash { got: *got, expected: *expected })
    }
}
