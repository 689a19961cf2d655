//! The key exchange as a state machine over plaintext frames.
//!
//! [`Handshake`] wraps the pure steps in [`crate::authentication`]: feed it
//! every plaintext frame received from the transport and send whatever it
//! returns. Any malformed or inconsistent answer moves it to
//! [`State::Failed`]; restarting is the caller's business.

use mtp_crypto::rsa::PublicKey;
use mtp_tl_types::{Deserializable, Serializable, enums};

use crate::authentication::{self, Error, Finished, Step1, Step2, Step3};
use crate::message::{Message, MsgIdClock, PlaintextError};

/// How many `dh_gen_retry` answers are tolerated before giving up.
pub const MAX_DH_RETRIES: u32 = 5;

/// Externally visible progress of a [`Handshake`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing sent yet.
    Idle,
    /// `req_pq` sent, waiting for `resPQ`.
    ReqPq,
    /// `req_DH_params` sent, waiting for the server's DH parameters.
    ReqDhParams,
    /// `set_client_DH_params` sent, waiting for `dh_gen_*`.
    SetClientDhParams,
    /// An auth key was produced.
    Complete,
    /// The attempt is dead.
    Failed,
}

/// Why a handshake attempt died.
#[derive(Clone, Debug, PartialEq)]
pub enum HandshakeError {
    /// The server's frame was not a valid plaintext message.
    Frame(PlaintextError),
    /// The frame did not hold the expected answer.
    Decode(mtp_tl_types::deserialize::Error),
    /// A protocol check failed.
    Auth(Error),
    /// The server kept asking for retries.
    TooManyRetries,
    /// [`Handshake::handle`] was called with no answer pending.
    NotWaiting,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "bad handshake frame: {e}"),
            Self::Decode(e) => write!(f, "bad handshake answer: {e}"),
            Self::Auth(e) => write!(f, "{e}"),
            Self::TooManyRetries => write!(f, "server requested too many DH retries"),
            Self::NotWaiting => write!(f, "no handshake answer expected"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<PlaintextError> for HandshakeError {
    fn from(e: PlaintextError) -> Self { Self::Frame(e) }
}

impl From<mtp_tl_types::deserialize::Error> for HandshakeError {
    fn from(e: mtp_tl_types::deserialize::Error) -> Self { Self::Decode(e) }
}

impl From<Error> for HandshakeError {
    fn from(e: Error) -> Self { Self::Auth(e) }
}

/// What to do after feeding a frame to the handshake.
#[derive(Debug)]
pub enum Progress {
    /// Send this plaintext frame and keep waiting.
    Send(Vec<u8>),
    /// The key exists.
    Done(Finished),
}

enum Stage {
    Idle,
    ReqPq(Step1),
    ReqDhParams(Step2),
    SetClientDhParams(Step3),
    Complete,
    Failed,
}

/// One key-exchange attempt.
pub struct Handshake {
    stage: Stage,
    keys: Vec<PublicKey>,
    clock: MsgIdClock,
    retries: u32,
}

impl Handshake {
    /// A fresh attempt that trusts `keys`.
    pub fn new(keys: Vec<PublicKey>) -> Self {
        Self { stage: Stage::Idle, keys, clock: MsgIdClock::new(), retries: 0 }
    }

    /// Current state.
    pub fn state(&self) -> State {
        match self.stage {
            Stage::Idle => State::Idle,
            Stage::ReqPq(_) => State::ReqPq,
            Stage::ReqDhParams(_) => State::ReqDhParams,
            Stage::SetClientDhParams(_) => State::SetClientDhParams,
            Stage::Complete => State::Complete,
            Stage::Failed => State::Failed,
        }
    }

    /// Produce the opening `req_pq` frame. Restarts the attempt if one
    /// was already under way.
    pub fn start(&mut self) -> Vec<u8> {
        let (req, s1) = authentication::step1();
        self.stage = Stage::ReqPq(s1);
        self.retries = 0;
        log::debug!("[mtp] handshake: sending req_pq");
        self.frame(&req)
    }

    /// Feed one plaintext frame from the server.
    pub fn handle(&mut self, frame: &[u8]) -> Result<Progress, HandshakeError> {
        let stage = std::mem::replace(&mut self.stage, Stage::Failed);
        let result = self.advance(stage, frame);
        if let Err(e) = &result {
            log::warn!("[mtp] handshake failed: {e}");
        }
        result
    }

    fn advance(&mut self, stage: Stage, frame: &[u8]) -> Result<Progress, HandshakeError> {
        if matches!(stage, Stage::Idle | Stage::Complete | Stage::Failed) {
            self.stage = stage;
            return Err(HandshakeError::NotWaiting);
        }
        let body = Message::from_plaintext_bytes(frame)?.body;
        match stage {
            Stage::ReqPq(s1) => {
                let res_pq = enums::ResPq::from_bytes(&body)?;
                let (req, s2) = authentication::step2(s1, res_pq, &self.keys)?;
                self.stage = Stage::ReqDhParams(s2);
                log::debug!("[mtp] handshake: sending req_DH_params");
                Ok(Progress::Send(self.frame(&req)))
            }
            Stage::ReqDhParams(s2) => {
                let params = enums::ServerDhParams::from_bytes(&body)?;
                let (req, s3) = authentication::step3(s2, params)?;
                self.stage = Stage::SetClientDhParams(s3);
                log::debug!("[mtp] handshake: sending set_client_DH_params");
                Ok(Progress::Send(self.frame(&req)))
            }
            Stage::SetClientDhParams(s3) => {
                let answer = enums::SetClientDhParamsAnswer::from_bytes(&body)?;
                match authentication::finish(&s3, answer) {
                    Ok(done) => {
                        self.stage = Stage::Complete;
                        log::info!("[mtp] handshake complete (time offset {}s)", done.time_offset);
                        Ok(Progress::Done(done))
                    }
                    Err(Error::DhGenRetry { retry_id }) => {
                        self.retries += 1;
                        if self.retries > MAX_DH_RETRIES {
                            return Err(HandshakeError::TooManyRetries);
                        }
                        log::debug!("[mtp] handshake: dh_gen_retry #{}", self.retries);
                        let (req, s3) = authentication::retry(s3, retry_id)?;
                        self.stage = Stage::SetClientDhParams(s3);
                        Ok(Progress::Send(self.frame(&req)))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Stage::Idle | Stage::Complete | Stage::Failed => Err(HandshakeError::NotWaiting),
        }
    }

    fn frame(&mut self, call: &impl Serializable) -> Vec<u8> {
        Message::plaintext(self.clock.next(), call.to_bytes()).to_plaintext_bytes()
    }
}
