//! The session engine: request bookkeeping for one encrypted connection.
//!
//! [`Engine`] is sans-IO. The owner feeds it decrypted-to-be packets with
//! [`Engine::handle_packet`], calls [`Engine::tick`] when
//! [`Engine::next_deadline`] passes, sends whatever [`Engine::flush`]
//! returns, and drains [`Event`]s with [`Engine::poll_event`]. Every timer
//! runs on the `Instant` the caller passes in.
//!
//! Requests are identified by a caller-chosen [`RequestId`] that stays the
//! same across resends, session resets and key changes; the wire `msg_id`
//! behind it changes every time it is sent.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::io::Read;
use std::time::{Duration, Instant};

use mtp_crypto::AuthKey;
use mtp_tl_types::{
    Cursor, Deserializable, Identifiable, RawVec, Serializable, constructor_id, enums, functions, types,
};

use crate::encrypted::{DecryptError, EncryptedSession};
use crate::message::{MsgIdClock, is_server_msg_id, msg_id_time};

/// Most messages one container may carry.
const MAX_CONTAINER_MESSAGES: usize = 1020;

/// Most ids collected before acks are sent regardless of the ack delay.
const MAX_PENDING_ACKS: usize = 1024;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Timing and sizing knobs for [`Engine`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long a sent request may go unacknowledged before it is resent.
    pub resend_window: Duration,
    /// Resends allowed before a request fails with
    /// [`EngineError::RetryExhausted`].
    pub max_retries: u32,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// `disconnect_delay` passed with `ping_delay_disconnect`, seconds.
    pub ping_disconnect_delay: i32,
    /// A pong missing for this long asks for a transport restart.
    pub pong_timeout: Duration,
    /// Longest time an ack may wait for something to ride along with.
    pub ack_delay: Duration,
    /// How long a sent container is remembered for ack expansion.
    pub container_ttl: Duration,
    /// Soft cap on the bytes packed into one container.
    pub max_container_bytes: usize,
    /// How many received message ids are remembered for deduplication.
    pub received_ids_limit: usize,
    /// `http_wait` parameters: `(max_delay, wait_after, max_wait)`, ms.
    pub http_wait: (i32, i32, i32),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resend_window: Duration::from_secs(10),
            max_retries: 5,
            ping_interval: Duration::from_secs(30),
            ping_disconnect_delay: 75,
            pong_timeout: Duration::from_secs(45),
            ack_delay: Duration::from_secs(10),
            container_ttl: Duration::from_secs(600),
            max_container_bytes: 16 * 1024,
            received_ids_limit: 400,
            http_wait: (100, 30, 25_000),
        }
    }
}

// ─── Public types ────────────────────────────────────────────────────────────

/// Caller-visible identity of a submitted request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An opaque serialized call plus how the engine should track it.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    body: Vec<u8>,
    needs_ack: bool,
    expects_response: bool,
}

impl Request {
    /// A content-related call that expects an answer.
    pub fn new(body: Vec<u8>) -> Self {
        Self { body, needs_ack: true, expects_response: true }
    }

    /// Whether the server must acknowledge the message (odd `seq_no`).
    pub fn needs_ack(mut self, value: bool) -> Self {
        self.needs_ack = value;
        self
    }

    /// Whether an `rpc_result` is expected. Requests that expect none are
    /// finished by their ack.
    pub fn expects_response(mut self, value: bool) -> Self {
        self.expects_response = value;
        self
    }

    /// The serialized call.
    pub fn body(&self) -> &[u8] { &self.body }
}

/// Errors reported by the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineError {
    /// No auth key is installed.
    NoKey,
    /// The packet could not be decrypted for this session.
    Decrypt(DecryptError),
    /// A message body did not parse.
    Malformed(mtp_tl_types::deserialize::Error),
    /// A `gzip_packed` body did not inflate.
    Gzip,
    /// An inner message id had client parity.
    BadMsgId { msg_id: i64 },
    /// The request went unacknowledged through every resend.
    RetryExhausted { attempts: u32 },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoKey => write!(f, "no auth key installed"),
            Self::Decrypt(e) => write!(f, "decrypt: {e}"),
            Self::Malformed(e) => write!(f, "malformed message: {e}"),
            Self::Gzip => write!(f, "gzip_packed body did not inflate"),
            Self::BadMsgId { msg_id } => write!(f, "bad inner msg_id {msg_id:#x}"),
            Self::RetryExhausted { attempts } => write!(f, "no ack after {attempts} attempts"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<DecryptError> for EngineError {
    fn from(e: DecryptError) -> Self { Self::Decrypt(e) }
}

impl From<mtp_tl_types::deserialize::Error> for EngineError {
    fn from(e: mtp_tl_types::deserialize::Error) -> Self { Self::Malformed(e) }
}

/// Why the engine wants the transport reconnected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartReason {
    /// No pong in time.
    PingTimeout,
    /// A `bad_msg_notification` with a code that cannot be fixed locally.
    BadMsg { code: i32 },
    /// The packet belonged to another key or session.
    Desync,
}

/// Something the owner of the engine must act on.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The answer to a request, verbatim (an `rpc_error` included).
    Response { id: RequestId, body: Vec<u8> },
    /// The request will not be answered.
    Failed { id: RequestId, error: EngineError },
    /// A request that expects no answer was acknowledged.
    Delivered { id: RequestId },
    /// An unsolicited message.
    Update { body: Vec<u8> },
    /// Reconnect the transport; the key stays.
    Restart(RestartReason),
}

// ─── Internal state ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
enum Status {
    Queued,
    Sent { msg_id: i64, at: Instant },
    Acked { msg_id: i64, polled: Instant },
}

struct Pending {
    request: Request,
    status: Status,
    msg_ids: Vec<i64>,
    attempts: u32,
}

impl Pending {
    fn current_msg_id(&self) -> Option<i64> {
        match self.status {
            Status::Queued => None,
            Status::Sent { msg_id, .. } | Status::Acked { msg_id, .. } => Some(msg_id),
        }
    }
}

struct Ping {
    ping_id: i64,
    msg_id: Option<i64>,
    sent_at: Option<Instant>,
}

/// Facts about the packet currently being handled.
struct Inbound {
    msg_id: i64,
    salt: i64,
    bad_time: bool,
}

/// Messages gathered for one flush.
#[derive(Default)]
struct Batch {
    messages: Vec<types::Message>,
    bytes: usize,
    resend: bool,
}

impl Batch {
    fn push(
        &mut self,
        clock: &mut MsgIdClock,
        session: &mut EncryptedSession,
        body: Vec<u8>,
        content_related: bool,
    ) -> i64 {
        let msg_id = clock.next();
        let seqno = session.next_seq_no(content_related);
        self.bytes += types::Message::HEADER_LEN + body.len();
        self.messages.push(types::Message { msg_id, seqno, body });
        msg_id
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Session bookkeeping for one connection.
pub struct Engine {
    config: EngineConfig,
    clock: MsgIdClock,
    session: Option<EncryptedSession>,
    key_checked: bool,
    http: bool,
    long_poll: bool,

    requests: BTreeMap<RequestId, Pending>,
    by_msg_id: HashMap<i64, RequestId>,
    containers: HashMap<i64, (Vec<i64>, Instant)>,
    state_reqs: HashMap<i64, (Vec<i64>, Instant)>,
    force_container: bool,
    poll_state: bool,

    received: BTreeMap<i64, bool>,
    were_acked: BTreeSet<i64>,
    acks: Vec<i64>,
    acks_since: Option<Instant>,
    service: Vec<(Vec<u8>, bool)>,
    resend_reqs: Vec<i64>,

    ping: Option<Ping>,
    ping_timer: Option<Instant>,
    next_ping_id: i64,

    events: VecDeque<Event>,
}

impl Engine {
    /// An engine with no key; requests queue until one is installed.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: MsgIdClock::new(),
            session: None,
            key_checked: false,
            http: false,
            long_poll: false,
            requests: BTreeMap::new(),
            by_msg_id: HashMap::new(),
            containers: HashMap::new(),
            state_reqs: HashMap::new(),
            force_container: false,
            poll_state: false,
            received: BTreeMap::new(),
            were_acked: BTreeSet::new(),
            acks: Vec::new(),
            acks_since: None,
            service: Vec::new(),
            resend_reqs: Vec::new(),
            ping: None,
            ping_timer: None,
            next_ping_id: i64::from_le_bytes(mtp_crypto::random_array()) & i64::MAX,
            events: VecDeque::new(),
        }
    }

    // ── Key and session ──────────────────────────────────────────────────────

    /// Start encrypting with `key`. Requests already on the wire are
    /// queued again under the new session.
    pub fn install_key(&mut self, key: AuthKey, salt: i64) {
        log::info!("[mtp] using auth key {:016x}", key.id());
        self.session = Some(EncryptedSession::new(key, salt));
        self.key_checked = false;
        self.on_new_session();
    }

    /// Forget the key. Nothing is sent until another is installed.
    pub fn drop_key(&mut self) -> Option<AuthKey> {
        let old = self.session.take().map(|s| s.auth_key().clone());
        self.key_checked = false;
        self.on_new_session();
        old
    }

    /// Whether a key is installed.
    pub fn has_key(&self) -> bool { self.session.is_some() }

    /// The installed key.
    pub fn auth_key(&self) -> Option<&AuthKey> {
        self.session.as_ref().map(EncryptedSession::auth_key)
    }

    /// Whether the installed key has decrypted at least one server packet.
    pub fn key_checked(&self) -> bool { self.key_checked }

    /// Treat the key as unconfirmed again until a server packet decrypts
    /// under it.
    pub fn uncheck_key(&mut self) {
        self.key_checked = false;
    }

    /// Current session id, if a key is installed.
    pub fn session_id(&self) -> Option<i64> {
        self.session.as_ref().map(EncryptedSession::session_id)
    }

    /// Current server salt, if a key is installed.
    pub fn salt(&self) -> Option<i64> {
        self.session.as_ref().map(|s| s.salt)
    }

    /// Start a new session on the same key and resend everything in flight.
    pub fn reset_session(&mut self) {
        if let Some(session) = &mut self.session {
            session.reset();
        }
        self.on_new_session();
    }

    /// Queue every request already on the wire again.
    pub fn resend_all(&mut self) {
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for id in ids {
            self.requeue(id);
        }
    }

    /// Seconds added to local time to approximate server time.
    pub fn time_offset(&self) -> i32 { self.clock.time_offset() }

    /// Replace the server time correction.
    pub fn set_time_offset(&mut self, offset: i32) {
        self.clock.set_time_offset(offset);
    }

    /// Switch between TCP-style and HTTP-style keepalive.
    pub fn set_http_mode(&mut self, http: bool) {
        self.http = http;
    }

    /// In HTTP mode, make the next flush carry an `http_wait` even when
    /// nothing else is queued.
    pub fn request_long_poll(&mut self) {
        if self.http {
            self.long_poll = true;
        }
    }

    fn on_new_session(&mut self) {
        self.received.clear();
        self.were_acked.clear();
        self.acks.clear();
        self.acks_since = None;
        self.containers.clear();
        self.state_reqs.clear();
        self.service.clear();
        self.resend_reqs.clear();
        self.ping = None;
        self.ping_timer = None;
        self.poll_state = false;
        self.resend_all();
        self.force_container = false;
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Queue a request. Ids must be unique among live requests; reusing one
    /// replaces the old request.
    pub fn submit(&mut self, id: RequestId, request: Request) {
        if let Some(old) = self.requests.remove(&id) {
            self.forget_msg_ids(&old);
        }
        log::debug!("[mtp] queued request {id} ({} bytes)", request.body.len());
        self.requests.insert(id, Pending { request, status: Status::Queued, msg_ids: Vec::new(), attempts: 0 });
    }

    /// Stop tracking a request. A late answer is dropped. Returns whether
    /// the request was known.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        match self.requests.remove(&id) {
            Some(p) => {
                self.forget_msg_ids(&p);
                log::debug!("[mtp] cancelled request {id}");
                true
            }
            None => false,
        }
    }

    /// Number of requests not yet answered, failed or cancelled.
    pub fn pending(&self) -> usize { self.requests.len() }

    /// Whether something sent is still waiting for an ack or answer.
    pub fn awaiting_answer(&self) -> bool {
        self.ping.as_ref().is_some_and(|p| p.sent_at.is_some())
            || self.requests.values().any(|p| !matches!(p.status, Status::Queued))
    }

    /// Next event to act on.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn complete(&mut self, id: RequestId) -> Option<Pending> {
        let p = self.requests.remove(&id)?;
        self.forget_msg_ids(&p);
        Some(p)
    }

    fn forget_msg_ids(&mut self, p: &Pending) {
        for msg_id in &p.msg_ids {
            self.by_msg_id.remove(msg_id);
        }
    }

    fn requeue(&mut self, id: RequestId) {
        if let Some(p) = self.requests.get_mut(&id) {
            if !matches!(p.status, Status::Queued) {
                p.status = Status::Queued;
                self.force_container = true;
            }
        }
    }

    // ── Outgoing ─────────────────────────────────────────────────────────────

    /// Build at most one encrypted packet from everything that is due.
    ///
    /// Returns `None` when there is nothing to send or no key.
    pub fn flush(&mut self, now: Instant) -> Option<Vec<u8>> {
        let session = self.session.as_mut()?;
        self.ping_timer.get_or_insert(now);

        let queued: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, p)| matches!(p.status, Status::Queued))
            .map(|(id, _)| *id)
            .collect();
        let ping_due = self.ping.as_ref().is_some_and(|p| p.msg_id.is_none());
        let has_payload = !queued.is_empty()
            || !self.service.is_empty()
            || !self.resend_reqs.is_empty()
            || self.poll_state
            || ping_due
            || self.long_poll;
        let acks_due = !self.acks.is_empty()
            && (has_payload
                || self.acks.len() >= MAX_PENDING_ACKS
                || self.acks_since.is_some_and(|t| now >= t + self.config.ack_delay));
        if !has_payload && !acks_due {
            return None;
        }

        let mut batch = Batch::default();
        let clock = &mut self.clock;

        if acks_due {
            let msg_ids = std::mem::take(&mut self.acks);
            self.acks_since = None;
            batch.push(clock, session, types::MsgsAck { msg_ids }.to_bytes(), false);
        }
        for (body, content_related) in std::mem::take(&mut self.service) {
            batch.push(clock, session, body, content_related);
        }
        if !self.resend_reqs.is_empty() {
            let msg_ids = std::mem::take(&mut self.resend_reqs);
            batch.push(clock, session, types::MsgResendReq { msg_ids }.to_bytes(), false);
        }
        if std::mem::take(&mut self.poll_state) {
            let window = self.config.resend_window;
            let mut ids = Vec::new();
            for p in self.requests.values_mut() {
                if let Status::Acked { msg_id, polled } = &mut p.status {
                    if now >= *polled + window {
                        ids.push(*msg_id);
                        *polled = now;
                    }
                }
            }
            if !ids.is_empty() {
                let msg_id = batch.push(clock, session, types::MsgsStateReq { msg_ids: ids.clone() }.to_bytes(), true);
                self.state_reqs.insert(msg_id, (ids, now));
            }
        }
        if let Some(ping) = self.ping.as_mut().filter(|p| p.msg_id.is_none()) {
            let body = if self.http {
                functions::Ping { ping_id: ping.ping_id }.to_bytes()
            } else {
                functions::PingDelayDisconnect {
                    ping_id: ping.ping_id,
                    disconnect_delay: self.config.ping_disconnect_delay,
                }
                .to_bytes()
            };
            ping.msg_id = Some(batch.push(clock, session, body, true));
            ping.sent_at = Some(now);
        }

        let mut sent_requests = 0;
        for id in queued {
            let Some(p) = self.requests.get_mut(&id) else { continue };
            let size = types::Message::HEADER_LEN + p.request.body.len();
            if sent_requests > 0
                && (batch.bytes + size > self.config.max_container_bytes
                    || batch.messages.len() + 2 > MAX_CONTAINER_MESSAGES)
            {
                break;
            }
            let msg_id = batch.push(clock, session, p.request.body.clone(), p.request.needs_ack);
            batch.resend |= p.attempts > 0 || !p.msg_ids.is_empty();
            p.msg_ids.push(msg_id);
            p.status = if p.request.needs_ack {
                Status::Sent { msg_id, at: now }
            } else {
                Status::Acked { msg_id, polled: now }
            };
            self.by_msg_id.insert(msg_id, id);
            sent_requests += 1;
        }

        if self.http && (sent_requests > 0 || self.long_poll) {
            let (max_delay, wait_after, max_wait) = self.config.http_wait;
            let wait = functions::HttpWait { max_delay, wait_after, max_wait };
            batch.push(clock, session, wait.to_bytes(), false);
        }
        self.long_poll = false;

        let force = std::mem::take(&mut self.force_container) && batch.resend;
        let packet = if batch.messages.len() == 1 && !force {
            let m = &batch.messages[0];
            log::debug!("[mtp] sending msg {:#x} ({} bytes)", m.msg_id, m.body.len());
            session.pack(m.msg_id, m.seqno, &m.body)
        } else {
            let inner: Vec<i64> = batch.messages.iter().map(|m| m.msg_id).collect();
            let container_id = clock.next();
            let seqno = session.next_seq_no(false);
            let body = types::MsgContainer { messages: RawVec(batch.messages) }.to_bytes();
            log::debug!("[mtp] sending container {container_id:#x} with {} messages", inner.len());
            self.containers.insert(container_id, (inner, now));
            session.pack(container_id, seqno, &body)
        };

        // Requests that need no ack are done once they are on the wire.
        let delivered: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, p)| !p.request.needs_ack && !p.request.expects_response)
            .filter(|(_, p)| matches!(p.status, Status::Acked { .. }))
            .map(|(id, _)| *id)
            .collect();
        for id in delivered {
            self.complete(id);
            self.events.push_back(Event::Delivered { id });
        }

        Some(packet)
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let window = self.config.resend_window;
        let requests = self.requests.values().filter_map(|p| match p.status {
            Status::Queued => None,
            Status::Sent { at, .. } => Some(at + window),
            Status::Acked { polled, .. } if p.request.expects_response => Some(polled + window),
            Status::Acked { .. } => None,
        });
        let acks = self.acks_since.map(|t| t + self.config.ack_delay);
        let ping = match &self.ping {
            Some(Ping { sent_at: Some(t), .. }) => Some(*t + self.config.pong_timeout),
            Some(_) => self.ping_timer,
            None if self.session.is_some() => self.ping_timer.map(|t| t + self.config.ping_interval),
            None => None,
        };
        requests.chain(acks).chain(ping).min()
    }

    /// Run the timers: resend or fail stale requests, schedule state polls
    /// and pings, expire old containers.
    pub fn tick(&mut self, now: Instant) {
        let window = self.config.resend_window;
        let mut stale = Vec::new();
        for (id, p) in &mut self.requests {
            match p.status {
                Status::Sent { at, .. } if now >= at + window => stale.push(*id),
                Status::Acked { polled, .. } if p.request.expects_response && now >= polled + window => {
                    self.poll_state = true;
                }
                _ => {}
            }
        }
        for id in stale {
            let Some(p) = self.requests.get_mut(&id) else { continue };
            if p.attempts >= self.config.max_retries {
                let attempts = p.attempts + 1;
                log::warn!("[mtp] request {id} unacknowledged after {attempts} attempts");
                self.complete(id);
                self.events.push_back(Event::Failed { id, error: EngineError::RetryExhausted { attempts } });
            } else {
                p.attempts += 1;
                log::debug!("[mtp] resending request {id} (attempt {})", p.attempts + 1);
                self.requeue(id);
            }
        }

        let ttl = self.config.container_ttl;
        self.containers.retain(|_, (_, at)| now < *at + ttl);
        self.state_reqs.retain(|_, (_, at)| now < *at + ttl);

        match &self.ping {
            Some(Ping { sent_at: Some(t), .. }) if now >= *t + self.config.pong_timeout => {
                log::warn!("[mtp] no pong for {:?}", self.config.pong_timeout);
                self.ping = None;
                self.ping_timer = Some(now);
                self.events.push_back(Event::Restart(RestartReason::PingTimeout));
            }
            None if self.session.is_some()
                && self.ping_timer.is_some_and(|t| now >= t + self.config.ping_interval) =>
            {
                self.next_ping_id = self.next_ping_id.wrapping_add(1);
                self.ping = Some(Ping { ping_id: self.next_ping_id, msg_id: None, sent_at: None });
            }
            _ => {}
        }
    }

    // ── Incoming ─────────────────────────────────────────────────────────────

    /// Decrypt and process one packet from the transport.
    pub fn handle_packet(&mut self, packet: &[u8], now: Instant) -> Result<(), EngineError> {
        let session = self.session.as_mut().ok_or(EngineError::NoKey)?;
        let msg = match session.unpack(packet) {
            Ok(msg) => msg,
            Err(e) => {
                if matches!(
                    e,
                    DecryptError::SessionMismatch { .. }
                        | DecryptError::Crypto(mtp_crypto::DecryptError::AuthKeyMismatch)
                ) {
                    self.events.push_back(Event::Restart(RestartReason::Desync));
                }
                return Err(e.into());
            }
        };
        self.key_checked = true;

        let server_time = msg_id_time(msg.msg_id);
        let local = self.clock.server_now();
        let bad_time = server_time > local + 60 || server_time + 300 < local;
        if bad_time {
            log::debug!("[mtp] bad time: server {server_time}, local {local}");
        } else if msg.salt != session.salt {
            log::debug!("[mtp] server salt changed to {:#x}", msg.salt);
            session.salt = msg.salt;
        }

        let mut inbound = Inbound { msg_id: msg.msg_id, salt: msg.salt, bad_time };
        self.receive(msg.msg_id, msg.seq_no, &msg.body, &mut inbound, now)
    }

    fn receive(
        &mut self,
        msg_id: i64,
        seq_no: i32,
        body: &[u8],
        inbound: &mut Inbound,
        now: Instant,
    ) -> Result<(), EngineError> {
        let needs_ack = seq_no & 1 == 1;
        if needs_ack {
            self.acks.push(msg_id);
            self.acks_since.get_or_insert(now);
        }
        if !self.note_received(msg_id, needs_ack) {
            log::debug!("[mtp] duplicate msg {msg_id:#x} ignored");
            return Ok(());
        }
        self.dispatch(msg_id, body, inbound, now)
    }

    fn note_received(&mut self, msg_id: i64, needs_ack: bool) -> bool {
        if self.received.contains_key(&msg_id) {
            return false;
        }
        if self.received.len() >= self.config.received_ids_limit
            && self.received.first_key_value().is_some_and(|(&min, _)| msg_id < min)
        {
            return false;
        }
        self.received.insert(msg_id, needs_ack);
        while self.received.len() > self.config.received_ids_limit {
            self.received.pop_first();
        }
        true
    }

    fn dispatch(&mut self, msg_id: i64, body: &[u8], inbound: &mut Inbound, now: Instant) -> Result<(), EngineError> {
        let id = constructor_id(body).ok_or(mtp_tl_types::deserialize::Error::UnexpectedEof)?;
        match id {
            types::GzipPacked::CONSTRUCTOR_ID => {
                let packed = types::GzipPacked::from_bytes(body)?;
                let data = gunzip(&packed.packed_data)?;
                self.dispatch(msg_id, &data, inbound, now)
            }
            types::MsgContainer::CONSTRUCTOR_ID => {
                let container = types::MsgContainer::from_bytes(body)?;
                for m in container.messages.0 {
                    if !is_server_msg_id(m.msg_id) {
                        return Err(EngineError::BadMsgId { msg_id: m.msg_id });
                    }
                    self.receive(m.msg_id, m.seqno, &m.body, inbound, now)?;
                }
                Ok(())
            }
            types::MsgsAck::CONSTRUCTOR_ID => {
                let ack = types::MsgsAck::from_bytes(body)?;
                if inbound.bad_time && !self.fix_time_salt(&ack.msg_ids, inbound) {
                    return Ok(());
                }
                self.requests_acked(&ack.msg_ids, now);
                Ok(())
            }
            types::BadMsgNotification::CONSTRUCTOR_ID | types::BadServerSalt::CONSTRUCTOR_ID => {
                let notification = enums::BadMsgNotification::from_bytes(body)?;
                self.handle_bad_msg(notification, inbound);
                Ok(())
            }
            types::MsgsStateReq::CONSTRUCTOR_ID => {
                if inbound.bad_time {
                    return Ok(());
                }
                let req = types::MsgsStateReq::from_bytes(body)?;
                let info = self.states_of(&req.msg_ids);
                self.service.push((types::MsgsStateInfo { req_msg_id: msg_id, info }.to_bytes(), false));
                Ok(())
            }
            types::MsgsStateInfo::CONSTRUCTOR_ID => {
                let info = types::MsgsStateInfo::from_bytes(body)?;
                match self.state_reqs.remove(&info.req_msg_id) {
                    Some((ids, _)) => self.handle_states(&ids, &info.info, now),
                    None => log::debug!("[mtp] msgs_state_info for unknown {:#x}", info.req_msg_id),
                }
                Ok(())
            }
            types::MsgsAllInfo::CONSTRUCTOR_ID => {
                let info = types::MsgsAllInfo::from_bytes(body)?;
                self.handle_states(&info.msg_ids, &info.info, now);
                Ok(())
            }
            types::MsgDetailedInfo::CONSTRUCTOR_ID | types::MsgNewDetailedInfo::CONSTRUCTOR_ID => {
                let answer_msg_id = match enums::MsgDetailedInfo::from_bytes(body)? {
                    enums::MsgDetailedInfo::MsgDetailedInfo(info) => {
                        self.requests_acked(&[info.msg_id], now);
                        info.answer_msg_id
                    }
                    enums::MsgDetailedInfo::MsgNewDetailedInfo(info) => info.answer_msg_id,
                };
                if self.received.contains_key(&answer_msg_id) {
                    self.acks.push(answer_msg_id);
                    self.acks_since.get_or_insert(now);
                } else {
                    self.resend_reqs.push(answer_msg_id);
                }
                Ok(())
            }
            types::MsgResendReq::CONSTRUCTOR_ID => {
                let req = types::MsgResendReq::from_bytes(body)?;
                for id in req.msg_ids {
                    self.resend(id);
                }
                Ok(())
            }
            types::RpcResult::CONSTRUCTOR_ID => {
                let result = types::RpcResult::from_bytes(body)?;
                self.requests_acked(&[result.req_msg_id], now);
                let mut payload = result.result.0;
                if constructor_id(&payload) == Some(types::GzipPacked::CONSTRUCTOR_ID) {
                    payload = gunzip(&types::GzipPacked::from_bytes(&payload)?.packed_data)?;
                }
                match self.by_msg_id.get(&result.req_msg_id).copied() {
                    Some(id) if self.complete(id).is_some() => {
                        log::debug!("[mtp] response for request {id}");
                        self.events.push_back(Event::Response { id, body: payload });
                    }
                    _ => log::debug!("[mtp] dropping result for unknown msg {:#x}", result.req_msg_id),
                }
                Ok(())
            }
            types::NewSessionCreated::CONSTRUCTOR_ID => {
                let created = types::NewSessionCreated::from_bytes(body)?;
                if let Some(session) = &mut self.session {
                    session.salt = created.server_salt;
                }
                let older: Vec<RequestId> = self
                    .requests
                    .iter()
                    .filter(|(_, p)| p.current_msg_id().is_some_and(|m| m < created.first_msg_id))
                    .map(|(id, _)| *id)
                    .collect();
                log::info!("[mtp] new session created; resending {} requests", older.len());
                for id in older {
                    self.requeue(id);
                }
                self.events.push_back(Event::Update { body: body.to_vec() });
                Ok(())
            }
            functions::Ping::CONSTRUCTOR_ID | functions::PingDelayDisconnect::CONSTRUCTOR_ID => {
                let mut cur = Cursor::from_slice(body);
                cur.skip(4)?;
                let ping_id = i64::deserialize(&mut cur)?;
                self.service.push((types::Pong { msg_id, ping_id }.to_bytes(), false));
                Ok(())
            }
            types::Pong::CONSTRUCTOR_ID => {
                let pong = types::Pong::from_bytes(body)?;
                if self.ping.as_ref().and_then(|p| p.msg_id) == Some(pong.msg_id) {
                    self.ping = None;
                    self.ping_timer = Some(now);
                }
                self.requests_acked(&[pong.msg_id], now);
                Ok(())
            }
            _ => {
                if inbound.bad_time {
                    log::debug!("[mtp] dropping update {id:#010x} received with bad time");
                } else {
                    self.events.push_back(Event::Update { body: body.to_vec() });
                }
                Ok(())
            }
        }
    }

    fn handle_bad_msg(&mut self, notification: enums::BadMsgNotification, inbound: &mut Inbound) {
        match notification {
            enums::BadMsgNotification::BadServerSalt(n) => {
                if !self.was_sent(n.bad_msg_id) {
                    log::warn!("[mtp] bad_server_salt for unknown msg {:#x}", n.bad_msg_id);
                    return;
                }
                log::debug!("[mtp] bad_server_salt, new salt {:#x}", n.new_server_salt);
                self.clock.sync_with_server(inbound.msg_id);
                inbound.bad_time = false;
                if let Some(session) = &mut self.session {
                    session.salt = n.new_server_salt;
                }
                self.resend(n.bad_msg_id);
            }
            enums::BadMsgNotification::BadMsgNotification(n) => match n.error_code {
                16 | 17 => {
                    if !self.was_sent(n.bad_msg_id) {
                        log::warn!("[mtp] bad_msg_notification for unknown msg {:#x}", n.bad_msg_id);
                        return;
                    }
                    log::debug!("[mtp] msg_id too {}, syncing time", if n.error_code == 16 { "low" } else { "high" });
                    self.fix_time_salt(&[n.bad_msg_id], inbound);
                    self.resend(n.bad_msg_id);
                }
                32 | 33 => {
                    log::warn!("[mtp] seq_no too {}, resetting session", if n.error_code == 32 { "low" } else { "high" });
                    self.reset_session();
                }
                20 | 64 => {
                    log::debug!("[mtp] bad_msg_notification {} for {:#x}, resending", n.error_code, n.bad_msg_id);
                    self.resend(n.bad_msg_id);
                }
                code => {
                    log::warn!("[mtp] bad_msg_notification {code} for {:#x}, restarting", n.bad_msg_id);
                    self.events.push_back(Event::Restart(RestartReason::BadMsg { code }));
                }
            },
        }
    }

    /// Adopt the server's time and salt when the packet refers to a message
    /// we sent. Returns whether it did.
    fn fix_time_salt(&mut self, msg_ids: &[i64], inbound: &mut Inbound) -> bool {
        if !msg_ids.iter().any(|id| self.was_sent(*id)) {
            return false;
        }
        self.clock.sync_with_server(inbound.msg_id);
        if let Some(session) = &mut self.session {
            session.salt = inbound.salt;
        }
        inbound.bad_time = false;
        true
    }

    fn was_sent(&self, msg_id: i64) -> bool {
        self.by_msg_id.contains_key(&msg_id)
            || self.containers.contains_key(&msg_id)
            || self.state_reqs.contains_key(&msg_id)
            || self.ping.as_ref().and_then(|p| p.msg_id) == Some(msg_id)
    }

    /// Resend whatever was carried by `msg_id`, under a new id.
    fn resend(&mut self, msg_id: i64) {
        if let Some((inner, _)) = self.containers.remove(&msg_id) {
            for id in inner {
                self.resend(id);
            }
            return;
        }
        if let Some(ping) = self.ping.as_mut().filter(|p| p.msg_id == Some(msg_id)) {
            ping.msg_id = None;
            ping.sent_at = None;
            return;
        }
        if self.state_reqs.remove(&msg_id).is_some() {
            self.poll_state = true;
            return;
        }
        if let Some(&id) = self.by_msg_id.get(&msg_id) {
            let current = self.requests.get(&id).and_then(Pending::current_msg_id);
            if current == Some(msg_id) {
                self.requeue(id);
            }
        }
    }

    fn requests_acked(&mut self, msg_ids: &[i64], now: Instant) {
        for &msg_id in msg_ids {
            if let Some((inner, _)) = self.containers.remove(&msg_id) {
                self.requests_acked(&inner, now);
                continue;
            }
            self.were_acked.insert(msg_id);
            while self.were_acked.len() > self.config.received_ids_limit {
                self.were_acked.pop_first();
            }
            let Some(&id) = self.by_msg_id.get(&msg_id) else { continue };
            let Some(p) = self.requests.get_mut(&id) else { continue };
            if matches!(p.status, Status::Acked { .. }) {
                continue;
            }
            if p.request.expects_response {
                p.status = Status::Acked { msg_id, polled: now };
            } else {
                self.complete(id);
                self.events.push_back(Event::Delivered { id });
            }
        }
    }

    /// State bytes for a `msgs_state_req` about messages we received.
    fn states_of(&self, msg_ids: &[i64]) -> Vec<u8> {
        let min = self.received.first_key_value().map(|(&k, _)| k);
        let max = self.received.last_key_value().map(|(&k, _)| k);
        msg_ids
            .iter()
            .map(|id| match self.received.get(id) {
                Some(&needed_ack) => {
                    let mut state = 0x04;
                    state |= if needed_ack { 0x08 } else { 0x10 };
                    if self.were_acked.contains(id) {
                        state |= 0x80;
                    }
                    state
                }
                None => match (min, max) {
                    (Some(min), _) if *id < min => 0x01,
                    (_, Some(max)) if *id > max => 0x03,
                    (Some(_), Some(_)) => 0x02,
                    _ => 0x01,
                },
            })
            .collect()
    }

    /// Act on the server's view of messages we sent.
    fn handle_states(&mut self, msg_ids: &[i64], states: &[u8], now: Instant) {
        let mut acked = Vec::new();
        for (&id, &state) in msg_ids.iter().zip(states) {
            if state & 0x07 == 0x04 {
                acked.push(id);
            } else {
                self.resend(id);
            }
        }
        self.requests_acked(&acked, now);
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| EngineError::Gzip)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_key_means_nothing_is_sent() {
        let mut engine = Engine::new(EngineConfig::default());
        engine.submit(RequestId(1), Request::new(vec![1, 2, 3, 4]));
        assert!(engine.flush(Instant::now()).is_none());
        assert_eq!(engine.pending(), 1);
        assert_eq!(engine.handle_packet(&[0; 64], Instant::now()), Err(EngineError::NoKey));
    }

    #[test]
    fn cancel_forgets_request() {
        let mut engine = Engine::new(EngineConfig::default());
        engine.submit(RequestId(7), Request::new(vec![0; 4]));
        assert!(engine.cancel(RequestId(7)));
        assert!(!engine.cancel(RequestId(7)));
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn state_bytes_describe_received_ids() {
        let mut engine = Engine::new(EngineConfig::default());
        engine.note_received(0x105, true);
        engine.note_received(0x109, false);
        assert_eq!(engine.states_of(&[0x101, 0x105, 0x107, 0x109, 0x201]), [0x01, 0x0c, 0x02, 0x14, 0x03]);
    }

    #[test]
    fn received_ids_are_bounded() {
        let mut engine = Engine::new(EngineConfig { received_ids_limit: 2, ..Default::default() });
        assert!(engine.note_received(5, true));
        assert!(engine.note_received(9, true));
        assert!(!engine.note_received(9, true));
        assert!(engine.note_received(13, true));
        // 5 was evicted and is now older than everything remembered.
        assert!(!engine.note_received(5, true));
        assert_eq!(engine.received.len(), 2);
    }

    #[test]
    fn deadline_follows_resend_window() {
        let mut engine = Engine::new(EngineConfig::default());
        engine.install_key(AuthKey::from_bytes([3; 256]), 1);
        let t0 = Instant::now();
        engine.submit(RequestId(1), Request::new(vec![0; 4]));
        engine.flush(t0).unwrap();
        assert_eq!(engine.next_deadline(), Some(t0 + Duration::from_secs(10)));
    }
}
