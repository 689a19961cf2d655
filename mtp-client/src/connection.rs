//! The per-DC connection task.
//!
//! One task owns one [`Engine`] and drives it over whatever [`Link`] the
//! connector hands out: connect, exchange a key if there is none, then
//! shuttle packets until the link dies, then back off and start over.
//! Requests live in the engine, so they survive reconnects and key changes
//! under the same [`RequestId`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mtp_crypto::AuthKey;
use mtp_crypto::rsa::PublicKey;
use mtp_proto::handshake::{Handshake, HandshakeError, Progress};
use mtp_proto::authentication::Finished;
use mtp_proto::{Engine, EngineConfig, Event, Request, RequestId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::errors::{Disconnect, Error, TransportError};
use crate::key_store::KeyStore;
use crate::retry::{ReconnectContext, ReconnectPolicy};
use crate::transport::{Connector, Link, TransportEvent, TransportKind};
use crate::watchdog::Watchdog;

/// Key id a DC reports while its key is being recreated: the old key was
/// dropped on a bad-key hint and the exchange for a new one has not
/// finished.
pub const RECREATE_KEY_ID: u64 = u64::MAX;

/// What callers see of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// Dialing, or exchanging a key.
    Connecting,
    /// Requests are flowing.
    Connected,
    /// Waiting this long before dialing again.
    WaitingRetry(Duration),
}

/// An unsolicited payload pushed by a DC.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub dc_id: i32,
    pub body:  Vec<u8>,
}

pub(crate) type Reply = oneshot::Sender<Result<Vec<u8>, Error>>;

pub(crate) enum Command {
    Submit { id: RequestId, request: Request, reply: Reply },
    Cancel(RequestId),
}

/// Everything the connection tasks of one manager share.
pub(crate) struct Shared {
    pub connector:          Arc<dyn Connector>,
    pub key_store:          Arc<dyn KeyStore>,
    pub reconnect:          Arc<dyn ReconnectPolicy>,
    pub rsa_keys:           Vec<PublicKey>,
    pub engine:             EngineConfig,
    pub handshake_attempts: u32,
    pub handshake_timeout:  Duration,
    pub updates:            broadcast::Sender<Update>,
    pub token:              CancellationToken,
}

/// Why [`Connection`] stopped serving a link.
enum Stop {
    Shutdown,
    Lost(Disconnect),
}

impl From<Disconnect> for Stop {
    fn from(d: Disconnect) -> Self { Self::Lost(d) }
}

impl From<TransportError> for Stop {
    fn from(e: TransportError) -> Self { Self::Lost(e.into()) }
}

pub(crate) struct Connection {
    dc_id:      i32,
    addr:       String,
    shared:     Arc<Shared>,
    engine:     Engine,
    commands:   mpsc::Receiver<Command>,
    replies:    HashMap<RequestId, Reply>,
    state:      watch::Sender<ConnectionState>,
    key_id:     watch::Sender<Option<u64>>,
    watchdog:   Watchdog,
    fail_count: u32,
}

impl Connection {
    pub(crate) fn new(
        dc_id: i32,
        addr: String,
        shared: Arc<Shared>,
        commands: mpsc::Receiver<Command>,
        state: watch::Sender<ConnectionState>,
        key_id: watch::Sender<Option<u64>>,
    ) -> Self {
        let mut engine = Engine::new(shared.engine.clone());
        match shared.key_store.get(dc_id) {
            Ok(Some(key)) => {
                tracing::debug!("[mtp] DC{dc_id}: loaded auth key {:016x} from {}", key.id(), shared.key_store.name());
                key_id.send_replace(Some(key.id()));
                engine.install_key(key, 0);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("[mtp] DC{dc_id}: reading {} key store failed: {e}", shared.key_store.name()),
        }
        Self {
            dc_id,
            addr,
            shared,
            engine,
            commands,
            replies: HashMap::new(),
            state,
            key_id,
            watchdog: Watchdog::new(),
            fail_count: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!("[mtp] DC{} connection task started ({})", self.dc_id, self.addr);
        loop {
            let lost = match self.serve().await {
                Stop::Shutdown => break,
                Stop::Lost(lost) => lost,
            };
            if !self.recover(lost).await {
                break;
            }
        }
        self.fail_all(|| Error::Dropped);
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!("[mtp] DC{} connection task stopped", self.dc_id);
    }

    // ── One link ─────────────────────────────────────────────────────────────

    async fn serve(&mut self) -> Stop {
        self.state.send_replace(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = self.shared.token.cancelled() => return Stop::Shutdown,
            res = self.shared.connector.connect(self.dc_id, &self.addr) => res,
        };
        let mut link = match connected {
            Ok(link) => link,
            Err(e) => return e.into(),
        };
        tracing::info!("[mtp] DC{}: {}", self.dc_id, link.debug_state());
        self.watchdog.disarm();

        if !self.engine.has_key() {
            if let Err(stop) = self.handshake(&mut link).await {
                return stop;
            }
        }
        match self.pump(&mut link).await {
            Ok(never) => match never {},
            Err(stop) => stop,
        }
    }

    async fn handshake(&mut self, link: &mut Link) -> Result<(), Stop> {
        let attempts = self.shared.handshake_attempts.max(1);
        let mut last = HandshakeError::NotWaiting;
        for attempt in 1..=attempts {
            tracing::debug!("[mtp] DC{}: auth key exchange, attempt {attempt}/{attempts}", self.dc_id);
            let mut hs = Handshake::new(self.shared.rsa_keys.clone());
            let mut frame = hs.start();
            let outcome = loop {
                link.send(frame).await?;
                let answer = self.recv_plain(link).await?;
                match hs.handle(&answer) {
                    Ok(Progress::Send(next)) => frame = next,
                    Ok(Progress::Done(done)) => break Ok(done),
                    Err(e) => break Err(e),
                }
            };
            match outcome {
                Ok(done) => {
                    self.adopt_key(done);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("[mtp] DC{}: auth key exchange attempt {attempt} failed: {e}", self.dc_id);
                    last = e;
                }
            }
        }
        tracing::warn!("[mtp] DC{}: giving up on auth key exchange after {attempts} attempts", self.dc_id);
        let err = Error::Handshake(last.clone());
        self.fail_all(|| err.clone());
        Err(Disconnect::Handshake(last).into())
    }

    /// Next handshake answer, serving commands while waiting.
    async fn recv_plain(&mut self, link: &mut Link) -> Result<Vec<u8>, Stop> {
        let timeout = tokio::time::sleep(self.shared.handshake_timeout);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => return Err(Stop::Shutdown),
                _ = &mut timeout => return Err(TransportError::Timeout.into()),
                cmd = self.commands.recv() => self.on_command(cmd)?,
                event = link.recv() => return match event {
                    Some(TransportEvent::Packet(packet)) => Ok(packet),
                    Some(TransportEvent::Error(e)) => Err(e.into()),
                    None => Err(TransportError::Closed.into()),
                },
            }
        }
    }

    fn adopt_key(&mut self, done: Finished) {
        let key = AuthKey::new(self.dc_id, done.auth_key);
        tracing::info!("[mtp] DC{}: new auth key {:016x}", self.dc_id, key.id());
        if let Err(e) = self.shared.key_store.set(self.dc_id, &key) {
            tracing::warn!("[mtp] DC{}: storing auth key failed: {e}", self.dc_id);
        }
        self.key_id.send_replace(Some(key.id()));
        self.engine.set_time_offset(done.time_offset);
        self.engine.install_key(key, done.first_salt);
    }

    async fn pump(&mut self, link: &mut Link) -> Result<Infallible, Stop> {
        self.engine.set_http_mode(link.kind() == TransportKind::Http);
        self.engine.resend_all();
        self.engine.request_long_poll();
        self.state.send_replace(ConnectionState::Connected);

        loop {
            self.flush(link).await?;
            self.dispatch_events()?;

            let deadline = match (self.engine.next_deadline(), self.watchdog.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let timer = deadline.map(tokio::time::Instant::from_std);

            tokio::select! {
                _ = self.shared.token.cancelled() => return Err(Stop::Shutdown),
                event = link.recv() => {
                    let now = Instant::now();
                    match event {
                        Some(TransportEvent::Packet(packet)) => {
                            self.watchdog.on_received(now);
                            match self.engine.handle_packet(&packet, now) {
                                Ok(()) => self.fail_count = 0,
                                Err(e) => tracing::warn!("[mtp] DC{}: dropped packet: {e}", self.dc_id),
                            }
                            if !self.engine.awaiting_answer() {
                                self.watchdog.disarm();
                            }
                            self.engine.request_long_poll();
                        }
                        Some(TransportEvent::Error(e)) => return Err(e.into()),
                        None => return Err(TransportError::Closed.into()),
                    }
                }
                cmd = self.commands.recv() => self.on_command(cmd)?,
                _ = tokio::time::sleep_until(timer.unwrap_or_else(tokio::time::Instant::now)), if timer.is_some() => {
                    let now = Instant::now();
                    if self.watchdog.expired(now) {
                        self.watchdog.on_failed();
                        return Err(Disconnect::Watchdog.into());
                    }
                    self.forget_abandoned();
                    self.engine.tick(now);
                }
            }
        }
    }

    async fn flush(&mut self, link: &Link) -> Result<(), Stop> {
        let now = Instant::now();
        while let Some(packet) = self.engine.flush(now) {
            let len = packet.len();
            link.send(packet).await?;
            if self.engine.awaiting_answer() {
                self.watchdog.on_sent(now, len);
            }
        }
        Ok(())
    }

    fn dispatch_events(&mut self) -> Result<(), Stop> {
        let mut restart = None;
        while let Some(event) = self.engine.poll_event() {
            match event {
                Event::Response { id, body } => {
                    self.fail_count = 0;
                    self.reply(id, Ok(body));
                }
                Event::Failed { id, error } => {
                    tracing::warn!("[mtp] DC{}: request {id} failed: {error}", self.dc_id);
                    self.reply(id, Err(error.into()));
                }
                Event::Delivered { id } => self.reply(id, Ok(Vec::new())),
                Event::Update { body } => {
                    // No subscribers is fine.
                    let _ = self.shared.updates.send(Update { dc_id: self.dc_id, body });
                }
                Event::Restart(reason) => restart = Some(reason),
            }
        }
        match restart {
            Some(reason) => Err(Disconnect::Restart(reason).into()),
            None => Ok(()),
        }
    }

    // ── Commands and replies ─────────────────────────────────────────────────

    fn on_command(&mut self, cmd: Option<Command>) -> Result<(), Stop> {
        match cmd {
            None => Err(Stop::Shutdown),
            Some(Command::Submit { id, request, reply }) => {
                self.replies.insert(id, reply);
                self.engine.submit(id, request);
                Ok(())
            }
            Some(Command::Cancel(id)) => {
                self.engine.cancel(id);
                self.reply(id, Err(Error::Cancelled));
                Ok(())
            }
        }
    }

    fn reply(&mut self, id: RequestId, result: Result<Vec<u8>, Error>) {
        if let Some(tx) = self.replies.remove(&id) {
            // The caller may have dropped its handle.
            let _ = tx.send(result);
        }
    }

    /// Stop tracking requests whose handles were dropped.
    fn forget_abandoned(&mut self) {
        let engine = &mut self.engine;
        self.replies.retain(|id, tx| {
            if tx.is_closed() {
                engine.cancel(*id);
                false
            } else {
                true
            }
        });
    }

    fn fail_all(&mut self, error: impl Fn() -> Error) {
        for (id, tx) in self.replies.drain() {
            self.engine.cancel(id);
            let _ = tx.send(Err(error()));
        }
    }

    // ── Between links ────────────────────────────────────────────────────────

    /// Handle a lost link. Returns `false` on shutdown.
    async fn recover(&mut self, lost: Disconnect) -> bool {
        let _ = self.dispatch_events();
        self.fail_count = self.fail_count.saturating_add(1);
        tracing::warn!("[mtp] DC{}: connection lost ({lost}), failure #{}", self.dc_id, self.fail_count);

        if lost.may_be_bad_key() && self.engine.has_key() {
            if self.engine.key_checked() {
                // Worked before; a second hint with no decrypt in between drops it.
                tracing::debug!("[mtp] DC{}: key may be unknown to the server, rechecking", self.dc_id);
                self.engine.uncheck_key();
            } else {
                self.recreate_key();
            }
        }

        let ctx = ReconnectContext {
            fail_count: NonZeroU32::new(self.fail_count).unwrap_or(NonZeroU32::MIN),
            dc_id: self.dc_id,
            error: match &lost {
                Disconnect::Transport(e) => Some(e.clone()),
                _ => None,
            },
        };
        match self.shared.reconnect.next_delay(&ctx) {
            ControlFlow::Continue(delay) => {
                tracing::debug!("[mtp] DC{}: reconnecting in {delay:?}", self.dc_id);
                self.state.send_replace(ConnectionState::WaitingRetry(delay));
                self.wait(delay).await
            }
            ControlFlow::Break(()) => {
                tracing::info!("[mtp] DC{}: not reconnecting until the next request", self.dc_id);
                let err = lost.to_error();
                self.fail_all(|| err.clone());
                self.fail_count = 0;
                self.state.send_replace(ConnectionState::Disconnected);
                self.idle().await
            }
        }
    }

    /// The server may not know our key: forget it everywhere so the next
    /// link runs a fresh exchange before anything is encrypted again.
    fn recreate_key(&mut self) {
        if let Some(old) = self.engine.drop_key() {
            tracing::warn!("[mtp] DC{}: auth key {:016x} may be unknown to the server, recreating", self.dc_id, old.id());
        }
        if let Err(e) = self.shared.key_store.erase(self.dc_id) {
            tracing::warn!("[mtp] DC{}: erasing auth key failed: {e}", self.dc_id);
        }
        self.key_id.send_replace(Some(RECREATE_KEY_ID));
    }

    /// Sleep `delay` while serving commands. Returns `false` on shutdown.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => {
                    if self.on_command(cmd).is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Serve commands until a request needs the connection.
    async fn idle(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => return false,
                cmd = self.commands.recv() => {
                    let wakes = matches!(cmd, Some(Command::Submit { .. }));
                    if self.on_command(cmd).is_err() {
                        return false;
                    }
                    if wakes {
                        return true;
                    }
                }
            }
        }
    }
}
