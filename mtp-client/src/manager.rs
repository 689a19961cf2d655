//! [`ConnectionManager`]: one connection task per DC, spawned on first use.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use mtp_crypto::rsa;
use mtp_proto::{Request, RequestId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::Config;
use crate::connection::{Command, Connection, ConnectionState, Shared, Update};
use crate::dc_options::DcOptions;
use crate::errors::Error;
use crate::transport::{Connector, NetConnector};

const COMMAND_CAPACITY: usize = 256;
const UPDATE_CAPACITY: usize = 1024;

/// A live connection task.
struct DcHandle {
    commands: mpsc::Sender<Command>,
    state:    watch::Receiver<ConnectionState>,
    key_id:   watch::Receiver<Option<u64>>,
}

struct Inner {
    shared:     Arc<Shared>,
    dc_options: DcOptions,
    dcs:        Mutex<HashMap<i32, DcHandle>>,
    next_id:    AtomicU64,
    tracker:    TaskTracker,
}

/// Owns the connections to every DC.
///
/// Cheap to clone; clones share the same connections. Connections are
/// created lazily by [`submit`](Self::submit) or [`connect`](Self::connect)
/// and keep running (reconnecting on their own) until
/// [`shutdown`](Self::shutdown).
///
/// # Example
///
/// ```rust,no_run
/// # async fn f() -> Result<(), mtp_client::Error> {
/// use mtp_client::{Config, ConnectionManager};
///
/// let manager = ConnectionManager::new(Config { test_mode: true, ..Default::default() });
/// let body = vec![0; 8]; // a serialized call
/// let answer = manager.submit(2, body, true).await?.await?;
/// println!("{} bytes back", answer.len());
/// manager.shutdown().await;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// A manager dialing real sockets as `config` describes.
    pub fn new(config: Config) -> Self {
        let connector = Arc::new(NetConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    /// A manager that gets its links from `connector`.
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        let rsa_keys = if config.rsa_keys.is_empty() {
            rsa::builtin_keys(config.test_mode)
        } else {
            config.rsa_keys
        };
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let shared = Shared {
            connector,
            key_store: config.key_store,
            reconnect: config.reconnect_policy,
            rsa_keys,
            engine: config.engine,
            handshake_attempts: config.handshake_attempts,
            handshake_timeout: config.handshake_timeout,
            updates,
            token: CancellationToken::new(),
        };
        tracing::debug!(
            "[mtp] connection manager: transport={} framing={:?} test_mode={}",
            config.transport, config.framing, config.test_mode
        );
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(shared),
                dc_options: config.dc_options.unwrap_or_else(|| DcOptions::for_mode(config.test_mode)),
                dcs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Start the connection to `dc_id` without sending anything.
    pub fn connect(&self, dc_id: i32) -> Result<(), Error> {
        self.commands(dc_id).map(drop)
    }

    /// Queue a serialized call for `dc_id`.
    ///
    /// The returned handle resolves to the server's answer, verbatim: an
    /// `rpc_error` is a successful answer here (see
    /// [`RpcError::parse`](crate::RpcError::parse)). With `needs_ack` false the
    /// body is sent as a service message: nothing is resent and the handle
    /// resolves to an empty body once the packet is out.
    pub async fn submit(&self, dc_id: i32, body: Vec<u8>, needs_ack: bool) -> Result<RequestHandle, Error> {
        let commands = self.commands(dc_id)?;
        let id = RequestId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let request = Request::new(body).needs_ack(needs_ack).expects_response(needs_ack);
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Submit { id, request, reply })
            .await
            .map_err(|_| Error::Dropped)?;
        tracing::trace!("[mtp] DC{dc_id}: submitted request {id}");
        Ok(RequestHandle { dc_id, id, rx })
    }

    /// Stop tracking a request; its handle resolves to [`Error::Cancelled`].
    pub async fn cancel(&self, handle: &RequestHandle) {
        let commands = self.lock().get(&handle.dc_id).map(|h| h.commands.clone());
        if let Some(commands) = commands {
            let _ = commands.send(Command::Cancel(handle.id)).await;
        }
    }

    /// Watch the state of the connection to `dc_id`, if it was started.
    pub fn connection_state(&self, dc_id: i32) -> Option<watch::Receiver<ConnectionState>> {
        self.lock().get(&dc_id).map(|h| h.state.clone())
    }

    /// Watch the auth key id in use for `dc_id`, if the connection was
    /// started. [`RECREATE_KEY_ID`](crate::RECREATE_KEY_ID) marks a key
    /// being replaced.
    pub fn auth_key_id(&self, dc_id: i32) -> Option<watch::Receiver<Option<u64>>> {
        self.lock().get(&dc_id).map(|h| h.key_id.clone())
    }

    /// Subscribe to unsolicited messages from every DC.
    pub fn updates(&self) -> broadcast::Receiver<Update> {
        self.inner.shared.updates.subscribe()
    }

    /// Stop every connection and wait for the tasks to finish. Pending
    /// handles resolve to [`Error::Dropped`].
    pub async fn shutdown(&self) {
        tracing::info!("[mtp] shutting down connections");
        self.inner.shared.token.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i32, DcHandle>> {
        self.inner.dcs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The command channel of `dc_id`, spawning its task if needed.
    fn commands(&self, dc_id: i32) -> Result<mpsc::Sender<Command>, Error> {
        if self.inner.shared.token.is_cancelled() {
            return Err(Error::Dropped);
        }
        let mut dcs = self.lock();
        if let Some(handle) = dcs.get(&dc_id) {
            if !handle.commands.is_closed() {
                return Ok(handle.commands.clone());
            }
        }
        let addr = self.inner.dc_options.address(dc_id).ok_or(Error::UnknownDc(dc_id))?;

        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (key_tx, key_id) = watch::channel(None);
        let conn = Connection::new(dc_id, addr.to_string(), Arc::clone(&self.inner.shared), rx, state_tx, key_tx);
        self.inner.tracker.spawn(conn.run());
        dcs.insert(dc_id, DcHandle { commands: tx.clone(), state, key_id });
        Ok(tx)
    }
}

/// Resolves to the answer of a submitted request.
#[derive(Debug)]
pub struct RequestHandle {
    dc_id: i32,
    id:    RequestId,
    rx:    oneshot::Receiver<Result<Vec<u8>, Error>>,
}

impl RequestHandle {
    /// The id the request is tracked under.
    pub fn id(&self) -> RequestId { self.id }

    /// The DC the request was sent to.
    pub fn dc_id(&self) -> i32 { self.dc_id }
}

impl Future for RequestHandle {
    type Output = Result<Vec<u8>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::Dropped)))
    }
}
