//! Per-connection protocol driver.
//!
//! ```text
//!   version ──► OK / HUH?
//!   PAIR ──► OK, READY… ──► <code> [name] ──► OK <token> / BAD_AUTH ──► close
//!   CONN ──► <token> ──► OK / BAD_AUTH
//!        ├─ v1: READY, then one reply (OK / ERR / HUH? / UNREADY) per line
//!        └─ v2: event juggling + state broadcasts
//! ```

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{JugglerSink, OutgoingStateEventStream};
use crate::config::ProtocolConfig;
use crate::error::{RemoteError, panic_message};
use crate::juggler::wire::KEEPALIVE;
use crate::juggler::{EventHandler, EventJuggler};
use crate::network::{DuplexStream, LineReader, LineWriter, split};
use crate::operation::{Capabilities, CapabilitySource, Request, capability_operations};
use crate::pairing::{CancelCallback, PairingManager, PeerInfo};
use crate::state::ConnectionState;
use crate::task::WorkerPool;

// ── Wire vocabulary ──────────────────────────────────────────────

pub const OK: &str = "OK";
pub const HUH: &str = "HUH?";
pub const READY: &str = "READY";
pub const UNREADY: &str = "UNREADY";
pub const BAD_AUTH: &str = "BAD_AUTH";
pub const PAIR: &str = "PAIR";
pub const CONN: &str = "CONN";
/// Built-in peer metadata update: `DEVICE <type> [friendly name]`.
pub const DEVICE: &str = "DEVICE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// One opcode line, one reply.
    Classic,
    /// Event-juggling steady state.
    Juggling,
}

impl TryFrom<&str> for ProtocolVersion {
    type Error = RemoteError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "1" => Ok(ProtocolVersion::Classic),
            "2" => Ok(ProtocolVersion::Juggling),
            other => Err(RemoteError::UnsupportedVersion(other.to_string())),
        }
    }
}

/// State streams connections subscribe to: channel and value are text,
/// destinations are connection ids.
pub type StateStream = OutgoingStateEventStream<String, String, u64>;

// ── ConnectionContext ────────────────────────────────────────────

/// Collaborators shared by every connection of a receiver.
pub struct ConnectionContext {
    pub config: ProtocolConfig,
    pub pairing: Arc<PairingManager>,
    pub capabilities: Arc<dyn CapabilitySource>,
    pub streams: Vec<Arc<StateStream>>,
    pub pool: Arc<WorkerPool>,
}

// ── ConnectionHandle ─────────────────────────────────────────────

type DeathListener = Box<dyn FnOnce(RemoteError) + Send + 'static>;

#[derive(Default)]
struct Death {
    cause: Option<RemoteError>,
    listeners: Vec<DeathListener>,
}

struct HandleInner {
    id: u64,
    peer: SocketAddr,
    state: Mutex<ConnectionState>,
    cancel: CancellationToken,
    death: Mutex<Death>,
}

/// Shared view of one connection. `close` may be called from any task.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                peer,
                state: Mutex::new(ConnectionState::default()),
                cancel: CancellationToken::new(),
                death: Mutex::new(Death::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn death_cause(&self) -> Option<RemoteError> {
        self.inner.death.lock().cause.clone()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Close the connection. Only the first call has an effect and
    /// returns `true`.
    pub fn close(&self, cause: RemoteError) -> bool {
        let listeners = {
            let mut death = self.inner.death.lock();
            if death.cause.is_some() {
                return false;
            }
            death.cause = Some(cause.clone());
            std::mem::take(&mut death.listeners)
        };
        self.inner.state.lock().kill();
        self.inner.cancel.cancel();
        debug!("[conn {}] closed: {cause}", self.inner.id);
        for listener in listeners {
            fire(listener, cause.clone());
        }
        true
    }

    /// Register a death listener. Fires exactly once, immediately if the
    /// connection is already closed.
    pub fn on_death<F>(&self, listener: F)
    where
        F: FnOnce(RemoteError) + Send + 'static,
    {
        let mut death = self.inner.death.lock();
        let cause = death.cause.clone();
        match cause {
            Some(cause) => {
                drop(death);
                fire(Box::new(listener), cause);
            }
            None => death.listeners.push(Box::new(listener)),
        }
    }

    fn transition<F>(&self, f: F) -> Result<(), RemoteError>
    where
        F: FnOnce(&mut ConnectionState) -> Result<(), RemoteError>,
    {
        f(&mut self.inner.state.lock())
    }

    fn closed_cause(&self) -> RemoteError {
        self.death_cause().unwrap_or(RemoteError::ConnectionClosed)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

fn fire(listener: DeathListener, cause: RemoteError) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(cause))) {
        error!(
            "connection death listener panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

// ── Line I/O bound to a handle ───────────────────────────────────

struct Conversation {
    reader: LineReader,
    writer: LineWriter,
    handle: ConnectionHandle,
}

impl Conversation {
    /// Next line. Silence for `timeout` is fatal, as is a closed handle.
    async fn read_line(&mut self, timeout: Duration) -> Result<String, RemoteError> {
        tokio::select! {
            _ = self.handle.closed() => Err(self.handle.closed_cause()),
            line = self.reader.next_line(timeout) => match line? {
                Some(line) => Ok(line),
                None => Err(RemoteError::KeepaliveExpired(timeout)),
            },
        }
    }

    async fn send(&mut self, line: &str) -> Result<(), RemoteError> {
        tokio::select! {
            _ = self.handle.closed() => Err(self.handle.closed_cause()),
            sent = self.writer.send_line(line) => sent,
        }
    }

    async fn shutdown(mut self) {
        self.reader.close();
        let _ = self.writer.close().await;
    }
}

// ── Capability tracking ──────────────────────────────────────────

/// Capability source that moves the connection between `Ready` and
/// `Unready` each time it is consulted.
struct ReadinessTracker {
    source: Arc<dyn CapabilitySource>,
    handle: ConnectionHandle,
}

impl CapabilitySource for ReadinessTracker {
    fn current(&self) -> Option<Arc<dyn Capabilities>> {
        let caps = self.source.current();
        let mut state = self.handle.inner.state.lock();
        let was_ready = state.is_ready();
        let moved = match &caps {
            Some(_) => state.become_ready(),
            None => state.become_unready(),
        };
        if moved.is_ok() && was_ready != state.is_ready() {
            info!("[conn {}] now {}", self.handle.id(), *state);
        }
        caps
    }
}

/// `DEVICE` metadata update inside the event-juggling steady state.
struct DeviceHandler {
    pairing: Arc<PairingManager>,
    token: String,
}

#[async_trait]
impl EventHandler for DeviceHandler {
    async fn handle(&self, extra: Option<String>) -> Result<Option<String>, RemoteError> {
        let (device_type, name) = parse_device(extra.as_deref().unwrap_or_default())?;
        self.pairing
            .update_metadata(&self.token, Some(device_type), name)?;
        Ok(None)
    }
}

fn parse_device(args: &str) -> Result<(String, Option<String>), RemoteError> {
    let args = args.trim();
    if args.is_empty() {
        return Err(RemoteError::Malformed("DEVICE needs a device type".into()));
    }
    Ok(match args.split_once(' ') {
        Some((device_type, name)) => (device_type.to_string(), Some(name.trim().to_string())),
        None => (args.to_string(), None),
    })
}

/// Closes the juggler if the connection future is dropped.
struct JugglerGuard(EventJuggler);

impl Drop for JugglerGuard {
    fn drop(&mut self) {
        self.0.close(RemoteError::ConnectionClosed);
    }
}

/// Withdraws from the pairing session when the pairing wait ends.
struct PairingWait<'a> {
    pairing: &'a PairingManager,
    cancel: CancelCallback,
}

impl Drop for PairingWait<'_> {
    fn drop(&mut self) {
        self.pairing.cancel_pairing(&self.cancel);
    }
}

// ── RemoteConnection ─────────────────────────────────────────────

/// Drives one accepted stream through handshake, authentication and the
/// steady state.
pub struct RemoteConnection {
    ctx: Arc<ConnectionContext>,
    handle: ConnectionHandle,
}

impl RemoteConnection {
    pub fn new(ctx: Arc<ConnectionContext>, id: u64, peer: SocketAddr) -> Self {
        Self {
            ctx,
            handle: ConnectionHandle::new(id, peer),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Run until the connection dies. Returns the death cause; the
    /// handle's death listeners have fired by then.
    pub async fn run<S: DuplexStream>(self, stream: S) -> RemoteError {
        let (reader, writer) = split(stream, &self.ctx.config);
        let conversation = Conversation {
            reader,
            writer,
            handle: self.handle.clone(),
        };
        let cause = match self.serve(conversation).await {
            Ok(()) => RemoteError::ConnectionClosed,
            Err(e) => e,
        };
        self.handle.close(cause);
        self.handle.closed_cause()
    }

    async fn serve(&self, mut conv: Conversation) -> Result<(), RemoteError> {
        let auth_timeout = self.ctx.config.auth_timeout;

        let offered = conv.read_line(auth_timeout).await?;
        let version = match ProtocolVersion::try_from(offered.trim()) {
            Ok(version) => version,
            Err(e) => {
                let _ = conv.send(HUH).await;
                return Err(e);
            }
        };
        conv.send(OK).await?;

        let init = conv.read_line(auth_timeout).await?;
        match init.trim() {
            PAIR => {
                self.handle.transition(ConnectionState::begin_pairing)?;
                self.pair(&mut conv).await?;
                // The peer reconnects with its token.
                conv.shutdown().await;
                Ok(())
            }
            CONN => {
                self.handle.transition(ConnectionState::begin_authentication)?;
                let token = self.authenticate(&mut conv).await?;
                match version {
                    ProtocolVersion::Classic => self.classic(conv, token).await,
                    ProtocolVersion::Juggling => self.juggle(conv, token).await,
                }
            }
            other => {
                let _ = conv.send(HUH).await;
                Err(RemoteError::UnsupportedOperation(other.to_string()))
            }
        }
    }

    // ── Pairing ──────────────────────────────────────────────────

    async fn pair(&self, conv: &mut Conversation) -> Result<(), RemoteError> {
        let cancelled = CancellationToken::new();
        let cancel: CancelCallback = {
            let cancelled = cancelled.clone();
            Arc::new(move || cancelled.cancel())
        };

        if let Err(e) = self.ctx.pairing.start_pairing(Arc::clone(&cancel)) {
            warn!("[conn {}] cannot pair: {e}", self.handle.id());
            let _ = conv.send(UNREADY).await;
            return Err(e);
        }
        let _wait = PairingWait {
            pairing: &self.ctx.pairing,
            cancel: Arc::clone(&cancel),
        };
        conv.send(OK).await?;

        let keepalive = self.ctx.config.keepalive_timeout;
        let answer = loop {
            conv.send(READY).await?;
            let line = tokio::select! {
                _ = cancelled.cancelled() => {
                    let _ = conv.send(BAD_AUTH).await;
                    return Err(RemoteError::PairingCancelled);
                }
                line = conv.read_line(keepalive) => line?,
            };
            if line.trim() != KEEPALIVE {
                break line;
            }
        };

        let answer = answer.trim();
        let (code, friendly_name) = match answer.split_once(' ') {
            Some((code, name)) => (code, Some(name.trim().to_string())),
            None => (answer, None),
        };
        let peer = PeerInfo {
            address: self.handle.peer_addr().ip().to_string(),
            friendly_name,
        };
        match self.ctx.pairing.pair(code, &cancel, &peer) {
            Ok(Some(token)) => conv.send(&format!("{OK} {token}")).await,
            Ok(None) => conv.send(BAD_AUTH).await,
            Err(e) => {
                let _ = conv.send(BAD_AUTH).await;
                Err(e)
            }
        }
    }

    // ── Authentication ───────────────────────────────────────────

    async fn authenticate(&self, conv: &mut Conversation) -> Result<String, RemoteError> {
        let token = conv
            .read_line(self.ctx.config.auth_timeout)
            .await?
            .trim()
            .to_string();
        let known = match self.ctx.pairing.fetch_pairing_data(&token) {
            Ok(record) => record.is_some(),
            Err(e) => {
                let _ = conv.send(BAD_AUTH).await;
                return Err(e);
            }
        };
        if !known {
            warn!("[conn {}] unknown token", self.handle.id());
            let _ = conv.send(BAD_AUTH).await;
            return Err(RemoteError::Unauthorized);
        }

        conv.send(OK).await?;
        let address = self.handle.peer_addr().ip().to_string();
        if let Err(e) = self.ctx.pairing.record_connection(&token, &address) {
            warn!("[conn {}] could not record connection: {e}", self.handle.id());
        }
        info!("[conn {}] authenticated from {address}", self.handle.id());
        Ok(token)
    }

    fn tracker(&self) -> ReadinessTracker {
        ReadinessTracker {
            source: Arc::clone(&self.ctx.capabilities),
            handle: self.handle.clone(),
        }
    }

    // ── Steady state v1 ──────────────────────────────────────────

    async fn classic(&self, mut conv: Conversation, token: String) -> Result<(), RemoteError> {
        let tracker = self.tracker();
        tracker.current();
        conv.send(READY).await?;

        let keepalive = self.ctx.config.keepalive_timeout;
        loop {
            let line = conv.read_line(keepalive).await?;
            let line = line.trim();
            if line == KEEPALIVE {
                conv.send(OK).await?;
                continue;
            }
            let Some(caps) = tracker.current() else {
                conv.send(UNREADY).await?;
                continue;
            };
            let reply = match line.split_once(' ') {
                Some((DEVICE, args)) => self.update_device(&token, args),
                None if line == DEVICE => self.update_device(&token, ""),
                _ => self.apply(line, caps.as_ref()).await,
            };
            conv.send(&reply).await?;
        }
    }

    fn update_device(&self, token: &str, args: &str) -> String {
        let updated = parse_device(args).and_then(|(device_type, name)| {
            self.ctx
                .pairing
                .update_metadata(token, Some(device_type), name)
        });
        match updated {
            Ok(_) => OK.to_string(),
            Err(e) => format!("ERR {e}"),
        }
    }

    async fn apply(&self, line: &str, caps: &dyn Capabilities) -> String {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(RemoteError::UnsupportedOperation(opcode)) => {
                debug!("[conn {}] unknown opcode {opcode}", self.handle.id());
                return HUH.to_string();
            }
            Err(e) => return format!("ERR {e}"),
        };
        let outcome = match AssertUnwindSafe(request.apply(caps)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(RemoteError::Panicked(panic_message(payload.as_ref()))),
        };
        match outcome {
            Ok(()) => OK.to_string(),
            Err(e) => {
                warn!("[conn {}] {} failed: {e}", self.handle.id(), request.opcode());
                format!("ERR {e}")
            }
        }
    }

    // ── Steady state v2 ──────────────────────────────────────────

    async fn juggle(&self, conv: Conversation, token: String) -> Result<(), RemoteError> {
        let tracker = Arc::new(self.tracker());
        tracker.current();

        let mut ops = capability_operations(tracker);
        ops.register(
            DEVICE,
            Arc::new(DeviceHandler {
                pairing: Arc::clone(&self.ctx.pairing),
                token,
            }),
        );
        let Conversation { reader, writer, .. } = conv;
        let juggler = EventJuggler::start(
            reader,
            writer,
            ops,
            Arc::clone(&self.ctx.pool),
            self.ctx.config.clone(),
        );
        let _guard = JugglerGuard(juggler.clone());

        let id = self.handle.id();
        for stream in &self.ctx.streams {
            let sink = JugglerSink::new(juggler.clone(), stream.event_type());
            stream.subscribe(id, Arc::new(sink));
        }
        let streams = self.ctx.streams.clone();
        juggler.on_death(move |_| {
            for stream in streams {
                stream.unsubscribe(&id);
            }
        });

        tokio::select! {
            _ = juggler.closed() => {}
            _ = self.handle.closed() => {
                juggler.close(self.handle.closed_cause());
            }
        }
        Err(juggler
            .death_cause()
            .unwrap_or(RemoteError::ConnectionClosed))
    }
}

// ── Tests ────────────────────────────────────────────────────────
