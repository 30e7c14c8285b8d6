//! Bidirectional request/response multiplexing over one line transport.
//!
//! An [`EventJuggler`] owns two tasks per connection:
//!
//! ```text
//!   send_event ──► queue ──► output loop ──► LineWriter
//!                               │  idle: sweep timeouts, PING
//!                               ▼
//!                          in-flight table ◄── responses ◄── input loop ◄── LineReader
//!                                               requests ──► WorkerPool ──► OperationTable
//! ```
//!
//! Request handlers and response settlement run on the shared
//! [`WorkerPool`], never on the loops themselves.

mod handler;
mod inflight;
pub mod wire;

pub use handler::{EventHandler, OperationTable};
pub use inflight::{InFlightEvent, InFlightTable};

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ProtocolConfig;
use crate::error::{RemoteError, panic_message};
use crate::network::{DuplexStream, LineReader, LineWriter, split};
use crate::settle::Settlable;
use crate::task::WorkerPool;
use wire::{Inbound, KEEPALIVE, Status};

type DeathListener = Box<dyn FnOnce(RemoteError) + Send + 'static>;

/// Items consumed by the output loop, in order.
enum Outbound {
    Event {
        payload: String,
        enqueued_at: Instant,
        settlable: Settlable<String>,
    },
    Line(String),
    /// Stop after everything queued before it has been written.
    Close(RemoteError),
}

#[derive(Default)]
struct Lifecycle {
    cause: Option<RemoteError>,
    listeners: Vec<DeathListener>,
}

struct Shared {
    config: ProtocolConfig,
    ops: OperationTable,
    in_flight: InFlightTable,
    queue: Mutex<VecDeque<Outbound>>,
    queued: Notify,
    dead: AtomicBool,
    sweeping: AtomicBool,
    cancel: CancellationToken,
    pool: Arc<WorkerPool>,
    lifecycle: Mutex<Lifecycle>,
}

// ── EventJuggler ─────────────────────────────────────────────────

/// Handle to a running juggler. Cloning yields another handle to the
/// same connection.
#[derive(Clone)]
pub struct EventJuggler {
    shared: Arc<Shared>,
}

impl EventJuggler {
    /// Split `stream` and start juggling on it.
    pub fn spawn<S: DuplexStream>(
        stream: S,
        ops: OperationTable,
        pool: Arc<WorkerPool>,
        config: ProtocolConfig,
    ) -> Self {
        let (reader, writer) = split(stream, &config);
        Self::start(reader, writer, ops, pool, config)
    }

    /// Start the input and output loops over an already split transport.
    pub fn start(
        reader: LineReader,
        writer: LineWriter,
        ops: OperationTable,
        pool: Arc<WorkerPool>,
        config: ProtocolConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            in_flight: InFlightTable::new(config.event_timeout),
            config,
            ops,
            queue: Mutex::new(VecDeque::new()),
            queued: Notify::new(),
            dead: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            pool,
            lifecycle: Mutex::new(Lifecycle::default()),
        });
        tokio::spawn(output_loop(Arc::clone(&shared), writer));
        tokio::spawn(input_loop(Arc::clone(&shared), reader));
        Self { shared }
    }

    /// Queue an outbound event. The settlable resolves with the peer's
    /// `OK` payload, or fails with `Remote`, `EventTimeout` or
    /// `ConnectionClosed`.
    pub fn send_event(&self, payload: impl Into<String>) -> Settlable<String> {
        let shared = &self.shared;
        if shared.dead.load(Ordering::Acquire) {
            return Settlable::failed(RemoteError::ConnectionClosed);
        }

        let settlable = Settlable::new();
        shared.queue.lock().push_back(Outbound::Event {
            payload: payload.into(),
            enqueued_at: Instant::now(),
            settlable: settlable.clone(),
        });
        shared.queued.notify_one();

        // close() may have drained the queue just before the push.
        if shared.dead.load(Ordering::Acquire) {
            let removed = {
                let mut queue = shared.queue.lock();
                let position = queue.iter().position(|item| match item {
                    Outbound::Event { settlable: s, .. } => s.ptr_eq(&settlable),
                    _ => false,
                });
                position.and_then(|i| queue.remove(i)).is_some()
            };
            if removed {
                let _ = settlable.settle_error(RemoteError::ConnectionClosed);
            }
        }
        settlable
    }

    /// Shut the connection down. Returns `false` if it was already dead.
    pub fn close(&self, cause: RemoteError) -> bool {
        self.shared.close(cause)
    }

    /// Register a death listener. Fires exactly once, immediately if the
    /// juggler is already dead.
    pub fn on_death<F>(&self, listener: F)
    where
        F: FnOnce(RemoteError) + Send + 'static,
    {
        let mut lifecycle = self.shared.lifecycle.lock();
        let cause = lifecycle.cause.clone();
        match cause {
            Some(cause) => {
                drop(lifecycle);
                fire(Box::new(listener), cause);
            }
            None => lifecycle.listeners.push(Box::new(listener)),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    /// Resolves once the juggler has died.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    pub fn death_cause(&self) -> Option<RemoteError> {
        self.shared.lifecycle.lock().cause.clone()
    }

    /// Events written and awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for EventJuggler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventJuggler")
            .field("dead", &self.is_dead())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn fire(listener: DeathListener, cause: RemoteError) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(cause))) {
        error!(
            "death listener panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

// ── Shared ───────────────────────────────────────────────────────

impl Shared {
    fn close(&self, cause: RemoteError) -> bool {
        let listeners = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.cause.is_some() {
                return false;
            }
            lifecycle.cause = Some(cause.clone());
            self.dead.store(true, Ordering::Release);
            std::mem::take(&mut lifecycle.listeners)
        };
        debug!("juggler closing: {cause}");
        self.cancel.cancel();

        let queued: Vec<Outbound> = self.queue.lock().drain(..).collect();
        for item in queued {
            if let Outbound::Event { settlable, .. } = item {
                let _ = settlable.settle_error(RemoteError::ConnectionClosed);
            }
        }
        for (_, event) in self.in_flight.drain_all() {
            let _ = event.settlable.settle_error(RemoteError::ConnectionClosed);
        }

        for listener in listeners {
            fire(listener, cause.clone());
        }
        true
    }

    fn enqueue(&self, item: Outbound) {
        if self.dead.load(Ordering::Acquire) {
            return;
        }
        self.queue.lock().push_back(item);
        self.queued.notify_one();
    }

    fn enqueue_line(&self, line: String) {
        self.enqueue(Outbound::Line(line));
    }

    /// Evict timed-out events on the pool. At most one sweep runs at once.
    fn schedule_sweep(self: &Arc<Self>) {
        if self.in_flight.is_empty() || self.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(self);
        self.pool.spawn("juggler-sweep", async move {
            let after = shared.in_flight.timeout();
            for (id, event) in shared.in_flight.drain_expired() {
                debug!("event {id} ({}) timed out", event.payload);
                let _ = event
                    .settlable
                    .settle_error(RemoteError::EventTimeout { id, after });
            }
            shared.sweeping.store(false, Ordering::Release);
        });
    }

    fn dispatch_line(self: &Arc<Self>, line: String) {
        match Inbound::parse(&line) {
            Ok(Inbound::Keepalive) => {}
            Ok(Inbound::Response {
                id,
                status,
                payload,
            }) => {
                let shared = Arc::clone(self);
                self.pool.spawn("juggler-response", async move {
                    shared.settle_response(id, status, payload);
                });
            }
            Ok(Inbound::Request { id, opcode, extra }) => {
                let shared = Arc::clone(self);
                self.pool.spawn("juggler-request", async move {
                    shared.handle_request(id, opcode, extra).await;
                });
            }
            Err((Some(id), e)) => {
                warn!("malformed request {id}: {e}");
                self.enqueue_line(wire::format_err(&id, &e));
            }
            Err((None, e)) => warn!("dropping unparseable line: {e}"),
        }
    }

    fn settle_response(&self, id: String, status: Status, payload: Option<String>) {
        let Some(event) = self.in_flight.resolve(&id) else {
            warn!("response for unknown event {id} dropped");
            return;
        };
        let payload = payload.unwrap_or_default();
        let _ = match status {
            Status::Ok => event.settlable.settle_value(payload),
            Status::Err => event.settlable.settle_error(RemoteError::Remote(payload)),
        };
    }

    async fn handle_request(&self, id: String, opcode: String, extra: Option<String>) {
        let Some(handler) = self.ops.get(&opcode) else {
            warn!("request {id}: no handler for {opcode}");
            let e = RemoteError::UnsupportedOperation(opcode);
            self.enqueue_line(wire::format_err(&id, &e));
            return;
        };

        let outcome = match AssertUnwindSafe(handler.handle(extra)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(RemoteError::Panicked(panic_message(payload.as_ref()))),
        };
        match outcome {
            Ok(payload) => self.enqueue_line(wire::format_ok(&id, payload.as_deref())),
            Err(e) => {
                warn!("request {id} ({opcode}) failed: {e}");
                self.enqueue_line(wire::format_err(&id, &e));
                if handler.fatal_on_failure() {
                    self.enqueue(Outbound::Close(e));
                }
            }
        }
    }
}

// ── Loops ────────────────────────────────────────────────────────

async fn output_loop(shared: Arc<Shared>, mut writer: LineWriter) {
    let cause = loop {
        let next = shared.queue.lock().pop_front();
        let item = match next {
            Some(item) => item,
            None => {
                shared.schedule_sweep();
                tokio::select! {
                    _ = shared.cancel.cancelled() => break None,
                    _ = shared.queued.notified() => continue,
                    _ = tokio::time::sleep(shared.config.ping_interval) => {
                        Outbound::Line(KEEPALIVE.to_string())
                    }
                }
            }
        };

        let (line, event_id) = match item {
            Outbound::Close(cause) => break Some(cause),
            Outbound::Line(line) => (line, None),
            Outbound::Event {
                payload,
                enqueued_at,
                settlable,
            } => {
                let line_payload = payload.clone();
                let event = InFlightEvent {
                    payload,
                    enqueued_at,
                    settlable,
                };
                // Registered before the write so a fast response finds it.
                let id = shared.in_flight.insert_with(wire::correlation_id, event);
                // close() marks death before draining the table, so an entry
                // that missed the drain is seen here.
                if shared.dead.load(Ordering::Acquire) {
                    if let Some(event) = shared.in_flight.resolve(&id) {
                        let _ = event.settlable.settle_error(RemoteError::ConnectionClosed);
                    }
                    break None;
                }
                (wire::format_request(&id, &line_payload), Some(id))
            }
        };

        let written = tokio::select! {
            _ = shared.cancel.cancelled() => break None,
            written = writer.send_line(&line) => written,
        };
        match written {
            Ok(()) => {}
            Err(RemoteError::Malformed(reason)) => {
                // Rejected by the encoder before any byte was written.
                warn!("refusing to write line: {reason}");
                if let Some(event) = event_id.and_then(|id| shared.in_flight.resolve(&id)) {
                    let _ = event.settlable.settle_error(RemoteError::Malformed(reason));
                }
            }
            Err(e) => {
                if let Some(event) = event_id.and_then(|id| shared.in_flight.resolve(&id)) {
                    let _ = event.settlable.settle_error(e.clone());
                }
                break Some(e);
            }
        }
    };

    let _ = tokio::time::timeout(shared.config.ping_interval, writer.close()).await;
    shared.close(cause.unwrap_or(RemoteError::ConnectionClosed));
}

async fn input_loop(shared: Arc<Shared>, mut reader: LineReader) {
    let keepalive = shared.config.keepalive_timeout;
    let cause = loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break None,
            next = reader.next_line(keepalive) => next,
        };
        match next {
            Ok(Some(line)) => shared.dispatch_line(line),
            Ok(None) => break Some(RemoteError::KeepaliveExpired(keepalive)),
            Err(e) => break Some(e),
        }
    };
    reader.close();
    if let Some(cause) = cause {
        shared.close(cause);
    }
}

// ── Tests ────────────────────────────────────────────────────────
