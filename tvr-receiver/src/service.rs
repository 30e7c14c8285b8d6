//! Receiver service core logic.
//!
//! Owns the control listener and every live remote connection. Each
//! accepted socket is wrapped (TLS or plain), handed to a
//! `RemoteConnection`, and tracked until it dies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use tvr_core::network::PLAINTEXT_FINGERPRINT;
use tvr_core::{
    CapabilitySlot, ConnectionContext, ConnectionHandle, MemoryPairingStore, PairingManager,
    PairingStore, RemoteConnection, RemoteError, StateStream, StreamAcceptor, TlsIdentity,
    WorkerPool,
};

use crate::config::ReceiverConfig;
use crate::store::FilePairingStore;
use crate::surfaces::LogConfirmationSurface;

type Registry = Arc<Mutex<HashMap<u64, ConnectionHandle>>>;

// ── ReceiverService ──────────────────────────────────────────────

/// The top-level receiver service.
pub struct ReceiverService {
    config: ReceiverConfig,
    ctx: Arc<ConnectionContext>,
    acceptor: StreamAcceptor,
    capabilities: Arc<CapabilitySlot>,
    connections: Registry,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
}

impl ReceiverService {
    /// Build the service: TLS identity, pairing store and state streams.
    pub fn new(config: ReceiverConfig) -> Result<Self, RemoteError> {
        let (acceptor, fingerprint) = if config.tls_enabled() {
            let identity = TlsIdentity::from_pem_files(
                Path::new(&config.tls.cert_file),
                Path::new(&config.tls.key_file),
            )?;
            let fingerprint = identity.fingerprint().to_string();
            (identity.acceptor(), fingerprint)
        } else {
            warn!("no TLS certificate configured; remotes will connect in plaintext");
            (StreamAcceptor::Plain, PLAINTEXT_FINGERPRINT.to_string())
        };

        let store: Arc<dyn PairingStore> = if config.pairing.store_file.is_empty() {
            Arc::new(MemoryPairingStore::new())
        } else {
            Arc::new(FilePairingStore::open(&config.pairing.store_file)?)
        };

        let protocol = config.to_protocol_config();
        let pairing = Arc::new(PairingManager::new(
            Arc::new(LogConfirmationSurface::new()),
            store,
            fingerprint,
            protocol.token_length.clone(),
        ));

        let mut streams = Vec::with_capacity(config.streams.len());
        for spec in &config.streams {
            let stream = StateStream::new(spec.event_type.clone(), protocol.retry_delay);
            for channel in &spec.channels {
                stream.add_channel(channel.clone())?;
            }
            streams.push(Arc::new(stream));
        }

        let capabilities = Arc::new(CapabilitySlot::new());
        let ctx = Arc::new(ConnectionContext {
            pairing,
            capabilities: capabilities.clone(),
            streams,
            pool: WorkerPool::new(protocol.worker_threads),
            config: protocol,
        });

        Ok(Self {
            config,
            ctx,
            acceptor,
            capabilities,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Slot the input backend binds into. Connections report `UNREADY`
    /// while it is empty.
    pub fn capabilities(&self) -> &Arc<CapabilitySlot> {
        &self.capabilities
    }

    pub fn pairing(&self) -> &Arc<PairingManager> {
        &self.ctx.pairing
    }

    /// Configured state stream for `event_type`.
    pub fn stream(&self, event_type: &str) -> Option<Arc<StateStream>> {
        self.ctx
            .streams
            .iter()
            .find(|s| s.event_type() == event_type)
            .cloned()
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Bind the configured control address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = format!(
            "{}:{}",
            self.config.network.bind, self.config.network.control_port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("receiver listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept remotes on `listener` until stopped, then abort any pairing
    /// session, close every live connection and shut the worker pool down.
    /// A stopped service does not serve again.
    pub async fn serve(&self, listener: TcpListener) {
        if self.ctx.pool.is_shut_down() {
            warn!("receiver service already stopped; not serving");
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let limit = self.config.network.max_connections as usize;
            if self.connection_count() >= limit {
                warn!("rejecting {peer}: {limit} connections already open");
                continue;
            }
            self.admit(stream, peer);
        }

        self.running.store(false, Ordering::SeqCst);
        if self.ctx.pairing.abort_pairing() {
            info!("pairing session ended by shutdown");
        }
        let live: Vec<ConnectionHandle> = self.connections.lock().values().cloned().collect();
        for handle in live {
            handle.close(RemoteError::ConnectionClosed);
        }
        self.ctx.pool.shutdown();
        info!("receiver service stopped");
    }

    // ── Internal ─────────────────────────────────────────────────

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = RemoteConnection::new(Arc::clone(&self.ctx), id, peer);
        let handle = connection.handle();

        self.connections.lock().insert(id, handle.clone());
        let registry = Arc::clone(&self.connections);
        handle.on_death(move |cause| {
            registry.lock().remove(&id);
            debug!("[conn {id}] removed: {cause}");
        });
        info!("[conn {id}] remote connected from {peer}");

        let acceptor = self.acceptor.clone();
        let handshake = self.ctx.config.auth_timeout;
        tokio::spawn(async move {
            let accepted = tokio::select! {
                _ = handle.closed() => return,
                accepted = tokio::time::timeout(handshake, acceptor.accept(stream)) => accepted,
            };
            let stream = match accepted {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("[conn {id}] TLS handshake failed: {e}");
                    handle.close(e);
                    return;
                }
                Err(_) => {
                    warn!("[conn {id}] TLS handshake timed out");
                    handle.close(RemoteError::KeepaliveExpired(handshake));
                    return;
                }
            };
            let cause = connection.run(stream).await;
            if cause.is_fatal() {
                info!("[conn {id}] disconnected: {cause}");
            } else {
                warn!("[conn {id}] ended: {cause}");
            }
        });
    }

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
