//! # tvr-core
//!
//! Receiver-side protocol engine for the TVR remote-control service.
//!
//! This crate contains:
//! - **Settle**: `Settlable<T>`, a one-shot completion cell with callback chaining
//! - **Codec / Network**: `LineCodec`, `LineReader`/`LineWriter` over plain TCP or TLS
//! - **Juggler**: `EventJuggler`, correlated request/response multiplexing on one line stream
//! - **Limiter**: `ReplacementLimiter` and its per-channel variant, newest-wins flow control
//! - **Broadcast**: `OutgoingStateEventStream`, latest-value state fan-out to subscribers
//! - **Pairing**: `PairingManager`, confirmation-code pairing and token issue
//! - **Remote**: `RemoteConnection`, the per-connection handshake and steady state
//! - **Task**: `WorkerPool` for bounded handler execution
//! - **Error**: `RemoteError`, typed, `thiserror`-based error hierarchy

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod error;
pub mod juggler;
pub mod limiter;
pub mod network;
pub mod operation;
pub mod pairing;
pub mod remote;
pub mod settle;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use broadcast::{JugglerSink, OutgoingStateEventStream, StateSink};
pub use codec::{DEFAULT_MAX_LINE_LENGTH, LineCodec};
pub use config::ProtocolConfig;
pub use error::RemoteError;
pub use juggler::{EventHandler, EventJuggler, OperationTable};
pub use limiter::{
    ChannelCallback, ChannelSender, ChanneledReplacementLimiter, EventSender, NoCallback,
    ReplacementCallback, ReplacementLimiter, Retry,
};
pub use network::{BoxedStream, DuplexStream, LineReader, LineWriter, StreamAcceptor, TlsIdentity};
pub use operation::{
    Capabilities, CapabilityHandler, CapabilitySlot, CapabilitySource, Direction, MediaAction,
    Opcode, Request, capability_operations,
};
pub use pairing::{
    CancelCallback, ConfirmationHandle, ConfirmationSurface, MemoryPairingStore, PairingManager,
    PairingRecord, PairingStore, PeerInfo,
};
pub use remote::{
    ConnectionContext, ConnectionHandle, ProtocolVersion, RemoteConnection, StateStream,
};
pub use settle::Settlable;
pub use state::ConnectionState;
pub use task::WorkerPool;
