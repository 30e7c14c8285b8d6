//! Line transport over an (optionally TLS-wrapped) duplex stream.

pub mod tls;
pub mod transport;

pub use tls::{PLAINTEXT_FINGERPRINT, StreamAcceptor, TlsIdentity, fingerprint};
pub use transport::{BoxedStream, DuplexStream, LineReader, LineWriter, split};
