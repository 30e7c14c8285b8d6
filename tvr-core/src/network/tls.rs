//! Server TLS identity and the acceptor that wraps accepted sockets.
//!
//! The receiver presents a self-signed certificate. There is no CA: the
//! pairing surface shows [`fingerprint`] so a human can compare it with
//! what the remote displays.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::error::RemoteError;
use crate::network::transport::BoxedStream;

/// Fingerprint shown when the listener runs without TLS.
pub const PLAINTEXT_FINGERPRINT: &str = "PLAINTEXT";

/// blake3 of the DER certificate as colon-separated upper-case hex.
pub fn fingerprint(cert_der: &[u8]) -> String {
    blake3::hash(cert_der)
        .as_bytes()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

// ── TlsIdentity ──────────────────────────────────────────────────

/// A loaded certificate chain and key, ready to accept connections.
#[derive(Clone)]
pub struct TlsIdentity {
    config: Arc<ServerConfig>,
    fingerprint: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl TlsIdentity {
    /// Load a PEM certificate chain and private key.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, RemoteError> {
        let chain = load_cert_chain(cert_path)?;
        let key = load_private_key(key_path)?;
        Self::from_der(chain, key)
    }

    /// Build from DER material. The first certificate is the leaf.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, RemoteError> {
        let leaf = chain
            .first()
            .ok_or_else(|| RemoteError::Tls("empty certificate chain".into()))?;
        let fingerprint = fingerprint(leaf.as_ref());
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| RemoteError::Tls(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn acceptor(&self) -> StreamAcceptor {
        StreamAcceptor::Tls(TlsAcceptor::from(Arc::clone(&self.config)))
    }
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, RemoteError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let chain = certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(RemoteError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, RemoteError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    private_key(&mut reader)?
        .ok_or_else(|| RemoteError::Tls(format!("no private key in {}", path.display())))
}

// ── StreamAcceptor ───────────────────────────────────────────────

/// Socket factory: turns an accepted TCP stream into the duplex stream a
/// connection runs over.
#[derive(Clone)]
pub enum StreamAcceptor {
    /// No encryption. For tests and local debugging only.
    Plain,
    Tls(TlsAcceptor),
}

impl StreamAcceptor {
    pub async fn accept(&self, stream: TcpStream) -> Result<BoxedStream, RemoteError> {
        stream.set_nodelay(true)?;
        match self {
            Self::Plain => Ok(Box::new(stream)),
            Self::Tls(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                Ok(Box::new(tls))
            }
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_format() {
        let fp = fingerprint(b"certificate bytes");
        let groups: Vec<&str> = fp.split(':').collect();
        assert_eq!(groups.len(), 32);
        assert!(groups.iter().all(|g| g.len() == 2));
        assert_eq!(fp, fp.to_uppercase());
        assert_eq!(fp, fingerprint(b"certificate bytes"));
        assert_ne!(fp, fingerprint(b"other bytes"));
    }

    #[test]
    fn empty_chain_rejected() {
        let key = PrivateKeyDer::Pkcs8(Vec::<u8>::new().into());
        assert!(matches!(
            TlsIdentity::from_der(Vec::new(), key),
            Err(RemoteError::Tls(_))
        ));
    }

    #[test]
    fn missing_pem_file_is_transport_error() {
        let result = TlsIdentity::from_pem_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(matches!(result, Err(RemoteError::Transport(_))));
    }
}
