//! Configuration for the receiver service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tvr_core::ProtocolConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Certificate and key. Empty paths mean plaintext.
    pub tls: TlsConfig,
    /// Protocol timing and sizing.
    pub protocol: ProtocolSettings,
    /// Pairing persistence and token bounds.
    pub pairing: PairingConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// State streams offered to every event-juggling connection.
    pub streams: Vec<StreamConfig>,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the control listener on.
    pub bind: String,
    /// TCP port to listen for remotes.
    pub control_port: u16,
    /// Maximum concurrent remote connections.
    pub max_connections: u32,
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_file: String,
    /// PEM private key.
    pub key_file: String,
}

/// Protocol timing, in milliseconds, and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Idle interval before a keepalive is written. The peer is dropped
    /// after twice this much silence.
    pub ping_interval_ms: u64,
    /// Deadline for a response to an outbound event.
    pub event_timeout_ms: u64,
    /// Deadline for each handshake and authentication line.
    pub auth_timeout_ms: u64,
    /// Delay before a failed state broadcast is retried.
    pub retry_delay_ms: u64,
    /// Inbound lines buffered per connection.
    pub line_queue_capacity: usize,
    /// Longest accepted line in bytes.
    pub max_line_length: usize,
    /// Concurrent request handlers across all connections.
    pub worker_threads: usize,
}

/// Pairing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// JSON file pairing records are kept in. Empty keeps them in memory.
    pub store_file: String,
    pub token_min_length: usize,
    pub token_max_length: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

/// One state stream and its initial channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub event_type: String,
    pub channels: Vec<String>,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            control_port: 6466,
            max_connections: 8,
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5000,
            event_timeout_ms: 5000,
            auth_timeout_ms: 10_000,
            retry_delay_ms: 1000,
            line_queue_capacity: 64,
            max_line_length: tvr_core::DEFAULT_MAX_LINE_LENGTH,
            worker_threads: 8,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            store_file: "tvr-pairings.json".into(),
            token_min_length: 24,
            token_max_length: 48,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ReceiverConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Whether both TLS paths are set.
    pub fn tls_enabled(&self) -> bool {
        !self.tls.cert_file.is_empty() && !self.tls.key_file.is_empty()
    }

    /// Convert the protocol settings into a `ProtocolConfig`, clamping
    /// values that would stall or starve a connection.
    pub fn to_protocol_config(&self) -> ProtocolConfig {
        let p = &self.protocol;
        let ms = |value: u64| Duration::from_millis(value.max(100));
        let token_min = self.pairing.token_min_length.max(1);
        let token_max = self.pairing.token_max_length.max(token_min);

        let mut config = ProtocolConfig::default().with_ping_interval(ms(p.ping_interval_ms));
        config.event_timeout = ms(p.event_timeout_ms);
        config.auth_timeout = ms(p.auth_timeout_ms);
        config.retry_delay = ms(p.retry_delay_ms);
        config.line_queue_capacity = p.line_queue_capacity.max(1);
        config.max_line_length = p.max_line_length.max(64);
        config.worker_threads = p.worker_threads.max(1);
        config.token_length = token_min..=token_max;
        config
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ReceiverConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("control_port"));
        assert!(text.contains("ping_interval_ms"));
    }

    #[test]
    fn roundtrip_config() {
        let mut cfg = ReceiverConfig::default();
        cfg.streams.push(StreamConfig {
            event_type: "volume".into(),
            channels: vec!["master".into()],
        });
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ReceiverConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.control_port, 6466);
        assert_eq!(parsed.streams.len(), 1);
        assert_eq!(parsed.streams[0].channels, vec!["master".to_string()]);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let parsed: ReceiverConfig = toml::from_str("[network]\ncontrol_port = 9000\n").unwrap();
        assert_eq!(parsed.network.control_port, 9000);
        assert_eq!(parsed.network.max_connections, 8);
        assert_eq!(parsed.protocol.ping_interval_ms, 5000);
        assert!(!parsed.tls_enabled());
    }

    #[test]
    fn to_protocol_config_clamps() {
        let mut cfg = ReceiverConfig::default();
        cfg.protocol.ping_interval_ms = 0;
        cfg.protocol.worker_threads = 0;
        cfg.pairing.token_min_length = 10;
        cfg.pairing.token_max_length = 5;

        let config = cfg.to_protocol_config();
        assert_eq!(config.ping_interval, Duration::from_millis(100));
        assert_eq!(config.keepalive_timeout, Duration::from_millis(200));
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.token_length, 10..=10);
    }
}
