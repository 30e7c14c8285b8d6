//! Protocol timing and sizing knobs shared by every connection.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_LINE_LENGTH;

/// Configuration for [`RemoteConnection`](crate::remote::RemoteConnection)
/// and the components it drives.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Idle interval after which the output loop writes `PING`.
    pub ping_interval: Duration,
    /// Silence after which the peer is considered dead.
    pub keepalive_timeout: Duration,
    /// Deadline for an outbound event's response.
    pub event_timeout: Duration,
    /// Deadline for each handshake / authentication line.
    pub auth_timeout: Duration,
    /// Capacity of the inbound line queue (backpressure point).
    pub line_queue_capacity: usize,
    /// Longest accepted line, terminator excluded.
    pub max_line_length: usize,
    /// Delay before a failed state broadcast is retried.
    pub retry_delay: Duration,
    /// Bounds for the length of issued auth tokens.
    pub token_length: RangeInclusive<usize>,
    /// Concurrent handler executions across all connections.
    pub worker_threads: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let ping_interval = Duration::from_secs(5);
        Self {
            ping_interval,
            keepalive_timeout: ping_interval * 2,
            event_timeout: Duration::from_millis(5000),
            auth_timeout: Duration::from_secs(10),
            line_queue_capacity: 64,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            retry_delay: Duration::from_secs(1),
            token_length: 24..=48,
            worker_threads: 8,
        }
    }
}

impl ProtocolConfig {
    /// Set the ping interval and derive the keepalive timeout (2×).
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self.keepalive_timeout = interval * 2;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_is_twice_ping() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.keepalive_timeout, cfg.ping_interval * 2);

        let cfg = ProtocolConfig::default().with_ping_interval(Duration::from_millis(40));
        assert_eq!(cfg.keepalive_timeout, Duration::from_millis(80));
    }
}
