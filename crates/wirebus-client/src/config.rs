//! Tunables for the client's connection state machine.

use std::time::Duration;

/// Timing and retry settings for an [`EventClient`](crate::EventClient).
///
/// The defaults match the protocol's reference behaviour; tests shrink the
/// intervals to exercise reconnects quickly.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Delay between TCP connect attempts while (re)connecting.
    pub reconnect_interval: Duration,
    /// How long to wait for the broker to answer the handshake probe before
    /// declaring the peer unverified.
    pub handshake_timeout: Duration,
    /// Interval between heartbeat frames once connected.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat send failures that trigger a reconnect.
    pub max_heartbeat_failures: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(5),
            max_heartbeat_failures: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals_match_protocol_reference() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.reconnect_interval, Duration::from_secs(3));
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(3));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_heartbeat_failures, 3);
    }
}
