//! Relay tuning

use std::time::Duration;

/// Default UDP session idle timeout
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default period of the idle session reaper
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(120);

/// TCP read buffer per connection (32 KiB)
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 32 * 1024;

/// Largest UDP payload
pub const MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// A UDP session idle for longer than this is evicted
    pub udp_timeout: Duration,

    /// How often the reaper scans for idle sessions
    pub reap_interval: Duration,

    /// TCP read buffer size
    pub tcp_buffer_size: usize,

    /// Datagrams queued per client UDP session while its stream is busy
    pub udp_queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            tcp_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
            udp_queue_depth: 256,
        }
    }
}

impl RelayConfig {
    pub fn with_udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = timeout;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.udp_timeout, Duration::from_secs(120));
        assert_eq!(config.reap_interval, Duration::from_secs(120));
        assert_eq!(config.tcp_buffer_size, 32768);
    }

    #[test]
    fn test_builders() {
        let config = RelayConfig::default()
            .with_udp_timeout(Duration::from_secs(5))
            .with_reap_interval(Duration::from_secs(1));
        assert_eq!(config.udp_timeout, Duration::from_secs(5));
        assert_eq!(config.reap_interval, Duration::from_secs(1));
    }
}
