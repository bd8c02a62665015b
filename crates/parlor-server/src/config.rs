use std::time::Duration;

/// Transport and scheduling settings. Room behaviour lives in
/// [`parlor_core::RoomConfig`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// Capacity of the inbound event channel shared by all connections.
    pub inbound_queue: usize,
    /// How often `getStatus` is sent to every connection.
    pub heartbeat_interval: Duration,
    /// Connections silent for this long are reaped.
    pub client_timeout: Duration,
    /// How often pending end-of-playback confirmations are re-checked.
    pub advance_poll_interval: Duration,
    /// Force a pending advance after this long. `None` waits indefinitely.
    pub advance_timeout: Option<Duration>,
    /// Grace period for background tasks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            max_send_queue: 256,
            inbound_queue: 1024,
            heartbeat_interval: Duration::from_secs(15),
            client_timeout: Duration::from_secs(45),
            advance_poll_interval: Duration::from_secs(1),
            advance_timeout: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 9091);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.client_timeout, Duration::from_secs(45));
        assert_eq!(cfg.advance_poll_interval, Duration::from_secs(1));
        assert!(cfg.advance_timeout.is_none());
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9091");
    }
}
