use std::{fmt::Display, time::Duration};

use crate::error::ConfigError;

/// Per-client inbound capacity used when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 256;
pub const DEFAULT_MAX_CLIENTS: usize = 4;
pub const DEFAULT_OUTBOUND_LIMIT: usize = 64 * 1024;
pub const DEFAULT_RX_BURST: usize = 256;
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

/// Immutable bridge configuration. Create one with [`Builder`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BridgeConfig {
    pub port: u16,
    /// Capacity of each client's inbound buffer in bytes.
    pub buffer_size: usize,
    /// Clients without activity for longer than this are evicted.
    /// [`Duration::ZERO`] disables eviction.
    pub client_timeout: Duration,
    /// Time between asserting transmit-enable and the first byte.
    pub tx_enable_delay: Duration,
    /// Time between the last bit leaving the wire and releasing transmit-enable.
    pub tx_disable_delay: Duration,
    pub max_clients: usize,
    /// Upper bound on bytes queued for a single client that reads too slowly.
    pub outbound_limit: usize,
    /// Upper bound on bytes drained from the UART per scheduling pass.
    pub rx_burst: usize,
    /// Period of the scheduling pass.
    pub tick: Duration,
}

impl Display for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "RS485 Stream Bridge:")?;
        writeln!(f, "  TCP Port: {}", self.port)?;
        writeln!(f, "  TX Enable Delay: {}us", self.tx_enable_delay.as_micros())?;
        writeln!(f, "  TX Disable Delay: {}us", self.tx_disable_delay.as_micros())?;
        writeln!(f, "  Client Inbound Buffer Size: {} bytes", self.buffer_size)?;
        writeln!(f, "  Client Outbound Limit: {} bytes", self.outbound_limit)?;
        writeln!(f, "  UART RX Burst: {} bytes", self.rx_burst)?;
        writeln!(f, "  Max Clients: {}", self.max_clients)?;
        if self.client_timeout.is_zero() {
            write!(f, "  Client Inactivity Timeout: disabled")
        } else {
            write!(
                f,
                "  Client Inactivity Timeout: {}ms",
                self.client_timeout.as_millis()
            )
        }
    }
}

/// Builder to create a [BridgeConfig] and modify configuration options.
///
/// The listen port and the client timeout have no sensible universal default and are
/// therefore required up front.
///
/// # Example
///
/// ```
/// use rs485_bridge::config::Builder;
/// use std::time::Duration;
///
/// let config = Builder::new(8080, Duration::from_secs(30))
///     .buffer_size(128)
///     .tx_enable_delay(Duration::from_micros(20))
///     .build()
///     .expect("valid configuration");
/// assert_eq!(config.buffer_size, 128);
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    config: BridgeConfig,
}

impl Builder {
    pub fn new(port: u16, client_timeout: Duration) -> Builder {
        Builder {
            config: BridgeConfig {
                port,
                buffer_size: DEFAULT_BUFFER_SIZE,
                client_timeout,
                tx_enable_delay: Duration::ZERO,
                tx_disable_delay: Duration::ZERO,
                max_clients: DEFAULT_MAX_CLIENTS,
                outbound_limit: DEFAULT_OUTBOUND_LIMIT,
                rx_burst: DEFAULT_RX_BURST,
                tick: DEFAULT_TICK,
            },
        }
    }

    /// Set the inbound buffer capacity of every client.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn tx_enable_delay(mut self, delay: Duration) -> Self {
        self.config.tx_enable_delay = delay;
        self
    }

    pub fn tx_disable_delay(mut self, delay: Duration) -> Self {
        self.config.tx_disable_delay = delay;
        self
    }

    /// Set the number of clients that may be connected at the same time.
    pub fn max_clients(mut self, count: usize) -> Self {
        self.config.max_clients = count;
        self
    }

    pub fn outbound_limit(mut self, bytes: usize) -> Self {
        self.config.outbound_limit = bytes;
        self
    }

    pub fn rx_burst(mut self, bytes: usize) -> Self {
        self.config.rx_burst = bytes;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.config.tick = tick;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<BridgeConfig, ConfigError> {
        let config = self.config;
        if config.buffer_size == 0 {
            return Err(ConfigError::ZeroValue("buffer_size"));
        }
        if config.max_clients == 0 {
            return Err(ConfigError::ZeroValue("max_clients"));
        }
        if config.outbound_limit == 0 {
            return Err(ConfigError::ZeroValue("outbound_limit"));
        }
        if config.rx_burst == 0 {
            return Err(ConfigError::ZeroValue("rx_burst"));
        }
        if config.tick.is_zero() {
            return Err(ConfigError::ZeroValue("tick"));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Builder::new(8080, Duration::from_secs(30)).build().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.client_timeout, Duration::from_secs(30));
        assert_eq!(config.tx_enable_delay, Duration::ZERO);
        assert_eq!(config.tx_disable_delay, Duration::ZERO);
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
    }

    #[test]
    fn rejects_zero_buffer() {
        match Builder::new(1, Duration::ZERO).buffer_size(0).build() {
            Err(ConfigError::ZeroValue(name)) => assert_eq!(name, "buffer_size"),
            other => panic!("expected ZeroValue, got {:?}", other),
        }
    }

    #[test]
    fn rejects_zero_clients() {
        assert!(matches!(
            Builder::new(1, Duration::ZERO).max_clients(0).build(),
            Err(ConfigError::ZeroValue("max_clients"))
        ));
    }

    #[test]
    fn display_reports_disabled_timeout() {
        let config = Builder::new(502, Duration::ZERO).build().unwrap();
        let text = config.to_string();
        assert!(text.contains("TCP Port: 502"));
        assert!(text.contains("Client Inactivity Timeout: disabled"));
    }
}
