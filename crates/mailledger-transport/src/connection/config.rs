//! Connection configuration types.

use std::sync::Arc;
use std::time::Duration;

/// Default size of a single read from the input channel.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;

/// Default number of reads a single drain may perform.
pub const DEFAULT_MAX_READS_PER_DRAIN: usize = 64;

/// Default capacity of each event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// No encryption. **Not recommended for production.**
    None,
    /// TLS from the start. **Recommended.**
    #[default]
    Implicit,
}

impl Security {
    /// Maps a "use TLS" flag to a security mode.
    #[must_use]
    pub const fn from_tls(use_tls: bool) -> Self {
        if use_tls { Self::Implicit } else { Self::None }
    }

    /// Returns the default IMAP port for this security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None => 143,
            Self::Implicit => 993,
        }
    }

    /// Returns true if the mode negotiates TLS.
    #[must_use]
    pub const fn is_tls(self) -> bool {
        matches!(self, Self::Implicit)
    }
}

/// Endpoint configuration for one connect request.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Time allowed for TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
}

impl Config {
    /// Creates a new configuration with implicit TLS on port 993.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self::builder(host).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }
}

/// Builder for endpoint configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    host: String,
    port: Option<u16>,
    security: Security,
    connect_timeout: Duration,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            security: Security::Implicit,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            host: self.host,
            port: self.port.unwrap_or_else(|| self.security.default_port()),
            security: self.security,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Settings shared by every session of one [`Connection`](crate::Connection).
///
/// These are fixed when the connection object is created.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bytes requested from the input channel per read.
    pub read_chunk_size: usize,
    /// Upper bound on reads per readiness notification. Anything still
    /// buffered in the socket is picked up by the next notification.
    pub max_reads_per_drain: usize,
    /// Capacity of each broadcast channel. Subscribers that fall further
    /// behind observe `RecvError::Lagged`.
    pub event_capacity: usize,
    /// TLS client configuration. `None` uses the bundled webpki roots.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl TransportConfig {
    /// Sets the read chunk size.
    #[must_use]
    pub const fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Sets the per-drain read cap.
    #[must_use]
    pub const fn max_reads_per_drain(mut self, reads: usize) -> Self {
        self.max_reads_per_drain = reads;
        self
    }

    /// Sets the broadcast channel capacity.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Uses a custom TLS client configuration (private CA, pinned roots).
    #[must_use]
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_reads_per_drain: DEFAULT_MAX_READS_PER_DRAIN,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            tls: None,
        }
    }
}
