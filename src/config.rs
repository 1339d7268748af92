use std::net::SocketAddr;
use std::time::Duration;

/// Default port the relay listens on.
pub const DEFAULT_PORT: u16 = 19988;

/// Standard timeout for forwarded commands in MS
pub const REQUEST_TIMEOUT: u64 = 30_000;

/// Timeout for the initial tab created during `Target.setAutoAttach` in MS
pub const BOOTSTRAP_TIMEOUT: u64 = 10_000;

/// Interval of the `ping` heartbeat in MS
pub const KEEPALIVE_INTERVAL: u64 = 5_000;

/// How often the extension retries connecting to the relay in MS
pub const RETRY_INTERVAL: u64 = 3_000;

/// Session ids minted by the extension start with this
pub const SESSION_PREFIX: &str = "nutbot-tab-";

/// Lower bound of every periodic interval, a zero period never yields
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// How the relay hub is configured
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub host: String,
    /// Port to bind to, `0` picks a free one.
    pub port: u16,
    /// Bound for every command forwarded to the extension.
    pub request_timeout: Duration,
    /// Bound for the initial tab bootstrap.
    pub bootstrap_timeout: Duration,
    /// Heartbeat interval towards the extension and the control clients.
    pub keepalive_interval: Duration,
    /// How often timed out requests are evicted.
    pub evict_interval: Duration,
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// The address the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfigBuilder::default().build()
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfigBuilder {
    host: String,
    port: u16,
    request_timeout: Duration,
    bootstrap_timeout: Duration,
    keepalive_interval: Duration,
    evict_interval: Option<Duration>,
}

impl Default for RelayConfigBuilder {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
            bootstrap_timeout: Duration::from_millis(BOOTSTRAP_TIMEOUT),
            keepalive_interval: Duration::from_millis(KEEPALIVE_INTERVAL),
            evict_interval: None,
        }
    }
}

impl RelayConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn evict_interval(mut self, interval: Duration) -> Self {
        self.evict_interval = Some(interval.max(MIN_INTERVAL));
        self
    }

    pub fn build(self) -> RelayConfig {
        // evict often enough that the shortest timeout is honored within ~10%
        let evict_interval = self.evict_interval.unwrap_or_else(|| {
            (self.request_timeout.min(self.bootstrap_timeout) / 10)
                .clamp(Duration::from_millis(10), Duration::from_secs(1))
        });
        RelayConfig {
            host: self.host,
            port: self.port,
            request_timeout: self.request_timeout,
            bootstrap_timeout: self.bootstrap_timeout,
            keepalive_interval: self.keepalive_interval,
            evict_interval,
        }
    }
}

/// How the extension peer reaches the relay
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Websocket endpoint of the relay, `ws://host:port/extension`
    pub relay_url: String,
    /// `GET` endpoint polled while the extension slot is busy
    pub status_url: String,
    pub retry_interval: Duration,
    pub keepalive_interval: Duration,
    pub status_poll_interval: Duration,
    /// Bound for a single native debugger call.
    pub request_timeout: Duration,
    pub session_prefix: String,
}

impl PeerConfig {
    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::default()
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfigBuilder::default().build()
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfigBuilder {
    relay: SocketAddr,
    retry_interval: Duration,
    keepalive_interval: Duration,
    status_poll_interval: Duration,
    request_timeout: Duration,
    session_prefix: String,
}

impl Default for PeerConfigBuilder {
    fn default() -> Self {
        Self {
            relay: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            retry_interval: Duration::from_millis(RETRY_INTERVAL),
            keepalive_interval: Duration::from_millis(KEEPALIVE_INTERVAL),
            status_poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
            session_prefix: SESSION_PREFIX.to_string(),
        }
    }
}

impl PeerConfigBuilder {
    pub fn relay(mut self, addr: SocketAddr) -> Self {
        self.relay = addr;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn session_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.session_prefix = prefix.into();
        self
    }

    pub fn build(self) -> PeerConfig {
        PeerConfig {
            relay_url: format!("ws://{}/extension", self.relay),
            status_url: format!("http://{}/extension/status", self.relay),
            retry_interval: self.retry_interval,
            keepalive_interval: self.keepalive_interval,
            status_poll_interval: self.status_poll_interval,
            request_timeout: self.request_timeout,
            session_prefix: self.session_prefix,
        }
    }
}
