//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use gridagent_protocol::{SharedSecret, DEFAULT_MAX_FRAME_LENGTH, HEADER_LEN, SERVER_MAX_PROTOCOL_VERSION};
use thiserror::Error;

/// Default agent listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:30001";

/// Default bus URL.
pub const DEFAULT_BUS_URL: &str = "nats://127.0.0.1:4222";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max protocol version {0} outside 1..={max}", max = SERVER_MAX_PROTOCOL_VERSION)]
    ProtocolVersion(u32),

    #[error("max frame length {0} is smaller than a frame header")]
    FrameLength(u32),

    #[error("outbound queue capacity must be at least 1")]
    QueueCapacity,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("invalid address {0:?}")]
    Address(String),
}

/// Configuration for the agent server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address agents connect to.
    pub listen: SocketAddr,

    /// Key material for per-session cipher derivation.
    pub secret: SharedSecret,

    /// Bus URL (default: "nats://127.0.0.1:4222").
    pub bus_url: String,

    /// Highest protocol version offered in the handshake.
    pub max_protocol_version: u32,

    /// Cap on a frame's declared length.
    pub max_frame_length: u32,

    pub handshake_timeout: Duration,

    /// Close a session after this long without an inbound frame.
    pub idle_timeout: Duration,

    /// Close a session when a single frame write takes longer than this.
    pub write_timeout: Duration,

    /// How long shutdown waits for sessions to finish.
    pub shutdown_drain_timeout: Duration,

    /// How long a blocking delivery waits for room in an outbound queue.
    pub delivery_timeout: Duration,

    pub outbound_queue_capacity: usize,

    /// Measurement poll period. `None` disables polling.
    pub poll_interval: Option<Duration>,

    /// Delay before the first poll of a session.
    pub poll_start_delay: Duration,

    /// Clock push period. `None` disables periodic time sync.
    pub time_sync_interval: Option<Duration>,

    /// Largest agent clock offset answered with `CommandGaPropagateTime`
    /// rather than a fresh `ConfigGaTime`.
    pub time_sync_tolerance: Duration,

    /// Directory holding firmware images.
    pub software_dir: PathBuf,

    /// Address of the Prometheus endpoint, if enabled.
    pub metrics_listen: Option<SocketAddr>,
}

impl ServerConfig {
    /// Create a config with default values and the given secret.
    pub fn new(secret: SharedSecret) -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 30001)),
            secret,
            bus_url: DEFAULT_BUS_URL.to_string(),
            max_protocol_version: SERVER_MAX_PROTOCOL_VERSION,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(10),
            shutdown_drain_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(5),
            outbound_queue_capacity: 32,
            poll_interval: Some(Duration::from_secs(60)),
            poll_start_delay: Duration::from_secs(15),
            time_sync_interval: Some(Duration::from_secs(24 * 60 * 60)),
            time_sync_tolerance: Duration::from_secs(15),
            software_dir: PathBuf::from("sw"),
            metrics_listen: None,
        }
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_bus_url(mut self, url: impl Into<String>) -> Self {
        self.bus_url = url.into();
        self
    }

    pub fn with_max_protocol_version(mut self, version: u32) -> Self {
        self.max_protocol_version = version;
        self
    }

    pub fn with_max_frame_length(mut self, length: u32) -> Self {
        self.max_frame_length = length;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_shutdown_drain_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_drain_timeout = timeout;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Set the poll period; `None` disables polling.
    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_start_delay(mut self, delay: Duration) -> Self {
        self.poll_start_delay = delay;
        self
    }

    /// Set the time-sync period; `None` disables periodic time sync.
    pub fn with_time_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.time_sync_interval = interval;
        self
    }

    pub fn with_time_sync_tolerance(mut self, tolerance: Duration) -> Self {
        self.time_sync_tolerance = tolerance;
        self
    }

    pub fn with_software_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.software_dir = dir.into();
        self
    }

    pub fn with_metrics_listen(mut self, addr: Option<SocketAddr>) -> Self {
        self.metrics_listen = addr;
        self
    }

    /// Check values that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=SERVER_MAX_PROTOCOL_VERSION).contains(&self.max_protocol_version) {
            return Err(ConfigError::ProtocolVersion(self.max_protocol_version));
        }
        if (self.max_frame_length as usize) < HEADER_LEN {
            return Err(ConfigError::FrameLength(self.max_frame_length));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::QueueCapacity);
        }
        let durations = [
            ("handshake timeout", Some(self.handshake_timeout)),
            ("idle timeout", Some(self.idle_timeout)),
            ("write timeout", Some(self.write_timeout)),
            ("delivery timeout", Some(self.delivery_timeout)),
            ("poll interval", self.poll_interval),
            ("time sync interval", self.time_sync_interval),
        ];
        for (name, duration) in durations {
            if duration.is_some_and(|d| d.is_zero()) {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }
}

/// Parse a socket address, reporting the offending text on failure.
pub fn parse_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Address(value.to_string()))
}

/// Seconds to an optional duration, where zero means disabled.
pub fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
