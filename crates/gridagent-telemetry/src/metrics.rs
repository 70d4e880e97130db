//! Prometheus metrics registry.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Frame size histogram buckets (in bytes).
/// Covers a bare header up to a multi-megabyte firmware image.
const FRAME_SIZE_BUCKETS: [f64; 7] = [8.0, 64.0, 512.0, 4096.0, 32768.0, 262144.0, 4194304.0];

/// Per message type labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabels {
    pub message: String,
}

/// Protocol error labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorKindLabels {
    pub kind: String,
}

/// Delivery drop labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    pub reason: String,
}

/// Metrics registry holding all server metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    // Session metrics
    pub active_sessions: Gauge,
    pub sessions_total: Counter,
    pub sessions_displaced_total: Counter,
    pub handshake_failures_total: Counter,

    // Frame metrics
    pub frames_received_total: Family<MessageLabels, Counter>,
    pub frames_sent_total: Family<MessageLabels, Counter>,
    pub frame_size_bytes: Family<MessageLabels, Histogram>,

    // Error metrics
    pub protocol_errors_total: Family<ErrorKindLabels, Counter>,
    pub deliveries_dropped_total: Family<DropLabels, Counter>,
    pub bus_publish_failures_total: Counter,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // Session metrics
        let active_sessions = Gauge::default();
        registry.register(
            "gas_active_sessions",
            "Number of currently registered agent sessions",
            active_sessions.clone(),
        );

        let sessions_total = Counter::default();
        registry.register(
            "gas_sessions",
            "Total number of agent sessions established",
            sessions_total.clone(),
        );

        let sessions_displaced_total = Counter::default();
        registry.register(
            "gas_sessions_displaced",
            "Total number of sessions replaced by a newer session for the same agent",
            sessions_displaced_total.clone(),
        );

        let handshake_failures_total = Counter::default();
        registry.register(
            "gas_handshake_failures",
            "Total number of connections that failed the handshake",
            handshake_failures_total.clone(),
        );

        // Frame metrics
        let frames_received_total = Family::<MessageLabels, Counter>::default();
        registry.register(
            "gas_frames_received",
            "Total number of frames decoded from agents",
            frames_received_total.clone(),
        );

        let frames_sent_total = Family::<MessageLabels, Counter>::default();
        registry.register(
            "gas_frames_sent",
            "Total number of frames written to agents",
            frames_sent_total.clone(),
        );

        let frame_size_bytes = Family::<MessageLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(FRAME_SIZE_BUCKETS.iter().cloned())
        });
        registry.register(
            "gas_frame_size_bytes",
            "Size of frames written to agents, header included",
            frame_size_bytes.clone(),
        );

        // Error metrics
        let protocol_errors_total = Family::<ErrorKindLabels, Counter>::default();
        registry.register(
            "gas_protocol_errors",
            "Total number of sessions closed by a protocol error",
            protocol_errors_total.clone(),
        );

        let deliveries_dropped_total = Family::<DropLabels, Counter>::default();
        registry.register(
            "gas_deliveries_dropped",
            "Total number of outbound messages dropped before reaching an agent",
            deliveries_dropped_total.clone(),
        );

        let bus_publish_failures_total = Counter::default();
        registry.register(
            "gas_bus_publish_failures",
            "Total number of events that could not be published to the bus",
            bus_publish_failures_total.clone(),
        );

        Self {
            registry,
            active_sessions,
            sessions_total,
            sessions_displaced_total,
            handshake_failures_total,
            frames_received_total,
            frames_sent_total,
            frame_size_bytes,
            protocol_errors_total,
            deliveries_dropped_total,
            bus_publish_failures_total,
        }
    }

    /// Record a newly registered session.
    pub fn session_opened(&self, displaced_existing: bool) {
        self.active_sessions.inc();
        self.sessions_total.inc();
        if displaced_existing {
            self.sessions_displaced_total.inc();
        }
    }

    /// Record a session leaving the registry.
    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    /// Record a failed handshake.
    pub fn record_handshake_failure(&self) {
        self.handshake_failures_total.inc();
    }

    /// Record an inbound frame.
    pub fn record_frame_received(&self, message: &str) {
        let labels = MessageLabels {
            message: message.to_string(),
        };
        self.frames_received_total.get_or_create(&labels).inc();
    }

    /// Record an outbound frame and its encoded size.
    pub fn record_frame_sent(&self, message: &str, size: usize) {
        let labels = MessageLabels {
            message: message.to_string(),
        };
        self.frames_sent_total.get_or_create(&labels).inc();
        self.frame_size_bytes
            .get_or_create(&labels)
            .observe(size as f64);
    }

    /// Record a protocol error by kind.
    pub fn record_protocol_error(&self, kind: &str) {
        let labels = ErrorKindLabels {
            kind: kind.to_string(),
        };
        self.protocol_errors_total.get_or_create(&labels).inc();
    }

    /// Record a dropped delivery.
    pub fn record_delivery_dropped(&self, reason: &str) {
        let labels = DropLabels {
            reason: reason.to_string(),
        };
        self.deliveries_dropped_total.get_or_create(&labels).inc();
    }

    /// Record a failed bus publish.
    pub fn record_bus_publish_failure(&self) {
        self.bus_publish_failures_total.inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
