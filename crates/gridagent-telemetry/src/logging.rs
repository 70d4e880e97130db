//! Structured logging with JSON output.
//!
//! Every session runs inside a `session` span carrying `agent` and `peer`,
//! so JSON lines emitted from a session can be grouped per agent.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `config.log_level` when it is set.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let layer = match config.log_format {
        // one flat object per line; the session span rides along as `span`
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

/// Standard log event names.
pub mod events {
    /// Server is starting up.
    pub const STARTUP: &str = "startup";

    /// Server is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// A listener is bound.
    pub const LISTENING: &str = "listening";

    /// An agent completed the handshake and was registered.
    pub const AGENT_CONNECTED: &str = "agent_connected";

    /// An agent session ended.
    pub const AGENT_DISCONNECTED: &str = "agent_disconnected";

    /// A newer session for the same agent replaced an older one.
    pub const AGENT_DISPLACED: &str = "agent_displaced";

    /// A frame could not be decoded or violated the protocol.
    pub const PROTOCOL_ERROR: &str = "protocol_error";

    /// An outbound message was dropped before reaching the agent.
    pub const DELIVERY_DROPPED: &str = "delivery_dropped";

    /// Publishing to or consuming from the bus failed.
    pub const BUS_ERROR: &str = "bus_error";
}

/// Each macro fills in `event`; callers pass the remaining fields and message.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_agent_connected {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::AGENT_CONNECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_agent_disconnected {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::AGENT_DISCONNECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_agent_displaced {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::AGENT_DISPLACED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_protocol_error {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::PROTOCOL_ERROR,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_delivery_dropped {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::DELIVERY_DROPPED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_bus_error {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::BUS_ERROR,
            $($field)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_distinct() {
        let names = [
            events::STARTUP,
            events::SHUTDOWN,
            events::LISTENING,
            events::AGENT_CONNECTED,
            events::AGENT_DISCONNECTED,
            events::AGENT_DISPLACED,
            events::PROTOCOL_ERROR,
            events::DELIVERY_DROPPED,
            events::BUS_ERROR,
        ];
        let mut sorted = names.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len());
    }
}
