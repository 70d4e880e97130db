//! Logging options, filled from `--log-level` and `--log-format`.

/// How log lines are written to stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    /// Multi-line text with file and line numbers.
    Pretty,
}

impl LogFormat {
    /// Case-insensitive; `None` for anything but `json` or `pretty`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs (default: "gridagentserver").
    pub service_name: String,

    /// Log level filter (default: "info"). `RUST_LOG` takes precedence.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "gridagentserver".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Any `EnvFilter` directive, e.g. `gridagent_server=debug,info`.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parse_ignores_case() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("Pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("PRETTY"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("text"), None);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = TelemetryConfig::new()
            .with_service_name("gas-staging")
            .with_log_level("gridagent_server=trace")
            .with_log_format(LogFormat::Pretty);

        assert_eq!(config.service_name, "gas-staging");
        assert_eq!(config.log_level, "gridagent_server=trace");
        assert_eq!(config.log_format, LogFormat::Pretty);
    }
}
