//! Text exposition of the `gas_*` metrics.
//!
//! The registry encodes OpenMetrics, which ends with a `# EOF` line. Scrapers
//! that only ask for the classic Prometheus text format get the same samples
//! without that terminator.

use crate::MetricsRegistry;
use prometheus_client::encoding::text::encode;

/// Classic Prometheus text format, served when the scraper does not ask for
/// OpenMetrics.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

const EOF_MARKER: &str = "# EOF\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpositionFormat {
    OpenMetrics,
    Text,
}

impl ExpositionFormat {
    /// Pick a format from a request's `Accept` header.
    pub fn negotiate(accept: Option<&str>) -> Self {
        match accept {
            Some(accept) if accept.contains("application/openmetrics-text") => Self::OpenMetrics,
            _ => Self::Text,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::OpenMetrics => OPENMETRICS_CONTENT_TYPE,
            Self::Text => PROMETHEUS_CONTENT_TYPE,
        }
    }
}

/// Render every registered metric as OpenMetrics text.
pub fn render_metrics(registry: &MetricsRegistry) -> String {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry.registry) {
        tracing::warn!(error = %e, "metrics rendering stopped early");
    }
    buffer
}

/// Render in `format`.
pub fn render_as(registry: &MetricsRegistry, format: ExpositionFormat) -> String {
    let mut text = render_metrics(registry);
    if format == ExpositionFormat::Text && text.ends_with(EOF_MARKER) {
        text.truncate(text.len() - EOF_MARKER.len());
    }
    text
}

/// Value of the sample `name{labels}` in rendered text.
///
/// Labels must be given in the order they are rendered. `None` if the sample
/// is absent.
pub fn sample_value(text: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    let mut key = name.to_string();
    if !labels.is_empty() {
        let rendered: Vec<String> = labels
            .iter()
            .map(|(label, value)| format!("{label}=\"{value}\""))
            .collect();
        key.push('{');
        key.push_str(&rendered.join(","));
        key.push('}');
    }

    text.lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let (sample, value) = line.rsplit_once(' ')?;
            (sample == key).then(|| value.parse().ok()).flatten()
        })
}
