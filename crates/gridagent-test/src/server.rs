//! TestServer: in-process server harness.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gridagent_protocol::{AgentId, BusEvent, ProtocolError, SharedSecret};
use gridagent_server::{
    BusError, BusMessage, MemoryBus, Registry, Server, ServerConfig, ServerError,
};
use gridagent_telemetry::{prometheus, MetricsRegistry};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::agent::TestAgent;

/// Shared secret every test server and agent uses.
pub const TEST_SECRET: &[u8] = b"gridagent-test-secret";

/// How long harness helpers wait before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from harness operations.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("server failed to start: {0}")]
    StartupFailed(String),
}

/// A server running inside the test process.
///
/// Listens on an ephemeral loopback port, talks to an in-memory bus and has
/// periodic polling and time sync switched off unless a test turns them on.
pub struct TestServer {
    addr: SocketAddr,
    bus: MemoryBus,
    registry: Arc<Registry>,
    metrics: Arc<MetricsRegistry>,
    secret: SharedSecret,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), ServerError>>>,
    software_dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Result<Self, TestError> {
        Self::with_config(|config| config).await
    }

    /// Start with the harness defaults adjusted by `configure`.
    pub async fn with_config(
        configure: impl FnOnce(ServerConfig) -> ServerConfig,
    ) -> Result<Self, TestError> {
        let software_dir = TempDir::new()?;
        let secret = SharedSecret::new(TEST_SECRET.to_vec())?;
        let config = ServerConfig::new(secret.clone())
            .with_listen(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_bus_url("memory://")
            .with_poll_interval(None)
            .with_time_sync_interval(None)
            .with_shutdown_drain_timeout(Duration::from_secs(1))
            .with_software_dir(software_dir.path());
        let config = configure(config);

        let bus = MemoryBus::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let server = Server::bind(
            config,
            gridagent_server::BusClient::Memory(bus.clone()),
            Arc::clone(&metrics),
        )
        .await?;
        let addr = server.local_addr()?;
        let registry = server.registry();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.run(shutdown));

        let test_server = TestServer {
            addr,
            bus,
            registry,
            metrics,
            secret,
            stop,
            task: Some(task),
            software_dir,
        };

        // the bridge holds two subscriptions once it is ready for commands
        let bus = test_server.bus.clone();
        test_server
            .wait_until("bus bridge", || bus.subscriber_count() >= 2)
            .await
            .map_err(|_| TestError::StartupFailed("bus bridge never subscribed".to_string()))?;
        Ok(test_server)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    /// Directory the server loads firmware images from.
    pub fn software_dir(&self) -> &Path {
        self.software_dir.path()
    }

    /// Connect a simulated agent and wait until the server registers it.
    pub async fn connect_agent(&self, agent: AgentId, version: u32) -> Result<TestAgent, TestError> {
        let before = self.session_id(agent);
        let test_agent = TestAgent::connect(self.addr, &self.secret, agent, version).await?;
        self.wait_until("agent registration", || {
            self.session_id(agent).is_some_and(|id| Some(id) != before)
        })
        .await?;
        Ok(test_agent)
    }

    /// Id of the session currently registered for `agent`.
    pub fn session_id(&self, agent: AgentId) -> Option<u64> {
        self.registry.get(agent).map(|handle| handle.session_id())
    }

    pub fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        self.bus.subscribe(pattern)
    }

    /// Publish a JSON command on `subject`.
    pub fn publish(&self, subject: &str, payload: &serde_json::Value) -> Result<(), TestError> {
        self.bus
            .publish(subject, None, serde_json::to_vec(payload)?.into())?;
        Ok(())
    }

    /// Prometheus text for the server's metrics.
    pub fn metrics_text(&self) -> String {
        prometheus::render_metrics(&self.metrics)
    }

    /// Current value of one sample, `None` if it was never recorded.
    pub fn metric(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        prometheus::sample_value(&self.metrics_text(), name, labels)
    }

    /// Poll `condition` until it holds or [`DEFAULT_TIMEOUT`] passes.
    pub async fn wait_until(
        &self,
        what: &'static str,
        condition: impl Fn() -> bool,
    ) -> Result<(), TestError> {
        tokio::time::timeout(DEFAULT_TIMEOUT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| TestError::Timeout(what))
    }

    /// Stop accepting, close every session and wait for the server to exit.
    pub async fn shutdown(mut self) -> Result<(), TestError> {
        let _ = self.stop.send(true);
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(DEFAULT_TIMEOUT, task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(TestError::StartupFailed(format!("server task failed: {e}"))),
            Err(_) => Err(TestError::Timeout("server shutdown")),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Next bus event on `rx`, skipping commands.
pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<BusMessage>,
) -> Result<(String, BusEvent), TestError> {
    tokio::time::timeout(DEFAULT_TIMEOUT, async {
        while let Some(message) = rx.recv().await {
            let value: serde_json::Value = serde_json::from_slice(&message.payload)?;
            if value.get("event").is_some() {
                return Ok((message.subject, serde_json::from_value(value)?));
            }
        }
        Err(TestError::Timeout("bus event"))
    })
    .await
    .map_err(|_| TestError::Timeout("bus event"))?
}
