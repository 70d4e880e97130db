//! TCP listener and server lifecycle.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use gridagent_telemetry::{log_listening, log_shutdown, MetricsRegistry};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::bridge::Bridge;
use crate::bus::BusClient;
use crate::config::ServerConfig;
use crate::error::{CloseReason, ServerError, SessionError};
use crate::http::serve_metrics;
use crate::registry::Registry;
use crate::session::{run_session, SessionContext};
use crate::software::SoftwareStore;

/// A bound server, ready to accept agents.
pub struct Server {
    ctx: SessionContext,
    listener: TcpListener,
    metrics_listener: Option<TcpListener>,
}

impl Server {
    /// Validate `config` and bind its listeners.
    pub async fn bind(
        config: ServerConfig,
        bus: BusClient,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = bind(config.listen).await?;
        let metrics_listener = match config.metrics_listen {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };

        Ok(Self {
            ctx: SessionContext {
                config: Arc::new(config),
                registry: Arc::new(Registry::new()),
                bus,
                metrics,
            },
            listener,
            metrics_listener,
        })
    }

    /// Address agents connect to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Accept agents until `shutdown` turns true, then close every session.
    ///
    /// Sessions get `shutdown_drain_timeout` to flush their queues before
    /// their tasks are aborted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let Server {
            ctx,
            listener,
            metrics_listener,
        } = self;
        let config = Arc::clone(&ctx.config);

        let bridge = Bridge::new(
            Arc::clone(&ctx.registry),
            ctx.bus.clone(),
            SoftwareStore::new(config.software_dir.clone()),
            Arc::clone(&ctx.metrics),
            config.delivery_timeout,
        )
        .start(shutdown.clone())
        .await?;

        let metrics_task = metrics_listener.map(|listener| {
            if let Ok(addr) = listener.local_addr() {
                log_listening!(addr = %addr, listener = "metrics", "metrics endpoint listening");
            }
            tokio::spawn(serve_metrics(
                listener,
                Arc::clone(&ctx.metrics),
                shutdown.clone(),
            ))
        });

        if let Ok(addr) = listener.local_addr() {
            log_listening!(
                addr = %addr,
                listener = "agents",
                max_protocol_version = config.max_protocol_version,
                "accepting agents"
            );
        }

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(serve_agent(stream, peer, ctx.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!(error = %e, "session task failed");
                    }
                }
            }
        }

        drop(listener);
        let closing = ctx.registry.close_all(CloseReason::Shutdown);
        log_shutdown!(sessions = closing, "closing agent sessions");

        let drained = tokio::time::timeout(config.shutdown_drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.len(),
                "sessions did not drain in time, aborting"
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        match bridge.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "bus bridge ended with error"),
            Err(e) => tracing::error!(error = %e, "bus bridge task failed"),
        }
        if let Some(task) = metrics_task {
            task.abort();
        }
        if let Err(e) = ctx.bus.flush().await {
            tracing::warn!(error = %e, "failed to flush bus");
        }
        Ok(())
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

async fn serve_agent(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    match run_session(reader, writer, Some(peer), ctx).await {
        Ok(reason) => tracing::debug!(peer = %peer, reason = %reason, "connection finished"),
        Err(SessionError::Handshake(e)) => {
            tracing::warn!(peer = %peer, error = %e, "handshake failed");
        }
        Err(e) => tracing::warn!(peer = %peer, kind = e.kind(), error = %e, "connection failed"),
    }
}
