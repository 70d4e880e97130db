//! GridAgent server binary.
//!
//! Accepts agent connections and bridges them to the topic bus.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gridagent_protocol::{SharedSecret, DEFAULT_MAX_FRAME_LENGTH, SERVER_MAX_PROTOCOL_VERSION};
use gridagent_server::config::{optional_secs, parse_addr, DEFAULT_BUS_URL, DEFAULT_LISTEN};
use gridagent_server::{BusClient, Server, ServerConfig};
use gridagent_telemetry::{log_shutdown, log_startup, LogFormat, Telemetry, TelemetryConfig};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "gridagentserver", about = "GridAgent server", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agent connections and bridge them to the bus.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address agents connect to.
    #[arg(long, env = "GAS_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Hex-encoded shared secret (at least 8 bytes).
    #[arg(long, env = "GAS_SHARED_SECRET", hide_env_values = true)]
    secret: String,

    /// Bus URL (`nats://...`, or `memory://` for a process-local bus).
    #[arg(long, env = "GAS_BUS_URL", default_value = DEFAULT_BUS_URL)]
    bus_url: String,

    /// Highest protocol version offered to agents.
    #[arg(long, env = "GAS_MAX_PROTOCOL_VERSION", default_value_t = SERVER_MAX_PROTOCOL_VERSION)]
    max_protocol_version: u32,

    /// Largest accepted frame in bytes, header included.
    #[arg(long, env = "GAS_MAX_FRAME_LENGTH", default_value_t = DEFAULT_MAX_FRAME_LENGTH)]
    max_frame_length: u32,

    #[arg(long, env = "GAS_HANDSHAKE_TIMEOUT_SECS", default_value = "30")]
    handshake_timeout_secs: u64,

    /// Close a session after this long without an inbound frame.
    #[arg(long, env = "GAS_IDLE_TIMEOUT_SECS", default_value = "180")]
    idle_timeout_secs: u64,

    #[arg(long, env = "GAS_WRITE_TIMEOUT_SECS", default_value = "10")]
    write_timeout_secs: u64,

    /// How long sessions get to flush their queues on shutdown.
    #[arg(long, env = "GAS_SHUTDOWN_DRAIN_TIMEOUT_SECS", default_value = "5")]
    shutdown_drain_timeout_secs: u64,

    /// How long a bus command waits for room in a session queue.
    #[arg(long, env = "GAS_DELIVERY_TIMEOUT_SECS", default_value = "5")]
    delivery_timeout_secs: u64,

    #[arg(long, env = "GAS_OUTBOUND_QUEUE_CAPACITY", default_value = "32")]
    outbound_queue_capacity: usize,

    /// Measurement poll period; 0 disables polling.
    #[arg(long, env = "GAS_POLL_INTERVAL_SECS", default_value = "60")]
    poll_interval_secs: u64,

    #[arg(long, env = "GAS_POLL_START_DELAY_SECS", default_value = "15")]
    poll_start_delay_secs: u64,

    /// Clock push period; 0 disables time sync.
    #[arg(long, env = "GAS_TIME_SYNC_INTERVAL_SECS", default_value = "86400")]
    time_sync_interval_secs: u64,

    /// Largest agent clock drift answered with a propagate instead of a reset.
    #[arg(long, env = "GAS_TIME_SYNC_TOLERANCE_SECS", default_value = "15")]
    time_sync_tolerance_secs: u64,

    /// Directory holding firmware images.
    #[arg(long, env = "GAS_SOFTWARE_DIR", default_value = "sw")]
    software_dir: PathBuf,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "GAS_METRICS_LISTEN")]
    metrics_listen: Option<String>,

    /// Log level.
    #[arg(long, env = "GAS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (json or pretty).
    #[arg(long, env = "GAS_LOG_FORMAT", default_value = "json")]
    log_format: String,
}

impl ServeArgs {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let secret =
            SharedSecret::from_hex(&self.secret).context("invalid shared secret")?;
        let metrics_listen = self
            .metrics_listen
            .as_deref()
            .map(parse_addr)
            .transpose()?;

        let config = ServerConfig::new(secret)
            .with_listen(parse_addr(&self.listen)?)
            .with_bus_url(self.bus_url.clone())
            .with_max_protocol_version(self.max_protocol_version)
            .with_max_frame_length(self.max_frame_length)
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_write_timeout(Duration::from_secs(self.write_timeout_secs))
            .with_shutdown_drain_timeout(Duration::from_secs(self.shutdown_drain_timeout_secs))
            .with_delivery_timeout(Duration::from_secs(self.delivery_timeout_secs))
            .with_outbound_queue_capacity(self.outbound_queue_capacity)
            .with_poll_interval(optional_secs(self.poll_interval_secs))
            .with_poll_start_delay(Duration::from_secs(self.poll_start_delay_secs))
            .with_time_sync_interval(optional_secs(self.time_sync_interval_secs))
            .with_time_sync_tolerance(Duration::from_secs(self.time_sync_tolerance_secs))
            .with_software_dir(self.software_dir.clone())
            .with_metrics_listen(metrics_listen);
        config.validate()?;
        Ok(config)
    }

    fn telemetry_config(&self) -> anyhow::Result<TelemetryConfig> {
        let format = LogFormat::parse(&self.log_format)
            .with_context(|| format!("unknown log format {:?}", self.log_format))?;
        Ok(TelemetryConfig::new()
            .with_log_level(self.log_level.clone())
            .with_log_format(format))
    }
}

/// Run the serve command.
async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.server_config()?;
    let telemetry = Telemetry::init(args.telemetry_config()?)?;

    let bus = BusClient::connect(&config.bus_url)
        .await
        .with_context(|| format!("failed to connect to bus at {}", config.bus_url))?;

    log_startup!(
        service = %telemetry.config().service_name,
        version = env!("CARGO_PKG_VERSION"),
        bus_url = %config.bus_url,
        "starting gridagent server"
    );

    let server = Server::bind(config, bus, telemetry.shared_metrics()).await?;
    let (stop, shutdown) = watch::channel(false);
    let mut running = tokio::spawn(server.run(shutdown));

    tokio::select! {
        result = &mut running => return result?.map_err(Into::into),
        _ = shutdown_signal() => {}
    }

    log_shutdown!("shutdown requested");
    // the receiver lives in the server task until it returns
    let _ = stop.send(true);
    running.await??;
    log_shutdown!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => run_serve(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "000102030405060708090a0b0c0d0e0f";

    fn serve(args: &[&str]) -> ServeArgs {
        let argv = ["gridagentserver", "serve", "--secret", SECRET]
            .into_iter()
            .chain(args.iter().copied());
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Serve(args) => args,
        }
    }

    #[test]
    fn defaults_match_server_config() {
        let config = serve(&[]).server_config().unwrap();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.bus_url, DEFAULT_BUS_URL);
        assert_eq!(config.max_protocol_version, 3);
        assert_eq!(config.poll_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.time_sync_interval, Some(Duration::from_secs(86400)));
        assert_eq!(config.metrics_listen, None);
    }

    #[test]
    fn zero_intervals_disable_periodic_traffic() {
        let config = serve(&["--poll-interval-secs", "0", "--time-sync-interval-secs", "0"])
            .server_config()
            .unwrap();
        assert_eq!(config.poll_interval, None);
        assert_eq!(config.time_sync_interval, None);
    }

    #[test]
    fn rejects_bad_values() {
        let short = Cli::try_parse_from(["gridagentserver", "serve", "--secret", "0102"]).unwrap();
        let Commands::Serve(args) = short.command;
        assert!(args.server_config().is_err());

        assert!(serve(&["--max-protocol-version", "4"]).server_config().is_err());
        assert!(serve(&["--listen", "nowhere"]).server_config().is_err());
        assert!(serve(&["--log-format", "xml"]).telemetry_config().is_err());
    }

    #[test]
    fn secret_is_required() {
        let result = Cli::try_parse_from(["gridagentserver", "serve"]);
        if std::env::var_os("GAS_SHARED_SECRET").is_none() {
            assert!(result.is_err());
        }
    }
}
