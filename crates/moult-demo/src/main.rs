//! Demo HTTP server that replaces itself on `SIGHUP` without dropping
//! connections.
//!
//! ```text
//! moult-demo --listen 127.0.0.1:8080 --pid-file /tmp/moult-demo.pid &
//! curl http://127.0.0.1:8080/          # slow request, keeps running
//! kill -HUP "$(cat /tmp/moult-demo.pid)"
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Router};
use clap::Parser;
use moult::{signal::upgrade_on_signal, Options, Upgrader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, info_span, Instrument};

mod telemetry;

#[derive(Parser, Debug)]
#[command(name = "moult-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "localhost:8080")]
    listen: String,

    /// Path to the PID file (overrides MOULT_PID_FILE)
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Seconds to wait for in-flight requests after exit before giving up
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Seconds to wait for a new generation to become ready
    #[arg(long)]
    upgrade_timeout_secs: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn options(&self) -> Result<Options> {
        let mut options = Options::from_env()?;
        if let Some(path) = &self.pid_file {
            options.pid_file = Some(path.clone());
        }
        if let Some(secs) = self.drain_timeout_secs {
            options.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.upgrade_timeout_secs {
            options.upgrade_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.json_logs).map_err(|e| anyhow::anyhow!(e))?;

    let span = info_span!("generation", pid = std::process::id());
    run(cli).instrument(span).await
}

async fn run(cli: Cli) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "moult-demo starting");

    let options = cli.options()?;
    let drain_timeout = options.drain_timeout;
    let upgrader = Upgrader::new(options).context("failed to start upgrader")?;

    upgrade_on_signal(upgrader.clone(), SignalKind::hangup())
        .context("failed to install SIGHUP handler")?;

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn({
        let upgrader = upgrader.clone();
        async move {
            if terminate.recv().await.is_some() {
                info!("Received SIGTERM, shutting down");
                upgrader.stop();
            }
        }
    });

    let listener = upgrader
        .listen_tcp(&cli.listen)
        .with_context(|| format!("can't listen on {}", cli.listen))?;
    let local_addr = listener.local_addr()?;

    let app = Router::new()
        .route("/", get(hello))
        .with_state(local_addr);

    let exit = upgrader.exit_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { exit.cancelled().await })
            .await
    });

    upgrader.ready().context("failed to signal readiness")?;
    info!(addr = %local_addr, "ready");

    upgrader.exit().await;
    info!(
        timeout_secs = drain_timeout.as_secs(),
        "Exit requested, draining in-flight requests"
    );

    match tokio::time::timeout(drain_timeout, server).await {
        Ok(Ok(Ok(()))) => {
            info!("Drained, exiting");
            upgrader.stop();
            Ok(())
        }
        Ok(Ok(Err(err))) => Err(err).context("HTTP server failed"),
        Ok(Err(join_err)) => Err(join_err).context("HTTP server task failed"),
        Err(_) => {
            error!("Graceful shutdown timed out");
            std::process::exit(1);
        }
    }
}

async fn hello(State(addr): State<SocketAddr>) -> String {
    // Emulate work so upgrades happen with requests in flight.
    tokio::time::sleep(Duration::from_secs(1)).await;
    format!("Hello from {addr}\n")
}
