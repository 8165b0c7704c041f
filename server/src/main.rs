use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use query_endpoint_server::api::{build_router, AppState};
use query_endpoint_server::config::Config;

#[derive(Parser, Debug)]
#[command(name = "query-endpoint-server", version, about = "HTTP server for named, versioned query endpoints")]
struct Cli {
	/// Bind address for the HTTP server
	#[arg(long, env = "HTTP_BIND")]
	bind: Option<SocketAddr>,

	/// Directory holding state.ini and query_objects/
	#[arg(long, env = "STATE_DIR")]
	state_dir: Option<PathBuf>,

	/// Log filter, used when RUST_LOG is unset
	#[arg(long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing(&cli.log_level);

	let mut config = Config::load().context("loading configuration")?;
	if let Some(bind) = cli.bind {
		config.bind = bind;
	}
	if let Some(dir) = cli.state_dir {
		config.state_dir = dir;
	}
	let bind_addr = config.bind;
	info!(state_dir = %config.state_dir.display(), evaluate = config.evaluate_enabled, "starting");

	let state = AppState::initialize(config)?;
	match state.reconciler.reconcile().await {
		Ok(report) => info!(revision = report.revision, loaded = report.loaded.len(), failed = report.failed.len(), timed_out = report.timed_out.len(), "startup reconcile finished"),
		Err(err) => warn!(error = %err, "startup reconcile failed"),
	}

	let app = build_router(state).await;
	let listener = tokio::net::TcpListener::bind(bind_addr).await.with_context(|| format!("binding {}", bind_addr))?;
	info!(%bind_addr, "Starting HTTP server");
	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("server error")?;
	info!("Shutdown complete");
	Ok(())
}

fn init_tracing(default_level: &str) {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
	let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
	tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

async fn shutdown_signal() {
	let _ = signal::ctrl_c().await;
	info!("Shutdown signal received");
}
