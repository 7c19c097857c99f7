use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use httpgate::admin;
use httpgate::config::Config;
use httpgate::inbound;
use httpgate::metrics as metrics_app;
use httpgate::state::StateManager;
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to the gateway config file (YAML or JSON, by extension).
	#[arg(short, long, value_name = "file")]
	file: PathBuf,

	/// Bind address for the admin surface (policy stats).
	#[arg(long, value_name = "addr", default_value = "0.0.0.0:19001")]
	admin_addr: String,

	/// Bind address for the Prometheus metrics endpoint.
	#[arg(long, value_name = "addr", default_value = "0.0.0.0:19000")]
	metrics_addr: String,
}

async fn load_config(path: &PathBuf) -> Result<Config> {
	let raw = tokio::fs::read_to_string(path)
		.await
		.with_context(|| format!("reading config file {}", path.display()))?;
	match path.extension().and_then(|e| e.to_str()) {
		Some("json") => Config::from_json(&raw).context("parsing JSON config"),
		_ => Config::from_yaml(&raw).context("parsing YAML config"),
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let config = load_config(&args.file).await?;
	config.validate().context("validating config")?;

	let manager = Arc::new(StateManager::new(&config)?);
	let ct = CancellationToken::new();

	let mut run_set = JoinSet::new();

	let serve_config = config.clone();
	let serve_manager = manager.clone();
	let serve_ct = ct.clone();
	run_set.spawn(async move { inbound::serve_all(&serve_config, serve_manager, serve_ct).await });

	let admin_listener = tokio::net::TcpListener::bind(&args.admin_addr)
		.await
		.with_context(|| format!("binding admin listener on {}", args.admin_addr))?;
	let admin_state = manager.current().await;
	let admin_app = admin::App::new(admin_state.policies.clone());
	let admin_router = admin_app.router();
	let admin_ct = ct.clone();
	run_set.spawn(async move {
		axum::serve(admin_listener, admin_router)
			.with_graceful_shutdown(async move { admin_ct.cancelled().await })
			.await
			.map_err(anyhow::Error::from)
	});

	let registry = Registry::default();
	let metrics_listener = tokio::net::TcpListener::bind(&args.metrics_addr)
		.await
		.with_context(|| format!("binding metrics listener on {}", args.metrics_addr))?;
	let metrics_app = metrics_app::App::new(Arc::new(registry));
	let metrics_router = metrics_app.router();
	let metrics_ct = ct.clone();
	run_set.spawn(async move {
		axum::serve(metrics_listener, metrics_router)
			.with_graceful_shutdown(async move { metrics_ct.cancelled().await })
			.await
			.map_err(anyhow::Error::from)
	});

	let shutdown_ct = ct.clone();
	run_set.spawn(async move {
		wait_for_shutdown_signal().await;
		info!("shutdown signal received, stopping listeners");
		shutdown_ct.cancel();
		Ok::<(), anyhow::Error>(())
	});

	while let Some(result) = run_set.join_next().await {
		result??;
	}
	Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
	let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
	tokio::select! {
		_ = sigint.recv() => {},
		_ = sigterm.recv() => {},
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
