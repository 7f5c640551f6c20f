mod api;
mod cache;
mod config;
mod dicomweb;
mod dimse;
mod error;
mod scp;
mod scu;
mod tracker;
mod types;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::cache::FileCache;
use crate::config::AppConfig;
use crate::dimse::association::pool::{AssociationManager, AssociationPool};
use crate::scp::DicomScp;
use crate::scu::DimseScu;
use crate::tracker::Tracker;

const ASSOCIATION_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

fn init_logger(level: &str) -> Result<(), anyhow::Error> {
	let log_level: tracing::Level = tracing::Level::from_str(level)?;

	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(log_level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let config = AppConfig::load()?;
	init_logger(&config.logging.level)?;
	debug!("Config: {config:?}");
	let config = Arc::new(config);

	let cache = Arc::new(FileCache::open(
		config.storage_path.clone(),
		config.cache_max_size_bytes,
		Duration::from_secs(config.cache_retention_minutes * 60),
	)?);
	let tracker = Arc::new(Tracker::new());

	let own_aet = config.dimse_proxy_settings.proxy_server.aet.clone();
	let peer = config
		.dimse_proxy_settings
		.primary_peer()
		.expect("dimseProxySettings.peers must configure at least one peer")
		.clone();
	let peer_addr: SocketAddr = format!("{}:{}", peer.ip, peer.port).parse()?;

	let manager = AssociationManager {
		address: peer_addr,
		calling_aet: own_aet.clone(),
		called_aet: peer.aet.clone(),
	};
	let pool = AssociationPool::new(manager, config.max_associations, ASSOCIATION_ACQUIRE_TIMEOUT);
	let scu = Arc::new(DimseScu::new(pool, Arc::clone(&tracker), own_aet.clone(), OPERATION_TIMEOUT));

	let scp_listen_addr: SocketAddr = format!("0.0.0.0:{}", config.dimse_proxy_settings.proxy_server.port).parse()?;
	let scp = Arc::new(DicomScp::new(
		scp_listen_addr,
		own_aet,
		config
			.dimse_proxy_settings
			.authorized_calling_aets()
			.into_iter()
			.map(String::from)
			.collect(),
		true,
		Arc::clone(&tracker),
	));
	tokio::spawn(async move {
		if let Err(err) = scp.serve().await {
			error!(error = %err, "DIMSE SCP stopped");
		}
	});

	spawn_sweep_loop(Arc::clone(&tracker), tracker::SWEEP_INTERVAL, Tracker::sweep);
	spawn_sweep_loop(Arc::clone(&cache), CACHE_SWEEP_INTERVAL, FileCache::sweep);

	let state = AppState {
		config: Arc::clone(&config),
		scu,
		cache,
		tracker,
	};
	let router = api::routes(state);

	let http_addr: SocketAddr = format!("0.0.0.0:{}", config.webserver_port).parse()?;
	info!(addr = %http_addr, "starting HTTP server");
	let listener = tokio::net::TcpListener::bind(http_addr).await?;
	axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

	Ok(())
}

fn spawn_sweep_loop<T: Send + Sync + 'static>(target: Arc<T>, interval: Duration, sweep: fn(&T)) {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		loop {
			ticker.tick().await;
			sweep(&target);
		}
	});
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("shutdown signal received");
}
