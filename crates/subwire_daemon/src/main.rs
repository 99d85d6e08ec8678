#![forbid(unsafe_code)]

mod config;
mod health;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use subwire_engine::twitch::{
	DEFAULT_EVENTSUB_WS_URL, DEFAULT_HELIX_BASE_URL, EventSubSession, EventSubSessionConfig, HelixClient,
	WebSocketTransport,
};
use subwire_engine::{CoordinatorConfig, LifecycleCoordinator, LifecycleEvent, Notification, handler};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::config::DaemonConfig;
use crate::health::{HealthState, spawn_health_server};

const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: subwire_daemon [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.subwire/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter =
		std::env::var("RUST_LOG").unwrap_or_else(|_| "info,subwire_daemon=debug,subwire_engine=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn spawn_event_logger(coordinator: &LifecycleCoordinator) {
	let mut events = coordinator.subscribe_events();
	tokio::spawn(async move {
		loop {
			match events.recv().await {
				Ok(LifecycleEvent::CreateSuccess {
					identity,
					remote_id,
					resumed,
				}) => info!(identity = %identity, remote_id = %remote_id, resumed, "subscription created"),
				Ok(LifecycleEvent::CreateFailure { identity, error }) => {
					warn!(identity = %identity, error = %error, "subscription create failed")
				}
				Ok(LifecycleEvent::DeleteSuccess { identity, remote_id }) => {
					info!(identity = %identity, remote_id = %remote_id, "subscription deleted")
				}
				Ok(LifecycleEvent::DeleteFailure {
					identity,
					remote_id,
					error,
				}) => warn!(identity = %identity, remote_id = %remote_id, error = %error, "subscription delete failed"),
				Ok(LifecycleEvent::Revoke {
					identity,
					remote_id,
					status,
				}) => warn!(identity = %identity, remote_id = %remote_id, status = %status, "subscription revoked"),
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(lagged = n, "lifecycle event logger lagged");
				}
				Err(broadcast::error::RecvError::Closed) => break,
			}
		}
	});

	let mut failures = coordinator.subscribe_handler_failures();
	tokio::spawn(async move {
		loop {
			match failures.recv().await {
				Ok(f) => warn!(identity = %f.identity, message_id = %f.message_id, error = %f.error, "handler failed"),
				Err(broadcast::error::RecvError::Lagged(n)) => warn!(lagged = n, "handler failure logger lagged"),
				Err(broadcast::error::RecvError::Closed) => break,
			}
		}
	});
}

fn spawn_dedup_sweeper(coordinator: &LifecycleCoordinator) {
	let coordinator = coordinator.clone();
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(DEDUP_SWEEP_INTERVAL);
		loop {
			tick.tick().await;
			let evicted = coordinator.sweep_dedup();
			if evicted > 0 {
				debug!(evicted, "dedup cache swept");
			}
		}
	});
}

fn log_notification(n: &Notification) -> anyhow::Result<()> {
	info!(
		identity = %n.identity,
		kind = %n.kind,
		message_id = %n.message_id,
		payload = %n.payload,
		"notification"
	);
	Ok(())
}

fn session_config(cfg: &DaemonConfig) -> EventSubSessionConfig {
	let mut session_cfg = EventSubSessionConfig {
		ws_url: cfg
			.twitch
			.eventsub_ws_url
			.clone()
			.unwrap_or_else(|| DEFAULT_EVENTSUB_WS_URL.to_string()),
		..EventSubSessionConfig::default()
	};
	if let Some(min) = cfg.twitch.reconnect_min_delay {
		session_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = cfg.twitch.reconnect_max_delay {
		session_cfg.reconnect_max_delay = max;
	}
	session_cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_daemon_config_from_path(&config_path)?;
	info!(
		path = %config_path.display(),
		subscriptions = cfg.subscriptions.len(),
		"loaded daemon config (toml + env overrides)"
	);

	init_metrics(cfg.daemon.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.daemon.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let client_id = cfg.twitch.client_id.clone().context("twitch.client_id is required")?;
	let token = cfg
		.twitch
		.user_access_token
		.clone()
		.context("twitch.user_access_token is required")?;
	let helix_base = cfg.twitch.helix_base_url.as_deref().unwrap_or(DEFAULT_HELIX_BASE_URL);
	let helix_base = Url::parse(helix_base).with_context(|| format!("invalid helix base url: {helix_base}"))?;
	let api = Arc::new(HelixClient::new(helix_base, client_id, token)?);

	let transport = Arc::new(WebSocketTransport::new());
	let coordinator = LifecycleCoordinator::new(
		api.clone(),
		transport.clone(),
		CoordinatorConfig {
			dedup_ttl: cfg.daemon.dedup_ttl.unwrap_or(CoordinatorConfig::default().dedup_ttl),
			..CoordinatorConfig::default()
		},
	);
	spawn_event_logger(&coordinator);
	spawn_dedup_sweeper(&coordinator);

	let session = EventSubSession::new(session_config(&cfg), coordinator.clone(), api, transport);
	let mut connected = session.connected();
	health_state.follow(session.connected());

	let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
	let session_task = tokio::spawn(session.run(async move {
		let _ = shutdown_rx.await;
	}));

	// Subscribe once the first session is up so creates have a session to bind to.
	tokio::select! {
		r = connected.wait_for(|c| *c) => {
			r.context("eventsub session ended before connecting")?;
		}
		r = tokio::signal::ctrl_c() => {
			r.context("listen for ctrl-c")?;
			info!("interrupted before eventsub connected");
			let _ = shutdown_tx.send(());
			session_task.await.context("eventsub session task")??;
			return Ok(());
		}
	}

	let handles: Vec<_> = cfg
		.subscriptions
		.iter()
		.map(|s| coordinator.subscribe(s.descriptor.clone(), handler(log_notification), s.auth_user_id.clone()))
		.collect();
	info!(count = handles.len(), "subscriptions requested");

	tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
	info!("shutting down");

	let stopped = coordinator.unsubscribe_all().await;
	info!(count = stopped, "subscriptions removed");
	drop(handles);

	let _ = shutdown_tx.send(());
	session_task.await.context("eventsub session task")??;

	Ok(())
}
