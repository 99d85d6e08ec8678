#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use subwire_domain::{SubscriptionDescriptor, SubscriptionKind, UserId};
use subwire_engine::SecretString;
use tracing::{debug, info, warn};

/// Default config path: `~/.subwire/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".subwire").join("config.toml"))
}

/// Load the daemon config from TOML and `SUBWIRE_*` env overrides.
pub fn load_daemon_config_from_path(path: &Path) -> anyhow::Result<DaemonConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = DaemonConfig::from_file(file_cfg)?;

	apply_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Daemon config (v1).
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
	pub daemon: DaemonSettings,
	pub twitch: TwitchSettings,
	pub subscriptions: Vec<SubscriptionSettings>,
}

#[derive(Debug, Clone, Default)]
pub struct DaemonSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// How long a notification message id is remembered.
	pub dedup_ttl: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	/// Twitch App Client ID.
	pub client_id: Option<String>,
	/// Twitch user access token (bearer).
	pub user_access_token: Option<SecretString>,
	/// Helix base URL (optional override).
	pub helix_base_url: Option<String>,
	/// EventSub websocket URL (optional override).
	pub eventsub_ws_url: Option<String>,

	/// Reconnect backoff min/max (optional).
	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
}

/// One `[[subscriptions]]` entry.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
	pub descriptor: SubscriptionDescriptor,
	/// User whose token authorizes the registration, if not the default one.
	pub auth_user_id: Option<UserId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	daemon: FileDaemonSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	subscriptions: Vec<FileSubscription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDaemonSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	dedup_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	user_access_token: Option<String>,
	helix_base_url: Option<String>,
	eventsub_ws_url: Option<String>,

	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileSubscription {
	kind: String,
	version: String,
	#[serde(default)]
	parameters: Vec<(String, String)>,
	auth_user_id: Option<String>,
}

impl DaemonConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let subscriptions = file
			.subscriptions
			.into_iter()
			.enumerate()
			.map(|(i, s)| s.into_settings().with_context(|| format!("subscriptions[{i}]")))
			.collect::<anyhow::Result<Vec<_>>>()?;

		Ok(Self {
			daemon: DaemonSettings {
				metrics_bind: file.daemon.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.daemon.health_bind.filter(|s| !s.trim().is_empty()),
				dedup_ttl: file.daemon.dedup_ttl_secs.filter(|v| *v > 0).map(Duration::from_secs),
			},
			twitch: TwitchSettings {
				client_id: file.twitch.client_id.filter(|s| !s.trim().is_empty()),
				user_access_token: file
					.twitch
					.user_access_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				helix_base_url: file.twitch.helix_base_url.filter(|s| !s.trim().is_empty()),
				eventsub_ws_url: file.twitch.eventsub_ws_url.filter(|s| !s.trim().is_empty()),
				reconnect_min_delay: file.twitch.reconnect_min_delay_ms.map(Duration::from_millis),
				reconnect_max_delay: file.twitch.reconnect_max_delay_ms.map(Duration::from_millis),
			},
			subscriptions,
		})
	}
}

impl FileSubscription {
	fn into_settings(self) -> anyhow::Result<SubscriptionSettings> {
		let kind = SubscriptionKind::new(self.kind).context("kind")?;
		let version = self.version.trim().to_string();
		if version.is_empty() {
			anyhow::bail!("version must not be empty");
		}

		let mut descriptor = SubscriptionDescriptor::new(kind, version);
		for (key, value) in self.parameters {
			if descriptor.parameter(&key).is_some() {
				anyhow::bail!("duplicate parameter {key}");
			}
			descriptor = descriptor.with_parameter(key, value);
		}

		let auth_user_id = self
			.auth_user_id
			.filter(|s| !s.trim().is_empty())
			.map(UserId::new)
			.transpose()
			.context("auth_user_id")?;

		Ok(SubscriptionSettings {
			descriptor,
			auth_user_id,
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_overrides<F>(cfg: &mut DaemonConfig, env: F)
where
	F: Fn(&str) -> Option<String>,
{
	if let Some(v) = non_empty(env("SUBWIRE_TWITCH_CLIENT_ID")) {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = non_empty(env("SUBWIRE_TWITCH_USER_ACCESS_TOKEN")) {
		cfg.twitch.user_access_token = Some(SecretString::new(v));
		info!("twitch config: user_access_token overridden by env");
	}

	if let Some(v) = non_empty(env("SUBWIRE_TWITCH_HELIX_BASE_URL")) {
		cfg.twitch.helix_base_url = Some(v);
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = non_empty(env("SUBWIRE_TWITCH_EVENTSUB_WS_URL")) {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = env("SUBWIRE_TWITCH_RECONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.twitch.reconnect_min_delay = Some(Duration::from_millis(ms));
		debug!("twitch config: reconnect_min_delay overridden by env");
	}

	if let Some(v) = env("SUBWIRE_TWITCH_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.twitch.reconnect_max_delay = Some(Duration::from_millis(ms));
		debug!("twitch config: reconnect_max_delay overridden by env");
	}

	if let Some(v) = env("SUBWIRE_DEDUP_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.daemon.dedup_ttl = Some(Duration::from_secs(secs));
		info!(secs, "daemon config: dedup_ttl overridden by env");
	}

	if let Some(v) = non_empty(env("SUBWIRE_METRICS_BIND")) {
		cfg.daemon.metrics_bind = Some(v);
		info!("daemon config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty(env("SUBWIRE_HEALTH_BIND")) {
		cfg.daemon.health_bind = Some(v);
		info!("daemon config: health_bind overridden by env");
	}

	if let (Some(min), Some(max)) = (cfg.twitch.reconnect_min_delay, cfg.twitch.reconnect_max_delay)
		&& min > max
	{
		warn!(
			min_ms = min.as_millis(),
			max_ms = max.as_millis(),
			"twitch config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		cfg.twitch.reconnect_min_delay = Some(max);
		cfg.twitch.reconnect_max_delay = Some(min);
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(raw: &str) -> anyhow::Result<DaemonConfig> {
		let file: FileConfig = toml::from_str(raw)?;
		DaemonConfig::from_file(file)
	}

	#[test]
	fn parses_full_file() {
		let cfg = parse(
			r#"
			[daemon]
			metrics_bind = "127.0.0.1:9100"
			dedup_ttl_secs = 120

			[twitch]
			client_id = "abc"
			user_access_token = "tok"
			reconnect_min_delay_ms = 250

			[[subscriptions]]
			kind = "channel.follow"
			version = "2"
			parameters = [["broadcaster_user_id", "1"], ["moderator_user_id", "2"]]

			[[subscriptions]]
			kind = "stream.online"
			version = "1"
			parameters = [["broadcaster_user_id", "1"]]
			auth_user_id = "1"
			"#,
		)
		.unwrap();

		assert_eq!(cfg.daemon.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
		assert_eq!(cfg.daemon.dedup_ttl, Some(Duration::from_secs(120)));
		assert_eq!(cfg.twitch.client_id.as_deref(), Some("abc"));
		assert_eq!(cfg.twitch.user_access_token.as_ref().map(|t| t.expose()), Some("tok"));
		assert_eq!(cfg.twitch.reconnect_min_delay, Some(Duration::from_millis(250)));

		assert_eq!(cfg.subscriptions.len(), 2);
		let follow = &cfg.subscriptions[0].descriptor;
		assert_eq!(follow.kind().as_str(), "channel.follow");
		assert_eq!(follow.parameter("moderator_user_id"), Some("2"));
		assert_eq!(cfg.subscriptions[1].auth_user_id.as_ref().map(|u| u.as_str()), Some("1"));
	}

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = parse("").unwrap();
		assert!(cfg.subscriptions.is_empty());
		assert!(cfg.twitch.client_id.is_none());
		assert!(cfg.daemon.dedup_ttl.is_none());
	}

	#[test]
	fn rejects_bad_subscription_entries() {
		let err = parse(
			r#"
			[[subscriptions]]
			kind = "channel.follow"
			version = "2"
			parameters = [["broadcaster_user_id", "1"], ["broadcaster_user_id", "3"]]
			"#,
		)
		.unwrap_err();
		assert!(format!("{err:#}").contains("subscriptions[0]"));

		assert!(
			parse(
				r#"
				[[subscriptions]]
				kind = "channel.follow"
				version = " "
				"#
			)
			.is_err()
		);
	}

	#[test]
	fn env_overrides_win_and_swap_inverted_delays() {
		let mut cfg = parse(
			r#"
			[twitch]
			client_id = "from-file"
			"#,
		)
		.unwrap();

		let env: HashMap<&str, &str> = HashMap::from([
			("SUBWIRE_TWITCH_CLIENT_ID", "from-env"),
			("SUBWIRE_TWITCH_USER_ACCESS_TOKEN", " secret "),
			("SUBWIRE_DEDUP_TTL_SECS", "30"),
			("SUBWIRE_METRICS_BIND", ""),
			("SUBWIRE_TWITCH_RECONNECT_MIN_DELAY_MS", "5000"),
			("SUBWIRE_TWITCH_RECONNECT_MAX_DELAY_MS", "100"),
		]);
		apply_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.twitch.client_id.as_deref(), Some("from-env"));
		assert_eq!(cfg.twitch.user_access_token.as_ref().map(|t| t.expose()), Some("secret"));
		assert_eq!(cfg.daemon.dedup_ttl, Some(Duration::from_secs(30)));
		assert!(cfg.daemon.metrics_bind.is_none());
		assert_eq!(cfg.twitch.reconnect_min_delay, Some(Duration::from_millis(100)));
		assert_eq!(cfg.twitch.reconnect_max_delay, Some(Duration::from_millis(5000)));
	}
}
