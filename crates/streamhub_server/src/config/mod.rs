#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use streamhub_domain::PlatformId;
use streamhub_platform::SecretString;
use streamhub_util::endpoint::StreamEndpoint;
use thiserror::Error;
use tracing::{info, warn};

use crate::server::backoff::ReconnectPolicy;
use crate::server::connection_manager::ConnectionManagerConfig;
use crate::server::event_bus::{BackpressurePolicy, EventBusConfig};

/// Default config path: `~/.streamhub/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".streamhub").join("config.toml"))
}

/// Load the server config from TOML (missing file = defaults) and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.validate()?;

	Ok(cfg)
}

/// Parse a TOML document without consulting the environment.
#[allow(dead_code)]
pub fn parse_server_config(toml_src: &str) -> anyhow::Result<ServerConfig> {
	let file_cfg: FileConfig = toml::from_str(toml_src).context("parse TOML")?;
	let cfg = ServerConfig::from_file(file_cfg)?;
	cfg.validate()?;
	Ok(cfg)
}

/// Rejected configuration value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("invalid {field}: {reason}")]
	Invalid { field: String, reason: String },

	#[error("duplicate platform id {0}")]
	DuplicatePlatform(String),
}

impl ConfigError {
	pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::Invalid {
			field: field.into(),
			reason: reason.into(),
		}
	}
}

/// Runtime server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub bus: EventBusConfig,
	/// Backing store for bus persistence (sqlite: or postgres:); in-memory when unset.
	pub database_url: Option<String>,
	pub manager: ConnectionManagerConfig,
	pub transport: TransportSettings,
	pub platforms: Vec<PlatformSettings>,
	pub server: ServerSettings,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
	pub heartbeat_interval: Duration,
	/// Delay before a connection resumes locally after a heartbeat timeout.
	pub resume_delay: Duration,
}

impl Default for TransportSettings {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_secs(10),
			resume_delay: Duration::from_secs(2),
		}
	}
}

/// One `[[platform]]` entry.
#[derive(Debug, Clone)]
pub struct PlatformSettings {
	pub id: PlatformId,
	pub endpoint: StreamEndpoint,
	pub enabled: bool,
	pub access_token: Option<SecretString>,
	pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	bus: FileBusSettings,

	#[serde(default)]
	reconnect: FileReconnectSettings,

	#[serde(default)]
	transport: FileTransportSettings,

	#[serde(default)]
	platforms: FilePlatformsSettings,

	#[serde(default, rename = "platform")]
	platform: Vec<FilePlatform>,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBusSettings {
	capacity: Option<usize>,
	backpressure: Option<BackpressurePolicy>,
	dispatcher_threads: Option<usize>,
	purge_interval_ms: Option<u64>,
	persistence_enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReconnectSettings {
	initial_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
	max_attempts: Option<i64>,
	jitter_percent: Option<f64>,
	stable_reset_ms: Option<u64>,
	summary_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTransportSettings {
	heartbeat_interval_secs: Option<u64>,
	resume_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePlatformsSettings {
	enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct FilePlatform {
	id: String,
	endpoint: String,
	enabled: Option<bool>,
	access_token: Option<String>,
	display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Result<Self, ConfigError> {
		let bus_defaults = EventBusConfig::default();
		let bus = EventBusConfig {
			capacity: file.bus.capacity.unwrap_or(bus_defaults.capacity),
			backpressure: file.bus.backpressure.unwrap_or(bus_defaults.backpressure),
			dispatcher_threads: file.bus.dispatcher_threads.unwrap_or(bus_defaults.dispatcher_threads),
			purge_interval: file
				.bus
				.purge_interval_ms
				.map(Duration::from_millis)
				.unwrap_or(bus_defaults.purge_interval),
			persistence_enabled: file.bus.persistence_enabled.unwrap_or(false),
		};

		let policy_defaults = ReconnectPolicy::default();
		let reconnect = ReconnectPolicy {
			initial_delay: file
				.reconnect
				.initial_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(policy_defaults.initial_delay),
			max_delay: file
				.reconnect
				.max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(policy_defaults.max_delay),
			max_attempts: file.reconnect.max_attempts.unwrap_or(policy_defaults.max_attempts),
			jitter_percent: file.reconnect.jitter_percent.unwrap_or(policy_defaults.jitter_percent),
			stable_reset: file
				.reconnect
				.stable_reset_ms
				.map(Duration::from_millis)
				.unwrap_or(policy_defaults.stable_reset),
		};

		let transport_defaults = TransportSettings::default();
		let transport = TransportSettings {
			heartbeat_interval: file
				.transport
				.heartbeat_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(transport_defaults.heartbeat_interval),
			resume_delay: file
				.transport
				.resume_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(transport_defaults.resume_delay),
		};

		let mut platforms = Vec::with_capacity(file.platform.len());
		for p in file.platform {
			let id = PlatformId::new(&p.id).map_err(|e| ConfigError::invalid("platform.id", e.to_string()))?;
			let endpoint = StreamEndpoint::parse(&p.endpoint)
				.map_err(|e| ConfigError::invalid(format!("platform.{id}.endpoint"), e))?;
			platforms.push(PlatformSettings {
				id,
				endpoint,
				enabled: p.enabled.unwrap_or(true),
				access_token: p.access_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				display_name: p.display_name.filter(|s| !s.trim().is_empty()),
			});
		}

		Ok(Self {
			bus,
			database_url: file.bus.database_url.filter(|s| !s.trim().is_empty()),
			manager: ConnectionManagerConfig {
				reconnect,
				connections_enabled: file.platforms.enabled.unwrap_or(true),
				summary_interval: file
					.reconnect
					.summary_interval_ms
					.filter(|ms| *ms > 0)
					.map(Duration::from_millis),
			},
			transport,
			platforms,
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
		})
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		self.bus.validate()?;
		self.manager.reconnect.validate()?;

		if self.transport.heartbeat_interval < Duration::from_secs(1) {
			return Err(ConfigError::invalid("transport.heartbeat_interval_secs", "must be >= 1"));
		}

		let mut seen = HashSet::new();
		for p in &self.platforms {
			if !seen.insert(p.id.clone()) {
				return Err(ConfigError::DuplicatePlatform(p.id.to_string()));
			}
		}
		Ok(())
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
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

/// `STREAMHUB_PLATFORM_<ID>_ACCESS_TOKEN`, with `-` mapped to `_`.
fn platform_token_var(id: &PlatformId) -> String {
	format!(
		"STREAMHUB_PLATFORM_{}_ACCESS_TOKEN",
		id.as_str().replace('-', "_").to_ascii_uppercase()
	)
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("STREAMHUB_BUS_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.bus.capacity = capacity;
		info!(capacity, "bus config: capacity overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_BUS_BACKPRESSURE") {
		match v.parse::<BackpressurePolicy>() {
			Ok(policy) => {
				cfg.bus.backpressure = policy;
				info!(?policy, "bus config: backpressure overridden by env");
			}
			Err(e) => warn!(error = %e, "bus config: ignoring invalid STREAMHUB_BUS_BACKPRESSURE"),
		}
	}

	if let Some(v) = non_empty("STREAMHUB_BUS_DISPATCHER_THREADS")
		&& let Ok(threads) = v.parse::<usize>()
	{
		cfg.bus.dispatcher_threads = threads;
		info!(threads, "bus config: dispatcher_threads overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_BUS_PURGE_INTERVAL_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.bus.purge_interval = Duration::from_millis(ms);
		info!(ms, "bus config: purge_interval overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.bus.persistence_enabled = enabled;
		info!(enabled, "bus config: persistence_enabled overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_DATABASE_URL") {
		cfg.database_url = Some(v);
		info!("bus config: database_url overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_RECONNECT_INITIAL_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.manager.reconnect.initial_delay = Duration::from_millis(ms);
		info!(ms, "reconnect config: initial_delay overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.manager.reconnect.max_delay = Duration::from_millis(ms);
		info!(ms, "reconnect config: max_delay overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_RECONNECT_MAX_ATTEMPTS")
		&& let Ok(attempts) = v.parse::<i64>()
	{
		cfg.manager.reconnect.max_attempts = attempts;
		info!(attempts, "reconnect config: max_attempts overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_RECONNECT_JITTER_PERCENT")
		&& let Ok(jitter) = v.parse::<f64>()
	{
		cfg.manager.reconnect.jitter_percent = jitter;
		info!(jitter, "reconnect config: jitter_percent overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_RECONNECT_STABLE_RESET_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.manager.reconnect.stable_reset = Duration::from_millis(ms);
		info!(ms, "reconnect config: stable_reset overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_HEARTBEAT_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.transport.heartbeat_interval = Duration::from_secs(secs);
		info!(secs, "transport config: heartbeat_interval overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_PLATFORMS_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.manager.connections_enabled = enabled;
		info!(enabled, "platforms: enabled overridden by env");
	}

	for platform in &mut cfg.platforms {
		let key = platform_token_var(&platform.id);
		if let Some(v) = non_empty(&key) {
			platform.access_token = Some(SecretString::new(v));
			info!(platform = %platform.id, "platform config: access_token overridden by env");
		}
	}

	if let Some(v) = non_empty("STREAMHUB_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("STREAMHUB_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}
}
