#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::history::HistoryConfig;
use crate::server::state::ConnectionSettings;

/// Default config path: `~/.tagline/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tagline").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	/// account name -> sha256(password) hex
	pub accounts: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Server name used as the source of server messages.
	pub name: String,
	pub network_name: String,
	/// Line length for clients without maxline.
	pub max_line_len: usize,
	/// Line length for maxline clients and for input.
	pub max_line_len_long: usize,
	pub outbound_queue_capacity: usize,
	/// Per-conversation history size; 0 disables history.
	pub history_capacity: usize,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Attach `time` tags for server-time clients.
	pub server_time: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		let conn = ConnectionSettings::default();
		Self {
			name: "tagline.local".to_string(),
			network_name: "Tagline".to_string(),
			max_line_len: conn.max_line_len,
			max_line_len_long: conn.max_line_len_long,
			outbound_queue_capacity: conn.outbound_queue_capacity,
			history_capacity: HistoryConfig::default().per_conversation_capacity,
			metrics_bind: None,
			health_bind: None,
			server_time: conn.server_time,
		}
	}
}

impl ServerSettings {
	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			max_line_len: self.max_line_len,
			max_line_len_long: self.max_line_len_long,
			outbound_queue_capacity: self.outbound_queue_capacity,
			server_time: self.server_time,
		}
	}

	pub fn history_config(&self) -> HistoryConfig {
		HistoryConfig {
			per_conversation_capacity: self.history_capacity,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	accounts: BTreeMap<String, FileAccount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	name: Option<String>,
	network_name: Option<String>,
	max_line_len: Option<usize>,
	max_line_len_long: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	history_capacity: Option<usize>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	server_time: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAccount {
	password_sha256: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		let accounts = file
			.accounts
			.into_iter()
			.filter_map(|(name, acct)| match acct.password_sha256.filter(|s| !s.trim().is_empty()) {
				Some(hash) => Some((name, hash.trim().to_ascii_lowercase())),
				None => {
					warn!(account = %name, "account has no password_sha256; ignoring");
					None
				}
			})
			.collect();

		let max_line_len = file
			.server
			.max_line_len
			.filter(|v| *v >= tagline_protocol::DEFAULT_MAX_LINE_LEN)
			.unwrap_or(defaults.max_line_len);

		Self {
			server: ServerSettings {
				name: file
					.server
					.name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.name),
				network_name: file
					.server
					.network_name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.network_name),
				max_line_len,
				max_line_len_long: file
					.server
					.max_line_len_long
					.unwrap_or(defaults.max_line_len_long)
					.max(max_line_len),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				history_capacity: file.server.history_capacity.unwrap_or(defaults.history_capacity),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				server_time: file.server.server_time.unwrap_or(defaults.server_time),
			},
			accounts,
		}
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
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("TAGLINE_SERVER_NAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.name = v;
			info!("server config: name overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TAGLINE_NETWORK_NAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.network_name = v;
			info!("server config: network_name overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TAGLINE_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("TAGLINE_HISTORY_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.history_capacity = capacity;
		info!(capacity, "server config: history_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("TAGLINE_SERVER_TIME")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.server_time = enabled;
		info!(enabled, "server config: server_time overridden by env");
	}

	if let Ok(v) = std::env::var("TAGLINE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TAGLINE_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if cfg.accounts.is_empty() {
		info!("no accounts configured; PASS will be rejected");
	}
}
