//! Application configuration, loaded from `config.json`/`config.jsonc` (JSONC is accepted via
//! the `config` crate's `json5` support, which tolerates `//` and `/* */` comments).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::Aet;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ProxyMode {
	Dimse,
	Dicomweb,
}

impl Default for ProxyMode {
	fn default() -> Self {
		Self::Dimse
	}
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchLevel {
	Study,
	Series,
	Instance,
}

impl Default for FetchLevel {
	fn default() -> Self {
		Self::Instance
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerEndpoint {
	pub aet: Aet,
	pub ip: String,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimseProxySettings {
	pub proxy_server: PeerEndpoint,
	pub peers: Vec<PeerEndpoint>,
}

impl DimseProxySettings {
	/// `peers[0]` is always the SCU target; this gateway dispatches every query to a single
	/// primary peer rather than routing across multiple PACS.
	pub fn primary_peer(&self) -> Option<&PeerEndpoint> {
		self.peers.first()
	}

	/// Every configured peer is an authorized calling AET for the inbound SCP.
	pub fn authorized_calling_aets(&self) -> Vec<&str> {
		self.peers.iter().map(|p| p.aet.as_str()).collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_ssl_port")]
	pub port: u16,
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
	#[serde(default)]
	pub generate_self_signed: bool,
	#[serde(default)]
	pub redirect_http: bool,
}

const fn default_ssl_port() -> u16 {
	8443
}

impl Default for SslConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			port: default_ssl_port(),
			cert_path: None,
			key_path: None,
			generate_self_signed: false,
			redirect_http: false,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsConfig {
	#[serde(default = "default_cors_origin")]
	pub origin: String,
	#[serde(default = "default_cors_methods")]
	pub methods: Vec<String>,
	#[serde(default = "default_cors_headers")]
	pub allowed_headers: Vec<String>,
	#[serde(default)]
	pub credentials: bool,
}

fn default_cors_origin() -> String {
	String::from("*")
}

fn default_cors_methods() -> Vec<String> {
	vec![String::from("GET"), String::from("OPTIONS")]
}

fn default_cors_headers() -> Vec<String> {
	vec![String::from("Content-Type"), String::from("Accept")]
}

impl Default for CorsConfig {
	fn default() -> Self {
		Self {
			origin: default_cors_origin(),
			methods: default_cors_methods(),
			allowed_headers: default_cors_headers(),
			credentials: false,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
	#[serde(default = "default_log_level")]
	pub level: String,
}

fn default_log_level() -> String {
	String::from("info")
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: default_log_level(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
	#[serde(default)]
	pub proxy_mode: ProxyMode,
	pub dimse_proxy_settings: DimseProxySettings,
	#[serde(default = "default_webserver_port")]
	pub webserver_port: u16,
	#[serde(default)]
	pub ssl: SslConfig,
	#[serde(default)]
	pub cors: CorsConfig,
	#[serde(default)]
	pub logging: LoggingConfig,

	#[serde(default = "default_storage_path")]
	pub storage_path: PathBuf,
	#[serde(default = "default_cache_retention_minutes")]
	pub cache_retention_minutes: u64,
	#[serde(default = "default_true")]
	pub enable_cache: bool,
	#[serde(default = "default_max_cache_bytes")]
	pub cache_max_size_bytes: u64,

	#[serde(default)]
	pub use_cget: bool,
	#[serde(default)]
	pub use_fetch_level: FetchLevel,
	#[serde(default = "default_max_associations")]
	pub max_associations: usize,

	#[serde(default = "default_qido_min_chars")]
	pub qido_min_chars: usize,
	#[serde(default = "default_true")]
	pub qido_append_wildcard: bool,
}

const fn default_webserver_port() -> u16 {
	8080
}

fn default_storage_path() -> PathBuf {
	PathBuf::from("./cache")
}

const fn default_cache_retention_minutes() -> u64 {
	60
}

const fn default_max_cache_bytes() -> u64 {
	10 * 1024 * 1024 * 1024
}

const fn default_max_associations() -> usize {
	8
}

const fn default_qido_min_chars() -> usize {
	3
}

const fn default_true() -> bool {
	true
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(transparent)]
	Load(#[from] config::ConfigError),
}

impl AppConfig {
	/// Loads configuration from `./config.{json,jsonc}` or `./config/config.{json,jsonc}`,
	/// relative to the binary's directory and then the current working directory, overridable
	/// by `DICOMWEB_GATEWAY_`-prefixed environment variables (e.g.
	/// `DICOMWEB_GATEWAY_WEBSERVER_PORT=9090`).
	pub fn load() -> Result<Self, ConfigError> {
		let mut builder = config::Config::builder();
		for candidate in Self::candidate_paths() {
			builder = builder.add_source(
				config::File::from(candidate.as_path())
					.format(config::FileFormat::Json5)
					.required(false),
			);
		}
		builder = builder.add_source(
			config::Environment::with_prefix("DICOMWEB_GATEWAY")
				.separator("_")
				.try_parsing(true),
		);
		Ok(builder.build()?.try_deserialize()?)
	}

	fn candidate_paths() -> Vec<PathBuf> {
		let mut bases = Vec::new();
		if let Ok(exe) = std::env::current_exe() {
			if let Some(dir) = exe.parent() {
				bases.push(dir.to_path_buf());
			}
		}
		bases.push(PathBuf::from("."));

		let mut paths = Vec::new();
		for base in bases {
			for rel in [
				"config.json",
				"config.jsonc",
				"config/config.json",
				"config/config.jsonc",
			] {
				paths.push(join(&base, rel));
			}
		}
		paths
	}
}

fn join(base: &Path, rel: &str) -> PathBuf {
	base.join(rel)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn primary_peer_is_first_configured_peer() {
		let settings = DimseProxySettings {
			proxy_server: PeerEndpoint {
				aet: "GATEWAY".into(),
				ip: "127.0.0.1".into(),
				port: 11112,
			},
			peers: vec![
				PeerEndpoint {
					aet: "PACS_A".into(),
					ip: "10.0.0.1".into(),
					port: 104,
				},
				PeerEndpoint {
					aet: "PACS_B".into(),
					ip: "10.0.0.2".into(),
					port: 104,
				},
			],
		};
		assert_eq!(settings.primary_peer().unwrap().aet, "PACS_A");
		assert_eq!(settings.authorized_calling_aets(), vec!["PACS_A", "PACS_B"]);
	}

	#[test]
	fn defaults_are_reasonable() {
		assert_eq!(default_webserver_port(), 8080);
		assert!(default_true());
		assert_eq!(default_qido_min_chars(), 3);
	}
}
