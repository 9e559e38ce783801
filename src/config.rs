//! Configuration for meshsync
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (config.toml, config.json or config.json5)
//! 3. Environment variables (MESHSYNC_* prefix)
//! 4. CLI flags (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::SyncError;
use crate::strategies::ValidationPolicy;

const ENV_PREFIX: &str = "MESHSYNC_";

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// RUNTIME
	// ========================================================================
	/// Directory holding the known-roots registry (~/.config/meshsync)
	pub config_dir: PathBuf,

	// ========================================================================
	// CONFLICT DETECTION & NAMING
	// ========================================================================
	/// How the self entry of version vectors is compared
	pub validation_policy: ValidationPolicy,

	/// Inserted before the extension of the local copy of a conflict
	pub local_conflict_suffix: String,

	/// Inserted before the extension of the incoming copy of a conflict
	pub remote_conflict_suffix: String,

	// ========================================================================
	// TIMEOUTS
	// ========================================================================
	/// Seconds to wait for requested content before retrying
	pub fetch_timeout_secs: u64,

	/// Seconds a lock requester waits for the accept
	pub lock_timeout_secs: u64,

	/// Seconds after which a granted lock is taken back
	pub lock_lease_secs: u64,

	/// Interval of the housekeeping tick
	pub tick_interval_ms: u64,

	/// Least time between two sessions with the same peer
	pub session_restart_ms: u64,

	// ========================================================================
	// OUTPUT & LOGGING
	// ========================================================================
	/// Log filter used when RUST_LOG is not set
	pub log_level: String,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			config_dir: std::env::var("HOME")
				.ok()
				.map(|h| PathBuf::from(h).join(".config").join("meshsync"))
				.unwrap_or_else(|| PathBuf::from(".meshsync-config")),

			validation_policy: ValidationPolicy::Strict,
			local_conflict_suffix: crate::conflict::DEFAULT_LOCAL_SUFFIX.to_string(),
			remote_conflict_suffix: crate::conflict::DEFAULT_REMOTE_SUFFIX.to_string(),

			fetch_timeout_secs: 60,
			lock_timeout_secs: 30,
			lock_lease_secs: 300,
			tick_interval_ms: 1000,
			session_restart_ms: 10_000,

			log_level: "info".to_string(),
		}
	}
}

impl Config {
	/// Parse a config file; the format follows the extension
	pub fn from_file(path: &Path) -> Result<Self, SyncError> {
		let data = std::fs::read_to_string(path)?;
		let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
		let config = match ext {
			"toml" => toml::from_str(&data).map_err(|e| SyncError::InvalidConfig {
				message: format!("{}: {}", path.display(), e),
			})?,
			"json" | "json5" => json5::from_str(&data).map_err(|e| SyncError::InvalidConfig {
				message: format!("{}: {}", path.display(), e),
			})?,
			_ => {
				return Err(SyncError::InvalidConfig {
					message: format!("unsupported config format: {}", path.display()),
				})
			}
		};
		debug!("Loaded config from {}", path.display());
		Ok(config)
	}

	/// Defaults, then the file if given, then the environment; validated
	pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
		let mut config = match path {
			Some(path) => Self::from_file(path)?,
			None => Config::default(),
		};
		config.apply_env(std::env::vars())?;
		config.validate()?;
		Ok(config)
	}

	/// Apply `MESHSYNC_*` overrides from the given variables
	pub fn apply_env<I>(&mut self, vars: I) -> Result<(), SyncError>
	where
		I: IntoIterator<Item = (String, String)>,
	{
		for (key, value) in vars {
			let Some(name) = key.strip_prefix(ENV_PREFIX) else {
				continue;
			};
			match name {
				"CONFIG_DIR" => self.config_dir = PathBuf::from(value),
				"VALIDATION_POLICY" => {
					self.validation_policy =
						value.parse().map_err(|message| SyncError::InvalidConfig { message })?
				}
				"LOCAL_CONFLICT_SUFFIX" => self.local_conflict_suffix = value,
				"REMOTE_CONFLICT_SUFFIX" => self.remote_conflict_suffix = value,
				"FETCH_TIMEOUT_SECS" => self.fetch_timeout_secs = parse_number(&key, &value)?,
				"LOCK_TIMEOUT_SECS" => self.lock_timeout_secs = parse_number(&key, &value)?,
				"LOCK_LEASE_SECS" => self.lock_lease_secs = parse_number(&key, &value)?,
				"TICK_INTERVAL_MS" => self.tick_interval_ms = parse_number(&key, &value)?,
				"SESSION_RESTART_MS" => self.session_restart_ms = parse_number(&key, &value)?,
				"LOG_LEVEL" => self.log_level = value,
				_ => debug!("Ignoring unknown environment variable {}", key),
			}
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		let invalid = |message: &str| -> Result<(), SyncError> {
			Err(SyncError::InvalidConfig { message: message.to_string() })
		};
		if self.local_conflict_suffix.is_empty() || self.remote_conflict_suffix.is_empty() {
			return invalid("conflict suffixes must not be empty");
		}
		if self.local_conflict_suffix == self.remote_conflict_suffix {
			return invalid("local and remote conflict suffixes must differ");
		}
		if self.local_conflict_suffix.contains('/') || self.remote_conflict_suffix.contains('/') {
			return invalid("conflict suffixes must not contain '/'");
		}
		if self.fetch_timeout_secs == 0 || self.lock_timeout_secs == 0 {
			return invalid("timeouts must be positive");
		}
		if self.lock_lease_secs < self.lock_timeout_secs {
			return invalid("lock lease must not be shorter than the lock timeout");
		}
		if self.tick_interval_ms == 0 {
			return invalid("tick interval must be positive");
		}
		Ok(())
	}

	pub fn fetch_timeout(&self) -> Duration {
		Duration::from_secs(self.fetch_timeout_secs)
	}

	pub fn lock_timeout(&self) -> Duration {
		Duration::from_secs(self.lock_timeout_secs)
	}

	pub fn lock_lease(&self) -> Duration {
		Duration::from_secs(self.lock_lease_secs)
	}

	pub fn tick_interval(&self) -> Duration {
		Duration::from_millis(self.tick_interval_ms)
	}

	pub fn session_restart(&self) -> Duration {
		Duration::from_millis(self.session_restart_ms)
	}
}

fn parse_number(key: &str, value: &str) -> Result<u64, SyncError> {
	value.trim().parse().map_err(|_| SyncError::InvalidConfig {
		message: format!("{} must be a number, got {:?}", key, value),
	})
}


// vim: ts=4
