// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: environment variables and TOML files.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::layer::ServerConfigLayer;
use crate::sections::{
	DatabaseConfigLayer, LoggingConfigLayer, MigrationsConfigLayer, SchedulerConfigLayer,
};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ServerConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(ServerConfigLayer::default())
	}
}

/// TOML file configuration source. A missing file contributes nothing.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/cadence/server.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ServerConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: ServerConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: CADENCE_SERVER_<SECTION>_<FIELD>
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(ServerConfigLayer {
			database: Some(load_database_from_env()),
			logging: Some(load_logging_from_env()),
			scheduler: Some(load_scheduler_from_env()?),
			migrations: Some(load_migrations_from_env()?),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Opt-out flag: anything except `false` counts as enabled.
fn env_enabled_unless_false(name: &str) -> Option<bool> {
	env_var(name).map(|v| !v.trim().eq_ignore_ascii_case("false"))
}

/// Opt-in flag: only `true` counts as enabled.
fn env_enabled_only_if_true(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
	match env_var(name) {
		Some(v) => v.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u64 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn load_database_from_env() -> DatabaseConfigLayer {
	DatabaseConfigLayer {
		url: env_var("CADENCE_SERVER_DATABASE_URL"),
	}
}

fn load_logging_from_env() -> LoggingConfigLayer {
	LoggingConfigLayer {
		level: env_var("CADENCE_SERVER_LOG_LEVEL"),
	}
}

fn load_scheduler_from_env() -> Result<SchedulerConfigLayer, ConfigError> {
	Ok(SchedulerConfigLayer {
		execution_enabled: env_enabled_unless_false("CADENCE_SERVER_SCHEDULER_EXECUTION_ENABLED"),
		timezone: env_var("CADENCE_SERVER_SCHEDULER_TIMEZONE"),
		graceful_shutdown_timeout_minutes: env_u64(
			"CADENCE_SERVER_SCHEDULER_GRACEFUL_SHUTDOWN_TIMEOUT_MINUTES",
		)?,
		stale_claim_timeout_minutes: env_u64("CADENCE_SERVER_SCHEDULER_STALE_CLAIM_TIMEOUT_MINUTES")?,
		command_cron: env_var("CADENCE_SERVER_SCHEDULER_COMMAND_CRON"),
	})
}

fn load_migrations_from_env() -> Result<MigrationsConfigLayer, ConfigError> {
	Ok(MigrationsConfigLayer {
		run: env_enabled_only_if_true("CADENCE_SERVER_RUN_MIGRATIONS"),
		lock_retry_secs: env_u64("CADENCE_SERVER_MIGRATION_LOCK_RETRY_SECS")?,
		lock_max_wait_secs: env_u64("CADENCE_SERVER_MIGRATION_LOCK_MAX_WAIT_SECS")?,
	})
}
