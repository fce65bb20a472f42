// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Centralized configuration management for the Cadence server.
//!
//! This crate provides:
//! - Layered configuration from multiple sources (defaults, TOML file, environment)
//! - Type-safe configuration with validation
//! - Consistent environment variable naming (`CADENCE_SERVER_*`)
//!
//! # Usage
//!
//! ```ignore
//! use cadence_server_config::load_config;
//!
//! let config = load_config()?;
//! println!("scheduler execution enabled: {}", config.scheduler.execution_enabled);
//! ```

pub mod error;
pub mod layer;
pub mod sections;
pub mod sources;

pub use error::ConfigError;
pub use layer::ServerConfigLayer;
pub use sections::*;
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use tracing::{debug, info};

/// Fully resolved server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub database: DatabaseConfig,
	pub logging: LoggingConfig,
	pub scheduler: SchedulerConfig,
	pub migrations: MigrationsConfig,
}

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`CADENCE_SERVER_*`)
/// 2. Config file (`/etc/cadence/server.toml`)
/// 3. Built-in defaults
pub fn load_config() -> Result<ServerConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource),
	])
}

/// Load configuration from environment only (for testing or simple deployments).
pub fn load_config_from_env() -> Result<ServerConfig, ConfigError> {
	load_from_sources(vec![Box::new(DefaultsSource), Box::new(EnvSource)])
}

/// Load configuration with a custom config file path.
pub fn load_config_with_file(
	config_path: impl Into<std::path::PathBuf>,
) -> Result<ServerConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(config_path)),
		Box::new(EnvSource),
	])
}

fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<ServerConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = ServerConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}

	finalize(merged)
}

/// Finalize configuration layer into resolved config.
pub fn finalize(layer: ServerConfigLayer) -> Result<ServerConfig, ConfigError> {
	let database = layer.database.unwrap_or_default().finalize();
	let logging = layer.logging.unwrap_or_default().finalize();
	let scheduler = layer.scheduler.unwrap_or_default().finalize()?;
	let migrations = layer.migrations.unwrap_or_default().finalize();

	validate_config(&migrations)?;

	info!(
		database = %database.url,
		execution_enabled = scheduler.execution_enabled,
		timezone = %scheduler.timezone,
		graceful_shutdown_timeout_secs = scheduler.graceful_shutdown_timeout.as_secs(),
		stale_claim_reconciliation = scheduler.stale_claim_timeout.is_some(),
		run_migrations = migrations.run,
		"Server configuration loaded"
	);

	Ok(ServerConfig {
		database,
		logging,
		scheduler,
		migrations,
	})
}

/// Validate cross-field configuration rules.
fn validate_config(migrations: &MigrationsConfig) -> Result<(), ConfigError> {
	if migrations.run && migrations.lock_retry_secs == 0 {
		return Err(ConfigError::Validation(
			"CADENCE_SERVER_MIGRATION_LOCK_RETRY_SECS must be greater than zero \
			 when migrations are enabled"
				.to_string(),
		));
	}

	if migrations.run && migrations.lock_max_wait_secs < migrations.lock_retry_secs {
		return Err(ConfigError::Validation(format!(
			"migration lock max wait ({}s) is shorter than the retry interval ({}s)",
			migrations.lock_max_wait_secs, migrations.lock_retry_secs
		)));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_finalize_empty_layer_uses_defaults() {
		let config = finalize(ServerConfigLayer::default()).unwrap();
		assert_eq!(config.database.url, "sqlite:./cadence.db");
		assert_eq!(config.logging.level, "info");
		assert!(config.scheduler.execution_enabled);
		assert!(config.migrations.run);
	}

	#[test]
	fn test_finalize_propagates_section_errors() {
		let layer = ServerConfigLayer {
			scheduler: Some(SchedulerConfigLayer {
				timezone: Some("Nowhere/Special".to_string()),
				..Default::default()
			}),
			..Default::default()
		};
		assert!(matches!(
			finalize(layer),
			Err(ConfigError::InvalidValue { .. })
		));
	}

	#[test]
	fn test_zero_retry_interval_rejected_when_migrating() {
		let migrations = MigrationsConfig {
			run: true,
			lock_retry_secs: 0,
			..Default::default()
		};
		assert!(matches!(
			validate_config(&migrations),
			Err(ConfigError::Validation(_))
		));

		let skipped = MigrationsConfig {
			run: false,
			lock_retry_secs: 0,
			..Default::default()
		};
		assert!(validate_config(&skipped).is_ok());
	}

	#[test]
	fn test_max_wait_shorter_than_retry_rejected() {
		let migrations = MigrationsConfig {
			run: true,
			lock_retry_secs: 10,
			lock_max_wait_secs: 5,
		};
		assert!(validate_config(&migrations).is_err());
	}

	#[test]
	fn test_file_layer_overrides_defaults() {
		use std::io::Write;

		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(
			file,
			r#"
[scheduler]
timezone = "Asia/Tokyo"
graceful_shutdown_timeout_minutes = 3
"#
		)
		.unwrap();

		let mut merged = ServerConfigLayer::default();
		merged.merge(DefaultsSource.load().unwrap());
		merged.merge(TomlSource::new(file.path()).load().unwrap());
		let config = finalize(merged).unwrap();

		assert_eq!(config.scheduler.timezone, chrono_tz::Asia::Tokyo);
		assert_eq!(
			config.scheduler.graceful_shutdown_timeout,
			std::time::Duration::from_secs(180)
		);
	}
}
