// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Scheduler configuration section.

use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_SHUTDOWN_TIMEOUT_MINUTES: u64 = 15;
const DEFAULT_COMMAND_CRON: &str = "* * * * *";
/// One year. Anything longer is almost certainly a unit mistake.
const MAX_TIMEOUT_MINUTES: u64 = 366 * 24 * 60;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfigLayer {
	pub execution_enabled: Option<bool>,
	pub timezone: Option<String>,
	pub graceful_shutdown_timeout_minutes: Option<u64>,
	pub stale_claim_timeout_minutes: Option<u64>,
	pub command_cron: Option<String>,
}

impl SchedulerConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.execution_enabled.is_some() {
			self.execution_enabled = other.execution_enabled;
		}
		if other.timezone.is_some() {
			self.timezone = other.timezone;
		}
		if other.graceful_shutdown_timeout_minutes.is_some() {
			self.graceful_shutdown_timeout_minutes = other.graceful_shutdown_timeout_minutes;
		}
		if other.stale_claim_timeout_minutes.is_some() {
			self.stale_claim_timeout_minutes = other.stale_claim_timeout_minutes;
		}
		if other.command_cron.is_some() {
			self.command_cron = other.command_cron;
		}
	}

	pub fn finalize(self) -> Result<SchedulerConfig, ConfigError> {
		let timezone_name = self.timezone.unwrap_or_else(|| "UTC".to_string());
		let timezone: Tz = timezone_name
			.parse()
			.map_err(|_| ConfigError::InvalidValue {
				key: "scheduler.timezone".to_string(),
				message: format!("unknown IANA timezone '{timezone_name}'"),
			})?;

		let graceful_shutdown_timeout = minutes_to_duration(
			"scheduler.graceful_shutdown_timeout_minutes",
			self
				.graceful_shutdown_timeout_minutes
				.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MINUTES),
		)?;
		let stale_claim_timeout = self
			.stale_claim_timeout_minutes
			.map(|minutes| minutes_to_duration("scheduler.stale_claim_timeout_minutes", minutes))
			.transpose()?;

		Ok(SchedulerConfig {
			execution_enabled: self.execution_enabled.unwrap_or(true),
			timezone,
			graceful_shutdown_timeout,
			stale_claim_timeout,
			command_cron: self
				.command_cron
				.unwrap_or_else(|| DEFAULT_COMMAND_CRON.to_string()),
		})
	}
}

fn minutes_to_duration(key: &str, minutes: u64) -> Result<Duration, ConfigError> {
	let invalid = |message: String| ConfigError::InvalidValue {
		key: key.to_string(),
		message,
	};
	if minutes == 0 {
		return Err(invalid("must be greater than zero".to_string()));
	}
	if minutes > MAX_TIMEOUT_MINUTES {
		return Err(invalid(format!(
			"{minutes} minutes exceeds the maximum of {MAX_TIMEOUT_MINUTES}"
		)));
	}
	minutes
		.checked_mul(60)
		.map(Duration::from_secs)
		.ok_or_else(|| invalid(format!("{minutes} minutes is out of range")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
	/// `false` puts every handler in registration-only mode.
	pub execution_enabled: bool,
	/// Zone every cron expression is evaluated in.
	pub timezone: Tz,
	pub graceful_shutdown_timeout: Duration,
	/// READY rows older than this are requeued. `None` disables reconciliation.
	pub stale_claim_timeout: Option<Duration>,
	pub command_cron: String,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			execution_enabled: true,
			timezone: Tz::UTC,
			graceful_shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_MINUTES * 60),
			stale_claim_timeout: None,
			command_cron: DEFAULT_COMMAND_CRON.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_layer_finalize_defaults() {
		let config = SchedulerConfigLayer::default().finalize().unwrap();
		assert_eq!(config, SchedulerConfig::default());
		assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(900));
	}

	#[test]
	fn test_layer_finalize_with_values() {
		let layer = SchedulerConfigLayer {
			execution_enabled: Some(false),
			timezone: Some("America/New_York".to_string()),
			graceful_shutdown_timeout_minutes: Some(1),
			stale_claim_timeout_minutes: Some(30),
			command_cron: Some("*/5 * * * *".to_string()),
		};
		let config = layer.finalize().unwrap();
		assert!(!config.execution_enabled);
		assert_eq!(config.timezone, chrono_tz::America::New_York);
		assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(60));
		assert_eq!(config.stale_claim_timeout, Some(Duration::from_secs(1800)));
		assert_eq!(config.command_cron, "*/5 * * * *");
	}

	#[test]
	fn test_unknown_timezone_rejected() {
		let layer = SchedulerConfigLayer {
			timezone: Some("Mars/Olympus_Mons".to_string()),
			..Default::default()
		};
		let err = layer.finalize().unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "scheduler.timezone"));
	}

	#[test]
	fn test_zero_timeouts_rejected() {
		let shutdown = SchedulerConfigLayer {
			graceful_shutdown_timeout_minutes: Some(0),
			..Default::default()
		};
		assert!(shutdown.finalize().is_err());

		let stale = SchedulerConfigLayer {
			stale_claim_timeout_minutes: Some(0),
			..Default::default()
		};
		assert!(stale.finalize().is_err());
	}

	#[test]
	fn test_huge_timeouts_rejected() {
		for minutes in [u64::MAX / 2, u64::MAX, MAX_TIMEOUT_MINUTES + 1] {
			let shutdown = SchedulerConfigLayer {
				graceful_shutdown_timeout_minutes: Some(minutes),
				..Default::default()
			};
			let err = shutdown.finalize().unwrap_err();
			assert!(matches!(
				err,
				ConfigError::InvalidValue { ref key, .. } if key == "scheduler.graceful_shutdown_timeout_minutes"
			));

			let stale = SchedulerConfigLayer {
				stale_claim_timeout_minutes: Some(minutes),
				..Default::default()
			};
			let err = stale.finalize().unwrap_err();
			assert!(matches!(
				err,
				ConfigError::InvalidValue { ref key, .. } if key == "scheduler.stale_claim_timeout_minutes"
			));
		}

		let longest = SchedulerConfigLayer {
			graceful_shutdown_timeout_minutes: Some(MAX_TIMEOUT_MINUTES),
			..Default::default()
		};
		assert_eq!(
			longest.finalize().unwrap().graceful_shutdown_timeout,
			Duration::from_secs(MAX_TIMEOUT_MINUTES * 60)
		);
	}

	#[test]
	fn test_deserialize_layer_partial() {
		let layer: SchedulerConfigLayer = toml::from_str(
			r#"
execution_enabled = false
timezone = "Europe/London"
"#,
		)
		.unwrap();
		assert_eq!(layer.execution_enabled, Some(false));
		assert_eq!(layer.timezone.as_deref(), Some("Europe/London"));
		assert!(layer.graceful_shutdown_timeout_minutes.is_none());
	}
}
