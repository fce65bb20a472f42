// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Start-up migration settings.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct MigrationsConfigLayer {
	pub run: Option<bool>,
	pub lock_retry_secs: Option<u64>,
	pub lock_max_wait_secs: Option<u64>,
}

impl MigrationsConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.run.is_some() {
			self.run = other.run;
		}
		if other.lock_retry_secs.is_some() {
			self.lock_retry_secs = other.lock_retry_secs;
		}
		if other.lock_max_wait_secs.is_some() {
			self.lock_max_wait_secs = other.lock_max_wait_secs;
		}
	}

	pub fn finalize(self) -> MigrationsConfig {
		let defaults = MigrationsConfig::default();
		MigrationsConfig {
			run: self.run.unwrap_or(defaults.run),
			lock_retry_secs: self.lock_retry_secs.unwrap_or(defaults.lock_retry_secs),
			lock_max_wait_secs: self.lock_max_wait_secs.unwrap_or(defaults.lock_max_wait_secs),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationsConfig {
	/// Whether this instance runs migrations (under the lock) on start.
	pub run: bool,
	pub lock_retry_secs: u64,
	pub lock_max_wait_secs: u64,
}

impl MigrationsConfig {
	pub fn lock_retry_interval(&self) -> Duration {
		Duration::from_secs(self.lock_retry_secs)
	}

	pub fn lock_max_wait(&self) -> Duration {
		Duration::from_secs(self.lock_max_wait_secs)
	}
}

impl Default for MigrationsConfig {
	fn default() -> Self {
		Self {
			run: true,
			lock_retry_secs: 5,
			lock_max_wait_secs: 300,
		}
	}
}
