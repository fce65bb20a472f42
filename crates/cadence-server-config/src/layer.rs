// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Partial configuration produced by a single source.

use serde::Deserialize;

use crate::sections::{
	DatabaseConfigLayer, LoggingConfigLayer, MigrationsConfigLayer, SchedulerConfigLayer,
};

/// One source's view of the configuration. Missing sections stay `None` so
/// that lower-precedence sources show through when merging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfigLayer {
	#[serde(default)]
	pub database: Option<DatabaseConfigLayer>,
	#[serde(default)]
	pub logging: Option<LoggingConfigLayer>,
	#[serde(default)]
	pub scheduler: Option<SchedulerConfigLayer>,
	#[serde(default)]
	pub migrations: Option<MigrationsConfigLayer>,
}

impl ServerConfigLayer {
	pub fn merge(&mut self, other: ServerConfigLayer) {
		merge_section(&mut self.database, other.database, DatabaseConfigLayer::merge);
		merge_section(&mut self.logging, other.logging, LoggingConfigLayer::merge);
		merge_section(&mut self.scheduler, other.scheduler, SchedulerConfigLayer::merge);
		merge_section(&mut self.migrations, other.migrations, MigrationsConfigLayer::merge);
	}
}

fn merge_section<T>(base: &mut Option<T>, other: Option<T>, merge: fn(&mut T, T)) {
	match (base.as_mut(), other) {
		(Some(existing), Some(overlay)) => merge(existing, overlay),
		(None, Some(overlay)) => *base = Some(overlay),
		(_, None) => {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_merge_keeps_sections_missing_from_overlay() {
		let mut base = ServerConfigLayer {
			database: Some(DatabaseConfigLayer {
				url: Some("sqlite:/var/lib/cadence/base.db".to_string()),
			}),
			..Default::default()
		};
		let overlay = ServerConfigLayer {
			scheduler: Some(SchedulerConfigLayer {
				timezone: Some("Europe/Berlin".to_string()),
				..Default::default()
			}),
			..Default::default()
		};

		base.merge(overlay);

		assert_eq!(
			base.database.unwrap().url.as_deref(),
			Some("sqlite:/var/lib/cadence/base.db")
		);
		assert_eq!(
			base.scheduler.unwrap().timezone.as_deref(),
			Some("Europe/Berlin")
		);
	}

	#[test]
	fn test_merge_overlays_fields_within_section() {
		let mut base = ServerConfigLayer {
			scheduler: Some(SchedulerConfigLayer {
				execution_enabled: Some(true),
				timezone: Some("UTC".to_string()),
				..Default::default()
			}),
			..Default::default()
		};
		let overlay = ServerConfigLayer {
			scheduler: Some(SchedulerConfigLayer {
				execution_enabled: Some(false),
				..Default::default()
			}),
			..Default::default()
		};

		base.merge(overlay);

		let scheduler = base.scheduler.unwrap();
		assert_eq!(scheduler.execution_enabled, Some(false));
		assert_eq!(scheduler.timezone.as_deref(), Some("UTC"));
	}
}
