// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use async_trait::async_trait;
use cadence_server_db::{Trigger, TriggerRepository};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::schedule::next_occurrence;
use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, Error)]
pub enum HandlerError {
	#[error("{0}")]
	Failed(String),

	#[error("invalid trigger payload: {0}")]
	InvalidPayload(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("handler panicked: {0}")]
	Panicked(String),
}

/// What a handler can see of the scheduler while processing one trigger.
pub struct TriggerContext {
	process_id: String,
	coordinator: Arc<ShutdownCoordinator>,
}

impl TriggerContext {
	pub fn new(process_id: impl Into<String>, coordinator: Arc<ShutdownCoordinator>) -> Self {
		Self {
			process_id: process_id.into(),
			coordinator,
		}
	}

	/// Id this run is registered under with the shutdown coordinator.
	pub fn process_id(&self) -> &str {
		&self.process_id
	}

	/// Records the process group spawned for this run so that shutdown can
	/// signal it.
	pub fn attach_pid(&self, pid: u32) {
		self.coordinator.update_process_pid(&self.process_id, pid);
	}

	pub fn is_shutting_down(&self) -> bool {
		self.coordinator.is_shutting_down()
	}
}

/// One kind of trigger and the work behind it.
#[async_trait]
pub trait TriggerHandler: Send + Sync + 'static {
	/// Stable name used in logs and registration state.
	fn name(&self) -> &str;

	/// How often this handler polls for due triggers.
	fn cron_expression(&self) -> &str;

	fn repository(&self) -> Arc<dyn TriggerRepository>;

	async fn process(&self, trigger: &Trigger, ctx: &TriggerContext) -> Result<(), HandlerError>;

	/// When `trigger` should run next after finishing at `after`. Triggers
	/// without a schedule of their own run once.
	fn next_run_after(&self, trigger: &Trigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
		let schedule = trigger.schedule.as_ref()?;
		match next_occurrence(&schedule.cron_expression, &schedule.timezone, after) {
			Ok(next) => Some(next),
			Err(e) => {
				warn!(
					trigger_id = %trigger.id,
					handler = self.name(),
					error = %e,
					"Cannot compute next run, trigger will not be rescheduled"
				);
				None
			}
		}
	}
}
