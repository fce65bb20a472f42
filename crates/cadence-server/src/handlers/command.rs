// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Runs a trigger's payload as an external command.
//!
//! Payload: `{"program": "/usr/local/bin/refresh-report", "args": ["--id", "42"]}`.
//! The child leads its own process group, so a shutdown signal reaches it and
//! anything it forks without touching the server itself. A child spawned
//! after shutdown began is signalled as soon as its pid is attached.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_server_db::{Trigger, TriggerRepository};
use cadence_server_scheduler::{HandlerError, TriggerContext, TriggerHandler};
use serde::Deserialize;
use tracing::{info, instrument};

pub const COMMAND_TRIGGER_TYPE: &str = "command";

#[derive(Debug, Deserialize)]
struct CommandPayload {
	program: String,
	#[serde(default)]
	args: Vec<String>,
}

pub struct CommandTriggerHandler {
	cron: String,
	repository: Arc<dyn TriggerRepository>,
}

impl CommandTriggerHandler {
	pub fn new(cron: impl Into<String>, repository: Arc<dyn TriggerRepository>) -> Self {
		Self {
			cron: cron.into(),
			repository,
		}
	}
}

#[async_trait]
impl TriggerHandler for CommandTriggerHandler {
	fn name(&self) -> &str {
		COMMAND_TRIGGER_TYPE
	}

	fn cron_expression(&self) -> &str {
		&self.cron
	}

	fn repository(&self) -> Arc<dyn TriggerRepository> {
		self.repository.clone()
	}

	#[instrument(skip(self, trigger, ctx), fields(trigger_id = %trigger.id))]
	async fn process(&self, trigger: &Trigger, ctx: &TriggerContext) -> Result<(), HandlerError> {
		let payload = trigger
			.payload
			.clone()
			.ok_or_else(|| HandlerError::InvalidPayload("missing command payload".to_string()))?;
		let command: CommandPayload = serde_json::from_value(payload)
			.map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

		let mut child_command = tokio::process::Command::new(&command.program);
		child_command.args(&command.args);
		#[cfg(unix)]
		child_command.process_group(0);

		let mut child = child_command.spawn()?;
		if let Some(pid) = child.id() {
			ctx.attach_pid(pid);
		}
		info!(program = %command.program, pid = ?child.id(), "Started command");

		let status = child.wait().await?;
		if status.success() {
			Ok(())
		} else {
			Err(HandlerError::Failed(format!(
				"{} exited with {status}",
				command.program
			)))
		}
	}
}
