// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Executes a handler against claimed triggers and records the outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use cadence_server_db::{Trigger, TriggerRepository, TriggerUpdate};
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::handler::{HandlerError, TriggerContext, TriggerHandler};
use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
	Succeeded,
	Failed,
	/// The row moved on between claim and start, so nothing ran.
	Skipped,
	/// Shutdown began before the handler started; the claim went back to IDLE.
	Requeued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
	pub succeeded: usize,
	pub failed: usize,
	pub skipped: usize,
	pub requeued: usize,
}

impl RunSummary {
	fn record(&mut self, outcome: RunOutcome) {
		match outcome {
			RunOutcome::Succeeded => self.succeeded += 1,
			RunOutcome::Failed => self.failed += 1,
			RunOutcome::Skipped => self.skipped += 1,
			RunOutcome::Requeued => self.requeued += 1,
		}
	}
}

#[derive(Clone)]
pub struct Runner {
	handler: Arc<dyn TriggerHandler>,
	repository: Arc<dyn TriggerRepository>,
	coordinator: Arc<ShutdownCoordinator>,
	clock: Arc<dyn Clock>,
}

impl Runner {
	pub fn new(
		handler: Arc<dyn TriggerHandler>,
		repository: Arc<dyn TriggerRepository>,
		coordinator: Arc<ShutdownCoordinator>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			handler,
			repository,
			coordinator,
			clock,
		}
	}

	/// Runs every trigger in its own task; one failing or panicking does not
	/// affect the others.
	#[instrument(skip(self, triggers), fields(handler = %self.handler.name(), count = triggers.len()))]
	pub async fn run(&self, triggers: Vec<Trigger>) -> RunSummary {
		let mut tasks = JoinSet::new();
		for trigger in triggers {
			let runner = self.clone();
			tasks.spawn(async move { runner.run_one(trigger).await });
		}

		let mut summary = RunSummary::default();
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok(outcome) => summary.record(outcome),
				Err(e) => {
					error!(handler = %self.handler.name(), error = %e, "Trigger task aborted");
					summary.record(RunOutcome::Failed);
				}
			}
		}

		info!(
			succeeded = summary.succeeded,
			failed = summary.failed,
			skipped = summary.skipped,
			requeued = summary.requeued,
			"Finished trigger batch"
		);
		summary
	}

	async fn run_one(&self, trigger: Trigger) -> RunOutcome {
		let handler = self.handler.name();
		let guard = self
			.coordinator
			.track(format!("trigger:{}:{}", trigger.id, Uuid::new_v4()));

		if self.coordinator.is_shutting_down() {
			return self.hand_back(&trigger).await;
		}

		let started = self.clock.now();
		match self
			.repository
			.update_if_version(trigger.id, trigger.version, &TriggerUpdate::running(started))
			.await
		{
			Ok(true) => {}
			Ok(false) => {
				warn!(trigger_id = %trigger.id, handler, "Trigger changed after claim, not running it");
				return RunOutcome::Skipped;
			}
			Err(e) => {
				error!(trigger_id = %trigger.id, handler, error = %e, "Failed to mark trigger running");
				return RunOutcome::Skipped;
			}
		}
		let running_version = trigger.version + 1;

		let ctx = TriggerContext::new(guard.id(), Arc::clone(&self.coordinator));
		let result = AssertUnwindSafe(self.handler.process(&trigger, &ctx))
			.catch_unwind()
			.await
			.unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

		let finished = self.clock.now();
		let next_run_at = self.handler.next_run_after(&trigger, finished);
		let (update, outcome) = match result {
			Ok(()) => {
				info!(trigger_id = %trigger.id, handler, next_run_at = ?next_run_at, "Trigger completed");
				(TriggerUpdate::completed(finished, next_run_at), RunOutcome::Succeeded)
			}
			Err(e) => {
				error!(trigger_id = %trigger.id, handler, error = %e, "Trigger handler failed");
				(TriggerUpdate::failed(finished, next_run_at), RunOutcome::Failed)
			}
		};

		match self
			.repository
			.update_if_version(trigger.id, running_version, &update)
			.await
		{
			Ok(true) => {}
			Ok(false) => warn!(
				trigger_id = %trigger.id,
				handler,
				"Trigger modified while running, outcome not recorded"
			),
			Err(e) => error!(
				trigger_id = %trigger.id,
				handler,
				error = %e,
				"Failed to record trigger outcome"
			),
		}

		drop(guard);
		outcome
	}

	/// Returns a claim that was never started to the pool so that another
	/// instance picks it up.
	async fn hand_back(&self, trigger: &Trigger) -> RunOutcome {
		let handler = self.handler.name();
		match self
			.repository
			.update_if_version(trigger.id, trigger.version, &TriggerUpdate::requeue(self.clock.now()))
			.await
		{
			Ok(true) => {
				info!(trigger_id = %trigger.id, handler, "Shutdown in progress, trigger handed back");
				RunOutcome::Requeued
			}
			Ok(false) => {
				warn!(trigger_id = %trigger.id, handler, "Trigger changed after claim, not handing it back");
				RunOutcome::Skipped
			}
			Err(e) => {
				error!(trigger_id = %trigger.id, handler, error = %e, "Failed to hand back claimed trigger");
				RunOutcome::Skipped
			}
		}
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		message.to_string()
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic".to_string()
	}
}
