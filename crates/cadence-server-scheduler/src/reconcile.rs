// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Requeues triggers left READY by an instance that died after claiming.

use std::sync::Arc;
use std::time::Duration;

use cadence_server_db::{TriggerRepository, TriggerStatus, TriggerUpdate};
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;

pub struct StaleClaimReconciler {
	handler: String,
	repository: Arc<dyn TriggerRepository>,
	clock: Arc<dyn Clock>,
	timeout: Duration,
}

impl StaleClaimReconciler {
	pub fn new(
		handler: impl Into<String>,
		repository: Arc<dyn TriggerRepository>,
		clock: Arc<dyn Clock>,
		timeout: Duration,
	) -> Self {
		Self {
			handler: handler.into(),
			repository,
			clock,
			timeout,
		}
	}

	/// Returns the number of triggers put back to IDLE.
	#[instrument(skip(self), fields(handler = %self.handler))]
	pub async fn requeue_stale(&self) -> usize {
		let now = self.clock.now();
		let cutoff = chrono::Duration::from_std(self.timeout)
			.ok()
			.and_then(|timeout| now.checked_sub_signed(timeout));
		let Some(cutoff) = cutoff else {
			warn!(timeout_secs = self.timeout.as_secs(), "Stale claim timeout out of range");
			return 0;
		};

		let stale = match self
			.repository
			.find_stale(TriggerStatus::Ready, cutoff)
			.await
		{
			Ok(stale) => stale,
			Err(e) => {
				error!(error = %e, "Failed to look up stale claims");
				return 0;
			}
		};

		let requeue = TriggerUpdate::requeue(now);
		let mut requeued = 0;
		for trigger in stale {
			match self
				.repository
				.update_if_version(trigger.id, trigger.version, &requeue)
				.await
			{
				Ok(true) => {
					warn!(
						trigger_id = %trigger.id,
						claimed_at = %trigger.updated_at,
						"Requeued trigger stuck in READY"
					);
					requeued += 1;
				}
				Ok(false) => {}
				Err(e) => error!(trigger_id = %trigger.id, error = %e, "Failed to requeue stale claim"),
			}
		}

		if requeued > 0 {
			info!(requeued, "Stale claims requeued");
		}
		requeued
	}
}
