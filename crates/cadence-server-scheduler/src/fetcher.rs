// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Discovers due triggers and claims them for this instance.

use std::sync::Arc;

use cadence_server_db::{DbError, Trigger, TriggerRepository, TriggerStatus, TriggerUpdate};
use tracing::{debug, error, instrument, warn};

use crate::clock::Clock;

pub struct Fetcher {
	handler: String,
	repository: Arc<dyn TriggerRepository>,
	clock: Arc<dyn Clock>,
}

impl Fetcher {
	pub fn new(
		handler: impl Into<String>,
		repository: Arc<dyn TriggerRepository>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			handler: handler.into(),
			repository,
			clock,
		}
	}

	/// Claims every due trigger it can and returns the ones it won, oldest
	/// due first. Any store error yields an empty batch.
	#[instrument(skip(self), fields(handler = %self.handler))]
	pub async fn fetch_due(&self) -> Vec<Trigger> {
		match self.claim_due().await {
			Ok(claimed) => claimed,
			Err(e) => {
				error!(error = %e, "Failed to fetch due triggers, skipping this run");
				Vec::new()
			}
		}
	}

	async fn claim_due(&self) -> Result<Vec<Trigger>, DbError> {
		let now = self.clock.now();
		let candidates = self.repository.find_due(now).await?;
		if candidates.is_empty() {
			return Ok(Vec::new());
		}

		let claim = TriggerUpdate::claim(now);
		let mut claimed = Vec::with_capacity(candidates.len());

		for mut trigger in candidates {
			let won = match self
				.repository
				.update_if_version(trigger.id, trigger.version, &claim)
				.await
			{
				Ok(won) => won,
				Err(e) => {
					if !claimed.is_empty() {
						warn!(
							abandoned = claimed.len(),
							"Dropping claimed triggers after store error, they stay READY"
						);
					}
					return Err(e);
				}
			};

			if !won {
				debug!(trigger_id = %trigger.id, "Lost claim race, another instance has it");
				continue;
			}

			trigger.status = TriggerStatus::Ready;
			trigger.version += 1;
			trigger.updated_at = now;
			claimed.push(trigger);
		}

		debug!(claimed = claimed.len(), "Claimed due triggers");
		Ok(claimed)
	}
}
