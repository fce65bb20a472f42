// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory doubles for scheduler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_server_db::{
	DbError, NextRun, Result, Trigger, TriggerId, TriggerRepository, TriggerStatus, TriggerUpdate,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::handler::{HandlerError, TriggerContext, TriggerHandler};

/// Trigger repository backed by a map, with switches to make calls fail.
#[derive(Default)]
pub struct MemoryTriggerRepository {
	trigger_type: String,
	rows: Mutex<HashMap<TriggerId, Trigger>>,
	pub find_calls: AtomicUsize,
	pub update_calls: AtomicUsize,
	pub fail_find: AtomicBool,
	/// How long each `find_due` takes.
	pub find_delay: Mutex<Option<Duration>>,
	/// Fail every update after this many have succeeded.
	pub fail_updates_after: Mutex<Option<usize>>,
}

impl MemoryTriggerRepository {
	pub fn new(trigger_type: &str) -> Self {
		Self {
			trigger_type: trigger_type.to_string(),
			..Default::default()
		}
	}

	pub fn put(&self, trigger: Trigger) {
		self.rows.lock().insert(trigger.id, trigger);
	}

	pub fn row(&self, id: TriggerId) -> Trigger {
		self.rows.lock()[&id].clone()
	}
}

#[async_trait]
impl TriggerRepository for MemoryTriggerRepository {
	fn trigger_type(&self) -> &str {
		&self.trigger_type
	}

	async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Trigger>> {
		self.find_calls.fetch_add(1, Ordering::SeqCst);
		let delay = *self.find_delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if self.fail_find.load(Ordering::SeqCst) {
			return Err(DbError::Internal("database is locked".to_string()));
		}
		let mut due: Vec<_> = self
			.rows
			.lock()
			.values()
			.filter(|t| t.is_due(now))
			.cloned()
			.collect();
		due.sort_by_key(|t| t.next_run_at);
		Ok(due)
	}

	async fn find_stale(
		&self,
		status: TriggerStatus,
		updated_before: DateTime<Utc>,
	) -> Result<Vec<Trigger>> {
		Ok(self
			.rows
			.lock()
			.values()
			.filter(|t| t.status == status && t.updated_at <= updated_before)
			.cloned()
			.collect())
	}

	async fn update_if_version(
		&self,
		id: TriggerId,
		expected_version: i64,
		update: &TriggerUpdate,
	) -> Result<bool> {
		let done = self.update_calls.fetch_add(1, Ordering::SeqCst);
		if let Some(limit) = *self.fail_updates_after.lock() {
			if done >= limit {
				return Err(DbError::Internal("disk I/O error".to_string()));
			}
		}

		let mut rows = self.rows.lock();
		let Some(row) = rows.get_mut(&id) else {
			return Ok(false);
		};
		if row.version != expected_version {
			return Ok(false);
		}
		row.status = update.status;
		row.version += 1;
		row.updated_at = update.updated_at;
		if let Some(at) = update.last_run_at {
			row.last_run_at = Some(at);
		}
		match update.next_run {
			NextRun::Keep => {}
			NextRun::Clear => row.next_run_at = None,
			NextRun::At(at) => row.next_run_at = Some(at),
		}
		Ok(true)
	}

	async fn insert(&self, trigger: &Trigger) -> Result<()> {
		self.put(trigger.clone());
		Ok(())
	}

	async fn get(&self, id: TriggerId) -> Result<Option<Trigger>> {
		Ok(self.rows.lock().get(&id).cloned())
	}
}

/// Handler that records what it processed. Triggers listed in `fail` error
/// out, those in `panic` panic. `work` makes every run take that long.
pub struct RecordingHandler {
	pub name: String,
	pub cron: String,
	pub repository: Arc<MemoryTriggerRepository>,
	pub processed: Mutex<Vec<TriggerId>>,
	pub fail: Mutex<Vec<TriggerId>>,
	pub panic: Mutex<Vec<TriggerId>>,
	pub work: Mutex<Option<Duration>>,
	pub finished: AtomicUsize,
	pub repository_calls: AtomicUsize,
}

impl RecordingHandler {
	pub fn new(name: &str, cron: &str, repository: Arc<MemoryTriggerRepository>) -> Self {
		Self {
			name: name.to_string(),
			cron: cron.to_string(),
			repository,
			processed: Mutex::new(Vec::new()),
			fail: Mutex::new(Vec::new()),
			panic: Mutex::new(Vec::new()),
			work: Mutex::new(None),
			finished: AtomicUsize::new(0),
			repository_calls: AtomicUsize::new(0),
		}
	}

	pub fn processed(&self) -> Vec<TriggerId> {
		self.processed.lock().clone()
	}
}

#[async_trait]
impl TriggerHandler for RecordingHandler {
	fn name(&self) -> &str {
		&self.name
	}

	fn cron_expression(&self) -> &str {
		&self.cron
	}

	fn repository(&self) -> Arc<dyn TriggerRepository> {
		self.repository_calls.fetch_add(1, Ordering::SeqCst);
		self.repository.clone()
	}

	async fn process(&self, trigger: &Trigger, _ctx: &TriggerContext) -> std::result::Result<(), HandlerError> {
		self.processed.lock().push(trigger.id);
		let work = *self.work.lock();
		if let Some(work) = work {
			tokio::time::sleep(work).await;
		}
		if self.panic.lock().contains(&trigger.id) {
			panic!("handler blew up on {}", trigger.id);
		}
		if self.fail.lock().contains(&trigger.id) {
			return Err(HandlerError::Failed("upstream returned 503".to_string()));
		}
		self.finished.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}
