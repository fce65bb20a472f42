// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Binds trigger handlers to their cron cadence.
//!
//! With execution disabled, a handler is only recorded as registered: no
//! repository access, no fetcher, no timer. That lets an instance serve
//! management traffic for a handler type without ever running it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_server_config::SchedulerConfig;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::fetcher::Fetcher;
use crate::handler::TriggerHandler;
use crate::reconcile::StaleClaimReconciler;
use crate::runner::Runner;
use crate::schedule::CronSchedule;
use crate::shutdown::ShutdownCoordinator;

/// How long [`SchedulerFacade::shutdown`] waits for a loop to stop, and again
/// after the shutdown deadline, before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
	/// Execution disabled on this instance.
	RegisteredOnly,
	Scheduled,
	Stopped,
}

pub struct SchedulerFacade {
	config: SchedulerConfig,
	coordinator: Arc<ShutdownCoordinator>,
	clock: Arc<dyn Clock>,
	registrations: Mutex<HashMap<String, RegistrationState>>,
	shutdown_tx: broadcast::Sender<()>,
	handles: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl SchedulerFacade {
	pub fn new(
		config: SchedulerConfig,
		coordinator: Arc<ShutdownCoordinator>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let (shutdown_tx, _) = broadcast::channel(1);
		Self {
			config,
			coordinator,
			clock,
			registrations: Mutex::new(HashMap::new()),
			shutdown_tx,
			handles: AsyncMutex::new(Vec::new()),
		}
	}

	pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
		&self.coordinator
	}

	#[instrument(skip(self, handler), fields(handler = %handler.name()))]
	pub async fn register(&self, handler: Arc<dyn TriggerHandler>) -> Result<()> {
		let name = handler.name().to_string();

		if !self.config.execution_enabled {
			self.claim_name(&name, RegistrationState::RegisteredOnly)?;
			info!(handler = %name, "Trigger handler registered but execution disabled on this instance");
			return Ok(());
		}

		let schedule = CronSchedule::parse(handler.cron_expression())?;
		self.claim_name(&name, RegistrationState::Scheduled)?;

		let repository = handler.repository();
		let reconciler = self.config.stale_claim_timeout.map(|timeout| {
			StaleClaimReconciler::new(&name, repository.clone(), self.clock.clone(), timeout)
		});
		let job = CronJob {
			fetcher: Fetcher::new(&name, repository.clone(), self.clock.clone()),
			runner: Runner::new(
				handler,
				repository,
				self.coordinator.clone(),
				self.clock.clone(),
			),
			reconciler,
			handler: name.clone(),
			schedule,
			timezone: self.config.timezone,
			clock: self.clock.clone(),
			coordinator: self.coordinator.clone(),
		};

		info!(
			handler = %name,
			cron = job.schedule.expression(),
			timezone = %job.timezone,
			"Trigger handler scheduled"
		);

		let handle = tokio::spawn(job.run(self.shutdown_tx.subscribe()));
		self.handles.lock().await.push(handle);
		Ok(())
	}

	fn claim_name(&self, name: &str, state: RegistrationState) -> Result<()> {
		let mut registrations = self.registrations.lock();
		if registrations.contains_key(name) {
			return Err(SchedulerError::AlreadyRegistered(name.to_string()));
		}
		registrations.insert(name.to_string(), state);
		Ok(())
	}

	pub fn registration_state(&self, handler: &str) -> Option<RegistrationState> {
		self.registrations.lock().get(handler).copied()
	}

	/// Stops every cron loop. A firing already in progress is allowed to
	/// finish; once the coordinator is shutting down, it is only aborted after
	/// the coordinator's own deadline has passed.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(());

		let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
		for mut handle in handles {
			if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_ok() {
				continue;
			}
			if self.coordinator.is_shutting_down() {
				info!("Scheduled run still in progress, waiting for shutdown to complete");
				self.coordinator.wait_for_completion().await;
				if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_ok() {
					continue;
				}
			}
			warn!("Scheduled run did not stop in time, aborting it");
			handle.abort();
		}

		for state in self.registrations.lock().values_mut() {
			if *state == RegistrationState::Scheduled {
				*state = RegistrationState::Stopped;
			}
		}
		info!("Trigger scheduler shut down");
	}
}

struct CronJob {
	handler: String,
	schedule: CronSchedule,
	timezone: Tz,
	clock: Arc<dyn Clock>,
	coordinator: Arc<ShutdownCoordinator>,
	fetcher: Fetcher,
	runner: Runner,
	reconciler: Option<StaleClaimReconciler>,
}

impl CronJob {
	async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
		let mut last_fired: Option<DateTime<Utc>> = None;

		loop {
			let now = self.clock.now();
			// never fire the same slot twice if the timer wakes a little early
			let from = last_fired.map_or(now, |last| last.max(now));
			let Some(next) = self.schedule.next_after(self.timezone, from) else {
				warn!(handler = %self.handler, "Cron expression has no further occurrences, stopping");
				break;
			};
			let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

			tokio::select! {
				_ = tokio::time::sleep(delay) => {
					last_fired = Some(next);
					self.fire().await;
				}
				_ = shutdown_rx.recv() => {
					info!(handler = %self.handler, "Stopping trigger schedule");
					break;
				}
			}
		}
	}

	async fn fire(&self) {
		// registered before the check so a shutdown starting mid-fetch waits for us
		let _firing = self
			.coordinator
			.track(format!("firing:{}:{}", self.handler, Uuid::new_v4()));
		if self.coordinator.is_shutting_down() {
			info!(handler = %self.handler, "Shutdown in progress, skipping scheduled run");
			return;
		}

		if let Some(reconciler) = &self.reconciler {
			reconciler.requeue_stale().await;
		}

		let claimed = self.fetcher.fetch_due().await;
		if claimed.is_empty() {
			debug!(handler = %self.handler, "No due triggers");
			return;
		}

		self.runner.run(claimed).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::ManualClock;
	use crate::signal::NoopSignaler;
	use crate::testing::{MemoryTriggerRepository, RecordingHandler};
	use cadence_server_db::{Trigger, TriggerStatus};
	use chrono::TimeZone;
	use std::sync::atomic::Ordering;

	fn t0() -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2026, 7, 14, 12, 0, 30).unwrap()
	}

	fn coordinator() -> Arc<ShutdownCoordinator> {
		Arc::new(ShutdownCoordinator::new(
			Arc::new(NoopSignaler),
			Duration::from_secs(60),
		))
	}

	fn facade(config: SchedulerConfig, coordinator: Arc<ShutdownCoordinator>) -> SchedulerFacade {
		SchedulerFacade::new(config, coordinator, Arc::new(ManualClock::new(t0())))
	}

	fn handler_with_due_trigger() -> (Arc<RecordingHandler>, Arc<MemoryTriggerRepository>, Trigger) {
		let repository = Arc::new(MemoryTriggerRepository::new("report"));
		let trigger = Trigger::new("report", Some(t0() - chrono::Duration::minutes(1)));
		repository.put(trigger.clone());
		let handler = Arc::new(RecordingHandler::new("report", "* * * * *", repository.clone()));
		(handler, repository, trigger)
	}

	#[tokio::test(start_paused = true)]
	async fn test_registration_mode_builds_nothing() {
		let (handler, repository, _) = handler_with_due_trigger();
		let facade = facade(
			SchedulerConfig {
				execution_enabled: false,
				..Default::default()
			},
			coordinator(),
		);

		facade.register(handler.clone()).await.unwrap();
		tokio::time::sleep(Duration::from_secs(180)).await;

		assert_eq!(
			facade.registration_state("report"),
			Some(RegistrationState::RegisteredOnly)
		);
		assert_eq!(handler.repository_calls.load(Ordering::SeqCst), 0);
		assert_eq!(repository.find_calls.load(Ordering::SeqCst), 0);
		assert!(handler.processed().is_empty());
		assert!(facade.handles.lock().await.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_execution_mode_claims_and_runs_due_triggers() {
		let (handler, repository, trigger) = handler_with_due_trigger();
		let facade = facade(SchedulerConfig::default(), coordinator());

		facade.register(handler.clone()).await.unwrap();
		assert_eq!(
			facade.registration_state("report"),
			Some(RegistrationState::Scheduled)
		);

		tokio::time::sleep(Duration::from_secs(61)).await;

		assert_eq!(handler.processed(), vec![trigger.id]);
		let row = repository.row(trigger.id);
		assert_eq!(row.status, TriggerStatus::Idle);
		assert_eq!(row.last_run_at, Some(t0()));

		facade.shutdown().await;
		assert_eq!(
			facade.registration_state("report"),
			Some(RegistrationState::Stopped)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_firings_are_skipped_during_shutdown() {
		let (handler, repository, trigger) = handler_with_due_trigger();
		let coordinator = coordinator();
		let facade = facade(SchedulerConfig::default(), coordinator.clone());
		facade.register(handler.clone()).await.unwrap();

		coordinator.initiate_shutdown(crate::signal::Signal::Term).await;
		tokio::time::sleep(Duration::from_secs(150)).await;

		assert!(handler.processed().is_empty());
		assert_eq!(repository.find_calls.load(Ordering::SeqCst), 0);
		assert_eq!(repository.row(trigger.id).status, TriggerStatus::Idle);
		facade.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn test_shutdown_during_fetch_waits_and_hands_claims_back() {
		let (handler, repository, trigger) = handler_with_due_trigger();
		*repository.find_delay.lock() = Some(Duration::from_secs(2));
		*handler.work.lock() = Some(Duration::from_secs(120));
		let coordinator = coordinator();
		let facade = facade(SchedulerConfig::default(), coordinator.clone());
		facade.register(handler.clone()).await.unwrap();

		// fires 30s in, fetch runs until 32s
		tokio::time::sleep(Duration::from_secs(31)).await;
		assert_eq!(repository.find_calls.load(Ordering::SeqCst), 1);
		let started = tokio::time::Instant::now();
		coordinator.initiate_shutdown(crate::signal::Signal::Term).await;

		assert_eq!(started.elapsed(), Duration::from_secs(1));
		assert!(handler.processed().is_empty());
		let row = repository.row(trigger.id);
		assert_eq!(row.status, TriggerStatus::Idle);
		// claimed, then handed back
		assert_eq!(row.version, trigger.version + 2);
		assert!(coordinator.active_processes().is_empty());

		facade.shutdown().await;
		assert_eq!(
			facade.registration_state("report"),
			Some(RegistrationState::Stopped)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_facade_stop_lets_running_handler_drain() {
		let (handler, repository, trigger) = handler_with_due_trigger();
		*handler.work.lock() = Some(Duration::from_secs(40));
		let coordinator = coordinator();
		let facade = facade(SchedulerConfig::default(), coordinator.clone());
		facade.register(handler.clone()).await.unwrap();

		// handler starts at 30s and needs until 70s; the deadline is at 95s
		tokio::time::sleep(Duration::from_secs(35)).await;
		assert_eq!(handler.processed(), vec![trigger.id]);
		let started = tokio::time::Instant::now();

		tokio::join!(
			coordinator.initiate_shutdown(crate::signal::Signal::Term),
			async {
				tokio::time::sleep(Duration::from_secs(1)).await;
				facade.shutdown().await;
			},
		);

		assert!(started.elapsed() >= Duration::from_secs(35));
		assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
		let row = repository.row(trigger.id);
		assert_eq!(row.status, TriggerStatus::Idle);
		assert_eq!(row.last_run_at, Some(t0()));
		assert_eq!(
			facade.registration_state("report"),
			Some(RegistrationState::Stopped)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_stale_claims_requeued_before_fetch() {
		let repository = Arc::new(MemoryTriggerRepository::new("report"));
		let mut stuck = Trigger::new("report", Some(t0() - chrono::Duration::hours(1)));
		stuck.status = TriggerStatus::Ready;
		stuck.updated_at = t0() - chrono::Duration::hours(1);
		repository.put(stuck.clone());
		let handler = Arc::new(RecordingHandler::new("report", "* * * * *", repository.clone()));

		let facade = facade(
			SchedulerConfig {
				stale_claim_timeout: Some(Duration::from_secs(30 * 60)),
				..Default::default()
			},
			coordinator(),
		);
		facade.register(handler.clone()).await.unwrap();
		tokio::time::sleep(Duration::from_secs(61)).await;

		assert_eq!(handler.processed(), vec![stuck.id]);
		assert_eq!(repository.row(stuck.id).status, TriggerStatus::Idle);
		facade.shutdown().await;
	}

	#[tokio::test]
	async fn test_duplicate_registration_rejected() {
		let (handler, _, _) = handler_with_due_trigger();
		let facade = facade(
			SchedulerConfig {
				execution_enabled: false,
				..Default::default()
			},
			coordinator(),
		);

		facade.register(handler.clone()).await.unwrap();
		let err = facade.register(handler).await.unwrap_err();
		assert!(matches!(err, SchedulerError::AlreadyRegistered(name) if name == "report"));
	}

	#[tokio::test]
	async fn test_invalid_cron_rejected_in_execution_mode() {
		let repository = Arc::new(MemoryTriggerRepository::new("report"));
		let handler = Arc::new(RecordingHandler::new("report", "whenever", repository));
		let facade = facade(SchedulerConfig::default(), coordinator());

		let err = facade.register(handler).await.unwrap_err();
		assert!(matches!(err, SchedulerError::InvalidCron { .. }));
		assert_eq!(facade.registration_state("report"), None);
	}
}
