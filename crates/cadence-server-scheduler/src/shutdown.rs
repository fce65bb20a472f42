// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Active-process registry and graceful shutdown.
//!
//! Shutdown completes on whichever comes first: the registry draining to
//! empty, or the deadline passing (at which point anything still registered
//! with a pid gets SIGKILL).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::signal::{ProcessSignaler, Signal, SignalError};

/// Work currently owned by this instance.
#[derive(Debug, Clone)]
pub struct ActiveProcess {
	pub id: String,
	pub started_at: Instant,
	/// Leader of the child's process group, if the work spawned one.
	pub pid: Option<u32>,
}

impl ActiveProcess {
	pub fn elapsed(&self) -> Duration {
		self.started_at.elapsed()
	}
}

pub struct ShutdownCoordinator {
	processes: Mutex<HashMap<String, ActiveProcess>>,
	shutting_down: AtomicBool,
	/// Signal sent at shutdown, replayed to pids attached afterwards.
	shutdown_signal: Mutex<Option<Signal>>,
	completed: watch::Sender<bool>,
	signaler: Arc<dyn ProcessSignaler>,
	timeout: Duration,
}

impl ShutdownCoordinator {
	pub fn new(signaler: Arc<dyn ProcessSignaler>, timeout: Duration) -> Self {
		let (completed, _) = watch::channel(false);
		Self {
			processes: Mutex::new(HashMap::new()),
			shutting_down: AtomicBool::new(false),
			shutdown_signal: Mutex::new(None),
			completed,
			signaler,
			timeout,
		}
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::SeqCst)
	}

	pub fn is_complete(&self) -> bool {
		*self.completed.borrow()
	}

	pub fn register_active_process(&self, id: impl Into<String>) -> String {
		let id = id.into();
		self.processes.lock().insert(
			id.clone(),
			ActiveProcess {
				id: id.clone(),
				started_at: Instant::now(),
				pid: None,
			},
		);
		debug!(process_id = %id, "registered active process");
		id
	}

	/// Registers `id` and returns a guard that unregisters it on drop.
	pub fn track(self: &Arc<Self>, id: impl Into<String>) -> ActiveProcessGuard {
		let id = self.register_active_process(id);
		ActiveProcessGuard {
			coordinator: Arc::clone(self),
			id,
		}
	}

	pub fn unregister_active_process(&self, id: &str) {
		let drained = {
			let mut processes = self.processes.lock();
			if processes.remove(id).is_none() {
				return;
			}
			processes.is_empty()
		};
		debug!(process_id = %id, "unregistered active process");

		if drained && self.is_shutting_down() {
			self.complete("all active processes finished");
		}
	}

	pub fn update_process_pid(&self, id: &str, pid: u32) {
		let found = match self.processes.lock().get_mut(id) {
			Some(process) => {
				process.pid = Some(pid);
				true
			}
			None => false,
		};

		if !found {
			warn!(process_id = %id, pid, "pid update for unknown process ignored");
			return;
		}

		let late_signal = *self.shutdown_signal.lock();
		if let Some(signal) = late_signal {
			self.deliver(id, pid, signal);
		}
	}

	/// Snapshot of the registry.
	pub fn active_processes(&self) -> Vec<ActiveProcess> {
		let mut processes: Vec<_> = self.processes.lock().values().cloned().collect();
		processes.sort_by_key(|p| p.started_at);
		processes
	}

	/// Signals in-flight work with `signal` and waits until it drains or the
	/// deadline forces it. Later calls wait on the same completion.
	#[instrument(skip(self), fields(signal = %signal))]
	pub async fn initiate_shutdown(self: &Arc<Self>, signal: Signal) {
		let mut done = self.completed.subscribe();

		if self.shutting_down.swap(true, Ordering::SeqCst) {
			debug!("shutdown already in progress, waiting for it");
			let _ = done.wait_for(|complete| *complete).await;
			return;
		}

		*self.shutdown_signal.lock() = Some(signal);

		let targets: Vec<(String, Option<u32>)> = self
			.processes
			.lock()
			.values()
			.map(|p| (p.id.clone(), p.pid))
			.collect();

		if targets.is_empty() {
			self.complete("no active processes");
			return;
		}

		info!(
			active = targets.len(),
			timeout_secs = self.timeout.as_secs(),
			"Initiating graceful shutdown, waiting for active processes"
		);

		for (id, pid) in &targets {
			if let Some(pid) = pid {
				self.deliver(id, *pid, signal);
			}
		}

		let coordinator = Arc::clone(self);
		let mut timer_done = self.completed.subscribe();
		tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(coordinator.timeout) => coordinator.force_kill(),
				_ = async { let _ = timer_done.wait_for(|complete| *complete).await; } => {}
			}
		});

		let _ = done.wait_for(|complete| *complete).await;
	}

	/// Resolves once a shutdown has completed, by draining or by deadline.
	pub async fn wait_for_completion(&self) {
		let mut done = self.completed.subscribe();
		let _ = done.wait_for(|complete| *complete).await;
	}

	fn force_kill(&self) {
		for process in self.active_processes() {
			warn!(
				process_id = %process.id,
				pid = ?process.pid,
				elapsed_minutes = process.elapsed().as_secs() / 60,
				"Graceful shutdown timed out with process still active"
			);
			if let Some(pid) = process.pid {
				self.deliver(&process.id, pid, Signal::Kill);
			}
		}
		self.complete("graceful shutdown timed out");
	}

	fn deliver(&self, id: &str, pid: u32, signal: Signal) {
		match self.signaler.signal_group(pid, signal) {
			Ok(()) => info!(process_id = %id, pid, %signal, "Signalled process group"),
			Err(SignalError::NotFound { .. }) => {
				warn!(process_id = %id, pid, %signal, "Process group already exited")
			}
			Err(e) => error!(process_id = %id, pid, %signal, error = %e, "Failed to signal process group"),
		}
	}

	fn complete(&self, reason: &'static str) {
		let first = self.completed.send_if_modified(|complete| {
			if *complete {
				false
			} else {
				*complete = true;
				true
			}
		});
		if first {
			info!(reason, "Shutdown complete");
		}
	}
}

/// Keeps a process registered for as long as it is alive.
pub struct ActiveProcessGuard {
	coordinator: Arc<ShutdownCoordinator>,
	id: String,
}

impl ActiveProcessGuard {
	pub fn id(&self) -> &str {
		&self.id
	}
}

impl Drop for ActiveProcessGuard {
	fn drop(&mut self) {
		self.coordinator.unregister_active_process(&self.id);
	}
}
