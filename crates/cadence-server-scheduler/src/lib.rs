// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Time-based trigger scheduling for Cadence server.
//!
//! Each registered [`TriggerHandler`] gets a cron loop that claims due
//! triggers through a version-conditional update ([`Fetcher`]) and runs them
//! ([`Runner`]). Every run is tracked by the [`ShutdownCoordinator`], which on
//! termination signals child process groups and waits, bounded by a deadline,
//! for in-flight work to drain.

pub mod clock;
pub mod error;
pub mod facade;
pub mod fetcher;
pub mod handler;
pub mod reconcile;
pub mod runner;
pub mod schedule;
pub mod shutdown;
pub mod signal;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SchedulerError};
pub use facade::{RegistrationState, SchedulerFacade};
pub use fetcher::Fetcher;
pub use handler::{HandlerError, TriggerContext, TriggerHandler};
pub use reconcile::StaleClaimReconciler;
pub use runner::{RunOutcome, RunSummary, Runner};
pub use schedule::{next_occurrence, parse_timezone, CronSchedule};
pub use shutdown::{ActiveProcess, ActiveProcessGuard, ShutdownCoordinator};
#[cfg(unix)]
pub use signal::UnixSignaler;
pub use signal::{NoopSignaler, ProcessSignaler, RecordingSignaler, Signal, SignalError};
