// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use cadence_server_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
	#[error("invalid cron expression '{expression}': {message}")]
	InvalidCron { expression: String, message: String },

	#[error("invalid timezone: {0}")]
	InvalidTimezone(String),

	#[error("cron expression '{0}' has no upcoming occurrence")]
	NoUpcomingRun(String),

	#[error("handler already registered: {0}")]
	AlreadyRegistered(String),

	#[error("database error: {0}")]
	Database(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
