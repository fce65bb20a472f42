// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cron parsing and next-occurrence calculation.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// Convert a standard 5-field Unix cron expression to the 7-field format
/// expected by the `cron` crate by pinning seconds to 0 and allowing any year.
/// Six- and seven-field expressions pass through untouched.
fn to_cron_crate_format(expression: &str) -> String {
	let expression = expression.trim();
	if expression.split_whitespace().count() == 5 {
		format!("0 {expression} *")
	} else {
		expression.to_string()
	}
}

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
	expression: String,
	schedule: Schedule,
}

impl CronSchedule {
	pub fn parse(expression: &str) -> Result<Self> {
		let schedule = Schedule::from_str(&to_cron_crate_format(expression)).map_err(|e| {
			SchedulerError::InvalidCron {
				expression: expression.to_string(),
				message: e.to_string(),
			}
		})?;
		Ok(Self {
			expression: expression.to_string(),
			schedule,
		})
	}

	pub fn expression(&self) -> &str {
		&self.expression
	}

	/// First occurrence strictly after `after`, evaluated in `timezone`.
	pub fn next_after(&self, timezone: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
		let local_after = after.with_timezone(&timezone);
		self.schedule
			.after(&local_after)
			.next()
			.map(|next| next.with_timezone(&Utc))
	}
}

pub fn parse_timezone(timezone: &str) -> Result<Tz> {
	timezone
		.parse()
		.map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))
}

/// Next run of `expression` in `timezone` after `after`, in UTC.
pub fn next_occurrence(expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
	let tz = parse_timezone(timezone)?;
	CronSchedule::parse(expression)?
		.next_after(tz, after)
		.ok_or_else(|| SchedulerError::NoUpcomingRun(expression.to_string()))
}
