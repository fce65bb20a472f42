// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persisted time-based triggers.
//!
//! A trigger row is mutated by several scheduler instances at once. The only
//! write primitive offered here is [`TriggerRepository::update_if_version`]:
//! it applies a change only when the row still carries the version the caller
//! read, and bumps the version in the same statement. Zero affected rows means
//! another instance got there first.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{DbError, Result};

const TRIGGER_COLUMNS: &str = "id, trigger_type, status, is_active, next_run_at, last_run_at, version, \
	cron_expression, timezone, payload, created_at, updated_at";

/// Unique identifier for a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerId(pub Uuid);

impl TriggerId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for TriggerId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for TriggerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for TriggerId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
	/// Waiting for its next run.
	Idle,
	/// Claimed by an instance but not yet started.
	Ready,
	Running,
	/// Last run failed. Not picked up again until something resets it.
	Error,
}

impl TriggerStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			TriggerStatus::Idle => "idle",
			TriggerStatus::Ready => "ready",
			TriggerStatus::Running => "running",
			TriggerStatus::Error => "error",
		}
	}
}

impl fmt::Display for TriggerStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for TriggerStatus {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"idle" => Ok(TriggerStatus::Idle),
			"ready" => Ok(TriggerStatus::Ready),
			"running" => Ok(TriggerStatus::Running),
			"error" => Ok(TriggerStatus::Error),
			_ => Err(format!("unknown trigger status: {s}")),
		}
	}
}

/// Recurrence carried by the trigger itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSchedule {
	pub cron_expression: String,
	/// IANA timezone: "Europe/Berlin"
	pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
	pub id: TriggerId,
	/// Handler kind that owns this trigger: "command", "report-refresh"
	pub trigger_type: String,
	pub status: TriggerStatus,
	pub is_active: bool,
	pub next_run_at: Option<DateTime<Utc>>,
	pub last_run_at: Option<DateTime<Utc>>,
	pub version: i64,
	pub schedule: Option<TriggerSchedule>,
	pub payload: Option<serde_json::Value>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Trigger {
	pub fn new(trigger_type: impl Into<String>, next_run_at: Option<DateTime<Utc>>) -> Self {
		let now = Utc::now();
		Self {
			id: TriggerId::new(),
			trigger_type: trigger_type.into(),
			status: TriggerStatus::Idle,
			is_active: true,
			next_run_at,
			last_run_at: None,
			version: 1,
			schedule: None,
			payload: None,
			created_at: now,
			updated_at: now,
		}
	}

	pub fn with_schedule(mut self, schedule: TriggerSchedule) -> Self {
		self.schedule = Some(schedule);
		self
	}

	pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
		self.payload = Some(payload);
		self
	}

	/// Whether the trigger matches the due-for-processing filter at `now`.
	pub fn is_due(&self, now: DateTime<Utc>) -> bool {
		self.is_active
			&& self.status == TriggerStatus::Idle
			&& self.next_run_at.is_some_and(|next| next <= now)
	}
}

/// What to do with `next_run_at` when applying an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
	Keep,
	Clear,
	At(DateTime<Utc>),
}

impl From<Option<DateTime<Utc>>> for NextRun {
	fn from(next: Option<DateTime<Utc>>) -> Self {
		match next {
			Some(at) => NextRun::At(at),
			None => NextRun::Clear,
		}
	}
}

/// A status transition applied through [`TriggerRepository::update_if_version`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerUpdate {
	pub status: TriggerStatus,
	pub updated_at: DateTime<Utc>,
	/// Overwrites `last_run_at` when set.
	pub last_run_at: Option<DateTime<Utc>>,
	pub next_run: NextRun,
}

impl TriggerUpdate {
	/// IDLE -> READY.
	pub fn claim(now: DateTime<Utc>) -> Self {
		Self {
			status: TriggerStatus::Ready,
			updated_at: now,
			last_run_at: None,
			next_run: NextRun::Keep,
		}
	}

	/// READY -> RUNNING.
	pub fn running(now: DateTime<Utc>) -> Self {
		Self {
			status: TriggerStatus::Running,
			updated_at: now,
			last_run_at: None,
			next_run: NextRun::Keep,
		}
	}

	pub fn completed(now: DateTime<Utc>, next_run_at: Option<DateTime<Utc>>) -> Self {
		Self {
			status: TriggerStatus::Idle,
			updated_at: now,
			last_run_at: Some(now),
			next_run: next_run_at.into(),
		}
	}

	pub fn failed(now: DateTime<Utc>, next_run_at: Option<DateTime<Utc>>) -> Self {
		Self {
			status: TriggerStatus::Error,
			updated_at: now,
			last_run_at: Some(now),
			next_run: next_run_at.into(),
		}
	}

	/// Puts an abandoned claim back into the pool.
	pub fn requeue(now: DateTime<Utc>) -> Self {
		Self {
			status: TriggerStatus::Idle,
			updated_at: now,
			last_run_at: None,
			next_run: NextRun::Keep,
		}
	}
}

/// Store access for one trigger type.
#[async_trait]
pub trait TriggerRepository: Send + Sync {
	/// The trigger type this repository is scoped to.
	fn trigger_type(&self) -> &str;

	/// Active, idle triggers whose next run is at or before `now`, oldest due first.
	async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Trigger>>;

	/// Triggers in `status` last updated at or before `updated_before`.
	async fn find_stale(
		&self,
		status: TriggerStatus,
		updated_before: DateTime<Utc>,
	) -> Result<Vec<Trigger>>;

	/// Applies `update` only if the row still has `expected_version`, incrementing
	/// the version. Returns `false` when no row matched.
	async fn update_if_version(
		&self,
		id: TriggerId,
		expected_version: i64,
		update: &TriggerUpdate,
	) -> Result<bool>;

	async fn insert(&self, trigger: &Trigger) -> Result<()>;

	async fn get(&self, id: TriggerId) -> Result<Option<Trigger>>;
}

/// SQLite implementation of the trigger repository.
#[derive(Clone)]
pub struct SqliteTriggerRepository {
	pool: SqlitePool,
	trigger_type: String,
}

impl SqliteTriggerRepository {
	pub fn new(pool: SqlitePool, trigger_type: impl Into<String>) -> Self {
		Self {
			pool,
			trigger_type: trigger_type.into(),
		}
	}
}

#[async_trait]
impl TriggerRepository for SqliteTriggerRepository {
	fn trigger_type(&self) -> &str {
		&self.trigger_type
	}

	#[tracing::instrument(skip(self), fields(trigger_type = %self.trigger_type))]
	async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Trigger>> {
		let rows = sqlx::query_as::<_, TriggerRow>(&format!(
			r#"
			SELECT {TRIGGER_COLUMNS}
			FROM time_triggers
			WHERE trigger_type = ?
				AND is_active = 1
				AND status = 'idle'
				AND next_run_at IS NOT NULL
				AND next_run_at <= ?
			ORDER BY next_run_at ASC
			"#
		))
		.bind(&self.trigger_type)
		.bind(format_timestamp(now))
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(Trigger::try_from).collect()
	}

	#[tracing::instrument(skip(self), fields(trigger_type = %self.trigger_type))]
	async fn find_stale(
		&self,
		status: TriggerStatus,
		updated_before: DateTime<Utc>,
	) -> Result<Vec<Trigger>> {
		let rows = sqlx::query_as::<_, TriggerRow>(&format!(
			r#"
			SELECT {TRIGGER_COLUMNS}
			FROM time_triggers
			WHERE trigger_type = ?
				AND status = ?
				AND updated_at <= ?
			ORDER BY updated_at ASC
			"#
		))
		.bind(&self.trigger_type)
		.bind(status.as_str())
		.bind(format_timestamp(updated_before))
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(Trigger::try_from).collect()
	}

	#[tracing::instrument(skip(self, update), fields(trigger_id = %id, status = %update.status))]
	async fn update_if_version(
		&self,
		id: TriggerId,
		expected_version: i64,
		update: &TriggerUpdate,
	) -> Result<bool> {
		let (replace_next, next_run_at) = match update.next_run {
			NextRun::Keep => (false, None),
			NextRun::Clear => (true, None),
			NextRun::At(at) => (true, Some(format_timestamp(at))),
		};

		let result = sqlx::query(
			r#"
			UPDATE time_triggers
			SET status = ?,
				version = version + 1,
				updated_at = ?,
				last_run_at = COALESCE(?, last_run_at),
				next_run_at = CASE WHEN ? THEN ? ELSE next_run_at END
			WHERE id = ? AND trigger_type = ? AND version = ?
			"#,
		)
		.bind(update.status.as_str())
		.bind(format_timestamp(update.updated_at))
		.bind(update.last_run_at.map(format_timestamp))
		.bind(replace_next)
		.bind(next_run_at)
		.bind(id.to_string())
		.bind(&self.trigger_type)
		.bind(expected_version)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	#[tracing::instrument(skip(self, trigger), fields(trigger_id = %trigger.id))]
	async fn insert(&self, trigger: &Trigger) -> Result<()> {
		if trigger.trigger_type != self.trigger_type {
			return Err(DbError::Internal(format!(
				"trigger type '{}' does not match repository type '{}'",
				trigger.trigger_type, self.trigger_type
			)));
		}

		let payload = trigger
			.payload
			.as_ref()
			.map(serde_json::to_string)
			.transpose()?;

		sqlx::query(
			r#"
			INSERT INTO time_triggers (
				id, trigger_type, status, is_active, next_run_at, last_run_at, version,
				cron_expression, timezone, payload, created_at, updated_at
			)
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
			"#,
		)
		.bind(trigger.id.to_string())
		.bind(&trigger.trigger_type)
		.bind(trigger.status.as_str())
		.bind(trigger.is_active)
		.bind(trigger.next_run_at.map(format_timestamp))
		.bind(trigger.last_run_at.map(format_timestamp))
		.bind(trigger.version)
		.bind(trigger.schedule.as_ref().map(|s| s.cron_expression.clone()))
		.bind(trigger.schedule.as_ref().map(|s| s.timezone.clone()))
		.bind(payload)
		.bind(format_timestamp(trigger.created_at))
		.bind(format_timestamp(trigger.updated_at))
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(trigger_id = %id))]
	async fn get(&self, id: TriggerId) -> Result<Option<Trigger>> {
		let row = sqlx::query_as::<_, TriggerRow>(&format!(
			"SELECT {TRIGGER_COLUMNS} FROM time_triggers WHERE id = ? AND trigger_type = ?"
		))
		.bind(id.to_string())
		.bind(&self.trigger_type)
		.fetch_optional(&self.pool)
		.await?;

		row.map(Trigger::try_from).transpose()
	}
}

/// Fixed-width RFC 3339 so that string comparison in SQL orders by time.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
	at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|_| DbError::InvalidRow(format!("invalid {field}: {value}")))
}

#[derive(sqlx::FromRow)]
struct TriggerRow {
	id: String,
	trigger_type: String,
	status: String,
	is_active: bool,
	next_run_at: Option<String>,
	last_run_at: Option<String>,
	version: i64,
	cron_expression: Option<String>,
	timezone: Option<String>,
	payload: Option<String>,
	created_at: String,
	updated_at: String,
}

impl TryFrom<TriggerRow> for Trigger {
	type Error = DbError;

	fn try_from(row: TriggerRow) -> Result<Self> {
		let schedule = row.cron_expression.map(|cron_expression| TriggerSchedule {
			cron_expression,
			timezone: row.timezone.unwrap_or_else(|| "UTC".to_string()),
		});

		Ok(Trigger {
			id: row
				.id
				.parse()
				.map_err(|_| DbError::InvalidRow(format!("invalid trigger id: {}", row.id)))?,
			trigger_type: row.trigger_type,
			status: row.status.parse().map_err(DbError::InvalidRow)?,
			is_active: row.is_active,
			next_run_at: row
				.next_run_at
				.map(|s| parse_timestamp("next_run_at", &s))
				.transpose()?,
			last_run_at: row
				.last_run_at
				.map(|s| parse_timestamp("last_run_at", &s))
				.transpose()?,
			version: row.version,
			schedule,
			payload: row
				.payload
				.map(|p| serde_json::from_str(&p))
				.transpose()?,
			created_at: parse_timestamp("created_at", &row.created_at)?,
			updated_at: parse_timestamp("updated_at", &row.updated_at)?,
		})
	}
}
