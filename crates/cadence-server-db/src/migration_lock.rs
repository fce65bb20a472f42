// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Start-up mutex guarding schema migrations.
//!
//! Several instances may boot against the same database at once. Whoever
//! manages to create the sentinel table owns the lock; everyone else sees
//! "already exists", waits, and tries again until the owner drops the table.

use async_trait::async_trait;
use futures::FutureExt;
use sqlx::SqlitePool;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::error::{DbError, Result};

pub const LOCK_TABLE_NAME: &str = "__migrations_lock__";

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum MigrationLockError {
	#[error("timed out waiting for migrations lock after {waited_secs} seconds")]
	Timeout { waited_secs: u64 },

	#[error("migrations lock store failed: {0}")]
	Store(#[from] DbError),
}

/// Atomic create-if-absent resource backing the lock.
#[async_trait]
pub trait LockStore: Send + Sync {
	/// Returns `Ok(false)` when the lock is already held elsewhere.
	async fn try_acquire(&self) -> Result<bool>;

	async fn release(&self) -> Result<()>;
}

/// Lock held as the existence of [`LOCK_TABLE_NAME`].
#[derive(Clone)]
pub struct SqliteLockStore {
	pool: SqlitePool,
}

impl SqliteLockStore {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl LockStore for SqliteLockStore {
	async fn try_acquire(&self) -> Result<bool> {
		let result = sqlx::query(&format!(
			"CREATE TABLE {LOCK_TABLE_NAME} (id INTEGER PRIMARY KEY)"
		))
		.execute(&self.pool)
		.await;

		match result {
			Ok(_) => Ok(true),
			Err(e) if is_already_exists(&e) => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	async fn release(&self) -> Result<()> {
		sqlx::query(&format!("DROP TABLE {LOCK_TABLE_NAME}"))
			.execute(&self.pool)
			.await?;
		Ok(())
	}
}

fn is_already_exists(error: &sqlx::Error) -> bool {
	match error {
		sqlx::Error::Database(db) => db.message().to_lowercase().contains("already exists"),
		_ => false,
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationLockOptions {
	/// Pause between acquisition attempts.
	pub retry_interval: Duration,
	/// Total time to keep trying before giving up.
	pub max_wait: Duration,
}

impl Default for MigrationLockOptions {
	fn default() -> Self {
		Self {
			retry_interval: DEFAULT_RETRY_INTERVAL,
			max_wait: DEFAULT_MAX_WAIT,
		}
	}
}

pub struct MigrationLock<S> {
	store: Arc<S>,
	options: MigrationLockOptions,
}

impl<S: LockStore + 'static> MigrationLock<S> {
	pub fn new(store: S, options: MigrationLockOptions) -> Self {
		Self {
			store: Arc::new(store),
			options,
		}
	}

	/// Runs `run` while holding the lock and releases it afterwards, whatever
	/// `run` produced. A failed release is logged rather than masking the result.
	///
	/// A panic in `run` is re-raised after the release. If this future is
	/// dropped while holding the lock, the release moves to a background task.
	///
	/// # Errors
	/// [`MigrationLockError::Timeout`] once `max_wait` elapses without acquiring,
	/// [`MigrationLockError::Store`] for anything other than contention.
	#[instrument(skip(self, run))]
	pub async fn with_lock<F, Fut, T>(&self, run: F) -> std::result::Result<T, MigrationLockError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		self.acquire().await?;
		let held = HeldLock {
			store: Some(Arc::clone(&self.store)),
		};

		let output = AssertUnwindSafe(run()).catch_unwind().await;

		held.release().await;
		match output {
			Ok(output) => Ok(output),
			Err(panic) => std::panic::resume_unwind(panic),
		}
	}

	async fn acquire(&self) -> std::result::Result<(), MigrationLockError> {
		let started = Instant::now();

		loop {
			if self.store.try_acquire().await? {
				info!(table = LOCK_TABLE_NAME, "Acquired migrations lock");
				return Ok(());
			}

			let waited = started.elapsed();
			if waited > self.options.max_wait {
				return Err(MigrationLockError::Timeout {
					waited_secs: waited.as_secs(),
				});
			}

			info!(
				retry_secs = self.options.retry_interval.as_secs_f64(),
				"Another instance is running migrations, waiting"
			);
			tokio::time::sleep(self.options.retry_interval).await;
		}
	}
}

async fn release_logged<S: LockStore + ?Sized>(store: &S) {
	match store.release().await {
		Ok(()) => info!(table = LOCK_TABLE_NAME, "Released migrations lock"),
		Err(e) => error!(table = LOCK_TABLE_NAME, error = %e, "Failed to release migrations lock"),
	}
}

/// Ownership of an acquired lock. Dropping it unreleased hands the release
/// to the runtime.
struct HeldLock<S: LockStore + 'static> {
	store: Option<Arc<S>>,
}

impl<S: LockStore + 'static> HeldLock<S> {
	async fn release(mut self) {
		if let Some(store) = self.store.take() {
			release_logged(store.as_ref()).await;
		}
	}
}

impl<S: LockStore + 'static> Drop for HeldLock<S> {
	fn drop(&mut self) {
		let Some(store) = self.store.take() else {
			return;
		};
		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				warn!(table = LOCK_TABLE_NAME, "Migrations lock holder dropped, releasing in background");
				runtime.spawn(async move { release_logged(store.as_ref()).await });
			}
			Err(_) => error!(
				table = LOCK_TABLE_NAME,
				"Migrations lock holder dropped outside a runtime, lock left in place"
			),
		}
	}
}
