// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Database layer for Cadence server.
//!
//! Holds the SQLite-backed trigger store, the schema migrations and the
//! distributed migration lock. Every trigger mutation goes through a
//! version-conditional update so that several server instances can poll the
//! same database without stepping on each other.

pub mod error;
pub mod migrate;
pub mod migration_lock;
pub mod pool;
pub mod testing;
pub mod trigger;

pub use error::{DbError, Result};
pub use migrate::{run_migrations, MIGRATOR};
pub use migration_lock::{
	LockStore, MigrationLock, MigrationLockError, MigrationLockOptions, SqliteLockStore,
	LOCK_TABLE_NAME,
};
pub use pool::create_pool;
pub use trigger::{
	NextRun, SqliteTriggerRepository, Trigger, TriggerId, TriggerRepository, TriggerSchedule,
	TriggerStatus, TriggerUpdate,
};
