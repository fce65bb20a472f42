// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Embedded schema migrations.

use sqlx::migrate::Migrator;
use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::error::Result;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations and return the descriptions of the ones that ran.
///
/// Callers sharing a database with other instances should hold the
/// [`MigrationLock`](crate::MigrationLock) while this runs.
#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<Vec<String>> {
	let before = applied_versions(pool).await?;

	MIGRATOR.run(pool).await?;

	let executed: Vec<String> = MIGRATOR
		.iter()
		.filter(|m| !m.migration_type.is_down_migration() && !before.contains(&m.version))
		.map(|m| format!("{}_{}", m.version, m.description))
		.collect();

	if executed.is_empty() {
		tracing::info!("No new migrations to run");
	} else {
		tracing::info!(count = executed.len(), "Executed migrations");
		for name in &executed {
			tracing::info!(migration = %name, "applied migration");
		}
	}

	Ok(executed)
}

/// Versions recorded by sqlx. A fresh database has no bookkeeping table yet.
async fn applied_versions(pool: &SqlitePool) -> Result<HashSet<i64>> {
	match sqlx::query_scalar::<_, i64>("SELECT version FROM _sqlx_migrations WHERE success = 1")
		.fetch_all(pool)
		.await
	{
		Ok(versions) => Ok(versions.into_iter().collect()),
		Err(e) if is_missing_table(&e) => Ok(HashSet::new()),
		Err(e) => Err(e.into()),
	}
}

fn is_missing_table(error: &sqlx::Error) -> bool {
	match error {
		sqlx::Error::Database(db) => db.message().contains("no such table"),
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::create_test_pool;

	#[tokio::test]
	async fn test_run_migrations_reports_applied_once() {
		let pool = create_test_pool().await;

		let first = run_migrations(&pool).await.unwrap();
		assert_eq!(first.len(), 1);
		assert!(first[0].contains("create time triggers"));

		let second = run_migrations(&pool).await.unwrap();
		assert!(second.is_empty());

		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM time_triggers")
			.fetch_one(&pool)
			.await
			.unwrap();
		assert_eq!(count, 0);
	}

	#[tokio::test]
	async fn test_fresh_database_has_no_applied_versions() {
		let pool = create_test_pool().await;
		assert!(applied_versions(&pool).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_unreadable_bookkeeping_is_an_error() {
		let pool = create_test_pool().await;
		// a bookkeeping table without the columns sqlx writes
		sqlx::query("CREATE TABLE _sqlx_migrations (id INTEGER PRIMARY KEY)")
			.execute(&pool)
			.await
			.unwrap();

		assert!(applied_versions(&pool).await.is_err());
		assert!(run_migrations(&pool).await.is_err());
	}
}
