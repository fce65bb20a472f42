// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

use crate::pool::create_pool;

/// In-memory pool pinned to a single connection so every query sees the same database.
pub async fn create_test_pool() -> SqlitePool {
	SqlitePoolOptions::new()
		.max_connections(1)
		.idle_timeout(None)
		.max_lifetime(None)
		.connect("sqlite::memory:")
		.await
		.unwrap()
}

pub async fn create_trigger_test_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	crate::migrate::MIGRATOR.run(&pool).await.unwrap();
	pool
}

/// File-backed pool for tests that need several independent connections,
/// standing in for separate server instances.
pub async fn create_file_test_pool(path: &Path) -> SqlitePool {
	create_pool(&format!("sqlite:{}", path.display()))
		.await
		.unwrap()
}
