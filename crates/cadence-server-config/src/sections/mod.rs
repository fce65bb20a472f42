// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod database;
mod logging;
mod migrations;
mod scheduler;

pub use database::{DatabaseConfig, DatabaseConfigLayer};
pub use logging::{LoggingConfig, LoggingConfigLayer};
pub use migrations::{MigrationsConfig, MigrationsConfigLayer};
pub use scheduler::{SchedulerConfig, SchedulerConfigLayer};
