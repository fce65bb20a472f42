// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Cadence trigger scheduler binary.

use std::path::PathBuf;
use std::sync::Arc;

use cadence_server::{version, CommandTriggerHandler, COMMAND_TRIGGER_TYPE};
use cadence_server_db::{
	create_pool, run_migrations, MigrationLock, MigrationLockOptions, SqliteLockStore,
	SqliteTriggerRepository,
};
use cadence_server_scheduler::{
	ProcessSignaler, SchedulerFacade, ShutdownCoordinator, Signal, SystemClock,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cadence server - polls for due triggers and runs them.
#[derive(Parser, Debug)]
#[command(name = "cadence-server", about = "Time-based trigger scheduler", version)]
struct Args {
	/// Config file to read instead of /etc/cadence/server.toml
	#[arg(long, env = "CADENCE_SERVER_CONFIG")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Show version and build information
	Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	if let Some(Command::Version) = args.command {
		println!("{}", version::format_version_info());
		return Ok(());
	}

	dotenvy::dotenv().ok();

	let config = match &args.config {
		Some(path) => cadence_server_config::load_config_with_file(path)?,
		None => cadence_server_config::load_config()?,
	};

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| config.logging.level.clone().into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	tracing::info!(
		database = %config.database.url,
		execution_enabled = config.scheduler.execution_enabled,
		"starting cadence-server"
	);

	let pool = create_pool(&config.database.url).await?;

	if config.migrations.run {
		let lock = MigrationLock::new(
			SqliteLockStore::new(pool.clone()),
			MigrationLockOptions {
				retry_interval: config.migrations.lock_retry_interval(),
				max_wait: config.migrations.lock_max_wait(),
			},
		);
		let applied = lock.with_lock(|| run_migrations(&pool)).await??;
		tracing::info!(count = applied.len(), "migrations complete");
	} else {
		tracing::info!("skipping migrations, CADENCE_SERVER_RUN_MIGRATIONS is not true");
	}

	let coordinator = Arc::new(ShutdownCoordinator::new(
		process_signaler(),
		config.scheduler.graceful_shutdown_timeout,
	));
	let facade = SchedulerFacade::new(
		config.scheduler.clone(),
		coordinator.clone(),
		Arc::new(SystemClock),
	);

	let repository = Arc::new(SqliteTriggerRepository::new(
		pool.clone(),
		COMMAND_TRIGGER_TYPE,
	));
	facade
		.register(Arc::new(CommandTriggerHandler::new(
			config.scheduler.command_cron.clone(),
			repository,
		)))
		.await?;

	let signal = wait_for_termination().await?;
	tracing::info!(%signal, "Received shutdown signal");

	coordinator.initiate_shutdown(signal).await;
	facade.shutdown().await;
	pool.close().await;

	tracing::info!("Server shutdown complete");
	Ok(())
}

#[cfg(unix)]
fn process_signaler() -> Arc<dyn ProcessSignaler> {
	Arc::new(cadence_server_scheduler::UnixSignaler)
}

#[cfg(not(unix))]
fn process_signaler() -> Arc<dyn ProcessSignaler> {
	Arc::new(cadence_server_scheduler::NoopSignaler)
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<Signal> {
	use tokio::signal::unix::{signal, SignalKind};

	let mut terminate = signal(SignalKind::terminate())?;
	let mut interrupt = signal(SignalKind::interrupt())?;

	tokio::select! {
		_ = terminate.recv() => Ok(Signal::Term),
		_ = interrupt.recv() => Ok(Signal::Int),
	}
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<Signal> {
	tokio::signal::ctrl_c().await?;
	Ok(Signal::Int)
}
