use std::{num::NonZeroU64, sync::Arc};

use chrono::Utc;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic as _, Result, miette};
use tracing::info;

use crate::{
	actions::{Context, GlobalArgs},
	alerts::{AlertChannel, AlertRouter, AlertRouterConfig, FileLogChannel},
	mysql::MySqlController,
	orchestrator::{OperationTimeouts, Orchestrator},
	recovery::ErrorRecovery,
	scheduler::{BackupRunner, DEFAULT_MAX_CONCURRENT_RUNS, Scheduler, SchedulerEvent, next_fire},
	store::{ScheduleConfiguration, Store},
	transfer::TransferClient,
};

/// Manage cron schedules and run the scheduler.
#[derive(Debug, Clone, Parser)]
pub struct ScheduleArgs {
	#[command(subcommand)]
	pub action: ScheduleAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ScheduleAction {
	/// List schedules with their next fire time
	List,
	/// Add a schedule for a configuration
	Add {
		/// Configuration id to back up
		#[arg(long)]
		config: String,
		/// Cron expression (seconds-resolution, e.g. "0 0 3 * * *")
		#[arg(long)]
		cron: String,
	},
	/// Enable a schedule
	Enable { id: String },
	/// Disable a schedule
	Disable { id: String },
	/// Run the scheduler in the foreground until interrupted
	Run {
		/// Ceiling on concurrently running backups
		#[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_RUNS)]
		max_concurrent: usize,
		/// Where archives are staged locally before transfer
		#[arg(long, default_value = std::env::temp_dir().into_os_string())]
		work_dir: std::path::PathBuf,
		/// Timeout for each MySQL stop/start operation
		#[arg(long, default_value = "3m", value_parser = humantime::parse_duration)]
		mysql_timeout: std::time::Duration,
		/// Timeout for the compression phase
		#[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
		compression_timeout: std::time::Duration,
		/// Timeout for the transfer phase
		#[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
		transfer_timeout: std::time::Duration,
	},
}

pub async fn run(ctx: Context<GlobalArgs, ScheduleArgs>) -> Result<()> {
	let GlobalArgs { data_dir, json } = ctx.args_top.clone();
	let store = Arc::new(Store::open(&data_dir));

	match ctx.args_sub.action.clone() {
		ScheduleAction::List => {
			let schedules = store.schedule_list().await.into_diagnostic()?;
			if json {
				let rows: Vec<_> = schedules
					.iter()
					.map(|s| {
						serde_json::json!({
							"id": s.id,
							"configurationId": s.configuration_id,
							"cron": s.cron,
							"enabled": s.enabled,
							"nextFire": next_fire(&s.cron, Utc::now()).ok(),
						})
					})
					.collect();
				println!("{}", serde_json::to_string_pretty(&rows).into_diagnostic()?);
			} else {
				for s in schedules {
					let next = next_fire(&s.cron, Utc::now())
						.map(|at| at.to_rfc3339())
						.unwrap_or_else(|_| "invalid".into());
					println!(
						"{}\tconfig={}\tcron={:?}\tenabled={}\tnext={next}",
						s.id, s.configuration_id, s.cron, s.enabled
					);
				}
			}
			Ok(())
		}

		ScheduleAction::Add { config, cron } => {
			// Reject unparseable expressions up front.
			next_fire(&cron, Utc::now()).into_diagnostic()?;
			store
				.config_get(&config)
				.await
				.into_diagnostic()?
				.ok_or_else(|| miette!("no configuration {config:?}"))?;

			let schedule = ScheduleConfiguration {
				id: uuid::Uuid::new_v4().to_string(),
				configuration_id: config,
				cron,
				enabled: true,
				created_at: Utc::now(),
			};
			store.schedule_put(schedule.clone()).await.into_diagnostic()?;
			if json {
				println!("{}", serde_json::json!({ "id": schedule.id }));
			} else {
				println!("{}", schedule.id);
			}
			Ok(())
		}

		ScheduleAction::Enable { id } => {
			if !store.schedule_set_enabled(&id, true).await.into_diagnostic()? {
				return Err(miette!("no schedule {id:?}"));
			}
			Ok(())
		}

		ScheduleAction::Disable { id } => {
			if !store.schedule_set_enabled(&id, false).await.into_diagnostic()? {
				return Err(miette!("no schedule {id:?}"));
			}
			Ok(())
		}

		ScheduleAction::Run {
			max_concurrent,
			work_dir,
			mysql_timeout,
			compression_timeout,
			transfer_timeout,
		} => {
			let timeouts = OperationTimeouts {
				mysql: mysql_timeout,
				compression: compression_timeout,
				transfer: transfer_timeout,
			};
			let alerts = Arc::new(AlertRouter::new(
				AlertRouterConfig::default(),
				vec![AlertChannel::FileLog(FileLogChannel::new(
					data_dir.join("alerts.jsonl"),
				))],
			));

			let runner: BackupRunner = {
				let store = store.clone();
				let alerts = alerts.clone();
				let work_dir = work_dir.clone();
				Arc::new(move |config, on_progress, cancel| {
					let store = store.clone();
					let alerts = alerts.clone();
					let work_dir = work_dir.clone();
					Box::pin(async move {
						let mysql = MySqlController::new(&config.source.service_name);
						let transfer = TransferClient {
							host: config.target.host.clone(),
							port: config.target.port,
							tls: config.target.tls,
							client_id: config.client_id.clone(),
							client_secret: config.client_secret.clone(),
							chunk_size: NonZeroU64::new(config.chunk_size)
								.unwrap_or(coldbak_proto::chunk::DEFAULT_CHUNK_SIZE),
							max_in_flight: crate::transfer::DEFAULT_MAX_IN_FLIGHT,
						};
						let mut orchestrator = Orchestrator::new(
							store,
							mysql,
							transfer,
							Arc::new(ErrorRecovery::new(alerts)),
							work_dir,
						);
						orchestrator.timeouts = timeouts;
						orchestrator
							.run(&config, move |report| on_progress(report), cancel)
							.await
					})
				})
			};

			let scheduler = Scheduler::new(store, runner, max_concurrent);
			let mut events = scheduler.subscribe();
			let spawned = scheduler.start().await.into_diagnostic()?;
			info!(schedules = spawned, "scheduler running, ctrl-c to stop");

			loop {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => break,
					event = events.recv() => {
						match event {
							Ok(SchedulerEvent::BackupCompleted { schedule_id, log_id, success }) => {
								info!(schedule_id, log_id, success, "scheduled backup finished");
							}
							Ok(SchedulerEvent::ProgressUpdated { .. }) => {}
							Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
							Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
						}
					}
				}
			}

			scheduler.shutdown().await;
			Ok(())
		}
	}
}
