use std::{io::IsTerminal as _, io::stderr, num::NonZeroU64, sync::Arc, time::Duration};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use miette::{IntoDiagnostic as _, Result, miette};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
	actions::{Context, GlobalArgs},
	alerts::{
		AlertChannel, AlertRouter, AlertRouterConfig, AlertsFileConfig, FileLogChannel,
		WebhookChannel, WebhookMethod,
	},
	mysql::MySqlController,
	orchestrator::{OperationTimeouts, Orchestrator},
	recovery::{ErrorRecovery, RetryPolicy},
	store::{BackupStatus, Store},
	transfer::{DEFAULT_MAX_IN_FLIGHT, TransferClient},
};

/// Run one backup now.
///
/// Stops the configured MySQL service, archives its data directory, streams
/// the archive to the receiver, and starts the service again. The exit code
/// tells scripts what happened: 0 completed, 2 validation error, 3 MySQL
/// failure, 4 transfer failure, 5 integrity failure, 1 anything else.
#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
	/// Configuration id (or name) to run
	#[arg(long)]
	pub config: String,

	/// Where the archive is staged locally before transfer
	#[arg(long, default_value = std::env::temp_dir().into_os_string())]
	pub work_dir: std::path::PathBuf,

	/// Timeout for each MySQL stop/start operation
	#[arg(long, default_value = "3m", value_parser = humantime::parse_duration)]
	pub mysql_timeout: Duration,

	/// Timeout for the compression phase
	#[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
	pub compression_timeout: Duration,

	/// Timeout for the transfer phase
	#[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
	pub transfer_timeout: Duration,

	/// Retry attempts for failing phases
	#[arg(long, default_value_t = 3)]
	pub retries: u32,

	/// Chunks kept in flight during transfer
	#[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT)]
	pub max_concurrent_chunks: usize,

	/// Also deliver critical alerts to this webhook (JSON POST)
	#[arg(long)]
	pub alert_webhook: Option<String>,

	/// Alert routing configuration file (JSON); overrides the defaults
	#[arg(long)]
	pub alerts_config: Option<std::path::PathBuf>,
}

pub async fn run(ctx: Context<GlobalArgs, RunArgs>) -> Result<()> {
	let GlobalArgs { data_dir, json } = ctx.args_top.clone();
	let args = ctx.args_sub;

	let store = Arc::new(Store::open(&data_dir));
	let config = store
		.config_get(&args.config)
		.await
		.into_diagnostic()?
		.ok_or_else(|| miette!("no configuration {:?}", args.config))?;

	let alerts = match &args.alerts_config {
		Some(path) => {
			let file = AlertsFileConfig::load(path).await.into_diagnostic()?;
			let (router_config, channels, warnings) = file.build();
			for warning in warnings {
				warn!("alerts config: {warning}");
			}
			Arc::new(AlertRouter::new(router_config, channels))
		}
		None => {
			let mut channels = vec![AlertChannel::FileLog(FileLogChannel::new(
				data_dir.join("alerts.jsonl"),
			))];
			if let Some(url) = &args.alert_webhook {
				channels.push(AlertChannel::Webhook(WebhookChannel::new(
					url,
					WebhookMethod::Post,
					Duration::from_secs(10),
				)));
			}
			Arc::new(AlertRouter::new(AlertRouterConfig::default(), channels))
		}
	};

	let mysql = MySqlController::new(&config.source.service_name)
		.with_operation_timeout(args.mysql_timeout);
	let transfer = TransferClient {
		host: config.target.host.clone(),
		port: config.target.port,
		tls: config.target.tls,
		client_id: config.client_id.clone(),
		client_secret: config.client_secret.clone(),
		chunk_size: NonZeroU64::new(config.chunk_size)
			.ok_or_else(|| miette!("configuration has a zero chunk size"))?,
		max_in_flight: args.max_concurrent_chunks,
	};

	let mut orchestrator = Orchestrator::new(
		store,
		mysql,
		transfer,
		Arc::new(ErrorRecovery::new(alerts)),
		&args.work_dir,
	);
	orchestrator.timeouts = OperationTimeouts {
		mysql: args.mysql_timeout,
		compression: args.compression_timeout,
		transfer: args.transfer_timeout,
	};
	orchestrator.retry = RetryPolicy {
		max_attempts: args.retries.max(1),
		..RetryPolicy::default()
	};

	let cancel = CancellationToken::new();
	{
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				warn!("interrupt received, cancelling backup");
				cancel.cancel();
			}
		});
	}

	let bar = if stderr().is_terminal() && !json {
		let style = ProgressStyle::default_bar()
			.template("[{bar:.green/blue}] {percent}% {wide_msg} ({elapsed})")
			.expect("BUG: progress bar template invalid");
		ProgressBar::new(100).with_style(style)
	} else {
		ProgressBar::hidden()
	};

	let result = {
		let bar = bar.clone();
		orchestrator
			.run(
				&config,
				move |report| {
					bar.set_position((report.overall * 100.0) as u64);
					bar.set_message(format!("{:?}", report.phase));
				},
				cancel,
			)
			.await
	};
	bar.finish_and_clear();

	let log = &result.log;
	if json {
		println!(
			"{}",
			serde_json::to_string_pretty(&serde_json::json!({
				"logId": log.id,
				"status": log.status,
				"archivePath": log.archive_path,
				"archiveBytes": log.archive_bytes,
				"chunks": log.chunks.len(),
				"error": log.error,
			}))
			.into_diagnostic()?
		);
	} else {
		match log.status {
			BackupStatus::Completed => info!(
				path = log.archive_path.as_deref().unwrap_or("?"),
				bytes = log.archive_bytes.unwrap_or(0),
				"backup completed"
			),
			status => warn!(?status, error = log.error.as_deref().unwrap_or("-"), "backup did not complete"),
		}
	}

	match &result.error {
		None => Ok(()),
		Some(err) => std::process::exit(i32::from(err.exit_code())),
	}
}
