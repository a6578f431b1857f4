use std::{collections::HashMap, pin::Pin, str::FromStr as _, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
	sync::{RwLock, Semaphore, broadcast},
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
	error::BackupError,
	orchestrator::BackupRunResult,
	progress::ProgressReport,
	store::{BackupConfiguration, ScheduleConfiguration, Store},
};

/// Default ceiling on concurrently running backups.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 5;

/// Compute the next fire time of a cron expression after `after`.
pub fn next_fire(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, BackupError> {
	let schedule = cron::Schedule::from_str(cron_expr)
		.map_err(|err| BackupError::Validation(format!("cron expression: {err}")))?;
	schedule
		.after(&after)
		.next()
		.ok_or_else(|| BackupError::Validation("cron expression never fires".into()))
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
	ProgressUpdated {
		schedule_id: String,
		report: ProgressReport,
	},
	BackupCompleted {
		schedule_id: String,
		log_id: String,
		success: bool,
	},
}

/// How the scheduler actually runs a backup. Explicit construction keeps the
/// scheduler free of orchestrator type parameters.
pub type BackupRunner = Arc<
	dyn Fn(
			BackupConfiguration,
			Box<dyn Fn(ProgressReport) + Send + Sync>,
			CancellationToken,
		) -> Pin<Box<dyn Future<Output = BackupRunResult> + Send>>
		+ Send
		+ Sync,
>;

/// Cron-driven backups with a cap on concurrent runs and cooperative
/// per-run cancellation.
pub struct Scheduler {
	store: Arc<Store>,
	runner: BackupRunner,
	permits: Arc<Semaphore>,
	events: broadcast::Sender<SchedulerEvent>,
	tasks: RwLock<HashMap<String, JoinHandle<()>>>,
	running: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl Scheduler {
	pub fn new(store: Arc<Store>, runner: BackupRunner, max_concurrent: usize) -> Self {
		let (events, _) = broadcast::channel(256);
		Self {
			store,
			runner,
			permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
			events,
			tasks: RwLock::new(HashMap::new()),
			running: Arc::new(RwLock::new(HashMap::new())),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
		self.events.subscribe()
	}

	/// Load enabled schedules and spawn a timer task per schedule.
	pub async fn start(&self) -> Result<usize, BackupError> {
		let schedules = self.store.schedule_list().await?;
		let mut spawned = 0;

		for schedule in schedules.into_iter().filter(|s| s.enabled) {
			// Surface bad expressions now instead of from inside the task.
			next_fire(&schedule.cron, Utc::now())?;
			let handle = self.spawn_schedule(schedule.clone());
			self.tasks.write().await.insert(schedule.id.clone(), handle);
			spawned += 1;
		}

		info!(count = spawned, "scheduler started");
		Ok(spawned)
	}

	fn spawn_schedule(&self, schedule: ScheduleConfiguration) -> JoinHandle<()> {
		let store = self.store.clone();
		let runner = self.runner.clone();
		let permits = self.permits.clone();
		let events = self.events.clone();
		let running = self.running.clone();

		tokio::spawn(async move {
			loop {
				let fire_at = match next_fire(&schedule.cron, Utc::now()) {
					Ok(at) => at,
					Err(err) => {
						error!(schedule = %schedule.id, "schedule broken: {err}");
						return;
					}
				};
				let wait = (fire_at - Utc::now())
					.to_std()
					.unwrap_or(Duration::ZERO);
				debug!(schedule = %schedule.id, %fire_at, "sleeping until next fire");
				tokio::time::sleep(wait).await;

				let config = match store.config_get(&schedule.configuration_id).await {
					Ok(Some(config)) if config.active => config,
					Ok(Some(_)) => {
						debug!(schedule = %schedule.id, "configuration inactive, skipping fire");
						continue;
					}
					Ok(None) => {
						warn!(schedule = %schedule.id, "configuration vanished, stopping schedule");
						return;
					}
					Err(err) => {
						error!(schedule = %schedule.id, "loading configuration: {err}");
						continue;
					}
				};

				// Concurrency ceiling: a fire that cannot get a permit
				// waits (missed-fire bursts are not stacked because the
				// next sleep is computed after the run).
				// UNWRAP: the semaphore is never closed
				let permit = permits.clone().acquire_owned().await.unwrap();

				let cancel = CancellationToken::new();
				running
					.write()
					.await
					.insert(schedule.id.clone(), cancel.clone());

				let progress_events = events.clone();
				let schedule_id = schedule.id.clone();
				let on_progress: Box<dyn Fn(ProgressReport) + Send + Sync> = {
					let schedule_id = schedule_id.clone();
					Box::new(move |report| {
						let _ = progress_events.send(SchedulerEvent::ProgressUpdated {
							schedule_id: schedule_id.clone(),
							report,
						});
					})
				};

				info!(schedule = %schedule_id, config = %config.id, "scheduled backup firing");
				let result = runner(config, on_progress, cancel.clone()).await;
				drop(permit);
				running.write().await.remove(&schedule_id);

				let _ = events.send(SchedulerEvent::BackupCompleted {
					schedule_id: schedule_id.clone(),
					log_id: result.log.id.clone(),
					success: result.error.is_none(),
				});
			}
		})
	}

	/// Cancel the running backup for a schedule, if one is in flight.
	///
	/// Cooperative: the token reaches every suspension point of the run,
	/// and the orchestrator still restarts MySQL and cleans up on its way
	/// out.
	pub async fn cancel_run(&self, schedule_id: &str) -> bool {
		if let Some(token) = self.running.read().await.get(schedule_id) {
			info!(schedule_id, "cancelling running backup");
			token.cancel();
			true
		} else {
			false
		}
	}

	pub async fn shutdown(&self) {
		info!("shutting down scheduler");
		for (_, token) in self.running.write().await.drain() {
			token.cancel();
		}
		let mut tasks = self.tasks.write().await;
		for (id, handle) in tasks.drain() {
			debug!(schedule = %id, "aborting schedule task");
			handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn next_fire_moves_strictly_forward() {
		let after = Utc::now();
		// Every minute.
		let next = next_fire("0 * * * * *", after).unwrap();
		assert!(next > after);
		assert!(next - after <= chrono::Duration::seconds(61));

		assert!(next_fire("not a cron", after).is_err());
	}

	#[tokio::test]
	async fn runner_is_invoked_and_events_emitted() {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(Store::open(dir.path()));

		let config = crate::store::BackupConfiguration {
			id: "c1".into(),
			name: "c1".into(),
			source: crate::store::SourceConfig {
				host: "h".into(),
				port: 3306,
				username: "u".into(),
				password: "p".into(),
				service_name: "mysql".into(),
				data_dir: "/tmp/x".into(),
			},
			target: crate::store::TargetConfig {
				host: "t".into(),
				port: 7115,
				tls: false,
			},
			server_label: "s1".into(),
			database_label: "db1".into(),
			client_id: "c".into(),
			client_secret: "s".into(),
			chunk_size: 1024,
			active: true,
			created_at: Utc::now(),
		};
		store.config_put(config).await.unwrap();
		store
			.schedule_put(ScheduleConfiguration {
				id: "sched1".into(),
				configuration_id: "c1".into(),
				// Every second, so the test fires quickly.
				cron: "* * * * * *".into(),
				enabled: true,
				created_at: Utc::now(),
			})
			.await
			.unwrap();

		let runner: BackupRunner = Arc::new(|config, on_progress, _cancel| {
			Box::pin(async move {
				on_progress(ProgressReport::initial());
				let mut log = crate::store::BackupLog::new(&config.id);
				log.status = crate::store::BackupStatus::Completed;
				BackupRunResult { log, error: None }
			})
		});

		let scheduler = Scheduler::new(store, runner, 2);
		let mut events = scheduler.subscribe();
		assert_eq!(scheduler.start().await.unwrap(), 1);

		let completed = tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				match events.recv().await {
					Ok(SchedulerEvent::BackupCompleted { success, .. }) => return success,
					Ok(_) => continue,
					Err(err) => panic!("event stream broke: {err}"),
				}
			}
		})
		.await
		.expect("schedule never fired");
		assert!(completed);

		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn disabled_schedules_are_not_spawned() {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(Store::open(dir.path()));
		store
			.schedule_put(ScheduleConfiguration {
				id: "sched1".into(),
				configuration_id: "c1".into(),
				cron: "* * * * * *".into(),
				enabled: false,
				created_at: Utc::now(),
			})
			.await
			.unwrap();

		let runner: BackupRunner = Arc::new(|_, _, _| {
			Box::pin(async {
				panic!("runner must not fire for disabled schedules");
			})
		});
		let scheduler = Scheduler::new(store, runner, 1);
		assert_eq!(scheduler.start().await.unwrap(), 0);
	}
}
