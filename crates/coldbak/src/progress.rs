use std::{
	sync::{Arc, Mutex},
	time::Duration,
};

use tokio::task::JoinHandle;
use tracing::trace;

use crate::store::BackupStatus;

/// Default coalescing cadence for progress callbacks.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// One progress observation for a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
	pub phase: BackupStatus,
	/// 0.0..=1.0 across the whole run; never decreases.
	pub overall: f64,
	pub bytes_transferred: u64,
	pub total_bytes: u64,
	pub elapsed: Duration,
}

impl ProgressReport {
	pub fn initial() -> Self {
		Self {
			phase: BackupStatus::Pending,
			overall: 0.0,
			bytes_transferred: 0,
			total_bytes: 0,
			elapsed: Duration::ZERO,
		}
	}
}

#[derive(Debug, Default)]
struct Shared {
	latest: Option<ProgressReport>,
	emitted: Option<ProgressReport>,
}

/// Buffers progress and forwards it to a callback at a fixed cadence.
///
/// Workers call [`update`](Self::update), which only takes a mutex; the
/// callback runs on a separate task so slow observers never stall the
/// transfer. Reports are clamped monotonic before they are emitted.
pub struct ProgressSink {
	shared: Arc<Mutex<Shared>>,
	callback: Arc<dyn Fn(ProgressReport) + Send + Sync>,
	ticker: JoinHandle<()>,
}

impl std::fmt::Debug for ProgressSink {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProgressSink").finish_non_exhaustive()
	}
}

fn clamp_monotonic(previous: Option<ProgressReport>, mut next: ProgressReport) -> ProgressReport {
	if let Some(previous) = previous {
		next.overall = next.overall.max(previous.overall);
		next.bytes_transferred = next.bytes_transferred.max(previous.bytes_transferred);
		next.total_bytes = next.total_bytes.max(previous.total_bytes);
	}
	next.overall = next.overall.clamp(0.0, 1.0);
	next
}

impl ProgressSink {
	pub fn new(
		interval: Duration,
		callback: impl Fn(ProgressReport) + Send + Sync + 'static,
	) -> Self {
		let shared = Arc::new(Mutex::new(Shared::default()));
		let callback: Arc<dyn Fn(ProgressReport) + Send + Sync> = Arc::new(callback);

		let ticker = {
			let shared = shared.clone();
			let callback = callback.clone();
			tokio::spawn(async move {
				let mut ticker = tokio::time::interval(interval);
				ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
				loop {
					ticker.tick().await;
					let report = {
						// UNWRAP: no panics while this mutex is held
						let mut shared = shared.lock().unwrap();
						let Some(latest) = shared.latest.take() else {
							continue;
						};
						let report = clamp_monotonic(shared.emitted, latest);
						shared.emitted = Some(report);
						report
					};
					trace!(?report, "emitting progress");
					callback(report);
				}
			})
		};

		Self {
			shared,
			callback,
			ticker,
		}
	}

	/// Record the newest observation. Cheap; coalesced by the ticker.
	pub fn update(&self, report: ProgressReport) {
		// UNWRAP: no panics while this mutex is held
		let mut shared = self.shared.lock().unwrap();
		shared.latest = Some(report);
	}

	/// Emit the final report immediately and stop the ticker.
	pub fn finish(self, report: ProgressReport) {
		self.ticker.abort();
		let report = {
			// UNWRAP: no panics while this mutex is held
			let mut shared = self.shared.lock().unwrap();
			let report = clamp_monotonic(shared.emitted, report);
			shared.emitted = Some(report);
			report
		};
		(self.callback)(report);
	}
}

impl Drop for ProgressSink {
	fn drop(&mut self) {
		self.ticker.abort();
	}
}
