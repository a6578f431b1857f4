use std::{
	collections::VecDeque,
	sync::Mutex,
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::BackupError;

mod config;
mod email;
mod filelog;
mod webhook;

pub use config::{AlertsFileConfig, ChannelConfig};
pub use email::EmailChannel;
pub use filelog::FileLogChannel;
pub use webhook::{WebhookChannel, WebhookMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	Info,
	Warning,
	Error,
	Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
	pub severity: Severity,
	pub title: String,
	pub message: String,
	pub operation_id: Option<String>,
	pub timestamp: DateTime<Utc>,
}

impl Alert {
	pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			severity,
			title: title.into(),
			message: message.into(),
			operation_id: None,
			timestamp: Utc::now(),
		}
	}
}

const DEFAULT_MAX_PER_HOUR: u32 = 20;
const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const MAX_RETRY_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct AlertRouterConfig {
	pub min_severity: Severity,
	pub max_alerts_per_hour: u32,
	pub notification_timeout: Duration,
	pub max_retry_attempts: u32,
}

impl Default for AlertRouterConfig {
	fn default() -> Self {
		Self {
			min_severity: Severity::Warning,
			max_alerts_per_hour: DEFAULT_MAX_PER_HOUR,
			notification_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
			max_retry_attempts: DEFAULT_RETRY_ATTEMPTS,
		}
	}
}

impl AlertRouterConfig {
	/// Correct out-of-range values to defaults, reporting what changed.
	pub fn validated(mut self) -> (Self, Vec<String>) {
		let mut corrections = Vec::new();

		if self.max_alerts_per_hour == 0 {
			corrections.push(format!(
				"max_alerts_per_hour 0 corrected to {DEFAULT_MAX_PER_HOUR}"
			));
			self.max_alerts_per_hour = DEFAULT_MAX_PER_HOUR;
		}
		if self.notification_timeout.is_zero() || self.notification_timeout > MAX_NOTIFICATION_TIMEOUT
		{
			corrections.push(format!(
				"notification_timeout {:?} corrected to {DEFAULT_NOTIFICATION_TIMEOUT:?}",
				self.notification_timeout
			));
			self.notification_timeout = DEFAULT_NOTIFICATION_TIMEOUT;
		}
		if self.max_retry_attempts > MAX_RETRY_ATTEMPTS {
			corrections.push(format!(
				"max_retry_attempts {} clamped to {MAX_RETRY_ATTEMPTS}",
				self.max_retry_attempts
			));
			self.max_retry_attempts = MAX_RETRY_ATTEMPTS;
		}

		(self, corrections)
	}
}

/// A place alerts can be delivered to.
#[derive(Debug)]
pub enum AlertChannel {
	Email(EmailChannel),
	Webhook(WebhookChannel),
	FileLog(FileLogChannel),
}

impl AlertChannel {
	fn name(&self) -> &'static str {
		match self {
			Self::Email(_) => "email",
			Self::Webhook(_) => "webhook",
			Self::FileLog(_) => "file-log",
		}
	}

	/// One delivery attempt. `Err(retryable, message)`.
	async fn deliver(&self, alert: &Alert) -> Result<(), (bool, String)> {
		match self {
			Self::Email(channel) => channel.deliver(alert).await,
			Self::Webhook(channel) => channel.deliver(alert).await,
			Self::FileLog(channel) => channel.deliver(alert).await,
		}
	}
}

/// What happened to a routed alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
	Delivered { channels: usize },
	BelowSeverity,
	RateLimited,
	TimedOut,
}

/// Severity filter, sliding-window rate limit, fan-out with bounded retries.
#[derive(Debug)]
pub struct AlertRouter {
	config: AlertRouterConfig,
	channels: Vec<AlertChannel>,
	window: Mutex<VecDeque<Instant>>,
}

impl AlertRouter {
	pub fn new(config: AlertRouterConfig, channels: Vec<AlertChannel>) -> Self {
		let (config, corrections) = config.validated();
		for correction in corrections {
			warn!("alert config: {correction}");
		}
		Self {
			config,
			channels,
			window: Mutex::new(VecDeque::new()),
		}
	}

	/// A router with no channels drops everything quietly; useful where
	/// alerting is not configured.
	pub fn disabled() -> Self {
		Self::new(AlertRouterConfig::default(), Vec::new())
	}

	fn admit(&self) -> bool {
		let now = Instant::now();
		// UNWRAP: no panics while this mutex is held
		let mut window = self.window.lock().unwrap();
		while window
			.front()
			.is_some_and(|at| now.duration_since(*at) >= Duration::from_secs(3600))
		{
			window.pop_front();
		}
		if window.len() as u32 >= self.config.max_alerts_per_hour {
			return false;
		}
		window.push_back(now);
		true
	}

	/// Route one alert. Never blocks the caller longer than the configured
	/// notification timeout.
	pub async fn route(&self, alert: Alert) -> Result<RouteOutcome, BackupError> {
		if alert.severity < self.config.min_severity {
			debug!(severity = ?alert.severity, "alert below minimum severity, dropped");
			return Ok(RouteOutcome::BelowSeverity);
		}
		if !self.admit() {
			warn!(title = %alert.title, "alert rate-limited");
			return Ok(RouteOutcome::RateLimited);
		}
		if self.channels.is_empty() {
			return Ok(RouteOutcome::Delivered { channels: 0 });
		}

		let fan_out = async {
			let mut delivered = 0usize;
			for channel in &self.channels {
				if self.deliver_with_retries(channel, &alert).await {
					delivered += 1;
				}
			}
			delivered
		};

		match tokio::time::timeout(self.config.notification_timeout, fan_out).await {
			Ok(delivered) => {
				info!(title = %alert.title, delivered, "alert routed");
				Ok(RouteOutcome::Delivered { channels: delivered })
			}
			Err(_) => {
				warn!(title = %alert.title, "alert delivery timed out");
				Ok(RouteOutcome::TimedOut)
			}
		}
	}

	/// Retry retryable delivery failures with doubling backoff.
	async fn deliver_with_retries(&self, channel: &AlertChannel, alert: &Alert) -> bool {
		let attempts = self.config.max_retry_attempts.max(1);
		let mut delay = Duration::from_millis(500);

		for attempt in 1..=attempts {
			match channel.deliver(alert).await {
				Ok(()) => return true,
				Err((retryable, message)) => {
					warn!(
						channel = channel.name(),
						attempt, retryable, "alert delivery failed: {message}"
					);
					if !retryable || attempt == attempts {
						return false;
					}
					tokio::time::sleep(delay).await;
					delay = (delay * 2).min(Duration::from_secs(10));
				}
			}
		}
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn alert(severity: Severity) -> Alert {
		Alert::new(severity, "title", "message")
	}

	#[tokio::test]
	async fn severity_filter_drops_quiet_alerts() {
		let router = AlertRouter::new(
			AlertRouterConfig {
				min_severity: Severity::Error,
				..AlertRouterConfig::default()
			},
			vec![],
		);
		assert_eq!(
			router.route(alert(Severity::Warning)).await.unwrap(),
			RouteOutcome::BelowSeverity
		);
		assert_eq!(
			router.route(alert(Severity::Critical)).await.unwrap(),
			RouteOutcome::Delivered { channels: 0 }
		);
	}

	#[tokio::test]
	async fn rate_limit_is_a_sliding_hour_window() {
		tokio::time::pause();
		let router = AlertRouter::new(
			AlertRouterConfig {
				min_severity: Severity::Info,
				max_alerts_per_hour: 3,
				..AlertRouterConfig::default()
			},
			vec![],
		);

		let mut delivered = 0;
		for _ in 0..10 {
			if matches!(
				router.route(alert(Severity::Error)).await.unwrap(),
				RouteOutcome::Delivered { .. }
			) {
				delivered += 1;
			}
		}
		assert_eq!(delivered, 3);

		// The window slides: an hour later there is room again.
		tokio::time::advance(Duration::from_secs(3601)).await;
		assert!(matches!(
			router.route(alert(Severity::Error)).await.unwrap(),
			RouteOutcome::Delivered { .. }
		));
	}

	#[test]
	fn config_corrections_fall_back_to_defaults() {
		let (config, corrections) = AlertRouterConfig {
			min_severity: Severity::Info,
			max_alerts_per_hour: 0,
			notification_timeout: Duration::ZERO,
			max_retry_attempts: 99,
		}
		.validated();

		assert_eq!(corrections.len(), 3);
		assert_eq!(config.max_alerts_per_hour, DEFAULT_MAX_PER_HOUR);
		assert_eq!(config.notification_timeout, DEFAULT_NOTIFICATION_TIMEOUT);
		assert_eq!(config.max_retry_attempts, MAX_RETRY_ATTEMPTS);
	}

	#[tokio::test]
	async fn file_log_channel_appends_entries() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("alerts.jsonl");
		let router = AlertRouter::new(
			AlertRouterConfig {
				min_severity: Severity::Info,
				..AlertRouterConfig::default()
			},
			vec![AlertChannel::FileLog(FileLogChannel::new(&path))],
		);

		router.route(alert(Severity::Critical)).await.unwrap();
		router.route(alert(Severity::Info)).await.unwrap();

		let text = tokio::fs::read_to_string(&path).await.unwrap();
		assert_eq!(text.lines().count(), 2);
		assert!(text.contains("critical"));
	}
}
