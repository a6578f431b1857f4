use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use super::{
	AlertChannel, AlertRouterConfig, EmailChannel, FileLogChannel, Severity, WebhookChannel,
	WebhookMethod,
};
use crate::error::BackupError;

const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Alert routing configuration as loaded from disk.
///
/// Loading is forgiving: invalid values are corrected to defaults and the
/// corrections reported as warnings, so one bad field never silences
/// alerting entirely.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AlertsFileConfig {
	pub min_severity: Option<Severity>,
	pub max_alerts_per_hour: Option<u32>,
	/// Humantime duration, e.g. "30s".
	pub notification_timeout: Option<String>,
	pub max_retry_attempts: Option<u32>,
	#[serde(default)]
	pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
	Email {
		from: String,
		api_key: String,
		domain: String,
		#[serde(default)]
		recipients: Vec<String>,
	},
	Webhook {
		url: String,
		/// post, put, or patch.
		method: Option<String>,
		/// Humantime duration, e.g. "10s".
		timeout: Option<String>,
	},
	FileLog {
		path: PathBuf,
	},
}

impl AlertsFileConfig {
	pub async fn load(path: &std::path::Path) -> Result<Self, BackupError> {
		let bytes = tokio::fs::read(path)
			.await
			.map_err(|err| BackupError::Validation(format!("alerts config {path:?}: {err}")))?;
		serde_json::from_slice(&bytes)
			.map_err(|err| BackupError::Validation(format!("alerts config {path:?}: {err}")))
	}

	/// Turn the file into router config and channels, correcting what needs
	/// correcting.
	pub fn build(self) -> (AlertRouterConfig, Vec<AlertChannel>, Vec<String>) {
		let mut warnings = Vec::new();
		let defaults = AlertRouterConfig::default();

		let notification_timeout = match self.notification_timeout.as_deref() {
			None => defaults.notification_timeout,
			Some(text) => match humantime::parse_duration(text) {
				Ok(timeout) => timeout,
				Err(_) => {
					warnings.push(format!(
						"notification_timeout {text:?} unparseable, using {:?}",
						defaults.notification_timeout
					));
					defaults.notification_timeout
				}
			},
		};

		let config = AlertRouterConfig {
			min_severity: self.min_severity.unwrap_or(defaults.min_severity),
			max_alerts_per_hour: self
				.max_alerts_per_hour
				.unwrap_or(defaults.max_alerts_per_hour),
			notification_timeout,
			max_retry_attempts: self
				.max_retry_attempts
				.unwrap_or(defaults.max_retry_attempts),
		};
		// Range clamping (and its own warnings) happen in the router.

		let mut channels = Vec::new();
		for channel in self.channels {
			match channel {
				ChannelConfig::Email {
					from,
					api_key,
					domain,
					recipients,
				} => {
					if recipients.is_empty() {
						warnings.push("email channel has no recipients, skipped".into());
						continue;
					}
					if from.is_empty() || api_key.is_empty() || domain.is_empty() {
						warnings.push("email channel is missing sender/api settings, skipped".into());
						continue;
					}
					channels.push(AlertChannel::Email(EmailChannel {
						from,
						api_key,
						domain,
						recipients,
					}));
				}

				ChannelConfig::Webhook {
					url,
					method,
					timeout,
				} => {
					if url.is_empty() {
						warnings.push("webhook channel has an empty url, skipped".into());
						continue;
					}
					let method = match method.as_deref() {
						None | Some("post") | Some("POST") => WebhookMethod::Post,
						Some("put") | Some("PUT") => WebhookMethod::Put,
						Some("patch") | Some("PATCH") => WebhookMethod::Patch,
						Some(other) => {
							warnings.push(format!("webhook method {other:?} unknown, using post"));
							WebhookMethod::Post
						}
					};
					let timeout = match timeout.as_deref() {
						None => DEFAULT_WEBHOOK_TIMEOUT,
						Some(text) => match humantime::parse_duration(text) {
							Ok(timeout) => timeout,
							Err(_) => {
								warnings.push(format!(
									"webhook timeout {text:?} unparseable, using {DEFAULT_WEBHOOK_TIMEOUT:?}"
								));
								DEFAULT_WEBHOOK_TIMEOUT
							}
						},
					};
					channels.push(AlertChannel::Webhook(WebhookChannel::new(url, method, timeout)));
				}

				ChannelConfig::FileLog { path } => {
					if path.as_os_str().is_empty() {
						warnings.push("file-log channel has an empty path, skipped".into());
						continue;
					}
					channels.push(AlertChannel::FileLog(FileLogChannel::new(path)));
				}
			}
		}

		(config, channels, warnings)
	}
}
