use std::time::Duration;

use tracing::debug;

use super::Alert;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookMethod {
	Post,
	Put,
	Patch,
}

impl WebhookMethod {
	fn as_reqwest(self) -> reqwest::Method {
		match self {
			Self::Post => reqwest::Method::POST,
			Self::Put => reqwest::Method::PUT,
			Self::Patch => reqwest::Method::PATCH,
		}
	}
}

/// JSON webhook channel.
#[derive(Debug)]
pub struct WebhookChannel {
	url: String,
	method: WebhookMethod,
	client: reqwest::Client,
}

impl WebhookChannel {
	pub fn new(url: impl Into<String>, method: WebhookMethod, timeout: Duration) -> Self {
		Self {
			url: url.into(),
			method,
			client: reqwest::Client::builder()
				.timeout(timeout)
				.build()
				// UNWRAP: builder only fails on TLS backend misconfiguration
				.unwrap(),
		}
	}

	pub(super) async fn deliver(&self, alert: &Alert) -> Result<(), (bool, String)> {
		debug!(url = %self.url, "posting alert webhook");
		let response = self
			.client
			.request(self.method.as_reqwest(), &self.url)
			.json(alert)
			.send()
			.await
			// Network errors are retryable by definition.
			.map_err(|err| (true, err.to_string()))?;

		let status = response.status();
		if status.is_success() {
			return Ok(());
		}

		// 5xx and 408 are worth retrying; other 4xx are ours to fix.
		let retryable = status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT;
		Err((retryable, format!("webhook returned {status}")))
	}
}
