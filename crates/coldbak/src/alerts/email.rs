use mailgun_rs::{EmailAddress, Mailgun, Message};
use tracing::debug;

use super::Alert;

/// Mailgun-backed email channel.
#[derive(Debug, Clone)]
pub struct EmailChannel {
	pub from: String,
	pub api_key: String,
	pub domain: String,
	pub recipients: Vec<String>,
}

impl EmailChannel {
	pub(super) async fn deliver(&self, alert: &Alert) -> Result<(), (bool, String)> {
		if self.recipients.is_empty() {
			return Err((false, "no recipients configured".into()));
		}

		debug!(recipients = ?self.recipients, "sending alert email");
		let sender = EmailAddress::address(&self.from);
		let mailgun = Mailgun {
			api_key: self.api_key.clone(),
			domain: self.domain.clone(),
		};
		let message = Message {
			to: self
				.recipients
				.iter()
				.map(|address| EmailAddress::address(address))
				.collect(),
			subject: format!("[coldbak {:?}] {}", alert.severity, alert.title),
			text: alert.message.clone(),
			..Default::default()
		};

		mailgun
			.async_send(mailgun_rs::MailgunRegion::US, &sender, message, None)
			.await
			// Mail API failures are worth another try.
			.map_err(|err| (true, err.to_string()))
			.map(drop)
	}
}
