use std::path::PathBuf;

use tokio::{fs::OpenOptions, io::AsyncWriteExt as _, sync::Mutex};

use super::Alert;

/// Appends alerts as JSON lines to a local file.
#[derive(Debug)]
pub struct FileLogChannel {
	path: PathBuf,
	lock: Mutex<()>,
}

impl FileLogChannel {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			lock: Mutex::new(()),
		}
	}

	pub(super) async fn deliver(&self, alert: &Alert) -> Result<(), (bool, String)> {
		let mut line = serde_json::to_vec(alert).map_err(|err| (false, err.to_string()))?;
		line.push(b'\n');

		let _guard = self.lock.lock().await;
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|err| (true, err.to_string()))?;
		}
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await
			.map_err(|err| (true, err.to_string()))?;
		file.write_all(&line)
			.await
			.map_err(|err| (true, err.to_string()))?;
		file.flush().await.map_err(|err| (true, err.to_string()))?;
		Ok(())
	}
}
