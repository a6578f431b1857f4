use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
	catalog::{Catalog, CatalogEntry},
	error::ReceiverError,
	layout::StorageLayout,
};

/// Bounds on the persisted archive set. At least one must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
	pub name: String,
	pub enabled: bool,
	pub max_age_days: Option<u32>,
	pub max_count: Option<u64>,
	pub max_storage_bytes: Option<u64>,
	pub created_at: DateTime<Utc>,
}

impl RetentionPolicy {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			enabled: true,
			max_age_days: None,
			max_count: None,
			max_storage_bytes: None,
			created_at: Utc::now(),
		}
	}

	pub fn validate(&self) -> Result<(), ReceiverError> {
		if self.name.trim().is_empty() {
			return Err(ReceiverError::Validation("policy name is empty".into()));
		}
		if self.max_age_days == Some(0) {
			return Err(ReceiverError::Validation("max_age_days must be > 0".into()));
		}
		if self.max_count == Some(0) {
			return Err(ReceiverError::Validation("max_count must be > 0".into()));
		}
		if self.max_storage_bytes == Some(0) {
			return Err(ReceiverError::Validation(
				"max_storage_bytes must be > 0".into(),
			));
		}
		if self.max_age_days.is_none()
			&& self.max_count.is_none()
			&& self.max_storage_bytes.is_none()
		{
			return Err(ReceiverError::Validation(
				"policy must set at least one bound".into(),
			));
		}
		Ok(())
	}

	/// Conjunction of every bound present in the policy.
	///
	/// Called while walking newest-first, so `kept_count`/`kept_bytes` are
	/// what has already been retained by newer entries.
	fn should_retain(
		&self,
		started_at: DateTime<Utc>,
		kept_count: u64,
		kept_bytes: u64,
		entry_size: u64,
		now: DateTime<Utc>,
	) -> bool {
		if let Some(max_age) = self.max_age_days {
			let age_days = (now - started_at).num_days();
			if age_days > i64::from(max_age) {
				return false;
			}
		}
		if let Some(max_count) = self.max_count {
			if kept_count + 1 > max_count {
				return false;
			}
		}
		if let Some(max_bytes) = self.max_storage_bytes {
			if kept_bytes + entry_size > max_bytes {
				return false;
			}
		}
		true
	}
}

/// What applying a policy would delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletionPlan {
	pub archive_paths: Vec<PathBuf>,
	pub log_ids: Vec<String>,
	pub bytes_to_free: u64,
}

/// Side-effect-free impact numbers for a policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionImpact {
	pub files_count: usize,
	pub logs_count: usize,
	pub bytes_to_free: u64,
	pub archive_paths: Vec<PathBuf>,
}

/// Walk the catalog newest-first and decide what goes.
///
/// Walking newest-first makes the tie-breaks fall out naturally: trimming by
/// count keeps the newest N, trimming by storage evicts oldest-first once the
/// budget is spent.
pub fn plan(
	policy: &RetentionPolicy,
	entries: &[CatalogEntry],
	now: DateTime<Utc>,
) -> Result<DeletionPlan, ReceiverError> {
	policy.validate()?;

	let mut sorted: Vec<&CatalogEntry> = entries.iter().collect();
	sorted.sort_by(|a, b| b.started_at.cmp(&a.started_at));

	let mut plan = DeletionPlan::default();
	let mut kept_count = 0u64;
	let mut kept_bytes = 0u64;

	for entry in sorted {
		if policy.should_retain(entry.started_at, kept_count, kept_bytes, entry.size, now) {
			kept_count += 1;
			kept_bytes += entry.size;
		} else {
			plan.archive_paths.push(entry.archive_path.clone());
			plan.log_ids.push(entry.id.clone());
			plan.bytes_to_free += entry.size;
		}
	}

	Ok(plan)
}

/// The same walk as [`plan`], without side effects.
pub fn estimate(
	policy: &RetentionPolicy,
	entries: &[CatalogEntry],
	now: DateTime<Utc>,
) -> Result<RetentionImpact, ReceiverError> {
	let plan = plan(policy, entries, now)?;
	Ok(RetentionImpact {
		files_count: plan.archive_paths.len(),
		logs_count: plan.log_ids.len(),
		bytes_to_free: plan.bytes_to_free,
		archive_paths: plan.archive_paths,
	})
}

/// Outcome of applying a policy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppliedRetention {
	pub deleted_files: usize,
	pub marked_missing: usize,
	pub bytes_freed: u64,
	pub warnings: Vec<String>,
}

/// Apply a policy: delete planned archives (and companions), mark catalog
/// rows `archive_missing`.
///
/// Each delete re-checks its pre-conditions against the live catalog; an
/// archive already gone from disk downgrades to log-only removal with a
/// warning. Files the catalog does not know are never touched.
pub async fn apply(
	policy: &RetentionPolicy,
	catalog: &Catalog,
	now: DateTime<Utc>,
) -> Result<AppliedRetention, ReceiverError> {
	let entries = catalog.with_archive().await?;
	let plan = plan(policy, &entries, now)?;
	let mut outcome = AppliedRetention::default();

	for (path, id) in plan.archive_paths.iter().zip(&plan.log_ids) {
		// Pre-conditions may have changed since planning.
		let Some(current) = catalog.get(id).await? else {
			outcome
				.warnings
				.push(format!("catalog row {id} vanished before deletion"));
			continue;
		};
		if current.archive_missing || current.archive_path != *path {
			outcome
				.warnings
				.push(format!("catalog row {id} changed before deletion, skipped"));
			continue;
		}

		match tokio::fs::remove_file(path).await {
			Ok(()) => {
				info!(?path, "retention deleted archive");
				outcome.deleted_files += 1;
				outcome.bytes_freed += current.size;
				let _ = tokio::fs::remove_file(StorageLayout::meta_path(path)).await;
			}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				warn!(?path, "archive already missing on disk, log-only removal");
				outcome
					.warnings
					.push(format!("{}: archive missing on disk", path.display()));
			}
			Err(err) => return Err(err.into()),
		}

		catalog.mark_archive_missing(id).await?;
		outcome.marked_missing += 1;
	}

	Ok(outcome)
}

/// Named retention policies, persisted as one JSON file.
#[derive(Debug)]
pub struct PolicyStore {
	path: PathBuf,
	lock: Mutex<()>,
}

impl PolicyStore {
	pub fn open(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			lock: Mutex::new(()),
		}
	}

	async fn load(&self) -> Result<Vec<RetentionPolicy>, ReceiverError> {
		match tokio::fs::read(&self.path).await {
			Ok(bytes) => serde_json::from_slice(&bytes)
				.map_err(|err| ReceiverError::StoreUnreadable(format!("policies: {err}"))),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(err) => Err(err.into()),
		}
	}

	async fn save(&self, policies: &[RetentionPolicy]) -> Result<(), ReceiverError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let json = serde_json::to_vec_pretty(policies)
			.map_err(|err| ReceiverError::Internal(err.to_string()))?;
		let tmp = self.path.with_extension("json.tmp");
		tokio::fs::write(&tmp, json).await?;
		tokio::fs::rename(&tmp, &self.path).await?;
		Ok(())
	}

	pub async fn list(&self) -> Result<Vec<RetentionPolicy>, ReceiverError> {
		let _guard = self.lock.lock().await;
		self.load().await
	}

	pub async fn add(&self, policy: RetentionPolicy) -> Result<(), ReceiverError> {
		policy.validate()?;
		let _guard = self.lock.lock().await;
		let mut policies = self.load().await?;
		if policies.iter().any(|p| p.name == policy.name) {
			return Err(ReceiverError::Validation(format!(
				"policy {:?} already exists",
				policy.name
			)));
		}
		policies.push(policy);
		self.save(&policies).await
	}

	pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, ReceiverError> {
		let _guard = self.lock.lock().await;
		let mut policies = self.load().await?;
		let Some(policy) = policies.iter_mut().find(|p| p.name == name) else {
			return Ok(false);
		};
		policy.enabled = enabled;
		self.save(&policies).await?;
		Ok(true)
	}

	pub async fn enabled(&self) -> Result<Vec<RetentionPolicy>, ReceiverError> {
		Ok(self.list().await?.into_iter().filter(|p| p.enabled).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(id: &str, age_days: i64, size: u64) -> CatalogEntry {
		let started = Utc::now() - chrono::Duration::days(age_days);
		CatalogEntry {
			id: id.into(),
			archive_path: PathBuf::from(format!("/b/{id}.zip")),
			size,
			md5: String::new(),
			sha256: String::new(),
			server: "s1".into(),
			database: "db1".into(),
			started_at: started,
			completed_at: started,
			archive_missing: false,
		}
	}

	fn policy() -> RetentionPolicy {
		RetentionPolicy::new("test")
	}

	#[test]
	fn invalid_policies_are_refused() {
		assert!(policy().validate().is_err(), "all bounds empty");

		let mut named_badly = policy();
		named_badly.name = "  ".into();
		named_badly.max_count = Some(1);
		assert!(named_badly.validate().is_err());

		let mut zero = policy();
		zero.max_age_days = Some(0);
		assert!(zero.validate().is_err());
	}

	#[test]
	fn storage_cap_evicts_the_oldest() {
		// Five archives of 100 bytes, cap 300: the two oldest go.
		let entries: Vec<_> = (0..5).map(|i| entry(&format!("e{i}"), i, 100)).collect();
		let mut p = policy();
		p.max_storage_bytes = Some(300);

		let plan = plan(&p, &entries, Utc::now()).unwrap();
		assert_eq!(plan.bytes_to_free, 200);
		assert_eq!(plan.log_ids, vec!["e3".to_string(), "e4".to_string()]);

		let impact = estimate(&p, &entries, Utc::now()).unwrap();
		assert_eq!(impact.files_count, 2);
		assert_eq!(impact.logs_count, impact.files_count);
		assert_eq!(impact.archive_paths.len(), impact.files_count);
		assert_eq!(impact.bytes_to_free, 200);
	}

	#[test]
	fn count_cap_keeps_the_newest() {
		let entries: Vec<_> = (0..4).map(|i| entry(&format!("e{i}"), i, 10)).collect();
		let mut p = policy();
		p.max_count = Some(2);

		let plan = plan(&p, &entries, Utc::now()).unwrap();
		assert_eq!(plan.log_ids, vec!["e2".to_string(), "e3".to_string()]);
	}

	#[test]
	fn age_cap_bounds_the_retained_set() {
		let entries: Vec<_> = [1, 5, 20, 40]
			.iter()
			.map(|d| entry(&format!("e{d}"), *d, 10))
			.collect();
		let mut p = policy();
		p.max_age_days = Some(30);

		let plan = plan(&p, &entries, Utc::now()).unwrap();
		assert_eq!(plan.log_ids, vec!["e40".to_string()]);
	}

	#[test]
	fn conjunction_of_bounds() {
		let entries: Vec<_> = (0..6).map(|i| entry(&format!("e{i}"), i * 10, 100)).collect();
		let mut p = policy();
		p.max_age_days = Some(35);
		p.max_count = Some(3);
		p.max_storage_bytes = Some(250);

		let plan = plan(&p, &entries, Utc::now()).unwrap();
		// Storage allows 2, count allows 3, age allows 4: strictest wins.
		assert_eq!(plan.log_ids.len(), 4);

		let kept: Vec<_> = entries
			.iter()
			.filter(|e| !plan.log_ids.contains(&e.id))
			.collect();
		assert_eq!(kept.len(), 2);
		assert!(kept.iter().map(|e| e.size).sum::<u64>() <= 250);
	}

	#[tokio::test]
	async fn apply_deletes_files_and_marks_rows() {
		let dir = tempfile::tempdir().unwrap();
		let catalog = Catalog::open(dir.path().join("catalog.json"));

		let mut entries = Vec::new();
		for i in 0..5 {
			let path = dir.path().join(format!("e{i}.zip"));
			tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();
			let mut e = entry(&format!("e{i}"), i, 100);
			e.archive_path = path;
			catalog.record(e.clone()).await.unwrap();
			entries.push(e);
		}
		// Oldest archive already missing on disk: log-only removal.
		tokio::fs::remove_file(&entries[4].archive_path).await.unwrap();

		let mut p = policy();
		p.max_storage_bytes = Some(300);
		let outcome = apply(&p, &catalog, Utc::now()).await.unwrap();

		assert_eq!(outcome.deleted_files, 1);
		assert_eq!(outcome.marked_missing, 2);
		assert_eq!(outcome.bytes_freed, 100);
		assert_eq!(outcome.warnings.len(), 1);

		assert!(!entries[3].archive_path.exists());
		for e in &entries[..3] {
			assert!(e.archive_path.exists(), "retained archive deleted");
		}
		assert_eq!(catalog.with_archive().await.unwrap().len(), 3);
		assert_eq!(catalog.all().await.unwrap().len(), 5);
	}
}
