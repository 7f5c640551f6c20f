//! Content-addressed file cache for retrieved DICOM Part-10 instances, with TTL and
//! total-size-cap eviction. Grounded on the ambient stack's error/logging conventions
//! (`thiserror` + `tracing`, matching every other layer in this crate): index persistence is a
//! single JSON index file rewritten on each mutation (see DESIGN.md for why append-only
//! journaling was not built).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::ResourceKey;

const INDEX_FILE_NAME: &str = "cache-index.json";

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("cache I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("cache index is corrupt: {0}")]
	IndexCorrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
	pub key: String,
	pub size_bytes: u64,
	pub created_at: DateTime<Utc>,
	pub last_accessed_at: DateTime<Utc>,
	pub study_instance_uid: String,
	pub series_instance_uid: Option<String>,
	pub sop_instance_uid: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
	entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationReport {
	pub valid: usize,
	pub invalid: usize,
	pub orphan: usize,
}

pub struct FileCache {
	root: PathBuf,
	max_size_bytes: u64,
	retention: Duration,
	index: Mutex<CacheIndex>,
}

/// SHA-256 of the most-specific UID, hex-encoded.
pub fn content_key(key: &ResourceKey) -> String {
	let mut hasher = Sha256::new();
	hasher.update(key.most_specific_uid().as_bytes());
	hex::encode(hasher.finalize())
}

impl FileCache {
	pub fn open(root: impl Into<PathBuf>, max_size_bytes: u64, retention: Duration) -> Result<Self, CacheError> {
		let root = root.into();
		std::fs::create_dir_all(&root)?;

		let index_path = root.join(INDEX_FILE_NAME);
		let index = if index_path.exists() {
			let contents = std::fs::read_to_string(&index_path)?;
			serde_json::from_str(&contents)?
		} else {
			CacheIndex::default()
		};

		Ok(Self {
			root,
			max_size_bytes,
			retention,
			index: Mutex::new(index),
		})
	}

	fn path_for(&self, hex: &str) -> PathBuf {
		self.root.join(&hex[0..2]).join(format!("{hex}.dcm"))
	}

	fn persist_index_locked(&self, index: &CacheIndex) -> Result<(), CacheError> {
		let contents = serde_json::to_string_pretty(index)?;
		std::fs::write(self.root.join(INDEX_FILE_NAME), contents)?;
		Ok(())
	}

	/// Writes `bytes` under the key derived from `resource`, updates the index, then enforces
	/// the size cap. Store failures are logged but never fail the caller — the cache is
	/// advisory, never load-bearing for correctness of the HTTP response.
	pub fn store(&self, resource: &ResourceKey, bytes: &[u8]) {
		if let Err(err) = self.try_store(resource, bytes) {
			warn!(error = %err, "failed to store cache entry");
		}
	}

	fn try_store(&self, resource: &ResourceKey, bytes: &[u8]) -> Result<(), CacheError> {
		let hex = content_key(resource);
		let path = self.path_for(&hex);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(&path, bytes)?;

		let now = Utc::now();
		let entry = CacheEntry {
			key: hex.clone(),
			size_bytes: bytes.len() as u64,
			created_at: now,
			last_accessed_at: now,
			study_instance_uid: resource.study_instance_uid.clone(),
			series_instance_uid: resource.series_instance_uid.clone(),
			sop_instance_uid: resource.sop_instance_uid.clone(),
		};

		{
			let mut index = self.index.lock().unwrap();
			index.entries.insert(hex, entry);
			self.persist_index_locked(&index)?;
		}

		self.enforce();
		Ok(())
	}

	/// Returns the cached bytes for `resource`, or `None` on a miss (never seen, expired, or
	/// the file disappeared out from under the index).
	pub fn retrieve(&self, resource: &ResourceKey) -> Option<Vec<u8>> {
		let hex = content_key(resource);
		let now = Utc::now();

		let path = {
			let mut index = self.index.lock().unwrap();
			let Some(entry) = index.entries.get(&hex) else {
				return None;
			};

			if now > entry.created_at + chrono::Duration::from_std(self.retention).ok()? {
				debug!(key = hex, "cache entry expired");
				index.entries.remove(&hex);
				let _ = self.persist_index_locked(&index);
				return None;
			}

			self.path_for(&hex)
		};

		match std::fs::read(&path) {
			Ok(bytes) => {
				let mut index = self.index.lock().unwrap();
				if let Some(entry) = index.entries.get_mut(&hex) {
					entry.last_accessed_at = now;
				}
				let _ = self.persist_index_locked(&index);
				Some(bytes)
			}
			Err(_) => {
				debug!(key = hex, "cache file missing for indexed entry, removing");
				let mut index = self.index.lock().unwrap();
				index.entries.remove(&hex);
				let _ = self.persist_index_locked(&index);
				None
			}
		}
	}

	pub fn has(&self, resource: &ResourceKey) -> bool {
		let hex = content_key(resource);
		let index = self.index.lock().unwrap();
		let Some(entry) = index.entries.get(&hex) else {
			return false;
		};
		let Some(retention) = chrono::Duration::from_std(self.retention).ok() else {
			return false;
		};
		Utc::now() <= entry.created_at + retention && self.path_for(&hex).exists()
	}

	/// Removes expired entries, then evicts least-recently-accessed entries until the total
	/// size is within `maxSizeBytes`; a freshly stored entry may be the sole entry exceeding the
	/// cap if it alone is larger than the cap.
	pub fn enforce(&self) {
		let mut index = self.index.lock().unwrap();
		let now = Utc::now();
		let Some(retention) = chrono::Duration::from_std(self.retention).ok() else {
			return;
		};

		let expired: Vec<String> = index
			.entries
			.iter()
			.filter(|(_, entry)| now > entry.created_at + retention)
			.map(|(k, _)| k.clone())
			.collect();
		for key in &expired {
			self.remove_entry(&mut index, key);
		}

		let mut total: u64 = index.entries.values().map(|e| e.size_bytes).sum();
		if total > self.max_size_bytes {
			let mut by_access: Vec<(String, DateTime<Utc>)> = index
				.entries
				.iter()
				.map(|(k, e)| (k.clone(), e.last_accessed_at))
				.collect();
			by_access.sort_by_key(|(_, last_accessed)| *last_accessed);

			for (key, _) in by_access {
				if total <= self.max_size_bytes || index.entries.len() <= 1 {
					break;
				}
				if let Some(entry) = index.entries.get(&key) {
					total = total.saturating_sub(entry.size_bytes);
					self.remove_entry(&mut index, &key);
				}
			}
		}

		let _ = self.persist_index_locked(&index);
	}

	fn remove_entry(&self, index: &mut CacheIndex, hex: &str) {
		if let Some(entry) = index.entries.remove(hex) {
			let _ = std::fs::remove_file(self.path_for(hex));
			debug!(key = hex, size_bytes = entry.size_bytes, "evicted cache entry");
		}
	}

	/// Cross-checks the index against disk contents, deleting orphan files (present on disk,
	/// absent from the index) and dropping invalid index entries (present in the index, absent
	/// from disk).
	pub fn validate(&self) -> Result<ValidationReport, CacheError> {
		let mut report = ValidationReport::default();
		let mut index = self.index.lock().unwrap();

		let missing: Vec<String> = index
			.entries
			.iter()
			.filter(|(hex, _)| !self.path_for(hex).exists())
			.map(|(hex, _)| hex.clone())
			.collect();
		report.invalid = missing.len();
		for hex in missing {
			index.entries.remove(&hex);
		}
		report.valid = index.entries.len();

		if self.root.exists() {
			for shard in read_dir_entries(&self.root) {
				if !shard.is_dir() {
					continue;
				}
				for file in read_dir_entries(&shard) {
					if let Some(hex) = file.file_stem().and_then(|s| s.to_str()) {
						if !index.entries.contains_key(hex) {
							report.orphan += 1;
							let _ = std::fs::remove_file(&file);
							debug!(path = %file.display(), "removed orphaned cache file");
						}
					}
				}
			}
		}

		self.persist_index_locked(&index)?;
		Ok(report)
	}

	/// Runs `enforce()` and logs what was freed. Intended to run every 15 minutes.
	pub fn sweep(&self) {
		let before: u64 = self.index.lock().unwrap().entries.values().map(|e| e.size_bytes).sum();
		self.enforce();
		let after: u64 = self.index.lock().unwrap().entries.values().map(|e| e.size_bytes).sum();
		if before != after {
			info!(freed_bytes = before - after, "cache sweep freed space");
		}
	}
}

fn read_dir_entries(dir: &Path) -> Vec<PathBuf> {
	std::fs::read_dir(dir)
		.map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn resource(study: &str) -> ResourceKey {
		ResourceKey::new(study.to_string(), None, None)
	}

	#[test]
	fn content_key_is_deterministic() {
		let a = resource("1.2.3");
		let b = resource("1.2.3");
		assert_eq!(content_key(&a), content_key(&b));
	}

	#[test]
	fn store_then_retrieve_round_trips() {
		let dir = tempdir();
		let cache = FileCache::open(&dir, 10 * 1024 * 1024, Duration::from_secs(3600)).unwrap();
		let resource = resource("1.2.3.4");

		cache.store(&resource, b"dicom-bytes");
		assert!(cache.has(&resource));
		assert_eq!(cache.retrieve(&resource), Some(b"dicom-bytes".to_vec()));
	}

	#[test]
	fn expired_entry_returns_none() {
		let dir = tempdir();
		let cache = FileCache::open(&dir, 10 * 1024 * 1024, Duration::from_millis(1)).unwrap();
		let resource = resource("1.2.3.5");

		cache.store(&resource, b"dicom-bytes");
		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(cache.retrieve(&resource), None);
	}

	#[test]
	fn enforce_evicts_least_recently_accessed_over_cap() {
		let dir = tempdir();
		let cache = FileCache::open(&dir, 10, Duration::from_secs(3600)).unwrap();

		cache.store(&resource("1"), b"0123456789");
		cache.store(&resource("2"), b"0123456789");

		let total: u64 = cache.index.lock().unwrap().entries.values().map(|e| e.size_bytes).sum();
		assert!(total <= 10 || cache.index.lock().unwrap().entries.len() == 1);
	}

	#[test]
	fn validate_removes_orphans_and_invalid_entries() {
		let dir = tempdir();
		let cache = FileCache::open(&dir, 10 * 1024 * 1024, Duration::from_secs(3600)).unwrap();
		cache.store(&resource("1.2.3"), b"data");

		let orphan_shard = dir.join("ab");
		std::fs::create_dir_all(&orphan_shard).unwrap();
		std::fs::write(orphan_shard.join("orphan.dcm"), b"stray").unwrap();

		let report = cache.validate().unwrap();
		assert_eq!(report.orphan, 1);
		assert_eq!(report.invalid, 0);
		assert_eq!(report.valid, 1);
	}

	fn tempdir() -> PathBuf {
		let mut path = std::env::temp_dir();
		path.push(format!("dicomweb-gateway-cache-test-{}", uuid::Uuid::new_v4()));
		path
	}
}
