//! C-MOVE correlation tracker: binds an outbound C-MOVE to the inbound C-STORE stream it
//! triggers on a separate association, validates that stores are authorized, accumulates
//! datasets, and resolves the waiting HTTP request.
//!
//! Grounded on the teacher's channel-based `MoveMediator` (`dimse/cmove/mediator.rs`), but
//! re-keyed by `(study, series?, instance?)` instead of `(originator AET, message id)`: a
//! pending move resolves only when BOTH the terminal C-MOVE response has arrived (carrying
//! NumberOfCompletedSuboperations) AND that many datasets have been recorded — not on the
//! first inbound C-STORE.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use dicom::object::{FileDicomObject, InMemDicomObject};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dimse::cmove::SubOperationCounts;
use crate::types::ResourceKey;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TrackerError {
	#[error("no matching pending C-MOVE for the given identifiers")]
	NotAuthorized,
	#[error("pending C-MOVE timed out waiting for C-STORE sub-operations")]
	Timeout,
	#[error("pending C-MOVE was cancelled: {0}")]
	Cancelled(String),
}

pub type RetrievedInstance = FileDicomObject<InMemDicomObject>;
pub type TrackerOutcome = Result<Vec<RetrievedInstance>, TrackerError>;

struct PendingMove {
	key: ResourceKey,
	deadline: Instant,
	datasets: Vec<RetrievedInstance>,
	expected_completed: Option<u32>,
	done: Option<oneshot::Sender<TrackerOutcome>>,
}

impl PendingMove {
	/// Resolved once the terminal C-MOVE response's completed count has been observed and at
	/// least that many datasets have been recorded.
	fn is_satisfied(&self) -> bool {
		self.expected_completed
			.is_some_and(|expected| self.datasets.len() >= expected as usize)
	}
}

#[derive(Default)]
pub struct Tracker {
	pending: Mutex<HashMap<Uuid, PendingMove>>,
}

impl Tracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a pending C-MOVE and returns its correlation id plus a receiver the caller
	/// awaits alongside the C-MOVE terminal response.
	pub fn register(&self, key: ResourceKey, timeout: Duration) -> (Uuid, oneshot::Receiver<TrackerOutcome>) {
		let correlation_id = Uuid::new_v4();
		let (tx, rx) = oneshot::channel();

		let entry = PendingMove {
			key,
			deadline: Instant::now() + timeout,
			datasets: Vec::new(),
			expected_completed: None,
			done: Some(tx),
		};

		self.pending.lock().unwrap().insert(correlation_id, entry);
		debug!(%correlation_id, "registered pending C-MOVE");
		(correlation_id, rx)
	}

	/// Checks whether an inbound C-STORE's identifiers are covered by any pending move.
	/// First match wins — a single active move per correlation is assumed.
	pub fn validate(&self, store_key: &ResourceKey) -> Option<Uuid> {
		let pending = self.pending.lock().unwrap();
		pending
			.iter()
			.find(|(_, entry)| entry.key.covers(store_key))
			.map(|(id, _)| *id)
	}

	/// Records a received dataset against a correlation id previously returned by `validate`.
	/// Resolves the waiter if the terminal-response gate (see [`Self::mark_terminal`]) is
	/// already satisfied.
	pub fn record(&self, correlation_id: Uuid, dataset: RetrievedInstance) {
		let mut pending = self.pending.lock().unwrap();
		let Some(entry) = pending.get_mut(&correlation_id) else {
			warn!(%correlation_id, "record() for unknown or already-resolved correlation id");
			return;
		};
		entry.datasets.push(dataset);

		if entry.is_satisfied() {
			Self::resolve_locked(&mut pending, correlation_id);
		}
	}

	/// Records the terminal C-MOVE response's sub-operation counters. Resolves the waiter if
	/// the expected number of datasets has already been recorded.
	pub fn mark_terminal(&self, correlation_id: Uuid, counts: SubOperationCounts) {
		let mut pending = self.pending.lock().unwrap();
		let Some(entry) = pending.get_mut(&correlation_id) else {
			warn!(%correlation_id, "mark_terminal() for unknown or already-resolved correlation id");
			return;
		};
		entry.expected_completed = Some(counts.completed);

		if entry.is_satisfied() {
			Self::resolve_locked(&mut pending, correlation_id);
		}
	}

	pub fn cancel(&self, correlation_id: Uuid, reason: impl Into<String>) {
		let mut pending = self.pending.lock().unwrap();
		if let Some(mut entry) = pending.remove(&correlation_id) {
			if let Some(done) = entry.done.take() {
				let _ = done.send(Err(TrackerError::Cancelled(reason.into())));
			}
		}
	}

	/// Rejects every entry past its deadline. Intended to run every [`SWEEP_INTERVAL`].
	pub fn sweep(&self) {
		let mut pending = self.pending.lock().unwrap();
		let now = Instant::now();
		let expired: Vec<Uuid> = pending
			.iter()
			.filter(|(_, entry)| now > entry.deadline)
			.map(|(id, _)| *id)
			.collect();

		for correlation_id in expired {
			if let Some(mut entry) = pending.remove(&correlation_id) {
				info!(%correlation_id, "pending C-MOVE timed out");
				if let Some(done) = entry.done.take() {
					let _ = done.send(Err(TrackerError::Timeout));
				}
			}
		}
	}

	pub fn pending_count(&self) -> usize {
		self.pending.lock().unwrap().len()
	}

	fn resolve_locked(pending: &mut HashMap<Uuid, PendingMove>, correlation_id: Uuid) {
		if let Some(mut entry) = pending.remove(&correlation_id) {
			if let Some(done) = entry.done.take() {
				let _ = done.send(Ok(entry.datasets));
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration as StdDuration;

	fn empty_dataset() -> RetrievedInstance {
		crate::dimse::attach_file_meta(
			InMemDicomObject::new_empty(),
			"1.2.840.10008.5.1.4.1.1.7",
			"1.2.3.4",
			"1.2.840.10008.1.2",
		)
	}

	#[tokio::test]
	async fn resolves_only_after_terminal_count_and_stores_both_arrive() {
		let tracker = Tracker::new();
		let key = ResourceKey::new("1.2".into(), Some("1.2.1".into()), None);
		let (correlation_id, rx) = tracker.register(key.clone(), DEFAULT_TIMEOUT);

		let store_key = ResourceKey::new("1.2".into(), Some("1.2.1".into()), Some("1.2.1.1".into()));
		assert_eq!(tracker.validate(&store_key), Some(correlation_id));
		tracker.record(correlation_id, empty_dataset());
		assert_eq!(tracker.pending_count(), 1, "not resolved before terminal count arrives");

		tracker.mark_terminal(
			correlation_id,
			SubOperationCounts {
				completed: 1,
				..Default::default()
			},
		);

		let outcome = tokio::time::timeout(StdDuration::from_secs(1), rx)
			.await
			.expect("resolves promptly")
			.expect("sender not dropped");
		assert_eq!(outcome.unwrap().len(), 1);
		assert_eq!(tracker.pending_count(), 0);
	}

	#[tokio::test]
	async fn terminal_before_stores_still_resolves() {
		let tracker = Tracker::new();
		let key = ResourceKey::new("9.9".into(), None, None);
		let (correlation_id, rx) = tracker.register(key, DEFAULT_TIMEOUT);

		tracker.mark_terminal(
			correlation_id,
			SubOperationCounts {
				completed: 2,
				..Default::default()
			},
		);
		tracker.record(correlation_id, empty_dataset());
		tracker.record(correlation_id, empty_dataset());

		let outcome = rx.await.unwrap();
		assert_eq!(outcome.unwrap().len(), 2);
	}

	#[test]
	fn validate_rejects_unmatched_store() {
		let tracker = Tracker::new();
		let key = ResourceKey::new("1.2".into(), None, None);
		tracker.register(key, DEFAULT_TIMEOUT);

		let other = ResourceKey::new("9.9".into(), None, None);
		assert_eq!(tracker.validate(&other), None);
	}

	#[tokio::test]
	async fn sweep_times_out_stale_entries() {
		let tracker = Tracker::new();
		let key = ResourceKey::new("1.2".into(), None, None);
		let (_correlation_id, rx) = tracker.register(key, StdDuration::from_millis(1));

		tokio::time::sleep(StdDuration::from_millis(5)).await;
		tracker.sweep();

		let outcome = rx.await.unwrap();
		assert!(matches!(outcome, Err(TrackerError::Timeout)));
	}
}
