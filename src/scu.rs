//! High-level SCU facade used by the HTTP handlers: wraps the per-verb service-class-user
//! types in `dimse::{cecho,cfind,cmove,cget}` behind the operations a QIDO/WADO request
//! actually needs, and coordinates the C-MOVE path with the correlation tracker.

use std::time::Duration;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, InMemDicomObject};
use futures::StreamExt;
use tracing::{info, instrument};

use crate::dimse::association::pool::{AssociationPool, PresentationParameter};
use crate::dimse::cecho::EchoServiceClassUser;
use crate::dimse::cfind::FindServiceClassUser;
use crate::dimse::cget::GetServiceClassUser;
use crate::dimse::cmove::{CompositeMoveRequest, MoveServiceClassUser};
use crate::dimse::next_message_id;
use crate::error::GatewayError;
use crate::tracker::Tracker;
use crate::types::{Aet, Priority, ResourceKey};

use std::sync::Arc;

/// Outcome of a retrieval, independent of whether it went through C-GET or C-MOVE.
#[derive(Debug, Default)]
pub struct RetrieveResult {
	pub datasets: Vec<FileDicomObject<InMemDicomObject>>,
	pub completed: u32,
	pub failed: u32,
	pub warnings: u32,
}

pub struct DimseScu {
	pool: AssociationPool,
	find: FindServiceClassUser,
	move_scu: MoveServiceClassUser,
	get_scu: GetServiceClassUser,
	tracker: Arc<Tracker>,
	own_aet: Aet,
	timeout: Duration,
}

impl DimseScu {
	pub fn new(pool: AssociationPool, tracker: Arc<Tracker>, own_aet: Aet, timeout: Duration) -> Self {
		Self {
			find: FindServiceClassUser::new(pool.clone(), timeout),
			move_scu: MoveServiceClassUser::new(pool.clone(), timeout),
			get_scu: GetServiceClassUser::new(pool.clone(), timeout),
			pool,
			tracker,
			own_aet,
			timeout,
		}
	}

	#[instrument(skip(self))]
	pub async fn echo(&self) -> Result<bool, GatewayError> {
		let presentation = PresentationParameter {
			abstract_syntax_uid: uids::VERIFICATION.to_string(),
			transfer_syntax_uids: vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
		};
		let association = self.pool.get(presentation).await?;
		let ok = EchoServiceClassUser::new(&association).echo(self.timeout).await?;
		Ok(ok)
	}

	/// Runs a Study-Root C-FIND at whatever `QueryRetrieveLevel` the caller has already set on
	/// `identifier` and collects every matched dataset.
	#[instrument(skip(self, identifier))]
	pub async fn find(&self, identifier: InMemDicomObject, priority: Priority) -> Result<Vec<InMemDicomObject>, GatewayError> {
		let message_id = next_message_id();
		let stream = self.find.invoke(identifier, priority, message_id);
		tokio::pin!(stream);

		let mut datasets = Vec::new();
		while let Some(item) = stream.next().await {
			datasets.push(item?);
		}
		Ok(datasets)
	}

	/// Retrieves the resource identified by `key`, via C-GET (single association, inline
	/// C-STORE sub-operations) or C-MOVE (out-of-band, correlated through the tracker).
	#[instrument(skip(self))]
	pub async fn retrieve(&self, key: ResourceKey, use_cget: bool) -> Result<RetrieveResult, GatewayError> {
		if use_cget {
			self.retrieve_via_cget(key).await
		} else {
			self.retrieve_via_cmove(key).await
		}
	}

	async fn retrieve_via_cget(&self, key: ResourceKey) -> Result<RetrieveResult, GatewayError> {
		let identifier = identifier_for(&key);
		let outcome = self.get_scu.invoke(identifier, Priority::Medium as _, next_message_id()).await?;

		Ok(RetrieveResult {
			datasets: outcome.datasets,
			completed: outcome.counts.completed,
			failed: outcome.counts.failed,
			warnings: outcome.counts.warning,
		})
	}

	async fn retrieve_via_cmove(&self, key: ResourceKey) -> Result<RetrieveResult, GatewayError> {
		let (correlation_id, rx) = self.tracker.register(key.clone(), crate::tracker::DEFAULT_TIMEOUT);

		let request = CompositeMoveRequest {
			identifier: identifier_for(&key),
			message_id: next_message_id(),
			priority: Priority::Medium as _,
			destination: self.own_aet.clone(),
		};

		let counts = match self.move_scu.invoke(request).await {
			Ok(counts) => counts,
			Err(err) => {
				self.tracker.cancel(correlation_id, err.to_string());
				return Err(err.into());
			}
		};
		info!(?counts, "C-MOVE reached terminal status");
		self.tracker.mark_terminal(correlation_id, counts);

		let datasets = rx.await.map_err(|_| GatewayError::Timeout)??;

		Ok(RetrieveResult {
			datasets,
			completed: counts.completed,
			failed: counts.failed,
			warnings: counts.warning,
		})
	}
}

/// Builds the C-MOVE/C-GET identifier dataset for `key`: `QueryRetrieveLevel` plus whichever
/// UIDs are specified.
fn identifier_for(key: &ResourceKey) -> InMemDicomObject {
	let mut identifier = InMemDicomObject::new_empty();
	identifier.put_element(DataElement::new(
		tags::QUERY_RETRIEVE_LEVEL,
		VR::CS,
		dicom_value!(Str, key.level().to_string()),
	));
	identifier.put_element(DataElement::new(
		tags::STUDY_INSTANCE_UID,
		VR::UI,
		dicom_value!(Str, key.study_instance_uid.clone()),
	));
	if let Some(series) = &key.series_instance_uid {
		identifier.put_element(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series.clone())));
	}
	if let Some(instance) = &key.sop_instance_uid {
		identifier.put_element(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, instance.clone())));
	}
	identifier
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement;

	#[test]
	fn identifier_carries_level_and_specified_uids() {
		let key = ResourceKey::new("1.2".into(), Some("1.2.1".into()), None);
		let identifier = identifier_for(&key);

		let level = identifier.get(tags::QUERY_RETRIEVE_LEVEL).map(InMemElement::to_str).and_then(Result::ok).unwrap();
		assert_eq!(level, "SERIES");
		assert!(identifier.get(tags::SOP_INSTANCE_UID).is_none());
	}
}
