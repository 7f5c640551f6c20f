//! C-GET: in-band retrieval. Unlike C-MOVE, the resulting C-STORE sub-operations arrive on the
//! *same* association as the C-GET-RQ, interleaved with CGET-RSP progress messages, so the SCU
//! must read and respond to them itself rather than relying on the SCP + tracker coupling.

use std::time::Duration;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, InMemDicomObject};
use thiserror::Error;
use tracing::{instrument, trace};

use super::association::pool::{AssociationPool, PoolError, PresentationParameter};
use super::association::{Association, AssociationError};
use super::cmove::SubOperationCounts;
use super::cstore::{CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST};
use super::{
	attach_file_meta, DicomMessage, DicomMessageReader, DicomMessageWriter, NegotiationError,
	ReadError, StatusType, WriteError, STATUS_SUCCESS,
};
use crate::types::Uid;
use crate::types::Us;

pub(crate) const COMMAND_FIELD_COMPOSITE_GET_REQUEST: Us = 0x0010;

/// C-GET-RQ
pub struct CompositeGetRequest {
	pub message_id: Us,
	pub priority: Us,
	pub identifier: InMemDicomObject,
}

impl From<CompositeGetRequest> for DicomMessage {
	fn from(request: CompositeGetRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(
				tags::AFFECTED_SOP_CLASS_UID,
				VR::UI,
				dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
			),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_GET_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [super::DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

pub struct GetOutcome {
	pub datasets: Vec<FileDicomObject<InMemDicomObject>>,
	pub counts: SubOperationCounts,
}

pub struct GetServiceClassUser {
	pool: AssociationPool,
	timeout: Duration,
}

impl GetServiceClassUser {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	#[instrument(skip_all, name = "get_scu")]
	pub async fn invoke(&self, identifier: InMemDicomObject, priority: Us, message_id: Us) -> Result<GetOutcome, GetError> {
		let presentation_get = PresentationParameter {
			abstract_syntax_uid: Uid::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
			transfer_syntax_uids: vec![Uid::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};
		let association = self.pool.get(presentation_get).await?;

		let request = CompositeGetRequest {
			message_id,
			priority,
			identifier,
		};
		association.write_message(request, None, self.timeout).await?;
		trace!("sent C-GET-RQ");

		let mut datasets = Vec::new();
		loop {
			let message = association.read_message(self.timeout).await?;
			let command_field = message
				.command
				.get(tags::COMMAND_FIELD)
				.map(InMemElement::to_int::<Us>)
				.and_then(Result::ok)
				.ok_or(ReadError::MissingAttribute(tags::COMMAND_FIELD))?;

			if command_field == COMMAND_FIELD_COMPOSITE_STORE_REQUEST {
				let (sop_class_uid, sop_instance_uid, store_message_id, dataset) =
					Self::read_store_request(&message)?;
				let transfer_syntax = association
					.presentation_contexts()
					.iter()
					.find(|pctx| Some(pctx.id) == message.presentation_context_id)
					.map(|pctx| pctx.transfer_syntax.clone())
					.ok_or(ReadError::Negotiation(NegotiationError::NoPresentationContext))?;
				datasets.push(attach_file_meta(dataset, &sop_class_uid, &sop_instance_uid, &transfer_syntax));

				let response = CompositeStoreResponse {
					message_id: store_message_id,
					sop_class_uid,
					sop_instance_uid,
					status: STATUS_SUCCESS,
				};
				association
					.write_message(response, message.presentation_context_id, self.timeout)
					.await?;
				trace!("replied to inline C-STORE-RQ");
				continue;
			}

			let counts = SubOperationCounts::from_command(&message.command);
			let status = message
				.command
				.get(tags::STATUS)
				.map(InMemElement::to_int::<Us>)
				.and_then(Result::ok)
				.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

			trace!(status, ?counts, "received C-GET-RSP");
			match StatusType::try_from(status).unwrap_or(StatusType::Failure) {
				StatusType::Success | StatusType::Warning => return Ok(GetOutcome { datasets, counts }),
				StatusType::Pending => continue,
				StatusType::Cancel => return Err(GetError::Cancelled),
				StatusType::Failure => return Err(GetError::OperationFailed(status)),
			}
		}
	}

	fn read_store_request(
		message: &DicomMessage,
	) -> Result<(Uid, Uid, Us, InMemDicomObject), ReadError> {
		let sop_class_uid = message
			.command
			.get(tags::AFFECTED_SOP_CLASS_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| Uid::from(v.into_owned()))
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?;
		let sop_instance_uid = message
			.command
			.get(tags::AFFECTED_SOP_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| Uid::from(v.into_owned()))
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?;
		let message_id = message
			.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int::<Us>)
			.and_then(Result::ok)
			.unwrap_or(0);
		let dataset = message
			.data
			.clone()
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_DATA_SET_TYPE))?;

		Ok((sop_class_uid, sop_instance_uid, message_id, dataset))
	}
}

#[derive(Debug, Error)]
pub enum GetError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Pool(#[from] PoolError<AssociationError>),
	#[error("C-GET sub-operation failed with status {0:#06X}")]
	OperationFailed(Us),
	#[error("C-GET operation was cancelled")]
	Cancelled,
}
