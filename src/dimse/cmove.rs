//! C-MOVE: out-of-band retrieval. The SCU sends a C-MOVE-RQ naming a destination AET; the
//! resulting instances arrive as C-STOREs on a separate, inbound association handled by the
//! SCP (see [`crate::scp`]) and correlated via [`crate::tracker`].

use std::time::Duration;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use thiserror::Error;
use tracing::{instrument, trace};

use super::association::pool::{AssociationPool, PoolError, PresentationParameter};
use super::association::AssociationError;
use super::{DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError};
use crate::types::{Aet, Uid, Us};

pub(crate) const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: Us = 0x0021;

/// C-MOVE-RQ
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: Us,
	pub priority: Us,
	pub destination: Aet,
}

impl From<CompositeMoveRequest> for DicomMessage {
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(
				tags::AFFECTED_SOP_CLASS_UID,
				VR::UI,
				dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
			),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [super::DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// Sub-operation counters carried by C-MOVE-RSP, used as the completion gate by the tracker:
/// it gates on the terminal response's completed count, not on the first inbound C-STORE.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubOperationCounts {
	pub remaining: u32,
	pub completed: u32,
	pub failed: u32,
	pub warning: u32,
}

fn read_counter(command: &InMemDicomObject, tag: dicom::core::Tag) -> u32 {
	command
		.get(tag)
		.map(InMemElement::to_int::<u32>)
		.and_then(Result::ok)
		.unwrap_or(0)
}

impl SubOperationCounts {
	pub(crate) fn from_command(command: &InMemDicomObject) -> Self {
		Self {
			remaining: read_counter(command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
			completed: read_counter(command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
			failed: read_counter(command, tags::NUMBER_OF_FAILED_SUBOPERATIONS),
			warning: read_counter(command, tags::NUMBER_OF_WARNING_SUBOPERATIONS),
		}
	}
}

pub struct MoveServiceClassUser {
	pool: AssociationPool,
	timeout: Duration,
}

impl MoveServiceClassUser {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	/// Sends the C-MOVE-RQ and drives it to a terminal status, returning the final
	/// sub-operation counters reported by the peer.
	#[instrument(skip_all, name = "move_scu")]
	pub async fn invoke(&self, request: CompositeMoveRequest) -> Result<SubOperationCounts, MoveError> {
		let presentation = PresentationParameter {
			abstract_syntax_uid: Uid::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
			transfer_syntax_uids: vec![Uid::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};
		let association = self.pool.get(presentation).await?;

		association.write_message(request, None, self.timeout).await?;
		trace!("sent C-MOVE-RQ");

		loop {
			let response = association.read_message(self.timeout).await?;
			let counts = SubOperationCounts::from_command(&response.command);
			let status = response
				.command
				.get(tags::STATUS)
				.map(InMemElement::to_int::<Us>)
				.and_then(Result::ok)
				.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

			trace!(status, ?counts, "received C-MOVE-RSP");

			match StatusType::try_from(status).unwrap_or(StatusType::Failure) {
				StatusType::Success | StatusType::Warning => return Ok(counts),
				StatusType::Pending => continue,
				StatusType::Cancel => return Err(MoveError::Cancelled),
				StatusType::Failure => return Err(MoveError::OperationFailed(status)),
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Pool(#[from] PoolError<AssociationError>),
	#[error("C-MOVE sub-operation failed with status {0:#06X}")]
	OperationFailed(Us),
	#[error("C-MOVE operation was cancelled")]
	Cancelled,
}
