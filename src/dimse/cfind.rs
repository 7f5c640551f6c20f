//! C-FIND: Study-Root Query/Retrieve, used by `findStudies`/`findSeries`/`findInstances`.

use std::time::Duration;

use async_stream::try_stream;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use futures::Stream;
use thiserror::Error;
use tracing::trace;

use super::association::pool::{AssociationPool, PoolError, PresentationParameter};
use super::association::AssociationError;
use super::{DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError};
use crate::types::{Priority, Uid, Us};

pub(crate) const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: Us = 0x0020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: Us,
	pub priority: Us,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(
				tags::AFFECTED_SOP_CLASS_UID,
				VR::UI,
				dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
			),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
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

/// C-FIND-RSP
struct CompositeFindResponse {
	status: Us,
	data: Option<InMemDicomObject>,
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<Us>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			status,
			data: message.data,
		})
	}
}

pub struct FindServiceClassUser {
	pool: AssociationPool,
	timeout: Duration,
}

impl FindServiceClassUser {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	pub fn invoke(
		&self,
		identifier: InMemDicomObject,
		priority: Priority,
		message_id: Us,
	) -> impl Stream<Item = Result<InMemDicomObject, FindError>> + '_ {
		let presentation = PresentationParameter {
			abstract_syntax_uid: Uid::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
			transfer_syntax_uids: vec![Uid::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};

		try_stream! {
			let association = self.pool.get(presentation).await?;
			let request = CompositeFindRequest {
				message_id,
				priority: priority as Us,
				identifier,
			};
			association.write_message(request, None, self.timeout).await?;
			trace!("sent C-FIND-RQ");

			loop {
				let response = association.read_message(self.timeout).await?;
				let response = CompositeFindResponse::try_from(response)?;
				trace!(status = response.status, "received C-FIND-RSP");

				if let Some(data) = response.data {
					yield data;
				}

				if StatusType::try_from(response.status).unwrap_or(StatusType::Failure) != StatusType::Pending {
					break;
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Pool(#[from] PoolError<AssociationError>),
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement;

	#[test]
	fn composite_find_request_carries_study_root_sop_class() {
		let identifier = InMemDicomObject::new_empty();
		let request = CompositeFindRequest {
			message_id: 1,
			priority: Priority::Medium as Us,
			identifier,
		};
		let message: DicomMessage = request.into();
		let sop_class = message
			.command
			.get(tags::AFFECTED_SOP_CLASS_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.unwrap();
		assert_eq!(sop_class, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);
	}
}
