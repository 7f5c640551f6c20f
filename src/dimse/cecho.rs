//! C-ECHO: the Verification SOP class. Used both as the externally visible `echo(peer)`
//! operation and internally to recycle pooled associations.

use std::time::Duration;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use thiserror::Error;
use tracing::{debug, instrument, trace};

use super::association::client::ClientAssociation;
use super::{next_message_id, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError};
use crate::types::Us;

pub(crate) const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: Us = 0x0030;
const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: Us = 0x8030;

/// C-ECHO-RQ
struct CompositeEchoRequest {
	message_id: Us,
}

impl From<CompositeEchoRequest> for DicomMessage {
	fn from(request: CompositeEchoRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [super::DATA_SET_MISSING])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// C-ECHO-RSP
struct CompositeEchoResponse {
	status: Us,
}

impl TryFrom<DicomMessage> for CompositeEchoResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<Us>)
			.and_then(Result::ok)
			.ok_or(Self::Error::MissingAttribute(tags::STATUS))?;

		Ok(Self { status })
	}
}

/// C-ECHO-RSP sent by the SCP side in answer to an inbound C-ECHO-RQ.
pub struct EchoResponse {
	pub message_id: Us,
	pub status: Us,
}

impl From<EchoResponse> for DicomMessage {
	fn from(response: EchoResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [super::DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// Service class user for the Verification SOP class: sends a C-ECHO-RQ and awaits the RSP.
pub struct EchoServiceClassUser<'a> {
	association: &'a ClientAssociation,
}

impl<'a> EchoServiceClassUser<'a> {
	pub const fn new(association: &'a ClientAssociation) -> Self {
		Self { association }
	}

	#[instrument(skip_all)]
	pub async fn echo(&self, timeout: Duration) -> Result<bool, EchoError> {
		trace!("initiated C-ECHO");
		let request = CompositeEchoRequest {
			message_id: next_message_id(),
		};
		self.association.write_message(request, None, timeout).await?;

		let response = self.association.read_message(timeout).await?;
		let response = CompositeEchoResponse::try_from(response)?;
		let status_type = StatusType::try_from(response.status).unwrap_or(StatusType::Failure);

		debug!(status = response.status, ?status_type, "received C-ECHO-RSP");
		Ok(status_type == StatusType::Success)
	}
}

#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
}
