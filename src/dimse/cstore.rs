//! C-STORE command-set encode/decode, shared by the SCP's C-MOVE payload handler
//! ([`crate::scp`]) and the C-GET inline store handler ([`crate::dimse::cget`]).

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

use super::{DicomMessage, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{Aet, Uid, Us};

pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: Us = 0x0001;
const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: Us = 0x8001;

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: Uid,
	pub affected_sop_instance_uid: Uid,
	pub move_originator_aet: Option<Aet>,
	pub move_originator_message_id: Option<Us>,
	pub message_id: Us,
	pub priority: Us,
	pub data_set: InMemDicomObject,
}

impl From<CompositeStoreRequest> for DicomMessage {
	fn from(request: CompositeStoreRequest) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
		]);

		if let Some(move_originator_message_id) = request.move_originator_message_id {
			command.put_element(DataElement::new(
				tags::MOVE_ORIGINATOR_MESSAGE_ID,
				VR::US,
				dicom_value!(U16, [move_originator_message_id]),
			));
		}
		if let Some(move_originator_aet) = request.move_originator_aet {
			command.put_element(DataElement::new(
				tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
				VR::AE,
				dicom_value!(Str, move_originator_aet),
			));
		}

		Self {
			command,
			data: Some(request.data_set),
			presentation_context_id: None,
		}
	}
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: Us,
	pub sop_class_uid: Uid,
	pub sop_instance_uid: Uid,
	pub status: Us,
}

impl From<CompositeStoreResponse> for DicomMessage {
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement;

	#[test]
	fn store_response_carries_requested_status() {
		let response = CompositeStoreResponse {
			message_id: 7,
			sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".into(),
			sop_instance_uid: "1.2.3.4".into(),
			status: super::super::STATUS_NOT_AUTHORIZED,
		};
		let message: DicomMessage = response.into();
		let status = message
			.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<Us>)
			.and_then(Result::ok)
			.unwrap();
		assert_eq!(status, super::super::STATUS_NOT_AUTHORIZED);
	}
}
