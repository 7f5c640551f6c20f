//! DIMSE protocol layer: PDU framing is handled by `dicom::ul`; this module layers a
//! message-oriented API (command set + optional data set) on top of an [`association::Association`],
//! plus the per-verb command-set encoders/decoders used by the SCU and SCP roles.

pub mod association;
pub mod cecho;
pub mod cfind;
pub mod cget;
pub mod cmove;
pub mod cstore;

use association::{Association, AssociationError};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::types::{Uid, Us};

/// Set on COMMAND_DATA_SET_TYPE when a message carries a data set.
pub const DATA_SET_EXISTS: Us = 0x0102;
/// Set on COMMAND_DATA_SET_TYPE when a message has no data set (DICOM NULL).
pub const DATA_SET_MISSING: Us = 0x0101;

/// A DIMSE message: a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

/// Status categories per <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => Ok(Self::Failure),
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

/// DIMSE status code meaning "not authorized", used by the SCP to reject an unsolicited C-STORE.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_c.2.3.html>
pub const STATUS_NOT_AUTHORIZED: Us = 0x0124;
pub const STATUS_PROCESSING_FAILURE: Us = 0x0110;
pub const STATUS_SOP_CLASS_NOT_SUPPORTED: Us = 0x0122;
pub const STATUS_SUCCESS: Us = 0x0000;

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);

		let presentation_context = match presentation_context_id {
			None => self.presentation_contexts().first(),
			Some(id) => self
				.presentation_contexts()
				.iter()
				.find(|pctx| pctx.id == id),
		}
		.ok_or(NegotiationError::NoPresentationContext)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: presentation_context.id,
				is_last: true,
				data: command_buf,
			}],
		};
		self.send(command_pdu, timeout).await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(Uid::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, &transfer_syntax)?;

			let data_pdu = Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Data,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: data_buf,
				}],
			};
			self.send(data_pdu, timeout).await?;
		}

		Ok(())
	}
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive(timeout).await?;
			let Pdu::PData { data } = pdu else {
				return Err(ReadError::UnexpectedPdu(pdu));
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("received command fragment (last={})", pdv.is_last);
						if message_command.is_some() {
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let command = InMemDicomObject::read_dataset_with_ts(
								command_fragments.as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)?;
							let has_data_set = command
								.get(tags::COMMAND_DATA_SET_TYPE)
								.map(InMemElement::to_int::<Us>)
								.and_then(Result::ok)
								.is_some_and(|value| value != DATA_SET_MISSING);

							if has_data_set {
								message_command = Some(command);
							} else {
								return Ok(DicomMessage {
									command,
									data: None,
									presentation_context_id: Some(pdv.presentation_context_id),
								});
							}
						}
					}
					PDataValueType::Data => {
						trace!("received data fragment (last={})", pdv.is_last);
						data_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let presentation_context = self
								.presentation_contexts()
								.iter()
								.find(|pctx| pctx.id == pdv.presentation_context_id)
								.ok_or(NegotiationError::NoPresentationContext)?;
							let transfer_syntax = TransferSyntaxRegistry
								.get(&presentation_context.transfer_syntax)
								.ok_or_else(|| {
									NegotiationError::UnknownTransferSyntax(Uid::from(
										&presentation_context.transfer_syntax,
									))
								})?;
							let data = InMemDicomObject::read_dataset_with_ts(
								data_fragments.as_slice(),
								transfer_syntax,
							)?;

							return if let Some(command) = message_command {
								Ok(DicomMessage {
									command,
									data: Some(data),
									presentation_context_id: Some(pdv.presentation_context_id),
								})
							} else {
								Err(ReadError::OutOfOrder)
							};
						}
					}
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("received fragments out of order")]
	OutOfOrder,
	#[error("failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("mandatory attribute is missing: {0:?}")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(Uid),
	#[error("failed to negotiate a presentation context")]
	NoPresentationContext,
}

#[derive(Debug, Error)]
pub enum DimseError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
}

/// Returns a fresh DIMSE message id by incrementing a process-wide counter.
pub fn next_message_id() -> Us {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(0);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

/// Attaches a minimal file meta group to a bare dataset received as a C-STORE sub-operation
/// payload, so it can be serialized to Part-10 bytes for WADO responses.
pub fn attach_file_meta(
	dataset: InMemDicomObject,
	sop_class_uid: &str,
	sop_instance_uid: &str,
	transfer_syntax_uid: &str,
) -> FileDicomObject<InMemDicomObject> {
	let meta = FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(sop_class_uid)
		.media_storage_sop_instance_uid(sop_instance_uid)
		.transfer_syntax(transfer_syntax_uid)
		.build()
		.expect("sop class uid, sop instance uid and transfer syntax are always supplied");
	dataset.with_exact_meta(meta)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_type_classifies_ranges() {
		assert_eq!(StatusType::try_from(0x0000), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFF01), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFE00), Ok(StatusType::Cancel));
		assert_eq!(StatusType::try_from(0xA700), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xB000), Ok(StatusType::Warning));
	}

	#[test]
	fn message_ids_increment() {
		let first = next_message_id();
		let second = next_message_id();
		assert_eq!(second, first + 1);
	}
}
