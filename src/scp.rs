//! DIMSE SCP: accepts inbound associations from PACS peers, answers C-ECHO, and receives the
//! C-STORE sub-operations a C-MOVE triggers. C-FIND/C-MOVE/C-GET-RQ are rejected — this
//! gateway is a retrieve destination, not a query provider.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, instrument, warn};

use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::{Association, AssociationError};
use crate::dimse::cecho::{EchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use crate::dimse::cfind::COMMAND_FIELD_COMPOSITE_FIND_REQUEST;
use crate::dimse::cget::COMMAND_FIELD_COMPOSITE_GET_REQUEST;
use crate::dimse::cmove::COMMAND_FIELD_COMPOSITE_MOVE_REQUEST;
use crate::dimse::cstore::{CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST};
use crate::dimse::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, WriteError,
	STATUS_NOT_AUTHORIZED, STATUS_PROCESSING_FAILURE, STATUS_SOP_CLASS_NOT_SUPPORTED,
	STATUS_SUCCESS,
};
use crate::tracker::Tracker;
use crate::types::{ResourceKey, Us};

const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: Us = 0x8020;
const COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE: Us = 0x8021;
const COMMAND_FIELD_COMPOSITE_GET_RESPONSE: Us = 0x8010;
const READ_TIMEOUT: Duration = Duration::MAX;
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ScpError {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error("rejected association from unauthorized calling AE title '{0}'")]
	UnauthorizedCallingAet(String),
	#[error("mandatory attribute is missing: {0:?}")]
	MissingAttribute(dicom::core::Tag),
}

pub struct DicomScp {
	listen_addr: SocketAddr,
	own_aet: String,
	authorized_calling_aets: Vec<String>,
	uncompressed: bool,
	tracker: Arc<Tracker>,
}

impl DicomScp {
	pub fn new(
		listen_addr: SocketAddr,
		own_aet: String,
		authorized_calling_aets: Vec<String>,
		uncompressed: bool,
		tracker: Arc<Tracker>,
	) -> Self {
		Self {
			listen_addr,
			own_aet,
			authorized_calling_aets,
			uncompressed,
			tracker,
		}
	}

	/// Runs the accept loop forever. Each inbound connection is handled on its own task so a
	/// slow or stuck peer cannot block others.
	pub async fn serve(self: Arc<Self>) -> Result<(), ScpError> {
		let listener = TcpListener::bind(self.listen_addr).await?;
		info!(addr = %self.listen_addr, aet = self.own_aet, "DIMSE SCP listening");

		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let this = Arc::clone(&self);
					tokio::spawn(async move {
						if let Err(err) = this.handle_connection(stream, peer).await {
							warn!(%peer, error = %err, "SCP connection ended");
						}
					});
				}
				Err(err) => warn!(error = %err, "failed to accept inbound connection"),
			}
		}
	}

	#[instrument(skip(self, stream))]
	async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ScpError> {
		let tcp_stream = stream.into_std()?;
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: self.own_aet.clone(),
			tcp_stream,
			uncompressed: self.uncompressed,
		};
		let association = ServerAssociation::new(options).await?;

		let calling_aet = association.calling_ae_title().to_string();
		if !self.authorized_calling_aets.iter().any(|aet| aet == &calling_aet) {
			warn!(calling_aet, %peer, "rejecting unauthorized calling AE title");
			return Err(ScpError::UnauthorizedCallingAet(calling_aet));
		}
		info!(calling_aet, %peer, "accepted inbound association");

		while let Ok(message) = association.read_message(READ_TIMEOUT).await {
			self.dispatch(&association, message).await?;
		}

		Ok(())
	}

	async fn dispatch(&self, association: &ServerAssociation, message: DicomMessage) -> Result<(), ScpError> {
		let command_field = message
			.command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<Us>)
			.and_then(Result::ok)
			.ok_or(ScpError::MissingAttribute(tags::COMMAND_FIELD))?;

		match command_field {
			COMMAND_FIELD_COMPOSITE_ECHO_REQUEST => self.handle_echo(association, &message).await,
			COMMAND_FIELD_COMPOSITE_STORE_REQUEST => self.handle_store(association, message).await,
			COMMAND_FIELD_COMPOSITE_FIND_REQUEST => {
				self.reject_query(association, &message, COMMAND_FIELD_COMPOSITE_FIND_RESPONSE).await
			}
			COMMAND_FIELD_COMPOSITE_MOVE_REQUEST => {
				self.reject_query(association, &message, COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE).await
			}
			COMMAND_FIELD_COMPOSITE_GET_REQUEST => {
				self.reject_query(association, &message, COMMAND_FIELD_COMPOSITE_GET_RESPONSE).await
			}
			other => {
				warn!(command_field = other, "received unsupported command field");
				Ok(())
			}
		}
	}

	async fn handle_echo(&self, association: &ServerAssociation, message: &DicomMessage) -> Result<(), ScpError> {
		let message_id = message_id_of(message);
		let response = EchoResponse {
			message_id,
			status: STATUS_SUCCESS,
		};
		association
			.write_message(response, message.presentation_context_id, WRITE_TIMEOUT)
			.await
			.map_err(Into::into)
	}

	async fn handle_store(&self, association: &ServerAssociation, message: DicomMessage) -> Result<(), ScpError> {
		let message_id = message_id_of(&message);
		let sop_class_uid = message
			.command
			.get(tags::AFFECTED_SOP_CLASS_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| v.into_owned())
			.ok_or(ScpError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?;
		let sop_instance_uid = message
			.command
			.get(tags::AFFECTED_SOP_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| v.into_owned())
			.ok_or(ScpError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?;

		let status = match &message.data {
			None => STATUS_PROCESSING_FAILURE,
			Some(dataset) => match resource_key_of(dataset) {
				Ok(key) => match self.tracker.validate(&key) {
					Some(correlation_id) => {
						let transfer_syntax = association
							.presentation_contexts()
							.iter()
							.find(|pctx| Some(pctx.id) == message.presentation_context_id)
							.map(|pctx| pctx.transfer_syntax.clone());
						match transfer_syntax {
							Some(transfer_syntax) => {
								let file = crate::dimse::attach_file_meta(
									dataset.clone(),
									&sop_class_uid,
									&sop_instance_uid,
									&transfer_syntax,
								);
								self.tracker.record(correlation_id, file);
								STATUS_SUCCESS
							}
							None => {
								warn!("no negotiated presentation context for inbound C-STORE");
								STATUS_PROCESSING_FAILURE
							}
						}
					}
					None => {
						warn!(study = key.study_instance_uid, "rejecting unsolicited C-STORE");
						STATUS_NOT_AUTHORIZED
					}
				},
				Err(err) => {
					warn!(error = %err, "failed to extract identifiers from stored dataset");
					STATUS_PROCESSING_FAILURE
				}
			},
		};

		let response = CompositeStoreResponse {
			message_id,
			sop_class_uid,
			sop_instance_uid,
			status,
		};
		association
			.write_message(response, message.presentation_context_id, WRITE_TIMEOUT)
			.await
			.map_err(Into::into)
	}

	async fn reject_query(&self, association: &ServerAssociation, message: &DicomMessage, response_command_field: Us) -> Result<(), ScpError> {
		let message_id = message_id_of(message);
		let sop_class_uid = message
			.command
			.get(tags::AFFECTED_SOP_CLASS_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| v.into_owned())
			.unwrap_or_default();

		let command = dicom::object::InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [response_command_field])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [crate::dimse::DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [STATUS_SOP_CLASS_NOT_SUPPORTED])),
		]);
		let response = DicomMessage {
			command,
			data: None,
			presentation_context_id: None,
		};

		association
			.write_message(response, message.presentation_context_id, WRITE_TIMEOUT)
			.await
			.map_err(Into::into)
	}
}

fn message_id_of(message: &DicomMessage) -> Us {
	message
		.command
		.get(tags::MESSAGE_ID)
		.map(InMemElement::to_int::<Us>)
		.and_then(Result::ok)
		.unwrap_or(0)
}

fn resource_key_of(dataset: &dicom::object::InMemDicomObject) -> Result<ResourceKey, ReadError> {
	let study = dataset
		.get(tags::STUDY_INSTANCE_UID)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|v| v.into_owned())
		.ok_or(ReadError::MissingAttribute(tags::STUDY_INSTANCE_UID))?;
	let series = dataset.get(tags::SERIES_INSTANCE_UID).map(InMemElement::to_str).and_then(Result::ok).map(|v| v.into_owned());
	let instance = dataset.get(tags::SOP_INSTANCE_UID).map(InMemElement::to_str).and_then(Result::ok).map(|v| v.into_owned());

	Ok(ResourceKey::new(study, series, instance))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resource_key_requires_study_uid() {
		let dataset = dicom::object::InMemDicomObject::new_empty();
		assert!(resource_key_of(&dataset).is_err());
	}
}
