//! WADO-RS retrieval handlers: study, series and single-instance retrieval, backed by the file
//! cache and the C-GET/C-MOVE retrieval paths in [`crate::scu::DimseScu`].

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, InMemDicomObject};
use tracing::instrument;

use crate::dimse::{DimseError, WriteError};
use crate::dicomweb::{generate_boundary, related_content_type, related_multipart_body};
use crate::error::GatewayError;
use crate::types::ResourceKey;

use super::common::{header_value, require_uid, AppState, APPLICATION_DICOM};

#[instrument(skip(state))]
pub async fn study(State(state): State<AppState>, Path(study): Path<String>) -> Result<Response, GatewayError> {
	let study = require_uid("StudyInstanceUID", &study)?;
	let key = ResourceKey::new(study, None, None);
	retrieve_and_respond(&state, key).await
}

#[instrument(skip(state))]
pub async fn series(
	State(state): State<AppState>,
	Path((study, series)): Path<(String, String)>,
) -> Result<Response, GatewayError> {
	let study = require_uid("StudyInstanceUID", &study)?;
	let series = require_uid("SeriesInstanceUID", &series)?;
	let key = ResourceKey::new(study, Some(series), None);
	retrieve_and_respond(&state, key).await
}

#[instrument(skip(state))]
pub async fn instance(
	State(state): State<AppState>,
	Path((study, series, sop_instance)): Path<(String, String, String)>,
) -> Result<Response, GatewayError> {
	let study = require_uid("StudyInstanceUID", &study)?;
	let series = require_uid("SeriesInstanceUID", &series)?;
	let sop_instance = require_uid("SOPInstanceUID", &sop_instance)?;
	let key = ResourceKey::new(study, Some(series), Some(sop_instance));

	if state.config.enable_cache {
		if let Some(bytes) = state.cache.retrieve(&key) {
			return Ok(dicom_response(bytes, StatusCode::OK, true));
		}
	}

	retrieve_and_respond(&state, key).await
}

/// Shared retrieval path for study/series and single-instance requests. A study/series request
/// has no single key to check against the cache before the PACS has told us which instances
/// exist, so its cache benefit only shows up on a later direct single-instance request for one
/// of the instances retrieved here.
async fn retrieve_and_respond(state: &AppState, key: ResourceKey) -> Result<Response, GatewayError> {
	let outcome = state.scu.retrieve(key.clone(), state.config.use_cget).await?;
	if outcome.datasets.is_empty() {
		return Err(GatewayError::NotFound);
	}

	let mut parts = Vec::with_capacity(outcome.datasets.len());
	for dataset in &outcome.datasets {
		let bytes = to_part10_bytes(dataset)?;
		if state.config.enable_cache {
			let instance_key = resource_key_of(dataset, &key);
			state.cache.store(&instance_key, &bytes);
		}
		parts.push(bytes);
	}

	let response = if parts.len() == 1 {
		dicom_response(parts.into_iter().next().expect("checked len == 1"), StatusCode::OK, false)
	} else {
		let boundary = generate_boundary();
		let body = related_multipart_body(&boundary, &parts);
		Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, header_value(&related_content_type(&boundary)))
			.header("X-Cache", "MISS")
			.body(Body::from(body))
			.expect("static headers are always valid")
	};

	Ok(response)
}

fn dicom_response(bytes: Vec<u8>, status: StatusCode, cache_hit: bool) -> Response {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, header_value(APPLICATION_DICOM))
		.header("X-Cache", if cache_hit { "HIT" } else { "MISS" })
		.body(Body::from(bytes))
		.expect("static headers are always valid")
}

fn to_part10_bytes(file: &FileDicomObject<InMemDicomObject>) -> Result<Vec<u8>, GatewayError> {
	let mut buf = Vec::new();
	file.write_all(&mut buf)
		.map_err(WriteError::from)
		.map_err(DimseError::from)?;
	Ok(buf)
}

/// Derives the most-specific `ResourceKey` a retrieved instance actually carries, falling back
/// to the request's own key for whichever UIDs the dataset doesn't repeat.
fn resource_key_of(file: &FileDicomObject<InMemDicomObject>, fallback: &ResourceKey) -> ResourceKey {
	let study = file
		.get(tags::STUDY_INSTANCE_UID)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|v| v.into_owned())
		.unwrap_or_else(|| fallback.study_instance_uid.clone());
	let series = file
		.get(tags::SERIES_INSTANCE_UID)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|v| v.into_owned())
		.or_else(|| fallback.series_instance_uid.clone());
	let sop_instance = file
		.get(tags::SOP_INSTANCE_UID)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|v| v.into_owned())
		.or_else(|| fallback.sop_instance_uid.clone());

	ResourceKey::new(study, series, sop_instance)
}
