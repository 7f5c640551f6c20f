//! QIDO-RS search handlers: study, series and instance level queries, translated into a
//! Study-Root C-FIND and back into DICOMweb JSON.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum_extra::extract::Query;
use serde_json::Value;
use tracing::instrument;

use crate::dicomweb::{build_identifier, dataset_to_json, QueryParameters};
use crate::error::GatewayError;
use crate::types::{Priority, QueryRetrieveLevel};

use super::common::{header_value, require_uid, AppState, APPLICATION_DICOM_JSON};

#[instrument(skip(state))]
pub async fn studies(State(state): State<AppState>, Query(params): Query<QueryParameters>) -> Result<Response, GatewayError> {
	search(&state, QueryRetrieveLevel::Study, None, None, &params).await
}

#[instrument(skip(state))]
pub async fn series(
	State(state): State<AppState>,
	Path(study): Path<String>,
	Query(params): Query<QueryParameters>,
) -> Result<Response, GatewayError> {
	let study = require_uid("StudyInstanceUID", &study)?;
	search(&state, QueryRetrieveLevel::Series, Some(&study), None, &params).await
}

#[instrument(skip(state))]
pub async fn instances(
	State(state): State<AppState>,
	Path((study, series)): Path<(String, String)>,
	Query(params): Query<QueryParameters>,
) -> Result<Response, GatewayError> {
	let study = require_uid("StudyInstanceUID", &study)?;
	let series = require_uid("SeriesInstanceUID", &series)?;
	search(&state, QueryRetrieveLevel::Image, Some(&study), Some(&series), &params).await
}

async fn search(
	state: &AppState,
	level: QueryRetrieveLevel,
	study: Option<&str>,
	series: Option<&str>,
	params: &QueryParameters,
) -> Result<Response, GatewayError> {
	let identifier = build_identifier(level, study, series, params, state.config.qido_min_chars, state.config.qido_append_wildcard);

	let datasets = state.scu.find(identifier, Priority::Medium).await?;
	let values: Vec<Value> = datasets.iter().skip(params.offset).take(params.limit).map(dataset_to_json).collect();

	let body = serde_json::to_vec(&values).unwrap_or_else(|_| b"[]".to_vec());
	Ok(Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, header_value(APPLICATION_DICOM_JSON))
		.body(Body::from(body))
		.expect("static headers are always valid"))
}
