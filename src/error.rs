//! Top-level error taxonomy and its HTTP representation.
//!
//! Every layer (codec, association, SCU, SCP, tracker, cache, DICOMweb translation) defines its
//! own `thiserror` enum; `GatewayError` wraps each of them at the point they cross into the HTTP
//! layer and renders a JSON error envelope `{error, statusCode, timestamp}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::dimse::association::pool::PoolError;
use crate::dimse::association::AssociationError;
use crate::dimse::cecho::EchoError;
use crate::dimse::cfind::FindError;
use crate::dimse::cget::GetError;
use crate::dimse::cmove::MoveError;
use crate::dimse::DimseError;
use crate::tracker::TrackerError;
use crate::types::UidError;

#[derive(Debug, Error)]
pub enum GatewayError {
	#[error("invalid request: {0}")]
	Validation(String),

	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error("association rejected: {0}")]
	AssociateRejected(String),

	#[error(transparent)]
	Association(#[from] AssociationError),

	#[error(transparent)]
	Dimse(#[from] DimseError),

	#[error("DIMSE operation failed with status {status:#06X}: {detail}")]
	DimseStatus { status: u16, detail: String },

	#[error(transparent)]
	Pool(#[from] PoolError<AssociationError>),

	#[error(transparent)]
	Echo(#[from] EchoError),

	#[error(transparent)]
	Find(#[from] FindError),

	#[error(transparent)]
	Move(#[from] MoveError),

	#[error(transparent)]
	Get(#[from] GetError),

	#[error(transparent)]
	Tracker(#[from] TrackerError),

	#[error(transparent)]
	Cache(#[from] CacheError),

	#[error("resource not found")]
	NotFound,

	#[error("peer did not respond in time")]
	Timeout,
}

impl From<UidError> for GatewayError {
	fn from(err: UidError) -> Self {
		Self::Validation(err.to_string())
	}
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error: String,
	#[serde(rename = "statusCode")]
	status_code: u16,
	timestamp: String,
}

impl GatewayError {
	fn status_code(&self) -> StatusCode {
		match self {
			Self::Validation(_) => StatusCode::BAD_REQUEST,
			Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::AssociateRejected(_) | Self::Association(_) => StatusCode::BAD_GATEWAY,
			Self::Dimse(_) => StatusCode::BAD_GATEWAY,
			Self::DimseStatus { .. } => StatusCode::BAD_GATEWAY,
			Self::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
			Self::Echo(_) | Self::Find(_) | Self::Move(_) | Self::Get(_) => StatusCode::BAD_GATEWAY,
			Self::Tracker(_) => StatusCode::GATEWAY_TIMEOUT,
			Self::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::NotFound => StatusCode::NOT_FOUND,
			Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
		}
	}
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		if status.is_server_error() {
			error!(error = %self, "request failed");
		}
		let body = ErrorBody {
			error: self.to_string(),
			status_code: status.as_u16(),
			timestamp: Utc::now().to_rfc3339(),
		};
		(status, Json(body)).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn validation_errors_are_bad_request() {
		let err = GatewayError::Validation("bad study uid".into());
		assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn not_found_maps_to_404() {
		assert_eq!(GatewayError::NotFound.status_code(), StatusCode::NOT_FOUND);
	}

	#[test]
	fn tracker_timeout_maps_to_504() {
		assert_eq!(
			GatewayError::Tracker(TrackerError::Timeout).status_code(),
			StatusCode::GATEWAY_TIMEOUT
		);
	}
}
