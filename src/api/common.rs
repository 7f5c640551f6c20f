//! Shared HTTP-layer state and small helpers used by both the QIDO and WADO handlers.

use std::sync::Arc;

use axum::http::HeaderValue;

use crate::cache::FileCache;
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::scu::DimseScu;
use crate::tracker::Tracker;
use crate::types::validate_uid;

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<AppConfig>,
	pub scu: Arc<DimseScu>,
	pub cache: Arc<FileCache>,
	pub tracker: Arc<Tracker>,
}

pub const APPLICATION_DICOM_JSON: &str = "application/dicom+json";
pub const APPLICATION_DICOM: &str = "application/dicom";

pub fn header_value(value: &str) -> HeaderValue {
	HeaderValue::from_str(value).expect("static content-type values are always valid header values")
}

/// Validates a path-derived UID, naming the attribute in the error message the way DICOMweb
/// clients expect (e.g. `"Invalid StudyInstanceUID"`).
pub fn require_uid(attribute: &str, value: &str) -> Result<String, GatewayError> {
	validate_uid(value).map_err(|_| GatewayError::Validation(format!("Invalid {attribute}")))?;
	Ok(value.to_owned())
}
