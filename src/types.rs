//! Shared value types for DICOM identifiers and small DIMSE vocabulary items.

use dicom::core::PrimitiveValue;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// UI (Unique Identifier) value representation: a dotted-decimal string, e.g. `1.2.840.10008.1.1`.
pub type Uid = String;

/// US (Unsigned Short) value representation.
pub type Us = u16;

/// AE (Application Entity) value representation, 1-16 characters on the wire.
pub type Aet = String;

/// Maximum length of a DICOM UID per PS3.5.
const MAX_UID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UidError {
	#[error("UID is empty")]
	Empty,
	#[error("UID exceeds {MAX_UID_LEN} characters")]
	TooLong,
	#[error("UID contains characters other than digits and '.'")]
	InvalidCharacters,
	#[error("UID has an empty component (consecutive '.', or a leading/trailing '.')")]
	MalformedComponent,
}

/// Validates a DICOM UID against `^[0-9]+(\.[0-9]+)*$`, length <= 64.
pub fn validate_uid(uid: &str) -> Result<(), UidError> {
	if uid.is_empty() {
		return Err(UidError::Empty);
	}
	if uid.len() > MAX_UID_LEN {
		return Err(UidError::TooLong);
	}
	if !uid.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
		return Err(UidError::InvalidCharacters);
	}
	for component in uid.split('.') {
		if component.is_empty() {
			return Err(UidError::MalformedComponent);
		}
	}
	Ok(())
}

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone)]
pub enum Priority {
	Low = 0x0002,
	Medium = 0x0000,
	High = 0x0001,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Medium
	}
}

/// The granularity at which a QIDO/WADO request or a C-FIND/C-MOVE/C-GET operates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Study,
	Series,
	Image,
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}

/// Identifies a study/series/instance at whatever granularity is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResourceKey {
	pub study_instance_uid: Uid,
	pub series_instance_uid: Option<Uid>,
	pub sop_instance_uid: Option<Uid>,
}

impl ResourceKey {
	pub fn new(study: Uid, series: Option<Uid>, instance: Option<Uid>) -> Self {
		Self {
			study_instance_uid: study,
			series_instance_uid: series,
			sop_instance_uid: instance,
		}
	}

	pub fn level(&self) -> QueryRetrieveLevel {
		if self.sop_instance_uid.is_some() {
			QueryRetrieveLevel::Image
		} else if self.series_instance_uid.is_some() {
			QueryRetrieveLevel::Series
		} else {
			QueryRetrieveLevel::Study
		}
	}

	/// The most specific UID identifying this resource, used as the cache/tracker key.
	pub fn most_specific_uid(&self) -> &str {
		self.sop_instance_uid
			.as_deref()
			.or(self.series_instance_uid.as_deref())
			.unwrap_or(&self.study_instance_uid)
	}

	/// True if `other` is "covered" by this key: every UID this key specifies equals the
	/// corresponding UID on `other`, and unspecified UIDs on this key match anything.
	pub fn covers(&self, other: &Self) -> bool {
		if self.study_instance_uid != other.study_instance_uid {
			return false;
		}
		if let Some(series) = &self.series_instance_uid {
			if other.series_instance_uid.as_deref() != Some(series.as_str()) {
				return false;
			}
		}
		if let Some(instance) = &self.sop_instance_uid {
			if other.sop_instance_uid.as_deref() != Some(instance.as_str()) {
				return false;
			}
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn valid_uids_round_trip() {
		for uid in ["1.2.3", "1.2.840.10008.1.1", "0.0", "1", "01.2"] {
			assert!(validate_uid(uid).is_ok(), "{uid} should be valid");
		}
	}

	#[test]
	fn invalid_uids_are_rejected() {
		assert_eq!(validate_uid(""), Err(UidError::Empty));
		assert_eq!(validate_uid("1.2.3x"), Err(UidError::InvalidCharacters));
		assert_eq!(validate_uid("1..3"), Err(UidError::MalformedComponent));
		assert_eq!(validate_uid("1.2."), Err(UidError::MalformedComponent));
		assert_eq!(validate_uid(".1.2"), Err(UidError::MalformedComponent));
		assert!(validate_uid(&"1".repeat(65)).is_err());
	}

	#[test]
	fn uid_mutation_invalidates() {
		// Appending any character to a valid UID must invalidate it.
		for uid in ["1.2.3", "1.2.840.10008.1.1"] {
			assert!(validate_uid(uid).is_ok());
			assert!(validate_uid(&format!("{uid}x")).is_err());
		}
	}

	#[test]
	fn resource_key_covers() {
		let study_only = ResourceKey::new("1.2".into(), None, None);
		let full = ResourceKey::new("1.2".into(), Some("1.2.1".into()), Some("1.2.1.1".into()));
		assert!(study_only.covers(&full));
		assert!(!full.covers(&study_only));

		let other_study = ResourceKey::new("9.9".into(), None, None);
		assert!(!study_only.covers(&other_study));
	}
}
