//! QIDO-RS query parameters: deserialization of arbitrary `{AttributeKeyword}={value}` matching
//! parameters plus the `includefield`/`limit`/`offset`/`fuzzymatching` reserved parameters, and
//! their translation into a DIMSE C-FIND identifier.

use std::collections::HashMap;
use std::fmt::Formatter;

use dicom::core::dictionary::{DataDictionaryEntry, DataDictionaryEntryRef};
use dicom::core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::InMemDicomObject;
use serde::de::{Error as DeError, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::types::QueryRetrieveLevel;

/// Return keys the PACS is asked to populate even when not used for matching, so QIDO responses
/// carry the attributes DICOMweb clients expect at each level.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.html>
pub const STUDY_RETURN_TAGS: &[Tag] = &[
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::ACCESSION_NUMBER,
	tags::MODALITIES_IN_STUDY,
	tags::REFERRING_PHYSICIAN_NAME,
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
	tags::STUDY_INSTANCE_UID,
	tags::STUDY_ID,
	tags::NUMBER_OF_STUDY_RELATED_SERIES,
	tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
];

pub const SERIES_RETURN_TAGS: &[Tag] = &[
	tags::MODALITY,
	tags::SERIES_DESCRIPTION,
	tags::SERIES_INSTANCE_UID,
	tags::SERIES_NUMBER,
	tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
];

pub const INSTANCE_RETURN_TAGS: &[Tag] = &[
	tags::SOP_CLASS_UID,
	tags::SOP_INSTANCE_UID,
	tags::INSTANCE_NUMBER,
	tags::ROWS,
	tags::COLUMNS,
	tags::BITS_ALLOCATED,
	tags::NUMBER_OF_FRAMES,
];

/// A single `{AttributeKeyword}={value}` matching parameter, resolved against the standard
/// dictionary but not yet typed into a [`PrimitiveValue`] — that happens in [`build_identifier`]
/// once the wildcard/date/time policy is known.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCriterion {
	pub tag: Tag,
	pub vr: VR,
	pub raw_value: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(try_from = "HashMap<String, String>")]
pub struct MatchCriteria(Vec<MatchCriterion>);

impl MatchCriteria {
	pub fn iter(&self) -> impl Iterator<Item = &MatchCriterion> {
		self.0.iter()
	}
}

impl TryFrom<HashMap<String, String>> for MatchCriteria {
	type Error = String;

	fn try_from(value: HashMap<String, String>) -> Result<Self, Self::Error> {
		let criteria = value
			.into_iter()
			.map(|(key, raw_value)| {
				let entry: &DataDictionaryEntryRef = StandardDataDictionary
					.by_expr(&key)
					.ok_or_else(|| format!("unknown attribute '{key}' used for matching"))?;
				Ok(MatchCriterion {
					tag: entry.tag.inner(),
					vr: entry.vr.relaxed(),
					raw_value,
				})
			})
			.collect::<Result<_, String>>()?;
		Ok(Self(criteria))
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum IncludeField {
	All,
	List(Vec<Tag>),
}

impl Default for IncludeField {
	fn default() -> Self {
		Self::List(Vec::new())
	}
}

struct IncludeFieldVisitor;

impl<'de> Visitor<'de> for IncludeFieldVisitor {
	type Value = IncludeField;

	fn expecting(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
		write!(formatter, "a value of <{{attribute}}* | all>")
	}

	fn visit_str<E: DeError>(self, v: &str) -> Result<Self::Value, E> {
		if v.eq_ignore_ascii_case("all") {
			return Ok(IncludeField::All);
		}
		v.split(',')
			.map(|keyword| {
				StandardDataDictionary
					.by_expr(keyword)
					.map(DataDictionaryEntryRef::tag)
					.ok_or_else(|| E::custom(format!("unknown tag '{keyword}'")))
			})
			.collect::<Result<Vec<_>, _>>()
			.map(IncludeField::List)
	}

	fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
		let mut tags = Vec::new();
		while let Some(item) = seq.next_element::<String>()? {
			if item.eq_ignore_ascii_case("all") {
				return Ok(IncludeField::All);
			}
			let entry = StandardDataDictionary
				.by_expr(&item)
				.ok_or_else(|| DeError::custom(format!("unknown tag '{item}'")))?;
			tags.push(entry.tag());
		}
		Ok(IncludeField::List(tags))
	}
}

fn deserialize_include_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<IncludeField, D::Error> {
	deserializer.deserialize_any(IncludeFieldVisitor)
}

/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#table_8.3.4-1>
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryParameters {
	#[serde(flatten)]
	pub match_criteria: MatchCriteria,
	#[serde(rename = "fuzzymatching")]
	pub fuzzy_matching: bool,
	#[serde(rename = "includefield")]
	#[serde(deserialize_with = "deserialize_include_field")]
	pub include_field: IncludeField,
	pub limit: usize,
	pub offset: usize,
}

impl Default for QueryParameters {
	fn default() -> Self {
		Self {
			match_criteria: MatchCriteria(Vec::new()),
			fuzzy_matching: false,
			include_field: IncludeField::default(),
			limit: 200,
			offset: 0,
		}
	}
}

fn is_wildcard_candidate(vr: VR) -> bool {
	matches!(vr, VR::LO | VR::PN | VR::SH | VR::ST | VR::LT | VR::UC | VR::UT)
}

/// Appends `*` to a raw string value per the configured wildcard policy, unless it already
/// carries a wildcard character.
fn apply_wildcard_policy(raw: &str, vr: VR, min_chars: usize, enabled: bool) -> String {
	if enabled && is_wildcard_candidate(vr) && raw.len() >= min_chars && !raw.contains(['*', '?']) {
		format!("{raw}*")
	} else {
		raw.to_owned()
	}
}

fn digits_only(raw: &str) -> String {
	raw.chars().filter(char::is_ascii_digit).collect()
}

/// Normalizes a date value to `YYYYMMDD`, or `YYYYMMDD-YYYYMMDD` for a date range.
fn normalize_date(raw: &str) -> String {
	let digits = digits_only(raw);
	if digits.len() == 16 {
		format!("{}-{}", &digits[..8], &digits[8..])
	} else {
		digits
	}
}

/// Normalizes a time value to `HHMMSS[.FFFFFF]`, or a `-`-separated range thereof.
fn normalize_time(raw: &str) -> String {
	raw.chars().filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-')).collect()
}

fn normalize_value(raw: &str, vr: VR, min_chars: usize, append_wildcard: bool) -> String {
	match vr {
		VR::DA => normalize_date(raw),
		VR::TM => normalize_time(raw),
		_ => apply_wildcard_policy(raw, vr, min_chars, append_wildcard),
	}
}

/// Builds a DIMSE C-FIND identifier from QIDO query parameters: matching keys from
/// `match_criteria` (with wildcard/date/time normalization applied), the path-derived
/// StudyInstanceUID/SeriesInstanceUID, and empty universal-matching return keys for `level`.
pub fn build_identifier(
	level: QueryRetrieveLevel,
	study_instance_uid: Option<&str>,
	series_instance_uid: Option<&str>,
	params: &QueryParameters,
	qido_min_chars: usize,
	qido_append_wildcard: bool,
) -> InMemDicomObject {
	let mut identifier = InMemDicomObject::new_empty();
	identifier.put_element(DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, PrimitiveValue::from(level.to_string())));

	if let Some(study) = study_instance_uid {
		identifier.put_element(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study)));
	}
	if let Some(series) = series_instance_uid {
		identifier.put_element(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series)));
	}

	for criterion in params.match_criteria.iter() {
		let value = normalize_value(&criterion.raw_value, criterion.vr, qido_min_chars, qido_append_wildcard);
		identifier.put_element(DataElement::new(criterion.tag, criterion.vr, PrimitiveValue::from(value)));
	}

	for tag in return_tags(level) {
		if identifier.get(*tag).is_none() {
			identifier.put_element(DataElement::new(*tag, VR::UN, PrimitiveValue::Empty));
		}
	}

	identifier
}

fn return_tags(level: QueryRetrieveLevel) -> &'static [Tag] {
	match level {
		QueryRetrieveLevel::Study => STUDY_RETURN_TAGS,
		QueryRetrieveLevel::Series => SERIES_RETURN_TAGS,
		QueryRetrieveLevel::Image => INSTANCE_RETURN_TAGS,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::http::Uri;
	use axum_extra::extract::Query;

	#[test]
	fn parses_reserved_and_matching_parameters() {
		let uri = Uri::from_static("http://test?offset=1&limit=42&includefield=PatientWeight&PatientName=DOE^JOHN");
		let Query(params) = Query::<QueryParameters>::try_from_uri(&uri).unwrap();

		assert_eq!(params.offset, 1);
		assert_eq!(params.limit, 42);
		assert_eq!(params.include_field, IncludeField::List(vec![tags::PATIENT_WEIGHT]));
		assert_eq!(params.match_criteria.iter().count(), 1);
	}

	#[test]
	fn wildcard_is_appended_to_long_enough_string_values() {
		assert_eq!(apply_wildcard_policy("DOE", VR::PN, 3, true), "DOE*");
		assert_eq!(apply_wildcard_policy("DO", VR::PN, 3, true), "DO");
		assert_eq!(apply_wildcard_policy("DOE*", VR::PN, 3, true), "DOE*");
		assert_eq!(apply_wildcard_policy("DOE", VR::PN, 3, false), "DOE");
	}

	#[test]
	fn date_is_normalized_to_yyyymmdd() {
		assert_eq!(normalize_date("2024-01-15"), "20240115");
		assert_eq!(normalize_date("20240115"), "20240115");
		assert_eq!(normalize_date("2024-01-01-2024-01-31"), "20240101-20240131");
	}

	#[test]
	fn time_is_normalized_to_hhmmss() {
		assert_eq!(normalize_time("10:30:00"), "103000");
		assert_eq!(normalize_time("10:30:00-12:00:00"), "103000-120000");
	}

	#[test]
	fn identifier_carries_universal_matching_keys_for_level() {
		let params = QueryParameters::default();
		let identifier = build_identifier(QueryRetrieveLevel::Study, None, None, &params, 3, true);
		assert!(identifier.get(tags::PATIENT_NAME).is_some());
		assert!(identifier.get(tags::STUDY_INSTANCE_UID).is_some());
	}
}
