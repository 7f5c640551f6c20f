//! Dataset -> DICOMweb JSON translation, via `dicom_json`.

use dicom::core::header::Header;
use dicom::object::InMemDicomObject;
use serde_json::Value;
use tracing::warn;

/// Converts a dataset to its DICOMweb JSON representation (tag-keyed, `vr`/`Value`/`InlineBinary`).
///
/// Unknown and private/odd-group tags pass through unchanged. If the whole dataset fails to
/// serialize (a single malformed element — e.g. a sequence VR holding a raw buffer), falls back
/// to a per-element pass that strips the offending elements one at a time rather than failing
/// the entire response.
pub fn dataset_to_json(dataset: &InMemDicomObject) -> Value {
	match dicom_json::to_value(dataset.clone()) {
		Ok(value) => value,
		Err(err) => {
			warn!(error = %err, "dataset failed to serialize as a whole, retrying element by element");
			per_element_json(dataset)
		}
	}
}

fn per_element_json(dataset: &InMemDicomObject) -> Value {
	let mut map = serde_json::Map::new();
	for element in dataset {
		let tag = element.tag();
		let key = format!("{:04X}{:04X}", tag.group(), tag.element());
		let single = InMemDicomObject::from_element_iter([element.clone()]);

		match dicom_json::to_value(single) {
			Ok(Value::Object(obj)) => {
				if let Some(value) = obj.into_values().next() {
					map.insert(key, value);
				}
			}
			_ => warn!(tag = %key, "stripping malformed element from DICOMweb JSON response"),
		}
	}
	Value::Object(map)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::dictionary_std::tags;

	#[test]
	fn known_element_round_trips_as_tag_keyed_json() {
		let mut dataset = InMemDicomObject::new_empty();
		dataset.put_element(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3")));

		let json = dataset_to_json(&dataset);
		let value = &json["0020000D"]["Value"][0];
		assert_eq!(value, "1.2.3");
	}
}
