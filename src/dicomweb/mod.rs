//! Translation between the DICOMweb (QIDO-RS/WADO-RS) surface and DIMSE datasets.

pub mod json;
pub mod multipart;
pub mod query;

pub use json::dataset_to_json;
pub use multipart::{generate_boundary, related_content_type, related_multipart_body};
pub use query::{build_identifier, IncludeField, MatchCriteria, QueryParameters};
