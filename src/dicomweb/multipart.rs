//! WADO-RS `multipart/related` body assembly.
//!
//! <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_8.7.5>

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Generates a boundary unique to this response: a fixed prefix plus a timestamp and a random
/// component, so concurrent WADO responses never collide.
pub fn generate_boundary() -> String {
	let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
	let rand = Uuid::new_v4().simple().to_string();
	format!("DICOMwebBoundary{millis}{rand}")
}

/// Content-Type header value for a multipart/related body carrying `application/dicom` parts.
pub fn related_content_type(boundary: &str) -> String {
	format!("multipart/related; type=\"application/dicom\"; boundary={boundary}")
}

/// Assembles a `multipart/related` body from whole encoded DICOM instances.
///
/// Each part is framed as `--boundary\r\nContent-Type: application/dicom\r\nContent-Length:
/// N\r\n\r\n<bytes>\r\n`; the body is terminated with a closing `--boundary--\r\n`.
pub fn related_multipart_body(boundary: &str, parts: &[Vec<u8>]) -> Vec<u8> {
	let mut body = Vec::new();
	for part in parts {
		body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
		body.extend_from_slice(b"Content-Type: application/dicom\r\n");
		body.extend_from_slice(format!("Content-Length: {}\r\n\r\n", part.len()).as_bytes());
		body.extend_from_slice(part);
		body.extend_from_slice(b"\r\n");
	}
	body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
	body
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn boundary_is_unique_across_calls() {
		assert_ne!(generate_boundary(), generate_boundary());
	}

	#[test]
	fn body_frames_each_part_and_closes_with_boundary() {
		let boundary = "DICOMwebBoundaryTEST";
		let body = related_multipart_body(boundary, &[b"abc".to_vec(), b"de".to_vec()]);
		let text = String::from_utf8_lossy(&body);

		assert!(text.starts_with("--DICOMwebBoundaryTEST\r\nContent-Type: application/dicom\r\nContent-Length: 3\r\n\r\nabc\r\n"));
		assert!(text.contains("Content-Length: 2\r\n\r\nde\r\n"));
		assert!(text.ends_with("--DICOMwebBoundaryTEST--\r\n"));
	}

	#[test]
	fn empty_parts_produce_just_the_closing_boundary() {
		let body = related_multipart_body("b", &[]);
		assert_eq!(body, b"--b--\r\n");
	}
}
