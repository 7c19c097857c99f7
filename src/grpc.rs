//! gRPC detection and outcome classification (spec §4.12): a
//! `content-type: application/grpc*` request is marked with
//! `ProtocolKind::Grpc` so the circuit breaker and access logger read the
//! `Grpc-Status` trailer instead of the HTTP status code, since gRPC
//! always answers with HTTP 200 and encodes the real outcome in a
//! trailer.

use http::HeaderMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProtocolKind {
	#[default]
	Http,
	Grpc,
}

pub fn detect_protocol(headers: &HeaderMap) -> ProtocolKind {
	let is_grpc = headers
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.starts_with("application/grpc"))
		.unwrap_or(false);
	if is_grpc { ProtocolKind::Grpc } else { ProtocolKind::Http }
}

/// gRPC status codes per the gRPC spec; only `Ok` (0) counts as success
/// for circuit-breaker/access-log outcome classification.
pub fn grpc_status_from_trailers(trailers: &HeaderMap) -> Option<u32> {
	trailers.get("grpc-status").and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok())
}

pub fn is_success(status: Option<u32>) -> bool {
	matches!(status, Some(0))
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;

	#[test]
	fn detects_grpc_content_type_with_subtype() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/grpc+proto"));
		assert_eq!(detect_protocol(&headers), ProtocolKind::Grpc);
	}

	#[test]
	fn plain_json_is_http() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		assert_eq!(detect_protocol(&headers), ProtocolKind::Http);
	}

	#[test]
	fn only_status_zero_is_success() {
		assert!(is_success(Some(0)));
		assert!(!is_success(Some(13)));
		assert!(!is_success(None));
	}

	#[test]
	fn reads_grpc_status_trailer() {
		let mut trailers = HeaderMap::new();
		trailers.insert("grpc-status", HeaderValue::from_static("13"));
		assert_eq!(grpc_status_from_trailers(&trailers), Some(13));
	}
}
