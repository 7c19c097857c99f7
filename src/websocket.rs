//! WebSocket upgrade detection and bidirectional relay (spec §4.12).
//! Detection happens at the router/pipeline boundary; the actual byte
//! copy runs after a successful upgrade handshake with the chosen
//! backend, bypassing the rest of the HTTP pipeline since there's no
//! further request/response framing to apply policies to.

use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};

/// True when the inbound request is asking to upgrade to WebSocket (RFC
/// 6455 §4.1: `Connection: Upgrade` plus `Upgrade: websocket`, checked
/// case-insensitively and tolerant of a multi-value `Connection` header).
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
	let has_upgrade_token = headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
		.unwrap_or(false);
	let wants_websocket = headers
		.get(http::header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("websocket"))
		.unwrap_or(false);
	has_upgrade_token && wants_websocket
}

/// Copies bytes in both directions between the client and backend
/// connections until either side closes, after the 101 handshake with the
/// backend has already completed. Returns the byte counts in each
/// direction for access-log accounting.
pub async fn relay<C, B>(client: &mut C, backend: &mut B) -> std::io::Result<(u64, u64)>
where
	C: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	copy_bidirectional(client, backend).await
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;

	#[test]
	fn detects_standard_upgrade_request() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
		headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
		assert!(is_websocket_upgrade(&headers));
	}

	#[test]
	fn rejects_plain_request() {
		let headers = HeaderMap::new();
		assert!(!is_websocket_upgrade(&headers));
	}

	#[test]
	fn tolerates_multi_value_connection_header() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
		headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
		assert!(is_websocket_upgrade(&headers));
	}
}
