//! Outbound request reconstruction (spec §4.11): strips hop-by-hop
//! headers per RFC 7230 §6.1 and stamps `X-Forwarded-*`, then dispatches
//! through the route's `Balancer` and shared `TransportPool`.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use http_body_util::Full;
use httpgate_lb::{Backend, Balancer, BackendClient, SelectionContext, TransportPool};

use crate::errors::GatewayError;

/// Headers that must never be forwarded to the next hop (RFC 7230 §6.1),
/// plus `Proxy-Authenticate`/`Proxy-Authorization` which are meaningful
/// only between a client and its immediate proxy.
const HOP_BY_HOP: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

/// Removes hop-by-hop headers in place, including any header *named* by a
/// `Connection` header value (RFC 7230 §6.1's "connection options").
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	let mut to_remove: Vec<String> = Vec::new();
	if let Some(connection) = headers.get(http::header::CONNECTION) {
		if let Ok(value) = connection.to_str() {
			to_remove.extend(value.split(',').map(|s| s.trim().to_lowercase()));
		}
	}
	for name in HOP_BY_HOP {
		to_remove.push(name.to_string());
	}
	for name in to_remove {
		if let Ok(header_name) = HeaderName::try_from(name.as_str()) {
			headers.remove(header_name);
		}
	}
}

/// Appends this hop to `X-Forwarded-For` and sets `X-Forwarded-Proto`/
/// `X-Forwarded-Host` from the inbound request, the standard reverse-proxy
/// forwarding contract.
pub fn apply_forwarded_headers(headers: &mut HeaderMap, client_addr: &str, scheme: &str, original_host: Option<&str>) {
	let existing = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).unwrap_or("");
	let forwarded_for = if existing.is_empty() { client_addr.to_string() } else { format!("{existing}, {client_addr}") };
	if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
		headers.insert(HeaderName::from_static("x-forwarded-for"), value);
	}
	if let Ok(value) = HeaderValue::from_str(scheme) {
		headers.insert(HeaderName::from_static("x-forwarded-proto"), value);
	}
	if let Some(host) = original_host {
		if let Ok(value) = HeaderValue::from_str(host) {
			headers.insert(HeaderName::from_static("x-forwarded-host"), value);
		}
	}
}

/// Rewrites the request's target URI onto `backend`'s authority, cleans
/// headers, and sends it through the shared transport pool. Takes an
/// already-selected backend so callers that need to report the outcome
/// back to a balancer or circuit breaker (retries, outlier ejection) know
/// which backend it was without re-deriving the selection.
pub async fn forward_to_backend(
	backend: &Backend,
	transport: &TransportPool,
	method: Method,
	path_and_query: &str,
	mut headers: HeaderMap,
	body: Bytes,
	client_addr: &str,
	scheme: &str,
) -> Result<http::Response<hyper::body::Incoming>, GatewayError> {
	strip_hop_by_hop(&mut headers);
	apply_forwarded_headers(&mut headers, client_addr, scheme, headers.get(http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string).as_deref());

	let uri: Uri = format!("{}{}", backend.url.trim_end_matches('/'), path_and_query)
		.parse()
		.map_err(|e| GatewayError::BadGateway(format!("invalid backend URI: {e}")))?;

	let mut builder = Request::builder().method(method).uri(uri);
	*builder.headers_mut().unwrap() = headers;
	let request = builder
		.body(Full::new(body))
		.map_err(|e| GatewayError::BadGateway(format!("failed to build outbound request: {e}")))?;

	let client: &BackendClient = transport.client();
	client.request(request).await.map_err(|e| GatewayError::BadGateway(e.to_string()))
}

/// Picks a backend via `balancer` then delegates to [`forward_to_backend`].
/// Callers that need to feed the outcome back into the balancer (circuit
/// breaking, outlier ejection, retries) should select the backend
/// themselves and call `forward_to_backend` directly instead.
pub async fn forward(
	balancer: &dyn Balancer,
	transport: &TransportPool,
	selection_ctx: &SelectionContext<'_>,
	method: Method,
	path_and_query: &str,
	headers: HeaderMap,
	body: Bytes,
	client_addr: &str,
	scheme: &str,
) -> Result<(http::Response<hyper::body::Incoming>, Option<String>), GatewayError> {
	let selection = balancer.next(selection_ctx);
	let backend = selection.backend.ok_or(GatewayError::NoBackend)?;
	let response = forward_to_backend(&backend, transport, method, path_and_query, headers, body, client_addr, scheme).await?;
	Ok((response, selection.set_affinity_cookie))
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::header::{CONNECTION, HOST};

	#[test]
	fn strips_connection_and_its_named_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(CONNECTION, HeaderValue::from_static("x-custom-hop"));
		headers.insert(HeaderName::from_static("x-custom-hop"), HeaderValue::from_static("1"));
		headers.insert(HeaderName::from_static("keep-alive"), HeaderValue::from_static("timeout=5"));
		headers.insert(HOST, HeaderValue::from_static("example.com"));
		strip_hop_by_hop(&mut headers);
		assert!(headers.get(CONNECTION).is_none());
		assert!(headers.get("x-custom-hop").is_none());
		assert!(headers.get("keep-alive").is_none());
		assert!(headers.get(HOST).is_some());
	}

	#[test]
	fn appends_to_existing_forwarded_for() {
		let mut headers = HeaderMap::new();
		headers.insert(HeaderName::from_static("x-forwarded-for"), HeaderValue::from_static("1.1.1.1"));
		apply_forwarded_headers(&mut headers, "2.2.2.2", "https", Some("api.example.com"));
		assert_eq!(headers.get("x-forwarded-for").unwrap(), "1.1.1.1, 2.2.2.2");
		assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
		assert_eq!(headers.get("x-forwarded-host").unwrap(), "api.example.com");
	}
}
