//! HTTP listener (spec §4.11/§4.12): resolves each inbound request to a
//! route, runs the compiled request-phase pipeline, then dispatches to one
//! of the proxy/WebSocket/SSE/GraphQL handlers depending on what the route
//! and request ask for. Response-phase rules, response validation, and
//! metrics are applied here once the real upstream response exists, per
//! `state::build_pipeline`'s doc comment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State};
use axum::response::sse::{Event as SseAxumEvent, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use httpgate_lb::{Backend, OutlierEjectingWrapper, SelectionContext, TransportPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::{self, CacheEntry};
use crate::coalesce::{CapturedResponse, Execution};
use crate::config::Config;
use crate::errors::GatewayError;
use crate::graphql::{self, SubQueryResult};
use crate::grpc;
use crate::policy::{self, CircuitBreakerStep};
use crate::proxy;
use crate::proxyprotocol;
use crate::response::ResponseBuffer;
use crate::route::{RouteProxy, RouteState};
use crate::rules::{EvalOutcome, RequestEnv, ResponseEnv};
use crate::sse::{self as sse_hub, SseEvent};
use crate::state::StateManager;
use crate::variables::{SkipFlags, VariableContextGuard, VariableContextPool};
use crate::websocket;

#[derive(Clone)]
pub struct GatewayState {
	pub manager: Arc<StateManager>,
	pub pool: Arc<VariableContextPool>,
	pub http_client: reqwest::Client,
}

/// Top-level axum fallback: every route on every listener goes through
/// here, since routing decisions live in `Router`, not in axum's own route
/// table.
pub async fn route_request(State(state): State<GatewayState>, ConnectInfo(addr): ConnectInfo<proxyprotocol::Address>, mut req: Request) -> Response {
	match handle(&state, &addr, &mut req).await {
		Ok(resp) => resp,
		Err(e) => e.into_response(),
	}
}

fn query_pairs(query: &str) -> HashMap<String, String> {
	url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

fn header_pairs(headers: &HeaderMap) -> HashMap<String, String> {
	headers
		.iter()
		.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
		.collect()
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
	headers
		.get(http::header::ACCEPT)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.contains("text/event-stream"))
		.unwrap_or(false)
}

fn cache_status_header() -> http::HeaderName {
	http::HeaderName::from_static("x-cache")
}

/// Converts a caught handler panic into the same `{error, message, status}`
/// JSON shape `GatewayError`'s `IntoResponse` produces, so a panicking
/// policy or proxy step never leaks a raw 500 with no body.
fn panic_to_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
	let message = if let Some(s) = err.downcast_ref::<String>() {
		s.clone()
	} else if let Some(s) = err.downcast_ref::<&str>() {
		(*s).to_string()
	} else {
		"panic in request handler".to_string()
	};
	error!(%message, "request handler panicked");
	(
		http::StatusCode::INTERNAL_SERVER_ERROR,
		axum::Json(serde_json::json!({
			"error": "Internal Server Error",
			"message": message,
			"status": 500u16,
		})),
	)
		.into_response()
}

async fn handle(state: &GatewayState, addr: &proxyprotocol::Address, req: &mut Request) -> Result<Response, GatewayError> {
	let route_state = state.manager.current().await;

	let method = req.method().clone();
	let uri = req.uri().clone();
	let headers = req.headers().clone();
	let host = headers.get(http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string);
	let path = uri.path().to_string();
	let query = uri.query().unwrap_or("").to_string();
	let path_and_query = uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| path.clone());

	let matched = route_state.router.match_request(host.as_deref(), &path, &method, &headers)?;
	let route = route_state.route(&matched.route_id).ok_or(GatewayError::NoRoute)?;

	let is_ws = websocket::is_websocket_upgrade(&headers);
	let body_bytes = if is_ws {
		Bytes::new()
	} else {
		let body = std::mem::replace(req.body_mut(), Body::empty());
		body.collect().await.map_err(|e| GatewayError::InvalidRequest(e.to_string()))?.to_bytes()
	};

	let mut guard = VariableContextGuard::acquire(&state.pool);
	guard.route_id = Some(route.route_id.clone());
	guard.request_id = uuid::Uuid::new_v4().to_string();
	guard.path_params = matched.path_params.clone();
	guard.start_time = Some(Instant::now());
	if let Some(header_name) = &route.config.security.tenant_header {
		guard.tenant_id = headers.get(header_name.as_str()).and_then(|v| v.to_str().ok()).map(str::to_string);
	}

	let client_addr = addr.addr.to_string();
	let request_env = RequestEnv {
		method: method.to_string(),
		path: path.clone(),
		headers: header_pairs(&headers),
		query: query_pairs(&query),
		remote_addr: client_addr.clone(),
		route_id: route.route_id.clone(),
		tenant_id: guard.tenant_id.clone(),
		client_id: guard.identity.client_id.clone(),
		custom: guard.custom.clone(),
	};

	let mut resp_buf = ResponseBuffer::new();
	let outcome = {
		let mut pctx = crate::pipeline::PipelineContext {
			vctx: &mut guard,
			resp: &mut resp_buf,
			request_env: &request_env,
		};
		route.pipeline.run(&mut pctx).await
	};

	if matches!(outcome, crate::pipeline::StepOutcome::Terminate) {
		return Ok(flush_response(&mut resp_buf));
	}

	if is_ws {
		return proxy_websocket(&route, req, &headers, &path_and_query, &client_addr).await;
	}

	if route.config.graphql.enabled {
		if let Some(federation) = &route.federation {
			return handle_graphql(state, &route, federation, body_bytes).await;
		}
	}

	if let Some(hub) = &route.sse_hub {
		if wants_event_stream(&headers) {
			let last_event_id = headers.get("last-event-id").and_then(|v| v.to_str().ok()).map(str::to_string);
			let filter = if route.config.sse.event_filter_enabled { query_pairs(&query).get("filter").cloned() } else { None };
			return Ok(handle_sse(hub.clone(), last_event_id, filter).await.into_response());
		}
	}

	handle_proxy(&route, &route_state, &mut guard, method, path_and_query, path, query, headers, body_bytes, &client_addr).await
}

fn flush_response(resp_buf: &mut ResponseBuffer) -> Response {
	let (status, headers, body) = resp_buf.flush();
	let mut response = Response::new(Body::from(body));
	*response.status_mut() = status;
	*response.headers_mut() = headers;
	response
}

// ---------------------------------------------------------------------
// Normal HTTP proxying: cache lookup, optional coalescing, retry-bounded
// backend call, response-phase rules, cache store.
// ---------------------------------------------------------------------

/// Parameters for the background refresh [`spawn_revalidation`] kicks off
/// when a stale entry is served to a client (spec §4.5
/// "stale-while-revalidate"): bundled into one struct since the task must
/// own everything it touches across the `tokio::spawn` boundary.
struct RevalidationJob {
	route: Arc<RouteProxy>,
	cache: Arc<cache::Cache>,
	key: String,
	balancer: Arc<dyn httpgate_lb::Balancer>,
	transport: Arc<TransportPool>,
	method: Method,
	path_and_query: String,
	headers: HeaderMap,
	body: Bytes,
	client_addr: String,
	tenant_id: Option<String>,
	traffic_group: Option<String>,
	client_key: String,
	timeout: Duration,
	retry_budget: u32,
	cache_ttl_override: Option<Duration>,
}

/// Fires the refresh in the background and frees the single-flight
/// `begin_revalidation` guard no matter how it finishes, so a future
/// request for the same key can trigger another refresh once this one is
/// done (successful or not).
fn spawn_revalidation(job: RevalidationJob) {
	tokio::spawn(async move {
		let selection_ctx = SelectionContext {
			client_key: Some(job.client_key.as_str()),
			version_token: None,
			affinity_cookie: None,
			tenant_id: job.tenant_id.as_deref(),
			traffic_group: job.traffic_group.as_deref(),
		};
		let result = forward_with_retries(
			&*job.balancer,
			&job.transport,
			&selection_ctx,
			job.method,
			&job.path_and_query,
			job.headers,
			job.body,
			&job.client_addr,
			"http",
			job.timeout,
			job.retry_budget,
			None,
			job.route.circuit_breaker.as_deref(),
			job.route.outlier.as_deref(),
		)
		.await;
		if let Ok(captured) = result {
			if captured.status < 500 {
				let entry = CacheEntry {
					status: captured.status,
					headers: captured.headers,
					body: captured.body,
					stored_at: Instant::now(),
					ttl: job.route.config.cache.ttl(),
					etag: None,
					last_modified: None,
				};
				job.cache.store(&job.key, entry, job.cache_ttl_override, false, false).await;
			}
		}
		job.cache.end_revalidation(&job.key).await;
	});
}

#[allow(clippy::too_many_arguments)]
async fn handle_proxy(
	route: &Arc<RouteProxy>,
	route_state: &Arc<RouteState>,
	guard: &mut VariableContextGuard<'_>,
	method: Method,
	path_and_query: String,
	path: String,
	query: String,
	headers: HeaderMap,
	body: Bytes,
	client_addr: &str,
) -> Result<Response, GatewayError> {
	let switch_backend = guard.overrides.as_ref().and_then(|o| o.switch_backend.clone());
	let tenant_id = guard.tenant_id.clone();
	let traffic_group = guard.traffic_group.clone();
	let client_key = client_addr.to_string();

	let cache_key_str = route.cache.as_ref().map(|_| cache::cache_key(method.as_str(), &path, &query, &[], None));

	let cacheable_methods: Vec<&str> = route.config.cache.cacheable_methods.iter().map(String::as_str).collect();
	let cache_bypass = guard.skip_flags.contains(SkipFlags::CACHE_STORE);
	let eligible_for_cache = route.cache.is_some() && cache::should_cache(method.as_str(), false, &cacheable_methods);

	let timeout = guard.overrides.as_ref().and_then(|o| o.timeout_override).unwrap_or(Duration::from_secs(30));
	let retry_budget = guard.custom.get("retry_budget").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
	let cache_ttl_override = guard.overrides.as_ref().and_then(|o| o.cache_ttl_override);

	let balancer = route.balancer.clone();
	let transport = route_state.transport.clone();
	let forward_headers = headers.clone();
	let forward_method = method.clone();
	let forward_path = path_and_query.clone();
	let forward_body = body.clone();
	let client_addr_owned = client_addr.to_string();

	if eligible_for_cache {
		if let Some(cache) = &route.cache {
			if let Some(key) = &cache_key_str {
				let (outcome, entry) = cache.lookup(key).await;
				match (outcome, entry) {
					(cache::CacheOutcome::Hit, Some(entry)) => {
						return Ok(cache_entry_to_response(&entry, outcome));
					},
					(cache::CacheOutcome::Stale, Some(entry)) => {
						if cache.begin_revalidation(key).await {
							spawn_revalidation(RevalidationJob {
								route: route.clone(),
								cache: cache.clone(),
								key: key.clone(),
								balancer: balancer.clone(),
								transport: transport.clone(),
								method: forward_method.clone(),
								path_and_query: forward_path.clone(),
								headers: forward_headers.clone(),
								body: forward_body.clone(),
								client_addr: client_addr_owned.clone(),
								tenant_id: tenant_id.clone(),
								traffic_group: traffic_group.clone(),
								client_key: client_key.clone(),
								timeout,
								retry_budget,
								cache_ttl_override,
							});
						}
						return Ok(cache_entry_to_response(&entry, outcome));
					},
					_ => {},
				}
			}
		}
	}

	let circuit_breaker = route.circuit_breaker.clone();
	let outlier = route.outlier.clone();

	// `Coalescer::execute` requires a closure returning `CapturedResponse`
	// directly (every follower shares the exact same value), so a failed
	// backend call is folded into an error-shaped `CapturedResponse` here
	// rather than surfacing a `Result` through the coalescing group.
	let call_backend = {
		let balancer = balancer.clone();
		let transport = transport.clone();
		let headers = forward_headers.clone();
		let method = forward_method.clone();
		let path_and_query = forward_path.clone();
		let body = forward_body.clone();
		let client_addr = client_addr_owned.clone();
		let switch_backend = switch_backend.clone();
		let tenant_id = tenant_id.clone();
		let traffic_group = traffic_group.clone();
		let client_key = client_key.clone();
		let circuit_breaker = circuit_breaker.clone();
		let outlier = outlier.clone();
		move || async move {
			let selection_ctx = SelectionContext {
				client_key: Some(client_key.as_str()),
				version_token: None,
				affinity_cookie: None,
				tenant_id: tenant_id.as_deref(),
				traffic_group: traffic_group.as_deref(),
			};
			forward_with_retries(
				&*balancer,
				&transport,
				&selection_ctx,
				method,
				&path_and_query,
				headers,
				body,
				&client_addr,
				"http",
				timeout,
				retry_budget,
				switch_backend.as_deref(),
				circuit_breaker.as_deref(),
				outlier.as_deref(),
			)
			.await
		}
	};

	let captured: CapturedResponse = if let Some(coalescer) = &route.coalescer {
		if let Some(key) = &cache_key_str {
			let backend_call = move || async move {
				match call_backend().await {
					Ok(r) => r,
					Err(e) => error_to_captured(&e),
				}
			};
			match coalescer.execute(key, Duration::from_millis(route.config.coalesce_timeout_ms), backend_call).await {
				Execution::Leader(r) | Execution::Shared(r) => r,
				Execution::TimedOutRunDirectly => match run_direct(route, &headers, method.clone(), path_and_query.clone(), body.clone(), client_addr, guard, route_state).await {
					Ok(r) => r,
					Err(e) => error_to_captured(&e),
				},
			}
		} else {
			match call_backend().await {
				Ok(r) => r,
				Err(e) => error_to_captured(&e),
			}
		}
	} else {
		match call_backend().await {
			Ok(r) => r,
			Err(e) => error_to_captured(&e),
		}
	};

	// spec §4.5 "stale-if-error": a failed live call falls back to a
	// still-within-budget stale entry rather than surfacing the error.
	if captured.status >= 500 {
		if let (Some(cache), Some(key)) = (&route.cache, &cache_key_str) {
			if let Some(stale) = cache.stale_if_error_fallback(key).await {
				return Ok(cache_entry_to_response(&stale, cache::CacheOutcome::Stale));
			}
		}
	}

	let response_time_ms = guard.start_time.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0);
	let response_env = ResponseEnv {
		request: RequestEnv {
			method: method.to_string(),
			path: path.clone(),
			headers: header_pairs(&headers),
			query: query_pairs(&query),
			remote_addr: client_addr.to_string(),
			route_id: route.route_id.clone(),
			tenant_id: guard.tenant_id.clone(),
			client_id: guard.identity.client_id.clone(),
			custom: guard.custom.clone(),
		},
		code: captured.status,
		response_headers: header_pairs(&captured.headers),
		response_time_ms,
	};

	let mut resp_buf = ResponseBuffer::new();
	resp_buf.set_status_code(StatusCode::from_u16(captured.status).unwrap_or(StatusCode::BAD_GATEWAY));
	*resp_buf.headers_mut() = captured.headers.clone();
	resp_buf.set_body(captured.body.clone());

	let outcome = route.response_rules.evaluate(None, Some(&response_env), guard, &mut resp_buf);
	if let EvalOutcome::Terminated { rule_id } = &outcome {
		info!(rule_id, route_id = %route.route_id, "response rule terminated request");
	}

	if eligible_for_cache {
		if let Some(cache) = &route.cache {
			if let Some(key) = &cache_key_str {
				let entry = CacheEntry {
					status: resp_buf.status().as_u16(),
					headers: resp_buf.headers().clone(),
					body: Bytes::copy_from_slice(resp_buf.body()),
					stored_at: Instant::now(),
					ttl: route.config.cache.ttl(),
					etag: None,
					last_modified: None,
				};
				let ttl_override = guard.overrides.as_ref().and_then(|o| o.cache_ttl_override);
				cache.store(key, entry, ttl_override, cache_bypass, false).await;
			}
		}
	}

	resp_buf.headers_mut().insert(cache_status_header(), HeaderValue::from_static(if eligible_for_cache { "MISS" } else { "BYPASS" }));

	Ok(flush_response(&mut resp_buf))
}

fn error_to_captured(e: &GatewayError) -> CapturedResponse {
	let status = e.status_code();
	let mut headers = HeaderMap::new();
	headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
	let body = serde_json::json!({ "error": status.canonical_reason().unwrap_or("error"), "message": e.to_string(), "status": status.as_u16() }).to_string();
	CapturedResponse {
		status: status.as_u16(),
		headers,
		body: Bytes::from(body),
	}
}

fn cache_entry_to_response(entry: &CacheEntry, outcome: cache::CacheOutcome) -> Response {
	let mut response = Response::new(Body::from(entry.body.clone()));
	*response.status_mut() = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
	*response.headers_mut() = entry.headers.clone();
	response.headers_mut().insert(cache_status_header(), HeaderValue::from_static(outcome.header_value()));
	response
}

/// Used when a coalesce follower times out waiting for the leader: runs the
/// backend call directly rather than joining the (possibly still-running)
/// group, per the coalescer's documented duplicate-work window.
#[allow(clippy::too_many_arguments)]
async fn run_direct(
	route: &Arc<RouteProxy>,
	headers: &HeaderMap,
	method: Method,
	path_and_query: String,
	body: Bytes,
	client_addr: &str,
	guard: &VariableContextGuard<'_>,
	route_state: &Arc<RouteState>,
) -> Result<CapturedResponse, GatewayError> {
	let timeout = guard.overrides.as_ref().and_then(|o| o.timeout_override).unwrap_or(Duration::from_secs(30));
	let retry_budget = guard.custom.get("retry_budget").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
	let switch_backend = guard.overrides.as_ref().and_then(|o| o.switch_backend.clone());
	let selection_ctx = SelectionContext {
		client_key: Some(client_addr),
		version_token: None,
		affinity_cookie: None,
		tenant_id: guard.tenant_id.as_deref(),
		traffic_group: guard.traffic_group.as_deref(),
	};
	forward_with_retries(
		&*route.balancer,
		&route_state.transport,
		&selection_ctx,
		method,
		&path_and_query,
		headers.clone(),
		body,
		client_addr,
		"http",
		timeout,
		retry_budget,
		switch_backend.as_deref(),
		route.circuit_breaker.as_deref(),
		route.outlier.as_deref(),
	)
	.await
}

fn report_success(circuit_breaker: Option<&CircuitBreakerStep>, outlier: Option<&OutlierEjectingWrapper>, backend: &Backend) {
	if let Some(cb) = circuit_breaker {
		cb.record_success();
	}
	if let Some(o) = outlier {
		o.record_success(backend);
	}
}

fn report_failure(circuit_breaker: Option<&CircuitBreakerStep>, outlier: Option<&OutlierEjectingWrapper>, backend: &Backend) {
	if let Some(cb) = circuit_breaker {
		cb.record_failure(policy::epoch_ms());
	}
	if let Some(o) = outlier {
		o.record_failure(backend);
	}
}

/// Selects a backend per attempt and calls `proxy::forward_to_backend` under
/// a timeout, retrying on timeout/connection error/5xx/gRPC failure status
/// up to `max_retries` (spec §4.2 "timeout"/"retry" slots, driven by
/// `TimeoutRetryStep`'s overrides/custom budget), feeding each attempt's
/// outcome back into `circuit_breaker`/`outlier` (spec §4.2 "circuit
/// breaker"/"outlier ejection"). gRPC answers always come back as HTTP 200
/// with the real outcome in the `grpc-status` trailer, so a plain status
/// check would
/// never retry a failed gRPC call.
#[allow(clippy::too_many_arguments)]
async fn forward_with_retries(
	balancer: &dyn httpgate_lb::Balancer,
	transport: &httpgate_lb::TransportPool,
	selection_ctx: &SelectionContext<'_>,
	method: Method,
	path_and_query: &str,
	headers: HeaderMap,
	body: Bytes,
	client_addr: &str,
	scheme: &str,
	timeout: Duration,
	max_retries: u32,
	switch_backend: Option<&str>,
	circuit_breaker: Option<&CircuitBreakerStep>,
	outlier: Option<&OutlierEjectingWrapper>,
) -> Result<CapturedResponse, GatewayError> {
	let _ = switch_backend; // balancer selection does not currently honor an explicit backend override
	let mut attempt = 0;
	loop {
		let selection = balancer.next(selection_ctx);
		let Some(backend) = selection.backend else {
			return Err(GatewayError::NoBackend);
		};
		let call = proxy::forward_to_backend(&backend, transport, method.clone(), path_and_query, headers.clone(), body.clone(), client_addr, scheme);
		let result = tokio::time::timeout(timeout, call).await;
		match result {
			Ok(Ok(response)) => {
				let status = response.status().as_u16();
				let (parts, incoming) = response.into_parts();
				let is_grpc = grpc::detect_protocol(&parts.headers) == grpc::ProtocolKind::Grpc;
				match incoming.collect().await {
					Ok(collected) => {
						let trailers = collected.trailers().cloned();
						let body_bytes = collected.to_bytes();
						let grpc_failed = is_grpc && !grpc::is_success(trailers.as_ref().and_then(grpc::grpc_status_from_trailers));
						if status >= 500 || grpc_failed {
							report_failure(circuit_breaker, outlier, &backend);
							if attempt < max_retries {
								attempt += 1;
								continue;
							}
						} else {
							report_success(circuit_breaker, outlier, &backend);
						}
						return Ok(CapturedResponse {
							status,
							headers: parts.headers,
							body: body_bytes,
						});
					},
					Err(e) => {
						report_failure(circuit_breaker, outlier, &backend);
						if attempt < max_retries {
							attempt += 1;
							continue;
						}
						return Err(GatewayError::BadGateway(e.to_string()));
					},
				}
			},
			Ok(Err(e)) => {
				report_failure(circuit_breaker, outlier, &backend);
				if attempt < max_retries {
					attempt += 1;
					continue;
				}
				return Err(e);
			},
			Err(_) => {
				report_failure(circuit_breaker, outlier, &backend);
				if attempt < max_retries {
					attempt += 1;
					continue;
				}
				return Err(GatewayError::Timeout);
			},
		}
	}
}

// ---------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------

async fn proxy_websocket(route: &Arc<RouteProxy>, req: &mut Request, headers: &HeaderMap, path_and_query: &str, client_addr: &str) -> Result<Response, GatewayError> {
	let selection_ctx = SelectionContext {
		client_key: Some(client_addr),
		version_token: None,
		affinity_cookie: None,
		tenant_id: None,
		traffic_group: None,
	};
	let selection = route.balancer.next(&selection_ctx);
	let backend = selection.backend.ok_or(GatewayError::NoBackend)?;
	let authority = backend.url.trim_start_matches("http://").trim_start_matches("https://").trim_end_matches('/').to_string();

	let mut stream = TcpStream::connect(&authority).await.map_err(|e| GatewayError::BadGateway(e.to_string()))?;

	let mut request_lines = format!("GET {path_and_query} HTTP/1.1\r\n");
	for (name, value) in headers.iter() {
		if let Ok(value) = value.to_str() {
			request_lines.push_str(&format!("{}: {}\r\n", name.as_str(), value));
		}
	}
	request_lines.push_str("\r\n");
	stream.write_all(request_lines.as_bytes()).await.map_err(|e| GatewayError::BadGateway(e.to_string()))?;

	let (status, backend_headers) = read_http_response_head(&mut stream).await.map_err(|e| GatewayError::BadGateway(e.to_string()))?;
	if status != 101 {
		let mut response = Response::new(Body::empty());
		*response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
		*response.headers_mut() = backend_headers;
		return Ok(response);
	}

	let on_upgrade = hyper::upgrade::on(req);
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let mut client_io = hyper_util::rt::TokioIo::new(upgraded);
				if let Err(e) = websocket::relay(&mut client_io, &mut stream).await {
					warn!(error = %e, "websocket relay ended with error");
				}
			},
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	let mut response = Response::new(Body::empty());
	*response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
	*response.headers_mut() = backend_headers;
	Ok(response)
}

async fn read_http_response_head(stream: &mut TcpStream) -> std::io::Result<(u16, HeaderMap)> {
	let mut buf = Vec::with_capacity(512);
	let mut byte = [0u8; 1];
	loop {
		stream.read_exact(&mut byte).await?;
		buf.push(byte[0]);
		if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
			break;
		}
		if buf.len() > 16 * 1024 {
			return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "response head too large"));
		}
	}
	let text = String::from_utf8_lossy(&buf);
	let mut lines = text.split("\r\n");
	let status_line = lines.next().unwrap_or("");
	let status = status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(502);
	let mut headers = HeaderMap::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		if let Some((name, value)) = line.split_once(':') {
			if let (Ok(name), Ok(value)) = (http::HeaderName::try_from(name.trim()), HeaderValue::from_str(value.trim())) {
				headers.append(name, value);
			}
		}
	}
	Ok((status, headers))
}

// ---------------------------------------------------------------------
// Server-Sent Events
// ---------------------------------------------------------------------

async fn handle_sse(hub: Arc<sse_hub::SseHub>, last_event_id: Option<String>, filter: Option<String>) -> Sse<impl futures::Stream<Item = Result<SseAxumEvent, std::convert::Infallible>>> {
	let (catchup, mut receiver) = hub.subscribe(last_event_id.as_deref(), filter.as_deref()).await;
	let stream = async_stream::stream! {
		for event in catchup {
			yield Ok(to_axum_event(event));
		}
		loop {
			match receiver.recv().await {
				Ok(event) => {
					if filter.is_none() || event.event.as_deref() == filter.as_deref() {
						yield Ok(to_axum_event(event));
					}
				},
				Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
				Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
			}
		}
		hub.client_disconnected();
	};
	Sse::new(stream)
}

fn to_axum_event(event: SseEvent) -> SseAxumEvent {
	let mut out = SseAxumEvent::default().data(event.data);
	if let Some(id) = event.id {
		out = out.id(id);
	}
	if let Some(kind) = event.event {
		out = out.event(kind);
	}
	if let Some(retry) = event.retry {
		out = out.retry(Duration::from_millis(retry));
	}
	out
}

/// Spawned once per SSE-enabled route at listener startup (not from
/// `build_route_state`, which is a pure, possibly non-async-context
/// builder): keeps one upstream connection open and republishes frames to
/// the route's hub.
fn spawn_sse_readers(route_state: &Arc<RouteState>, ct: &CancellationToken) {
	for route in route_state.routes.values() {
		let Some(hub) = route.sse_hub.clone() else { continue };
		let route = route.clone();
		let transport = route_state.transport.clone();
		let child = ct.child_token();
		tokio::spawn(async move {
			loop {
				if child.is_cancelled() {
					return;
				}
				let selection_ctx = SelectionContext::default();
				let headers = {
					let mut h = HeaderMap::new();
					h.insert(http::header::ACCEPT, HeaderValue::from_static("text/event-stream"));
					h
				};
				let result = proxy::forward(&*route.balancer, &transport, &selection_ctx, Method::GET, &route.config.path_pattern, headers, Bytes::new(), "sse-reader", "http").await;
				match result {
					Ok((response, _)) => {
						hub.set_connected(true);
						let mut body = response.into_body();
						let mut buf = Vec::new();
						loop {
							match body.frame().await {
								Some(Ok(frame)) => {
									if let Some(data) = frame.data_ref() {
										buf.extend_from_slice(data);
										while let Some(pos) = find_double_newline(&buf) {
											let block = buf[..pos].to_vec();
											buf.drain(..pos + 2);
											if let Some(event) = sse_hub::parse_event(&String::from_utf8_lossy(&block)) {
												hub.publish(event).await;
											}
										}
									}
								},
								Some(Err(_)) | None => break,
							}
						}
						hub.set_connected(false);
					},
					Err(e) => {
						warn!(error = %e, route_id = %route.route_id, "sse upstream connection failed, retrying");
					},
				}
				tokio::time::sleep(Duration::from_millis(route.config.sse.reconnect_backoff_ms.max(500))).await;
			}
		});
	}
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
	buf.windows(2).position(|w| w == b"\n\n")
}

// ---------------------------------------------------------------------
// GraphQL federation
// ---------------------------------------------------------------------

async fn handle_graphql(state: &GatewayState, route: &Arc<RouteProxy>, federation: &Arc<graphql::FieldOwner>, body: Bytes) -> Result<Response, GatewayError> {
	let request: serde_json::Value = serde_json::from_slice(&body).map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
	let query = request.get("query").and_then(|v| v.as_str()).ok_or_else(|| GatewayError::InvalidRequest("missing query".to_string()))?;
	let variables = request.get("variables").cloned().unwrap_or(serde_json::Value::Null);

	let sub_queries = graphql::split_query(query, federation, &variables).map_err(GatewayError::InvalidRequest)?;

	let sources: HashMap<String, String> = route.config.graphql.sources.iter().map(|s| (s.name.clone(), s.url.clone())).collect();
	let client = state.http_client.clone();

	let merged = graphql::execute_federated(sub_queries, move |sub| {
		let client = client.clone();
		let url = sources.get(&sub.source_name).cloned();
		let variables = sub.variables.clone();
		async move {
			let Some(url) = url else {
				return SubQueryResult {
					source_name: sub.source_name,
					data: None,
					error: Some("unknown graphql source".to_string()),
				};
			};
			let payload = serde_json::json!({ "query": sub.query, "variables": variables });
			match client.post(&url).json(&payload).send().await {
				Ok(resp) => match resp.json::<serde_json::Value>().await {
					Ok(body) => SubQueryResult {
						source_name: sub.source_name,
						data: body.get("data").cloned(),
						error: body.get("errors").map(|e| e.to_string()),
					},
					Err(e) => SubQueryResult {
						source_name: sub.source_name,
						data: None,
						error: Some(e.to_string()),
					},
				},
				Err(e) => SubQueryResult {
					source_name: sub.source_name,
					data: None,
					error: Some(e.to_string()),
				},
			}
		}
	})
	.await;

	Ok(axum::Json(merged).into_response())
}

// ---------------------------------------------------------------------
// Listener startup: plain HTTP (proxy-protocol aware) and TLS.
// ---------------------------------------------------------------------

fn load_tls_config(cert_path: &str, key_path: &str) -> anyhow::Result<Arc<ServerConfig>> {
	let cert_bytes = std::fs::read(cert_path)?;
	let key_bytes = std::fs::read(key_path)?;
	let key = PrivateKeyDer::from_pem_slice(&key_bytes)?;
	let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&cert_bytes).collect::<Result<Vec<_>, _>>()?;
	let mut config = ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)?;
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(Arc::new(config))
}

/// Binds every configured listener and serves until `ct` is cancelled,
/// branching per-listener on TLS (`proxyprotocol::AxumTlsListener`) vs.
/// plain (`proxyprotocol::Listener`) and collecting both into one
/// `JoinSet`.
pub async fn serve_all(config: &Config, manager: Arc<StateManager>, ct: CancellationToken) -> anyhow::Result<()> {
	let pool = Arc::new(crate::variables::new_variable_context_pool());
	let http_client = reqwest::Client::new();
	let state = GatewayState { manager: manager.clone(), pool, http_client };

	let route_state = manager.current().await;
	spawn_sse_readers(&route_state, &ct);

	let app = axum::Router::new()
		.fallback(route_request)
		.layer(tower_http::catch_panic::CatchPanicLayer::custom(panic_to_response))
		.layer(tower_http::trace::TraceLayer::new_for_http())
		.with_state(state);

	let mut run_set = tokio::task::JoinSet::new();
	for listener_cfg in &config.listeners {
		let net = tokio::net::TcpListener::bind(&listener_cfg.bind).await?;
		let router = app.clone();
		let child_token = ct.child_token();
		let listener_name = listener_cfg.name.clone();

		match &listener_cfg.tls {
			Some(tls_cfg) => {
				let server_config = load_tls_config(&tls_cfg.cert_path, &tls_cfg.key_path)?;
				let local_addr = net.local_addr()?;
				let acceptor = TlsAcceptor::from(server_config);
				let axum_tls_acceptor = proxyprotocol::AxumTlsAcceptor::new(acceptor);
				let tls_listener = proxyprotocol::AxumTlsListener::new(tls_listener::TlsListener::new(axum_tls_acceptor, net), local_addr, listener_cfg.proxy_protocol);
				let svc = router.into_make_service_with_connect_info::<proxyprotocol::Address>();
				info!(bind = %listener_cfg.bind, name = %listener_name, "serving https");
				run_set.spawn(async move {
					axum::serve(tls_listener, svc)
						.with_graceful_shutdown(async move { child_token.cancelled().await })
						.await
						.map_err(|e| anyhow::anyhow!("listener '{listener_name}' serving error: {e}"))
				});
			},
			None => {
				let listener = proxyprotocol::Listener::new(net, listener_cfg.proxy_protocol);
				let svc = router.into_make_service_with_connect_info::<proxyprotocol::Address>();
				info!(bind = %listener_cfg.bind, name = %listener_name, "serving http");
				run_set.spawn(async move {
					axum::serve(listener, svc)
						.with_graceful_shutdown(async move { child_token.cancelled().await })
						.await
						.map_err(|e| anyhow::anyhow!("listener '{listener_name}' serving error: {e}"))
				});
			},
		}
	}

	while let Some(result) = run_set.join_next().await {
		if let Err(e) = result {
			error!(error = %e, "listener task panicked or was aborted");
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wants_event_stream_matches_accept_header() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::ACCEPT, HeaderValue::from_static("text/event-stream"));
		assert!(wants_event_stream(&headers));
		assert!(!wants_event_stream(&HeaderMap::new()));
	}

	#[test]
	fn query_pairs_parses_simple_string() {
		let pairs = query_pairs("a=1&b=2");
		assert_eq!(pairs.get("a"), Some(&"1".to_string()));
		assert_eq!(pairs.get("b"), Some(&"2".to_string()));
	}
}
