use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The single error currency threaded through router, pipeline, rule engine
/// and cache. Every variant knows the HTTP status it maps to so call sites
/// never have to decide twice.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
	#[error("no route matches request")]
	NoRoute,

	#[error("method not allowed")]
	MethodNotAllowed,

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("unauthorized")]
	Unauthorized,

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("request body too large")]
	BodyTooLarge,

	#[error("unsupported media type")]
	UnsupportedMediaType,

	#[error("rate limit exceeded, retry after {retry_after_secs}s")]
	RateLimited { retry_after_secs: u64 },

	#[error("restricted by geography")]
	GeoRestricted,

	#[error("upstream timed out")]
	Timeout,

	#[error("circuit open for backend")]
	CircuitOpen,

	#[error("no healthy backend available")]
	NoBackend,

	#[error("bad gateway: {0}")]
	BadGateway(String),

	#[error("rule engine compile error: {0}")]
	RuleCompile(String),

	#[error("config error: {0}")]
	Config(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl GatewayError {
	/// Maps a variant to the status code listed in spec §6 "Status codes the
	/// core itself produces".
	pub fn status_code(&self) -> StatusCode {
		use GatewayError::*;
		match self {
			NoRoute => StatusCode::NOT_FOUND,
			MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			InvalidRequest(_) => StatusCode::BAD_REQUEST,
			Unauthorized => StatusCode::UNAUTHORIZED,
			Forbidden(_) => StatusCode::FORBIDDEN,
			BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
			RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			GeoRestricted => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
			Timeout => StatusCode::GATEWAY_TIMEOUT,
			CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
			NoBackend => StatusCode::SERVICE_UNAVAILABLE,
			BadGateway(_) => StatusCode::BAD_GATEWAY,
			RuleCompile(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
	message: String,
	status: u16,
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		let mut response = (
			status,
			Json(ErrorBody {
				error: status.canonical_reason().unwrap_or("error").to_string(),
				message: self.to_string(),
				status: status.as_u16(),
			}),
		)
			.into_response();
		if let GatewayError::RateLimited { retry_after_secs } = &self {
			response.headers_mut().insert(
				axum::http::header::RETRY_AFTER,
				retry_after_secs.to_string().parse().unwrap(),
			);
		}
		if status == StatusCode::SERVICE_UNAVAILABLE {
			response
				.headers_mut()
				.insert(axum::http::header::RETRY_AFTER, "1".parse().unwrap());
		}
		response
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_codes_match_spec_table() {
		assert_eq!(GatewayError::NoRoute.status_code(), StatusCode::NOT_FOUND);
		assert_eq!(GatewayError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
		assert_eq!(
			GatewayError::RateLimited { retry_after_secs: 1 }.status_code(),
			StatusCode::TOO_MANY_REQUESTS
		);
		assert_eq!(GatewayError::CircuitOpen.status_code(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(GatewayError::GeoRestricted.status_code(), StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS);
	}
}
