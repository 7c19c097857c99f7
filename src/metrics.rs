//! Prometheus text-format `/metrics` endpoint (spec §4.2 admin surface).
//! The actual recorder primitives (`Deferred`, `Recorder`) live in
//! `httpgate_core::metrics` and are shared by every policy; this module
//! only renders the registry they write into.

use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

#[derive(Clone)]
pub struct App {
	registry: Arc<Registry>,
}

impl App {
	pub fn new(registry: Arc<Registry>) -> Self {
		Self { registry }
	}

	pub fn router(&self) -> Router {
		Router::new().route("/metrics", get(metrics_handler)).with_state(self.clone())
	}
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	encode(&mut buffer, &app.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
	Ok(buffer)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builds_router_without_panicking() {
		let app = App::new(Arc::new(Registry::default()));
		let _ = app.router();
	}
}
