// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Admin surface (spec §4.2 "AdminStats"/"AdminPath"): one JSON snapshot
//! route per policy that opts in, plus a `/policies` index.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value as Json_;

use crate::pipeline::Policy;

#[derive(Clone)]
pub struct App {
	policies: Arc<Vec<Arc<dyn Policy>>>,
}

impl App {
	pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
		Self { policies: Arc::new(policies) }
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/policies", get(index_handler))
			.route("/policies/{name}", get(policy_stats_handler))
			.with_state(self.clone())
	}
}

async fn index_handler(State(app): State<App>) -> Json<Vec<Json_>> {
	let entries = app
		.policies
		.iter()
		.map(|p| {
			serde_json::json!({
				"name": p.name(),
				"adminPath": p.admin_path(),
				"routeCount": p.route_ids().len(),
			})
		})
		.collect();
	Json(entries)
}

async fn policy_stats_handler(State(app): State<App>, Path(name): Path<String>) -> Result<Json<Json_>, StatusCode> {
	let policy = app
		.policies
		.iter()
		.find(|p| p.admin_path() == Some(name.as_str()) || p.name() == name)
		.ok_or(StatusCode::NOT_FOUND)?;
	match policy.admin_stats() {
		Some(stats) => Ok(Json(stats)),
		None => Err(StatusCode::NOT_FOUND),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::RouteConfig;
	use crate::errors::GatewayError;

	struct StubPolicy;
	impl Policy for StubPolicy {
		fn name(&self) -> &'static str {
			"stub"
		}
		fn setup(&self, _route_id: &str, _route_cfg: &RouteConfig) -> Result<(), GatewayError> {
			Ok(())
		}
		fn route_ids(&self) -> Vec<String> {
			vec!["r1".to_string()]
		}
		fn admin_stats(&self) -> Option<Json_> {
			Some(serde_json::json!({ "ok": true }))
		}
		fn admin_path(&self) -> Option<&str> {
			Some("stub")
		}
	}

	#[test]
	fn index_lists_registered_policies() {
		let app = App::new(vec![Arc::new(StubPolicy)]);
		assert_eq!(app.policies.len(), 1);
		assert_eq!(app.policies[0].name(), "stub");
	}
}
