use std::collections::HashMap;
use std::sync::Arc;

use httpgate_lb::{Balancer, OutlierEjectingWrapper, TransportPool};

use crate::cache::Cache;
use crate::coalesce::Coalescer;
use crate::config::RouteConfig;
use crate::graphql::FieldOwner;
use crate::pipeline::{CompiledPipeline, Policy};
use crate::policy::CircuitBreakerStep;
use crate::rules::RuleEngine;
use crate::sse::SseHub;

/// Immutable after compilation (spec §3 "Route"). Holds everything a
/// request needs once the router has resolved a `RouteID`.
pub struct RouteProxy {
	pub route_id: String,
	pub config: RouteConfig,
	pub balancer: Arc<dyn Balancer>,
	pub pipeline: CompiledPipeline,
	pub request_rules: Arc<RuleEngine>,
	pub response_rules: Arc<RuleEngine>,
	pub cache: Option<Arc<Cache>>,
	pub coalescer: Option<Arc<Coalescer>>,
	pub sse_hub: Option<Arc<SseHub>>,
	pub federation: Option<Arc<FieldOwner>>,
	/// Concrete handle to the route's circuit breaker, so the proxy step
	/// can feed it real call outcomes; `None` when the route has it disabled.
	pub circuit_breaker: Option<Arc<CircuitBreakerStep>>,
	/// Concrete handle to the per-backend outlier ejector wrapping
	/// `balancer`, so the proxy step can feed it real call outcomes.
	pub outlier: Option<Arc<OutlierEjectingWrapper>>,
}

/// The entire swappable bundle of route-scoped state (spec §3
/// "RouteState"). Exactly one instance is "current" at any moment; the
/// state manager publishes a new one atomically on reload.
pub struct RouteState {
	pub router: crate::router::Router,
	pub routes: HashMap<String, Arc<RouteProxy>>,
	pub transport: Arc<TransportPool>,
	pub global_request_rules: Arc<RuleEngine>,
	pub global_response_rules: Arc<RuleEngine>,
	/// Every route's set-up policies, flattened, so the admin surface can
	/// list and query them without threading a second registry through
	/// `StateManager`.
	pub policies: Vec<Arc<dyn Policy>>,
}

impl RouteState {
	pub fn route(&self, route_id: &str) -> Option<Arc<RouteProxy>> {
		self.routes.get(route_id).cloned()
	}
}
