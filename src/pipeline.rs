//! Pipeline assembler (spec §4.2): for each route, builds the ordered
//! chain of policy slots, respecting configured `after`/`before` anchors
//! for custom slots and skipping any slot whose policy isn't active for
//! that route.

use std::sync::Arc;

use crate::config::{CustomSlotConfig, RouteConfig};
use crate::errors::GatewayError;
use crate::response::ResponseBuffer;
use crate::rules::RequestEnv;
use crate::variables::VariableContext;

/// The fixed built-in slot order from spec §4.2. `Custom` slots are
/// inserted relative to one of these via `after`/`before` anchors.
pub const BUILTIN_SLOT_ORDER: &[&str] = &[
	"recovery",
	"trusted_proxy",
	"access_log",
	"var_context",
	"allowed_hosts",
	"https_redirect",
	"geo",
	"ip_filter",
	"ip_blocklist",
	"auth",
	"tenant",
	"request_rules",
	"body_limit",
	"request_decompression",
	"validation",
	"waf",
	"bot_detect",
	"ai_crawl",
	"csrf",
	"nonce",
	"idempotency",
	"content_negotiation",
	"transform_request",
	"coalesce",
	"cache",
	"circuit_breaker",
	"adaptive_concurrency",
	"priority",
	"rate_limit",
	"quota",
	"throttle",
	"bandwidth",
	"timeout",
	"retry",
	"response_validation",
	"response_rules",
	"security_headers",
	"compression",
	"metrics",
	"proxy",
];

/// Per-route request-phase context threaded through every pipeline step.
pub struct PipelineContext<'a> {
	pub vctx: &'a mut VariableContext,
	pub resp: &'a mut ResponseBuffer,
	pub request_env: &'a RequestEnv,
}

pub enum StepOutcome {
	/// Continue to the next step in the chain.
	Continue,
	/// A terminating step already wrote the final response into `resp`;
	/// stop the chain here (spec §4.2: "Terminating policies write a
	/// response and return without calling next").
	Terminate,
}

/// Every policy exposes this uniform contract (spec §4.2). `Setup` is
/// idempotent for a given `route_id` within a `RouteState`.
pub trait Policy: Send + Sync {
	fn name(&self) -> &'static str;
	fn setup(&self, route_id: &str, route_cfg: &RouteConfig) -> Result<(), GatewayError>;
	fn route_ids(&self) -> Vec<String>;
	fn admin_stats(&self) -> Option<serde_json::Value> {
		None
	}
	fn admin_path(&self) -> Option<&str> {
		None
	}
	/// Whether this policy has anything to do for the given route (spec
	/// §4.2: "A policy is included only when its configured state is
	/// active"). Default: always active once set up.
	fn active_for(&self, _route_cfg: &RouteConfig) -> bool {
		true
	}
}

/// A single executable step bound to a route: a policy's runtime behavior
/// plus the slot name it occupies, used for `SkipFlag` lookups and
/// ordering.
#[async_trait::async_trait]
pub trait PipelineStep: Send + Sync {
	fn slot_name(&self) -> &'static str;
	async fn execute(&self, ctx: &mut PipelineContext<'_>) -> StepOutcome;
}

pub struct CompiledPipeline {
	pub steps: Vec<Arc<dyn PipelineStep>>,
}

impl CompiledPipeline {
	/// Runs the chain in order; stops at the first `Terminate`.
	pub async fn run(&self, ctx: &mut PipelineContext<'_>) -> StepOutcome {
		for step in &self.steps {
			match step.execute(ctx).await {
				StepOutcome::Continue => continue,
				StepOutcome::Terminate => return StepOutcome::Terminate,
			}
		}
		StepOutcome::Continue
	}
}

/// Builds the ordered chain for one route: active built-in steps in
/// `BUILTIN_SLOT_ORDER`, with custom slots stably inserted relative to
/// their anchor.
pub struct PipelineAssembler {
	builtins: std::collections::HashMap<&'static str, Arc<dyn PipelineStep>>,
}

impl PipelineAssembler {
	pub fn new(builtins: std::collections::HashMap<&'static str, Arc<dyn PipelineStep>>) -> Self {
		Self { builtins }
	}

	pub fn assemble(&self, route_cfg: &RouteConfig, active_slots: &[&str], custom_steps: Vec<(CustomSlotConfig, Arc<dyn PipelineStep>)>) -> CompiledPipeline {
		let mut ordered_names: Vec<String> = BUILTIN_SLOT_ORDER
			.iter()
			.filter(|name| active_slots.contains(name))
			.map(|s| s.to_string())
			.collect();

		for (slot_cfg, _) in &custom_steps {
			if let Some(after) = &slot_cfg.after {
				if let Some(pos) = ordered_names.iter().position(|n| n == after) {
					ordered_names.insert(pos + 1, slot_cfg.name.clone());
					continue;
				}
			}
			if let Some(before) = &slot_cfg.before {
				if let Some(pos) = ordered_names.iter().position(|n| n == before) {
					ordered_names.insert(pos, slot_cfg.name.clone());
					continue;
				}
			}
			ordered_names.push(slot_cfg.name.clone());
		}

		let mut steps = Vec::with_capacity(ordered_names.len());
		for name in &ordered_names {
			if let Some(step) = self.builtins.get(name.as_str()) {
				steps.push(step.clone());
				continue;
			}
			if let Some((_, step)) = custom_steps.iter().find(|(cfg, _)| &cfg.name == name) {
				steps.push(step.clone());
			}
		}
		let _ = route_cfg;
		CompiledPipeline { steps }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::RouteConfig;

	struct Marker(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);

	#[async_trait::async_trait]
	impl PipelineStep for Marker {
		fn slot_name(&self) -> &'static str {
			self.0
		}
		async fn execute(&self, _ctx: &mut PipelineContext<'_>) -> StepOutcome {
			self.1.lock().unwrap().push(self.0);
			StepOutcome::Continue
		}
	}

	fn route_cfg() -> RouteConfig {
		RouteConfig {
			route_id: "r1".into(),
			hosts: vec![],
			path_pattern: "/x".into(),
			methods: vec![],
			backends: vec![],
			balancer: Default::default(),
			cache: Default::default(),
			rate_limit: Default::default(),
			circuit_breaker: Default::default(),
			coalesce_timeout_ms: 1000,
			rules: Default::default(),
			graphql: Default::default(),
			sse: Default::default(),
			custom_slots: vec![],
			auth: Default::default(),
			security: Default::default(),
		}
	}

	#[tokio::test]
	async fn builtin_order_is_respected() {
		let log: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
		let mut builtins: std::collections::HashMap<&'static str, Arc<dyn PipelineStep>> = std::collections::HashMap::new();
		builtins.insert("auth", Arc::new(Marker("auth", log.clone())));
		builtins.insert("recovery", Arc::new(Marker("recovery", log.clone())));
		builtins.insert("proxy", Arc::new(Marker("proxy", log.clone())));

		let assembler = PipelineAssembler::new(builtins);
		let pipeline = assembler.assemble(&route_cfg(), &["recovery", "auth", "proxy"], vec![]);

		let mut vctx = VariableContext::default();
		let mut resp = ResponseBuffer::new();
		let env = RequestEnv::default();
		let mut ctx = PipelineContext {
			vctx: &mut vctx,
			resp: &mut resp,
			request_env: &env,
		};
		pipeline.run(&mut ctx).await;
		assert_eq!(*log.lock().unwrap(), vec!["recovery", "auth", "proxy"]);
	}

	#[tokio::test]
	async fn custom_slot_inserted_after_anchor() {
		let log: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
		let mut builtins: std::collections::HashMap<&'static str, Arc<dyn PipelineStep>> = std::collections::HashMap::new();
		builtins.insert("auth", Arc::new(Marker("auth", log.clone())));
		builtins.insert("tenant", Arc::new(Marker("tenant", log.clone())));

		let custom: Arc<dyn PipelineStep> = Arc::new(Marker("my_custom", log.clone()));
		let slot_cfg = CustomSlotConfig {
			name: "my_custom".to_string(),
			after: Some("auth".to_string()),
			before: None,
		};

		let assembler = PipelineAssembler::new(builtins);
		let pipeline = assembler.assemble(&route_cfg(), &["auth", "tenant"], vec![(slot_cfg, custom)]);

		let mut vctx = VariableContext::default();
		let mut resp = ResponseBuffer::new();
		let env = RequestEnv::default();
		let mut ctx = PipelineContext {
			vctx: &mut vctx,
			resp: &mut resp,
			request_env: &env,
		};
		pipeline.run(&mut ctx).await;
		assert_eq!(*log.lock().unwrap(), vec!["auth", "my_custom", "tenant"]);
	}

	#[tokio::test]
	async fn terminate_stops_remaining_steps() {
		struct Terminator;
		#[async_trait::async_trait]
		impl PipelineStep for Terminator {
			fn slot_name(&self) -> &'static str {
				"auth"
			}
			async fn execute(&self, _ctx: &mut PipelineContext<'_>) -> StepOutcome {
				StepOutcome::Terminate
			}
		}
		let log: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
		let mut builtins: std::collections::HashMap<&'static str, Arc<dyn PipelineStep>> = std::collections::HashMap::new();
		builtins.insert("auth", Arc::new(Terminator));
		builtins.insert("proxy", Arc::new(Marker("proxy", log.clone())));

		let assembler = PipelineAssembler::new(builtins);
		let pipeline = assembler.assemble(&route_cfg(), &["auth", "proxy"], vec![]);
		let mut vctx = VariableContext::default();
		let mut resp = ResponseBuffer::new();
		let env = RequestEnv::default();
		let mut ctx = PipelineContext {
			vctx: &mut vctx,
			resp: &mut resp,
			request_env: &env,
		};
		let outcome = pipeline.run(&mut ctx).await;
		assert!(matches!(outcome, StepOutcome::Terminate));
		assert!(log.lock().unwrap().is_empty());
	}
}
