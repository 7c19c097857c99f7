//! Config → `RouteState` compiler and the atomic hot-reload swap (spec
//! §4.9). Building a new `RouteState` is pure and side-effect-free; only
//! `StateManager::reload` touches the shared, swappable
//! `Arc<RwLock<Arc<RouteState>>>` pointer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use httpgate_lb::balancer::{ConsistentHashBalancer, LeastConnectionsBalancer, RoundRobinBalancer, WeightedBalancer};
use httpgate_lb::{Backend, BackendSet, Balancer, OutlierEjectingWrapper, TransportConfig, TransportPool};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cache::{Cache, CachePolicy};
use crate::coalesce::Coalescer;
use crate::config::{BalancerKind, Config, RouteConfig, WebhookConfig};
use crate::errors::GatewayError;
use crate::graphql::{merge_schemas, FieldOwner, SourceSchema};
use crate::pipeline::{CompiledPipeline, PipelineAssembler, PipelineStep, Policy};
use crate::policy::{
	AccessLogStep, AdaptiveConcurrencyStep, AllowedHostsStep, AuthStep, BandwidthStep, BodyLimitStep, CircuitBreakerStep, CompressionMarkerStep, ContentNegotiationStep, CsrfStep,
	CustomMarkerStep, GeoStep, HttpsRedirectStep, IdempotencyStep, IpFilterStep, NonceStep, PriorityStep, QuotaStep, RateLimitStep, RecoveryStep, RequestRulesStep, ResponseValidationStep,
	SecurityHeadersStep, TenantStep, ThrottleStep, TimeoutRetryStep, TransformRequestStep, TrustedProxyStep, UserAgentClassifierStep, ValidationStep, WafStep,
};
use crate::route::{RouteProxy, RouteState};
use crate::router::{Router, RouteSpec};
use crate::rules::{action_from_json, CompiledRule, RuleEngine};
use crate::sse::SseHub;
use crate::webhook::{self, WebhookEvent};

fn compile_rules(configs: &[crate::config::RuleConfig]) -> Result<Vec<CompiledRule>, GatewayError> {
	configs
		.iter()
		.filter(|r| r.enabled)
		.map(|r| {
			let action = action_from_json(&r.action).map_err(GatewayError::RuleCompile)?;
			CompiledRule::compile(r.id.clone(), r.expression.clone(), action).map_err(GatewayError::RuleCompile)
		})
		.collect()
}

fn build_balancer(cfg: &RouteConfig) -> (Arc<dyn Balancer>, Option<Arc<OutlierEjectingWrapper>>) {
	let backends: Vec<Backend> = cfg.backends.iter().map(|b| Backend::new(b.url.clone(), b.weight)).collect();
	let set = BackendSet::new(backends);
	let inner: Arc<dyn Balancer> = match cfg.balancer {
		BalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::new(set.clone())),
		BalancerKind::Weighted => Arc::new(WeightedBalancer::new(set.clone(), HashMap::new())),
		BalancerKind::ConsistentHash => Arc::new(ConsistentHashBalancer::new(set.clone())),
		BalancerKind::LeastConnections => Arc::new(LeastConnectionsBalancer::new(set.clone())),
	};
	if cfg.circuit_breaker.enabled {
		let outlier = Arc::new(OutlierEjectingWrapper::new(
			inner,
			&set,
			cfg.circuit_breaker.consecutive_failures,
			Duration::from_secs(cfg.circuit_breaker.quarantine_secs),
		));
		(outlier.clone() as Arc<dyn Balancer>, Some(outlier))
	} else {
		(inner, None)
	}
}

/// Builds every active request-phase pipeline step for one route and hands
/// back the assembled chain plus the subset that are admin-visible
/// `Policy` objects. Policies with nothing to do for this route (no
/// matching `RouteConfig` knob set) are left out entirely, per spec §4.2
/// ("a policy is included only when its configured state is active") —
/// response-phase policies (`response_rules`, `response_validation`,
/// `metrics`) and the backend call itself (`proxy`) are applied by the
/// listener once the upstream response exists, since `PipelineContext`
/// only carries the request-side environment.
fn build_pipeline(cfg: &RouteConfig, request_rules: Arc<RuleEngine>) -> (CompiledPipeline, Vec<Arc<dyn Policy>>, Option<Arc<CircuitBreakerStep>>) {
	let sec = &cfg.security;
	let mut builtins: HashMap<&'static str, Arc<dyn PipelineStep>> = HashMap::new();
	let mut policies: Vec<Arc<dyn Policy>> = Vec::new();
	let mut active: Vec<&'static str> = Vec::new();
	let mut circuit_breaker: Option<Arc<CircuitBreakerStep>> = None;

	macro_rules! install {
		($slot:expr, $step:expr) => {{
			let step: Arc<dyn PipelineStep> = $step;
			builtins.insert($slot, step);
			active.push($slot);
		}};
	}

	// `recovery` wraps the rest of the chain's panics; it's modeled as the
	// first slot rather than a true onion wrapper (see DESIGN.md).
	let access_log = Arc::new(AccessLogStep::default());
	policies.push(access_log.clone());
	install!("recovery", Arc::new(RecoveryStep::new(access_log.clone())));
	active.push("access_log");
	builtins.insert("access_log", access_log);

	if !sec.trusted_proxies.is_empty() {
		let step = Arc::new(TrustedProxyStep::new(sec.trusted_proxies.iter().cloned().collect()));
		policies.push(step.clone());
		install!("trusted_proxy", step);
	}
	if !sec.allowed_hosts.is_empty() {
		let step = Arc::new(AllowedHostsStep::new(sec.allowed_hosts.iter().cloned().collect()));
		policies.push(step.clone());
		install!("allowed_hosts", step);
	}
	if sec.https_redirect {
		let step = Arc::new(HttpsRedirectStep);
		policies.push(step.clone());
		install!("https_redirect", step);
	}
	if let Some(header) = &sec.geo_header {
		let step = Arc::new(GeoStep::new(header.clone(), sec.geo_blocked.iter().cloned().collect()));
		policies.push(step.clone());
		install!("geo", step);
	}
	if !sec.ip_allow_list.is_empty() {
		let step = Arc::new(IpFilterStep::allow_list(sec.ip_allow_list.iter().cloned().collect()));
		policies.push(step.clone());
		install!("ip_filter", step);
	}
	if !sec.ip_block_list.is_empty() {
		let step = Arc::new(IpFilterStep::block_list(sec.ip_block_list.iter().cloned().collect()));
		policies.push(step.clone());
		install!("ip_blocklist", step);
	}
	if cfg.auth.enabled {
		let step = Arc::new(AuthStep::new(true));
		policies.push(step.clone());
		install!("auth", step);
	}
	if let Some(header) = &sec.tenant_header {
		let step = Arc::new(TenantStep::new(header.clone()));
		policies.push(step.clone());
		install!("tenant", step);
	}

	let request_rules_step = Arc::new(RequestRulesStep::new(request_rules));
	policies.push(request_rules_step.clone());
	install!("request_rules", request_rules_step);

	if let Some(bytes) = sec.body_limit_bytes {
		let step = Arc::new(BodyLimitStep::new(bytes));
		policies.push(step.clone());
		install!("body_limit", step);
	}
	if !sec.validation_content_types.is_empty() {
		let step = Arc::new(ValidationStep::new(sec.validation_content_types.clone()));
		policies.push(step.clone());
		install!("validation", step);
	}
	if sec.waf_enabled {
		let step = Arc::new(WafStep::new());
		policies.push(step.clone());
		install!("waf", step);
	}
	if sec.bot_detect {
		let step = Arc::new(UserAgentClassifierStep::bot_detect());
		policies.push(step.clone());
		install!("bot_detect", step);
	}
	if sec.ai_crawl_detect {
		let step = Arc::new(UserAgentClassifierStep::ai_crawl());
		policies.push(step.clone());
		install!("ai_crawl", step);
	}
	if sec.csrf_enabled {
		let step = Arc::new(CsrfStep::default());
		policies.push(step.clone());
		install!("csrf", step);
	}
	if sec.nonce_enabled {
		let step = Arc::new(NonceStep::default());
		policies.push(step.clone());
		install!("nonce", step);
	}
	if let Some(window) = sec.idempotency_window_secs {
		let step = Arc::new(IdempotencyStep::new(Duration::from_secs(window)));
		policies.push(step.clone());
		install!("idempotency", step);
	}
	if !sec.content_negotiation_types.is_empty() {
		let step = Arc::new(ContentNegotiationStep::new(sec.content_negotiation_types.clone()));
		policies.push(step.clone());
		install!("content_negotiation", step);
	}
	{
		let step = Arc::new(TransformRequestStep::default());
		policies.push(step.clone());
		install!("transform_request", step);
	}
	if cfg.cache.enabled {
		// Coalescing and caching are applied by the listener around the
		// actual backend call, not as a `PipelineStep` — both need to
		// short-circuit the call entirely on a hit, which the flat
		// `Continue`/`Terminate` chain can't express without the response
		// already existing.
		active.push("coalesce");
		active.push("cache");
	}
	if cfg.circuit_breaker.enabled {
		let step = Arc::new(CircuitBreakerStep::new(cfg.circuit_breaker.consecutive_failures, Duration::from_secs(cfg.circuit_breaker.quarantine_secs)));
		policies.push(step.clone());
		circuit_breaker = Some(step.clone());
		install!("circuit_breaker", step);
	}
	if let Some(max_inflight) = sec.adaptive_concurrency_max_inflight {
		let step = Arc::new(AdaptiveConcurrencyStep::new(max_inflight));
		policies.push(step.clone());
		install!("adaptive_concurrency", step);
	}
	{
		let step = Arc::new(PriorityStep::new(sec.priority_default.unwrap_or(0)));
		policies.push(step.clone());
		install!("priority", step);
	}
	if cfg.rate_limit.enabled {
		let step = Arc::new(RateLimitStep::new(cfg.rate_limit.rate, Duration::from_millis(cfg.rate_limit.period_ms)));
		policies.push(step.clone());
		install!("rate_limit", step);
		let quota = Arc::new(QuotaStep::new(cfg.rate_limit.rate.saturating_mul(100), Duration::from_secs(3600)));
		policies.push(quota.clone());
		install!("quota", quota);
		let throttle = Arc::new(ThrottleStep::new(cfg.rate_limit.burst.max(1), Duration::from_millis(cfg.rate_limit.period_ms)));
		policies.push(throttle.clone());
		install!("throttle", throttle);
	}
	if let Some(max_concurrent) = sec.bandwidth_max_concurrent {
		let step = Arc::new(BandwidthStep::new(max_concurrent));
		policies.push(step.clone());
		install!("bandwidth", step);
	}
	{
		let step = Arc::new(TimeoutRetryStep::new(Duration::from_millis(sec.timeout_ms.unwrap_or(30_000)), sec.max_retries.unwrap_or(0)));
		policies.push(step.clone());
		builtins.insert("timeout", step.clone());
		active.push("timeout");
		builtins.insert("retry", step);
		active.push("retry");
	}
	if !sec.response_rejected_statuses.is_empty() {
		let step = Arc::new(ResponseValidationStep::new(sec.response_rejected_statuses.iter().copied().collect()));
		policies.push(step.clone());
		install!("response_validation", step);
	}
	{
		let step = Arc::new(SecurityHeadersStep::default());
		policies.push(step.clone());
		install!("security_headers", step);
	}
	{
		let step = Arc::new(CompressionMarkerStep::default());
		policies.push(step.clone());
		install!("compression", step);
	}

	let custom_steps: Vec<(crate::config::CustomSlotConfig, Arc<dyn PipelineStep>)> = cfg
		.custom_slots
		.iter()
		.map(|slot_cfg| {
			let step = Arc::new(CustomMarkerStep::default());
			policies.push(step.clone());
			(slot_cfg.clone(), step as Arc<dyn PipelineStep>)
		})
		.collect();

	let assembler = PipelineAssembler::new(builtins);
	let active_refs: Vec<&str> = active.iter().copied().collect();
	let pipeline = assembler.assemble(cfg, &active_refs, custom_steps);
	(pipeline, policies, circuit_breaker)
}

/// Pure builder: turns one `Config` into a fresh `RouteState`. Caller
/// decides whether and how to publish it; this function has no side
/// effects on any already-published state.
pub fn build_route_state(config: &Config) -> Result<RouteState, GatewayError> {
	config.validate()?;

	let global_request_rules = Arc::new(RuleEngine {
		global: compile_rules(&config.global_rules.request)?,
		route: Vec::new(),
		metrics: Default::default(),
	});
	let global_response_rules = Arc::new(RuleEngine {
		global: compile_rules(&config.global_rules.response)?,
		route: Vec::new(),
		metrics: Default::default(),
	});

	let transport = Arc::new(TransportPool::new(TransportConfig::default()));

	let specs: Vec<RouteSpec> = config
		.routes
		.iter()
		.map(|r| RouteSpec {
			route_id: r.route_id.clone(),
			hosts: r.hosts.clone(),
			path_pattern: r.path_pattern.clone(),
			methods: r.methods.clone(),
			required_headers: Vec::new(),
		})
		.collect();
	let router = Router::compile(&specs);

	let mut routes = HashMap::new();
	let mut all_policies: Vec<Arc<dyn Policy>> = Vec::new();
	for route_cfg in &config.routes {
		let (balancer, outlier) = build_balancer(route_cfg);

		let request_rules = Arc::new(RuleEngine {
			global: global_request_rules.global.clone(),
			route: compile_rules(&route_cfg.rules.request)?,
			metrics: Default::default(),
		});
		let response_rules = Arc::new(RuleEngine {
			global: global_response_rules.global.clone(),
			route: compile_rules(&route_cfg.rules.response)?,
			metrics: Default::default(),
		});

		let (pipeline, policies, circuit_breaker) = build_pipeline(route_cfg, request_rules.clone());
		for policy in &policies {
			policy.setup(&route_cfg.route_id, route_cfg)?;
		}
		all_policies.extend(policies);

		let cache = if route_cfg.cache.enabled {
			Some(Arc::new(Cache::new(CachePolicy {
				ttl: route_cfg.cache.ttl(),
				swr: route_cfg.cache.swr(),
				sie: route_cfg.cache.sie(),
				conditional_validation: route_cfg.cache.conditional_validation,
				..Default::default()
			})))
		} else {
			None
		};

		let coalescer = if route_cfg.cache.enabled { Some(Arc::new(Coalescer::default())) } else { None };

		let sse_hub = if route_cfg.sse.enabled { Some(SseHub::new(route_cfg.sse.ring_capacity)) } else { None };

		let federation = if route_cfg.graphql.enabled {
			let sources: Vec<SourceSchema> = route_cfg
				.graphql
				.sources
				.iter()
				.map(|s| SourceSchema {
					name: s.name.clone(),
					root_fields: s.root_fields.clone(),
				})
				.collect();
			let owner: FieldOwner = merge_schemas(&sources).map_err(|e| GatewayError::Config(e.to_string()))?;
			Some(Arc::new(owner))
		} else {
			None
		};

		routes.insert(
			route_cfg.route_id.clone(),
			Arc::new(RouteProxy {
				route_id: route_cfg.route_id.clone(),
				config: route_cfg.clone(),
				balancer,
				pipeline,
				request_rules,
				response_rules,
				cache,
				coalescer,
				sse_hub,
				federation,
				circuit_breaker,
				outlier,
			}),
		);
	}

	Ok(RouteState {
		router,
		routes,
		transport,
		global_request_rules,
		global_response_rules,
		policies: all_policies,
	})
}

/// Added/removed/reloaded route IDs between two configs (spec §4.9's
/// reload diff, surfaced in the `config.reload_success` webhook payload).
#[derive(Debug, Default, serde::Serialize)]
pub struct RouteDiff {
	pub added: Vec<String>,
	pub removed: Vec<String>,
	pub reloaded: Vec<String>,
}

fn diff_routes(old: &RouteState, new_cfg: &Config) -> RouteDiff {
	let old_ids: HashSet<&str> = old.routes.keys().map(String::as_str).collect();
	let new_ids: HashSet<&str> = new_cfg.routes.iter().map(|r| r.route_id.as_str()).collect();
	RouteDiff {
		added: new_ids.difference(&old_ids).map(|s| s.to_string()).collect(),
		removed: old_ids.difference(&new_ids).map(|s| s.to_string()).collect(),
		reloaded: new_ids.intersection(&old_ids).map(|s| s.to_string()).collect(),
	}
}

/// Owns the single swappable `RouteState` pointer and drives reloads
/// (spec §4.9 steps 1-7): build the new state off to the side, validate,
/// swap under the write lock, then notify webhooks of the outcome. Old
/// backends are dropped with their `Arc<TransportPool>` once the last
/// in-flight request holding the old `RouteState` finishes.
pub struct StateManager {
	state: Arc<RwLock<Arc<RouteState>>>,
	webhooks: Vec<WebhookConfig>,
	webhook_client: reqwest::Client,
}

impl StateManager {
	pub fn new(config: &Config) -> Result<Self, GatewayError> {
		let state = build_route_state(config)?;
		Ok(Self {
			state: Arc::new(RwLock::new(Arc::new(state))),
			webhooks: config.webhooks.clone(),
			webhook_client: reqwest::Client::new(),
		})
	}

	pub async fn current(&self) -> Arc<RouteState> {
		self.state.read().await.clone()
	}

	/// Builds the candidate state lock-free, then swaps it in under the
	/// write lock only after it's fully constructed — a bad config never
	/// touches live traffic.
	pub async fn reload(&self, config: &Config) -> Result<RouteDiff, GatewayError> {
		match build_route_state(config) {
			Ok(new_state) => {
				let diff = {
					let guard = self.state.read().await;
					diff_routes(&guard, config)
				};
				{
					let mut guard = self.state.write().await;
					*guard = Arc::new(new_state);
				}
				info!(added = diff.added.len(), removed = diff.removed.len(), reloaded = diff.reloaded.len(), "route state reloaded");
				self.notify("config.reload_success", serde_json::json!(diff)).await;
				Ok(diff)
			},
			Err(e) => {
				warn!(error = %e, "route state reload rejected, live state untouched");
				self.notify("config.reload_failure", serde_json::json!({"error": e.to_string()})).await;
				Err(e)
			},
		}
	}

	async fn notify(&self, event_type: &str, data: serde_json::Value) {
		let timestamp = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
		for webhook_cfg in &self.webhooks {
			let event = WebhookEvent { event_type, timestamp, route_id: None, data: Some(data.clone()) };
			webhook::dispatch(&self.webhook_client, webhook_cfg, &event).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{BackendConfig, RouteConfig};

	fn minimal_config() -> Config {
		Config {
			routes: vec![RouteConfig {
				route_id: "r1".into(),
				hosts: vec![],
				path_pattern: "/data".into(),
				methods: vec!["GET".into()],
				backends: vec![BackendConfig { url: "http://localhost:9000".into(), weight: 1 }],
				balancer: BalancerKind::default(),
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
			}],
			..Default::default()
		}
	}

	#[test]
	fn builds_route_state_with_one_route() {
		let state = build_route_state(&minimal_config()).unwrap();
		assert!(state.route("r1").is_some());
		assert!(state.route("missing").is_none());
	}

	#[test]
	fn rejects_invalid_config_without_building() {
		let mut config = minimal_config();
		config.routes[0].backends.clear();
		config.routes[0].graphql.enabled = false;
		assert!(build_route_state(&config).is_err());
	}

	#[tokio::test]
	async fn reload_swaps_in_new_route() {
		let manager = StateManager::new(&minimal_config()).unwrap();
		assert!(manager.current().await.route("r1").is_some());

		let mut second = minimal_config();
		second.routes[0].route_id = "r2".into();
		let diff = manager.reload(&second).await.unwrap();
		assert_eq!(diff.added, vec!["r2".to_string()]);
		assert_eq!(diff.removed, vec!["r1".to_string()]);
		assert!(manager.current().await.route("r2").is_some());
		assert!(manager.current().await.route("r1").is_none());
	}

	#[tokio::test]
	async fn reload_rejects_bad_config_and_keeps_old_state() {
		let manager = StateManager::new(&minimal_config()).unwrap();
		let mut bad = minimal_config();
		bad.routes[0].backends.clear();
		bad.routes[0].graphql.enabled = false;
		assert!(manager.reload(&bad).await.is_err());
		assert!(manager.current().await.route("r1").is_some());
	}
}
