//! Typed gateway configuration, parsed from YAML or JSON (spec §2's "Config
//! loader" row). `#[serde(rename_all = "camelCase", deny_unknown_fields)]`
//! throughout so a typo'd field fails fast at load time instead of
//! silently falling back to a default.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub listeners: Vec<ListenerConfig>,
	#[serde(default)]
	pub routes: Vec<RouteConfig>,
	#[serde(default)]
	pub global_rules: RulesConfig,
	#[serde(default)]
	pub webhooks: Vec<WebhookConfig>,
	#[serde(default)]
	pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListenerConfig {
	pub name: String,
	pub bind: String,
	#[serde(default)]
	pub tls: Option<TlsConfig>,
	#[serde(default)]
	pub proxy_protocol: bool,
}

/// A narrow, leaf-module config shape (spec Non-goals: "TLS termination
/// logic" is out of scope — only parsing the cert/key paths into
/// `rustls`-ready material lives here).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsConfig {
	pub cert_path: String,
	pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackendConfig {
	pub url: String,
	#[serde(default = "default_weight")]
	pub weight: u32,
}

fn default_weight() -> u32 {
	1
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_ttl_secs")]
	pub ttl_secs: u64,
	#[serde(default)]
	pub swr_secs: u64,
	#[serde(default)]
	pub sie_secs: u64,
	#[serde(default)]
	pub conditional_validation: bool,
	#[serde(default)]
	pub cacheable_methods: Vec<String>,
}

fn default_ttl_secs() -> u64 {
	60
}

impl CacheConfig {
	pub fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl_secs)
	}

	pub fn swr(&self) -> Duration {
		Duration::from_secs(self.swr_secs)
	}

	pub fn sie(&self) -> Duration {
		Duration::from_secs(self.sie_secs)
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub rate: u32,
	#[serde(default = "default_period_ms")]
	pub period_ms: u64,
	#[serde(default)]
	pub burst: u32,
	#[serde(default)]
	pub per_ip: bool,
}

fn default_period_ms() -> u64 {
	1000
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitBreakerConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_failure_threshold")]
	pub consecutive_failures: u32,
	#[serde(default = "default_quarantine_secs")]
	pub quarantine_secs: u64,
}

fn default_failure_threshold() -> u32 {
	5
}

fn default_quarantine_secs() -> u64 {
	30
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleConfig {
	pub id: String,
	pub expression: String,
	pub action: serde_json::Value,
	#[serde(default = "default_true")]
	pub enabled: bool,
}

fn default_true() -> bool {
	true
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RulesConfig {
	#[serde(default)]
	pub request: Vec<RuleConfig>,
	#[serde(default)]
	pub response: Vec<RuleConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphqlSourceConfig {
	pub name: String,
	pub url: String,
	/// Root-operation field ownership (`Query`/`Mutation`/`Subscription` ->
	/// field names) for this source, declared statically rather than
	/// fetched by introspection so building `RouteState` stays pure.
	#[serde(default)]
	pub root_fields: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphqlConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub sources: Vec<GraphqlSourceConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SseConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_ring_capacity")]
	pub ring_capacity: usize,
	#[serde(default)]
	pub reconnect_backoff_ms: u64,
	/// Whether clients may restrict catch-up and live events to one
	/// `event:` type via a `?filter=` query parameter (spec §4.7).
	#[serde(default)]
	pub event_filter_enabled: bool,
}

fn default_ring_capacity() -> usize {
	256
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CustomSlotConfig {
	pub name: String,
	#[serde(default)]
	pub after: Option<String>,
	#[serde(default)]
	pub before: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteConfig {
	pub route_id: String,
	#[serde(default)]
	pub hosts: Vec<String>,
	pub path_pattern: String,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default)]
	pub backends: Vec<BackendConfig>,
	#[serde(default)]
	pub balancer: BalancerKind,
	#[serde(default)]
	pub cache: CacheConfig,
	#[serde(default)]
	pub rate_limit: RateLimitConfig,
	#[serde(default)]
	pub circuit_breaker: CircuitBreakerConfig,
	#[serde(default = "default_coalesce_timeout_ms")]
	pub coalesce_timeout_ms: u64,
	#[serde(default)]
	pub rules: RulesConfig,
	#[serde(default)]
	pub graphql: GraphqlConfig,
	#[serde(default)]
	pub sse: SseConfig,
	#[serde(default)]
	pub custom_slots: Vec<CustomSlotConfig>,
	#[serde(default)]
	pub auth: AuthConfig,
	#[serde(default)]
	pub security: SecurityConfig,
}

fn default_coalesce_timeout_ms() -> u64 {
	5000
}

/// The lower-traffic perimeter policies (spec §4.2's host/IP/geo/WAF/CSRF
/// slots) grouped under one knob since they're rarely tuned per route and
/// mostly ship with sane defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecurityConfig {
	#[serde(default)]
	pub allowed_hosts: Vec<String>,
	#[serde(default)]
	pub trusted_proxies: Vec<String>,
	#[serde(default)]
	pub geo_header: Option<String>,
	#[serde(default)]
	pub geo_blocked: Vec<String>,
	#[serde(default)]
	pub ip_allow_list: Vec<String>,
	#[serde(default)]
	pub ip_block_list: Vec<String>,
	#[serde(default)]
	pub https_redirect: bool,
	#[serde(default)]
	pub waf_enabled: bool,
	#[serde(default)]
	pub bot_detect: bool,
	#[serde(default)]
	pub ai_crawl_detect: bool,
	#[serde(default)]
	pub csrf_enabled: bool,
	#[serde(default)]
	pub nonce_enabled: bool,
	#[serde(default)]
	pub validation_content_types: Vec<String>,
	#[serde(default)]
	pub content_negotiation_types: Vec<String>,
	#[serde(default)]
	pub idempotency_window_secs: Option<u64>,
	#[serde(default)]
	pub body_limit_bytes: Option<u64>,
	#[serde(default)]
	pub bandwidth_max_concurrent: Option<usize>,
	#[serde(default)]
	pub adaptive_concurrency_max_inflight: Option<u32>,
	#[serde(default)]
	pub priority_default: Option<i32>,
	#[serde(default)]
	pub tenant_header: Option<String>,
	#[serde(default)]
	pub timeout_ms: Option<u64>,
	#[serde(default)]
	pub max_retries: Option<u32>,
	#[serde(default)]
	pub response_rejected_statuses: Vec<u16>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
	#[default]
	RoundRobin,
	Weighted,
	ConsistentHash,
	LeastConnections,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub jwks_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebhookConfig {
	pub url: String,
	#[serde(default)]
	pub secret: Option<String>,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_max_backoff_secs")]
	pub max_backoff_secs: u64,
}

fn default_max_retries() -> u32 {
	5
}

fn default_max_backoff_secs() -> u64 {
	60
}

impl Config {
	pub fn from_yaml(text: &str) -> Result<Self, GatewayError> {
		serde_yaml::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))
	}

	pub fn from_json(text: &str) -> Result<Self, GatewayError> {
		serde_json::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))
	}

	/// Structural validation applied before a reload is allowed to proceed
	/// (spec §4.9 step 1: "Policy setup errors abort without touching live
	/// state").
	pub fn validate(&self) -> Result<(), GatewayError> {
		let mut seen = std::collections::HashSet::new();
		for route in &self.routes {
			if !seen.insert(route.route_id.clone()) {
				return Err(GatewayError::Config(format!("duplicate route_id '{}'", route.route_id)));
			}
			if route.path_pattern.is_empty() {
				return Err(GatewayError::Config(format!("route '{}' has an empty path_pattern", route.route_id)));
			}
			if !route.graphql.enabled && route.backends.is_empty() {
				return Err(GatewayError::Config(format!("route '{}' has no backends", route.route_id)));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_yaml() {
		let yaml = r#"
routes:
  - routeId: r1
    pathPattern: /data
    methods: [GET]
    backends:
      - url: http://localhost:9000
"#;
		let cfg = Config::from_yaml(yaml).unwrap();
		assert_eq!(cfg.routes.len(), 1);
		assert_eq!(cfg.routes[0].route_id, "r1");
		assert!(cfg.validate().is_ok());
	}

	#[test]
	fn duplicate_route_ids_fail_validation() {
		let cfg = Config {
			routes: vec![
				RouteConfig {
					route_id: "r1".into(),
					hosts: vec![],
					path_pattern: "/a".into(),
					methods: vec![],
					backends: vec![BackendConfig { url: "http://a".into(), weight: 1 }],
					balancer: BalancerKind::default(),
					cache: CacheConfig::default(),
					rate_limit: RateLimitConfig::default(),
					circuit_breaker: CircuitBreakerConfig::default(),
					coalesce_timeout_ms: 1000,
					rules: RulesConfig::default(),
					graphql: GraphqlConfig::default(),
					sse: SseConfig::default(),
					custom_slots: vec![],
					auth: AuthConfig::default(),
					security: SecurityConfig::default(),
				};
				2
			],
			..Default::default()
		};
		assert!(cfg.validate().is_err());
	}
}
