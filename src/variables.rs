use std::collections::HashMap;
use std::time::Instant;

use httpgate_core::Pool;

/// One bit per skippable policy (spec §4.3 `skip_*` actions). Stored as a
/// `u16` bitset rather than a `HashSet` so testing/setting a flag on the hot
/// path is a single instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipFlags(u16);

macro_rules! skip_flags {
	($($name:ident = $bit:expr),* $(,)?) => {
		impl SkipFlags {
			$(
				pub const $name: SkipFlags = SkipFlags(1 << $bit);
			)*
		}
	};
}

skip_flags! {
	AUTH = 0,
	RATE_LIMIT = 1,
	THROTTLE = 2,
	CIRCUIT_BREAKER = 3,
	WAF = 4,
	VALIDATION = 5,
	COMPRESSION = 6,
	ADAPTIVE_CONCURRENCY = 7,
	BODY_LIMIT = 8,
	MIRROR = 9,
	ACCESS_LOG = 10,
	CACHE_STORE = 11,
}

impl SkipFlags {
	pub fn set(&mut self, flag: SkipFlags) {
		self.0 |= flag.0;
	}

	pub fn contains(&self, flag: SkipFlags) -> bool {
		self.0 & flag.0 != 0
	}

	pub fn clear(&mut self) {
		self.0 = 0;
	}
}

/// Per-request fields that replace a policy's configured value for this one
/// request (spec §3 "Overrides"). Lazily attached to the `VariableContext`
/// on first write, per spec wording ("lazy-init Overrides struct").
#[derive(Clone, Debug, Default)]
pub struct Overrides {
	pub rate_limit_tier: Option<String>,
	pub timeout_override: Option<std::time::Duration>,
	pub priority_override: Option<i32>,
	pub bandwidth_override: Option<u64>,
	pub body_limit_override: Option<u64>,
	pub switch_backend: Option<String>,
	pub cache_ttl_override: Option<std::time::Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct Identity {
	pub client_id: Option<String>,
	pub auth_type: Option<String>,
	pub claims: HashMap<String, serde_json::Value>,
}

/// Per-request scratch space, acquired from a `Pool` at ingress and released
/// exactly once at completion (spec §3 "VariableContext", §5 "Pooling").
///
/// All collection fields are cleared (not reallocated) by `reset()` so a
/// pooled context reuses its capacity across requests.
pub struct VariableContext {
	pub route_id: Option<String>,
	pub request_id: String,
	pub tenant_id: Option<String>,
	pub path_params: HashMap<String, String>,
	pub identity: Identity,
	pub custom: HashMap<String, serde_json::Value>,
	pub skip_flags: SkipFlags,
	pub overrides: Option<Overrides>,
	pub traffic_group: Option<String>,
	pub upstream_addr: Option<String>,
	pub start_time: Option<Instant>,
}

impl Default for VariableContext {
	fn default() -> Self {
		Self {
			route_id: None,
			request_id: String::new(),
			tenant_id: None,
			path_params: HashMap::new(),
			identity: Identity::default(),
			custom: HashMap::new(),
			skip_flags: SkipFlags::default(),
			overrides: None,
			traffic_group: None,
			upstream_addr: None,
			start_time: None,
		}
	}
}

impl VariableContext {
	/// Returns a context to its post-acquire state, emptying maps without
	/// releasing their backing allocation.
	pub fn reset(&mut self) {
		self.route_id = None;
		self.request_id.clear();
		self.tenant_id = None;
		self.path_params.clear();
		self.identity.client_id = None;
		self.identity.auth_type = None;
		self.identity.claims.clear();
		self.custom.clear();
		self.skip_flags.clear();
		self.overrides = None;
		self.traffic_group = None;
		self.upstream_addr = None;
		self.start_time = None;
	}

	/// Lazily initializes `overrides` and returns a mutable reference so
	/// override actions don't pay for an `Overrides` allocation on requests
	/// that never set one.
	pub fn overrides_mut(&mut self) -> &mut Overrides {
		self.overrides.get_or_insert_with(Overrides::default)
	}

	pub fn custom_merge(&mut self, values: HashMap<String, serde_json::Value>) {
		self.custom.extend(values);
	}
}

/// Acquires `VariableContext`s for each inbound request. A single pool is
/// shared by every listener; `acquire`/`release` are the only crossing
/// points, backed by a small free-list guarded by a mutex
/// (`httpgate_core::Pool`).
pub type VariableContextPool = Pool<Box<VariableContext>>;

pub fn new_variable_context_pool() -> VariableContextPool {
	Pool::new(|| Box::new(VariableContext::default()))
}

/// RAII guard returned by `acquire_context`; releases the context back to
/// the pool on drop so call sites can't forget to release it, even when a
/// handler returns early via `?`.
pub struct VariableContextGuard<'a> {
	pool: &'a VariableContextPool,
	ctx: Option<Box<VariableContext>>,
}

impl<'a> VariableContextGuard<'a> {
	pub fn acquire(pool: &'a VariableContextPool) -> Self {
		let mut ctx = pool.acquire();
		ctx.reset();
		Self { pool, ctx: Some(ctx) }
	}
}

impl std::ops::Deref for VariableContextGuard<'_> {
	type Target = VariableContext;
	fn deref(&self) -> &VariableContext {
		self.ctx.as_ref().expect("context already released")
	}
}

impl std::ops::DerefMut for VariableContextGuard<'_> {
	fn deref_mut(&mut self) -> &mut VariableContext {
		self.ctx.as_mut().expect("context already released")
	}
}

impl Drop for VariableContextGuard<'_> {
	fn drop(&mut self) {
		if let Some(ctx) = self.ctx.take() {
			self.pool.release(ctx);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn skip_flags_set_and_contains() {
		let mut flags = SkipFlags::default();
		assert!(!flags.contains(SkipFlags::AUTH));
		flags.set(SkipFlags::AUTH);
		flags.set(SkipFlags::WAF);
		assert!(flags.contains(SkipFlags::AUTH));
		assert!(flags.contains(SkipFlags::WAF));
		assert!(!flags.contains(SkipFlags::RATE_LIMIT));
	}

	#[test]
	fn guard_releases_and_resets_on_drop() {
		let pool = new_variable_context_pool();
		{
			let mut guard = VariableContextGuard::acquire(&pool);
			guard.route_id = Some("r1".into());
			guard.custom.insert("k".into(), serde_json::json!(1));
		}
		let reused = pool.acquire();
		assert!(reused.route_id.is_none());
		assert!(reused.custom.is_empty());
	}

	#[test]
	fn overrides_lazily_initialized() {
		let mut ctx = VariableContext::default();
		assert!(ctx.overrides.is_none());
		ctx.overrides_mut().priority_override = Some(5);
		assert_eq!(ctx.overrides.as_ref().unwrap().priority_override, Some(5));
	}
}
