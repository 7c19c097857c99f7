use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::backend::{Backend, BackendSet};

/// Everything a specialised balancer might need to read off the inbound
/// request; most balancers ignore most of these fields. Fields are borrowed
/// so callers don't need to allocate per request.
#[derive(Default, Clone, Copy)]
pub struct SelectionContext<'a> {
	/// Stable per-client key for hash-based / sticky selection (client IP,
	/// a header value, ...).
	pub client_key: Option<&'a str>,
	/// Value of the configured version header or path parameter.
	pub version_token: Option<&'a str>,
	/// Value of the session-affinity cookie, if the client sent one.
	pub affinity_cookie: Option<&'a str>,
	/// VariableContext.TenantID.
	pub tenant_id: Option<&'a str>,
	/// VariableContext.TrafficGroup, as set by a `group()` rule action.
	pub traffic_group: Option<&'a str>,
}

/// Result of a selection: the backend (if any healthy backend was
/// available) plus any affinity cookie the caller should stamp onto the
/// response, a side channel `SessionAffinityBalancer` needs to hand its
/// caller a fresh cookie value.
pub struct Selection {
	pub backend: Option<Backend>,
	pub set_affinity_cookie: Option<String>,
}

impl Selection {
	fn just(backend: Option<Backend>) -> Self {
		Self {
			backend,
			set_affinity_cookie: None,
		}
	}
}

pub trait Balancer: Send + Sync {
	fn next(&self, ctx: &SelectionContext) -> Selection;
}

/// Atomically-incremented round robin over the healthy subset.
pub struct RoundRobinBalancer {
	backends: BackendSet,
	cursor: AtomicUsize,
}

impl RoundRobinBalancer {
	pub fn new(backends: BackendSet) -> Self {
		Self {
			backends,
			cursor: AtomicUsize::new(0),
		}
	}
}

impl Balancer for RoundRobinBalancer {
	fn next(&self, _ctx: &SelectionContext) -> Selection {
		let healthy: Vec<&Backend> = self.backends.healthy().collect();
		if healthy.is_empty() {
			return Selection::just(None);
		}
		let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
		Selection::just(Some(healthy[idx].clone()))
	}
}

/// Weight-proportional random selection. `groups` lets a route split
/// traffic by `VariableContext.TrafficGroup` (canary / A-B / blue-green);
/// a request whose group isn't known falls back to the default set.
pub struct WeightedBalancer {
	default_set: BackendSet,
	groups: HashMap<String, BackendSet>,
}

impl WeightedBalancer {
	pub fn new(default_set: BackendSet, groups: HashMap<String, BackendSet>) -> Self {
		Self {
			default_set,
			groups,
		}
	}

	fn pick(set: &BackendSet) -> Option<Backend> {
		let healthy: Vec<&Backend> = set.healthy().collect();
		if healthy.is_empty() {
			return None;
		}
		let total: u64 = healthy.iter().map(|b| b.weight as u64).sum();
		if total == 0 {
			return None;
		}
		let mut roll = rand::rng().random_range(0..total);
		for b in &healthy {
			if roll < b.weight as u64 {
				return Some((*b).clone());
			}
			roll -= b.weight as u64;
		}
		healthy.last().map(|b| (*b).clone())
	}
}

impl Balancer for WeightedBalancer {
	fn next(&self, ctx: &SelectionContext) -> Selection {
		let set = ctx
			.traffic_group
			.and_then(|g| self.groups.get(g))
			.unwrap_or(&self.default_set);
		Selection::just(Self::pick(set))
	}
}

/// A simple hash ring with a fixed number of virtual nodes per backend.
/// Rebuilt whenever backends change (cheap at route-reload granularity;
/// never mutated on the hot path).
pub struct ConsistentHashBalancer {
	ring: Vec<(u64, Backend)>,
}

const VIRTUAL_NODES_PER_BACKEND: u32 = 64;

fn fnv1a(bytes: &[u8]) -> u64 {
	let mut hash: u64 = 0xcbf29ce484222325;
	for b in bytes {
		hash ^= *b as u64;
		hash = hash.wrapping_mul(0x100000001b3);
	}
	hash
}

impl ConsistentHashBalancer {
	pub fn new(backends: BackendSet) -> Self {
		let mut ring = Vec::new();
		for b in &backends.backends {
			for vnode in 0..VIRTUAL_NODES_PER_BACKEND {
				let key = format!("{}#{vnode}", b.url);
				ring.push((fnv1a(key.as_bytes()), b.clone()));
			}
		}
		ring.sort_by_key(|(h, _)| *h);
		Self { ring }
	}

	fn pick(&self, key: &str) -> Option<Backend> {
		if self.ring.is_empty() {
			return None;
		}
		let h = fnv1a(key.as_bytes());
		let start = self.ring.partition_point(|(rh, _)| *rh < h);
		// Walk forward from the ring position, wrapping, until we find a
		// healthy backend.
		for i in 0..self.ring.len() {
			let (_, backend) = &self.ring[(start + i) % self.ring.len()];
			if backend.healthy() {
				return Some(backend.clone());
			}
		}
		None
	}
}

impl Balancer for ConsistentHashBalancer {
	fn next(&self, ctx: &SelectionContext) -> Selection {
		let key = ctx.client_key.unwrap_or("");
		Selection::just(self.pick(key))
	}
}

/// Tracks an active-connection counter per backend and always hands out the
/// least-loaded healthy one. `release` must be called when the request
/// finishes so the counter doesn't monotonically grow.
pub struct LeastConnectionsBalancer {
	counters: Vec<(Backend, AtomicUsize)>,
}

impl LeastConnectionsBalancer {
	pub fn new(backends: BackendSet) -> Self {
		let counters = backends
			.backends
			.into_iter()
			.map(|b| (b, AtomicUsize::new(0)))
			.collect();
		Self { counters }
	}

	pub fn release(&self, backend: &Backend) {
		if let Some((_, counter)) = self.counters.iter().find(|(b, _)| b == backend) {
			counter.fetch_sub(1, Ordering::Relaxed);
		}
	}
}

impl Balancer for LeastConnectionsBalancer {
	fn next(&self, _ctx: &SelectionContext) -> Selection {
		let pick = self
			.counters
			.iter()
			.filter(|(b, _)| b.healthy())
			.min_by_key(|(_, c)| c.load(Ordering::Relaxed));
		match pick {
			Some((backend, counter)) => {
				counter.fetch_add(1, Ordering::Relaxed);
				Selection::just(Some(backend.clone()))
			},
			None => Selection::just(None),
		}
	}
}

/// Routes by a version token read from a header or path parameter; falls
/// back to `default_version` when the token is absent or unknown.
pub struct VersionedBalancer {
	versions: HashMap<String, BackendSet>,
	default_version: String,
}

impl VersionedBalancer {
	pub fn new(versions: HashMap<String, BackendSet>, default_version: String) -> Self {
		Self {
			versions,
			default_version,
		}
	}
}

impl Balancer for VersionedBalancer {
	fn next(&self, ctx: &SelectionContext) -> Selection {
		let version = ctx.version_token.unwrap_or(&self.default_version);
		let set = self
			.versions
			.get(version)
			.or_else(|| self.versions.get(&self.default_version));
		let Some(set) = set else {
			return Selection::just(None);
		};
		Selection::just(set.healthy().next().cloned())
	}
}

/// Reads the affinity cookie; if it names a still-healthy backend, pins to
/// it. Otherwise falls back to `inner` and asks the caller to stamp a fresh
/// cookie naming whatever `inner` picked.
pub struct SessionAffinityBalancer {
	backends: BackendSet,
	inner: Arc<dyn Balancer>,
}

impl SessionAffinityBalancer {
	pub fn new(backends: BackendSet, inner: Arc<dyn Balancer>) -> Self {
		Self { backends, inner }
	}
}

impl Balancer for SessionAffinityBalancer {
	fn next(&self, ctx: &SelectionContext) -> Selection {
		if let Some(cookie) = ctx.affinity_cookie {
			if let Some(backend) = self.backends.by_url(cookie) {
				if backend.healthy() {
					return Selection::just(Some(backend.clone()));
				}
			}
		}
		let mut selection = self.inner.next(ctx);
		if let Some(backend) = &selection.backend {
			selection.set_affinity_cookie = Some(backend.url.clone());
		}
		selection
	}
}

/// Selects an inner balancer by tenant ID, falling back to `default` when
/// the tenant has no dedicated pool.
pub struct TenantAwareBalancer {
	by_tenant: HashMap<String, Arc<dyn Balancer>>,
	default: Arc<dyn Balancer>,
}

impl TenantAwareBalancer {
	pub fn new(by_tenant: HashMap<String, Arc<dyn Balancer>>, default: Arc<dyn Balancer>) -> Self {
		Self { by_tenant, default }
	}
}

impl Balancer for TenantAwareBalancer {
	fn next(&self, ctx: &SelectionContext) -> Selection {
		let balancer = ctx
			.tenant_id
			.and_then(|t| self.by_tenant.get(t))
			.unwrap_or(&self.default);
		balancer.next(ctx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn set(n: usize) -> BackendSet {
		BackendSet::new((0..n).map(|i| Backend::new(format!("http://b{i}"), 1)).collect())
	}

	#[test]
	fn round_robin_cycles() {
		let lb = RoundRobinBalancer::new(set(3));
		let ctx = SelectionContext::default();
		let picks: Vec<_> = (0..6)
			.map(|_| lb.next(&ctx).backend.unwrap().url)
			.collect();
		assert_eq!(picks, vec!["http://b0", "http://b1", "http://b2", "http://b0", "http://b1", "http://b2"]);
	}

	#[test]
	fn round_robin_skips_unhealthy() {
		let backends = set(2);
		backends.backends[0].set_healthy(false);
		let lb = RoundRobinBalancer::new(backends);
		let ctx = SelectionContext::default();
		for _ in 0..4 {
			assert_eq!(lb.next(&ctx).backend.unwrap().url, "http://b1");
		}
	}

	#[test]
	fn consistent_hash_is_stable_for_same_key() {
		let lb = ConsistentHashBalancer::new(set(8));
		let ctx = SelectionContext {
			client_key: Some("user-42"),
			..Default::default()
		};
		let first = lb.next(&ctx).backend.unwrap().url;
		for _ in 0..10 {
			assert_eq!(lb.next(&ctx).backend.unwrap().url, first);
		}
	}

	#[test]
	fn least_connections_picks_idle_backend() {
		let lb = LeastConnectionsBalancer::new(set(2));
		let ctx = SelectionContext::default();
		let first = lb.next(&ctx).backend.unwrap();
		let second = lb.next(&ctx).backend.unwrap();
		assert_ne!(first.url, second.url);
		lb.release(&first);
		let third = lb.next(&ctx).backend.unwrap();
		assert_eq!(third.url, first.url);
	}

	#[test]
	fn session_affinity_sticks_to_known_backend() {
		let backends = set(2);
		let inner = Arc::new(RoundRobinBalancer::new(backends.clone()));
		let lb = SessionAffinityBalancer::new(backends, inner);
		let ctx = SelectionContext {
			affinity_cookie: Some("http://b1"),
			..Default::default()
		};
		let sel = lb.next(&ctx);
		assert_eq!(sel.backend.unwrap().url, "http://b1");
		assert!(sel.set_affinity_cookie.is_none());
	}

	#[test]
	fn session_affinity_falls_back_and_stamps_cookie() {
		let backends = set(2);
		let inner = Arc::new(RoundRobinBalancer::new(backends.clone()));
		let lb = SessionAffinityBalancer::new(backends, inner);
		let ctx = SelectionContext::default();
		let sel = lb.next(&ctx);
		assert!(sel.backend.is_some());
		assert_eq!(sel.set_affinity_cookie, Some(sel.backend.unwrap().url));
	}

}
