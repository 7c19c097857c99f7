//! TTL + stale-while-revalidate + stale-if-error cache (spec §4.5). Entries
//! live in a plain `Mutex`-guarded map; a second `Mutex`-guarded map of
//! `AtomicBool` flags gives each cache key a single-flight revalidation
//! lock so only one caller refreshes a stale entry while the rest serve
//! the stale value.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct CacheEntry {
	pub status: u16,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub stored_at: Instant,
	pub ttl: Duration,
	pub etag: Option<String>,
	pub last_modified: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
	Fresh,
	Stale,
	Expired,
}

impl CacheEntry {
	pub fn age(&self) -> Duration {
		Instant::now().saturating_duration_since(self.stored_at)
	}

	/// spec §4.5/§8: fresh while age ≤ TTL; stale while TTL < age ≤ TTL +
	/// max(swr, sie); otherwise expired (eligible for eviction).
	pub fn freshness(&self, swr: Duration, sie: Duration) -> Freshness {
		let age = self.age();
		if age <= self.ttl {
			Freshness::Fresh
		} else if age <= self.ttl + swr.max(sie) {
			Freshness::Stale
		} else {
			Freshness::Expired
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOutcome {
	Hit,
	Stale,
	Miss,
}

impl CacheOutcome {
	pub fn header_value(&self) -> &'static str {
		match self {
			CacheOutcome::Hit => "HIT",
			CacheOutcome::Stale => "STALE",
			CacheOutcome::Miss => "MISS",
		}
	}
}

#[derive(Clone, Copy, Debug)]
pub struct CachePolicy {
	pub ttl: Duration,
	pub swr: Duration,
	pub sie: Duration,
	pub conditional_validation: bool,
	pub max_storable_bytes: u64,
	pub storable_status: &'static [u16],
}

impl Default for CachePolicy {
	fn default() -> Self {
		Self {
			ttl: Duration::from_secs(60),
			swr: Duration::ZERO,
			sie: Duration::ZERO,
			conditional_validation: false,
			max_storable_bytes: 2 * 1024 * 1024,
			storable_status: &[200, 203, 204, 206, 300, 301, 404, 410],
		}
	}
}

/// Canonical fingerprint of method, path, sorted configured key-headers,
/// query string, and (when present) a GraphQL operation fingerprint.
pub fn cache_key(method: &str, path: &str, query: &str, key_headers: &[(&str, &str)], graphql_fingerprint: Option<&str>) -> String {
	let mut headers: Vec<&(&str, &str)> = key_headers.iter().collect();
	headers.sort_by_key(|(k, _)| *k);
	let header_part: String = headers.iter().map(|(k, v)| format!("{k}={v};")).collect();
	match graphql_fingerprint {
		Some(fp) => format!("{method}:{path}?{query}:{header_part}:gql={fp}"),
		None => format!("{method}:{path}?{query}:{header_part}"),
	}
}

/// Whether a mutating method's path prefix invalidates stored entries.
pub fn is_mutating_method(method: &str) -> bool {
	matches!(method, "POST" | "PUT" | "PATCH" | "DELETE")
}

pub fn should_cache(method: &str, cache_bypass: bool, route_cacheable_methods: &[&str]) -> bool {
	route_cacheable_methods.contains(&method) && !cache_bypass
}

struct RevalidationGuard {
	in_flight: Arc<Mutex<()>>,
	started: Arc<AtomicBool>,
}

/// A single route's cache store plus the bookkeeping needed for SWR
/// deduplication (spec §5: "at most one concurrent refresh" per key).
pub struct Cache {
	entries: Mutex<HashMap<String, CacheEntry>>,
	policy: CachePolicy,
	revalidating: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Cache {
	pub fn new(policy: CachePolicy) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			policy,
			revalidating: Mutex::new(HashMap::new()),
		}
	}

	pub async fn get(&self, key: &str) -> Option<CacheEntry> {
		self.entries.lock().await.get(key).cloned()
	}

	pub async fn lookup(&self, key: &str) -> (CacheOutcome, Option<CacheEntry>) {
		match self.get(key).await {
			None => (CacheOutcome::Miss, None),
			Some(entry) => match entry.freshness(self.policy.swr, self.policy.sie) {
				Freshness::Fresh => (CacheOutcome::Hit, Some(entry)),
				Freshness::Stale => (CacheOutcome::Stale, Some(entry)),
				Freshness::Expired => (CacheOutcome::Miss, None),
			},
		}
	}

	/// Returns `true` and marks the key as being revalidated if this call
	/// is the one that should kick off the background refresh; subsequent
	/// callers for the same key get `false` while one is already running.
	pub async fn begin_revalidation(&self, key: &str) -> bool {
		let mut map = self.revalidating.lock().await;
		let flag = map.entry(key.to_string()).or_insert_with(|| Arc::new(AtomicBool::new(false)));
		!flag.swap(true, Ordering::SeqCst)
	}

	pub async fn end_revalidation(&self, key: &str) {
		if let Some(flag) = self.revalidating.lock().await.get(key) {
			flag.store(false, Ordering::SeqCst);
		}
	}

	/// Stores a response if it meets the storage-eligibility rules (status
	/// allow-list, size ceiling, no explicit `no-store` override). Returns
	/// whether it was actually stored.
	pub async fn store(&self, key: &str, mut entry: CacheEntry, cache_ttl_override: Option<Duration>, skip_cache_store: bool, no_store: bool) -> bool {
		if skip_cache_store || no_store {
			return false;
		}
		if !self.policy.storable_status.contains(&entry.status) {
			return false;
		}
		if entry.body.len() as u64 > self.policy.max_storable_bytes {
			return false;
		}
		if let Some(ttl) = cache_ttl_override {
			entry.ttl = ttl;
		} else {
			entry.ttl = self.policy.ttl;
		}
		if self.policy.conditional_validation && entry.etag.is_none() {
			entry.etag = Some(format!("\"{}\"", hex::encode(Sha256::digest(&entry.body))));
		}
		self.entries.lock().await.insert(key.to_string(), entry);
		true
	}

	/// Last-resort fallback when the live backend call fails (spec §4.5
	/// "stale-if-error"): an entry still counts even past what `lookup`
	/// would call `Stale`, as long as it's within `ttl + sie` of having
	/// been stored. Returns `None` outright when the route has no `sie`
	/// budget configured.
	pub async fn stale_if_error_fallback(&self, key: &str) -> Option<CacheEntry> {
		if self.policy.sie.is_zero() {
			return None;
		}
		let entry = self.get(key).await?;
		if entry.age() <= entry.ttl + self.policy.sie { Some(entry) } else { None }
	}

	pub async fn invalidate_prefix(&self, path_prefix: &str) {
		let mut entries = self.entries.lock().await;
		entries.retain(|k, _| !k.starts_with(&format!("POST:{path_prefix}")) && !cache_key_path_has_prefix(k, path_prefix));
	}

	pub fn conditional_matches(entry: &CacheEntry, if_none_match: Option<&str>, if_modified_since: Option<&str>) -> bool {
		if let (Some(etag), Some(inm)) = (&entry.etag, if_none_match) {
			return etag == inm;
		}
		if let (Some(lm), Some(ims)) = (&entry.last_modified, if_modified_since) {
			return lm == ims;
		}
		false
	}
}

fn cache_key_path_has_prefix(key: &str, prefix: &str) -> bool {
	key.split(':').nth(1).map(|p| p.starts_with(prefix)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(status: u16, ttl: Duration) -> CacheEntry {
		CacheEntry {
			status,
			headers: HeaderMap::new(),
			body: Bytes::from_static(b"hello"),
			stored_at: Instant::now(),
			ttl,
			etag: None,
			last_modified: None,
		}
	}

	#[tokio::test]
	async fn miss_then_hit() {
		let cache = Cache::new(CachePolicy::default());
		let key = cache_key("GET", "/data", "", &[], None);
		assert_eq!(cache.lookup(&key).await.0, CacheOutcome::Miss);
		cache.store(&key, entry(200, Duration::from_secs(5)), None, false, false).await;
		assert_eq!(cache.lookup(&key).await.0, CacheOutcome::Hit);
	}

	#[tokio::test]
	async fn stale_within_swr_window() {
		let cache = Cache::new(CachePolicy {
			swr: Duration::from_secs(30),
			..CachePolicy::default()
		});
		let key = "k".to_string();
		let mut e = entry(200, Duration::from_millis(10));
		e.stored_at = Instant::now() - Duration::from_millis(50);
		cache.entries.lock().await.insert(key.clone(), e);
		assert_eq!(cache.lookup(&key).await.0, CacheOutcome::Stale);
	}

	#[tokio::test]
	async fn revalidation_dedup_allows_one_concurrent_refresh() {
		let cache = Cache::new(CachePolicy::default());
		assert!(cache.begin_revalidation("k").await);
		assert!(!cache.begin_revalidation("k").await);
		cache.end_revalidation("k").await;
		assert!(cache.begin_revalidation("k").await);
	}

	#[tokio::test]
	async fn non_storable_status_is_rejected() {
		let cache = Cache::new(CachePolicy::default());
		let stored = cache.store("k", entry(500, Duration::from_secs(5)), None, false, false).await;
		assert!(!stored);
	}

	#[tokio::test]
	async fn cache_ttl_override_wins() {
		let cache = Cache::new(CachePolicy::default());
		cache
			.store("k", entry(200, Duration::from_secs(5)), Some(Duration::from_secs(999)), false, false)
			.await;
		let e = cache.get("k").await.unwrap();
		assert_eq!(e.ttl, Duration::from_secs(999));
	}

	#[tokio::test]
	async fn stale_if_error_serves_entry_within_sie_window() {
		let cache = Cache::new(CachePolicy {
			sie: Duration::from_secs(30),
			..CachePolicy::default()
		});
		let key = "k".to_string();
		let mut e = entry(200, Duration::from_millis(10));
		e.stored_at = Instant::now() - Duration::from_millis(50);
		cache.entries.lock().await.insert(key.clone(), e);
		assert!(cache.stale_if_error_fallback(&key).await.is_some());
	}

	#[tokio::test]
	async fn stale_if_error_returns_none_without_sie_budget() {
		let cache = Cache::new(CachePolicy::default());
		let key = "k".to_string();
		let mut e = entry(200, Duration::from_millis(10));
		e.stored_at = Instant::now() - Duration::from_millis(50);
		cache.entries.lock().await.insert(key.clone(), e);
		assert!(cache.stale_if_error_fallback(&key).await.is_none());
	}

	#[tokio::test]
	async fn stale_if_error_returns_none_past_sie_window() {
		let cache = Cache::new(CachePolicy {
			sie: Duration::from_millis(10),
			..CachePolicy::default()
		});
		let key = "k".to_string();
		let mut e = entry(200, Duration::from_millis(10));
		e.stored_at = Instant::now() - Duration::from_secs(1);
		cache.entries.lock().await.insert(key.clone(), e);
		assert!(cache.stale_if_error_fallback(&key).await.is_none());
	}
}
