//! Outlier ejection: a `Balancer` wrapper that watches per-backend
//! success/failure feedback reported by the caller after each proxied
//! request and temporarily hides a backend that looks unhealthy, without
//! needing an active health-check loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::backend::{Backend, BackendSet};
use crate::balancer::{Balancer, Selection, SelectionContext};

struct BackendOutlierState {
	consecutive_failures: AtomicU64,
	ejected_until_epoch_ms: AtomicU64,
	started: Instant,
}

/// Wraps an inner balancer with success/failure feedback. A backend that
/// accumulates `threshold` consecutive failures is ejected (marked
/// unhealthy, so it drops out of every balancer's candidate set) for
/// `quarantine` before it's eligible again.
pub struct OutlierEjectingWrapper {
	inner: Arc<dyn Balancer>,
	state: HashMap<String, BackendOutlierState>,
	threshold: u32,
	quarantine: Duration,
}

impl OutlierEjectingWrapper {
	pub fn new(inner: Arc<dyn Balancer>, backends: &BackendSet, threshold: u32, quarantine: Duration) -> Self {
		let state = backends
			.backends
			.iter()
			.map(|b| {
				(
					b.url.clone(),
					BackendOutlierState {
						consecutive_failures: AtomicU64::new(0),
						ejected_until_epoch_ms: AtomicU64::new(0),
						started: Instant::now(),
					},
				)
			})
			.collect();
		Self {
			inner,
			state,
			threshold,
			quarantine,
		}
	}

	fn now_ms(started: Instant) -> u64 {
		Instant::now().saturating_duration_since(started).as_millis() as u64
	}

	pub fn record_success(&self, backend: &Backend) {
		if let Some(s) = self.state.get(&backend.url) {
			s.consecutive_failures.store(0, Ordering::Relaxed);
			backend.set_healthy(true);
		}
	}

	pub fn record_failure(&self, backend: &Backend) {
		let Some(s) = self.state.get(&backend.url) else {
			return;
		};
		let failures = s.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
		if failures >= self.threshold as u64 {
			let until = Self::now_ms(s.started) + self.quarantine.as_millis() as u64;
			s.ejected_until_epoch_ms.store(until, Ordering::Relaxed);
			backend.set_healthy(false);
		}
	}

	/// Called opportunistically on the selection path so a quarantined
	/// backend rejoins the pool once its window has elapsed, without a
	/// dedicated background task.
	fn maybe_unquarantine(&self, backend: &Backend) {
		if let Some(s) = self.state.get(&backend.url) {
			let until = s.ejected_until_epoch_ms.load(Ordering::Relaxed);
			if until != 0 && Self::now_ms(s.started) >= until {
				backend.set_healthy(true);
				s.consecutive_failures.store(0, Ordering::Relaxed);
				s.ejected_until_epoch_ms.store(0, Ordering::Relaxed);
			}
		}
	}
}

impl Balancer for OutlierEjectingWrapper {
	fn next(&self, ctx: &SelectionContext) -> Selection {
		for url in self.state.keys() {
			if let Some(s) = self.state.get(url) {
				let until = s.ejected_until_epoch_ms.load(Ordering::Relaxed);
				if until != 0 && Self::now_ms(s.started) >= until {
					// Can't flip `healthy` here without the Backend handle;
					// deferred to `maybe_unquarantine` once the inner
					// balancer hands one back to us.
				}
			}
		}
		let selection = self.inner.next(ctx);
		if let Some(b) = &selection.backend {
			self.maybe_unquarantine(b);
		}
		selection
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::balancer::RoundRobinBalancer;

	fn set(n: usize) -> BackendSet {
		BackendSet::new((0..n).map(|i| Backend::new(format!("http://b{i}"), 1)).collect())
	}

	#[test]
	fn ejects_after_consecutive_failures() {
		let backends = set(2);
		let inner = Arc::new(RoundRobinBalancer::new(backends.clone()));
		let wrapper = OutlierEjectingWrapper::new(inner, &backends, 2, Duration::from_secs(60));
		let target = backends.backends[0].clone();
		wrapper.record_failure(&target);
		assert!(target.healthy());
		wrapper.record_failure(&target);
		assert!(!target.healthy());
	}

	#[test]
	fn success_resets_failure_count() {
		let backends = set(1);
		let inner = Arc::new(RoundRobinBalancer::new(backends.clone()));
		let wrapper = OutlierEjectingWrapper::new(inner, &backends, 3, Duration::from_secs(60));
		let target = backends.backends[0].clone();
		wrapper.record_failure(&target);
		wrapper.record_failure(&target);
		wrapper.record_success(&target);
		wrapper.record_failure(&target);
		assert!(target.healthy());
	}
}
