use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use url::Url;

/// A single upstream target (spec §3 "Backend").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Backend {
	pub url: String,
	#[serde(default = "default_weight")]
	pub weight: u32,
	/// Health is tracked out-of-band by the health checker / outlier
	/// ejector, so it lives behind an `Arc<AtomicBool>` rather than the
	/// plain `bool` the wire format uses — cloning a `Backend` must share
	/// the same liveness state.
	#[serde(skip, default = "default_healthy")]
	healthy: Arc<AtomicBool>,
}

fn default_weight() -> u32 {
	1
}

fn default_healthy() -> Arc<AtomicBool> {
	Arc::new(AtomicBool::new(true))
}

impl Backend {
	pub fn new(url: impl Into<String>, weight: u32) -> Self {
		Self {
			url: url.into(),
			weight: weight.max(1),
			healthy: default_healthy(),
		}
	}

	pub fn healthy(&self) -> bool {
		self.healthy.load(Ordering::Relaxed)
	}

	pub fn set_healthy(&self, healthy: bool) {
		self.healthy.store(healthy, Ordering::Relaxed);
	}

	pub fn parsed_url(&self) -> Result<Url, url::ParseError> {
		Url::parse(&self.url)
	}
}

impl PartialEq for Backend {
	fn eq(&self, other: &Self) -> bool {
		self.url == other.url
	}
}

/// An immutable, named group of backends. Route configuration refers to
/// backends either as a literal list or (out of scope here) a discovered
/// service name; `BackendSet` is the literal-list case.
#[derive(Clone, Debug, Default)]
pub struct BackendSet {
	pub backends: Vec<Backend>,
}

impl BackendSet {
	pub fn new(backends: Vec<Backend>) -> Self {
		Self { backends }
	}

	pub fn healthy(&self) -> impl Iterator<Item = &Backend> {
		self.backends.iter().filter(|b| b.healthy())
	}

	pub fn by_url(&self, url: &str) -> Option<&Backend> {
		self.backends.iter().find(|b| b.url == url)
	}

	pub fn is_empty(&self) -> bool {
		self.backends.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unhealthy_backend_excluded_from_healthy_iter() {
		let a = Backend::new("http://a", 1);
		let b = Backend::new("http://b", 1);
		b.set_healthy(false);
		let set = BackendSet::new(vec![a.clone(), b]);
		let healthy: Vec<_> = set.healthy().collect();
		assert_eq!(healthy.len(), 1);
		assert_eq!(healthy[0].url, a.url);
	}
}
