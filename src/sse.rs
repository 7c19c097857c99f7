//! Server-Sent-Events fan-out hub (spec §4.7): one upstream connection per
//! route, a ring buffer of recent events for catch-up, and per-client
//! channels. Event parsing follows the HTML Living Standard SSE grammar
//! directly (field lines, `id`/`event`/`data`/`retry`, `:` comments,
//! blank-line dispatch) against an arbitrary upstream with N fanned-out
//! clients.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};

#[derive(Clone, Debug, Default)]
pub struct SseEvent {
	pub id: Option<String>,
	pub event: Option<String>,
	pub data: String,
	pub retry: Option<u64>,
	pub raw: bytes::Bytes,
}

/// Parses one SSE frame body per the WHATWG grammar. Comment lines (`:`
/// prefix) are dropped; multi-line `data:` fields join with `\n`.
pub fn parse_event(block: &str) -> Option<SseEvent> {
	if block.trim().is_empty() {
		return None;
	}
	let mut id = None;
	let mut event = None;
	let mut retry = None;
	let mut data_lines = Vec::new();
	for line in block.lines() {
		if line.starts_with(':') || line.is_empty() {
			continue;
		}
		let (field, value) = match line.split_once(':') {
			Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
			None => (line, ""),
		};
		match field {
			"id" => id = Some(value.to_string()),
			"event" => event = Some(value.to_string()),
			"retry" => retry = value.parse().ok(),
			"data" => data_lines.push(value.to_string()),
			_ => {},
		}
	}
	Some(SseEvent {
		id,
		event,
		data: data_lines.join("\n"),
		retry,
		raw: bytes::Bytes::from(block.to_string()),
	})
}

/// Fixed-capacity FIFO that overwrites the oldest entry on wrap (spec §4.7
/// "Ring buffer", §8 round-trip law: after pushing k events into a size-n
/// buffer, `len() == min(k, n)` and `last_event_id()` is the k-th push's
/// id).
pub struct RingBuffer {
	capacity: usize,
	buf: Vec<SseEvent>,
	next_write: usize,
	total_pushed: u64,
}

impl RingBuffer {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			buf: Vec::with_capacity(capacity),
			next_write: 0,
			total_pushed: 0,
		}
	}

	pub fn push(&mut self, event: SseEvent) {
		if self.buf.len() < self.capacity {
			self.buf.push(event);
		} else {
			self.buf[self.next_write] = event;
		}
		self.next_write = (self.next_write + 1) % self.capacity;
		self.total_pushed += 1;
	}

	pub fn len(&self) -> usize {
		self.buf.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buf.is_empty()
	}

	pub fn last_event_id(&self) -> Option<&str> {
		if self.buf.is_empty() {
			return None;
		}
		let last_index = (self.next_write + self.capacity - 1) % self.capacity;
		self.buf[last_index].id.as_deref()
	}

	/// Chronological order, oldest first.
	fn ordered(&self) -> Vec<&SseEvent> {
		if self.buf.len() < self.capacity {
			return self.buf.iter().collect();
		}
		let mut out = Vec::with_capacity(self.capacity);
		for i in 0..self.capacity {
			out.push(&self.buf[(self.next_write + i) % self.capacity]);
		}
		out
	}

	/// Events strictly after `last_id` in chronological order; if `last_id`
	/// isn't found, returns everything buffered (spec §4.7 "EventsSince").
	pub fn events_since(&self, last_id: Option<&str>) -> Vec<SseEvent> {
		let ordered = self.ordered();
		let Some(last_id) = last_id else {
			return ordered.into_iter().cloned().collect();
		};
		match ordered.iter().position(|e| e.id.as_deref() == Some(last_id)) {
			Some(pos) => ordered[pos + 1..].iter().map(|e| (*e).clone()).collect(),
			None => ordered.into_iter().cloned().collect(),
		}
	}
}

#[derive(Clone, Default, Debug)]
pub struct HubStats {
	pub buffer_used: usize,
	pub last_event_id: Option<String>,
	pub connected: bool,
	pub client_count: usize,
}

/// One hub per route with fan-out enabled. The upstream reader task pushes
/// into `ring`; `subscribe` hands a new client a catch-up snapshot plus a
/// receiver for live events. A client whose channel fills (default
/// capacity below) is dropped by `broadcast`'s lagged-receiver semantics: a
/// slow client loses events and resyncs via catch-up, the hub itself never
/// blocks on it.
pub struct SseHub {
	ring: Mutex<RingBuffer>,
	live: broadcast::Sender<SseEvent>,
	connected: std::sync::atomic::AtomicBool,
	client_count: std::sync::atomic::AtomicUsize,
}

const LIVE_CHANNEL_CAPACITY: usize = 256;

impl SseHub {
	pub fn new(ring_capacity: usize) -> Arc<Self> {
		let (tx, _rx) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
		Arc::new(Self {
			ring: Mutex::new(RingBuffer::new(ring_capacity)),
			live: tx,
			connected: std::sync::atomic::AtomicBool::new(false),
			client_count: std::sync::atomic::AtomicUsize::new(0),
		})
	}

	pub fn set_connected(&self, connected: bool) {
		self.connected.store(connected, std::sync::atomic::Ordering::Relaxed);
	}

	pub async fn publish(&self, event: SseEvent) {
		self.ring.lock().await.push(event.clone());
		let _ = self.live.send(event);
	}

	/// Registers a new client: returns the catch-up events (in order) plus
	/// a receiver for subsequent live events. Catch-up is computed and
	/// handed back before the receiver starts observing new sends, so the
	/// client sees catch-up strictly before live events (spec §5
	/// ordering guarantee). `filter`, when set, restricts catch-up to
	/// events whose `event` field matches it; the caller applies the same
	/// filter to the live loop since the broadcast channel is unfiltered.
	pub async fn subscribe(&self, last_event_id: Option<&str>, filter: Option<&str>) -> (Vec<SseEvent>, broadcast::Receiver<SseEvent>) {
		let receiver = self.live.subscribe();
		let mut catchup = self.ring.lock().await.events_since(last_event_id);
		if let Some(filter) = filter {
			catchup.retain(|e| e.event.as_deref() == Some(filter));
		}
		self.client_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		(catchup, receiver)
	}

	pub fn client_disconnected(&self) {
		self.client_count.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
	}

	pub async fn stats(&self) -> HubStats {
		let ring = self.ring.lock().await;
		HubStats {
			buffer_used: ring.len(),
			last_event_id: ring.last_event_id().map(str::to_string),
			connected: self.connected.load(std::sync::atomic::Ordering::Relaxed),
			client_count: self.client_count.load(std::sync::atomic::Ordering::Relaxed),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ev(id: &str) -> SseEvent {
		SseEvent {
			id: Some(id.to_string()),
			event: None,
			data: format!("data-{id}"),
			retry: None,
			raw: bytes::Bytes::new(),
		}
	}

	fn ev_typed(id: &str, event: &str) -> SseEvent {
		SseEvent { event: Some(event.to_string()), ..ev(id) }
	}

	#[test]
	fn ring_buffer_wraps_and_reports_min_len() {
		let mut ring = RingBuffer::new(3);
		for i in 1..=5 {
			ring.push(ev(&i.to_string()));
		}
		assert_eq!(ring.len(), 3);
		assert_eq!(ring.last_event_id(), Some("5"));
	}

	#[test]
	fn events_since_returns_strictly_after() {
		let mut ring = RingBuffer::new(5);
		for i in 1..=3 {
			ring.push(ev(&i.to_string()));
		}
		let since = ring.events_since(Some("1"));
		assert_eq!(since.iter().map(|e| e.id.clone().unwrap()).collect::<Vec<_>>(), vec!["2", "3"]);
	}

	#[test]
	fn events_since_unknown_id_returns_everything() {
		let mut ring = RingBuffer::new(5);
		ring.push(ev("1"));
		ring.push(ev("2"));
		let since = ring.events_since(Some("999"));
		assert_eq!(since.len(), 2);
	}

	#[test]
	fn parses_multiline_data_and_skips_comments() {
		let block = ": heartbeat\nid: 7\nevent: update\ndata: line one\ndata: line two\n";
		let parsed = parse_event(block).unwrap();
		assert_eq!(parsed.id.as_deref(), Some("7"));
		assert_eq!(parsed.event.as_deref(), Some("update"));
		assert_eq!(parsed.data, "line one\nline two");
	}

	#[tokio::test]
	async fn catchup_precedes_live_events() {
		let hub = SseHub::new(10);
		hub.publish(ev("1")).await;
		hub.publish(ev("2")).await;
		let (catchup, mut live) = hub.subscribe(Some("1"), None).await;
		assert_eq!(catchup.iter().map(|e| e.id.clone().unwrap()).collect::<Vec<_>>(), vec!["2"]);
		hub.publish(ev("3")).await;
		let next = live.recv().await.unwrap();
		assert_eq!(next.id.as_deref(), Some("3"));
	}

	#[tokio::test]
	async fn subscribe_filters_catchup_by_event_type() {
		let hub = SseHub::new(10);
		hub.publish(ev_typed("1", "price")).await;
		hub.publish(ev_typed("2", "heartbeat")).await;
		hub.publish(ev_typed("3", "price")).await;
		let (catchup, _live) = hub.subscribe(None, Some("price")).await;
		assert_eq!(catchup.iter().map(|e| e.id.clone().unwrap()).collect::<Vec<_>>(), vec!["1", "3"]);
	}
}
