use std::sync::Mutex;

/// A tiny fixed-growth object pool. `VariableContext`, `RequestEnv` and
/// `ResponseEnv` are acquired from one of these at ingress and returned at
/// egress; `clear()` empties their maps without releasing capacity so the
/// next acquire reuses the allocation (spec §5 "Pooling").
pub struct Pool<T> {
	free: Mutex<Vec<T>>,
	new_item: fn() -> T,
}

impl<T> Pool<T> {
	pub fn new(new_item: fn() -> T) -> Self {
		Self {
			free: Mutex::new(Vec::new()),
			new_item,
		}
	}

	/// Acquire an item, reusing a released one when available.
	pub fn acquire(&self) -> T {
		self
			.free
			.lock()
			.expect("pool mutex poisoned")
			.pop()
			.unwrap_or_else(self.new_item)
	}

	/// Return an item to the pool for reuse. Callers are responsible for
	/// clearing any per-request state before releasing.
	pub fn release(&self, item: T) {
		self.free.lock().expect("pool mutex poisoned").push(item);
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.free.lock().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reuses_released_items() {
		let pool: Pool<Vec<u8>> = Pool::new(Vec::new);
		let mut a = pool.acquire();
		a.push(1);
		a.clear();
		pool.release(a);
		assert_eq!(pool.len(), 1);
		let b = pool.acquire();
		assert!(b.is_empty());
		assert_eq!(pool.len(), 0);
	}
}
