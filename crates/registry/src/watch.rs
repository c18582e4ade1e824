//! Client-side watcher table: path → callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A registered watcher callback.
type Callback = Arc<dyn Fn() + Send + Sync>;

/// Handle identifying one registered callback.
#[derive(Debug)]
pub struct WatcherHandle {
	key: String,
	id: u64,
}

/// Path-keyed callback registry.
///
/// Callbacks are invoked outside the table lock, so a callback may register
/// or cancel watchers itself.
#[derive(Default)]
pub struct WatcherTable {
	inner: Mutex<HashMap<String, Vec<(u64, Callback)>>>,
	next_id: AtomicU64,
}

impl std::fmt::Debug for WatcherTable {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = self.inner.lock().unwrap();
		f.debug_struct("WatcherTable")
			.field("keys", &inner.len())
			.finish()
	}
}

impl WatcherTable {
	/// Creates an empty table.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `callback` under `key`.
	pub fn insert(&self, key: &str, callback: Callback) -> WatcherHandle {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner
			.lock()
			.unwrap()
			.entry(key.to_string())
			.or_default()
			.push((id, callback));
		WatcherHandle {
			key: key.to_string(),
			id,
		}
	}

	/// Removes the callback named by `handle`.
	pub fn erase(&self, handle: WatcherHandle) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(list) = inner.get_mut(&handle.key) {
			list.retain(|(id, _)| *id != handle.id);
			if list.is_empty() {
				inner.remove(&handle.key);
			}
		}
	}

	/// Invokes every callback registered exactly under `key`.
	pub fn invoke(&self, key: &str) {
		let callbacks: Vec<Callback> = {
			let inner = self.inner.lock().unwrap();
			match inner.get(key) {
				Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
				None => return,
			}
		};
		for cb in callbacks {
			cb();
		}
	}

	/// Invokes callbacks for every prefix of `path`, shortest first: a
	/// change at `/a/b/c` fires watchers on `/a`, `/a/b` and `/a/b/c`.
	pub fn invoke_prefixes(&self, path: &str) {
		let mut cur = String::new();
		for seg in path.split('/').filter(|s| !s.is_empty()) {
			cur.push('/');
			cur.push_str(seg);
			self.invoke(&cur);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	#[test]
	fn prefix_invocation_order() {
		let table = WatcherTable::new();
		let hits = Arc::new(AtomicUsize::new(0));
		for key in ["/a", "/a/b", "/a/b/c", "/unrelated"] {
			let hits = hits.clone();
			let _keep = table.insert(
				key,
				Arc::new(move || {
					hits.fetch_add(1, Ordering::SeqCst);
				}),
			);
		}
		table.invoke_prefixes("/a/b/c");
		assert_eq!(hits.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn erase_stops_invocation() {
		let table = WatcherTable::new();
		let hits = Arc::new(AtomicUsize::new(0));
		let handle = {
			let hits = hits.clone();
			table.insert(
				"/x",
				Arc::new(move || {
					hits.fetch_add(1, Ordering::SeqCst);
				}),
			)
		};
		table.erase(handle);
		table.invoke("/x");
		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}
}
