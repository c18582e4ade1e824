//! Pending-reply slots keyed by correlation id.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// The waiting side of one pending reply.
#[derive(Debug)]
pub struct AsyncReturn<T> {
	rx: oneshot::Receiver<T>,
}

impl<T> AsyncReturn<T> {
	/// Waits for the reply. `None` means the table was torn down first.
	pub async fn wait(self) -> Option<T> {
		self.rx.await.ok()
	}
}

/// Table of in-flight replies keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable<T> {
	slots: Mutex<HashMap<i32, oneshot::Sender<T>>>,
}

impl<T> PendingTable<T> {
	/// Creates an empty table.
	#[must_use]
	pub fn new() -> Self {
		Self {
			slots: Mutex::new(HashMap::new()),
		}
	}

	/// Registers a slot for `id`, returning the handle to wait on.
	///
	/// A stale slot with the same id is dropped, failing its waiter.
	pub fn register(&self, id: i32) -> AsyncReturn<T> {
		let (tx, rx) = oneshot::channel();
		self.slots.lock().unwrap().insert(id, tx);
		AsyncReturn { rx }
	}

	/// Completes the slot for `id`. Returns false if nobody was waiting.
	pub fn complete(&self, id: i32, value: T) -> bool {
		let Some(tx) = self.slots.lock().unwrap().remove(&id) else {
			return false;
		};
		tx.send(value).is_ok()
	}

	/// Drops every slot, failing all waiters.
	pub fn fail_all(&self) {
		self.slots.lock().unwrap().clear();
	}
}
