//! Version-counting condition watcher.
//!
//! `notify` bumps a version; `wait_until` re-evaluates a predicate whenever
//! the version changes. The check-then-wait ordering guarantees a
//! notification between the predicate returning false and the wait cannot
//! be missed.

use tokio::sync::watch;

/// A notify/re-check rendezvous point.
#[derive(Debug)]
pub struct AsyncWatcher {
	tx: watch::Sender<u64>,
}

impl Default for AsyncWatcher {
	fn default() -> Self {
		Self::new()
	}
}

impl AsyncWatcher {
	/// Creates a watcher at version zero.
	#[must_use]
	pub fn new() -> Self {
		let (tx, _) = watch::channel(0);
		Self { tx }
	}

	/// Bumps the version and wakes every waiter.
	pub fn notify(&self) {
		self.tx.send_modify(|v| *v = v.wrapping_add(1));
	}

	/// The current version. Read it before checking a condition, then pass
	/// it to [`AsyncWatcher::wait_change`] so a concurrent notify is never
	/// missed.
	#[must_use]
	pub fn version(&self) -> u64 {
		*self.tx.borrow()
	}

	/// Waits until the version differs from `seen`.
	pub async fn wait_change(&self, seen: u64) {
		let mut rx = self.tx.subscribe();
		loop {
			if *rx.borrow_and_update() != seen {
				return;
			}
			if rx.changed().await.is_err() {
				return;
			}
		}
	}

	/// Waits until `pred` returns true, re-evaluating after every notify.
	pub async fn wait_until<F, Fut>(&self, mut pred: F)
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = bool>,
	{
		let mut rx = self.tx.subscribe();
		loop {
			let _ = rx.borrow_and_update();
			if pred().await {
				return;
			}
			// The sender lives in self, so this cannot fail while we wait.
			if rx.changed().await.is_err() {
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	use super::*;

	#[tokio::test(flavor = "multi_thread")]
	async fn wait_until_sees_notify() {
		let watcher = Arc::new(AsyncWatcher::new());
		let counter = Arc::new(AtomicUsize::new(0));

		let waiter = {
			let watcher = watcher.clone();
			let counter = counter.clone();
			tokio::spawn(async move {
				watcher
					.wait_until(async || counter.load(Ordering::SeqCst) >= 3)
					.await;
			})
		};

		for _ in 0..3 {
			counter.fetch_add(1, Ordering::SeqCst);
			watcher.notify();
			tokio::task::yield_now().await;
		}
		waiter.await.unwrap();
	}

	#[tokio::test]
	async fn immediate_predicate_returns_without_notify() {
		let watcher = AsyncWatcher::new();
		watcher.wait_until(async || true).await;
	}
}
