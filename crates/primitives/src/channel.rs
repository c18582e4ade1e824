//! Closeable unbounded channel with timeout receives.
//!
//! Senders never block. `terminate` closes the channel: pending and future
//! receives return `None`, and writes are rejected. Receive ordering is
//! FIFO; the channel is meant for a single logical consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Inner<T> {
	tx: mpsc::UnboundedSender<T>,
	rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
	closed: CancellationToken,
}

/// A cheaply cloneable handle to one channel.
#[derive(Debug)]
pub struct Channel<T>(Arc<Inner<T>>);

impl<T> Clone for Channel<T> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

impl<T> Default for Channel<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Channel<T> {
	/// Creates an open channel.
	#[must_use]
	pub fn new() -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self(Arc::new(Inner {
			tx,
			rx: tokio::sync::Mutex::new(rx),
			closed: CancellationToken::new(),
		}))
	}

	/// Enqueues a value. Returns false once the channel is terminated.
	pub fn send(&self, value: T) -> bool {
		if self.0.closed.is_cancelled() {
			return false;
		}
		self.0.tx.send(value).is_ok()
	}

	/// Receives the next value.
	///
	/// `timeout` of `None` waits forever; a zero duration polls. Returns
	/// `None` on timeout or termination.
	pub async fn recv(&self, timeout: Option<Duration>) -> Option<T> {
		if self.0.closed.is_cancelled() {
			return None;
		}
		let mut rx = self.0.rx.lock().await;
		match timeout {
			Some(dur) if dur.is_zero() => rx.try_recv().ok(),
			Some(dur) => tokio::select! {
				got = tokio::time::timeout(dur, rx.recv()) => got.ok().flatten(),
				() = self.0.closed.cancelled() => None,
			},
			None => tokio::select! {
				got = rx.recv() => got,
				() = self.0.closed.cancelled() => None,
			},
		}
	}

	/// Closes the channel; pending receivers return `None`.
	pub fn terminate(&self) {
		self.0.closed.cancel();
	}

	/// True once `terminate` has been called.
	#[must_use]
	pub fn is_terminated(&self) -> bool {
		self.0.closed.is_cancelled()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn fifo_and_timeout() {
		let ch = Channel::new();
		assert!(ch.send(1));
		assert!(ch.send(2));
		assert_eq!(ch.recv(None).await, Some(1));
		assert_eq!(ch.recv(None).await, Some(2));
		assert_eq!(ch.recv(Some(Duration::from_millis(10))).await, None);
		assert_eq!(ch.recv(Some(Duration::ZERO)).await, None);
	}

	#[tokio::test]
	async fn terminate_wakes_pending_receiver() {
		let ch: Channel<u32> = Channel::new();
		let waiter = {
			let ch = ch.clone();
			tokio::spawn(async move { ch.recv(None).await })
		};
		tokio::task::yield_now().await;
		ch.terminate();
		assert_eq!(waiter.await.unwrap(), None);
		assert!(!ch.send(5));
	}
}
