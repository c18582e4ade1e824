//! The process-internal representation of a remote peer's connection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lattice_proto::{CommInfo, CommRank, Message};
use tokio::sync::mpsc;

/// No socket attached; dialing is allowed.
pub(crate) const STATE_DISCONNECT: u8 = 1;
/// A socket is attached and its writer task is running.
pub(crate) const STATE_CONNECT: u8 = 2;
/// The last send or receive failed; reconnect only after the cool-down.
pub(crate) const STATE_EPIPE: u8 = 4;

/// How long an EPIPE front-end stays ineligible for reconnect.
const EPIPE_COOLDOWN: Duration = Duration::from_secs(10);

/// One remote peer. The context's routing maps hold the only strong
/// references; everyone else borrows through them under the routing lock
/// or keeps a temporary clone across a send.
#[derive(Debug)]
pub(crate) struct FrontEnd {
	pub(crate) info: CommInfo,
	/// True when this process dials the peer (and re-dials on break);
	/// false for accepted connections, which the remote re-establishes.
	pub(crate) is_client_socket: bool,
	state: AtomicU8,
	epipe_at: Mutex<Option<Instant>>,
	sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
	tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
	/// Serializes concurrent dial attempts.
	pub(crate) connect_mu: tokio::sync::Mutex<()>,
}

impl FrontEnd {
	pub(crate) fn new(info: CommInfo, is_client_socket: bool) -> Self {
		Self {
			info,
			is_client_socket,
			state: AtomicU8::new(STATE_DISCONNECT),
			epipe_at: Mutex::new(None),
			sender: Mutex::new(None),
			tasks: Mutex::new(Vec::new()),
			connect_mu: tokio::sync::Mutex::new(()),
		}
	}

	pub(crate) fn rank(&self) -> CommRank {
		self.info.global_rank
	}

	pub(crate) fn state(&self) -> u8 {
		self.state.load(Ordering::Acquire)
	}

	pub(crate) fn is_connected(&self) -> bool {
		self.state() & STATE_CONNECT != 0
	}

	/// False while the front-end is in its post-EPIPE cool-down.
	pub(crate) fn available(&self) -> bool {
		if self.state() & STATE_EPIPE == 0 {
			return true;
		}
		let epipe_at = self.epipe_at.lock().unwrap();
		epipe_at.is_none_or(|at| at.elapsed() > EPIPE_COOLDOWN)
	}

	/// Installs a live socket's outbound queue.
	pub(crate) fn attach(&self, tx: mpsc::UnboundedSender<Message>) {
		*self.sender.lock().unwrap() = Some(tx);
		self.state.store(STATE_CONNECT, Ordering::Release);
	}

	/// Registers the socket's I/O tasks for teardown. If the front-end
	/// already broke between attach and spawn, the tasks die here.
	pub(crate) fn add_tasks(&self, tasks: Vec<tokio::task::JoinHandle<()>>) {
		if self.state() & STATE_CONNECT == 0 {
			for task in tasks {
				task.abort();
			}
			return;
		}
		self.tasks.lock().unwrap().extend(tasks);
	}

	/// Enqueues a message for the writer task. On failure the message is
	/// handed back so the caller can requeue or drop it.
	pub(crate) fn send(&self, msg: Message) -> Result<(), Message> {
		let sender = self.sender.lock().unwrap();
		match sender.as_ref() {
			Some(tx) => tx.send(msg).map_err(|e| e.0),
			None => Err(msg),
		}
	}

	/// Marks the connection broken and starts the reconnect cool-down.
	pub(crate) fn mark_epipe(&self) {
		*self.epipe_at.lock().unwrap() = Some(Instant::now());
		self.state
			.store(STATE_EPIPE | STATE_DISCONNECT, Ordering::Release);
		self.teardown();
	}

	/// Drops the outbound queue and stops the I/O tasks.
	pub(crate) fn teardown(&self) {
		*self.sender.lock().unwrap() = None;
		let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
		for task in tasks {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn front(is_client: bool) -> FrontEnd {
		FrontEnd::new(
			CommInfo {
				global_rank: 1,
				endpoint: "127.0.0.1:1".to_string(),
			},
			is_client,
		)
	}

	#[test]
	fn send_without_socket_returns_message() {
		let f = front(true);
		assert!(f.send(Message::default()).is_err());
		assert!(!f.is_connected());
	}

	#[tokio::test]
	async fn epipe_starts_cooldown() {
		let f = front(true);
		let (tx, _rx) = mpsc::unbounded_channel();
		f.attach(tx);
		assert!(f.is_connected());
		assert!(f.available());

		f.mark_epipe();
		assert!(!f.is_connected());
		assert!(!f.available());
		assert!(f.send(Message::default()).is_err());
	}
}
