//! Accumulator client: double-buffered write-behind batching.
//!
//! Writes merge into the current pending buffer and return immediately.
//! One sender task flips the buffers and ships every dirty slot as a single
//! `W` batch; reads, resets and erases are synchronous RPCs. All requests
//! pin server id 0, the first (authoritative) server instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lattice_primitives::AsyncWatcher;
use lattice_proto::{ErrorCode, RpcRequest};
use lattice_rpc::{Dealer, RpcClient, RpcService};

use crate::aggregator::{aggregator_type_name, Aggregate, Aggregator, AggregatorRegistry};
use crate::{
	AccumulatorError, ACCUMULATOR_SERVICE_API, OP_ERASE, OP_ERASE_ALL, OP_READ, OP_RESET,
	OP_START, OP_STOP, OP_WRITE,
};

struct Slot {
	agg: Box<dyn Aggregator>,
	name: String,
	type_name: String,
	dirty: bool,
}

struct Pending {
	bufs: [Vec<Slot>; 2],
	dirty_count: [usize; 2],
	current: usize,
	name2id: HashMap<String, usize>,
	writer_closed: bool,
}

struct Inner {
	registry: Arc<AggregatorRegistry>,
	dealer: Dealer,
	_client: RpcClient,
	pending: Mutex<Pending>,
	wake: AsyncWatcher,
	sender_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A cheaply cloneable handle to the process's accumulator connection.
#[derive(Clone)]
pub struct AccumulatorClient {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for AccumulatorClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AccumulatorClient").finish()
	}
}

fn request(op: u8) -> RpcRequest {
	let mut req = RpcRequest::to_server(0);
	req.put(&op);
	req
}

impl AccumulatorClient {
	/// Connects to the accumulator service and announces this client.
	pub async fn start(
		service: &Arc<RpcService>,
		registry: Arc<AggregatorRegistry>,
	) -> Result<Self, AccumulatorError> {
		let client = service.create_client(ACCUMULATOR_SERVICE_API, 1).await?;
		let dealer = client.create_dealer();
		let resp = dealer.sync_rpc_call(request(OP_START)).await;
		if resp.error_code() != ErrorCode::Succ {
			return Err(AccumulatorError::Server(resp.error_code()));
		}

		let sender_dealer = client.create_dealer();
		let inner = Arc::new(Inner {
			registry,
			dealer,
			_client: client,
			pending: Mutex::new(Pending {
				bufs: [Vec::new(), Vec::new()],
				dirty_count: [0, 0],
				current: 0,
				name2id: HashMap::new(),
				writer_closed: false,
			}),
			wake: AsyncWatcher::new(),
			sender_task: Mutex::new(None),
		});

		let sender_future: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
			Box::pin(sender_loop(inner.clone(), sender_dealer));
		let task = tokio::spawn(sender_future);
		*inner.sender_task.lock().unwrap() = Some(task);
		Ok(Self { inner })
	}

	/// Registers `name` locally so writes have a pending slot. Idempotent.
	pub fn add_aggregator<A: Aggregate>(&self, name: &str) {
		let type_name = aggregator_type_name::<A>();
		let mut pending = self.inner.pending.lock().unwrap();
		if pending.name2id.contains_key(name) {
			return;
		}
		let id = pending.bufs[0].len();
		for buf in &mut pending.bufs {
			// Pending slots come from the shared registry so the wire name
			// always has a server-side constructor; a type nobody
			// registered still works locally through its typed default.
			let agg = match self.inner.registry.create(type_name) {
				Some(agg) => agg,
				None => {
					let mut agg: Box<dyn Aggregator> = Box::new(A::default());
					agg.init();
					agg
				}
			};
			buf.push(Slot {
				agg,
				name: name.to_string(),
				type_name: type_name.to_string(),
				dirty: false,
			});
		}
		pending.name2id.insert(name.to_string(), id);
	}

	/// Merges a delta into the pending buffer. Returns false once the
	/// writer is closed or the name was never registered.
	pub fn write<A: Aggregate>(&self, name: &str, delta: A) -> bool {
		let mut pending = self.inner.pending.lock().unwrap();
		if pending.writer_closed {
			return false;
		}
		let Some(&id) = pending.name2id.get(name) else {
			tracing::warn!(name, "write to unregistered accumulator");
			return false;
		};
		let current = pending.current;
		let slot = &mut pending.bufs[current][id];
		slot.agg.merge(&delta);
		let was_dirty = slot.dirty;
		slot.dirty = true;
		if !was_dirty {
			pending.dirty_count[current] += 1;
		}
		drop(pending);
		self.inner.wake.notify();
		true
	}

	/// Reads the authoritative value of `name` from the server.
	pub async fn read<A: Aggregate>(&self, name: &str) -> Option<A> {
		let mut req = request(OP_READ);
		req.put(&name.to_string());
		req.put(&aggregator_type_name::<A>().to_string());
		let mut resp = self.inner.dealer.sync_rpc_call(req).await;
		if resp.error_code() != ErrorCode::Succ {
			tracing::warn!(name, code = ?resp.error_code(), "accumulator read failed");
			return None;
		}
		let mut agg = A::default();
		agg.init();
		agg.deserialize(resp.archive()).ok()?;
		Some(agg)
	}

	/// Resets `name` to its identity value on the server.
	pub async fn reset<A: Aggregate>(&self, name: &str) -> bool {
		let mut req = request(OP_RESET);
		req.put(&name.to_string());
		req.put(&aggregator_type_name::<A>().to_string());
		let resp = self.inner.dealer.sync_rpc_call(req).await;
		if resp.error_code() != ErrorCode::Succ {
			tracing::warn!(name, code = ?resp.error_code(), "accumulator reset failed");
			return false;
		}
		true
	}

	/// Erases the named entries on the server.
	pub async fn erase(&self, names: &[String]) -> bool {
		let mut req = request(OP_ERASE);
		req.put(&names.to_vec());
		self.inner.dealer.sync_rpc_call(req).await.error_code() == ErrorCode::Succ
	}

	/// Erases everything on the server.
	pub async fn erase_all(&self) -> bool {
		self.inner.dealer.sync_rpc_call(request(OP_ERASE_ALL)).await.error_code()
			== ErrorCode::Succ
	}

	/// Waits until every pending write has been delivered to the server.
	pub async fn wait_empty(&self) {
		self.inner
			.wake
			.wait_until(async || {
				let pending = self.inner.pending.lock().unwrap();
				pending.writer_closed
					|| (pending.dirty_count[0] == 0 && pending.dirty_count[1] == 0)
			})
			.await;
	}

	/// Flushes whatever is still pending, stops the sender task, and says
	/// goodbye to the server.
	pub async fn finalize(&self) -> Result<(), AccumulatorError> {
		{
			let mut pending = self.inner.pending.lock().unwrap();
			if pending.writer_closed {
				return Ok(());
			}
			pending.writer_closed = true;
		}
		self.inner.wake.notify();
		let task = self.inner.sender_task.lock().unwrap().take();
		if let Some(task) = task {
			let _ = task.await;
		}
		let resp = self.inner.dealer.sync_rpc_call(request(OP_STOP)).await;
		if resp.error_code() != ErrorCode::Succ {
			return Err(AccumulatorError::Server(resp.error_code()));
		}
		Ok(())
	}
}

/// Serializes every dirty slot of buffer `idx` into one `W` batch and
/// re-initializes the slots. `None` when nothing is dirty.
fn build_batch(inner: &Inner, idx: usize) -> Option<RpcRequest> {
	let mut pending = inner.pending.lock().unwrap();
	let count = pending.bufs[idx].iter().filter(|s| s.dirty).count();
	if count == 0 {
		return None;
	}
	let mut req = request(OP_WRITE);
	req.put(&(count as u64));
	for slot in &mut pending.bufs[idx] {
		if !slot.dirty {
			continue;
		}
		req.put(&slot.name);
		req.put(&slot.type_name);
		slot.agg.serialize(req.archive());
		slot.agg.init();
		slot.dirty = false;
	}
	Some(req)
}

async fn sender_loop(inner: Arc<Inner>, dealer: Dealer) {
	loop {
		inner
			.wake
			.wait_until(async || {
				let pending = inner.pending.lock().unwrap();
				pending.dirty_count[pending.current] > 0 || pending.writer_closed
			})
			.await;

		let flip = {
			let mut pending = inner.pending.lock().unwrap();
			if pending.dirty_count[pending.current] > 0 {
				let idx = pending.current;
				pending.current = 1 - idx;
				Some(idx)
			} else {
				None
			}
		};
		if let Some(idx) = flip {
			if let Some(req) = build_batch(&inner, idx) {
				let resp = dealer.sync_rpc_call(req).await;
				if resp.error_code() != ErrorCode::Succ {
					tracing::error!(code = ?resp.error_code(), "accumulator batch rejected");
				}
			}
			inner.pending.lock().unwrap().dirty_count[idx] = 0;
			inner.wake.notify();
		}

		let closed = inner.pending.lock().unwrap().writer_closed;
		if closed {
			let idx = inner.pending.lock().unwrap().current;
			if let Some(req) = build_batch(&inner, idx) {
				let resp = dealer.sync_rpc_call(req).await;
				if resp.error_code() != ErrorCode::Succ {
					tracing::error!(code = ?resp.error_code(), "final accumulator batch rejected");
				}
			}
			inner.pending.lock().unwrap().dirty_count[idx] = 0;
			inner.wake.notify();
			break;
		}
	}
}

/// A typed holder batching values locally before they enter the shared
/// pending table.
#[derive(Debug)]
pub struct Accumulator<A: Aggregate> {
	client: AccumulatorClient,
	name: String,
	flush_freq: usize,
	final_need_flush: bool,
	cached: Mutex<(A, usize)>,
}

impl<A: Aggregate> Accumulator<A> {
	/// Creates a holder flushing every 1024 writes.
	pub fn new(client: &AccumulatorClient, name: &str) -> Self {
		Self::with_flush_freq(client, name, 1024, true)
	}

	/// Creates a holder with an explicit local batch size. A
	/// `flush_freq` of zero never flushes implicitly.
	pub fn with_flush_freq(
		client: &AccumulatorClient,
		name: &str,
		flush_freq: usize,
		final_need_flush: bool,
	) -> Self {
		client.add_aggregator::<A>(name);
		Self {
			client: client.clone(),
			name: name.to_string(),
			flush_freq,
			final_need_flush,
			cached: Mutex::new((A::default(), 0)),
		}
	}

	/// The accumulator name.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Absorbs one value locally, flushing at the batch boundary.
	pub fn write(&self, value: A::Value) -> bool {
		let mut cached = self.cached.lock().unwrap();
		cached.0.merge_value(value);
		cached.1 += 1;
		if self.flush_freq > 0 && cached.1 >= self.flush_freq {
			return self.flush_locked(&mut cached);
		}
		true
	}

	/// Pushes the local batch into the client's pending table.
	pub fn flush(&self) -> bool {
		let mut cached = self.cached.lock().unwrap();
		self.flush_locked(&mut cached)
	}

	fn flush_locked(&self, cached: &mut (A, usize)) -> bool {
		if cached.1 == 0 {
			return true;
		}
		let delta = std::mem::take(&mut cached.0);
		cached.1 = 0;
		self.client.write(&self.name, delta)
	}

	/// Reads the authoritative value from the server.
	pub async fn read(&self) -> Option<A> {
		self.client.read::<A>(&self.name).await
	}

	/// Resets the authoritative value.
	pub async fn reset(&self) -> bool {
		self.client.reset::<A>(&self.name).await
	}

	/// Erases the server entry.
	pub async fn erase(&self) -> bool {
		self.client.erase(std::slice::from_ref(&self.name)).await
	}
}

impl<A: Aggregate> Drop for Accumulator<A> {
	fn drop(&mut self) {
		if self.final_need_flush {
			let _ = self.flush();
		}
	}
}
