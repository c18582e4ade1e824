//! Per-service routing target: server id → server dealer inboxes, plus a
//! round-robin cursor over the known server ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use lattice_primitives::Channel;
use lattice_proto::RpcRequest;
use rand::Rng;

#[derive(Debug, Default)]
pub(crate) struct FairQueue {
	sid2dealers: HashMap<i32, Vec<(i32, Channel<RpcRequest>)>>,
	sids: Vec<i32>,
	rr: AtomicUsize,
}

impl FairQueue {
	pub(crate) fn add_server(&mut self, sid: i32) {
		if !self.sids.contains(&sid) {
			self.sids.push(sid);
		}
	}

	pub(crate) fn remove_server(&mut self, sid: i32) {
		self.sids.retain(|s| *s != sid);
	}

	pub(crate) fn add_dealer(&mut self, sid: i32, dealer_id: i32, inbox: Channel<RpcRequest>) {
		self.sid2dealers
			.entry(sid)
			.or_default()
			.push((dealer_id, inbox));
	}

	pub(crate) fn remove_dealer(&mut self, sid: i32, dealer_id: i32) {
		if let Some(dealers) = self.sid2dealers.get_mut(&sid) {
			dealers.retain(|(id, _)| *id != dealer_id);
			if dealers.is_empty() {
				self.sid2dealers.remove(&sid);
			}
		}
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.sid2dealers.is_empty()
	}

	/// Picks the inbox for a request. An explicit `sid` routes sticky;
	/// −1 lets the round-robin cursor choose the server id. When several
	/// dealers share the server id a random one wins the work.
	pub(crate) fn next(&self, sid: i32) -> Option<Channel<RpcRequest>> {
		let sid = if sid != -1 {
			sid
		} else if self.sids.is_empty() {
			-1
		} else {
			self.sids[self.rr.fetch_add(1, Ordering::Relaxed) % self.sids.len()]
		};
		let dealers = self
			.sid2dealers
			.get(&sid)
			// Dealer-only services register their inboxes without a
			// server id; fall back to that bucket for any sid.
			.or_else(|| self.sid2dealers.get(&-1))?;
		if dealers.is_empty() {
			return None;
		}
		let pick = rand::rng().random_range(0..dealers.len());
		Some(dealers[pick].1.clone())
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn sticky_routing_prefers_exact_sid() {
		let mut fq = FairQueue::default();
		fq.add_server(0);
		fq.add_server(1);
		let a = Channel::new();
		let b = Channel::new();
		fq.add_dealer(0, 10, a.clone());
		fq.add_dealer(1, 11, b.clone());

		fq.next(1).unwrap().send(RpcRequest::new());
		assert!(b.recv(Some(Duration::ZERO)).await.is_some());
		assert!(a.recv(Some(Duration::ZERO)).await.is_none());
	}

	#[tokio::test]
	async fn round_robin_covers_all_servers() {
		let mut fq = FairQueue::default();
		fq.add_server(0);
		fq.add_server(1);
		let a = Channel::new();
		let b = Channel::new();
		fq.add_dealer(0, 10, a.clone());
		fq.add_dealer(1, 11, b.clone());

		for _ in 0..4 {
			fq.next(-1).unwrap().send(RpcRequest::new());
		}
		assert!(a.recv(Some(Duration::ZERO)).await.is_some());
		assert!(b.recv(Some(Duration::ZERO)).await.is_some());
	}

	#[tokio::test]
	async fn missing_sid_falls_back_to_dealer_bucket() {
		let mut fq = FairQueue::default();
		let d = Channel::new();
		fq.add_dealer(-1, 7, d.clone());
		assert!(fq.next(3).is_some());
		fq.remove_dealer(-1, 7);
		assert!(fq.next(3).is_none());
	}
}
