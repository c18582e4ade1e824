//! The user-facing send/recv handle.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lattice_primitives::Channel;
use lattice_proto::{CommRank, ErrorCode, RpcRequest, RpcResponse};

use crate::context::RpcContext;

static DEALER_IDS: AtomicI32 = AtomicI32::new(0);

fn next_dealer_id() -> i32 {
	DEALER_IDS.fetch_add(1, Ordering::Relaxed) & i32::MAX
}

/// An id-tagged endpoint: a client (send request, await response), a server
/// (recv request, send response), or both for dealer-only services.
///
/// The dealer deregisters itself from the context on drop; `terminate`
/// closes its channels so blocked receivers return `None`.
#[derive(Debug)]
pub struct Dealer {
	id: i32,
	rpc_id: i32,
	/// Server id this dealer serves, −1 for dealer-only registration.
	server_sid: i32,
	g_rank: CommRank,
	ctx: Arc<RpcContext>,
	req_ch: Option<Channel<RpcRequest>>,
	resp_ch: Option<Channel<RpcResponse>>,
}

impl Dealer {
	pub(crate) fn new(rpc_id: i32, ctx: Arc<RpcContext>) -> Self {
		Self {
			id: next_dealer_id(),
			rpc_id,
			server_sid: -1,
			g_rank: ctx.global_rank(),
			ctx,
			req_ch: None,
			resp_ch: None,
		}
	}

	pub(crate) fn init_as_server(&mut self, sid: i32) {
		debug_assert!(self.req_ch.is_none());
		let inbox = Channel::new();
		self.ctx
			.add_server_dealer(self.rpc_id, sid, self.id, inbox.clone());
		self.server_sid = sid;
		self.req_ch = Some(inbox);
	}

	pub(crate) fn init_as_client(&mut self) {
		debug_assert!(self.resp_ch.is_none());
		let inbox = Channel::new();
		self.ctx.add_client_dealer(self.id, inbox.clone());
		self.resp_ch = Some(inbox);
	}

	/// This dealer's id, carried as `src_dealer` on its requests.
	#[must_use]
	pub fn id(&self) -> i32 {
		self.id
	}

	/// The service id this dealer speaks.
	#[must_use]
	pub fn rpc_id(&self) -> i32 {
		self.rpc_id
	}

	/// Closes both channels; pending receivers return `None`.
	pub fn terminate(&self) {
		if let Some(ch) = &self.req_ch {
			ch.terminate();
		}
		if let Some(ch) = &self.resp_ch {
			ch.terminate();
		}
	}

	// ---- client side -------------------------------------------------------

	/// Sends a request expecting a response on this dealer's inbox.
	pub fn send_request(&self, mut req: RpcRequest) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
		req.head.src_dealer = self.id;
		self.route_request(req)
	}

	/// Sends a request nobody will answer.
	pub fn send_request_one_way(
		&self,
		mut req: RpcRequest,
	) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
		req.head.src_dealer = -1;
		self.route_request(req)
	}

	/// Receives the next response. `None` on timeout or termination.
	pub async fn recv_response(&self, timeout: Option<Duration>) -> Option<RpcResponse> {
		self.resp_ch
			.as_ref()
			.expect("dealer has no client side")
			.recv(timeout)
			.await
	}

	/// Send plus receive in one call. A transport or routing failure comes
	/// back as a response with a non-zero error code.
	pub fn sync_rpc_call(
		&self,
		req: RpcRequest,
	) -> Pin<Box<dyn Future<Output = RpcResponse> + Send + '_>> {
		Box::pin(async move {
			self.send_request(req).await;
			self.recv_response(None)
				.await
				.unwrap_or_else(|| RpcResponse::error(ErrorCode::Connection))
		})
	}

	fn route_request(&self, mut req: RpcRequest) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
		Box::pin(async move {
		let resp_ch = self.resp_ch.as_ref().expect("dealer has no client side");
		req.head.rpc_id = self.rpc_id;
		req.head.src_rank = self.g_rank;

		// Priority: explicit server id, explicit rank, round-robin.
		let (front, miss) = if req.head.sid != -1 {
			(
				self.ctx.client_front_by_sid(self.rpc_id, req.head.sid),
				ErrorCode::NoSuchServer,
			)
		} else if req.head.dest_rank != -1 {
			(
				self.ctx.client_front_by_rank(req.head.dest_rank),
				ErrorCode::NoSuchRank,
			)
		} else {
			match self.ctx.client_front_by_rpc_id(self.rpc_id) {
				Some((front, sid)) => {
					req.head.sid = sid;
					(Some(front), ErrorCode::NoSuchService)
				}
				None => (None, ErrorCode::NoSuchService),
			}
		};
		let Some(front) = front else {
			tracing::warn!(rpc_id = self.rpc_id, code = ?miss, "no route for request");
			let mut resp = RpcResponse::error(miss);
			resp.head.dest_dealer = req.head.src_dealer;
			resp.head.rpc_id = self.rpc_id;
			resp_ch.send(resp);
			return;
		};

		req.head.dest_rank = front.rank();
		if front.rank() == self.g_rank {
			// Local loopback never touches a socket.
			self.ctx.push_request(req);
			return;
		}
		if !front.is_connected() {
			if !front.available() || !self.ctx.connect(&front).await {
				let mut resp = RpcResponse::error(ErrorCode::Connection);
				resp.head.dest_dealer = req.head.src_dealer;
				resp.head.rpc_id = self.rpc_id;
				resp_ch.send(resp);
				return;
			}
		}
		if let Err(msg) = front.send(req.into_message()) {
			self.ctx.handle_epipe(&front, vec![msg]);
		}
		})
	}

	// ---- server side -------------------------------------------------------

	/// Receives the next request. `None` on timeout or termination.
	pub async fn recv_request(&self, timeout: Option<Duration>) -> Option<RpcRequest> {
		self.req_ch
			.as_ref()
			.expect("dealer has no server side")
			.recv(timeout)
			.await
	}

	/// Sends a response back to the requester. Never reconnects: if the
	/// peer is gone the response is dropped and the client times out.
	pub fn send_response(&self, resp: RpcResponse) {
		if resp.head.dest_dealer == -1 {
			return;
		}
		if resp.head.dest_rank == self.g_rank {
			self.ctx.push_response(resp);
			return;
		}
		let Some(front) = self.ctx.server_front_by_rank(resp.head.dest_rank) else {
			tracing::warn!(rank = resp.head.dest_rank, "response to a dead peer, dropped");
			return;
		};
		if let Err(msg) = front.send(resp.into_message()) {
			self.ctx.handle_epipe(&front, vec![msg]);
		}
	}
}

impl Drop for Dealer {
	fn drop(&mut self) {
		self.terminate();
		if self.req_ch.is_some() {
			self.ctx
				.remove_server_dealer(self.rpc_id, self.server_sid, self.id);
		}
		if self.resp_ch.is_some() {
			self.ctx.remove_client_dealer(self.id);
		}
	}
}
