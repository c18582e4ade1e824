//! The routing context: the single authority mapping ranks, services and
//! dealer ids to live endpoints.
//!
//! All routing tables sit behind one `RwLock`. Lookups take the shared
//! lock, topology updates take the exclusive lock; front-ends are held by
//! `Arc`, so a lookup result stays valid across the actual send even if a
//! concurrent update retires the peer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lattice_primitives::{AsyncWatcher, Channel};
use lattice_proto::socket::{self, Socket};
use lattice_proto::{
	codec, CommInfo, CommRank, ErrorCode, Message, RpcRequest, RpcResponse, RpcServiceInfo,
	ServerInfo,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::fair_queue::FairQueue;
use crate::frontend::FrontEnd;

#[derive(Default)]
struct Routing {
	/// Dialed connections, one per live peer.
	client_fronts: HashMap<CommRank, Arc<FrontEnd>>,
	/// Accepted connections, keyed by the announcing peer's rank.
	server_fronts: HashMap<CommRank, Arc<FrontEnd>>,
	/// Service name → full record, as last pushed by the watcher.
	services: HashMap<String, RpcServiceInfo>,
	/// rpc id → server id → server record, for addressing by id.
	servers: HashMap<i32, BTreeMap<i32, ServerInfo>>,
	/// rpc id → inboxes of the local server dealers.
	server_backend: HashMap<i32, FairQueue>,
	/// dealer id → inbox of the local client dealer.
	client_backend: HashMap<i32, Channel<RpcResponse>>,
}

/// Process-wide routing authority.
pub struct RpcContext {
	self_info: CommInfo,
	tables: RwLock<Routing>,
	waiter: AsyncWatcher,
	rr: AtomicUsize,
}

impl std::fmt::Debug for RpcContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RpcContext")
			.field("self_info", &self.self_info)
			.finish()
	}
}

impl RpcContext {
	pub(crate) fn new(self_info: CommInfo) -> Arc<Self> {
		Arc::new(Self {
			self_info,
			tables: RwLock::new(Routing::default()),
			waiter: AsyncWatcher::new(),
			rr: AtomicUsize::new(0),
		})
	}

	/// This process's identity.
	#[must_use]
	pub fn self_info(&self) -> &CommInfo {
		&self.self_info
	}

	/// This process's global rank.
	#[must_use]
	pub fn global_rank(&self) -> CommRank {
		self.self_info.global_rank
	}

	// ---- dealer registration ----------------------------------------------

	pub(crate) fn add_client_dealer(&self, dealer_id: i32, inbox: Channel<RpcResponse>) {
		self.tables.write().client_backend.insert(dealer_id, inbox);
	}

	pub(crate) fn remove_client_dealer(&self, dealer_id: i32) {
		self.tables.write().client_backend.remove(&dealer_id);
	}

	pub(crate) fn add_server_dealer(
		&self,
		rpc_id: i32,
		sid: i32,
		dealer_id: i32,
		inbox: Channel<RpcRequest>,
	) {
		self.tables
			.write()
			.server_backend
			.entry(rpc_id)
			.or_default()
			.add_dealer(sid, dealer_id, inbox);
	}

	pub(crate) fn remove_server_dealer(&self, rpc_id: i32, sid: i32, dealer_id: i32) {
		let mut tables = self.tables.write();
		if let Some(fq) = tables.server_backend.get_mut(&rpc_id) {
			fq.remove_dealer(sid, dealer_id);
			if fq.is_empty() {
				tables.server_backend.remove(&rpc_id);
			}
		}
	}

	pub(crate) fn add_server(&self, rpc_id: i32, sid: i32) {
		self.tables
			.write()
			.server_backend
			.entry(rpc_id)
			.or_default()
			.add_server(sid);
	}

	pub(crate) fn remove_server(&self, rpc_id: i32, sid: i32) {
		let mut tables = self.tables.write();
		if let Some(fq) = tables.server_backend.get_mut(&rpc_id) {
			fq.remove_server(sid);
		}
	}

	// ---- topology updates --------------------------------------------------

	/// Reconciles the dialed-connection table with the authoritative peer
	/// list: departed peers are torn down, new peers get a (disconnected)
	/// front-end that dials lazily on first send.
	pub(crate) fn update_comm_info(&self, list: &[CommInfo]) {
		let mut retired = Vec::new();
		{
			let mut tables = self.tables.write();
			let live: HashSet<CommRank> = list.iter().map(|i| i.global_rank).collect();
			tables.client_fronts.retain(|rank, front| {
				let keep = live.contains(rank);
				if !keep {
					retired.push(front.clone());
				}
				keep
			});
			tables.server_fronts.retain(|rank, front| {
				let keep = live.contains(rank);
				if !keep {
					retired.push(front.clone());
				}
				keep
			});
			for info in list {
				tables
					.client_fronts
					.entry(info.global_rank)
					.or_insert_with(|| Arc::new(FrontEnd::new(info.clone(), true)));
			}
		}
		for front in retired {
			tracing::info!(peer = %front.info, "removing departed peer");
			front.teardown();
		}
		self.waiter.notify();
	}

	/// Replaces the service tables with the registry's latest snapshot and
	/// wakes anyone blocked in `create_client`.
	pub(crate) fn update_service_info(&self, list: &[RpcServiceInfo]) {
		{
			let mut tables = self.tables.write();
			tables.services.clear();
			tables.servers.clear();
			for info in list {
				tables
					.services
					.insert(info.rpc_service_name.clone(), info.clone());
				let entry = tables.servers.entry(info.rpc_id).or_default();
				for server in &info.servers {
					entry.insert(server.server_id, *server);
				}
			}
		}
		self.waiter.notify();
	}

	/// The last-pushed record for a service name.
	#[must_use]
	pub fn service_info(&self, name: &str) -> Option<RpcServiceInfo> {
		self.tables.read().services.get(name).cloned()
	}

	/// Blocks until `name` is registered with at least `expected` servers.
	pub(crate) async fn wait_service(&self, name: &str, expected: usize) -> RpcServiceInfo {
		loop {
			let seen = self.waiter.version();
			if let Some(info) = self.service_info(name) {
				if info.servers.len() >= expected {
					return info;
				}
			}
			self.waiter.wait_change(seen).await;
		}
	}

	// ---- front-end lookups -------------------------------------------------

	pub(crate) fn client_front_by_rank(&self, rank: CommRank) -> Option<Arc<FrontEnd>> {
		self.tables.read().client_fronts.get(&rank).cloned()
	}

	pub(crate) fn client_front_by_sid(&self, rpc_id: i32, sid: i32) -> Option<Arc<FrontEnd>> {
		let tables = self.tables.read();
		let info = tables.servers.get(&rpc_id)?.get(&sid)?;
		tables.client_fronts.get(&info.global_rank).cloned()
	}

	/// Round-robin pick over the known servers of `rpc_id`. Returns the
	/// front-end and the chosen server id.
	pub(crate) fn client_front_by_rpc_id(&self, rpc_id: i32) -> Option<(Arc<FrontEnd>, i32)> {
		let tables = self.tables.read();
		let servers = tables.servers.get(&rpc_id)?;
		if servers.is_empty() {
			return None;
		}
		let idx = self.rr.fetch_add(1, Ordering::Relaxed) % servers.len();
		let info = servers.values().nth(idx)?;
		let front = tables.client_fronts.get(&info.global_rank)?;
		Some((front.clone(), info.server_id))
	}

	pub(crate) fn server_front_by_rank(&self, rank: CommRank) -> Option<Arc<FrontEnd>> {
		self.tables.read().server_fronts.get(&rank).cloned()
	}

	// ---- connection management ---------------------------------------------

	/// Dials a front-end's peer if nobody else already has.
	pub(crate) async fn connect(self: &Arc<Self>, front: &Arc<FrontEnd>) -> bool {
		let _dial = front.connect_mu.lock().await;
		if front.is_connected() {
			return true;
		}
		match socket::connect(&front.info.endpoint, &self.self_info).await {
			Ok(sock) => {
				self.spawn_io(front.clone(), sock);
				true
			}
			Err(e) => {
				tracing::warn!(peer = %front.info, error = %e, "dial failed");
				front.mark_epipe();
				false
			}
		}
	}

	/// Adopts an accepted connection as the peer's server-side front-end.
	pub(crate) fn attach_accepted(self: &Arc<Self>, sock: Socket, peer: CommInfo) {
		tracing::info!(peer = %peer, "accepted peer connection");
		let front = Arc::new(FrontEnd::new(peer.clone(), false));
		{
			let mut tables = self.tables.write();
			if let Some(old) = tables.server_fronts.insert(peer.global_rank, front.clone()) {
				old.teardown();
			}
		}
		self.spawn_io(front, sock);
	}

	/// Wires a connected socket to a front-end: one writer task draining
	/// the outbound queue, one reader task feeding the dispatcher.
	fn spawn_io(self: &Arc<Self>, front: Arc<FrontEnd>, sock: Socket) {
		let (mut reader, mut writer) = sock.split();
		let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
		front.attach(tx);

		let ctx = self.clone();
		let wfront = front.clone();
		let writer_task = tokio::spawn(async move {
			while let Some(msg) = rx.recv().await {
				if let Err(e) = writer.send(&msg).await {
					if !codec::is_disconnect(&e) {
						tracing::warn!(peer = %wfront.info, error = %e, "send failed");
					}
					let mut failed = vec![msg];
					while let Ok(more) = rx.try_recv() {
						failed.push(more);
					}
					ctx.handle_epipe(&wfront, failed);
					break;
				}
			}
		});

		let ctx = self.clone();
		let rfront = front.clone();
		let reader_task = tokio::spawn(async move {
			loop {
				match reader.recv().await {
					Ok(msg) => ctx.dispatch(msg),
					Err(e) => {
						if !codec::is_disconnect(&e) {
							tracing::warn!(peer = %rfront.info, error = %e, "recv failed");
						}
						ctx.remove_front(&rfront);
						rfront.mark_epipe();
						break;
					}
				}
			}
		});

		front.add_tasks(vec![writer_task, reader_task]);
	}

	/// Tears down every live connection. Part of process shutdown.
	pub(crate) fn teardown_fronts(&self) {
		let fronts: Vec<Arc<FrontEnd>> = {
			let mut tables = self.tables.write();
			let client: Vec<Arc<FrontEnd>> = tables.client_fronts.drain().map(|(_, f)| f).collect();
			let server: Vec<Arc<FrontEnd>> = tables.server_fronts.drain().map(|(_, f)| f).collect();
			client.into_iter().chain(server).collect()
		};
		for front in fronts {
			front.teardown();
		}
	}

	fn remove_front(&self, front: &Arc<FrontEnd>) {
		let mut tables = self.tables.write();
		let map = if front.is_client_socket {
			&mut tables.client_fronts
		} else {
			&mut tables.server_fronts
		};
		if let Some(existing) = map.get(&front.rank()) {
			if Arc::ptr_eq(existing, front) {
				map.remove(&front.rank());
			}
		}
	}

	/// Breaks a front-end and salvages what the policy allows: queued
	/// requests of a dialed peer are re-routed, responses are dropped (the
	/// remote client recovers by timeout).
	pub(crate) fn handle_epipe(self: &Arc<Self>, front: &Arc<FrontEnd>, failed: Vec<Message>) {
		front.mark_epipe();
		if !front.is_client_socket {
			if !failed.is_empty() {
				tracing::warn!(
					peer = %front.info,
					count = failed.len(),
					"dropping responses to a broken peer"
				);
			}
			return;
		}
		if failed.is_empty() {
			return;
		}
		let ctx = self.clone();
		tokio::spawn(async move {
			for msg in failed {
				ctx.resend_request(msg).await;
			}
		});
	}

	/// Second-chance delivery for a request whose connection broke before
	/// the bytes went out.
	pub(crate) async fn resend_request(self: &Arc<Self>, msg: Message) {
		if msg.head.dest_dealer != -1 {
			// Not a request; responses are never retried.
			return;
		}
		let Some(front) = self.client_front_by_rank(msg.head.dest_rank) else {
			self.short_circuit(&msg, ErrorCode::NoSuchRank);
			return;
		};
		if !front.is_connected() {
			if !front.available() || !self.connect(&front).await {
				self.short_circuit(&msg, ErrorCode::Connection);
				return;
			}
		}
		if let Err(msg) = front.send(msg) {
			self.short_circuit(&msg, ErrorCode::Connection);
		}
	}

	/// Completes a request locally with an error response, so the waiting
	/// dealer is not left hanging.
	pub(crate) fn short_circuit(&self, msg: &Message, code: ErrorCode) {
		if msg.head.src_dealer == -1 {
			return;
		}
		let mut resp = RpcResponse::error(code);
		resp.head.dest_dealer = msg.head.src_dealer;
		resp.head.rpc_id = msg.head.rpc_id;
		self.push_response(resp);
	}

	// ---- inbound dispatch --------------------------------------------------

	/// Routes one received message: no destination dealer means a request
	/// for the fair queue, anything else is a response for a client inbox.
	pub(crate) fn dispatch(&self, msg: Message) {
		if msg.head.dest_dealer == -1 {
			self.push_request(RpcRequest::from_message(msg));
		} else {
			self.push_response(RpcResponse::from_message(msg));
		}
	}

	/// Hands a request to a server dealer of its service.
	pub(crate) fn push_request(&self, req: RpcRequest) {
		let inbox = {
			let tables = self.tables.read();
			let Some(fq) = tables.server_backend.get(&req.head.rpc_id) else {
				tracing::warn!(rpc_id = req.head.rpc_id, "request for unknown service, dropped");
				return;
			};
			let Some(inbox) = fq.next(req.head.sid) else {
				tracing::warn!(
					rpc_id = req.head.rpc_id,
					sid = req.head.sid,
					"request for unknown server, dropped"
				);
				return;
			};
			inbox
		};
		inbox.send(req);
	}

	/// Hands a response to the inbox of the dealer that sent the request.
	pub(crate) fn push_response(&self, resp: RpcResponse) {
		let inbox = {
			let tables = self.tables.read();
			tables.client_backend.get(&resp.head.dest_dealer).cloned()
		};
		match inbox {
			Some(inbox) => {
				inbox.send(resp);
			}
			None => {
				tracing::warn!(
					dealer = resp.head.dest_dealer,
					rpc_id = resp.head.rpc_id,
					"response for a finalized dealer, dropped"
				);
			}
		}
	}
}
