//! The registry server: one TCP endpoint, one in-memory tree.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lattice_proto::{
	check_valid_path, socket, Message, MessageHead, RegistryOp, RegistryStatus, RpcRequest,
	RpcResponse, WATCHER_NOTIFY_RPC_ID,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Longest key a sequential counter may produce (`_` + 10 digits).
const MAX_SEQ_KEY_LEN: usize = 11;

/// One tree node.
#[derive(Debug, Default)]
struct Node {
	/// Owning connection for ephemeral nodes.
	owner: Option<u64>,
	value: String,
	/// Child keys, kept sorted: lock and barrier clients depend on the
	/// lexicographic order of SUB results.
	children: BTreeSet<String>,
}

#[derive(Debug)]
struct Session {
	sink: mpsc::UnboundedSender<Message>,
	/// CLIENT_FINALIZE turns notifications off while the reply drains.
	watching: bool,
}

#[derive(Debug, Default)]
struct State {
	nodes: HashMap<String, Node>,
	gen_ids: HashMap<String, u64>,
	sessions: HashMap<u64, Session>,
	exiting: bool,
}

#[derive(Debug)]
struct Core {
	state: Mutex<State>,
	next_conn: AtomicU64,
	/// Cancelled once an EXIT was seen and the last client disconnected.
	done: CancellationToken,
}

/// The registry server. Binds one TCP endpoint and serves until an EXIT
/// request arrives and every client has disconnected.
#[derive(Debug)]
pub struct RegistryServer {
	core: Arc<Core>,
	endpoint: String,
	accept_task: tokio::task::JoinHandle<()>,
}

impl RegistryServer {
	/// Binds `endpoint` (`ip` or `ip:port`; a missing or zero port picks a
	/// random free port) and starts serving.
	pub async fn bind(endpoint: &str) -> std::io::Result<Self> {
		let addr = if endpoint.contains(':') {
			endpoint.to_string()
		} else {
			format!("{endpoint}:0")
		};
		let listener = TcpListener::bind(&addr).await?;
		let endpoint = listener.local_addr()?.to_string();
		tracing::info!(endpoint = %endpoint, "registry serving");

		let mut state = State::default();
		state.nodes.insert(String::new(), Node::default());
		let core = Arc::new(Core {
			state: Mutex::new(state),
			next_conn: AtomicU64::new(0),
			done: CancellationToken::new(),
		});

		let accept_core = core.clone();
		let accept_task = tokio::spawn(async move {
			loop {
				tokio::select! {
					accepted = listener.accept() => match accepted {
						Ok((stream, _)) => {
							let core = accept_core.clone();
							tokio::spawn(handle_connection(core, stream));
						}
						Err(e) => {
							tracing::error!(error = %e, "registry accept failed");
						}
					},
					() = accept_core.done.cancelled() => break,
				}
			}
		});

		Ok(Self {
			core,
			endpoint,
			accept_task,
		})
	}

	/// The bound `ip:port`.
	#[must_use]
	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	/// Dials the server and requests shutdown, without waiting for it.
	pub async fn exit(&self) -> std::io::Result<()> {
		let info = lattice_proto::CommInfo {
			global_rank: -1,
			endpoint: String::new(),
		};
		let mut sock = socket::connect(&self.endpoint, &info).await?;
		let mut req = RpcRequest::new();
		req.head.rpc_id = 0;
		req.put(&(RegistryOp::Exit as u8));
		sock.send(&req.into_message()).await
	}

	/// Waits until an EXIT was received and every client disconnected.
	pub async fn wait(self) {
		let _ = self.accept_task.await;
		tracing::info!("registry exited");
	}
}

async fn handle_connection(core: Arc<Core>, stream: TcpStream) {
	let accepted = socket::accept(stream).await;
	let (sock, _peer) = match accepted {
		Ok(ok) => ok,
		Err(e) => {
			tracing::warn!(error = %e, "registry handshake failed");
			return;
		}
	};
	let (mut reader, mut writer) = sock.split();

	let conn = core.next_conn.fetch_add(1, Ordering::Relaxed);
	let (sink, mut outbox) = mpsc::unbounded_channel::<Message>();
	core.state.lock().unwrap().sessions.insert(
		conn,
		Session {
			sink,
			watching: true,
		},
	);
	tracing::debug!(conn, "registry connection opened");

	let write_task = tokio::spawn(async move {
		while let Some(msg) = outbox.recv().await {
			if let Err(e) = writer.send(&msg).await {
				if !lattice_proto::codec::is_disconnect(&e) {
					tracing::warn!(error = %e, "registry send failed");
				}
				break;
			}
		}
	});

	loop {
		match reader.recv().await {
			Ok(msg) => core.handle_request(conn, msg),
			Err(e) => {
				if !lattice_proto::codec::is_disconnect(&e) {
					tracing::warn!(error = %e, conn, "registry recv failed");
				}
				break;
			}
		}
	}

	core.drop_session(conn);
	write_task.abort();
	tracing::debug!(conn, "registry connection closed");
}

impl Core {
	fn handle_request(&self, conn: u64, msg: Message) {
		let mut req = RpcRequest::from_message(msg);
		let op = match req.get::<u8>().map(RegistryOp::try_from) {
			Ok(Ok(op)) => op,
			_ => {
				tracing::warn!(conn, "malformed registry request, ignoring");
				return;
			}
		};

		let mut resp = RpcResponse::from_request(&req);
		let mut state = self.state.lock().unwrap();
		let notify = match op {
			RegistryOp::Gen => state.op_gen(conn, &mut req, &mut resp),
			RegistryOp::Add => state.op_add(conn, &mut req, &mut resp),
			RegistryOp::Del => state.op_del(&mut req, &mut resp),
			RegistryOp::Get => state.op_get(&mut req, &mut resp),
			RegistryOp::Set => state.op_set(&mut req, &mut resp),
			RegistryOp::Sub => state.op_sub(&mut req, &mut resp),
			RegistryOp::Exit => {
				state.exiting = true;
				None
			}
			RegistryOp::ClientFinalize => {
				let removed = state.clear_owned(conn);
				if let Some(session) = state.sessions.get_mut(&conn) {
					session.watching = false;
				}
				for path in removed {
					state.notify_watchers(&path);
				}
				None
			}
		};

		if let Some(path) = notify {
			state.notify_watchers(&path);
		}
		if let Some(session) = state.sessions.get(&conn) {
			let _ = session.sink.send(resp.into_message());
		}
		let finished = state.exiting && state.sessions.is_empty();
		drop(state);
		if finished {
			self.done.cancel();
		}
	}

	fn drop_session(&self, conn: u64) {
		let mut state = self.state.lock().unwrap();
		let removed = state.clear_owned(conn);
		for path in removed {
			state.notify_watchers(&path);
		}
		state.sessions.remove(&conn);
		let finished = state.exiting && state.sessions.is_empty();
		drop(state);
		if finished {
			self.done.cancel();
		}
	}
}

/// Splits a valid path into (parent, key).
fn split_path(path: &str) -> (&str, &str) {
	let idx = path.rfind('/').expect("validated path has a separator");
	(&path[..idx], &path[idx + 1..])
}

impl State {
	fn notify_watchers(&self, path: &str) {
		let mut ar = lattice_proto::Archive::new();
		ar.put(&path.to_string());
		let head = MessageHead {
			rpc_id: WATCHER_NOTIFY_RPC_ID,
			..MessageHead::default()
		};
		let msg = Message::new(head, ar.into_bytes(), Vec::new());
		for session in self.sessions.values() {
			if session.watching {
				let _ = session.sink.send(msg.clone());
			}
		}
	}

	fn clear_owned(&mut self, conn: u64) -> Vec<String> {
		let owned: Vec<String> = self
			.nodes
			.iter()
			.filter(|(_, node)| node.owner == Some(conn))
			.map(|(path, _)| path.clone())
			.collect();
		for path in &owned {
			self.nodes.remove(path);
			self.gen_ids.remove(path);
			let (parent, key) = split_path(path);
			if let Some(parent) = self.nodes.get_mut(parent) {
				parent.children.remove(key);
			}
		}
		owned
	}

	fn op_gen(
		&mut self,
		conn: u64,
		req: &mut RpcRequest,
		resp: &mut RpcResponse,
	) -> Option<String> {
		let Ok((parent, value, ephemeral)) = read3(req) else {
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		};
		if !check_valid_path(&parent) {
			tracing::warn!(path = %parent, "gen path invalid");
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		}
		match self.nodes.get(&parent) {
			Some(node) if node.owner.is_none() => {}
			_ => {
				tracing::warn!(path = %parent, "gen parent not found");
				resp.put(&(RegistryStatus::NodeFailed as u8));
				return None;
			}
		}
		let counter = self.gen_ids.entry(parent.clone()).or_insert(0);
		let key = format!("_{:010}", *counter);
		*counter += 1;
		if key.len() > MAX_SEQ_KEY_LEN {
			tracing::warn!(path = %parent, "gen counter overflow");
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		}
		let path = format!("{parent}/{key}");
		let owner = ephemeral.then_some(conn);
		self.nodes.insert(
			path.clone(),
			Node {
				owner,
				value,
				children: BTreeSet::new(),
			},
		);
		self.nodes
			.get_mut(&parent)
			.expect("parent checked above")
			.children
			.insert(key.clone());
		resp.put(&(RegistryStatus::Ok as u8));
		resp.put(&key);
		Some(path)
	}

	fn op_add(
		&mut self,
		conn: u64,
		req: &mut RpcRequest,
		resp: &mut RpcResponse,
	) -> Option<String> {
		let Ok((path, value, ephemeral)) = read3(req) else {
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		};
		if !check_valid_path(&path) {
			tracing::warn!(path = %path, "add path invalid");
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		}
		let (parent, key) = split_path(&path);
		match self.nodes.get(parent) {
			Some(node) if node.owner.is_none() => {}
			_ => {
				resp.put(&(RegistryStatus::PathFailed as u8));
				return None;
			}
		}
		if self.nodes.contains_key(&path) {
			resp.put(&(RegistryStatus::NodeFailed as u8));
			return None;
		}
		let owner = ephemeral.then_some(conn);
		self.nodes.insert(
			path.clone(),
			Node {
				owner,
				value,
				children: BTreeSet::new(),
			},
		);
		self.nodes
			.get_mut(parent)
			.expect("parent checked above")
			.children
			.insert(key.to_string());
		resp.put(&(RegistryStatus::Ok as u8));
		Some(path)
	}

	fn op_del(&mut self, req: &mut RpcRequest, resp: &mut RpcResponse) -> Option<String> {
		let Ok(path) = req.get::<String>() else {
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		};
		if !check_valid_path(&path) {
			tracing::warn!(path = %path, "del path invalid");
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		}
		let Some(node) = self.nodes.get(&path) else {
			resp.put(&(RegistryStatus::NodeFailed as u8));
			return None;
		};
		if !node.children.is_empty() {
			resp.put(&(RegistryStatus::PathFailed as u8));
			return None;
		}
		self.nodes.remove(&path);
		self.gen_ids.remove(&path);
		let (parent, key) = split_path(&path);
		if let Some(parent) = self.nodes.get_mut(parent) {
			parent.children.remove(key);
		}
		resp.put(&(RegistryStatus::Ok as u8));
		Some(path)
	}

	fn op_set(&mut self, req: &mut RpcRequest, resp: &mut RpcResponse) -> Option<String> {
		let Ok((path, value)) = read2(req) else {
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		};
		if !check_valid_path(&path) {
			tracing::warn!(path = %path, "set path invalid");
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		}
		let Some(node) = self.nodes.get_mut(&path) else {
			resp.put(&(RegistryStatus::NodeFailed as u8));
			return None;
		};
		node.value = value;
		resp.put(&(RegistryStatus::Ok as u8));
		Some(path)
	}

	fn op_get(&mut self, req: &mut RpcRequest, resp: &mut RpcResponse) -> Option<String> {
		let Ok(path) = req.get::<String>() else {
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		};
		if !check_valid_path(&path) {
			tracing::warn!(path = %path, "get path invalid");
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		}
		match self.nodes.get(&path) {
			Some(node) => {
				resp.put(&(RegistryStatus::Ok as u8));
				resp.put(&node.value);
			}
			None => {
				resp.put(&(RegistryStatus::NodeFailed as u8));
			}
		}
		None
	}

	fn op_sub(&mut self, req: &mut RpcRequest, resp: &mut RpcResponse) -> Option<String> {
		let Ok(path) = req.get::<String>() else {
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		};
		if !check_valid_path(&path) {
			tracing::warn!(path = %path, "sub path invalid");
			resp.put(&(RegistryStatus::Error as u8));
			return None;
		}
		match self.nodes.get(&path) {
			Some(node) => {
				let children: Vec<String> = node.children.iter().cloned().collect();
				resp.put(&(RegistryStatus::Ok as u8));
				resp.put(&children);
			}
			None => {
				resp.put(&(RegistryStatus::NodeFailed as u8));
			}
		}
		None
	}
}

fn read2(req: &mut RpcRequest) -> Result<(String, String), lattice_proto::ArchiveError> {
	Ok((req.get::<String>()?, req.get::<String>()?))
}

fn read3(req: &mut RpcRequest) -> Result<(String, String, bool), lattice_proto::ArchiveError> {
	Ok((req.get::<String>()?, req.get::<String>()?, req.get::<bool>()?))
}
