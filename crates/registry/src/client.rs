//! Registry client: raw tree operations plus the derived coordination
//! primitives (locks, barriers, id generation, role-rank allocation, node
//! and service registration, context/model storage, task state).
//!
//! One reader task demultiplexes inbound frames: matched responses complete
//! per-rpc-id pending slots, watch notifications go to a callback channel
//! drained by a dedicated task that fires the callbacks registered for
//! every prefix of the notified path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use lattice_primitives::{AsyncWatcher, PendingTable};
use lattice_proto::socket::{self, SocketWriter};
use lattice_proto::{
	check_valid_path, codec, CommInfo, CommRank, Message, RegistryOp, RegistryStatus, RpcRequest,
	RpcResponse, RpcServiceInfo, ServerInfo, WATCHER_NOTIFY_RPC_ID,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::watch::{WatcherHandle, WatcherTable};
use crate::RegistryError;

const PATH_NODE: &str = "_node_";
const PATH_TASK_STATE: &str = "_task_state_";
const PATH_GENERATE_ID: &str = "_id_gen_";
const PATH_LOCK: &str = "_lock_";
const PATH_BARRIER: &str = "_barrier_";
const PATH_RPC: &str = "_rpc_";
const PATH_CONTEXT: &str = "_context_";
const PATH_MODEL: &str = "_model_";

#[derive(Debug)]
struct Shared {
	/// Normalized root, e.g. `/root`. All well-known paths live under it.
	root: String,
	endpoint: String,
	writer: tokio::sync::Mutex<Option<SocketWriter>>,
	pending: PendingTable<Message>,
	id_gen: AtomicI32,
	watchers: WatcherTable,
	locks: Mutex<HashMap<String, String>>,
	alive: CancellationToken,
	reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
	cb_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A cheaply cloneable handle to one registry connection.
#[derive(Debug, Clone)]
pub struct RegistryClient {
	shared: Arc<Shared>,
}

impl RegistryClient {
	/// Connects to the registry at `endpoint` under the default root
	/// (`root`) and seeds the well-known tree layout.
	pub async fn connect(endpoint: &str) -> Result<Self, RegistryError> {
		Self::connect_with_root(endpoint, "root").await
	}

	/// Connects with an explicit root path.
	pub async fn connect_with_root(endpoint: &str, root: &str) -> Result<Self, RegistryError> {
		let root = normalize_root(root);
		let info = CommInfo {
			global_rank: -1,
			endpoint: String::new(),
		};
		let sock = socket::connect(endpoint, &info).await?;
		let (mut reader, writer) = sock.split();

		let shared = Arc::new(Shared {
			root,
			endpoint: endpoint.to_string(),
			writer: tokio::sync::Mutex::new(Some(writer)),
			pending: PendingTable::new(),
			id_gen: AtomicI32::new(0),
			watchers: WatcherTable::new(),
			locks: Mutex::new(HashMap::new()),
			alive: CancellationToken::new(),
			reader_task: Mutex::new(None),
			cb_task: Mutex::new(None),
		});

		let (cb_tx, mut cb_rx) = mpsc::unbounded_channel::<String>();
		let reader_shared = shared.clone();
		let reader_task = tokio::spawn(async move {
			loop {
				match reader.recv().await {
					Ok(msg) if msg.head.rpc_id == WATCHER_NOTIFY_RPC_ID => {
						let mut resp = RpcResponse::from_message(msg);
						if let Ok(path) = resp.get::<String>() {
							let _ = cb_tx.send(path);
						}
					}
					Ok(msg) => {
						reader_shared.pending.complete(msg.head.rpc_id, msg);
					}
					Err(e) => {
						if !codec::is_disconnect(&e) {
							tracing::warn!(error = %e, "registry client recv failed");
						}
						reader_shared.pending.fail_all();
						reader_shared.alive.cancel();
						break;
					}
				}
			}
		});

		let cb_shared = shared.clone();
		let cb_task = tokio::spawn(async move {
			while let Some(path) = cb_rx.recv().await {
				cb_shared.watchers.invoke_prefixes(&path);
			}
		});

		*shared.reader_task.lock().unwrap() = Some(reader_task);
		*shared.cb_task.lock().unwrap() = Some(cb_task);

		let client = Self { shared };
		client.seed().await?;
		Ok(client)
	}

	/// The registry endpoint this client dialed.
	#[must_use]
	pub fn endpoint(&self) -> &str {
		&self.shared.endpoint
	}

	/// Sends CLIENT_FINALIZE, waits for the acknowledgement, and stops the
	/// background tasks. The registry drops this connection's ephemeral
	/// nodes.
	pub async fn finalize(&self) -> Result<(), RegistryError> {
		let mut req = RpcRequest::new();
		req.put(&(RegistryOp::ClientFinalize as u8));
		let _ = self.call(req).await?;
		self.shared.alive.cancel();
		let reader = self.shared.reader_task.lock().unwrap().take();
		let cb = self.shared.cb_task.lock().unwrap().take();
		if let Some(task) = reader {
			task.abort();
			let _ = task.await;
		}
		if let Some(task) = cb {
			task.abort();
			let _ = task.await;
		}
		// Dropping the writer closes the connection; the server then
		// releases anything this session still owned.
		*self.shared.writer.lock().await = None;
		Ok(())
	}

	fn path(&self, tail: &str) -> String {
		format!("{}/{tail}", self.shared.root)
	}

	async fn seed(&self) -> Result<(), RegistryError> {
		let mut cur = String::new();
		for seg in self
			.shared
			.root
			.split('/')
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.collect::<Vec<_>>()
		{
			cur = format!("{cur}/{seg}");
			self.node_add(&cur, "", false).await?;
		}
		for dir in [
			PATH_NODE,
			PATH_TASK_STATE,
			PATH_RPC,
			PATH_GENERATE_ID,
			PATH_LOCK,
			PATH_BARRIER,
			PATH_CONTEXT,
			PATH_MODEL,
		] {
			self.node_add(&self.path(dir), "", false).await?;
		}
		Ok(())
	}

	// ---- raw tree protocol -------------------------------------------------

	async fn call(&self, mut req: RpcRequest) -> Result<RpcResponse, RegistryError> {
		if self.shared.alive.is_cancelled() {
			return Err(RegistryError::ConnectionLost);
		}
		let id = self.shared.id_gen.fetch_add(1, Ordering::Relaxed) & 0x0FFF_FFFF;
		req.head.rpc_id = id;
		let ret = self.shared.pending.register(id);
		{
			let mut guard = self.shared.writer.lock().await;
			let writer = guard.as_mut().ok_or(RegistryError::ConnectionLost)?;
			writer
				.send(&req.into_message())
				.await
				.map_err(|_| RegistryError::ConnectionLost)?;
		}
		ret.wait()
			.await
			.map(RpcResponse::from_message)
			.ok_or(RegistryError::ConnectionLost)
	}

	async fn raw_op(
		&self,
		op: RegistryOp,
		build: impl FnOnce(&mut RpcRequest),
	) -> Result<RpcResponse, RegistryError> {
		let mut req = RpcRequest::new();
		req.put(&(op as u8));
		build(&mut req);
		self.call(req).await
	}

	fn ensure_valid(path: &str) -> Result<(), RegistryError> {
		if check_valid_path(path) {
			Ok(())
		} else {
			Err(RegistryError::InvalidPath(path.to_string()))
		}
	}

	/// Creates `path`. Returns false when the node exists or the parent is
	/// unusable.
	pub async fn node_add(
		&self,
		path: &str,
		value: &str,
		ephemeral: bool,
	) -> Result<bool, RegistryError> {
		Self::ensure_valid(path)?;
		loop {
			let mut resp = self
				.raw_op(RegistryOp::Add, |req| {
					req.put(&path.to_string());
					req.put(&value.to_string());
					req.put(&ephemeral);
				})
				.await?;
			match RegistryStatus::try_from(resp.get::<u8>()?)? {
				RegistryStatus::Ok => return Ok(true),
				RegistryStatus::NodeFailed | RegistryStatus::PathFailed => return Ok(false),
				RegistryStatus::Disconnected => continue,
				RegistryStatus::Error => return Err(RegistryError::Rejected(path.to_string())),
			}
		}
	}

	/// Updates the value of `path`. Returns false when missing.
	pub async fn node_set(&self, path: &str, value: &str) -> Result<bool, RegistryError> {
		Self::ensure_valid(path)?;
		loop {
			let mut resp = self
				.raw_op(RegistryOp::Set, |req| {
					req.put(&path.to_string());
					req.put(&value.to_string());
				})
				.await?;
			match RegistryStatus::try_from(resp.get::<u8>()?)? {
				RegistryStatus::Ok => return Ok(true),
				RegistryStatus::NodeFailed | RegistryStatus::PathFailed => return Ok(false),
				RegistryStatus::Disconnected => continue,
				RegistryStatus::Error => return Err(RegistryError::Rejected(path.to_string())),
			}
		}
	}

	/// Reads the value of `path`; `None` when missing.
	pub async fn node_get(&self, path: &str) -> Result<Option<String>, RegistryError> {
		Self::ensure_valid(path)?;
		loop {
			let mut resp = self
				.raw_op(RegistryOp::Get, |req| {
					req.put(&path.to_string());
				})
				.await?;
			match RegistryStatus::try_from(resp.get::<u8>()?)? {
				RegistryStatus::Ok => return Ok(Some(resp.get::<String>()?)),
				RegistryStatus::NodeFailed | RegistryStatus::PathFailed => return Ok(None),
				RegistryStatus::Disconnected => continue,
				RegistryStatus::Error => return Err(RegistryError::Rejected(path.to_string())),
			}
		}
	}

	/// True when `path` exists.
	pub async fn node_exists(&self, path: &str) -> Result<bool, RegistryError> {
		Ok(self.node_get(path).await?.is_some())
	}

	/// Deletes the leaf at `path`. Returns false when missing or non-leaf.
	pub async fn node_del(&self, path: &str) -> Result<bool, RegistryError> {
		Self::ensure_valid(path)?;
		loop {
			let mut resp = self
				.raw_op(RegistryOp::Del, |req| {
					req.put(&path.to_string());
				})
				.await?;
			match RegistryStatus::try_from(resp.get::<u8>()?)? {
				RegistryStatus::Ok => return Ok(true),
				RegistryStatus::NodeFailed | RegistryStatus::PathFailed => return Ok(false),
				RegistryStatus::Disconnected => continue,
				RegistryStatus::Error => return Err(RegistryError::Rejected(path.to_string())),
			}
		}
	}

	/// Lists the child keys of `path`, sorted; `None` when missing.
	pub async fn node_sub(&self, path: &str) -> Result<Option<Vec<String>>, RegistryError> {
		Self::ensure_valid(path)?;
		loop {
			let mut resp = self
				.raw_op(RegistryOp::Sub, |req| {
					req.put(&path.to_string());
				})
				.await?;
			match RegistryStatus::try_from(resp.get::<u8>()?)? {
				RegistryStatus::Ok => return Ok(Some(resp.get::<Vec<String>>()?)),
				RegistryStatus::NodeFailed | RegistryStatus::PathFailed => return Ok(None),
				RegistryStatus::Disconnected => continue,
				RegistryStatus::Error => return Err(RegistryError::Rejected(path.to_string())),
			}
		}
	}

	/// Creates a sequential child of `parent` and returns the generated key.
	pub async fn node_gen(
		&self,
		parent: &str,
		value: &str,
		ephemeral: bool,
	) -> Result<String, RegistryError> {
		Self::ensure_valid(parent)?;
		loop {
			let mut resp = self
				.raw_op(RegistryOp::Gen, |req| {
					req.put(&parent.to_string());
					req.put(&value.to_string());
					req.put(&ephemeral);
				})
				.await?;
			match RegistryStatus::try_from(resp.get::<u8>()?)? {
				RegistryStatus::Ok => return Ok(resp.get::<String>()?),
				RegistryStatus::NodeFailed | RegistryStatus::PathFailed => {
					return Err(RegistryError::Missing(parent.to_string()));
				}
				RegistryStatus::Disconnected => continue,
				RegistryStatus::Error => return Err(RegistryError::Rejected(parent.to_string())),
			}
		}
	}

	/// Recursively deletes `path` and everything under it.
	pub fn node_clear<'a>(
		&'a self,
		path: &'a str,
	) -> std::pin::Pin<Box<dyn Future<Output = Result<(), RegistryError>> + Send + 'a>> {
		Box::pin(async move {
			while let Some(children) = self.node_sub(path).await? {
				for child in &children {
					self.node_clear(&format!("{path}/{child}")).await?;
				}
				self.node_del(path).await?;
			}
			Ok(())
		})
	}

	/// Registers a callback invoked whenever a path with prefix `path`
	/// changes.
	pub fn watch(
		&self,
		path: &str,
		callback: impl Fn() + Send + Sync + 'static,
	) -> Result<WatcherHandle, RegistryError> {
		Self::ensure_valid(path)?;
		Ok(self.shared.watchers.insert(path, Arc::new(callback)))
	}

	/// Cancels a watcher.
	pub fn cancel_watch(&self, handle: WatcherHandle) {
		self.shared.watchers.erase(handle);
	}

	/// Deletes the whole tree under the configured root.
	pub async fn clear_registry(&self) -> Result<(), RegistryError> {
		let root = self.shared.root.clone();
		self.node_clear(&root).await
	}

	// ---- derived primitives ------------------------------------------------

	/// Allocates the next id for `key`. Ids never repeat within the key's
	/// lifetime and restart at zero after [`RegistryClient::reset_generate_id`].
	pub async fn generate_id(&self, key: &str) -> Result<u64, RegistryError> {
		let path = self.path(&format!("{PATH_GENERATE_ID}/{key}"));
		self.node_add(&path, "", false).await?;
		let generated = self.node_gen(&path, "", true).await?;
		generated
			.strip_prefix('_')
			.and_then(|raw| raw.parse::<u64>().ok())
			.ok_or_else(|| RegistryError::State(format!("bad generated key {generated}")))
	}

	/// Resets the id counter for `key`.
	pub async fn reset_generate_id(&self, key: &str) -> Result<(), RegistryError> {
		let path = self.path(&format!("{PATH_GENERATE_ID}/{key}"));
		self.node_clear(&path).await
	}

	/// Acquires the named distributed lock, waiting as long as it takes.
	pub async fn acquire_lock(&self, name: &str) -> Result<(), RegistryError> {
		let lock_path = self.path(&format!("{PATH_LOCK}/{name}"));
		self.node_add(&lock_path, "", false).await?;
		let seq_key = self.node_gen(&lock_path, "", true).await?;

		let watcher = Arc::new(AsyncWatcher::new());
		let handle = {
			let watcher = watcher.clone();
			self.watch(&lock_path, move || watcher.notify())?
		};
		loop {
			let seen = watcher.version();
			let children = self
				.node_sub(&lock_path)
				.await?
				.ok_or_else(|| RegistryError::Missing(lock_path.clone()))?;
			if children.first() == Some(&seq_key) {
				break;
			}
			watcher.wait_change(seen).await;
		}
		self.cancel_watch(handle);

		let mut locks = self.shared.locks.lock().unwrap();
		if locks
			.insert(name.to_string(), format!("{lock_path}/{seq_key}"))
			.is_some()
		{
			return Err(RegistryError::State(format!("lock {name} already held")));
		}
		Ok(())
	}

	/// Releases a lock previously acquired by this client. Releasing a lock
	/// that is not held is an error.
	pub async fn release_lock(&self, name: &str) -> Result<(), RegistryError> {
		let owned = self.shared.locks.lock().unwrap().remove(name);
		let path = owned.ok_or_else(|| RegistryError::NotLocked(name.to_string()))?;
		if !self.node_del(&path).await? {
			return Err(RegistryError::Missing(path));
		}
		Ok(())
	}

	/// Two-phase rendezvous: returns once all `count` participants entered.
	/// The same name is immediately reusable for the next round.
	pub async fn barrier(&self, name: &str, count: usize) -> Result<(), RegistryError> {
		let base = self.path(&format!("{PATH_BARRIER}/{name}"));
		let node_path = format!("{base}/node");
		let ready_path = format!("{base}/ready");

		let watcher = Arc::new(AsyncWatcher::new());
		let handle = {
			let watcher = watcher.clone();
			self.watch(&ready_path, move || watcher.notify())?
		};

		// A stale ready marker from the previous round must clear first.
		loop {
			let seen = watcher.version();
			if !self.node_exists(&ready_path).await? {
				break;
			}
			watcher.wait_change(seen).await;
		}

		self.node_add(&base, "", false).await?;
		self.node_add(&node_path, "", false).await?;
		let seq_key = self.node_gen(&node_path, "", true).await?;

		let children = self
			.node_sub(&node_path)
			.await?
			.ok_or_else(|| RegistryError::Missing(node_path.clone()))?;
		if children.len() == count && children.last() == Some(&seq_key) {
			// Last arriver: publish ready and wait for everyone to leave.
			let handle2 = {
				let watcher = watcher.clone();
				self.watch(&node_path, move || watcher.notify())?
			};
			if !self.node_add(&ready_path, "", true).await? {
				return Err(RegistryError::State(format!(
					"barrier {name}: ready marker already present"
				)));
			}
			loop {
				let seen = watcher.version();
				let left = self
					.node_sub(&node_path)
					.await?
					.ok_or_else(|| RegistryError::Missing(node_path.clone()))?;
				if left.len() == 1 {
					break;
				}
				watcher.wait_change(seen).await;
			}
			self.cancel_watch(handle2);
			if !self.node_del(&format!("{node_path}/{seq_key}")).await? {
				return Err(RegistryError::Missing(format!("{node_path}/{seq_key}")));
			}
			if !self.node_del(&ready_path).await? {
				return Err(RegistryError::Missing(ready_path));
			}
		} else {
			loop {
				let seen = watcher.version();
				if self.node_exists(&ready_path).await? {
					break;
				}
				watcher.wait_change(seen).await;
			}
			if !self.node_del(&format!("{node_path}/{seq_key}")).await? {
				return Err(RegistryError::Missing(format!("{node_path}/{seq_key}")));
			}
		}
		self.cancel_watch(handle);
		Ok(())
	}

	/// Allocates this caller's rank within `role` and returns the global
	/// ranks of all `role_num` participants in role-rank order.
	pub async fn alloc_role_rank(
		&self,
		role: &str,
		role_num: usize,
		global_rank: CommRank,
	) -> Result<(usize, Vec<CommRank>), RegistryError> {
		let key = format!("alloc_role_rank_{role}");
		let path = self.path(&key);
		self.reset_generate_id(&key).await?;
		self.barrier(&key, role_num).await?;
		let role_rank = self.generate_id(&key).await? as usize;
		self.node_add(&path, "", false).await?;
		self.barrier(&key, role_num).await?;
		if !self
			.node_add(&format!("{path}/{role_rank}"), &global_rank.to_string(), false)
			.await?
		{
			return Err(RegistryError::State(format!(
				"role rank {role_rank} of {role} already taken"
			)));
		}
		self.barrier(&key, role_num).await?;
		let children = self
			.node_sub(&path)
			.await?
			.ok_or_else(|| RegistryError::Missing(path.clone()))?;
		if children.len() != role_num {
			return Err(RegistryError::State(format!(
				"role {role}: expected {role_num} entries, found {}",
				children.len()
			)));
		}
		let mut all = vec![-1; role_num];
		for child in &children {
			let idx: usize = child
				.parse()
				.map_err(|_| RegistryError::State(format!("bad role rank key {child}")))?;
			let value = self
				.node_get(&format!("{path}/{child}"))
				.await?
				.ok_or_else(|| RegistryError::Missing(format!("{path}/{child}")))?;
			all[idx] = value
				.parse()
				.map_err(|_| RegistryError::State(format!("bad global rank {value}")))?;
		}
		self.barrier(&key, role_num).await?;
		self.node_clear(&path).await?;
		Ok((role_rank, all))
	}

	// ---- node and service registration ------------------------------------

	/// Publishes this process under `_node_/<rank>` (ephemeral).
	pub async fn register_node(&self, info: &CommInfo) -> Result<(), RegistryError> {
		let path = self.path(&format!("{PATH_NODE}/{}", info.global_rank));
		if !self.node_add(&path, &info.to_json(), true).await? {
			return Err(RegistryError::State(format!(
				"node rank {} already registered",
				info.global_rank
			)));
		}
		tracing::info!(info = %info, "registered node");
		Ok(())
	}

	/// Lists every registered peer.
	pub async fn comm_info(&self) -> Result<Vec<CommInfo>, RegistryError> {
		let path = self.path(PATH_NODE);
		let ranks = self
			.node_sub(&path)
			.await?
			.ok_or_else(|| RegistryError::Missing(path.clone()))?;
		let mut out = Vec::with_capacity(ranks.len());
		for rank in ranks {
			// A peer may disappear between the listing and the read.
			if let Some(raw) = self.node_get(&format!("{path}/{rank}")).await? {
				let info = CommInfo::from_json(&raw)
					.map_err(|e| RegistryError::State(format!("bad node record: {e}")))?;
				out.push(info);
			}
		}
		Ok(out)
	}

	/// Reads one peer's record.
	pub async fn comm_info_of(&self, rank: CommRank) -> Result<Option<CommInfo>, RegistryError> {
		let path = self.path(&format!("{PATH_NODE}/{rank}"));
		match self.node_get(&path).await? {
			Some(raw) => Ok(Some(CommInfo::from_json(&raw).map_err(|e| {
				RegistryError::State(format!("bad node record: {e}"))
			})?)),
			None => Ok(None),
		}
	}

	/// Watches the peer list.
	pub fn watch_node(
		&self,
		callback: impl Fn() + Send + Sync + 'static,
	) -> Result<WatcherHandle, RegistryError> {
		self.watch(&self.path(PATH_NODE), callback)
	}

	/// Allocates (or reads back) the stable rpc id for `(api, name)`.
	pub async fn register_rpc_service(
		&self,
		api: &str,
		name: &str,
	) -> Result<i32, RegistryError> {
		let rpc_key = format!("{api}${name}");
		self.acquire_lock(&rpc_key).await?;
		let result = self.register_rpc_service_locked(api, name).await;
		self.release_lock(&rpc_key).await?;
		result
	}

	async fn register_rpc_service_locked(
		&self,
		api: &str,
		name: &str,
	) -> Result<i32, RegistryError> {
		let api_path = self.path(&format!("{PATH_RPC}/{api}"));
		self.node_add(&api_path, "", false).await?;
		let path = format!("{api_path}/{name}");
		if let Some(raw) = self.node_get(&path).await? {
			return raw
				.parse::<i32>()
				.map_err(|_| RegistryError::State(format!("bad rpc id {raw}")));
		}
		let rpc_id = self.generate_id(api).await? as i32;
		self.node_add(&path, "", false).await?;
		if !self.node_set(&path, &rpc_id.to_string()).await? {
			return Err(RegistryError::Missing(path));
		}
		Ok(rpc_id)
	}

	/// Removes the whole record of `(api, name)`.
	pub async fn deregister_rpc_service(
		&self,
		api: &str,
		name: &str,
	) -> Result<bool, RegistryError> {
		let rpc_key = format!("{api}${name}");
		self.acquire_lock(&rpc_key).await?;
		let path = self.path(&format!("{PATH_RPC}/{api}/{name}"));
		let existed = self.node_exists(&path).await?;
		if existed {
			self.node_clear(&path).await?;
		}
		self.release_lock(&rpc_key).await?;
		Ok(existed)
	}

	/// Registers a server instance of `(api, name)` hosted by
	/// `global_rank`. A `server_id` of `None` allocates a fresh one.
	pub async fn register_server(
		&self,
		api: &str,
		name: &str,
		global_rank: CommRank,
		server_id: Option<i32>,
	) -> Result<(i32, i32), RegistryError> {
		let rpc_id = self.register_rpc_service(api, name).await?;
		let server_id = match server_id {
			Some(sid) => sid,
			None => self.generate_id(&format!("{api}${name}")).await? as i32,
		};
		let path = self.path(&format!("{PATH_RPC}/{api}/{name}/{server_id}"));
		if !self
			.node_add(&path, &global_rank.to_string(), true)
			.await?
		{
			return Err(RegistryError::State(format!(
				"server {server_id} of {api}/{name} already registered"
			)));
		}
		Ok((rpc_id, server_id))
	}

	/// Removes one server instance.
	pub async fn deregister_server(
		&self,
		api: &str,
		name: &str,
		server_id: i32,
	) -> Result<bool, RegistryError> {
		let path = self.path(&format!("{PATH_RPC}/{api}/{name}/{server_id}"));
		self.node_del(&path).await
	}

	/// Reads the record of one service; `None` when unregistered.
	pub async fn rpc_service_info(
		&self,
		api: &str,
		name: &str,
	) -> Result<Option<RpcServiceInfo>, RegistryError> {
		let path = self.path(&format!("{PATH_RPC}/{api}/{name}"));
		let Some(raw_id) = self.node_get(&path).await? else {
			return Ok(None);
		};
		let rpc_id = raw_id
			.parse::<i32>()
			.map_err(|_| RegistryError::State(format!("bad rpc id {raw_id}")))?;
		let Some(sids) = self.node_sub(&path).await? else {
			return Ok(None);
		};
		let mut servers = Vec::with_capacity(sids.len());
		for sid in sids {
			let Some(raw_rank) = self.node_get(&format!("{path}/{sid}")).await? else {
				continue;
			};
			let (Ok(server_id), Ok(global_rank)) = (sid.parse(), raw_rank.parse()) else {
				continue;
			};
			servers.push(ServerInfo {
				server_id,
				global_rank,
			});
		}
		Ok(Some(RpcServiceInfo {
			rpc_service_name: name.to_string(),
			rpc_id,
			servers,
		}))
	}

	/// Reads every service record under `api`; `None` when the api path is
	/// missing.
	pub async fn all_rpc_service_info(
		&self,
		api: &str,
	) -> Result<Option<Vec<RpcServiceInfo>>, RegistryError> {
		let path = self.path(&format!("{PATH_RPC}/{api}"));
		let Some(names) = self.node_sub(&path).await? else {
			return Ok(None);
		};
		let mut out = Vec::with_capacity(names.len());
		for name in names {
			if let Some(info) = self.rpc_service_info(api, &name).await? {
				out.push(info);
			}
		}
		Ok(Some(out))
	}

	/// Watches the service table of `api`.
	pub async fn watch_rpc_service_info(
		&self,
		api: &str,
		callback: impl Fn() + Send + Sync + 'static,
	) -> Result<WatcherHandle, RegistryError> {
		let path = self.path(&format!("{PATH_RPC}/{api}"));
		self.node_add(&path, "", false).await?;
		self.watch(&path, callback)
	}

	// ---- context and model storage ----------------------------------------

	/// Stores a context blob under `_context_/<storage_id>`.
	pub async fn add_context(&self, storage_id: i32, context: &str) -> Result<bool, RegistryError> {
		self.node_add(&self.path(&format!("{PATH_CONTEXT}/{storage_id}")), context, false)
			.await
	}

	/// Overwrites a context blob.
	pub async fn set_context(&self, storage_id: i32, context: &str) -> Result<bool, RegistryError> {
		self.node_set(&self.path(&format!("{PATH_CONTEXT}/{storage_id}")), context)
			.await
	}

	/// Reads a context blob.
	pub async fn get_context(&self, storage_id: i32) -> Result<Option<String>, RegistryError> {
		self.node_get(&self.path(&format!("{PATH_CONTEXT}/{storage_id}")))
			.await
	}

	/// Deletes a context blob.
	pub async fn delete_storage(&self, storage_id: i32) -> Result<bool, RegistryError> {
		self.node_del(&self.path(&format!("{PATH_CONTEXT}/{storage_id}")))
			.await
	}

	/// Lists every stored context id.
	pub async fn storage_list(&self) -> Result<Vec<i32>, RegistryError> {
		let path = self.path(PATH_CONTEXT);
		let ids = self
			.node_sub(&path)
			.await?
			.ok_or_else(|| RegistryError::Missing(path))?;
		Ok(ids.iter().filter_map(|raw| raw.parse().ok()).collect())
	}

	/// Stores a model blob under `_model_/<name>`.
	pub async fn add_model(&self, name: &str, model: &str) -> Result<bool, RegistryError> {
		self.node_add(&self.path(&format!("{PATH_MODEL}/{name}")), model, false)
			.await
	}

	/// Overwrites a model blob.
	pub async fn set_model(&self, name: &str, model: &str) -> Result<bool, RegistryError> {
		self.node_set(&self.path(&format!("{PATH_MODEL}/{name}")), model)
			.await
	}

	/// Reads a model blob.
	pub async fn get_model(&self, name: &str) -> Result<Option<String>, RegistryError> {
		self.node_get(&self.path(&format!("{PATH_MODEL}/{name}"))).await
	}

	/// Deletes a model blob.
	pub async fn del_model(&self, name: &str) -> Result<bool, RegistryError> {
		self.node_del(&self.path(&format!("{PATH_MODEL}/{name}"))).await
	}

	/// Lists every stored model name.
	pub async fn model_names(&self) -> Result<Vec<String>, RegistryError> {
		let path = self.path(PATH_MODEL);
		self.node_sub(&path)
			.await?
			.ok_or_else(|| RegistryError::Missing(path))
	}

	/// Watches one model entry.
	pub fn watch_model(
		&self,
		name: &str,
		callback: impl Fn() + Send + Sync + 'static,
	) -> Result<WatcherHandle, RegistryError> {
		self.watch(&self.path(&format!("{PATH_MODEL}/{name}")), callback)
	}

	// ---- task state --------------------------------------------------------

	/// Publishes the ready marker.
	pub async fn set_task_ready(&self) -> Result<(), RegistryError> {
		let path = self.path(&format!("{PATH_TASK_STATE}/ready"));
		if !self.node_add(&path, "", false).await? {
			return Err(RegistryError::State("task ready already set".to_string()));
		}
		Ok(())
	}

	/// True once the ready marker exists.
	pub async fn get_task_ready(&self) -> Result<bool, RegistryError> {
		self.node_exists(&self.path(&format!("{PATH_TASK_STATE}/ready")))
			.await
	}

	/// Blocks until the ready marker appears.
	pub async fn wait_task_ready(&self) -> Result<(), RegistryError> {
		let watcher = Arc::new(AsyncWatcher::new());
		let handle = {
			let watcher = watcher.clone();
			self.watch(&self.path(PATH_TASK_STATE), move || watcher.notify())?
		};
		loop {
			let seen = watcher.version();
			if self.get_task_ready().await? {
				break;
			}
			watcher.wait_change(seen).await;
		}
		self.cancel_watch(handle);
		Ok(())
	}

	/// Publishes the failure marker. Returns false if one is already set.
	pub async fn set_task_failed(&self, message: &str) -> Result<bool, RegistryError> {
		self.node_add(&self.path(&format!("{PATH_TASK_STATE}/fail")), message, false)
			.await
	}

	/// Reads the failure marker.
	pub async fn get_task_failed(&self) -> Result<Option<String>, RegistryError> {
		self.node_get(&self.path(&format!("{PATH_TASK_STATE}/fail")))
			.await
	}

	/// Invokes `callback` with the failure message whenever the failure
	/// marker is (or already was) set.
	pub async fn watch_task_fail(
		&self,
		callback: impl Fn(String) + Send + Sync + 'static,
	) -> Result<WatcherHandle, RegistryError> {
		let path = self.path(&format!("{PATH_TASK_STATE}/fail"));
		let callback = Arc::new(callback);
		let handle = {
			let client = self.clone();
			let fail_path = path.clone();
			let callback = callback.clone();
			self.watch(&path, move || {
				let client = client.clone();
				let fail_path = fail_path.clone();
				let callback = callback.clone();
				tokio::spawn(async move {
					if let Ok(Some(message)) = client.node_get(&fail_path).await {
						callback(message);
					}
				});
			})?
		};
		if let Some(message) = self.node_get(&path).await? {
			callback(message);
		}
		Ok(handle)
	}
}

fn normalize_root(root: &str) -> String {
	let trimmed = root.trim_matches('/');
	if trimmed.is_empty() {
		String::new()
	} else {
		format!("/{trimmed}")
	}
}
