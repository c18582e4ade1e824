//! The process facade: owns the context, the accept loop, and the
//! topology watcher that mirrors the registry into the routing tables.

use std::sync::{Arc, Mutex, Weak};

use lattice_primitives::AsyncWatcher;
use lattice_proto::{socket, CommInfo, CommRank};
use lattice_registry::{RegistryClient, WatcherHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::RpcContext;
use crate::dealer::Dealer;
use crate::rpc_client::RpcClient;
use crate::rpc_server::RpcServer;
use crate::RpcError;

/// Configuration for an [`RpcService`].
#[derive(Debug, Clone)]
pub struct RpcConfig {
	/// Interface the accept socket binds on; the port is always random.
	pub bind_ip: String,
}

impl Default for RpcConfig {
	fn default() -> Self {
		Self {
			bind_ip: "127.0.0.1".to_string(),
		}
	}
}

/// One process's membership in an api namespace: a generated global rank,
/// an accept endpoint registered under the registry, and the background
/// tasks that keep the routing context current.
pub struct RpcService {
	ctx: Arc<RpcContext>,
	registry: RegistryClient,
	api: String,
	watch_handle: Mutex<Option<WatcherHandle>>,
	tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
	shutdown: CancellationToken,
}

impl std::fmt::Debug for RpcService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RpcService")
			.field("api", &self.api)
			.field("self_info", self.ctx.self_info())
			.finish()
	}
}

impl RpcService {
	/// Joins the api namespace: allocates a rank, binds the accept
	/// endpoint, registers the node, and spawns the accept loop and the
	/// topology watcher.
	pub async fn start(
		registry: RegistryClient,
		config: RpcConfig,
		api: &str,
	) -> Result<Arc<Self>, RpcError> {
		let rank = registry.generate_id(&format!("{api}$gen_rank")).await? as CommRank;
		let listener = TcpListener::bind(format!("{}:0", config.bind_ip)).await?;
		let endpoint = listener.local_addr()?.to_string();
		let self_info = CommInfo {
			global_rank: rank,
			endpoint,
		};
		tracing::info!(info = %self_info, api, "rpc service starting");

		let ctx = RpcContext::new(self_info.clone());
		let service = Arc::new(Self {
			ctx: ctx.clone(),
			registry: registry.clone(),
			api: api.to_string(),
			watch_handle: Mutex::new(None),
			tasks: Mutex::new(Vec::new()),
			shutdown: CancellationToken::new(),
		});

		let accept_ctx = ctx.clone();
		let accept_token = service.shutdown.clone();
		let accept_task = tokio::spawn(async move {
			loop {
				tokio::select! {
					accepted = listener.accept() => match accepted {
						Ok((stream, _)) => {
							let ctx = accept_ctx.clone();
							tokio::spawn(async move {
								match socket::accept(stream).await {
									Ok((sock, peer)) => ctx.attach_accepted(sock, peer),
									Err(e) => {
										tracing::warn!(error = %e, "peer handshake failed");
									}
								}
							});
						}
						Err(e) => tracing::error!(error = %e, "accept failed"),
					},
					() = accept_token.cancelled() => break,
				}
			}
		});

		registry.register_node(&self_info).await?;

		let notifier = Arc::new(AsyncWatcher::new());
		let watch_handle = {
			let notifier = notifier.clone();
			registry
				.watch_rpc_service_info(api, move || notifier.notify())
				.await?
		};
		*service.watch_handle.lock().unwrap() = Some(watch_handle);
		service.update_ctx().await;

		let weak: Weak<Self> = Arc::downgrade(&service);
		let watch_token = service.shutdown.clone();
		let watch_task = tokio::spawn(async move {
			loop {
				let seen = notifier.version();
				tokio::select! {
					() = notifier.wait_change(seen) => {
						let Some(service) = weak.upgrade() else { break };
						service.update_ctx().await;
					}
					() = watch_token.cancelled() => break,
				}
			}
		});

		service
			.tasks
			.lock()
			.unwrap()
			.extend([accept_task, watch_task]);
		Ok(service)
	}

	/// This process's identity in the namespace.
	#[must_use]
	pub fn comm_info(&self) -> &CommInfo {
		self.ctx.self_info()
	}

	/// This process's global rank.
	#[must_use]
	pub fn global_rank(&self) -> CommRank {
		self.ctx.global_rank()
	}

	/// The routing context.
	#[must_use]
	pub fn ctx(&self) -> &Arc<RpcContext> {
		&self.ctx
	}

	/// The registry client this service coordinates through.
	#[must_use]
	pub fn registry(&self) -> &RegistryClient {
		&self.registry
	}

	/// Pulls the peer list and the service table from the registry into
	/// the routing context. Failures are logged; the stale tables stay.
	pub async fn update_ctx(&self) {
		match self.registry.comm_info().await {
			Ok(list) => self.ctx.update_comm_info(&list),
			Err(e) => tracing::warn!(error = %e, "fetching peer list failed"),
		}
		match self.registry.all_rpc_service_info(&self.api).await {
			Ok(Some(list)) => self.ctx.update_service_info(&list),
			Ok(None) => {}
			Err(e) => tracing::warn!(error = %e, "fetching service table failed"),
		}
	}

	/// Registers a server instance of `name` and makes it routable. A
	/// `server_id` of `None` allocates a fresh stable id.
	pub async fn create_server(
		self: &Arc<Self>,
		name: &str,
		server_id: Option<i32>,
	) -> Result<RpcServer, RpcError> {
		let (rpc_id, server_id) = self
			.registry
			.register_server(&self.api, name, self.global_rank(), server_id)
			.await?;
		tracing::info!(name, rpc_id, server_id, "registered rpc server");
		self.ctx.add_server(rpc_id, server_id);
		self.update_ctx().await;
		Ok(RpcServer {
			rpc_id,
			server_id,
			name: name.to_string(),
			service: self.clone(),
			dealers: std::sync::Mutex::new(Vec::new()),
		})
	}

	/// Resolves `name`, waiting until at least `expected_server_num`
	/// servers are registered.
	pub async fn create_client(
		self: &Arc<Self>,
		name: &str,
		expected_server_num: usize,
	) -> Result<RpcClient, RpcError> {
		let info = self.ctx.wait_service(name, expected_server_num).await;
		Ok(RpcClient {
			info,
			service: self.clone(),
		})
	}

	/// Creates a dealer that is both client and server of `name`
	/// (dealer-to-dealer messaging without server instances).
	pub async fn create_dealer(self: &Arc<Self>, name: &str) -> Result<Dealer, RpcError> {
		let rpc_id = self.register_rpc_service(name).await?;
		let mut dealer = Dealer::new(rpc_id, self.ctx.clone());
		dealer.init_as_client();
		dealer.init_as_server(-1);
		Ok(dealer)
	}

	/// Allocates (or reads back) the stable rpc id of `name`.
	pub async fn register_rpc_service(&self, name: &str) -> Result<i32, RpcError> {
		Ok(self.registry.register_rpc_service(&self.api, name).await?)
	}

	/// Removes the whole registry record of `name`.
	pub async fn deregister_rpc_service(&self, name: &str) -> Result<(), RpcError> {
		self.registry.deregister_rpc_service(&self.api, name).await?;
		Ok(())
	}

	pub(crate) async fn remove_server(
		self: Arc<Self>,
		server: &RpcServer,
	) -> Result<(), RpcError> {
		self.registry
			.deregister_server(&self.api, &server.name, server.server_id)
			.await?;
		self.ctx.remove_server(server.rpc_id, server.server_id);
		Ok(())
	}

	/// Stops the accept loop and the watcher. The registry client stays
	/// usable; its owner finalizes it.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
		for task in tasks {
			task.abort();
			let _ = task.await;
		}
		if let Some(handle) = self.watch_handle.lock().unwrap().take() {
			self.registry.cancel_watch(handle);
		}
		self.ctx.teardown_fronts();
		tracing::info!(api = %self.api, "rpc service stopped");
	}
}
