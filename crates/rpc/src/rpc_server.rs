//! Server handle for one registered service instance.

use std::sync::{Arc, Mutex, Weak};

use crate::dealer::Dealer;
use crate::service::RpcService;
use crate::RpcError;

/// One server instance of a named service. Mints server dealers and keeps
/// weak track of them so `terminate` can cascade; shutting the server down
/// deregisters the instance from the registry.
#[derive(Debug)]
pub struct RpcServer {
	pub(crate) rpc_id: i32,
	pub(crate) server_id: i32,
	pub(crate) name: String,
	pub(crate) service: Arc<RpcService>,
	pub(crate) dealers: Mutex<Vec<Weak<Dealer>>>,
}

impl RpcServer {
	/// The server id within the service.
	#[must_use]
	pub fn id(&self) -> i32 {
		self.server_id
	}

	/// The stable service id.
	#[must_use]
	pub fn rpc_id(&self) -> i32 {
		self.rpc_id
	}

	/// The service name.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Creates a dealer receiving this server's share of requests.
	#[must_use]
	pub fn create_dealer(&self) -> Arc<Dealer> {
		let mut dealer = Dealer::new(self.rpc_id, self.service.ctx().clone());
		dealer.init_as_server(self.server_id);
		let dealer = Arc::new(dealer);
		let mut dealers = self.dealers.lock().unwrap();
		dealers.retain(|weak| weak.strong_count() > 0);
		dealers.push(Arc::downgrade(&dealer));
		dealer
	}

	/// Terminates every dealer this server created; their blocked
	/// receivers return `None`.
	pub fn terminate(&self) {
		for weak in self.dealers.lock().unwrap().iter() {
			if let Some(dealer) = weak.upgrade() {
				dealer.terminate();
			}
		}
	}

	/// Cascades termination and deregisters the instance. Late requests
	/// for this server id are short-circuited on the clients.
	pub async fn shutdown(self) -> Result<(), RpcError> {
		self.terminate();
		self.service.clone().remove_server(&self).await
	}
}
