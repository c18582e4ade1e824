//! Client handle for one resolved service.

use std::sync::Arc;

use lattice_proto::RpcServiceInfo;

use crate::dealer::Dealer;
use crate::service::RpcService;

/// A resolved service: a snapshot of its record plus a dealer factory.
#[derive(Debug)]
pub struct RpcClient {
	pub(crate) info: RpcServiceInfo,
	pub(crate) service: Arc<RpcService>,
}

impl RpcClient {
	/// The service record observed when the client was created.
	#[must_use]
	pub fn info(&self) -> &RpcServiceInfo {
		&self.info
	}

	/// Creates a dealer that sends requests to this service.
	#[must_use]
	pub fn create_dealer(&self) -> Dealer {
		let mut dealer = Dealer::new(self.info.rpc_id, self.service.ctx().clone());
		dealer.init_as_client();
		dealer
	}
}
