//! The RPC-level barrier service: barrier, counted barrier, and
//! aggregate-reduce against a designated root rank.
//!
//! Distinct from the registry barrier: the registry barrier coordinates
//! processes before they can talk; this one runs over the RPC layer once
//! peers are connected. A barrier name is single-use per round; the root
//! garbage-collects it the moment the round completes, so a late arrival
//! from an earlier round can never fold into the wrong accumulation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lattice_proto::{Archive, CommRank, ErrorCode, RpcRequest, RpcResponse};
use lattice_registry::RegistryClient;
use lattice_rpc::{Dealer, RpcClient, RpcServer, RpcService};

use crate::AccumulatorError;

/// Service name the barrier collective registers under.
pub const BARRIER_SERVICE_API: &str = "_BARRIER_SERVICE_API_";

/// The rank hosting the collective's server.
const BARRIER_ROOT: CommRank = 0;

const OP_BARRIER: u8 = 0;
const OP_COUNT: u8 = 1;
const OP_AGGREGATE: u8 = 2;

/// A registered reduction: folds `data` into the accumulator archive.
type ReduceFn = Arc<dyn Fn(&mut Archive, &mut Archive) + Send + Sync>;

struct Root {
	server: RpcServer,
	dealer: Arc<Dealer>,
	task: tokio::task::JoinHandle<()>,
}

/// One process's handle on the collective.
pub struct BarrierService {
	comm_rank: CommRank,
	comm_size: usize,
	client_dealer: Dealer,
	_client: RpcClient,
	funcs: Arc<Mutex<HashMap<String, ReduceFn>>>,
	root: Mutex<Option<Root>>,
}

impl std::fmt::Debug for BarrierService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BarrierService")
			.field("comm_rank", &self.comm_rank)
			.field("comm_size", &self.comm_size)
			.finish()
	}
}

impl BarrierService {
	/// Joins the collective. The process whose `comm_rank` is the root
	/// hosts the server; everyone rendezvouses through the registry
	/// barrier before returning, so the service is fully routable.
	pub async fn start(
		service: &Arc<RpcService>,
		registry: &RegistryClient,
		comm_rank: CommRank,
		comm_size: usize,
	) -> Result<Self, AccumulatorError> {
		let funcs: Arc<Mutex<HashMap<String, ReduceFn>>> = Arc::default();
		let root = if comm_rank == BARRIER_ROOT {
			let server = service.create_server(BARRIER_SERVICE_API, Some(0)).await?;
			let dealer = server.create_dealer();
			let task = tokio::spawn(listening(dealer.clone(), comm_size, funcs.clone()));
			Some(Root {
				server,
				dealer,
				task,
			})
		} else {
			None
		};

		let client = service.create_client(BARRIER_SERVICE_API, 1).await?;
		let client_dealer = client.create_dealer();
		registry
			.barrier(BARRIER_SERVICE_API, comm_size)
			.await
			.map_err(lattice_rpc::RpcError::Registry)?;

		Ok(Self {
			comm_rank,
			comm_size,
			client_dealer,
			_client: client,
			funcs,
			root: Mutex::new(root),
		})
	}

	/// Registers a named reduction for [`BarrierService::aggregate`].
	/// Only meaningful on the root rank.
	pub fn register_aggregate_function(
		&self,
		name: &str,
		func: impl Fn(&mut Archive, &mut Archive) + Send + Sync + 'static,
	) {
		self.funcs
			.lock()
			.unwrap()
			.insert(name.to_string(), Arc::new(func));
	}

	/// Blocks until every rank has entered `name`.
	pub async fn wait(&self, name: &str) -> Result<(), AccumulatorError> {
		self.wait_counted(name, 1).await
	}

	/// Barrier where each rank may stand in for `count` participants.
	pub async fn wait_counted(&self, name: &str, count: u64) -> Result<(), AccumulatorError> {
		if self.comm_size == 1 && count == 1 {
			return Ok(());
		}
		let mut req = RpcRequest::to_server(0);
		req.put(&OP_BARRIER);
		req.put(&name.to_string());
		req.put(&self.comm_rank);
		req.put(&count);
		let mut resp = self.call(req).await?;
		let echoed = resp.get::<String>()?;
		if echoed != name {
			return Err(AccumulatorError::NameMismatch(echoed));
		}
		Ok(())
	}

	/// Releases everyone once the contributed counts reach `total`.
	pub async fn count(&self, name: &str, total: u64, count: u64) -> Result<(), AccumulatorError> {
		if count == total {
			return Ok(());
		}
		let mut req = RpcRequest::to_server(0);
		req.put(&OP_COUNT);
		req.put(&name.to_string());
		req.put(&self.comm_rank);
		req.put(&total);
		req.put(&count);
		let mut resp = self.call(req).await?;
		let echoed = resp.get::<String>()?;
		if echoed != name {
			return Err(AccumulatorError::NameMismatch(echoed));
		}
		Ok(())
	}

	/// Folds every rank's archive with the reduction registered under
	/// `func_name` and returns the folded archive to all participants.
	pub async fn aggregate(
		&self,
		name: &str,
		total: u64,
		count: u64,
		data: &Archive,
		func_name: &str,
	) -> Result<Archive, AccumulatorError> {
		if count == total {
			return Ok(Archive::from_vec(data.as_bytes().to_vec()));
		}
		let mut req = RpcRequest::to_server(0);
		req.put(&OP_AGGREGATE);
		req.put(&name.to_string());
		req.put(&self.comm_rank);
		req.put(&total);
		req.put(&count);
		req.archive().put_bytes(data.as_bytes());
		req.put(&func_name.to_string());
		let mut resp = self.call(req).await?;
		let echoed = resp.get::<String>()?;
		if echoed != name {
			return Err(AccumulatorError::NameMismatch(echoed));
		}
		Ok(Archive::from_vec(resp.archive().get_bytes()?))
	}

	async fn call(&self, req: RpcRequest) -> Result<RpcResponse, AccumulatorError> {
		let resp = self.client_dealer.sync_rpc_call(req).await;
		if resp.error_code() != ErrorCode::Succ {
			return Err(AccumulatorError::Server(resp.error_code()));
		}
		Ok(resp)
	}

	/// Tears down the root's listener (on the root rank) and deregisters.
	pub async fn shutdown(self) -> Result<(), AccumulatorError> {
		let root = self.root.lock().unwrap().take();
		if let Some(root) = root {
			root.dealer.terminate();
			let _ = root.task.await;
			drop(root.dealer);
			root.server.shutdown().await?;
		}
		Ok(())
	}
}

#[derive(Default)]
struct BarrierItem {
	total: u64,
	avail: usize,
	local_counts: HashMap<CommRank, u64>,
	sum: u64,
	requests: Vec<RpcRequest>,
}

#[derive(Default)]
struct CountItem {
	total: u64,
	sum: u64,
	requests: Vec<RpcRequest>,
}

#[derive(Default)]
struct ReduceItem {
	total: u64,
	sum: u64,
	requests: Vec<RpcRequest>,
	data: Archive,
}

async fn listening(
	dealer: Arc<Dealer>,
	comm_size: usize,
	funcs: Arc<Mutex<HashMap<String, ReduceFn>>>,
) {
	let mut barriers: HashMap<String, BarrierItem> = HashMap::new();
	let mut counts: HashMap<String, CountItem> = HashMap::new();
	let mut reduces: HashMap<String, ReduceItem> = HashMap::new();

	while let Some(mut req) = dealer.recv_request(None).await {
		let Ok(op) = req.get::<u8>() else {
			tracing::warn!("malformed barrier request, ignoring");
			continue;
		};
		match op {
			OP_BARRIER => {
				let Ok((name, rank, count)) = read_barrier(&mut req) else {
					continue;
				};
				let item = barriers.entry(name.clone()).or_default();
				match item.local_counts.get(&rank) {
					None => {
						item.total += count;
						item.avail += 1;
						item.local_counts.insert(rank, count);
					}
					Some(seen) if *seen != count => {
						tracing::error!(
							name,
							rank,
							"barrier entered with inconsistent count"
						);
						continue;
					}
					Some(_) => {}
				}
				item.sum += 1;
				item.requests.push(req);
				if item.avail == comm_size && item.total == item.sum {
					let item = barriers.remove(&name).expect("entry just filled");
					for parked in item.requests {
						let mut resp = RpcResponse::from_request(&parked);
						resp.put(&name);
						dealer.send_response(resp);
					}
				}
			}
			OP_COUNT => {
				let Ok((name, _rank, total, count)) = read_count(&mut req) else {
					continue;
				};
				let item = counts.entry(name.clone()).or_default();
				if item.total == 0 {
					item.total = total;
				} else if item.total != total {
					tracing::error!(name, "counted barrier with inconsistent total");
					continue;
				}
				item.sum += count;
				item.requests.push(req);
				if item.total == item.sum {
					let item = counts.remove(&name).expect("entry just filled");
					for parked in item.requests {
						let mut resp = RpcResponse::from_request(&parked);
						resp.put(&name);
						dealer.send_response(resp);
					}
				}
			}
			OP_AGGREGATE => {
				let Ok((name, _rank, total, count, data, func_name)) = read_aggregate(&mut req)
				else {
					continue;
				};
				let is_new = !reduces.contains_key(&name);
				let item = reduces.entry(name.clone()).or_default();
				if item.total == 0 {
					item.total = total;
				} else if item.total != total {
					tracing::error!(name, "aggregate with inconsistent total");
					continue;
				}
				if is_new {
					item.data = Archive::from_vec(data);
				} else {
					let func = funcs.lock().unwrap().get(&func_name).cloned();
					match func {
						Some(func) => {
							let mut incoming = Archive::from_vec(data);
							func(&mut incoming, &mut item.data);
						}
						None => {
							tracing::error!(func_name, "unknown aggregate function");
							continue;
						}
					}
				}
				item.sum += count;
				item.requests.push(req);
				if item.total == item.sum {
					let item = reduces.remove(&name).expect("entry just filled");
					for parked in item.requests {
						let mut resp = RpcResponse::from_request(&parked);
						resp.put(&name);
						resp.archive().put_bytes(item.data.as_bytes());
						dealer.send_response(resp);
					}
				}
			}
			other => tracing::warn!(op = other, "unknown barrier op"),
		}
	}
}

fn read_barrier(
	req: &mut RpcRequest,
) -> Result<(String, CommRank, u64), lattice_proto::ArchiveError> {
	Ok((req.get()?, req.get()?, req.get()?))
}

fn read_count(
	req: &mut RpcRequest,
) -> Result<(String, CommRank, u64, u64), lattice_proto::ArchiveError> {
	Ok((req.get()?, req.get()?, req.get()?, req.get()?))
}

fn read_aggregate(
	req: &mut RpcRequest,
) -> Result<(String, CommRank, u64, u64, Vec<u8>, String), lattice_proto::ArchiveError> {
	let name = req.get()?;
	let rank = req.get()?;
	let total = req.get()?;
	let count = req.get()?;
	let data = req.archive().get_bytes()?;
	let func_name = req.get()?;
	Ok((name, rank, total, count, data, func_name))
}
