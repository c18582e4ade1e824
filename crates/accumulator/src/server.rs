//! Accumulator server: the authoritative name → aggregator map.
//!
//! One task owns the map and serves the request stream; the server stays up
//! until every announced client has said goodbye.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lattice_proto::{ErrorCode, RpcRequest, RpcResponse};
use lattice_rpc::{Dealer, RpcServer, RpcService};

use crate::aggregator::{Aggregator, AggregatorRegistry};
use crate::{
	AccumulatorError, ACCUMULATOR_SERVICE_API, OP_ERASE, OP_ERASE_ALL, OP_READ, OP_RESET,
	OP_START, OP_STOP, OP_WAIT_EMPTY, OP_WRITE,
};

/// The singleton accumulator server, registered as server id 0.
pub struct AccumulatorServer {
	dealer: Arc<Dealer>,
	server: RpcServer,
	task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for AccumulatorServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AccumulatorServer").finish()
	}
}

impl AccumulatorServer {
	/// Registers the service (server id 0) and starts the request loop.
	pub async fn start(
		service: &Arc<RpcService>,
		registry: Arc<AggregatorRegistry>,
	) -> Result<Self, AccumulatorError> {
		let server = service.create_server(ACCUMULATOR_SERVICE_API, Some(0)).await?;
		let dealer = server.create_dealer();
		let task = tokio::spawn(process_requests(dealer.clone(), registry));
		Ok(Self {
			dealer,
			server,
			task: Mutex::new(Some(task)),
		})
	}

	/// Waits until the last announced client has stopped.
	pub async fn wait(&self) {
		let task = self.task.lock().unwrap().take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}

	/// Stops the request loop and deregisters the server.
	pub async fn shutdown(self) -> Result<(), AccumulatorError> {
		self.dealer.terminate();
		self.wait().await;
		drop(self.dealer);
		self.server.shutdown().await?;
		Ok(())
	}
}

struct ServerState {
	registry: Arc<AggregatorRegistry>,
	aggs: HashMap<String, (String, Box<dyn Aggregator>)>,
	client_count: i64,
	started: bool,
}

async fn process_requests(dealer: Arc<Dealer>, registry: Arc<AggregatorRegistry>) {
	let mut state = ServerState {
		registry,
		aggs: HashMap::new(),
		client_count: 0,
		started: false,
	};
	while let Some(mut req) = dealer.recv_request(None).await {
		let Ok(op) = req.get::<u8>() else {
			tracing::warn!("malformed accumulator request, ignoring");
			continue;
		};
		let mut resp = RpcResponse::from_request(&req);
		let mut stop = false;
		match op {
			OP_READ => handle_read(&mut state, &mut req, &mut resp),
			OP_WRITE => handle_write(&mut state, &mut req, &mut resp),
			OP_RESET => handle_reset(&mut state, &mut req, &mut resp),
			OP_ERASE => {
				if let Ok(names) = req.get::<Vec<String>>() {
					for name in &names {
						state.aggs.remove(name);
					}
				} else {
					resp.set_error_code(ErrorCode::NotFound);
				}
			}
			OP_ERASE_ALL => state.aggs.clear(),
			OP_WAIT_EMPTY => {
				// The map is only mutated by this task, so by the time this
				// request is answered every earlier write has been applied.
			}
			OP_START => {
				state.client_count += 1;
				state.started = true;
			}
			OP_STOP => {
				state.client_count -= 1;
				stop = state.started && state.client_count <= 0;
			}
			other => {
				tracing::warn!(op = other, "unknown accumulator op");
				resp.set_error_code(ErrorCode::NotFound);
			}
		}
		dealer.send_response(resp);
		if stop {
			tracing::info!("last accumulator client stopped");
			break;
		}
	}
}

fn handle_read(state: &mut ServerState, req: &mut RpcRequest, resp: &mut RpcResponse) {
	let Ok((name, type_name)) = read_name_and_type(req) else {
		resp.set_error_code(ErrorCode::NotFound);
		return;
	};
	match state.aggs.get(&name) {
		Some((stored_type, agg)) if *stored_type == type_name => {
			agg.serialize(resp.archive());
		}
		Some(_) => {
			tracing::warn!(name, type_name, "accumulator read with mismatched type");
			resp.set_error_code(ErrorCode::NotFound);
		}
		None => resp.set_error_code(ErrorCode::NotFound),
	}
}

fn handle_write(state: &mut ServerState, req: &mut RpcRequest, resp: &mut RpcResponse) {
	let Ok(count) = req.get::<u64>() else {
		resp.set_error_code(ErrorCode::NotFound);
		return;
	};
	for _ in 0..count {
		let Ok((name, type_name)) = read_name_and_type(req) else {
			resp.set_error_code(ErrorCode::NotFound);
			return;
		};
		// The payload layout is only known to the concrete type, so an
		// unregistered type makes the rest of the batch unreadable.
		let Some(mut delta) = state.registry.create(&type_name) else {
			tracing::error!(name, type_name, "aggregator type not registered on server");
			resp.set_error_code(ErrorCode::NotFound);
			return;
		};
		if delta.deserialize(req.archive()).is_err() {
			tracing::error!(name, type_name, "undecodable aggregator delta");
			resp.set_error_code(ErrorCode::NotFound);
			return;
		}
		let entry = match state.aggs.entry(name.clone()) {
			std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
			std::collections::hash_map::Entry::Vacant(v) => {
				let Some(fresh) = state.registry.create(&type_name) else {
					resp.set_error_code(ErrorCode::NotFound);
					return;
				};
				v.insert((type_name.clone(), fresh))
			}
		};
		entry.1.merge(&*delta);
	}
}

fn handle_reset(state: &mut ServerState, req: &mut RpcRequest, resp: &mut RpcResponse) {
	let Ok((name, _type_name)) = read_name_and_type(req) else {
		resp.set_error_code(ErrorCode::NotFound);
		return;
	};
	match state.aggs.get_mut(&name) {
		Some((_, agg)) => agg.init(),
		None => resp.set_error_code(ErrorCode::NotFound),
	}
}

fn read_name_and_type(req: &mut RpcRequest) -> Result<(String, String), lattice_proto::ArchiveError> {
	Ok((req.get::<String>()?, req.get::<String>()?))
}
