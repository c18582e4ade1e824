//! RPC integration tests: one in-process registry, several service
//! instances standing in for peer processes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lattice_proto::{ErrorCode, RpcRequest, RpcResponse};
use lattice_registry::{RegistryClient, RegistryServer};
use tokio::sync::mpsc;

use crate::{Dealer, RpcConfig, RpcService};

const API: &str = "test_api";

struct Peer {
	registry: RegistryClient,
	service: Arc<RpcService>,
}

async fn start_peer(endpoint: &str) -> Peer {
	let registry = RegistryClient::connect(endpoint).await.expect("connect registry");
	let service = RpcService::start(registry.clone(), RpcConfig::default(), API)
		.await
		.expect("start service");
	Peer { registry, service }
}

impl Peer {
	async fn stop(self) {
		self.service.shutdown().await;
		self.registry.finalize().await.expect("finalize registry client");
	}
}

/// Spawns an echo loop on a server dealer: body and blocks come back
/// verbatim, plus this server's id for routing assertions.
fn spawn_echo(dealer: Arc<Dealer>, server_id: i32) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(mut req) = dealer.recv_request(None).await {
			let body: String = req.get().expect("echo body");
			let mut resp = RpcResponse::from_request(&req);
			resp.put(&body);
			resp.put(&server_id);
			while let Some(block) = req.take_block() {
				resp.add_block(block);
			}
			dealer.send_response(resp);
		}
	})
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_roundtrip_with_zero_copy_block() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();

	let server_peer = start_peer(&ep).await;
	let rpc_server = server_peer.service.create_server("echo", None).await.unwrap();
	let server_dealer = rpc_server.create_dealer();
	let echo_task = spawn_echo(server_dealer.clone(), rpc_server.id());

	let client_peer = start_peer(&ep).await;
	let client = client_peer.service.create_client("echo", 1).await.unwrap();
	let dealer = client.create_dealer();

	for &block_len in &[0usize, 1, 128, 1024 * 1024, 5 * 1024 * 1024] {
		let mut req = RpcRequest::new();
		req.put(&String::from("ping"));
		if block_len > 0 {
			req.add_block(Bytes::from(vec![b'x'; block_len]));
		}
		let mut resp = dealer.sync_rpc_call(req).await;
		assert_eq!(resp.error_code(), ErrorCode::Succ);
		assert_eq!(resp.get::<String>().unwrap(), "ping");
		if block_len > 0 {
			let block = resp.take_block().expect("echoed block");
			assert_eq!(block.len(), block_len);
			assert!(block.iter().all(|b| *b == b'x'));
		}
	}

	server_dealer.terminate();
	echo_task.await.unwrap();
	drop(server_dealer);
	drop(dealer);
	rpc_server.shutdown().await.unwrap();
	client_peer.stop().await;
	server_peer.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn local_loopback_skips_the_socket() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();

	let peer = start_peer(&ep).await;
	let rpc_server = peer.service.create_server("local", None).await.unwrap();
	let server_dealer = rpc_server.create_dealer();
	let echo_task = spawn_echo(server_dealer.clone(), rpc_server.id());

	let client = peer.service.create_client("local", 1).await.unwrap();
	let dealer = client.create_dealer();
	let mut req = RpcRequest::new();
	req.put(&String::from("self"));
	let mut resp = dealer.sync_rpc_call(req).await;
	assert_eq!(resp.error_code(), ErrorCode::Succ);
	assert_eq!(resp.get::<String>().unwrap(), "self");

	server_dealer.terminate();
	echo_task.await.unwrap();
	drop(server_dealer);
	drop(dealer);
	rpc_server.shutdown().await.unwrap();
	peer.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn routing_by_server_id_and_rank() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();

	let peer_a = start_peer(&ep).await;
	let peer_b = start_peer(&ep).await;
	let server_a = peer_a.service.create_server("routed", None).await.unwrap();
	let server_b = peer_b.service.create_server("routed", None).await.unwrap();
	assert_ne!(server_a.id(), server_b.id());

	let dealer_a = server_a.create_dealer();
	let dealer_b = server_b.create_dealer();
	let task_a = spawn_echo(dealer_a.clone(), server_a.id());
	let task_b = spawn_echo(dealer_b.clone(), server_b.id());

	let client_peer = start_peer(&ep).await;
	let client = client_peer.service.create_client("routed", 2).await.unwrap();
	let dealer = client.create_dealer();

	// Sticky routing by server id.
	for target in [server_a.id(), server_b.id()] {
		let mut req = RpcRequest::to_server(target);
		req.put(&String::from("sid"));
		let mut resp = dealer.sync_rpc_call(req).await;
		assert_eq!(resp.error_code(), ErrorCode::Succ);
		resp.get::<String>().unwrap();
		assert_eq!(resp.get::<i32>().unwrap(), target);
	}

	// Explicit rank routing.
	let mut req = RpcRequest::to_rank(peer_b.service.global_rank());
	req.put(&String::from("rank"));
	let mut resp = dealer.sync_rpc_call(req).await;
	assert_eq!(resp.error_code(), ErrorCode::Succ);
	resp.get::<String>().unwrap();
	assert_eq!(resp.get::<i32>().unwrap(), server_b.id());

	// Unrouted requests land on some live server of the service.
	let mut req = RpcRequest::new();
	req.put(&String::from("any"));
	let resp = dealer.sync_rpc_call(req).await;
	assert_eq!(resp.error_code(), ErrorCode::Succ);

	for d in [&dealer_a, &dealer_b] {
		d.terminate();
	}
	task_a.await.unwrap();
	task_b.await.unwrap();
	drop((dealer_a, dealer_b, dealer));
	server_a.shutdown().await.unwrap();
	server_b.shutdown().await.unwrap();
	client_peer.stop().await;
	peer_a.stop().await;
	peer_b.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn per_dealer_ordering_is_preserved() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();

	let server_peer = start_peer(&ep).await;
	let rpc_server = server_peer.service.create_server("ordered", None).await.unwrap();

	let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(usize, u32)>();
	let mut dealers = Vec::new();
	let mut tasks = Vec::new();
	for idx in 0..2usize {
		let dealer = rpc_server.create_dealer();
		dealers.push(dealer.clone());
		let seen_tx = seen_tx.clone();
		tasks.push(tokio::spawn(async move {
			while let Some(mut req) = dealer.recv_request(None).await {
				let ordinal: u32 = req.get().expect("ordinal");
				let _ = seen_tx.send((idx, ordinal));
			}
		}));
	}
	drop(seen_tx);

	let client_peer = start_peer(&ep).await;
	let client = client_peer.service.create_client("ordered", 1).await.unwrap();
	let dealer = client.create_dealer();
	const N: u32 = 1000;
	for ordinal in 0..N {
		let mut req = RpcRequest::new();
		req.put(&ordinal);
		dealer.send_request_one_way(req).await;
	}

	let mut per_dealer: [Vec<u32>; 2] = [Vec::new(), Vec::new()];
	for _ in 0..N {
		let (idx, ordinal) = seen_rx.recv().await.expect("request delivered");
		per_dealer[idx].push(ordinal);
	}
	// Work sharing may split the stream, but each dealer must observe its
	// share in send order.
	let mut all: Vec<u32> = Vec::new();
	for seq in &per_dealer {
		assert!(seq.windows(2).all(|w| w[0] < w[1]), "out of order: {seq:?}");
		all.extend(seq);
	}
	all.sort_unstable();
	let expected: Vec<u32> = (0..N).collect();
	assert_eq!(all, expected);

	for d in &dealers {
		d.terminate();
	}
	for task in tasks {
		task.await.unwrap();
	}
	drop(dealers);
	drop(dealer);
	rpc_server.shutdown().await.unwrap();
	client_peer.stop().await;
	server_peer.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn routing_miss_short_circuits_an_error() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();

	let peer = start_peer(&ep).await;
	// A dealer-only service with no servers anywhere.
	let dealer = peer.service.create_dealer("ghost").await.unwrap();
	let mut req = RpcRequest::new();
	req.put(&String::from("hello"));
	let resp = dealer.sync_rpc_call(req).await;
	assert_eq!(resp.error_code(), ErrorCode::NoSuchService);

	// recv with a timeout polls out empty.
	assert!(dealer.recv_response(Some(Duration::from_millis(10))).await.is_none());

	drop(dealer);
	peer.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn terminate_wakes_blocked_receivers() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();

	let peer = start_peer(&ep).await;
	let rpc_server = peer.service.create_server("sleepy", None).await.unwrap();
	let dealer = rpc_server.create_dealer();
	let blocked = {
		let dealer = dealer.clone();
		tokio::spawn(async move { dealer.recv_request(None).await })
	};
	tokio::task::yield_now().await;
	dealer.terminate();
	assert!(blocked.await.unwrap().is_none());

	drop(dealer);
	rpc_server.shutdown().await.unwrap();
	peer.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_survive_a_dead_server() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();

	let peer_a = start_peer(&ep).await;
	let peer_b = start_peer(&ep).await;
	let server_a = peer_a.service.create_server("ha", None).await.unwrap();
	let server_b = peer_b.service.create_server("ha", None).await.unwrap();
	let dealer_a = server_a.create_dealer();
	let dealer_b = server_b.create_dealer();
	let id_a = server_a.id();
	let task_a = spawn_echo(dealer_a.clone(), id_a);
	let task_b = spawn_echo(dealer_b.clone(), server_b.id());

	let client_peer = start_peer(&ep).await;
	let client = client_peer.service.create_client("ha", 2).await.unwrap();

	// Kill server A: its connections break and its ephemeral registration
	// disappears.
	dealer_a.terminate();
	task_a.await.unwrap();
	drop(dealer_a);
	drop(server_a);
	peer_a.stop().await;

	// Clients keep issuing requests; every attempt either times out, sees
	// a connection-class error, or succeeds against the survivor. A fresh
	// dealer after each failure resumes cleanly.
	let mut successes = 0;
	let mut attempts = 0;
	while successes < 5 {
		attempts += 1;
		assert!(attempts < 200, "survivor never answered");
		let dealer = client.create_dealer();
		let mut req = RpcRequest::new();
		req.put(&String::from("hello"));
		dealer.send_request(req).await;
		match dealer.recv_response(Some(Duration::from_millis(100))).await {
			Some(mut resp) if resp.error_code() == ErrorCode::Succ => {
				resp.get::<String>().unwrap();
				assert_ne!(resp.get::<i32>().unwrap(), id_a, "dead server answered");
				successes += 1;
			}
			_ => {
				// Timeout or ECONNECTION-class failure; retry.
				tokio::time::sleep(Duration::from_millis(20)).await;
			}
		}
	}

	dealer_b.terminate();
	task_b.await.unwrap();
	drop(dealer_b);
	server_b.shutdown().await.unwrap();
	client_peer.stop().await;
	peer_b.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}
