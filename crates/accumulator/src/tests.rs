//! Accumulator and barrier-collective integration tests.

use std::sync::Arc;

use lattice_proto::Archive;
use lattice_registry::{RegistryClient, RegistryServer};
use lattice_rpc::{RpcConfig, RpcService};

use crate::{
	Accumulator, AccumulatorClient, AccumulatorServer, AggregatorRegistry, AvgAggregator,
	BarrierService, MaxAggregator, MinAggregator, SumAggregator,
};

const API: &str = "acc_api";

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

fn aggregator_registry() -> Arc<AggregatorRegistry> {
	let registry = AggregatorRegistry::new();
	registry.register::<SumAggregator<u64>>();
	registry.register::<MinAggregator<i64>>();
	registry.register::<MaxAggregator<i64>>();
	registry.register::<AvgAggregator<f64>>();
	Arc::new(registry)
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_writers_sum_exactly() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();
	let aggs = aggregator_registry();

	let host = start_peer(&ep).await;
	let server = AccumulatorServer::start(&host.service, aggs.clone()).await.unwrap();

	let worker = start_peer(&ep).await;
	let host_client = AccumulatorClient::start(&host.service, aggs.clone()).await.unwrap();
	let worker_client = AccumulatorClient::start(&worker.service, aggs.clone()).await.unwrap();

	// Several tasks per client, each writing 1..=100 through its own
	// holder with a small flush batch.
	let mut tasks = Vec::new();
	for client in [&host_client, &worker_client] {
		for _ in 0..4 {
			let client = client.clone();
			tasks.push(tokio::spawn(async move {
				let acc =
					Accumulator::<SumAggregator<u64>>::with_flush_freq(&client, "sum", 7, true);
				for v in 1..=100u64 {
					assert!(acc.write(v));
				}
				drop(acc); // final flush
			}));
		}
	}
	for task in tasks {
		task.await.unwrap();
	}
	host_client.wait_empty().await;
	worker_client.wait_empty().await;

	let total = host_client
		.read::<SumAggregator<u64>>("sum")
		.await
		.expect("sum readable");
	assert_eq!(*total.value(), 5050 * 4 * 2);

	host_client.finalize().await.unwrap();
	worker_client.finalize().await.unwrap();
	server.shutdown().await.unwrap();
	worker.stop().await;
	host.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn min_max_avg_and_reset() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();
	let aggs = aggregator_registry();

	let host = start_peer(&ep).await;
	let server = AccumulatorServer::start(&host.service, aggs.clone()).await.unwrap();
	let client = AccumulatorClient::start(&host.service, aggs.clone()).await.unwrap();

	let min = Accumulator::<MinAggregator<i64>>::with_flush_freq(&client, "min", 1, false);
	let max = Accumulator::<MaxAggregator<i64>>::with_flush_freq(&client, "max", 1, false);
	let avg = Accumulator::<AvgAggregator<f64>>::with_flush_freq(&client, "avg", 1, false);
	for v in [3i64, -5, 12, 0] {
		min.write(v);
		max.write(v);
		avg.write(v as f64);
	}
	client.wait_empty().await;

	assert_eq!(min.read().await.unwrap().value(), Some(&-5));
	assert_eq!(max.read().await.unwrap().value(), Some(&12));
	assert_eq!(avg.read().await.unwrap().average(), Some(2.5));

	// Reset wipes the authoritative value, not the local holders.
	assert!(max.reset().await);
	assert_eq!(max.read().await.unwrap().value(), None);

	// Unknown names surface as a warning plus None.
	assert!(client.read::<SumAggregator<u64>>("nope").await.is_none());

	// Erase removes the server entry entirely.
	assert!(min.erase().await);
	assert!(client.read::<MinAggregator<i64>>("min").await.is_none());

	drop((min, max, avg));
	client.finalize().await.unwrap();
	server.shutdown().await.unwrap();
	host.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn server_waits_for_all_clients_to_stop() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();
	let aggs = aggregator_registry();

	let host = start_peer(&ep).await;
	let server = AccumulatorServer::start(&host.service, aggs.clone()).await.unwrap();
	let a = AccumulatorClient::start(&host.service, aggs.clone()).await.unwrap();
	let b = AccumulatorClient::start(&host.service, aggs.clone()).await.unwrap();

	a.finalize().await.unwrap();
	b.finalize().await.unwrap();
	// With both clients gone the request loop drains by itself.
	server.wait().await;

	host.stop().await;
	reg.exit().await.unwrap();
	reg.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_barrier_and_aggregate() {
	let reg = RegistryServer::bind("127.0.0.1").await.unwrap();
	let ep = reg.endpoint().to_string();

	const N: usize = 3;
	let mut peers = Vec::new();
	for _ in 0..N {
		peers.push(start_peer(&ep).await);
	}

	// Rank assignment follows service start order in this test.
	let mut tasks = Vec::new();
	for (idx, peer) in peers.iter().enumerate() {
		let service = peer.service.clone();
		let registry = peer.registry.clone();
		tasks.push(tokio::spawn(async move {
			let rank = service.global_rank();
			let barrier = BarrierService::start(&service, &registry, rank, N)
				.await
				.expect("start barrier service");
			if rank == 0 {
				barrier.register_aggregate_function("sum", |incoming, acc| {
					let a = incoming.get::<u64>().expect("incoming value");
					let b = acc.get::<u64>().expect("accumulated value");
					let mut folded = Archive::new();
					folded.put(&(a + b));
					*acc = folded;
				});
			}

			barrier.wait("round1").await.expect("barrier round1");

			let mut data = Archive::new();
			data.put(&(idx as u64 + 1));
			let mut folded = barrier
				.aggregate("reduce1", N as u64, 1, &data, "sum")
				.await
				.expect("aggregate");
			let total = folded.get::<u64>().expect("folded value");
			assert_eq!(total, (1..=N as u64).sum::<u64>());

			barrier.count("counted", 6, 2).await.expect("counted barrier");
			barrier.wait("round2").await.expect("barrier round2");
			barrier
		}));
	}

	let mut barriers = Vec::new();
	for task in tasks {
		barriers.push(task.await.unwrap());
	}
	for barrier in barriers {
		barrier.shutdown().await.unwrap();
	}
	for peer in peers {
		peer.stop().await;
	}
	reg.exit().await.unwrap();
	reg.wait().await;
}
