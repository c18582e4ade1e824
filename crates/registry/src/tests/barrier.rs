//! Barrier atomicity and reuse.

use std::time::Duration;

use super::{shutdown, start_registry};
use crate::RegistryClient;

async fn run_round(ep: &str, name: &str, n: usize) -> Vec<RegistryClient> {
	let mut clients = Vec::new();
	let mut tasks = Vec::new();
	for _ in 0..n {
		let client = RegistryClient::connect(ep).await.unwrap();
		clients.push(client.clone());
		let name = name.to_string();
		tasks.push(tokio::spawn(async move {
			client.barrier(&name, n).await.unwrap();
		}));
	}
	for task in tasks {
		task.await.unwrap();
	}
	clients
}

#[tokio::test(flavor = "multi_thread")]
async fn nobody_returns_before_the_last_arrival() {
	let (server, ep) = start_registry().await;
	let mut clients = Vec::new();
	let mut early = Vec::new();
	for _ in 0..4 {
		let client = RegistryClient::connect(&ep).await.unwrap();
		clients.push(client.clone());
		early.push(tokio::spawn(async move {
			client.barrier("b1", 5).await.unwrap();
		}));
	}
	tokio::time::sleep(Duration::from_millis(200)).await;
	for task in &early {
		assert!(!task.is_finished(), "barrier released before everyone entered");
	}

	let last = RegistryClient::connect(&ep).await.unwrap();
	clients.push(last.clone());
	last.barrier("b1", 5).await.unwrap();
	for task in early {
		task.await.unwrap();
	}

	shutdown(server, clients).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn barrier_names_are_reusable() {
	let (server, ep) = start_registry().await;
	let mut clients = Vec::new();
	clients.extend(run_round(&ep, "b1", 5).await);
	clients.extend(run_round(&ep, "b1", 3).await);
	clients.extend(run_round(&ep, "b2", 4).await);
	clients.extend(run_round(&ep, "b1", 5).await);
	shutdown(server, clients).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn single_participant_barrier_returns() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();
	client.barrier("solo", 1).await.unwrap();
	client.barrier("solo", 1).await.unwrap();
	shutdown(server, vec![client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn alloc_role_rank_assigns_dense_ranks() {
	let (server, ep) = start_registry().await;
	let mut clients = Vec::new();
	let mut tasks = Vec::new();
	for g_rank in 0..3i16 {
		let client = RegistryClient::connect(&ep).await.unwrap();
		clients.push(client.clone());
		tasks.push(tokio::spawn(async move {
			client.alloc_role_rank("worker", 3, g_rank * 10).await.unwrap()
		}));
	}
	let mut role_ranks = Vec::new();
	let mut alls = Vec::new();
	for task in tasks {
		let (role_rank, all) = task.await.unwrap();
		role_ranks.push(role_rank);
		alls.push(all);
	}
	role_ranks.sort_unstable();
	assert_eq!(role_ranks, vec![0, 1, 2]);
	// Every participant observes the same role-rank → global-rank table.
	for all in &alls {
		assert_eq!(all.len(), 3);
		assert_eq!(*all, alls[0]);
	}

	shutdown(server, clients).await;
}
