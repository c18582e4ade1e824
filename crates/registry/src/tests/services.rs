//! Service registration: stable rpc ids, server records, watches.

use std::sync::Arc;

use lattice_primitives::AsyncWatcher;

use super::{shutdown, start_registry};
use crate::RegistryClient;

#[tokio::test(flavor = "multi_thread")]
async fn rpc_id_is_stable_across_clients() {
	let (server, ep) = start_registry().await;
	let a = RegistryClient::connect(&ep).await.unwrap();
	let b = RegistryClient::connect(&ep).await.unwrap();

	let id_a = a.register_rpc_service("api", "echo").await.unwrap();
	let id_b = b.register_rpc_service("api", "echo").await.unwrap();
	assert_eq!(id_a, id_b);
	let id_other = a.register_rpc_service("api", "other").await.unwrap();
	assert_ne!(id_a, id_other);

	shutdown(server, vec![a, b]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn server_registration_roundtrip() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();

	let (rpc_id, server_id) = client
		.register_server("api", "echo", 4, None)
		.await
		.unwrap();
	let info = client.rpc_service_info("api", "echo").await.unwrap().unwrap();
	assert_eq!(info.rpc_id, rpc_id);
	assert_eq!(info.servers.len(), 1);
	assert_eq!(info.servers[0].server_id, server_id);
	assert_eq!(info.servers[0].global_rank, 4);

	assert!(client
		.deregister_server("api", "echo", server_id)
		.await
		.unwrap());
	let info = client.rpc_service_info("api", "echo").await.unwrap().unwrap();
	assert!(info.servers.is_empty());

	assert!(client.deregister_rpc_service("api", "echo").await.unwrap());
	assert!(client.rpc_service_info("api", "echo").await.unwrap().is_none());

	shutdown(server, vec![client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn service_watch_fires_on_registration() {
	let (server, ep) = start_registry().await;
	let watcher_client = RegistryClient::connect(&ep).await.unwrap();
	let registrant = RegistryClient::connect(&ep).await.unwrap();

	let watcher = Arc::new(AsyncWatcher::new());
	let handle = {
		let watcher = watcher.clone();
		watcher_client
			.watch_rpc_service_info("api", move || watcher.notify())
			.await
			.unwrap()
	};

	registrant
		.register_server("api", "echo", 1, None)
		.await
		.unwrap();

	loop {
		let seen = watcher.version();
		let infos = watcher_client.all_rpc_service_info("api").await.unwrap();
		if infos.is_some_and(|list| list.iter().any(|i| !i.servers.is_empty())) {
			break;
		}
		watcher.wait_change(seen).await;
	}
	watcher_client.cancel_watch(handle);

	// The ephemeral server record disappears with its connection.
	registrant.finalize().await.unwrap();
	let watcher = Arc::new(AsyncWatcher::new());
	let handle = {
		let watcher = watcher.clone();
		watcher_client
			.watch_rpc_service_info("api", move || watcher.notify())
			.await
			.unwrap()
	};
	loop {
		let seen = watcher.version();
		let info = watcher_client.rpc_service_info("api", "echo").await.unwrap();
		if info.is_some_and(|i| i.servers.is_empty()) {
			break;
		}
		watcher.wait_change(seen).await;
	}
	watcher_client.cancel_watch(handle);

	shutdown(server, vec![watcher_client]).await;
}
