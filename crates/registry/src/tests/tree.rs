//! Tree path discipline: add/get/set/del/sub semantics, ephemeral cleanup,
//! and ancestor watch notifications.

use std::sync::Arc;

use lattice_primitives::AsyncWatcher;

use super::{shutdown, start_registry};
use crate::{RegistryClient, RegistryError};

#[tokio::test(flavor = "multi_thread")]
async fn add_get_set_del_roundtrip() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();

	assert!(client.node_add("/root/a", "one", false).await.unwrap());
	assert_eq!(client.node_get("/root/a").await.unwrap().as_deref(), Some("one"));

	// A second add of the same path fails without clobbering the value.
	assert!(!client.node_add("/root/a", "two", false).await.unwrap());
	assert_eq!(client.node_get("/root/a").await.unwrap().as_deref(), Some("one"));

	assert!(client.node_set("/root/a", "two").await.unwrap());
	assert_eq!(client.node_get("/root/a").await.unwrap().as_deref(), Some("two"));

	assert!(client.node_del("/root/a").await.unwrap());
	assert_eq!(client.node_get("/root/a").await.unwrap(), None);
	assert!(!client.node_del("/root/a").await.unwrap());

	shutdown(server, vec![client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn add_requires_usable_parent() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();

	// Missing parent.
	assert!(!client.node_add("/root/no/such", "", false).await.unwrap());

	// Ephemeral parent.
	assert!(client.node_add("/root/eph", "", true).await.unwrap());
	assert!(!client.node_add("/root/eph/child", "", false).await.unwrap());

	shutdown(server, vec![client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn del_refuses_non_leaf() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();

	client.node_add("/root/dir", "", false).await.unwrap();
	client.node_add("/root/dir/leaf", "", false).await.unwrap();
	assert!(!client.node_del("/root/dir").await.unwrap());
	assert!(client.node_del("/root/dir/leaf").await.unwrap());
	assert!(client.node_del("/root/dir").await.unwrap());

	shutdown(server, vec![client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sub_lists_children_sorted() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();

	client.node_add("/root/d", "", false).await.unwrap();
	for key in ["b", "a", "c"] {
		client.node_add(&format!("/root/d/{key}"), "", false).await.unwrap();
	}
	let children = client.node_sub("/root/d").await.unwrap().unwrap();
	assert_eq!(children, vec!["a", "b", "c"]);
	assert_eq!(client.node_sub("/root/missing").await.unwrap(), None);

	shutdown(server, vec![client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_paths_are_rejected_client_side() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();

	for path in ["", "a", "/a/", "/a//b"] {
		let err = client.node_add(path, "", false).await.unwrap_err();
		assert!(matches!(err, RegistryError::InvalidPath(_)), "path {path:?}");
	}

	shutdown(server, vec![client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ephemeral_nodes_die_with_their_connection() {
	let (server, ep) = start_registry().await;
	let watcher_client = RegistryClient::connect(&ep).await.unwrap();
	let ephemeral_client = RegistryClient::connect(&ep).await.unwrap();

	let watcher = Arc::new(AsyncWatcher::new());
	let handle = {
		let watcher = watcher.clone();
		watcher_client
			.watch("/root/_node_", move || watcher.notify())
			.unwrap()
	};

	ephemeral_client
		.register_node(&lattice_proto::CommInfo {
			global_rank: 9,
			endpoint: "127.0.0.1:1".to_string(),
		})
		.await
		.unwrap();

	// Wait until the registration is visible.
	loop {
		let seen = watcher.version();
		if !watcher_client.comm_info().await.unwrap().is_empty() {
			break;
		}
		watcher.wait_change(seen).await;
	}

	// The goodbye removes every node the connection owned and notifies the
	// ancestors of each removed path.
	ephemeral_client.finalize().await.unwrap();
	loop {
		let seen = watcher.version();
		if watcher_client.comm_info().await.unwrap().is_empty() {
			break;
		}
		watcher.wait_change(seen).await;
	}
	watcher_client.cancel_watch(handle);

	shutdown(server, vec![watcher_client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn model_and_context_storage() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();

	assert!(client.add_model("m", "v1").await.unwrap());
	assert!(client.set_model("m", "v2").await.unwrap());
	assert_eq!(client.get_model("m").await.unwrap().as_deref(), Some("v2"));
	assert_eq!(client.model_names().await.unwrap(), vec!["m"]);
	assert!(client.del_model("m").await.unwrap());

	assert!(client.add_context(3, "ctx").await.unwrap());
	assert_eq!(client.get_context(3).await.unwrap().as_deref(), Some("ctx"));
	assert_eq!(client.storage_list().await.unwrap(), vec![3]);
	assert!(client.delete_storage(3).await.unwrap());

	shutdown(server, vec![client]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn task_state_markers() {
	let (server, ep) = start_registry().await;
	let client = RegistryClient::connect(&ep).await.unwrap();
	let other = RegistryClient::connect(&ep).await.unwrap();

	assert!(!client.get_task_ready().await.unwrap());
	let waiter = {
		let client = client.clone();
		tokio::spawn(async move { client.wait_task_ready().await })
	};
	tokio::task::yield_now().await;
	other.set_task_ready().await.unwrap();
	waiter.await.unwrap().unwrap();

	assert!(other.set_task_failed("boom").await.unwrap());
	assert_eq!(
		client.get_task_failed().await.unwrap().as_deref(),
		Some("boom")
	);

	shutdown(server, vec![client, other]).await;
}
