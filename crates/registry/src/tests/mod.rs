//! Registry integration tests: one in-process server, real TCP clients.

mod barrier;
mod services;
mod tree;

use crate::{RegistryClient, RegistryServer};

pub(crate) async fn start_registry() -> (RegistryServer, String) {
	let server = RegistryServer::bind("127.0.0.1").await.expect("bind registry");
	let endpoint = server.endpoint().to_string();
	(server, endpoint)
}

pub(crate) async fn shutdown(server: RegistryServer, clients: Vec<RegistryClient>) {
	for client in &clients {
		client.finalize().await.expect("finalize client");
	}
	drop(clients);
	server.exit().await.expect("request exit");
	server.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_and_shutdown() {
	let (server, endpoint) = start_registry().await;
	let client = RegistryClient::connect(&endpoint).await.expect("connect");
	shutdown(server, vec![client]).await;
}
