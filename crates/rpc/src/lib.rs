//! The RPC layer: per-peer front-ends, the process-wide routing context,
//! user-facing dealers, and the service facade that keeps the routing
//! tables in sync with the registry.
//!
//! # Mental model
//!
//! - A process runs one [`RpcService`] per api namespace. Starting it
//!   allocates a global rank, binds the accept endpoint, registers the node
//!   under the registry, and spawns the topology watcher.
//! - The [`RpcContext`] is the single routing authority: rank → front-end
//!   (client-socket and server-socket sides), service → fair queue of
//!   server dealers, dealer id → client inbox.
//! - A [`Dealer`] is the user-visible send/recv handle. Client dealers own
//!   a response channel; server dealers own a request channel. Responses
//!   carry the originating dealer id, so routing back is deterministic.
//! - Requests route by explicit server id, then explicit destination rank,
//!   then round-robin over the service's servers. A routing miss
//!   short-circuits an error response into the caller's inbox.
//! - A send failure marks the front-end EPIPE; queued requests are
//!   re-routed through the context, queued responses are dropped and the
//!   remote client recovers by timeout. After a 10 s cool-down the
//!   front-end becomes reconnectable.
//!
//! Retrying a request after EPIPE reuses the serialized bytes, so services
//! addressed through this layer are expected to tolerate duplicate
//! delivery of a request they may have already partially processed.

mod context;
mod dealer;
mod fair_queue;
mod frontend;
mod rpc_client;
mod rpc_server;
mod service;

pub use context::RpcContext;
pub use dealer::Dealer;
pub use rpc_client::RpcClient;
pub use rpc_server::RpcServer;
pub use service::{RpcConfig, RpcService};

use lattice_registry::RegistryError;

/// Errors surfaced by the RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
	/// Transport-level failure.
	#[error("i/o: {0}")]
	Io(#[from] std::io::Error),
	/// A registry operation backing this call failed.
	#[error("registry: {0}")]
	Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests;
