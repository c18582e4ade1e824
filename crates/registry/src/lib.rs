//! The coordination registry: a single authoritative node holding a
//! hierarchical key/value tree with ephemeral nodes, sequential children,
//! and path watches, plus the client that layers locks, barriers, id
//! generation and role-rank allocation on top of it.
//!
//! # Mental model
//!
//! - The server owns the tree. Every client connection is one full-duplex
//!   framed channel; all tree mutations happen under the server's single
//!   state lock.
//! - Every connection is implicitly subscribed to every path: each
//!   successful mutation broadcasts a one-way notification carrying the
//!   mutated path. Clients filter locally by invoking the callbacks
//!   registered for every prefix of the notified path.
//! - Ephemeral nodes are owned by the connection that created them and
//!   disappear together when it closes.
//! - Sequential children are `_` + a zero-padded 10-digit counter scoped to
//!   the parent; the counter is deleted with its node, so a recreated
//!   parent restarts at zero.
//!
//! # Failure modes
//!
//! - Server restart loses everything: the tree is in-memory only.
//! - A malformed request is logged and ignored; the connection stays up
//!   unless the framing itself breaks.
//! - A lost client connection triggers ephemeral cleanup plus watcher
//!   notifications for every removed path.

mod client;
mod server;
mod watch;

pub use client::RegistryClient;
pub use server::RegistryServer;
pub use watch::{WatcherHandle, WatcherTable};

use lattice_proto::ArchiveError;

/// Errors surfaced by the registry client.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	/// Transport-level failure.
	#[error("i/o: {0}")]
	Io(#[from] std::io::Error),
	/// The connection to the registry is gone and in-flight calls failed.
	#[error("connection to the registry lost")]
	ConnectionLost,
	/// The caller passed a path the registry would reject.
	#[error("invalid registry path: {0}")]
	InvalidPath(String),
	/// The registry replied with the ERROR status: protocol misuse.
	#[error("registry rejected operation on {0}")]
	Rejected(String),
	/// A node this operation requires does not exist.
	#[error("registry node missing: {0}")]
	Missing(String),
	/// A reply failed to decode.
	#[error("malformed registry reply: {0}")]
	Archive(#[from] ArchiveError),
	/// Released a lock that this client does not hold.
	#[error("lock {0} is not held")]
	NotLocked(String),
	/// An invariant the caller relies on did not hold.
	#[error("unexpected registry state: {0}")]
	State(String),
}

#[cfg(test)]
mod tests;
