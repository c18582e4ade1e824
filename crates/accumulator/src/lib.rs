//! The accumulator: a named, add-only reduction variable held by a central
//! server and updated by write-behind batches from all peers; plus the
//! RPC-level barrier service (barrier / counted barrier / aggregate).
//!
//! Aggregators are trait objects created from wire type names through an
//! explicit [`AggregatorRegistry`]; the client and server are ordinary
//! services constructed against an [`lattice_rpc::RpcService`], not process
//! singletons.

mod aggregator;
mod barrier;
mod client;
mod server;

pub use aggregator::{
	Aggregate, Aggregator, AggregatorRegistry, AvgAggregator, MaxAggregator, MinAggregator,
	SumAggregator,
};
pub use barrier::{BarrierService, BARRIER_SERVICE_API};
pub use client::{Accumulator, AccumulatorClient};
pub use server::AccumulatorServer;

use lattice_proto::{ArchiveError, ErrorCode};
use lattice_rpc::RpcError;

/// Service name the accumulator registers under.
pub const ACCUMULATOR_SERVICE_API: &str = "_ACCUMULATOR_SERVICE_API";

/// Accumulator request op codes (first body byte).
pub(crate) const OP_READ: u8 = b'R';
pub(crate) const OP_WRITE: u8 = b'W';
pub(crate) const OP_RESET: u8 = b'C';
pub(crate) const OP_ERASE: u8 = b'E';
pub(crate) const OP_ERASE_ALL: u8 = b'A';
pub(crate) const OP_WAIT_EMPTY: u8 = b'I';
pub(crate) const OP_START: u8 = b'0';
pub(crate) const OP_STOP: u8 = b'1';

/// Errors surfaced by the accumulator and barrier clients.
#[derive(Debug, thiserror::Error)]
pub enum AccumulatorError {
	/// The underlying RPC layer failed.
	#[error("rpc: {0}")]
	Rpc(#[from] RpcError),
	/// The server answered with a non-success code.
	#[error("server replied {0:?}")]
	Server(ErrorCode),
	/// A reply failed to decode.
	#[error("malformed reply: {0}")]
	Archive(#[from] ArchiveError),
	/// A collective answered for a different name than was asked.
	#[error("collective answered for unexpected name {0}")]
	NameMismatch(String),
}

#[cfg(test)]
mod tests;
