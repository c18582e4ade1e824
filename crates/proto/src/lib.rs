//! Shared wire types for the lattice communication core.
//!
//! This crate defines everything that crosses a socket: the fixed message
//! head, the eager and lazy archives, the framed codec with its zero-copy
//! side channel, the handshake socket, and the registry protocol enums.

pub mod archive;
pub mod codec;
pub mod message;
pub mod socket;
pub mod types;

pub use archive::{Archive, ArchiveError, ArchiveValue};
pub use message::{
	ErrorCode, Message, MessageHead, RpcRequest, RpcResponse, HEAD_LEN, MIN_ZERO_COPY_SIZE,
	WATCHER_NOTIFY_RPC_ID,
};
pub use types::{
	check_valid_path, CommInfo, CommRank, RegistryOp, RegistryStatus, RpcServiceInfo, ServerInfo,
};
