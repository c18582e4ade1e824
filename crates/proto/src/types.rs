//! Registry-visible types: peer identity, service records, and the registry
//! request/status enums with their wire discriminants.

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveError;

/// Global rank of a process. −1 means unassigned.
pub type CommRank = i16;

/// Identity of a peer process as stored under `_node_/<rank>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommInfo {
	/// Registry-allocated global rank.
	pub global_rank: CommRank,
	/// `ip:port` the peer accepts connections on.
	pub endpoint: String,
}

impl CommInfo {
	/// Stable JSON form used for registry storage and the handshake.
	#[must_use]
	pub fn to_json(&self) -> String {
		serde_json::to_string(self).expect("CommInfo is always serializable")
	}

	/// Parses the JSON form.
	pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(raw)
	}
}

impl std::fmt::Display for CommInfo {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "node[ep: {}, g_rank: {}]", self.endpoint, self.global_rank)
	}
}

/// One server instance of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
	/// Stable id of the server within its service.
	pub server_id: i32,
	/// Rank of the process hosting it.
	pub global_rank: CommRank,
}

/// A service record: name, stable rpc id, and the live server set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcServiceInfo {
	/// The service name within its api namespace.
	pub rpc_service_name: String,
	/// Registry-allocated stable id, carried in every message head.
	pub rpc_id: i32,
	/// Currently registered server instances.
	pub servers: Vec<ServerInfo>,
}

/// Registry request op codes (first body byte of a registry request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistryOp {
	/// Generate a sequential child.
	Gen = 0,
	/// Create a node.
	Add = 1,
	/// Delete a leaf.
	Del = 2,
	/// Read a node value.
	Get = 3,
	/// Update a node value.
	Set = 4,
	/// List child keys.
	Sub = 5,
	/// Initiate server shutdown.
	Exit = 6,
	/// Polite goodbye; drops the connection's ephemeral nodes.
	ClientFinalize = 7,
}

impl TryFrom<u8> for RegistryOp {
	type Error = ArchiveError;

	fn try_from(value: u8) -> Result<Self, ArchiveError> {
		Ok(match value {
			0 => Self::Gen,
			1 => Self::Add,
			2 => Self::Del,
			3 => Self::Get,
			4 => Self::Set,
			5 => Self::Sub,
			6 => Self::Exit,
			7 => Self::ClientFinalize,
			value => {
				return Err(ArchiveError::BadDiscriminant {
					value,
					what: "RegistryOp",
				});
			}
		})
	}
}

/// Registry reply status (first body byte of a registry response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistryStatus {
	/// The operation succeeded.
	Ok = 0,
	/// The addressed node was missing (or, for ADD, already present).
	NodeFailed = 1,
	/// The parent path was unusable (missing, ephemeral, or has children).
	PathFailed = 2,
	/// The connection to the registry was lost mid-call.
	Disconnected = 3,
	/// Protocol misuse: invalid path or malformed arguments.
	Error = 4,
}

impl TryFrom<u8> for RegistryStatus {
	type Error = ArchiveError;

	fn try_from(value: u8) -> Result<Self, ArchiveError> {
		Ok(match value {
			0 => Self::Ok,
			1 => Self::NodeFailed,
			2 => Self::PathFailed,
			3 => Self::Disconnected,
			4 => Self::Error,
			value => {
				return Err(ArchiveError::BadDiscriminant {
					value,
					what: "RegistryStatus",
				});
			}
		})
	}
}

/// Validates a registry tree path: non-empty, leading `/`, no empty
/// segments, no trailing `/`.
#[must_use]
pub fn check_valid_path(path: &str) -> bool {
	if path.is_empty() || !path.starts_with('/') {
		return false;
	}
	let bytes = path.as_bytes();
	for (i, b) in bytes.iter().enumerate() {
		if *b == b'/' && (i + 1 == bytes.len() || bytes[i + 1] == b'/') {
			return false;
		}
	}
	true
}
