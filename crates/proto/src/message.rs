//! The wire message: fixed head, eager body, zero or more extra blocks.
//!
//! A [`Message`] is the unit every socket sends and receives. Requests and
//! responses are thin views over it that add archive cursors and the
//! response-from-request head swap.

use bytes::Bytes;

use crate::archive::{Archive, ArchiveError, ArchiveValue};
use crate::types::CommRank;

/// Encoded size of a [`MessageHead`].
pub const HEAD_LEN: usize = 26;

/// Blocks below this size are always sent inline on the primary stream.
pub const MIN_ZERO_COPY_SIZE: usize = 4096;

/// Reserved rpc id carried by registry watch notifications.
pub const WATCHER_NOTIFY_RPC_ID: i32 = -1;

/// Wire-visible error codes carried in the message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ErrorCode {
	/// No error.
	#[default]
	Succ = 0,
	/// No server with the requested server id.
	NoSuchServer = 1,
	/// No peer with the requested rank.
	NoSuchRank = 2,
	/// No server registered for the requested service.
	NoSuchService = 3,
	/// The connection to the target failed.
	Connection = 4,
	/// The named entity does not exist on the server.
	NotFound = 5,
}

impl TryFrom<u8> for ErrorCode {
	type Error = ArchiveError;

	fn try_from(value: u8) -> Result<Self, ArchiveError> {
		Ok(match value {
			0 => Self::Succ,
			1 => Self::NoSuchServer,
			2 => Self::NoSuchRank,
			3 => Self::NoSuchService,
			4 => Self::Connection,
			5 => Self::NotFound,
			value => {
				return Err(ArchiveError::BadDiscriminant {
					value,
					what: "ErrorCode",
				});
			}
		})
	}
}

/// Fixed little-endian message head.
///
/// `sid` is the sticky server id; −1 means the request is not pinned to a
/// particular server instance. Dealer ids of −1 mean "no reply expected"
/// (requests) or "not yet routed" (responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHead {
	/// Rank of the sending process.
	pub src_rank: CommRank,
	/// Rank of the destination process.
	pub dest_rank: CommRank,
	/// Dealer that sent the request; responses are routed back to it.
	pub src_dealer: i32,
	/// Dealer the message is addressed to.
	pub dest_dealer: i32,
	/// Stable service id, or a correlation id on the registry channel.
	pub rpc_id: i32,
	/// Sticky server id within the service.
	pub sid: i32,
	/// Error code; non-zero only on responses.
	pub error_code: ErrorCode,
	/// Number of extra blocks that follow the body.
	pub extra_block_count: u8,
	/// Byte length of the eager body.
	pub body_size: u32,
}

impl Default for MessageHead {
	fn default() -> Self {
		Self {
			src_rank: -1,
			dest_rank: -1,
			src_dealer: -1,
			dest_dealer: -1,
			rpc_id: -1,
			sid: -1,
			error_code: ErrorCode::Succ,
			extra_block_count: 0,
			body_size: 0,
		}
	}
}

impl MessageHead {
	/// Encodes the head into its fixed wire layout.
	#[must_use]
	pub fn encode(&self) -> [u8; HEAD_LEN] {
		let mut out = [0u8; HEAD_LEN];
		out[0..2].copy_from_slice(&self.src_rank.to_le_bytes());
		out[2..4].copy_from_slice(&self.dest_rank.to_le_bytes());
		out[4..8].copy_from_slice(&self.src_dealer.to_le_bytes());
		out[8..12].copy_from_slice(&self.dest_dealer.to_le_bytes());
		out[12..16].copy_from_slice(&self.rpc_id.to_le_bytes());
		out[16..20].copy_from_slice(&self.sid.to_le_bytes());
		out[20] = self.error_code as u8;
		out[21] = self.extra_block_count;
		out[22..26].copy_from_slice(&self.body_size.to_le_bytes());
		out
	}

	/// Decodes a head from its fixed wire layout.
	pub fn decode(raw: &[u8; HEAD_LEN]) -> Result<Self, ArchiveError> {
		Ok(Self {
			src_rank: CommRank::from_le_bytes(raw[0..2].try_into().expect("sized")),
			dest_rank: CommRank::from_le_bytes(raw[2..4].try_into().expect("sized")),
			src_dealer: i32::from_le_bytes(raw[4..8].try_into().expect("sized")),
			dest_dealer: i32::from_le_bytes(raw[8..12].try_into().expect("sized")),
			rpc_id: i32::from_le_bytes(raw[12..16].try_into().expect("sized")),
			sid: i32::from_le_bytes(raw[16..20].try_into().expect("sized")),
			error_code: ErrorCode::try_from(raw[20])?,
			extra_block_count: raw[21],
			body_size: u32::from_le_bytes(raw[22..26].try_into().expect("sized")),
		})
	}
}

/// A complete wire unit: head, eager body, extra blocks.
///
/// Extra blocks keep shared ownership of the caller's buffer; the refcount
/// drops once the writer task has put the bytes on the wire.
#[derive(Debug, Clone, Default)]
pub struct Message {
	/// The fixed head. `body_size` and `extra_block_count` are kept in sync
	/// with the payload by the constructors.
	pub head: MessageHead,
	/// The eager body.
	pub body: Bytes,
	/// Out-of-band payload blocks, in lazy-archive order.
	pub blocks: Vec<Bytes>,
}

impl Message {
	/// Assembles a message, stamping the payload sizes into the head.
	#[must_use]
	pub fn new(mut head: MessageHead, body: Bytes, blocks: Vec<Bytes>) -> Self {
		head.body_size = body.len() as u32;
		head.extra_block_count = blocks.len() as u8;
		Self { head, body, blocks }
	}
}

/// An outgoing or received request.
#[derive(Debug, Default)]
pub struct RpcRequest {
	/// Routing head; the dealer stamps source fields on send.
	pub head: MessageHead,
	archive: Archive,
	blocks: Vec<Bytes>,
}

impl RpcRequest {
	/// Creates an empty request with an unrouted head.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a request addressed to an explicit rank.
	#[must_use]
	pub fn to_rank(rank: CommRank) -> Self {
		let mut req = Self::new();
		req.head.dest_rank = rank;
		req
	}

	/// Creates a request pinned to an explicit server id.
	#[must_use]
	pub fn to_server(sid: i32) -> Self {
		let mut req = Self::new();
		req.head.sid = sid;
		req
	}

	/// Rebuilds a request from a received message.
	#[must_use]
	pub fn from_message(msg: Message) -> Self {
		Self {
			head: msg.head,
			archive: Archive::from_bytes(&msg.body),
			blocks: msg.blocks,
		}
	}

	/// The eager body archive.
	pub fn archive(&mut self) -> &mut Archive {
		&mut self.archive
	}

	/// Appends a value to the body.
	pub fn put<T: ArchiveValue>(&mut self, value: &T) -> &mut Self {
		self.archive.put(value);
		self
	}

	/// Consumes the next value from the body.
	pub fn get<T: ArchiveValue>(&mut self) -> Result<T, ArchiveError> {
		self.archive.get()
	}

	/// Attaches a zero-copy block. The buffer is shared, not copied.
	pub fn add_block(&mut self, block: Bytes) {
		self.blocks.push(block);
	}

	/// Detaches the next zero-copy block, in lazy-archive order.
	pub fn take_block(&mut self) -> Option<Bytes> {
		if self.blocks.is_empty() {
			None
		} else {
			Some(self.blocks.remove(0))
		}
	}

	/// Received blocks, in order.
	#[must_use]
	pub fn blocks(&self) -> &[Bytes] {
		&self.blocks
	}

	/// Finalizes into a wire message.
	#[must_use]
	pub fn into_message(self) -> Message {
		Message::new(self.head, self.archive.into_bytes(), self.blocks)
	}
}

/// An outgoing or received response.
#[derive(Debug, Default)]
pub struct RpcResponse {
	/// Routing head, inherited from the request with src/dest swapped.
	pub head: MessageHead,
	archive: Archive,
	blocks: Vec<Bytes>,
}

impl RpcResponse {
	/// Builds a response whose head routes back to the request's source.
	#[must_use]
	pub fn from_request(req: &RpcRequest) -> Self {
		let head = MessageHead {
			src_rank: req.head.dest_rank,
			dest_rank: req.head.src_rank,
			dest_dealer: req.head.src_dealer,
			rpc_id: req.head.rpc_id,
			sid: req.head.sid,
			..MessageHead::default()
		};
		Self {
			head,
			archive: Archive::new(),
			blocks: Vec::new(),
		}
	}

	/// Builds a standalone error response delivered without a round trip.
	#[must_use]
	pub fn error(code: ErrorCode) -> Self {
		let mut resp = Self::default();
		resp.head.error_code = code;
		resp
	}

	/// Rebuilds a response from a received message.
	#[must_use]
	pub fn from_message(msg: Message) -> Self {
		Self {
			head: msg.head,
			archive: Archive::from_bytes(&msg.body),
			blocks: msg.blocks,
		}
	}

	/// The error code carried in the head.
	#[must_use]
	pub fn error_code(&self) -> ErrorCode {
		self.head.error_code
	}

	/// Sets the error code.
	pub fn set_error_code(&mut self, code: ErrorCode) {
		self.head.error_code = code;
	}

	/// The eager body archive.
	pub fn archive(&mut self) -> &mut Archive {
		&mut self.archive
	}

	/// Appends a value to the body.
	pub fn put<T: ArchiveValue>(&mut self, value: &T) -> &mut Self {
		self.archive.put(value);
		self
	}

	/// Consumes the next value from the body.
	pub fn get<T: ArchiveValue>(&mut self) -> Result<T, ArchiveError> {
		self.archive.get()
	}

	/// Attaches a zero-copy block. The buffer is shared, not copied.
	pub fn add_block(&mut self, block: Bytes) {
		self.blocks.push(block);
	}

	/// Detaches the next zero-copy block, in lazy-archive order.
	pub fn take_block(&mut self) -> Option<Bytes> {
		if self.blocks.is_empty() {
			None
		} else {
			Some(self.blocks.remove(0))
		}
	}

	/// Received blocks, in order.
	#[must_use]
	pub fn blocks(&self) -> &[Bytes] {
		&self.blocks
	}

	/// Finalizes into a wire message.
	#[must_use]
	pub fn into_message(self) -> Message {
		Message::new(self.head, self.archive.into_bytes(), self.blocks)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn head_roundtrip() {
		let head = MessageHead {
			src_rank: 3,
			dest_rank: 7,
			src_dealer: 11,
			dest_dealer: -1,
			rpc_id: 42,
			sid: 0,
			error_code: ErrorCode::NotFound,
			extra_block_count: 2,
			body_size: 1234,
		};
		let decoded = MessageHead::decode(&head.encode()).unwrap();
		assert_eq!(decoded, head);
	}

	#[test]
	fn response_inherits_swapped_routing() {
		let mut req = RpcRequest::new();
		req.head.src_rank = 2;
		req.head.dest_rank = 5;
		req.head.src_dealer = 9;
		req.head.rpc_id = 4;
		req.head.sid = 1;

		let resp = RpcResponse::from_request(&req);
		assert_eq!(resp.head.src_rank, 5);
		assert_eq!(resp.head.dest_rank, 2);
		assert_eq!(resp.head.dest_dealer, 9);
		assert_eq!(resp.head.rpc_id, 4);
		assert_eq!(resp.error_code(), ErrorCode::Succ);
	}

	#[test]
	fn message_head_tracks_payload() {
		let mut req = RpcRequest::new();
		req.put(&String::from("ping"));
		req.add_block(Bytes::from(vec![0u8; 10]));
		let msg = req.into_message();
		assert_eq!(msg.head.extra_block_count, 1);
		assert_eq!(msg.head.body_size, msg.body.len() as u32);
	}
}
