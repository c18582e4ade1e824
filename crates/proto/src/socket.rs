//! Connection-oriented message socket.
//!
//! Every connection is a pair of TCP streams: the primary stream carries
//! framed messages, the secondary stream carries zero-copy blocks. The dial
//! handshake exchanges a 16-bit magic and the caller's [`CommInfo`], then
//! the dialer opens a listener on a random local port and the acceptor
//! dials back to establish the secondary stream.

use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::codec;
use crate::message::Message;
use crate::types::CommInfo;

/// Handshake magic; a mismatch means the peer speaks something else.
const MAGIC: u16 = 0;

/// Upper bound on the handshake info blob.
const MAX_INFO_LEN: usize = 64 * 1024;

/// How long the dialer waits for the secondary connection to come back.
const SECONDARY_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected message socket (primary + secondary stream).
#[derive(Debug)]
pub struct Socket {
	reader: SocketReader,
	writer: SocketWriter,
}

/// The receive half of a [`Socket`].
#[derive(Debug)]
pub struct SocketReader {
	primary: BufReader<OwnedReadHalf>,
	secondary: OwnedReadHalf,
}

/// The send half of a [`Socket`].
#[derive(Debug)]
pub struct SocketWriter {
	primary: BufWriter<OwnedWriteHalf>,
	secondary: OwnedWriteHalf,
}

impl Socket {
	fn assemble(primary: TcpStream, secondary: TcpStream) -> Self {
		let (pr, pw) = primary.into_split();
		let (sr, sw) = secondary.into_split();
		Self {
			reader: SocketReader {
				primary: BufReader::new(pr),
				secondary: sr,
			},
			writer: SocketWriter {
				primary: BufWriter::new(pw),
				secondary: sw,
			},
		}
	}

	/// Splits into independently owned receive and send halves.
	#[must_use]
	pub fn split(self) -> (SocketReader, SocketWriter) {
		(self.reader, self.writer)
	}

	/// Receives the next message.
	pub async fn recv(&mut self) -> std::io::Result<Message> {
		self.reader.recv().await
	}

	/// Sends one message.
	pub async fn send(&mut self, msg: &Message) -> std::io::Result<()> {
		self.writer.send(msg).await
	}
}

impl SocketReader {
	/// Receives the next message.
	pub async fn recv(&mut self) -> std::io::Result<Message> {
		codec::read_message(&mut self.primary, &mut self.secondary).await
	}
}

impl SocketWriter {
	/// Sends one message.
	pub async fn send(&mut self, msg: &Message) -> std::io::Result<()> {
		codec::write_message(&mut self.primary, &mut self.secondary, msg).await
	}
}

/// Dials `endpoint` and performs the handshake, announcing `self_info`.
pub async fn connect(endpoint: &str, self_info: &CommInfo) -> std::io::Result<Socket> {
	let mut primary = TcpStream::connect(endpoint).await?;
	primary.set_nodelay(true)?;

	let info = self_info.to_json();
	primary.write_u16_le(MAGIC).await?;
	primary.write_u32_le(info.len() as u32).await?;
	primary.write_all(info.as_bytes()).await?;

	// The acceptor dials back to this listener for the secondary stream.
	let local_ip = primary.local_addr()?.ip();
	let listener = TcpListener::bind(SocketAddr::new(local_ip, 0)).await?;
	let port = listener.local_addr()?.port();
	primary.write_u16_le(port).await?;
	primary.flush().await?;

	let (secondary, _) = tokio::time::timeout(SECONDARY_ACCEPT_TIMEOUT, listener.accept())
		.await
		.map_err(|_| IoError::new(ErrorKind::TimedOut, "secondary accept timed out"))??;
	secondary.set_nodelay(true)?;

	Ok(Socket::assemble(primary, secondary))
}

/// Completes the handshake on an accepted primary stream.
///
/// Returns the socket and the peer's announced identity.
pub async fn accept(mut primary: TcpStream) -> std::io::Result<(Socket, CommInfo)> {
	primary.set_nodelay(true)?;

	let magic = primary.read_u16_le().await?;
	if magic != MAGIC {
		return Err(IoError::new(
			ErrorKind::InvalidData,
			format!("bad handshake magic: {magic}"),
		));
	}
	let len = primary.read_u32_le().await? as usize;
	if len > MAX_INFO_LEN {
		return Err(IoError::new(
			ErrorKind::InvalidData,
			format!("handshake info too large: {len} bytes"),
		));
	}
	let mut raw = vec![0u8; len];
	primary.read_exact(&mut raw).await?;
	let info = std::str::from_utf8(&raw)
		.ok()
		.and_then(|raw| CommInfo::from_json(raw).ok())
		.ok_or_else(|| IoError::new(ErrorKind::InvalidData, "malformed handshake info"))?;

	let port = primary.read_u16_le().await?;
	let peer_ip = primary.peer_addr()?.ip();
	let secondary = TcpStream::connect(SocketAddr::new(peer_ip, port)).await?;
	secondary.set_nodelay(true)?;

	Ok((Socket::assemble(primary, secondary), info))
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;

	use super::*;
	use crate::message::{RpcRequest, MIN_ZERO_COPY_SIZE};

	fn info(rank: i16) -> CommInfo {
		CommInfo {
			global_rank: rank,
			endpoint: String::new(),
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn handshake_and_zero_copy_exchange() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let ep = listener.local_addr().unwrap().to_string();

		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let (mut socket, peer) = accept(stream).await.unwrap();
			assert_eq!(peer.global_rank, 3);
			socket.recv().await.unwrap()
		});

		let mut socket = connect(&ep, &info(3)).await.unwrap();
		let mut req = RpcRequest::new();
		req.put(&String::from("ping"));
		req.add_block(Bytes::from(vec![b'x'; MIN_ZERO_COPY_SIZE * 4]));
		socket.send(&req.into_message()).await.unwrap();

		let mut got = RpcRequest::from_message(server.await.unwrap());
		assert_eq!(got.get::<String>().unwrap(), "ping");
		assert_eq!(got.blocks().len(), 1);
		assert!(got.blocks()[0].iter().all(|b| *b == b'x'));
	}
}
