//! Framed message codec.
//!
//! On the wire a message is: the fixed head, a u32 length table for the
//! extra blocks, the eager body, then the blocks themselves. Blocks shorter
//! than [`MIN_ZERO_COPY_SIZE`] are inlined into the primary stream; larger
//! blocks travel on the secondary stream in block order, so both sides
//! assign streams deterministically from the length table alone.

use std::io::{Error as IoError, ErrorKind};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, MessageHead, HEAD_LEN, MIN_ZERO_COPY_SIZE};

/// Upper bound on the eager body; a larger size means a corrupt frame.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on a single extra block.
const MAX_BLOCK_SIZE: usize = 1 << 30;

/// Writes one message across the primary and secondary streams.
pub async fn write_message<P, S>(
	primary: &mut P,
	secondary: &mut S,
	msg: &Message,
) -> std::io::Result<()>
where
	P: AsyncWrite + Unpin,
	S: AsyncWrite + Unpin,
{
	debug_assert_eq!(msg.head.body_size as usize, msg.body.len());
	debug_assert_eq!(msg.head.extra_block_count as usize, msg.blocks.len());

	primary.write_all(&msg.head.encode()).await?;
	for block in &msg.blocks {
		primary.write_all(&(block.len() as u32).to_le_bytes()).await?;
	}
	primary.write_all(&msg.body).await?;
	let mut wrote_secondary = false;
	for block in &msg.blocks {
		if block.len() < MIN_ZERO_COPY_SIZE {
			primary.write_all(block).await?;
		} else {
			secondary.write_all(block).await?;
			wrote_secondary = true;
		}
	}
	primary.flush().await?;
	if wrote_secondary {
		secondary.flush().await?;
	}
	Ok(())
}

/// Reads one complete message, pulling large blocks off the secondary
/// stream.
pub async fn read_message<P, S>(primary: &mut P, secondary: &mut S) -> std::io::Result<Message>
where
	P: AsyncRead + Unpin,
	S: AsyncRead + Unpin,
{
	let mut raw_head = [0u8; HEAD_LEN];
	primary.read_exact(&mut raw_head).await?;
	let head = MessageHead::decode(&raw_head)
		.map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))?;

	if head.body_size as usize > MAX_BODY_SIZE {
		return Err(IoError::new(
			ErrorKind::InvalidData,
			format!("message body too large: {} bytes", head.body_size),
		));
	}

	let mut block_lens = Vec::with_capacity(head.extra_block_count as usize);
	for _ in 0..head.extra_block_count {
		let mut raw = [0u8; 4];
		primary.read_exact(&mut raw).await?;
		let len = u32::from_le_bytes(raw) as usize;
		if len > MAX_BLOCK_SIZE {
			return Err(IoError::new(
				ErrorKind::InvalidData,
				format!("extra block too large: {len} bytes"),
			));
		}
		block_lens.push(len);
	}

	let mut body = vec![0u8; head.body_size as usize];
	primary.read_exact(&mut body).await?;

	let mut blocks = Vec::with_capacity(block_lens.len());
	for len in block_lens {
		let mut block = vec![0u8; len];
		if len < MIN_ZERO_COPY_SIZE {
			primary.read_exact(&mut block).await?;
		} else {
			secondary.read_exact(&mut block).await?;
		}
		blocks.push(Bytes::from(block));
	}

	Ok(Message {
		head,
		body: Bytes::from(body),
		blocks,
	})
}

/// True when the error means the peer went away rather than a protocol bug.
#[must_use]
pub fn is_disconnect(err: &IoError) -> bool {
	matches!(
		err.kind(),
		ErrorKind::UnexpectedEof
			| ErrorKind::BrokenPipe
			| ErrorKind::ConnectionReset
			| ErrorKind::ConnectionAborted
	)
}
