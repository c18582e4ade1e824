//! The eager archive: an append/consume byte buffer with strict FIFO
//! ordering between writes and reads.
//!
//! All primitives are little-endian. Strings and byte strings carry a u32
//! length prefix; vectors carry a u32 element count. The read cursor only
//! moves forward, so a sequence of `put` calls decodes with the matching
//! sequence of `get` calls.

use bytes::Bytes;

/// Decode-side failure of an [`Archive`].
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
	/// The archive ran out of bytes mid-value.
	#[error("archive exhausted: needed {needed} more bytes, {left} left")]
	Exhausted {
		/// Bytes the decoder still needed.
		needed: usize,
		/// Bytes remaining in the archive.
		left: usize,
	},
	/// A length-prefixed string was not valid UTF-8.
	#[error("archive string is not valid utf-8")]
	InvalidUtf8,
	/// An enum discriminant had no known mapping.
	#[error("unknown discriminant {value} for {what}")]
	BadDiscriminant {
		/// The raw byte read off the wire.
		value: u8,
		/// Human-readable name of the enum being decoded.
		what: &'static str,
	},
}

/// Append/consume byte buffer used for eager message bodies.
#[derive(Debug, Default, Clone)]
pub struct Archive {
	buf: Vec<u8>,
	pos: usize,
}

impl Archive {
	/// Creates an empty archive.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates an archive that decodes the given bytes.
	#[must_use]
	pub fn from_vec(buf: Vec<u8>) -> Self {
		Self { buf, pos: 0 }
	}

	/// Creates an archive that decodes a received body.
	#[must_use]
	pub fn from_bytes(body: &Bytes) -> Self {
		Self::from_vec(body.to_vec())
	}

	/// Number of bytes left to read.
	#[must_use]
	pub fn remaining(&self) -> usize {
		self.buf.len() - self.pos
	}

	/// True when every written byte has been consumed.
	#[must_use]
	pub fn is_exhausted(&self) -> bool {
		self.pos == self.buf.len()
	}

	/// Freezes the written bytes into a shared buffer.
	#[must_use]
	pub fn into_bytes(self) -> Bytes {
		Bytes::from(self.buf)
	}

	/// Every written byte, independent of the read cursor.
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		&self.buf
	}

	/// Total number of bytes written so far.
	#[must_use]
	pub fn len(&self) -> usize {
		self.buf.len()
	}

	/// True when nothing has been written.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.buf.is_empty()
	}

	/// Appends a value.
	pub fn put<T: ArchiveValue>(&mut self, value: &T) {
		value.encode(self);
	}

	/// Consumes the next value.
	pub fn get<T: ArchiveValue>(&mut self) -> Result<T, ArchiveError> {
		T::decode(self)
	}

	/// Appends raw bytes without a length prefix.
	pub fn put_raw(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Consumes `n` raw bytes.
	pub fn get_raw(&mut self, n: usize) -> Result<&[u8], ArchiveError> {
		if self.remaining() < n {
			return Err(ArchiveError::Exhausted {
				needed: n,
				left: self.remaining(),
			});
		}
		let out = &self.buf[self.pos..self.pos + n];
		self.pos += n;
		Ok(out)
	}

	/// Appends length-prefixed bytes.
	pub fn put_bytes(&mut self, bytes: &[u8]) {
		self.put(&(bytes.len() as u32));
		self.put_raw(bytes);
	}

	/// Consumes length-prefixed bytes.
	pub fn get_bytes(&mut self) -> Result<Vec<u8>, ArchiveError> {
		let len = self.get::<u32>()? as usize;
		Ok(self.get_raw(len)?.to_vec())
	}
}

/// A value with a fixed archive encoding.
pub trait ArchiveValue: Sized {
	/// Appends `self` to the archive.
	fn encode(&self, ar: &mut Archive);
	/// Consumes one value from the archive.
	fn decode(ar: &mut Archive) -> Result<Self, ArchiveError>;
}

macro_rules! archive_int {
	($($ty:ty),*) => {
		$(impl ArchiveValue for $ty {
			fn encode(&self, ar: &mut Archive) {
				ar.put_raw(&self.to_le_bytes());
			}

			fn decode(ar: &mut Archive) -> Result<Self, ArchiveError> {
				let raw = ar.get_raw(size_of::<$ty>())?;
				Ok(<$ty>::from_le_bytes(raw.try_into().expect("sized read")))
			}
		})*
	};
}

archive_int!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl ArchiveValue for usize {
	fn encode(&self, ar: &mut Archive) {
		ar.put(&(*self as u64));
	}

	fn decode(ar: &mut Archive) -> Result<Self, ArchiveError> {
		Ok(ar.get::<u64>()? as usize)
	}
}

impl ArchiveValue for bool {
	fn encode(&self, ar: &mut Archive) {
		ar.put(&u8::from(*self));
	}

	fn decode(ar: &mut Archive) -> Result<Self, ArchiveError> {
		Ok(ar.get::<u8>()? != 0)
	}
}

impl ArchiveValue for String {
	fn encode(&self, ar: &mut Archive) {
		ar.put_bytes(self.as_bytes());
	}

	fn decode(ar: &mut Archive) -> Result<Self, ArchiveError> {
		String::from_utf8(ar.get_bytes()?).map_err(|_| ArchiveError::InvalidUtf8)
	}
}

impl<T: ArchiveValue> ArchiveValue for Vec<T> {
	fn encode(&self, ar: &mut Archive) {
		ar.put(&(self.len() as u32));
		for item in self {
			ar.put(item);
		}
	}

	fn decode(ar: &mut Archive) -> Result<Self, ArchiveError> {
		let len = ar.get::<u32>()? as usize;
		let mut out = Vec::with_capacity(len.min(4096));
		for _ in 0..len {
			out.push(ar.get::<T>()?);
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fifo_roundtrip() {
		let mut ar = Archive::new();
		ar.put(&42u32);
		ar.put(&String::from("hello"));
		ar.put(&true);
		ar.put(&-7i16);
		ar.put(&vec![String::from("a"), String::from("bc")]);

		assert_eq!(ar.get::<u32>().unwrap(), 42);
		assert_eq!(ar.get::<String>().unwrap(), "hello");
		assert!(ar.get::<bool>().unwrap());
		assert_eq!(ar.get::<i16>().unwrap(), -7);
		assert_eq!(ar.get::<Vec<String>>().unwrap(), vec!["a", "bc"]);
		assert!(ar.is_exhausted());
	}

	#[test]
	fn exhausted_read_fails() {
		let mut ar = Archive::new();
		ar.put(&1u8);
		ar.get::<u8>().unwrap();
		assert!(matches!(
			ar.get::<u32>(),
			Err(ArchiveError::Exhausted { .. })
		));
	}

	#[test]
	fn bytes_roundtrip_through_freeze() {
		let mut ar = Archive::new();
		ar.put_bytes(b"payload");
		let frozen = ar.into_bytes();
		let mut rd = Archive::from_bytes(&frozen);
		assert_eq!(rd.get_bytes().unwrap(), b"payload");
		assert!(rd.is_exhausted());
	}
}
