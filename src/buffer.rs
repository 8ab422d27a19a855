//! Cursor-backed binary codec for the on-disk structures.
//!
//! Every structure in the layout is encoded little-endian with explicit
//! field order; nothing is reinterpreted from memory. Decoding checks the
//! cursor against the declared structure size so that a short or oversized
//! buffer is reported instead of read past.

use crate::error::Error;
use crate::error::Result;
use byteorder::ByteOrder;
use byteorder::LittleEndian;

/// An append-only encode buffer.
#[derive(Default)]
pub struct BufferWriter {
	data: Vec<u8>,
}

impl BufferWriter {
	/// Creates an empty buffer with the given capacity hint.
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			data: Vec::with_capacity(capacity),
		}
	}

	/// Appends a `u16`, little-endian.
	pub fn put_u16(&mut self, value: u16) {
		let mut b = [0; 2];
		LittleEndian::write_u16(&mut b, value);
		self.data.extend_from_slice(&b);
	}

	/// Appends a `u32`, little-endian.
	pub fn put_u32(&mut self, value: u32) {
		let mut b = [0; 4];
		LittleEndian::write_u32(&mut b, value);
		self.data.extend_from_slice(&b);
	}

	/// Appends an `i32`, little-endian.
	pub fn put_i32(&mut self, value: i32) {
		let mut b = [0; 4];
		LittleEndian::write_i32(&mut b, value);
		self.data.extend_from_slice(&b);
	}

	/// Appends a `u64`, little-endian.
	pub fn put_u64(&mut self, value: u64) {
		let mut b = [0; 8];
		LittleEndian::write_u64(&mut b, value);
		self.data.extend_from_slice(&b);
	}

	/// Appends raw bytes.
	pub fn put_bytes(&mut self, bytes: &[u8]) {
		self.data.extend_from_slice(bytes);
	}

	/// Appends `count` zero bytes.
	pub fn put_zeros(&mut self, count: usize) {
		self.data.resize(self.data.len() + count, 0);
	}

	/// Returns the number of bytes encoded so far.
	pub fn len(&self) -> usize {
		self.data.len()
	}

	/// Tells whether nothing has been encoded yet.
	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// Consumes the buffer and returns the encoded bytes.
	pub fn into_bytes(self) -> Vec<u8> {
		self.data
	}

	/// Returns the encoded bytes.
	pub fn as_bytes(&self) -> &[u8] {
		&self.data
	}
}

/// A bounds-checked decode cursor over a byte slice.
pub struct BufferReader<'a> {
	data: &'a [u8],
	offset: usize,
}

impl<'a> BufferReader<'a> {
	/// Creates a cursor at the start of `data`.
	pub fn new(data: &'a [u8]) -> Self {
		Self {
			data,
			offset: 0,
		}
	}

	/// Returns the number of bytes not yet consumed.
	pub fn remaining(&self) -> usize {
		self.data.len() - self.offset
	}

	/// Returns the number of bytes consumed so far.
	pub fn consumed(&self) -> usize {
		self.offset
	}

	fn take(&mut self, count: usize) -> Result<&'a [u8]> {
		if self.remaining() < count {
			return Err(Error::CorruptData(format!(
				"decode ran past the end of the buffer ({} bytes needed, {} left)",
				count,
				self.remaining()
			)));
		}

		let slice = &self.data[self.offset..(self.offset + count)];
		self.offset += count;
		Ok(slice)
	}

	/// Consumes a `u16`, little-endian.
	pub fn get_u16(&mut self) -> Result<u16> {
		Ok(LittleEndian::read_u16(self.take(2)?))
	}

	/// Consumes a `u32`, little-endian.
	pub fn get_u32(&mut self) -> Result<u32> {
		Ok(LittleEndian::read_u32(self.take(4)?))
	}

	/// Consumes an `i32`, little-endian.
	pub fn get_i32(&mut self) -> Result<i32> {
		Ok(LittleEndian::read_i32(self.take(4)?))
	}

	/// Consumes a `u64`, little-endian.
	pub fn get_u64(&mut self) -> Result<u64> {
		Ok(LittleEndian::read_u64(self.take(8)?))
	}

	/// Consumes `N` raw bytes into an array.
	pub fn get_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
		let mut bytes = [0; N];
		bytes.copy_from_slice(self.take(N)?);
		Ok(bytes)
	}

	/// Consumes and discards `count` bytes.
	pub fn skip(&mut self, count: usize) -> Result<()> {
		self.take(count)?;
		Ok(())
	}

	/// Checks that the cursor consumed exactly `expected` bytes for the
	/// structure named `what`.
	pub fn expect_consumed(&self, what: &str, expected: usize) -> Result<()> {
		if self.offset != expected {
			return Err(Error::CorruptData(format!(
				"{} decoded {} bytes instead of {}",
				what, self.offset, expected
			)));
		}

		Ok(())
	}
}
