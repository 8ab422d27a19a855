//! Nonce generation.
//!
//! A nonce is a 64-bit value cut out of a seeded 128-bit Murmur3 hash. The
//! superblock holds a primary nonce derived from 32 bytes of seed material;
//! every dependent structure (the sub-index, each save) holds a secondary
//! nonce chained off the primary one, binding it to the volume that wrote it.

use rand_core::OsRng;
use rand_core::RngCore;
use std::io::Cursor;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::buffer::BufferWriter;

/// Number of seed bytes backing a primary nonce.
pub const NONCE_INFO_SIZE: usize = 32;

/// Base of the seed used for primary nonces.
const PRIMARY_NONCE_BASE: u64 = 0xa1b1e0fc;

/// Hashes `data` with a seed derived from `base` and extracts bytes 4..12
/// of the 128-bit result as a little-endian `u64`.
fn hash_stuff(base: u64, data: &[u8]) -> u64 {
	let seed = (base ^ (base >> 27)) as u32;
	// Reading from an in-memory cursor cannot fail.
	let hash = murmur3::murmur3_x64_128(&mut Cursor::new(data), seed)
		.expect("hashing an in-memory buffer");
	let bytes = hash.to_le_bytes();

	u64::from_le_bytes(bytes[4..12].try_into().expect("eight bytes"))
}

/// Computes the primary nonce for the given seed material.
pub fn generate_primary_nonce(data: &[u8]) -> u64 {
	hash_stuff(PRIMARY_NONCE_BASE, data)
}

/// Computes a nonce deterministically derived from an existing `nonce` and
/// arbitrary `data`.
pub fn generate_secondary_nonce(nonce: u64, data: &[u8]) -> u64 {
	hash_stuff(nonce.wrapping_add(1), data)
}

/// Fills 32 bytes of fresh seed material for a new superblock: the current
/// real time in nanoseconds, a 30-bit random number, then the already
/// filled prefix copied repeatedly until the buffer is full.
pub fn create_unique_nonce_data() -> [u8; NONCE_INFO_SIZE] {
	let now = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before the epoch")
		.as_nanos() as u64;
	let random = OsRng.next_u32() & 0x3fff_ffff;

	let mut writer = BufferWriter::with_capacity(NONCE_INFO_SIZE);
	writer.put_u64(now);
	writer.put_u32(random);

	let mut buffer = [0; NONCE_INFO_SIZE];
	let mut offset = writer.len();
	buffer[..offset].copy_from_slice(writer.as_bytes());

	// Double the filled prefix until the buffer is full.
	while offset < NONCE_INFO_SIZE {
		let len = usize::min(NONCE_INFO_SIZE - offset, offset);
		buffer.copy_within(0..len, offset);
		offset += len;
	}

	buffer
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn primary_nonce_is_deterministic() {
		let data = [0x5a; NONCE_INFO_SIZE];

		assert_eq!(generate_primary_nonce(&data), generate_primary_nonce(&data));
		assert_ne!(generate_primary_nonce(&data), 0);
	}

	#[test]
	fn secondary_nonce_depends_on_base_and_data() {
		let data = b"0123456789abcdef";

		let n0 = generate_secondary_nonce(17, data);
		let n1 = generate_secondary_nonce(18, data);
		let n2 = generate_secondary_nonce(17, b"0123456789abcdeg");

		assert_ne!(n0, n1);
		assert_ne!(n0, n2);
		assert_eq!(n0, generate_secondary_nonce(17, data));
	}

	#[test]
	fn nonce_data_doubles_the_prefix() {
		let data = create_unique_nonce_data();

		// The first 12 bytes (time + random) repeat at 12 and again at 24.
		assert_eq!(data[12..24], data[0..12]);
		assert_eq!(data[24..32], data[0..8]);
	}

	#[test]
	fn nonce_data_is_unique() {
		assert_ne!(create_unique_nonce_data(), create_unique_nonce_data());
	}
}
