//! Index configuration and geometry.
//!
//! The geometry describes the shape of the on-volume index; the
//! configuration adds where the layout lives on the backing store. The
//! CONFIG region persists enough of both to detect an open against the
//! wrong parameters.

use log::error;
use std::path::PathBuf;

use crate::buffer::BufferReader;
use crate::buffer::BufferWriter;
use crate::error::Error;
use crate::error::Result;
use crate::io::BufferedReader;
use crate::io::BufferedWriter;
use crate::io::BLOCK_SIZE;

/// Magic opening the serialized configuration.
const CONFIG_MAGIC: &[u8; 5] = b"ALBIC";
/// The only supported configuration format version.
const CONFIG_VERSION: &[u8; 5] = b"06.02";
/// Encoded size of the configuration payload, magic and version included.
const CONFIG_SIZE: usize = 5 + 5 + 4 + 4 + 4 + 4 + 8;

/// Size of a record name in bytes.
pub const RECORD_NAME_SIZE: usize = 16;

/// Largest number of volume-index zones a save accommodates.
pub const MAX_ZONES: u32 = 8;

/// The name of a deduplication record: an opaque 16-byte hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

/// The shape of the on-volume index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
	/// Bytes in one volume page. Must be a multiple of the block size.
	pub bytes_per_page: u64,
	/// Bytes in the whole volume.
	pub bytes_per_volume: u64,
	/// Number of chapters on the volume.
	pub chapters_per_volume: u32,
	/// Number of index pages in each chapter.
	pub index_pages_per_chapter: u32,
	/// Number of delta lists in each chapter's index.
	pub delta_lists_per_chapter: u32,
}

/// Everything needed to create or open a layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexConfig {
	/// Path to the backing store.
	pub name: PathBuf,
	/// Byte offset of the layout on the backing store.
	pub offset: u64,
	/// The index geometry.
	pub geometry: Geometry,
}

/// Integer division rounding up.
pub(crate) fn ceil_division(n: u64, d: u64) -> u64 {
	(n + d - 1) / d
}

/// Maps a record name to the delta list its chapter-index entry lives in:
/// the 48-bit big-endian integer at bytes 4..10 of the name, reduced
/// modulo the number of delta lists.
pub fn hash_to_chapter_delta_list(name: &RecordName, geometry: &Geometry) -> u32 {
	let bytes = &name.0[4..10];
	let mut value: u64 = 0;
	for b in bytes {
		value = (value << 8) | u64::from(*b);
	}

	(value % u64::from(geometry.delta_lists_per_chapter)) as u32
}

/// Returns the number of blocks one save needs for all volume-index zones
/// together: one checkpoint word per delta list per chapter, plus a fixed
/// per-save header. The count is rounded up to a multiple of `MAX_ZONES`
/// so every zone of any permitted zone count gets whole blocks.
pub fn compute_volume_index_save_blocks(config: &IndexConfig) -> Result<u64> {
	let geometry = &config.geometry;
	let entries = u64::from(geometry.delta_lists_per_chapter)
		* u64::from(geometry.chapters_per_volume);
	let bytes = 1024 + entries * 8;
	let blocks = ceil_division(bytes, BLOCK_SIZE);

	Ok(ceil_division(blocks, u64::from(MAX_ZONES)) * u64::from(MAX_ZONES))
}

/// Returns the serialized size of the index page map in bytes.
pub fn compute_index_page_map_save_size(geometry: &Geometry) -> u64 {
	let entries = u64::from(geometry.chapters_per_volume)
		* u64::from(geometry.index_pages_per_chapter - 1);

	// Magic, last update, then one u16 per entry.
	8 + 8 + entries * 2
}

/// Returns the number of bytes one saved open chapter needs: a small
/// header plus one page worth of records.
pub fn compute_saved_open_chapter_size(geometry: &Geometry) -> u64 {
	64 + geometry.bytes_per_page
}

fn encode_config(config: &IndexConfig) -> Vec<u8> {
	let geometry = &config.geometry;
	let mut writer = BufferWriter::with_capacity(CONFIG_SIZE);
	writer.put_bytes(CONFIG_MAGIC);
	writer.put_bytes(CONFIG_VERSION);
	writer.put_u32(geometry.bytes_per_page as u32);
	writer.put_u32(geometry.index_pages_per_chapter);
	writer.put_u32(geometry.delta_lists_per_chapter);
	writer.put_u32(geometry.chapters_per_volume);
	writer.put_u64(geometry.bytes_per_volume);

	writer.into_bytes()
}

/// Writes the configuration payload into the CONFIG region.
pub fn write_config(writer: &mut BufferedWriter, config: &IndexConfig) -> Result<()> {
	writer.write_all(&encode_config(config))?;
	writer.flush()
}

/// Reads the CONFIG region and checks it against the caller's
/// configuration.
///
/// A wrong magic is corruption; a wrong version is unsupported; matching
/// format but different parameters means the store holds some other index
/// and is reported as `NoIndex`.
pub fn validate_config(reader: &mut BufferedReader, config: &IndexConfig) -> Result<()> {
	let bytes = reader.read_vec(CONFIG_SIZE)?;
	let mut decoder = BufferReader::new(&bytes);

	let magic = decoder.get_bytes::<5>()?;
	if magic != *CONFIG_MAGIC {
		return Err(Error::CorruptData(
			"bad magic in the index configuration".into(),
		));
	}

	let version = decoder.get_bytes::<5>()?;
	if version != *CONFIG_VERSION {
		return Err(Error::UnsupportedVersion(format!(
			"index configuration version {}",
			String::from_utf8_lossy(&version)
		)));
	}

	let stored = Geometry {
		bytes_per_page: u64::from(decoder.get_u32()?),
		index_pages_per_chapter: decoder.get_u32()?,
		delta_lists_per_chapter: decoder.get_u32()?,
		chapters_per_volume: decoder.get_u32()?,
		bytes_per_volume: decoder.get_u64()?,
	};
	decoder.expect_consumed("index configuration", CONFIG_SIZE)?;

	if stored != config.geometry {
		error!(
			"stored index geometry {:?} does not match the requested {:?}",
			stored, config.geometry
		);
		return Err(Error::NoIndex);
	}

	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample_geometry() -> Geometry {
		Geometry {
			bytes_per_page: 4096,
			bytes_per_volume: 16 * 4096,
			chapters_per_volume: 4,
			index_pages_per_chapter: 3,
			delta_lists_per_chapter: 10,
		}
	}

	#[test]
	fn delta_list_hash_is_stable_and_in_range() {
		let geometry = sample_geometry();

		let mut name = RecordName([0; RECORD_NAME_SIZE]);
		name.0[9] = 7;
		assert_eq!(hash_to_chapter_delta_list(&name, &geometry), 7);

		name.0[9] = 13;
		let list = hash_to_chapter_delta_list(&name, &geometry);
		assert_eq!(list, 3);
		assert!(list < geometry.delta_lists_per_chapter);
	}

	#[test]
	fn page_map_save_size() {
		let geometry = sample_geometry();

		// 4 chapters x 2 stored entries x 2 bytes, after the header.
		assert_eq!(compute_index_page_map_save_size(&geometry), 8 + 8 + 16);
	}

	#[test]
	fn volume_index_save_blocks_divide_among_zones() {
		let config = IndexConfig {
			name: PathBuf::new(),
			offset: 0,
			geometry: sample_geometry(),
		};

		// 1024 + 40 entries x 8 bytes fits one block, reserved as a full
		// stripe of zone blocks.
		let blocks = compute_volume_index_save_blocks(&config).unwrap();
		assert_eq!(blocks, u64::from(MAX_ZONES));
		assert_eq!(blocks % u64::from(MAX_ZONES), 0);
	}
}
