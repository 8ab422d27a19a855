//! The saved index state and the component seams.
//!
//! The layout engine checkpoints three things it does not interpret: a
//! small state buffer of chapter counters, the open chapter, and one
//! volume-index region per zone. The buffer format is owned here; the
//! other two belong to their components and are reached through traits.

use crate::buffer::BufferReader;
use crate::buffer::BufferWriter;
use crate::error::Error;
use crate::error::Result;
use crate::io::BufferedReader;
use crate::io::BufferedWriter;
use crate::page_map::IndexPageMap;

/// Signature of the supported state buffer format.
const INDEX_STATE_SIGNATURE: i32 = -1;
/// Version of the supported state buffer format.
const INDEX_STATE_VERSION_ID: i32 = 301;
/// Encoded size of the state buffer contents.
pub const INDEX_STATE_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 4 + 4;

/// The chapter counters persisted in every save.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexStateData {
	/// The newest virtual chapter.
	pub newest_chapter: u64,
	/// The oldest virtual chapter still on the volume.
	pub oldest_chapter: u64,
	/// The virtual chapter of the last save.
	pub last_save: u64,
}

/// Encodes the state buffer: a version tag, the counters, and two
/// historical spare words.
pub fn encode_index_state(state: &IndexStateData) -> Vec<u8> {
	let mut writer = BufferWriter::with_capacity(INDEX_STATE_SIZE);
	writer.put_i32(INDEX_STATE_SIGNATURE);
	writer.put_i32(INDEX_STATE_VERSION_ID);
	writer.put_u64(state.newest_chapter);
	writer.put_u64(state.oldest_chapter);
	writer.put_u64(state.last_save);
	writer.put_u32(0);
	writer.put_u32(0);

	writer.into_bytes()
}

/// Decodes a state buffer, rejecting any version other than `{-1, 301}`.
pub fn decode_index_state(bytes: &[u8]) -> Result<IndexStateData> {
	let mut decoder = BufferReader::new(bytes);

	let signature = decoder.get_i32()?;
	let version_id = decoder.get_i32()?;
	if signature != INDEX_STATE_SIGNATURE || version_id != INDEX_STATE_VERSION_ID {
		return Err(Error::UnsupportedVersion(format!(
			"index state version {}.{}",
			signature, version_id
		)));
	}

	let state = IndexStateData {
		newest_chapter: decoder.get_u64()?,
		oldest_chapter: decoder.get_u64()?,
		last_save: decoder.get_u64()?,
	};
	decoder.skip(8)?;
	decoder.expect_consumed("index state buffer", INDEX_STATE_SIZE)?;

	Ok(state)
}

/// The volume index, persisted as one region per zone.
pub trait VolumeIndex {
	/// Saves the index, one writer per zone.
	fn save(&self, writers: &mut [BufferedWriter]) -> Result<()>;

	/// Loads the index, one reader per saved zone.
	fn load(&mut self, readers: &mut [BufferedReader]) -> Result<()>;
}

/// The chapter being actively filled.
pub trait OpenChapter {
	/// Saves the open chapter.
	fn save(&self, writer: &mut BufferedWriter) -> Result<()>;

	/// Loads the open chapter.
	fn load(&mut self, reader: &mut BufferedReader) -> Result<()>;
}

/// The pieces of a running index the layout checkpoints and restores.
pub struct Index {
	/// The chapter counters.
	pub state: IndexStateData,
	/// Number of zones the volume index is sharded into for this save.
	pub zone_count: u32,
	/// The volume index component.
	pub volume_index: Box<dyn VolumeIndex>,
	/// The open chapter component.
	pub open_chapters: Box<dyn OpenChapter>,
	/// The index page map.
	pub page_map: IndexPageMap,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn state_round_trip() {
		let state = IndexStateData {
			newest_chapter: 1000,
			oldest_chapter: 100,
			last_save: 0xcafe,
		};

		let bytes = encode_index_state(&state);
		assert_eq!(bytes.len(), INDEX_STATE_SIZE);
		assert_eq!(decode_index_state(&bytes).unwrap(), state);
	}

	#[test]
	fn wrong_version_tag_rejected() {
		let state = IndexStateData::default();
		let mut bytes = encode_index_state(&state);
		// Flip the version id to 302.
		bytes[4] = 46;

		assert!(matches!(
			decode_index_state(&bytes),
			Err(Error::UnsupportedVersion(_))
		));
	}

	#[test]
	fn short_buffer_rejected() {
		let bytes = encode_index_state(&IndexStateData::default());

		assert!(decode_index_state(&bytes[..20]).is_err());
	}
}
