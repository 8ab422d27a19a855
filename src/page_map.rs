//! The index page map.
//!
//! For every chapter of the on-volume index, the map records which delta
//! lists landed on which index page, so a lookup can go straight to the
//! right page. Only the boundary of each page is stored: entry
//! `(chapter, page)` holds the largest delta list placed on that page, and
//! the last page of a chapter is implied by the geometry.

use log::warn;

use crate::buffer::BufferReader;
use crate::buffer::BufferWriter;
use crate::config::hash_to_chapter_delta_list;
use crate::config::Geometry;
use crate::config::RecordName;
use crate::error::Error;
use crate::error::Result;
use crate::io::BufferedReader;
use crate::io::BufferedWriter;

/// Magic opening a serialized page map.
const PAGE_MAP_MAGIC: &[u8; 8] = b"ALBIPM02";

/// The per-chapter map of delta-list boundaries per index page.
pub struct IndexPageMap {
	geometry: Geometry,
	/// The virtual chapter the map was last updated for.
	last_update: u64,
	/// `chapters_per_volume x (index_pages_per_chapter - 1)` boundaries.
	entries: Vec<u16>,
}

impl IndexPageMap {
	/// Creates an empty map for the given geometry.
	///
	/// Fails with `BadState` if a delta list number cannot be stored in a
	/// map entry.
	pub fn new(geometry: Geometry) -> Result<Self> {
		if geometry.delta_lists_per_chapter - 1 > u16::MAX as u32 {
			return Err(Error::BadState(format!(
				"too many delta lists per chapter ({}) for a page map",
				geometry.delta_lists_per_chapter
			)));
		}

		let entries = geometry.chapters_per_volume as usize
			* (geometry.index_pages_per_chapter - 1) as usize;

		Ok(Self {
			geometry,
			last_update: 0,
			entries: vec![0; entries],
		})
	}

	fn entries_per_chapter(&self) -> u32 {
		self.geometry.index_pages_per_chapter - 1
	}

	fn slot(&self, chapter: u32) -> usize {
		chapter as usize * self.entries_per_chapter() as usize
	}

	/// Returns the virtual chapter the map was last updated for.
	pub fn last_update(&self) -> u64 {
		self.last_update
	}

	/// Records that `delta_list` is the largest list on the given index
	/// page of the given chapter.
	///
	/// Arguments:
	/// - `virtual_chapter` is the virtual chapter being written.
	/// - `chapter` is its physical chapter slot.
	/// - `page` is the index page within the chapter.
	/// - `delta_list` is the boundary to record.
	pub fn update(
		&mut self,
		virtual_chapter: u64,
		chapter: u32,
		page: u32,
		delta_list: u32,
	) -> Result<()> {
		if self.last_update != 0
			&& virtual_chapter != self.last_update
			&& virtual_chapter != self.last_update + 1
		{
			// Not fatal, but nothing legitimate updates out of order.
			warn!(
				"unexpected page map update, jumping from chapter {} to {}",
				self.last_update, virtual_chapter
			);
		}
		self.last_update = virtual_chapter;

		if chapter >= self.geometry.chapters_per_volume {
			return Err(Error::InvalidArgument(format!(
				"chapter {} out of range",
				chapter
			)));
		}
		if page >= self.geometry.index_pages_per_chapter {
			return Err(Error::InvalidArgument(format!(
				"index page {} out of range",
				page
			)));
		}
		if delta_list >= self.geometry.delta_lists_per_chapter {
			return Err(Error::InvalidArgument(format!(
				"delta list {} out of range",
				delta_list
			)));
		}

		// The boundary of the last page is implied by the geometry.
		if page == self.geometry.index_pages_per_chapter - 1 {
			return Ok(());
		}

		let slot = self.slot(chapter) + page as usize;
		self.entries[slot] = delta_list as u16;

		Ok(())
	}

	/// Returns the index page of `chapter` holding the entry for
	/// `delta_list`.
	pub(crate) fn find_page_for_list(&self, chapter: u32, delta_list: u32) -> u32 {
		let slot = self.slot(chapter);
		for page in 0..self.entries_per_chapter() {
			if delta_list <= u32::from(self.entries[slot + page as usize]) {
				return page;
			}
		}

		// Anything beyond the recorded boundaries is on the last page.
		self.geometry.index_pages_per_chapter - 1
	}

	/// Returns the index page of `chapter` where the named record's entry
	/// would live.
	pub fn find_index_page_number(&self, name: &RecordName, chapter: u32) -> Result<u32> {
		if chapter >= self.geometry.chapters_per_volume {
			return Err(Error::InvalidArgument(format!(
				"chapter {} out of range",
				chapter
			)));
		}

		let delta_list = hash_to_chapter_delta_list(name, &self.geometry);
		Ok(self.find_page_for_list(chapter, delta_list))
	}

	/// Returns the inclusive range of delta lists covered by the given
	/// index page of the given chapter.
	pub fn get_list_number_bounds(&self, chapter: u32, page: u32) -> Result<(u32, u32)> {
		if chapter >= self.geometry.chapters_per_volume {
			return Err(Error::InvalidArgument(format!(
				"chapter {} out of range",
				chapter
			)));
		}
		if page >= self.geometry.index_pages_per_chapter {
			return Err(Error::InvalidArgument(format!(
				"index page {} out of range",
				page
			)));
		}

		let slot = self.slot(chapter);
		let lowest = if page == 0 {
			0
		} else {
			u32::from(self.entries[slot + page as usize - 1]) + 1
		};
		let highest = if page == self.geometry.index_pages_per_chapter - 1 {
			self.geometry.delta_lists_per_chapter - 1
		} else {
			u32::from(self.entries[slot + page as usize])
		};

		Ok((lowest, highest))
	}

	/// Serializes the map.
	pub fn write(&self, writer: &mut BufferedWriter) -> Result<()> {
		let mut encoder = BufferWriter::with_capacity(16 + self.entries.len() * 2);
		encoder.put_bytes(PAGE_MAP_MAGIC);
		encoder.put_u64(self.last_update);
		for entry in &self.entries {
			encoder.put_u16(*entry);
		}

		writer.write_all(encoder.as_bytes())?;
		writer.flush()
	}

	/// Reads a serialized map back, replacing the current contents.
	pub fn read(&mut self, reader: &mut BufferedReader) -> Result<()> {
		reader.verify(PAGE_MAP_MAGIC)?;

		let bytes = reader.read_vec(8 + self.entries.len() * 2)?;
		let mut decoder = BufferReader::new(&bytes);
		self.last_update = decoder.get_u64()?;
		for entry in &mut self.entries {
			*entry = decoder.get_u16()?;
		}
		decoder.expect_consumed("page map entries", 8 + self.entries.len() * 2)?;

		Ok(())
	}
}
