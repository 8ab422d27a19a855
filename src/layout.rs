//! The on-disk index layout.
//!
//! The layout carves the backing store into a fixed arrangement of regions
//! described by a self-describing superblock:
//!
//! ```text
//! HEADER(1)  CONFIG(1)  INDEX:[ VOLUME | SAVE x max_saves ]  SEAL(1)
//! ```
//!
//! Each save slot is itself a compound region holding a header, the index
//! page map, one volume-index region per zone, the open chapter, and
//! trailing scratch space. Slots rotate: a save picks the oldest slot,
//! invalidates it on disk, writes every component, and only then rewrites
//! the slot header as a valid save, so a crash at any point leaves either
//! the previous save or an explicitly unsaved slot.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::buffer::BufferReader;
use crate::buffer::BufferWriter;
use crate::config::ceil_division;
use crate::config::compute_index_page_map_save_size;
use crate::config::compute_saved_open_chapter_size;
use crate::config::compute_volume_index_save_blocks;
use crate::config::validate_config;
use crate::config::write_config;
use crate::config::IndexConfig;
use crate::config::MAX_ZONES;
use crate::error::Error;
use crate::error::Result;
use crate::io::BufferedReader;
use crate::io::BufferedWriter;
use crate::io::IoFactory;
use crate::io::IoMode;
use crate::io::BLOCK_SIZE;
use crate::nonce::create_unique_nonce_data;
use crate::nonce::generate_primary_nonce;
use crate::nonce::generate_secondary_nonce;
use crate::nonce::NONCE_INFO_SIZE;
use crate::region::LayoutRegion;
use crate::region::RegionHeader;
use crate::region::RegionIterator;
use crate::region::RegionKind;
use crate::region::RegionTable;
use crate::region::RegionType;
use crate::region::SOLE_INSTANCE;
use crate::state::decode_index_state;
use crate::state::encode_index_state;
use crate::state::Index;

/// The magic label opening the superblock data.
const LAYOUT_MAGIC: &[u8; 32] = b"*ALBIREO*SINGLE*FILE*LAYOUT*001*";
/// The superblock version written by this engine.
const SUPER_VERSION_CURRENT: u32 = 3;
/// The superblock version of a converted layout.
const SUPER_VERSION_CONVERTED: u32 = 7;
/// Number of save slots in the ring.
const MAX_SAVES: u16 = 2;
/// Cap on the opaque index state buffer stored in a save header.
const INDEX_STATE_BUFFER_SIZE: usize = 512;

/// Encoded size of the superblock data for version 3.
const SUPER_BLOCK_DATA_SIZE_V3: usize = 32 + NONCE_INFO_SIZE + 8 + 4 + 4 + 2 + 2 + 4 + 8 + 8;
/// Encoded size of the superblock data for version 7.
const SUPER_BLOCK_DATA_SIZE_V7: usize = SUPER_BLOCK_DATA_SIZE_V3 + 8 + 8;

/// Encoded size of the per-save data.
const INDEX_SAVE_DATA_SIZE: usize = 8 + 8 + 4 + 4;

/// Returns the current real time in milliseconds since the epoch.
fn current_time_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before the epoch")
		.as_millis() as u64
}

/// The decoded payload of the top-level SUPER header.
#[derive(Clone, Debug, Eq, PartialEq)]
struct SuperBlockData {
	/// Seed material the nonce was generated from.
	nonce_info: [u8; NONCE_INFO_SIZE],
	/// The volume's primary nonce.
	nonce: u64,
	/// On-disk format version: 3, or 7 once converted.
	version: u32,
	/// Block size the layout was created with.
	block_size: u32,
	/// Number of sub-indexes; always 1.
	num_indexes: u16,
	/// Number of save slots.
	max_saves: u16,
	/// Blocks reserved for a saved open chapter.
	open_chapter_blocks: u64,
	/// Blocks reserved for a saved index page map.
	page_map_blocks: u64,
	/// Blocks the volume was shifted by during conversion.
	volume_offset: u64,
	/// Blocks reserved ahead of the layout during conversion.
	start_offset: u64,
}

impl SuperBlockData {
	/// The block translation applied to all sub-region I/O.
	fn translation(&self) -> u64 {
		self.volume_offset - self.start_offset
	}

	fn encoded_size(&self) -> usize {
		if self.version == SUPER_VERSION_CONVERTED {
			SUPER_BLOCK_DATA_SIZE_V7
		} else {
			SUPER_BLOCK_DATA_SIZE_V3
		}
	}

	fn encode(&self) -> Vec<u8> {
		let mut writer = BufferWriter::with_capacity(self.encoded_size());
		writer.put_bytes(LAYOUT_MAGIC);
		writer.put_bytes(&self.nonce_info);
		writer.put_u64(self.nonce);
		writer.put_u32(self.version);
		writer.put_u32(self.block_size);
		writer.put_u16(self.num_indexes);
		writer.put_u16(self.max_saves);
		writer.put_zeros(4);
		writer.put_u64(self.open_chapter_blocks);
		writer.put_u64(self.page_map_blocks);
		if self.version == SUPER_VERSION_CONVERTED {
			writer.put_u64(self.volume_offset);
			writer.put_u64(self.start_offset);
		}

		writer.into_bytes()
	}

	fn decode(payload: &[u8]) -> Result<Self> {
		let mut decoder = BufferReader::new(payload);

		let magic = decoder.get_bytes::<32>()?;
		if magic != *LAYOUT_MAGIC {
			return Err(Error::CorruptData(
				"unknown superblock magic label".into(),
			));
		}

		let nonce_info = decoder.get_bytes::<NONCE_INFO_SIZE>()?;
		let nonce = decoder.get_u64()?;
		let version = decoder.get_u32()?;
		if version != SUPER_VERSION_CURRENT && version != SUPER_VERSION_CONVERTED {
			return Err(Error::UnsupportedVersion(format!(
				"superblock version {}",
				version
			)));
		}

		let block_size = decoder.get_u32()?;
		if u64::from(block_size) != BLOCK_SIZE {
			return Err(Error::CorruptData(format!(
				"superblock block size {} differs from {}",
				block_size, BLOCK_SIZE
			)));
		}

		let num_indexes = decoder.get_u16()?;
		if num_indexes != 1 {
			return Err(Error::CorruptData(format!(
				"superblock claims {} sub-indexes",
				num_indexes
			)));
		}

		let max_saves = decoder.get_u16()?;
		decoder.skip(4)?;
		let open_chapter_blocks = decoder.get_u64()?;
		let page_map_blocks = decoder.get_u64()?;

		let (volume_offset, start_offset) = if version == SUPER_VERSION_CONVERTED {
			(decoder.get_u64()?, decoder.get_u64()?)
		} else {
			(0, 0)
		};
		if volume_offset < start_offset {
			return Err(Error::CorruptData(
				"inconsistent conversion offsets in the superblock".into(),
			));
		}
		decoder.expect_consumed("superblock data", payload.len())?;

		let data = Self {
			nonce_info,
			nonce,
			version,
			block_size,
			num_indexes,
			max_saves,
			open_chapter_blocks,
			page_map_blocks,
			volume_offset,
			start_offset,
		};
		if generate_primary_nonce(&data.nonce_info) != data.nonce {
			return Err(Error::CorruptData(
				"superblock nonce does not match its seed".into(),
			));
		}

		Ok(data)
	}
}

/// Whether a save slot holds a usable save.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SaveType {
	/// The slot holds a complete save.
	Save,
	/// The slot is empty or abandoned.
	NoSave,
}

/// The stamp carried in a save slot's header payload.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct IndexSaveData {
	/// Generation timestamp in milliseconds; 0 for an unsaved slot.
	timestamp: u64,
	/// Nonce binding the save to its volume.
	nonce: u64,
	/// Save format version.
	version: u32,
}

impl IndexSaveData {
	fn encode(&self) -> Vec<u8> {
		let mut writer = BufferWriter::with_capacity(INDEX_SAVE_DATA_SIZE);
		writer.put_u64(self.timestamp);
		writer.put_u64(self.nonce);
		writer.put_u32(self.version);
		writer.put_zeros(4);

		writer.into_bytes()
	}

	fn decode(decoder: &mut BufferReader) -> Result<Self> {
		let timestamp = decoder.get_u64()?;
		let nonce = decoder.get_u64()?;
		let version = decoder.get_u32()?;
		decoder.skip(4)?;
		if version > 1 {
			return Err(Error::UnsupportedVersion(format!(
				"index save version {}",
				version
			)));
		}

		Ok(Self {
			timestamp,
			nonce,
			version,
		})
	}
}

/// Computes the nonce stamped into a save: the sub-index nonce salted with
/// the save data (its own nonce field forced to zero) and the slot's
/// position.
fn generate_index_save_nonce(volume_nonce: u64, isl: &IndexSaveLayout) -> u64 {
	let mut writer = BufferWriter::with_capacity(INDEX_SAVE_DATA_SIZE + 8);
	writer.put_u64(isl.save_data.timestamp);
	writer.put_u64(0);
	writer.put_u32(isl.save_data.version);
	writer.put_u32(0);
	writer.put_u64(isl.index_save.start_block);

	generate_secondary_nonce(volume_nonce, writer.as_bytes())
}

/// Computes the sub-index nonce from the primary nonce and the sub-index
/// position. Never 0 by construction.
fn generate_sub_index_nonce(primary_nonce: u64, start_block: u64) -> u64 {
	let mut writer = BufferWriter::with_capacity(10);
	writer.put_u64(start_block);
	writer.put_u16(0);

	let nonce = generate_secondary_nonce(primary_nonce, writer.as_bytes());
	if nonce != 0 {
		nonce
	} else {
		generate_secondary_nonce(primary_nonce.wrapping_neg(), writer.as_bytes())
	}
}

/// The in-memory model of one save slot.
#[derive(Clone, Debug)]
struct IndexSaveLayout {
	/// The whole slot.
	index_save: LayoutRegion,
	/// The slot's header block.
	header: LayoutRegion,
	/// The serialized page map.
	index_page_map: LayoutRegion,
	/// One region per volume-index zone, in instance order.
	volume_index_zones: Vec<LayoutRegion>,
	/// The saved open chapter; present only in a complete save.
	open_chapter: Option<LayoutRegion>,
	/// Trailing scratch space.
	free_space: LayoutRegion,
	/// Number of zones in the save.
	zone_count: u32,
	/// Whether the slot holds a complete save.
	save_type: SaveType,
	/// The slot's stamp.
	save_data: IndexSaveData,
	/// The opaque index state buffer, held while a save is in flight or
	/// after a load.
	state_buffer: Option<Vec<u8>>,
}

impl IndexSaveLayout {
	/// Builds the fresh, unsaved shape of a slot: header, page map, and
	/// scratch space covering the remainder.
	fn reset(index_save: LayoutRegion, page_map_blocks: u64) -> Self {
		let start = index_save.start_block;
		let header = LayoutRegion::new(start, 1, RegionKind::Header, SOLE_INSTANCE);
		let index_page_map = LayoutRegion::new(
			start + 1,
			page_map_blocks,
			RegionKind::IndexPageMap,
			SOLE_INSTANCE,
		);
		let free_start = start + 1 + page_map_blocks;
		let free_space = LayoutRegion::new(
			free_start,
			(index_save.start_block + index_save.num_blocks).saturating_sub(free_start),
			RegionKind::Scratch,
			SOLE_INSTANCE,
		);

		Self {
			index_save,
			header,
			index_page_map,
			volume_index_zones: Vec::new(),
			open_chapter: None,
			free_space,
			zone_count: 0,
			save_type: SaveType::NoSave,
			save_data: IndexSaveData::default(),
			state_buffer: None,
		}
	}

	/// Re-carves the slot for a save with the given zone count and stamps
	/// it with a fresh timestamp and nonce.
	fn instantiate(
		&mut self,
		super_block: &SuperBlockData,
		volume_nonce: u64,
		zone_count: u32,
		timestamp: u64,
	) -> Result<()> {
		if zone_count == 0 || zone_count > MAX_ZONES {
			return Err(Error::InvalidArgument(format!(
				"cannot save {} zones",
				zone_count
			)));
		}

		let overhead = 1 + super_block.page_map_blocks + super_block.open_chapter_blocks;
		let free_blocks = self
			.index_save
			.num_blocks
			.checked_sub(overhead)
			.ok_or_else(|| {
				Error::BadState("save slot is smaller than its fixed regions".into())
			})?;
		let blocks_per_zone = free_blocks / u64::from(zone_count);
		if blocks_per_zone == 0 {
			return Err(Error::InvalidArgument(format!(
				"a save cannot hold {} zones",
				zone_count
			)));
		}

		let start = self.index_save.start_block;
		self.header = LayoutRegion::new(start, 1, RegionKind::Header, SOLE_INSTANCE);
		self.index_page_map = LayoutRegion::new(
			start + 1,
			super_block.page_map_blocks,
			RegionKind::IndexPageMap,
			SOLE_INSTANCE,
		);

		let mut next_block = start + 1 + super_block.page_map_blocks;
		self.volume_index_zones.clear();
		for zone in 0..zone_count {
			self.volume_index_zones.push(LayoutRegion::new(
				next_block,
				blocks_per_zone,
				RegionKind::VolumeIndex,
				zone as u16,
			));
			next_block += blocks_per_zone;
		}

		self.open_chapter = Some(LayoutRegion::new(
			next_block,
			super_block.open_chapter_blocks,
			RegionKind::OpenChapter,
			SOLE_INSTANCE,
		));
		next_block += super_block.open_chapter_blocks;

		self.free_space = LayoutRegion::new(
			next_block,
			self.index_save.start_block + self.index_save.num_blocks - next_block,
			RegionKind::Scratch,
			SOLE_INSTANCE,
		);

		self.zone_count = zone_count;
		self.save_type = SaveType::Save;
		self.save_data = IndexSaveData {
			timestamp,
			nonce: 0,
			version: 1,
		};
		self.save_data.nonce = generate_index_save_nonce(volume_nonce, self);
		self.state_buffer = None;

		Ok(())
	}

	/// Abandons an in-flight save: zeroes the stamp and drops the state
	/// buffer. The on-disk slot was already invalidated and is not
	/// touched.
	fn cancel(&mut self) {
		self.save_data = IndexSaveData::default();
		self.save_type = SaveType::NoSave;
		self.zone_count = 0;
		self.state_buffer = None;
	}

	/// Builds the slot's region table and header payload.
	fn region_table(&self) -> (RegionTable, Vec<u8>) {
		let mut regions = vec![self.header, self.index_page_map];
		regions.extend_from_slice(&self.volume_index_zones);
		if self.save_type == SaveType::Save {
			if let Some(open_chapter) = self.open_chapter {
				regions.push(open_chapter);
			}
		}
		if self.free_space.num_blocks > 0 {
			regions.push(self.free_space);
		}

		let mut payload = self.save_data.encode();
		if self.save_type == SaveType::Save {
			if let Some(buffer) = &self.state_buffer {
				payload.extend_from_slice(buffer);
			}
		}

		let region_type = if self.save_type == SaveType::Save {
			RegionType::Save
		} else {
			RegionType::Unsaved
		};
		let table = RegionTable {
			header: RegionHeader {
				region_blocks: self.index_save.num_blocks,
				region_type,
				num_regions: regions.len() as u16,
				payload: payload.len() as u16,
			},
			regions,
		};

		(table, payload)
	}
}

/// Validates a slot and returns its save time.
///
/// Anything short of a fully stamped, nonce-matching save is `BadState`,
/// which the slot-selection logic treats as "older than everything".
fn validate_save_layout(isl: &IndexSaveLayout, volume_nonce: u64) -> Result<u64> {
	if isl.save_type != SaveType::Save {
		return Err(Error::BadState("save slot holds no save".into()));
	}
	if isl.zone_count == 0 {
		return Err(Error::BadState("save slot has no zones".into()));
	}
	if isl.save_data.timestamp == 0 {
		return Err(Error::BadState("save slot was never stamped".into()));
	}

	// The nonce hash covers the save data with its nonce field zeroed.
	if isl.save_data.nonce != generate_index_save_nonce(volume_nonce, isl) {
		return Err(Error::BadState("save slot nonce mismatch".into()));
	}

	Ok(isl.save_data.timestamp)
}

/// The block counts a layout is carved from.
struct SaveLayoutSizes {
	volume_blocks: u64,
	page_map_blocks: u64,
	open_chapter_blocks: u64,
	save_blocks: u64,
	sub_index_blocks: u64,
	total_blocks: u64,
}

fn compute_sizes(config: &IndexConfig) -> Result<SaveLayoutSizes> {
	let geometry = &config.geometry;
	if geometry.bytes_per_page % BLOCK_SIZE != 0 || config.offset % BLOCK_SIZE != 0 {
		return Err(Error::IncorrectAlignment);
	}

	let volume_blocks = geometry.bytes_per_volume / BLOCK_SIZE;
	let volume_index_blocks = compute_volume_index_save_blocks(config)?;
	let page_map_blocks =
		ceil_division(compute_index_page_map_save_size(geometry), BLOCK_SIZE);
	let open_chapter_blocks =
		ceil_division(compute_saved_open_chapter_size(geometry), BLOCK_SIZE);

	let save_blocks = 1 + volume_index_blocks + page_map_blocks + open_chapter_blocks;
	let sub_index_blocks = volume_blocks + u64::from(MAX_SAVES) * save_blocks;

	Ok(SaveLayoutSizes {
		volume_blocks,
		page_map_blocks,
		open_chapter_blocks,
		save_blocks,
		sub_index_blocks,
		// Header, config, and seal around the sub-index.
		total_blocks: 3 + sub_index_blocks,
	})
}

/// The single sub-index: the volume and its save slots.
struct SubIndexLayout {
	/// The region spanning volume and saves.
	sub_index: LayoutRegion,
	/// The sub-index nonce, derived from the superblock nonce.
	nonce: u64,
	/// The volume region.
	volume: LayoutRegion,
	/// The save slots.
	saves: Vec<IndexSaveLayout>,
}

/// An open index layout on a backing store.
pub struct IndexLayout {
	factory: IoFactory,
	super_block: SuperBlockData,
	header: LayoutRegion,
	config_region: LayoutRegion,
	index: SubIndexLayout,
	seal: LayoutRegion,
	/// Declared size of the layout in blocks.
	total_blocks: u64,
}

fn region_reader(
	factory: &IoFactory,
	super_block: &SuperBlockData,
	region: &LayoutRegion,
	context: String,
) -> Result<BufferedReader> {
	let physical = region.start_block + super_block.translation();
	factory.buffered_reader(context, physical * BLOCK_SIZE, region.num_blocks * BLOCK_SIZE)
}

fn region_writer(
	factory: &IoFactory,
	super_block: &SuperBlockData,
	region: &LayoutRegion,
	context: String,
) -> Result<BufferedWriter> {
	let physical = region.start_block + super_block.translation();
	factory.buffered_writer(context, physical * BLOCK_SIZE, region.num_blocks * BLOCK_SIZE)
}

/// Writes a slot's region table, save data, and state buffer into its
/// header block and flushes. This is the write that commits or revokes a
/// save, so it always runs last.
fn write_index_save_layout(
	factory: &IoFactory,
	super_block: &SuperBlockData,
	isl: &IndexSaveLayout,
) -> Result<()> {
	let (table, payload) = isl.region_table();
	let mut writer = region_writer(
		factory,
		super_block,
		&isl.header,
		format!("header of save slot {}", isl.index_save.instance),
	)?;
	writer.write_all(&table.encode())?;
	writer.write_all(&payload)?;

	writer.flush()
}

/// Reads one save slot's on-disk table and rebuilds its in-memory model.
fn load_index_save(
	factory: &IoFactory,
	super_block: &SuperBlockData,
	index_save: LayoutRegion,
) -> Result<IndexSaveLayout> {
	let instance = index_save.instance;
	let mut reader = region_reader(
		factory,
		super_block,
		&index_save,
		format!("save slot {}", instance),
	)?;

	let table = RegionTable::load(&mut reader).map_err(|e| match e {
		// A save slot always has a table; a missing magic is corruption,
		// not an unformatted store.
		Error::NoIndex => Error::CorruptData(format!(
			"save slot {} has no region table",
			instance
		)),
		e => e,
	})?;

	if table.header.region_blocks != index_save.num_blocks {
		return Err(Error::CorruptData(format!(
			"save slot {} claims {} blocks instead of {}",
			instance, table.header.region_blocks, index_save.num_blocks
		)));
	}
	let save_type = match table.header.region_type {
		RegionType::Save => SaveType::Save,
		RegionType::Unsaved => SaveType::NoSave,

		_ => {
			return Err(Error::CorruptData(format!(
				"save slot {} has header type {:?}",
				instance, table.header.region_type
			)));
		}
	};

	let payload_size = table.header.payload as usize;
	if payload_size < INDEX_SAVE_DATA_SIZE
		|| payload_size > INDEX_SAVE_DATA_SIZE + INDEX_STATE_BUFFER_SIZE
	{
		return Err(Error::CorruptData(format!(
			"save slot {} has a {} byte payload",
			instance, payload_size
		)));
	}
	let payload = reader.read_vec(payload_size)?;
	let mut decoder = BufferReader::new(&payload);
	let save_data = IndexSaveData::decode(&mut decoder)?;
	let state_buffer = if payload_size > INDEX_SAVE_DATA_SIZE {
		Some(payload[INDEX_SAVE_DATA_SIZE..].to_vec())
	} else {
		None
	};

	// A slot with no regions, or holding nothing but scratch space, reads
	// as fresh so the next save can claim it.
	if table.regions.is_empty()
		|| (table.regions.len() == 1 && table.regions[0].kind == RegionKind::Scratch)
	{
		return Ok(IndexSaveLayout::reset(index_save, super_block.page_map_blocks));
	}

	let mut iter = RegionIterator::new(&table.regions, index_save.start_block);
	let header = iter.expect(RegionKind::Header, SOLE_INSTANCE, Some(1));
	let index_page_map = iter.expect(RegionKind::IndexPageMap, SOLE_INSTANCE, None);

	let mut volume_index_zones = Vec::new();
	while iter.peek_kind() == Some(RegionKind::VolumeIndex) {
		let zone = volume_index_zones.len() as u16;
		match iter.expect(RegionKind::VolumeIndex, zone, None) {
			Some(region) => volume_index_zones.push(region),
			None => break,
		}
	}

	let open_chapter = if save_type == SaveType::Save {
		iter.expect(RegionKind::OpenChapter, SOLE_INSTANCE, None)
	} else {
		None
	};

	let free_space = if iter.peek_kind() == Some(RegionKind::Scratch) {
		iter.expect(RegionKind::Scratch, SOLE_INSTANCE, None)
	} else {
		// Synthesize scratch space from the residual blocks.
		let next = iter.next_block();
		Some(LayoutRegion::new(
			next,
			(index_save.start_block + index_save.num_blocks).saturating_sub(next),
			RegionKind::Scratch,
			SOLE_INSTANCE,
		))
	};

	let trailing = iter.remaining();
	iter.into_result()?;
	if trailing > 0 {
		return Err(Error::UnexpectedResult(format!(
			"save slot {} has {} trailing regions",
			instance, trailing
		)));
	}

	// The iterator reported success, so every expected region was found.
	let zone_count = volume_index_zones.len() as u32;
	Ok(IndexSaveLayout {
		index_save,
		header: header.expect("checked by the iterator"),
		index_page_map: index_page_map.expect("checked by the iterator"),
		volume_index_zones,
		open_chapter,
		free_space: free_space.expect("checked by the iterator"),
		zone_count,
		save_type,
		save_data,
		state_buffer,
	})
}

impl IndexLayout {
	/// Creates a new layout or opens an existing one at
	/// `config.name` / `config.offset`.
	pub fn new(config: &IndexConfig, new_layout: bool) -> Result<Self> {
		if new_layout {
			Self::create(config)
		} else {
			Self::load(config)
		}
	}

	/// Returns the number of bytes a layout for `config` occupies.
	pub fn compute_size(config: &IndexConfig) -> Result<u64> {
		Ok(compute_sizes(config)?.total_blocks * BLOCK_SIZE)
	}

	/// Returns the nonce binding saves to this volume.
	pub fn volume_nonce(&self) -> u64 {
		self.index.nonce
	}

	/// Returns the number of save slots.
	pub fn save_count(&self) -> usize {
		self.index.saves.len()
	}

	/// Validates the given slot and returns its save time.
	pub fn validate_save(&self, slot: usize) -> Result<u64> {
		let isl = self.index.saves.get(slot).ok_or_else(|| {
			Error::InvalidArgument(format!("save slot {} out of range", slot))
		})?;

		validate_save_layout(isl, self.index.nonce)
	}

	/// Returns the slot holding the most recent valid save.
	pub fn latest_save(&self) -> Result<usize> {
		let mut latest = None;
		let mut latest_time = 0;
		for slot in 0..self.index.saves.len() {
			if let Ok(time) = self.validate_save(slot) {
				if latest.is_none() || time > latest_time {
					latest = Some(slot);
					latest_time = time;
				}
			}
		}

		latest.ok_or(Error::IndexNotSavedCleanly)
	}

	/// Returns the slot the next save will overwrite: the one with the
	/// smallest save time, an invalid slot counting as time 0. Ties go to
	/// the lower slot.
	pub fn oldest_save(&self) -> usize {
		let mut oldest = 0;
		let mut oldest_time = self.validate_save(0).unwrap_or(0);
		for slot in 1..self.index.saves.len() {
			let time = self.validate_save(slot).unwrap_or(0);
			if time < oldest_time {
				oldest = slot;
				oldest_time = time;
			}
		}

		oldest
	}

	fn create(config: &IndexConfig) -> Result<Self> {
		let sizes = compute_sizes(config)?;
		let factory = IoFactory::open(
			&config.name,
			IoMode::CreateReadWrite,
			config.offset + sizes.total_blocks * BLOCK_SIZE,
		)?;

		let super_block = SuperBlockData {
			nonce_info: create_unique_nonce_data(),
			nonce: 0,
			version: SUPER_VERSION_CURRENT,
			block_size: BLOCK_SIZE as u32,
			num_indexes: 1,
			max_saves: MAX_SAVES,
			open_chapter_blocks: sizes.open_chapter_blocks,
			page_map_blocks: sizes.page_map_blocks,
			volume_offset: 0,
			start_offset: 0,
		};
		let super_block = SuperBlockData {
			nonce: generate_primary_nonce(&super_block.nonce_info),
			..super_block
		};

		let layout = Self::setup(factory, config.offset, super_block, &sizes)?;

		// Write the save-slot skeletons first, then the top-level header,
		// then the configuration, so a crash mid-create never yields a
		// header describing regions that were never written.
		for slot in 0..layout.index.saves.len() {
			write_index_save_layout(
				&layout.factory,
				&layout.super_block,
				&layout.index.saves[slot],
			)?;
		}
		layout.save_layout()?;
		layout.write_config_region(config)?;

		Ok(layout)
	}

	/// Lays the regions out in memory for a fresh layout.
	fn setup(
		factory: IoFactory,
		offset: u64,
		super_block: SuperBlockData,
		sizes: &SaveLayoutSizes,
	) -> Result<Self> {
		let first_block = offset / BLOCK_SIZE;
		let mut next_block = first_block;

		let header = LayoutRegion::new(next_block, 1, RegionKind::Header, SOLE_INSTANCE);
		next_block += 1;
		let config_region =
			LayoutRegion::new(next_block, 1, RegionKind::Config, SOLE_INSTANCE);
		next_block += 1;

		let sub_index =
			LayoutRegion::new(next_block, sizes.sub_index_blocks, RegionKind::Index, 0);
		let volume = LayoutRegion::new(
			next_block,
			sizes.volume_blocks,
			RegionKind::Volume,
			SOLE_INSTANCE,
		);
		next_block += sizes.volume_blocks;

		let mut saves = Vec::with_capacity(super_block.max_saves as usize);
		for slot in 0..super_block.max_saves {
			let index_save =
				LayoutRegion::new(next_block, sizes.save_blocks, RegionKind::Save, slot);
			saves.push(IndexSaveLayout::reset(index_save, sizes.page_map_blocks));
			next_block += sizes.save_blocks;
		}

		let seal = LayoutRegion::new(next_block, 1, RegionKind::Seal, SOLE_INSTANCE);
		next_block += 1;

		if next_block != first_block + sizes.total_blocks {
			return Err(Error::UnexpectedResult(format!(
				"layout ends at block {} instead of {}",
				next_block,
				first_block + sizes.total_blocks
			)));
		}

		let nonce = generate_sub_index_nonce(super_block.nonce, sub_index.start_block);

		Ok(Self {
			factory,
			super_block,
			header,
			config_region,
			index: SubIndexLayout {
				sub_index,
				nonce,
				volume,
				saves,
			},
			seal,
			total_blocks: sizes.total_blocks,
		})
	}

	fn load(config: &IndexConfig) -> Result<Self> {
		let sizes = compute_sizes(config)?;
		let factory = IoFactory::open(
			&config.name,
			IoMode::ReadWrite,
			config.offset + sizes.total_blocks * BLOCK_SIZE,
		)?;

		let mut reader =
			factory.buffered_reader("layout header", config.offset, BLOCK_SIZE)?;
		let table = RegionTable::load(&mut reader)?;
		if table.header.region_type != RegionType::Super {
			return Err(Error::CorruptData(
				"the layout header is not a superblock region table".into(),
			));
		}

		let payload = reader.read_vec(table.header.payload as usize)?;
		let super_block = SuperBlockData::decode(&payload)?;

		// Region positions are recorded in pre-conversion coordinates.
		let first_block = (config.offset / BLOCK_SIZE)
			.checked_sub(super_block.translation())
			.ok_or_else(|| {
				Error::CorruptData(
					"conversion offsets point before the backing store".into(),
				)
			})?;

		let mut iter = RegionIterator::new(&table.regions, first_block);
		let header = iter.expect(RegionKind::Header, SOLE_INSTANCE, Some(1));
		let config_region = iter.expect(RegionKind::Config, SOLE_INSTANCE, Some(1));
		let sub_index = iter.expect_spanning(RegionKind::Index, 0);
		let volume = iter.expect(RegionKind::Volume, SOLE_INSTANCE, None);
		// Conversion shrinks the volume without moving the saves; bridge
		// the gap it leaves.
		iter.advance(super_block.volume_offset);

		let mut save_regions = Vec::with_capacity(super_block.max_saves as usize);
		for slot in 0..super_block.max_saves {
			if let Some(region) = iter.expect(RegionKind::Save, slot, None) {
				save_regions.push(region);
			}
		}
		let seal = iter.expect(RegionKind::Seal, SOLE_INSTANCE, Some(1));

		let trailing = iter.remaining();
		let end_block = iter.next_block();
		iter.into_result()?;
		if trailing > 0 {
			return Err(Error::UnexpectedResult(format!(
				"layout has {} trailing regions",
				trailing
			)));
		}

		let total_blocks = table.header.region_blocks;
		if end_block != first_block + total_blocks + super_block.volume_offset {
			return Err(Error::CorruptData(format!(
				"layout regions cover {} blocks instead of {}",
				end_block - first_block,
				total_blocks + super_block.volume_offset
			)));
		}

		// The iterator reported success, so every expected region was found.
		let sub_index = sub_index.expect("checked by the iterator");
		let nonce = generate_sub_index_nonce(super_block.nonce, sub_index.start_block);

		let mut saves = Vec::with_capacity(save_regions.len());
		for region in save_regions {
			saves.push(load_index_save(&factory, &super_block, region)?);
		}

		let layout = Self {
			factory,
			header: header.expect("checked by the iterator"),
			config_region: config_region.expect("checked by the iterator"),
			index: SubIndexLayout {
				sub_index,
				nonce,
				volume: volume.expect("checked by the iterator"),
				saves,
			},
			seal: seal.expect("checked by the iterator"),
			super_block,
			total_blocks,
		};

		let mut reader = region_reader(
			&layout.factory,
			&layout.super_block,
			&layout.config_region,
			"index configuration".into(),
		)?;
		validate_config(&mut reader, config)?;

		Ok(layout)
	}

	fn single_file_region_table(&self) -> RegionTable {
		let mut regions = vec![
			self.header,
			self.config_region,
			self.index.sub_index,
			self.index.volume,
		];
		for isl in &self.index.saves {
			regions.push(isl.index_save);
		}
		regions.push(self.seal);

		RegionTable {
			header: RegionHeader {
				region_blocks: self.total_blocks,
				region_type: RegionType::Super,
				num_regions: regions.len() as u16,
				payload: self.super_block.encoded_size() as u16,
			},
			regions,
		}
	}

	/// Writes the top-level region table and superblock data.
	fn save_layout(&self) -> Result<()> {
		let table = self.single_file_region_table();
		let mut writer = region_writer(
			&self.factory,
			&self.super_block,
			&self.header,
			"layout header".into(),
		)?;
		writer.write_all(&table.encode())?;
		writer.write_all(&self.super_block.encode())?;

		writer.flush()
	}

	fn write_config_region(&self, config: &IndexConfig) -> Result<()> {
		let mut writer = region_writer(
			&self.factory,
			&self.super_block,
			&self.config_region,
			"index configuration".into(),
		)?;

		write_config(&mut writer, config)
	}

	fn write_save_components(&self, slot: usize, index: &Index) -> Result<()> {
		let isl = &self.index.saves[slot];

		let open_chapter = isl.open_chapter.as_ref().ok_or_else(|| {
			Error::BadState(format!("save slot {} has no open chapter region", slot))
		})?;
		let mut writer = region_writer(
			&self.factory,
			&self.super_block,
			open_chapter,
			format!("open chapter of save slot {}", slot),
		)?;
		index.open_chapters.save(&mut writer)?;
		writer.flush()?;

		let mut writers = Vec::with_capacity(isl.volume_index_zones.len());
		for (zone, region) in isl.volume_index_zones.iter().enumerate() {
			writers.push(region_writer(
				&self.factory,
				&self.super_block,
				region,
				format!("volume index zone {} of save slot {}", zone, slot),
			)?);
		}
		index.volume_index.save(&mut writers)?;
		for writer in &mut writers {
			writer.flush()?;
		}

		let mut writer = region_writer(
			&self.factory,
			&self.super_block,
			&isl.index_page_map,
			format!("page map of save slot {}", slot),
		)?;
		index.page_map.write(&mut writer)
	}

	/// Checkpoints the index into the oldest save slot.
	///
	/// The slot is invalidated on disk before anything else is written
	/// and its header is rewritten as a save only after every component
	/// has been flushed, so a crash at any point leaves either the
	/// previous save or a cleanly unsaved slot.
	pub fn save_index_state(&mut self, index: &Index) -> Result<()> {
		let slot = self.oldest_save();

		// Invalidate first; this flush is the point of no return for the
		// old contents of the slot.
		let index_save = self.index.saves[slot].index_save;
		self.index.saves[slot] =
			IndexSaveLayout::reset(index_save, self.super_block.page_map_blocks);
		write_index_save_layout(&self.factory, &self.super_block, &self.index.saves[slot])?;

		let volume_nonce = self.index.nonce;
		self.index.saves[slot].instantiate(
			&self.super_block,
			volume_nonce,
			index.zone_count,
			current_time_ms(),
		)?;
		self.index.saves[slot].state_buffer = Some(encode_index_state(&index.state));

		let result = self.write_save_components(slot, index).and_then(|_| {
			write_index_save_layout(&self.factory, &self.super_block, &self.index.saves[slot])
		});
		if let Err(e) = result {
			self.index.saves[slot].cancel();
			return Err(e);
		}

		Ok(())
	}

	/// Restores the index from the most recent valid save.
	pub fn load_index_state(&mut self, index: &mut Index) -> Result<()> {
		let slot = self.latest_save()?;
		let isl = &self.index.saves[slot];

		let buffer = isl.state_buffer.as_deref().ok_or_else(|| {
			Error::BadState(format!("save slot {} has no state buffer", slot))
		})?;
		index.state = decode_index_state(buffer)?;

		let open_chapter = isl.open_chapter.as_ref().ok_or_else(|| {
			Error::BadState(format!("save slot {} has no open chapter region", slot))
		})?;
		let mut reader = region_reader(
			&self.factory,
			&self.super_block,
			open_chapter,
			format!("open chapter of save slot {}", slot),
		)?;
		index.open_chapters.load(&mut reader)?;

		let mut readers = Vec::with_capacity(isl.zone_count as usize);
		for (zone, region) in isl.volume_index_zones.iter().enumerate() {
			readers.push(region_reader(
				&self.factory,
				&self.super_block,
				region,
				format!("volume index zone {} of save slot {}", zone, slot),
			)?);
		}
		index.volume_index.load(&mut readers)?;

		let mut reader = region_reader(
			&self.factory,
			&self.super_block,
			&isl.index_page_map,
			format!("page map of save slot {}", slot),
		)?;
		index.page_map.read(&mut reader)
	}

	/// Invalidates every save slot on disk.
	///
	/// All slots are attempted even if one fails; the first failure is
	/// reported once the rest have been tried.
	pub fn discard_index_state(&mut self) -> Result<()> {
		let mut first_error = None;

		for slot in 0..self.index.saves.len() {
			let index_save = self.index.saves[slot].index_save;
			self.index.saves[slot] =
				IndexSaveLayout::reset(index_save, self.super_block.page_map_blocks);
			let result = write_index_save_layout(
				&self.factory,
				&self.super_block,
				&self.index.saves[slot],
			);
			if let Err(e) = result {
				first_error.get_or_insert(e);
			}
		}

		match first_error {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	/// Overwrites the open chapter of the latest save with one zeroed
	/// block, so a subsequent load replays no chapter.
	pub fn discard_open_chapter(&mut self) -> Result<()> {
		let slot = self.latest_save()?;
		let isl = &self.index.saves[slot];

		let open_chapter = isl.open_chapter.as_ref().ok_or_else(|| {
			Error::BadState(format!("save slot {} has no open chapter region", slot))
		})?;
		let mut writer = region_writer(
			&self.factory,
			&self.super_block,
			open_chapter,
			format!("open chapter of save slot {}", slot),
		)?;
		writer.write_zeros(BLOCK_SIZE)?;

		writer.flush()
	}

	/// Converts the layout to version 7, surrendering the first
	/// `offset` bytes of the volume so `lvm_offset` bytes of
	/// volume-manager metadata can be placed ahead of the layout.
	///
	/// The superblock and configuration are rewritten; the save slots are
	/// not moved. On failure the in-memory layout is restored and the
	/// on-disk layout is unchanged or still version 3.
	pub fn update_layout(
		&mut self,
		config: &IndexConfig,
		lvm_offset: u64,
		offset: u64,
	) -> Result<()> {
		if offset % BLOCK_SIZE != 0 || lvm_offset % BLOCK_SIZE != 0 {
			return Err(Error::IncorrectAlignment);
		}
		let offset_blocks = offset / BLOCK_SIZE;
		let lvm_blocks = lvm_offset / BLOCK_SIZE;
		if offset_blocks < lvm_blocks {
			return Err(Error::InvalidArgument(
				"conversion offset is smaller than the reserved space".into(),
			));
		}
		if self.super_block.version == SUPER_VERSION_CONVERTED {
			return Err(Error::BadState("the layout is already converted".into()));
		}
		if offset_blocks >= self.index.volume.num_blocks {
			return Err(Error::InvalidArgument(
				"conversion offset consumes the whole volume".into(),
			));
		}

		let saved_super = self.super_block.clone();
		let saved_sub_index = self.index.sub_index;
		let saved_volume = self.index.volume;
		let saved_total = self.total_blocks;

		self.super_block.version = SUPER_VERSION_CONVERTED;
		self.super_block.volume_offset = offset_blocks;
		self.super_block.start_offset = lvm_blocks;
		self.index.sub_index.num_blocks -= offset_blocks;
		self.index.volume.num_blocks -= offset_blocks;
		self.total_blocks -= offset_blocks;

		let result = self
			.save_layout()
			.and_then(|_| self.write_config_region(config));
		if let Err(e) = result {
			self.super_block = saved_super;
			self.index.sub_index = saved_sub_index;
			self.index.volume = saved_volume;
			self.total_blocks = saved_total;
			return Err(e);
		}

		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::config::Geometry;
	use crate::io::BufferedReader;
	use crate::io::BufferedWriter;
	use crate::page_map::IndexPageMap;
	use crate::state::IndexStateData;
	use crate::state::OpenChapter;
	use crate::state::VolumeIndex;
	use std::process;
	use std::thread;
	use std::time::Duration;

	struct StubVolumeIndex {
		payload: [u8; 24],
	}

	impl VolumeIndex for StubVolumeIndex {
		fn save(&self, writers: &mut [BufferedWriter]) -> Result<()> {
			for (zone, writer) in writers.iter_mut().enumerate() {
				writer.write_all(b"ZONE")?;
				writer.write_all(&[zone as u8])?;
				writer.write_all(&self.payload)?;
			}

			Ok(())
		}

		fn load(&mut self, readers: &mut [BufferedReader]) -> Result<()> {
			for (zone, reader) in readers.iter_mut().enumerate() {
				reader.verify(b"ZONE")?;
				reader.verify(&[zone as u8])?;
				let data = reader.read_vec(self.payload.len())?;
				self.payload.copy_from_slice(&data);
			}

			Ok(())
		}
	}

	struct StubOpenChapter {
		records: [u8; 32],
	}

	impl OpenChapter for StubOpenChapter {
		fn save(&self, writer: &mut BufferedWriter) -> Result<()> {
			writer.write_all(b"ALBOC001")?;
			writer.write_all(&self.records)
		}

		fn load(&mut self, reader: &mut BufferedReader) -> Result<()> {
			reader.verify(b"ALBOC001")?;
			let data = reader.read_vec(self.records.len())?;
			self.records.copy_from_slice(&data);

			Ok(())
		}
	}

	fn test_geometry(volume_bytes: u64) -> Geometry {
		Geometry {
			bytes_per_page: 4096,
			bytes_per_volume: volume_bytes,
			chapters_per_volume: 4,
			index_pages_per_chapter: 3,
			delta_lists_per_chapter: 10,
		}
	}

	fn test_config(name: &str, volume_bytes: u64) -> IndexConfig {
		let mut path = std::env::temp_dir();
		path.push(format!("albireo-layout-{}-{}", name, process::id()));

		IndexConfig {
			name: path,
			offset: 0,
			geometry: test_geometry(volume_bytes),
		}
	}

	fn make_index(zone_count: u32, geometry: &Geometry) -> Index {
		Index {
			state: IndexStateData::default(),
			zone_count,
			volume_index: Box::new(StubVolumeIndex {
				payload: [0x2a; 24],
			}),
			open_chapters: Box::new(StubOpenChapter {
				records: [0x17; 32],
			}),
			page_map: IndexPageMap::new(geometry.clone()).unwrap(),
		}
	}

	fn remove_store(config: &IndexConfig) {
		let _ = std::fs::remove_file(&config.name);
	}

	#[test]
	fn compute_size_is_deterministic() {
		let config = test_config("size", 16 * 4096);

		let a = IndexLayout::compute_size(&config).unwrap();
		let b = IndexLayout::compute_size(&config).unwrap();
		assert_eq!(a, b);
		assert_eq!(a % BLOCK_SIZE, 0);
	}

	#[test]
	fn misaligned_page_size_rejected() {
		let mut config = test_config("align", 16 * 4096);
		config.geometry.bytes_per_page = 4096 + 512;

		assert!(matches!(
			IndexLayout::compute_size(&config),
			Err(Error::IncorrectAlignment)
		));
	}

	#[test]
	fn fresh_create_and_open() {
		let config = test_config("fresh", 16 * 4096);
		let size = IndexLayout::compute_size(&config).unwrap();

		let created = IndexLayout::new(&config, true).unwrap();
		let created_nonce = created.volume_nonce();
		assert_ne!(created_nonce, 0);
		drop(created);

		let mut layout = IndexLayout::new(&config, false).unwrap();
		assert_eq!(layout.volume_nonce(), created_nonce);
		assert_eq!(layout.total_blocks * BLOCK_SIZE, size);
		assert_eq!(layout.save_count(), 2);
		for slot in 0..layout.save_count() {
			assert!(matches!(
				layout.validate_save(slot),
				Err(Error::BadState(_))
			));
		}
		assert!(matches!(
			layout.latest_save(),
			Err(Error::IndexNotSavedCleanly)
		));

		let mut index = make_index(1, &config.geometry);
		assert!(matches!(
			layout.load_index_state(&mut index),
			Err(Error::IndexNotSavedCleanly)
		));

		remove_store(&config);
	}

	#[test]
	fn open_unformatted_store_is_no_index() {
		let config = test_config("blank", 16 * 4096);
		let size = IndexLayout::compute_size(&config).unwrap();
		IoFactory::open(&config.name, IoMode::CreateReadWrite, size).unwrap();

		assert!(matches!(
			IndexLayout::new(&config, false),
			Err(Error::NoIndex)
		));

		remove_store(&config);
	}

	#[test]
	fn open_with_wrong_geometry_is_no_index() {
		let config = test_config("wronggeo", 16 * 4096);
		IndexLayout::new(&config, true).unwrap();

		let mut other = config.clone();
		other.geometry.delta_lists_per_chapter = 12;
		assert!(matches!(
			IndexLayout::new(&other, false),
			Err(Error::NoIndex)
		));

		remove_store(&config);
	}

	#[test]
	fn layout_round_trips_structurally() {
		let config = test_config("roundtrip", 16 * 4096);

		let created = IndexLayout::new(&config, true).unwrap();
		let header = created.header;
		let config_region = created.config_region;
		let sub_index = created.index.sub_index;
		let volume = created.index.volume;
		let save_regions: Vec<_> =
			created.index.saves.iter().map(|s| s.index_save).collect();
		let seal = created.seal;
		drop(created);

		let opened = IndexLayout::new(&config, false).unwrap();
		assert_eq!(opened.header, header);
		assert_eq!(opened.config_region, config_region);
		assert_eq!(opened.index.sub_index, sub_index);
		assert_eq!(opened.index.volume, volume);
		let reopened: Vec<_> =
			opened.index.saves.iter().map(|s| s.index_save).collect();
		assert_eq!(reopened, save_regions);
		assert_eq!(opened.seal, seal);

		remove_store(&config);
	}

	#[test]
	fn save_and_load_round_trip() {
		let config = test_config("saveload", 16 * 4096);

		let mut layout = IndexLayout::new(&config, true).unwrap();
		let mut index = make_index(2, &config.geometry);
		index.state = IndexStateData {
			newest_chapter: 1000,
			oldest_chapter: 100,
			last_save: 0xcafe,
		};
		index.page_map.update(1, 0, 0, 3).unwrap();
		layout.save_index_state(&index).unwrap();
		let written = layout.latest_save().unwrap();
		drop(layout);

		let mut layout = IndexLayout::new(&config, false).unwrap();
		assert_eq!(layout.latest_save().unwrap(), written);

		let mut restored = make_index(2, &config.geometry);
		restored.state = IndexStateData::default();
		layout.load_index_state(&mut restored).unwrap();
		assert_eq!(
			restored.state,
			IndexStateData {
				newest_chapter: 1000,
				oldest_chapter: 100,
				last_save: 0xcafe,
			}
		);
		assert_eq!(restored.page_map.get_list_number_bounds(0, 0).unwrap(), (0, 3));

		remove_store(&config);
	}

	#[test]
	fn crash_between_invalidate_and_write() {
		let config = test_config("crash", 16 * 4096);

		let mut layout = IndexLayout::new(&config, true).unwrap();
		let index = make_index(1, &config.geometry);
		layout.save_index_state(&index).unwrap();
		let saved_slot = layout.latest_save().unwrap();

		// Begin a second save: invalidate the oldest slot on disk, then
		// stop before anything else lands, as a crash would.
		let victim = layout.oldest_save();
		assert_ne!(victim, saved_slot);
		let index_save = layout.index.saves[victim].index_save;
		layout.index.saves[victim] =
			IndexSaveLayout::reset(index_save, layout.super_block.page_map_blocks);
		write_index_save_layout(
			&layout.factory,
			&layout.super_block,
			&layout.index.saves[victim],
		)
		.unwrap();
		drop(layout);

		let layout = IndexLayout::new(&config, false).unwrap();
		assert_eq!(layout.latest_save().unwrap(), saved_slot);
		assert!(matches!(
			layout.validate_save(victim),
			Err(Error::BadState(_))
		));

		remove_store(&config);
	}

	#[test]
	fn saves_rotate_through_both_slots() {
		let config = test_config("rotate", 16 * 4096);

		let mut layout = IndexLayout::new(&config, true).unwrap();
		let index = make_index(1, &config.geometry);

		let mut timestamps = Vec::new();
		for _ in 0..3 {
			// Save times have millisecond resolution; keep them distinct.
			thread::sleep(Duration::from_millis(5));
			layout.save_index_state(&index).unwrap();
			let slot = layout.latest_save().unwrap();
			timestamps.push(layout.validate_save(slot).unwrap());
		}
		assert!(timestamps[0] < timestamps[1] && timestamps[1] < timestamps[2]);

		let latest = layout.latest_save().unwrap();
		assert_eq!(layout.validate_save(latest).unwrap(), timestamps[2]);
		let oldest = layout.oldest_save();
		assert_eq!(layout.validate_save(oldest).unwrap(), timestamps[1]);

		// The first save has been overwritten.
		let remaining: Vec<_> = (0..layout.save_count())
			.filter_map(|slot| layout.validate_save(slot).ok())
			.collect();
		assert!(!remaining.contains(&timestamps[0]));

		remove_store(&config);
	}

	#[test]
	fn scratch_only_slot_loads_as_fresh() {
		let config = test_config("scratch", 16 * 4096);

		let mut layout = IndexLayout::new(&config, true).unwrap();
		let slot_region = layout.index.saves[0].index_save;

		// Rewrite slot 0 as a table holding nothing but scratch space.
		let scratch = LayoutRegion::new(
			slot_region.start_block,
			slot_region.num_blocks,
			RegionKind::Scratch,
			SOLE_INSTANCE,
		);
		let table = RegionTable {
			header: RegionHeader {
				region_blocks: slot_region.num_blocks,
				region_type: RegionType::Unsaved,
				num_regions: 1,
				payload: INDEX_SAVE_DATA_SIZE as u16,
			},
			regions: vec![scratch],
		};
		let mut writer = layout
			.factory
			.buffered_writer(
				"slot 0 header",
				slot_region.start_block * BLOCK_SIZE,
				BLOCK_SIZE,
			)
			.unwrap();
		writer.write_all(&table.encode()).unwrap();
		writer.write_all(&IndexSaveData::default().encode()).unwrap();
		writer.flush().unwrap();
		drop(layout);

		let mut layout = IndexLayout::new(&config, false).unwrap();
		assert!(matches!(layout.validate_save(0), Err(Error::BadState(_))));

		// The slot is usable again.
		let index = make_index(1, &config.geometry);
		layout.save_index_state(&index).unwrap();
		assert_eq!(layout.latest_save().unwrap(), 0);

		remove_store(&config);
	}

	#[test]
	fn unknown_super_versions_rejected() {
		use std::os::unix::fs::FileExt;

		let config = test_config("versions", 16 * 4096);
		IndexLayout::new(&config, true).unwrap();

		// The version field sits after the table (header plus seven
		// descriptors) and the magic, seed, and nonce of the payload.
		let version_offset = (24 + 7 * 24 + 32 + 32 + 8) as u64;

		for version in [1u32, 2, 4, 5, 6, 8] {
			let file = std::fs::OpenOptions::new()
				.write(true)
				.open(&config.name)
				.unwrap();
			file.write_all_at(&version.to_le_bytes(), version_offset)
				.unwrap();

			assert!(matches!(
				IndexLayout::new(&config, false),
				Err(Error::UnsupportedVersion(_))
			));
		}

		// Restoring version 3 makes the layout readable again.
		let file = std::fs::OpenOptions::new()
			.write(true)
			.open(&config.name)
			.unwrap();
		file.write_all_at(&3u32.to_le_bytes(), version_offset).unwrap();
		IndexLayout::new(&config, false).unwrap();

		remove_store(&config);
	}

	#[test]
	fn discard_state_invalidates_everything() {
		let config = test_config("discard", 16 * 4096);

		let mut layout = IndexLayout::new(&config, true).unwrap();
		let index = make_index(1, &config.geometry);
		layout.save_index_state(&index).unwrap();
		thread::sleep(Duration::from_millis(5));
		layout.save_index_state(&index).unwrap();

		layout.discard_index_state().unwrap();
		assert!(matches!(
			layout.latest_save(),
			Err(Error::IndexNotSavedCleanly)
		));
		drop(layout);

		let layout = IndexLayout::new(&config, false).unwrap();
		assert!(matches!(
			layout.latest_save(),
			Err(Error::IndexNotSavedCleanly)
		));

		remove_store(&config);
	}

	#[test]
	fn discard_open_chapter_zeroes_the_region() {
		let config = test_config("discardoc", 16 * 4096);

		let mut layout = IndexLayout::new(&config, true).unwrap();
		let index = make_index(1, &config.geometry);
		layout.save_index_state(&index).unwrap();

		layout.discard_open_chapter().unwrap();

		// The save itself is still the latest, but its open chapter no
		// longer carries the component magic.
		let mut restored = make_index(1, &config.geometry);
		assert!(matches!(
			layout.load_index_state(&mut restored),
			Err(Error::CorruptData(_))
		));

		remove_store(&config);
	}

	#[test]
	fn conversion_round_trip() {
		let config = test_config("convert", 512 * 4096);
		let mib = 1024 * 1024;

		let mut layout = IndexLayout::new(&config, true).unwrap();
		let mut index = make_index(2, &config.geometry);
		index.state = IndexStateData {
			newest_chapter: 7,
			oldest_chapter: 3,
			last_save: 5,
		};
		layout.save_index_state(&index).unwrap();

		layout.update_layout(&config, mib, mib).unwrap();
		assert_eq!(layout.super_block.version, 7);
		drop(layout);

		let mut layout = IndexLayout::new(&config, false).unwrap();
		assert_eq!(layout.super_block.version, 7);
		assert_eq!(layout.super_block.volume_offset, mib / BLOCK_SIZE);
		assert_eq!(layout.super_block.start_offset, mib / BLOCK_SIZE);

		// The pre-conversion save is still readable.
		let mut restored = make_index(2, &config.geometry);
		layout.load_index_state(&mut restored).unwrap();
		assert_eq!(restored.state.newest_chapter, 7);
		assert_eq!(restored.state.oldest_chapter, 3);
		assert_eq!(restored.state.last_save, 5);

		// And new saves round-trip on the converted layout.
		thread::sleep(Duration::from_millis(5));
		index.state.newest_chapter = 9;
		layout.save_index_state(&index).unwrap();
		drop(layout);

		let mut layout = IndexLayout::new(&config, false).unwrap();
		let mut restored = make_index(2, &config.geometry);
		layout.load_index_state(&mut restored).unwrap();
		assert_eq!(restored.state.newest_chapter, 9);

		remove_store(&config);
	}

	#[test]
	fn conversion_rejects_bad_offsets() {
		let config = test_config("convertbad", 512 * 4096);
		let mut layout = IndexLayout::new(&config, true).unwrap();

		assert!(matches!(
			layout.update_layout(&config, 4096, 100),
			Err(Error::IncorrectAlignment)
		));
		assert!(matches!(
			layout.update_layout(&config, 2 * 4096, 4096),
			Err(Error::InvalidArgument(_))
		));
		// Consuming the whole volume is refused.
		assert!(matches!(
			layout.update_layout(&config, 512 * 4096, 512 * 4096),
			Err(Error::InvalidArgument(_))
		));

		remove_store(&config);
	}

	#[test]
	fn cancelled_save_leaves_previous_save_valid() {
		let config = test_config("cancel", 16 * 4096);

		struct FailingVolumeIndex;

		impl VolumeIndex for FailingVolumeIndex {
			fn save(&self, _: &mut [BufferedWriter]) -> Result<()> {
				Err(Error::BadState("volume index refused to save".into()))
			}

			fn load(&mut self, _: &mut [BufferedReader]) -> Result<()> {
				Ok(())
			}
		}

		let mut layout = IndexLayout::new(&config, true).unwrap();
		let index = make_index(1, &config.geometry);
		layout.save_index_state(&index).unwrap();
		let saved_slot = layout.latest_save().unwrap();

		thread::sleep(Duration::from_millis(5));
		let broken = Index {
			state: IndexStateData::default(),
			zone_count: 1,
			volume_index: Box::new(FailingVolumeIndex),
			open_chapters: Box::new(StubOpenChapter {
				records: [0; 32],
			}),
			page_map: IndexPageMap::new(config.geometry.clone()).unwrap(),
		};
		assert!(layout.save_index_state(&broken).is_err());

		// The failed save was cancelled; the earlier save still wins.
		assert_eq!(layout.latest_save().unwrap(), saved_slot);
		drop(layout);

		let layout = IndexLayout::new(&config, false).unwrap();
		assert_eq!(layout.latest_save().unwrap(), saved_slot);

		remove_store(&config);
	}
}
