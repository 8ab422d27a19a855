//! Region descriptors and region tables.
//!
//! A region is a contiguous run of blocks with a kind and an instance
//! number. A region table is a header followed by a list of region
//! descriptors, persisted at the start of a compound region; the top-level
//! layout and every save slot each carry one.

use crate::buffer::BufferReader;
use crate::buffer::BufferWriter;
use crate::error::Error;
use crate::error::Result;
use crate::io::BufferedReader;

/// Magic opening every region table, encoded little-endian.
pub const REGION_MAGIC: u64 = 0x416c6252676e3031;
/// The only supported region-table format version.
pub const REGION_HEADER_VERSION: u16 = 1;
/// Instance number used when a region's kind implies uniqueness.
pub const SOLE_INSTANCE: u16 = 65535;

/// Encoded size of a region header.
pub const REGION_HEADER_SIZE: usize = 24;
/// Encoded size of one region descriptor.
pub const REGION_DESCRIPTOR_SIZE: usize = 24;

/// The type of the compound region a table describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionType {
	/// Unused space.
	Free,
	/// The top-level table, whose payload is the superblock data.
	Super,
	/// A save slot holding a valid save.
	Save,
	/// A save slot with no usable content.
	Unsaved,
}

impl RegionType {
	fn to_u16(self) -> u16 {
		match self {
			Self::Free => 0,
			Self::Super => 1,
			Self::Save => 2,
			// 3 is retired and never written.
			Self::Unsaved => 4,
		}
	}

	fn from_u16(value: u16) -> Result<Self> {
		match value {
			0 => Ok(Self::Free),
			1 => Ok(Self::Super),
			2 => Ok(Self::Save),
			4 => Ok(Self::Unsaved),

			_ => Err(Error::CorruptData(format!(
				"unknown region header type {}",
				value
			))),
		}
	}
}

/// What a region holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
	/// Trailing free space inside a save slot.
	Scratch,
	/// The block holding a region table.
	Header,
	/// The serialized index configuration.
	Config,
	/// The whole sub-index: volume plus save slots.
	Index,
	/// The final block of the layout.
	Seal,
	/// The on-disk volume.
	Volume,
	/// One save slot.
	Save,
	/// A serialized index page map.
	IndexPageMap,
	/// One volume-index zone within a save.
	VolumeIndex,
	/// The open chapter within a save.
	OpenChapter,
}

impl RegionKind {
	fn to_u16(self) -> u16 {
		match self {
			Self::Scratch => 0,
			Self::Header => 1,
			Self::Config => 100,
			Self::Index => 101,
			Self::Seal => 102,
			Self::Volume => 201,
			Self::Save => 202,
			Self::IndexPageMap => 301,
			Self::VolumeIndex => 302,
			Self::OpenChapter => 303,
		}
	}

	fn from_u16(value: u16) -> Result<Self> {
		match value {
			0 => Ok(Self::Scratch),
			1 => Ok(Self::Header),
			100 => Ok(Self::Config),
			101 => Ok(Self::Index),
			102 => Ok(Self::Seal),
			201 => Ok(Self::Volume),
			202 => Ok(Self::Save),
			301 => Ok(Self::IndexPageMap),
			302 => Ok(Self::VolumeIndex),
			303 => Ok(Self::OpenChapter),

			_ => Err(Error::CorruptData(format!(
				"unknown region kind {}",
				value
			))),
		}
	}
}

/// One region descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LayoutRegion {
	/// First block of the region.
	pub start_block: u64,
	/// Length of the region in blocks.
	pub num_blocks: u64,
	/// Content checksum; only SAVE regions ever carry one.
	pub checksum: u32,
	/// What the region holds.
	pub kind: RegionKind,
	/// Distinguishes several regions of the same kind; `SOLE_INSTANCE`
	/// when uniqueness is implied.
	pub instance: u16,
}

impl LayoutRegion {
	/// Builds a descriptor with no checksum.
	pub fn new(start_block: u64, num_blocks: u64, kind: RegionKind, instance: u16) -> Self {
		Self {
			start_block,
			num_blocks,
			checksum: 0,
			kind,
			instance,
		}
	}

	fn encode(&self, writer: &mut BufferWriter) {
		writer.put_u64(self.start_block);
		writer.put_u64(self.num_blocks);
		writer.put_u32(self.checksum);
		writer.put_u16(self.kind.to_u16());
		writer.put_u16(self.instance);
	}

	fn decode(reader: &mut BufferReader) -> Result<Self> {
		let start_block = reader.get_u64()?;
		let num_blocks = reader.get_u64()?;
		let checksum = reader.get_u32()?;
		let kind = RegionKind::from_u16(reader.get_u16()?)?;
		let instance = reader.get_u16()?;

		Ok(Self {
			start_block,
			num_blocks,
			checksum,
			kind,
			instance,
		})
	}
}

/// The fixed-size header opening a region table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionHeader {
	/// Total blocks described by the table.
	pub region_blocks: u64,
	/// The type of the compound region.
	pub region_type: RegionType,
	/// Number of descriptors following the header.
	pub num_regions: u16,
	/// Bytes of kind-specific data following the descriptors.
	pub payload: u16,
}

/// A decoded or to-be-written region table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegionTable {
	/// The table header.
	pub header: RegionHeader,
	/// The region descriptors, in ascending `start_block` order.
	pub regions: Vec<LayoutRegion>,
}

impl RegionTable {
	/// Encodes the header and every descriptor. The payload bytes follow
	/// separately.
	pub fn encode(&self) -> Vec<u8> {
		let mut writer = BufferWriter::with_capacity(
			REGION_HEADER_SIZE + self.regions.len() * REGION_DESCRIPTOR_SIZE,
		);
		writer.put_u64(REGION_MAGIC);
		writer.put_u64(self.header.region_blocks);
		writer.put_u16(self.header.region_type.to_u16());
		writer.put_u16(REGION_HEADER_VERSION);
		writer.put_u16(self.header.num_regions);
		writer.put_u16(self.header.payload);

		for region in &self.regions {
			region.encode(&mut writer);
		}

		writer.into_bytes()
	}

	/// Reads a region table from the start of a compound region.
	///
	/// A missing magic means the store was never formatted and is reported
	/// as `NoIndex`; a recognized table with an unknown format version is
	/// `UnsupportedVersion`.
	pub fn load(reader: &mut BufferedReader) -> Result<Self> {
		let header_bytes = reader.read_vec(REGION_HEADER_SIZE)?;
		let mut decoder = BufferReader::new(&header_bytes);

		let magic = decoder.get_u64()?;
		if magic != REGION_MAGIC {
			return Err(Error::NoIndex);
		}

		let region_blocks = decoder.get_u64()?;
		let region_type = RegionType::from_u16(decoder.get_u16()?)?;
		let version = decoder.get_u16()?;
		if version != REGION_HEADER_VERSION {
			return Err(Error::UnsupportedVersion(format!(
				"region table version {}",
				version
			)));
		}
		let num_regions = decoder.get_u16()?;
		let payload = decoder.get_u16()?;
		decoder.expect_consumed("region header", REGION_HEADER_SIZE)?;

		let table_bytes =
			reader.read_vec(num_regions as usize * REGION_DESCRIPTOR_SIZE)?;
		let mut decoder = BufferReader::new(&table_bytes);
		let mut regions = Vec::with_capacity(num_regions as usize);
		for _ in 0..num_regions {
			regions.push(LayoutRegion::decode(&mut decoder)?);
		}
		decoder.expect_consumed(
			"region descriptors",
			num_regions as usize * REGION_DESCRIPTOR_SIZE,
		)?;

		Ok(Self {
			header: RegionHeader {
				region_blocks,
				region_type,
				num_regions,
				payload,
			},
			regions,
		})
	}
}

/// A one-shot walk over a decoded region array.
///
/// Each `expect_*` call asserts kind, instance, position, and optionally an
/// exact block count for the next descriptor. The first mismatch is
/// recorded and later asserts become no-ops, so the walk always reports
/// the first diagnostic rather than a cascade.
pub struct RegionIterator<'a> {
	regions: &'a [LayoutRegion],
	cursor: usize,
	next_block: u64,
	first_error: Option<String>,
}

impl<'a> RegionIterator<'a> {
	/// Starts a walk expecting the first region at `start_block`.
	pub fn new(regions: &'a [LayoutRegion], start_block: u64) -> Self {
		Self {
			regions,
			cursor: 0,
			next_block: start_block,
			first_error: None,
		}
	}

	fn fail(&mut self, message: String) {
		if self.first_error.is_none() {
			self.first_error = Some(message);
		}
	}

	fn check(
		&mut self,
		kind: RegionKind,
		instance: u16,
		num_blocks: Option<u64>,
	) -> Option<LayoutRegion> {
		if self.first_error.is_some() {
			return None;
		}

		let Some(region) = self.regions.get(self.cursor).copied() else {
			self.fail(format!(
				"ran out of regions looking for {:?} instance {}",
				kind, instance
			));
			return None;
		};
		self.cursor += 1;

		if region.kind != kind {
			self.fail(format!(
				"expected region kind {:?}, found {:?}",
				kind, region.kind
			));
			return None;
		}
		if region.instance != instance {
			self.fail(format!(
				"expected {:?} instance {}, found {}",
				kind, instance, region.instance
			));
			return None;
		}
		if region.start_block != self.next_block {
			self.fail(format!(
				"expected {:?} instance {} at block {}, found it at {}",
				kind, instance, self.next_block, region.start_block
			));
			return None;
		}
		if let Some(expected) = num_blocks {
			if region.num_blocks != expected {
				self.fail(format!(
					"expected {:?} instance {} to span {} blocks, found {}",
					kind, instance, expected, region.num_blocks
				));
				return None;
			}
		}

		Some(region)
	}

	/// Asserts the next region and advances past it.
	pub fn expect(
		&mut self,
		kind: RegionKind,
		instance: u16,
		num_blocks: Option<u64>,
	) -> Option<LayoutRegion> {
		let region = self.check(kind, instance, num_blocks)?;
		self.next_block += region.num_blocks;
		Some(region)
	}

	/// Asserts a region that spans the regions following it, without
	/// advancing the expected position.
	pub fn expect_spanning(
		&mut self,
		kind: RegionKind,
		instance: u16,
	) -> Option<LayoutRegion> {
		self.check(kind, instance, None)
	}

	/// Returns the kind of the next unconsumed region, if any.
	pub fn peek_kind(&self) -> Option<RegionKind> {
		if self.first_error.is_some() {
			return None;
		}

		self.regions.get(self.cursor).map(|r| r.kind)
	}

	/// Moves the expected position forward without consuming a region.
	pub fn advance(&mut self, blocks: u64) {
		self.next_block += blocks;
	}

	/// Returns the expected position of the next region.
	pub fn next_block(&self) -> u64 {
		self.next_block
	}

	/// Returns the number of regions not yet consumed.
	pub fn remaining(&self) -> usize {
		self.regions.len() - self.cursor
	}

	/// Finishes the walk, returning the first recorded diagnostic if any
	/// assert failed.
	pub fn into_result(self) -> Result<()> {
		match self.first_error {
			Some(message) => Err(Error::UnexpectedResult(message)),
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample_table() -> RegionTable {
		let regions = vec![
			LayoutRegion::new(0, 1, RegionKind::Header, SOLE_INSTANCE),
			LayoutRegion::new(1, 1, RegionKind::Config, SOLE_INSTANCE),
			LayoutRegion::new(2, 10, RegionKind::Volume, SOLE_INSTANCE),
		];

		RegionTable {
			header: RegionHeader {
				region_blocks: 12,
				region_type: RegionType::Super,
				num_regions: regions.len() as u16,
				payload: 0,
			},
			regions,
		}
	}

	#[test]
	fn descriptor_round_trip() {
		let region = LayoutRegion::new(7, 42, RegionKind::VolumeIndex, 3);
		let mut writer = BufferWriter::default();
		region.encode(&mut writer);

		let bytes = writer.into_bytes();
		assert_eq!(bytes.len(), REGION_DESCRIPTOR_SIZE);

		let mut reader = BufferReader::new(&bytes);
		assert_eq!(LayoutRegion::decode(&mut reader).unwrap(), region);
	}

	#[test]
	fn unknown_kind_rejected() {
		let mut writer = BufferWriter::default();
		writer.put_u64(0);
		writer.put_u64(1);
		writer.put_u32(0);
		writer.put_u16(999);
		writer.put_u16(0);

		let bytes = writer.into_bytes();
		let mut reader = BufferReader::new(&bytes);
		assert!(matches!(
			LayoutRegion::decode(&mut reader),
			Err(Error::CorruptData(_))
		));
	}

	#[test]
	fn iterator_accepts_well_formed_walk() {
		let table = sample_table();
		let mut iter = RegionIterator::new(&table.regions, 0);

		iter.expect(RegionKind::Header, SOLE_INSTANCE, Some(1));
		iter.expect(RegionKind::Config, SOLE_INSTANCE, Some(1));
		iter.expect(RegionKind::Volume, SOLE_INSTANCE, None);
		assert_eq!(iter.next_block(), 12);
		assert_eq!(iter.remaining(), 0);
		iter.into_result().unwrap();
	}

	#[test]
	fn iterator_reports_first_error_only() {
		let table = sample_table();
		let mut iter = RegionIterator::new(&table.regions, 0);

		iter.expect(RegionKind::Header, SOLE_INSTANCE, Some(1));
		// Wrong kind here; everything after must not overwrite the report.
		iter.expect(RegionKind::Volume, SOLE_INSTANCE, None);
		iter.expect(RegionKind::Seal, SOLE_INSTANCE, Some(1));

		let err = iter.into_result().unwrap_err();
		let Error::UnexpectedResult(message) = err else {
			panic!("wrong error kind");
		};
		assert!(message.contains("expected region kind Volume"));
	}

	#[test]
	fn iterator_catches_wrong_offset() {
		let mut regions = sample_table().regions;
		regions[1].start_block = 5;

		let mut iter = RegionIterator::new(&regions, 0);
		iter.expect(RegionKind::Header, SOLE_INSTANCE, Some(1));
		iter.expect(RegionKind::Config, SOLE_INSTANCE, Some(1));

		assert!(iter.into_result().is_err());
	}
}
