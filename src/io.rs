//! Block I/O façade over the backing store.
//!
//! The backing store is either a regular file or a block device. The factory
//! owns the open handle; readers and writers borrow a `(start, length)`
//! window of it and perform buffered, block-aligned I/O through positioned
//! reads and writes, so several windows can be open at once without sharing
//! a seek position.

use libc::ioctl;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Arc;

use crate::error::Error;
use crate::error::Result;

/// The fixed unit of the backing store. Every region is a whole number of
/// blocks and every header starts on a block boundary.
pub const BLOCK_SIZE: u64 = 4096;

/// ioctl command: get the size of a block device in bytes.
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

/// Access mode for opening a backing store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoMode {
	/// Create the store if missing and open it for reading and writing.
	CreateReadWrite,
	/// Open an existing store for reading and writing.
	ReadWrite,
}

/// Returns the size in bytes of the device or file at the given path.
fn get_device_size(path: &Path, file: &File) -> io::Result<u64> {
	let file_type = fs::metadata(path)?.file_type();

	if file_type.is_block_device() || file_type.is_char_device() {
		let mut size: u64 = 0;
		let ret = unsafe {
			ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size)
		};
		if ret < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok(size)
	} else {
		Ok(file.metadata()?.len())
	}
}

/// An open backing store, carved into reader/writer windows.
pub struct IoFactory {
	/// The open handle, shared by every window.
	file: Arc<File>,
	/// Usable size in bytes, rounded down to a multiple of the block size.
	size: u64,
}

impl IoFactory {
	/// Opens the backing store at `path`.
	///
	/// Arguments:
	/// - `mode` selects between creating the store and opening an existing
	///   one.
	/// - `required_size` is the number of bytes the caller needs; a store
	///   smaller than this fails with `NoSpace`. A regular file being
	///   created is extended to this size.
	pub fn open(path: &Path, mode: IoMode, required_size: u64) -> Result<Self> {
		let context = format!("backing store `{}`", path.display());

		let mut options = OpenOptions::new();
		options.read(true).write(true);
		if mode == IoMode::CreateReadWrite {
			options.create(true);
		}
		let file = options.open(path).map_err(Error::io(context.clone()))?;

		let mut size = get_device_size(path, &file)
			.map_err(Error::io(context.clone()))?;
		if size < required_size {
			if mode == IoMode::CreateReadWrite
				&& fs::metadata(path).map_err(Error::io(context.clone()))?.is_file()
			{
				file.set_len(required_size).map_err(Error::io(context))?;
				size = required_size;
			} else {
				return Err(Error::NoSpace);
			}
		}

		Ok(Self {
			file: Arc::new(file),
			size: (size / BLOCK_SIZE) * BLOCK_SIZE,
		})
	}

	/// Returns the usable size of the store in bytes.
	pub fn size(&self) -> u64 {
		self.size
	}

	/// Returns the usable size of the store in blocks.
	pub fn block_count(&self) -> u64 {
		self.size / BLOCK_SIZE
	}

	fn check_window(&self, offset: u64, length: u64) -> Result<()> {
		let end = offset.checked_add(length).ok_or(Error::NoSpace)?;
		if end > self.size {
			return Err(Error::NoSpace);
		}

		Ok(())
	}

	/// Opens a buffered reader over the byte window
	/// `[offset, offset + length)`.
	///
	/// `context` names what the window holds, for error reports.
	pub fn buffered_reader(
		&self,
		context: impl Into<String>,
		offset: u64,
		length: u64,
	) -> Result<BufferedReader> {
		self.check_window(offset, length)?;

		Ok(BufferedReader {
			file: Arc::clone(&self.file),
			context: context.into(),
			start: offset,
			length,
			position: 0,
			buffer: vec![0; BLOCK_SIZE as usize],
			buffer_start: u64::MAX,
			buffer_len: 0,
		})
	}

	/// Opens a buffered writer over the byte window
	/// `[offset, offset + length)`.
	///
	/// `context` names what the window holds, for error reports.
	pub fn buffered_writer(
		&self,
		context: impl Into<String>,
		offset: u64,
		length: u64,
	) -> Result<BufferedWriter> {
		self.check_window(offset, length)?;

		Ok(BufferedWriter {
			file: Arc::clone(&self.file),
			context: context.into(),
			start: offset,
			length,
			position: 0,
			buffer: Vec::with_capacity(BLOCK_SIZE as usize),
		})
	}
}

/// A buffered reader over a window of the backing store.
pub struct BufferedReader {
	file: Arc<File>,
	/// What the window holds; used in error reports.
	context: String,
	/// First byte of the window.
	start: u64,
	/// Length of the window in bytes.
	length: u64,
	/// Read position relative to `start`.
	position: u64,
	/// One cached block.
	buffer: Vec<u8>,
	/// Window-relative offset of the cached block, `u64::MAX` when empty.
	buffer_start: u64,
	/// Number of valid bytes in the cache.
	buffer_len: usize,
}

impl BufferedReader {
	fn fill_buffer(&mut self, block_start: u64) -> Result<()> {
		let want = usize::min(
			BLOCK_SIZE as usize,
			(self.length - block_start) as usize,
		);
		self.file
			.read_exact_at(&mut self.buffer[..want], self.start + block_start)
			.map_err(|e| {
				if e.kind() == io::ErrorKind::UnexpectedEof {
					Error::CorruptData(format!("short read in {}", self.context))
				} else {
					Error::io(self.context.clone())(e)
				}
			})?;
		self.buffer_start = block_start;
		self.buffer_len = want;

		Ok(())
	}

	/// Reads exactly `out.len()` bytes, advancing the position.
	///
	/// Running off the end of the window is reported as `CorruptData`, the
	/// same as a short read from the store.
	pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
		if self.length - self.position < out.len() as u64 {
			return Err(Error::CorruptData(format!(
				"short read in {}",
				self.context
			)));
		}

		let mut filled = 0;
		while filled < out.len() {
			let block_start = (self.position / BLOCK_SIZE) * BLOCK_SIZE;
			if self.buffer_start != block_start {
				self.fill_buffer(block_start)?;
			}

			let buffer_offset = (self.position - block_start) as usize;
			let available = self.buffer_len - buffer_offset;
			let count = usize::min(available, out.len() - filled);
			out[filled..(filled + count)].copy_from_slice(
				&self.buffer[buffer_offset..(buffer_offset + count)],
			);
			filled += count;
			self.position += count as u64;
		}

		Ok(())
	}

	/// Reads `count` bytes into a fresh vector.
	pub fn read_vec(&mut self, count: usize) -> Result<Vec<u8>> {
		let mut data = vec![0; count];
		self.read_exact(&mut data)?;
		Ok(data)
	}

	/// Reads the next `expected.len()` bytes and compares them against
	/// `expected`. On mismatch the reader is rewound to where it was and
	/// `CorruptData` is returned.
	pub fn verify(&mut self, expected: &[u8]) -> Result<()> {
		let saved = self.position;
		let mut actual = vec![0; expected.len()];
		self.read_exact(&mut actual)?;

		if actual != expected {
			self.position = saved;
			return Err(Error::CorruptData(format!(
				"verification failed in {}",
				self.context
			)));
		}

		Ok(())
	}
}

/// A buffered writer over a window of the backing store.
///
/// Data accumulates in memory and is written out a block at a time; nothing
/// is durable until [`BufferedWriter::flush`] returns.
pub struct BufferedWriter {
	file: Arc<File>,
	/// What the window holds; used in error reports.
	context: String,
	/// First byte of the window.
	start: u64,
	/// Length of the window in bytes.
	length: u64,
	/// Bytes already written out, relative to `start`.
	position: u64,
	/// Pending bytes, less than one block.
	buffer: Vec<u8>,
}

impl BufferedWriter {
	fn spill(&mut self) -> Result<()> {
		while self.buffer.len() >= BLOCK_SIZE as usize {
			let rest = self.buffer.split_off(BLOCK_SIZE as usize);
			self.file
				.write_all_at(&self.buffer, self.start + self.position)
				.map_err(Error::io(self.context.clone()))?;
			self.position += self.buffer.len() as u64;
			self.buffer = rest;
		}

		Ok(())
	}

	fn check_space(&self, count: u64) -> Result<()> {
		let pending = self.position + self.buffer.len() as u64;
		if self.length - pending < count {
			return Err(Error::NoSpace);
		}

		Ok(())
	}

	/// Appends `data` to the window.
	pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
		self.check_space(data.len() as u64)?;
		self.buffer.extend_from_slice(data);
		self.spill()
	}

	/// Appends `count` zero bytes to the window.
	pub fn write_zeros(&mut self, count: u64) -> Result<()> {
		self.check_space(count)?;

		let mut remaining = count;
		while remaining > 0 {
			let chunk = u64::min(remaining, BLOCK_SIZE);
			self.buffer.resize(self.buffer.len() + chunk as usize, 0);
			self.spill()?;
			remaining -= chunk;
		}

		Ok(())
	}

	/// Writes out any pending bytes and syncs the store. This is the
	/// durability barrier the save protocol relies on.
	pub fn flush(&mut self) -> Result<()> {
		if !self.buffer.is_empty() {
			self.file
				.write_all_at(&self.buffer, self.start + self.position)
				.map_err(Error::io(self.context.clone()))?;
			self.position += self.buffer.len() as u64;
			self.buffer.clear();
		}

		self.file
			.sync_data()
			.map_err(Error::io(self.context.clone()))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::path::PathBuf;
	use std::process;

	fn temp_store(name: &str) -> PathBuf {
		let mut path = std::env::temp_dir();
		path.push(format!("albireo-io-{}-{}", name, process::id()));
		path
	}

	#[test]
	fn write_then_read_back() {
		let path = temp_store("roundtrip");
		let factory =
			IoFactory::open(&path, IoMode::CreateReadWrite, 16 * BLOCK_SIZE).unwrap();

		let mut writer = factory
			.buffered_writer("test region", BLOCK_SIZE, 4 * BLOCK_SIZE)
			.unwrap();
		writer.write_all(b"hello layout").unwrap();
		writer.write_zeros(BLOCK_SIZE).unwrap();
		writer.write_all(b"tail").unwrap();
		writer.flush().unwrap();

		let mut reader = factory
			.buffered_reader("test region", BLOCK_SIZE, 4 * BLOCK_SIZE)
			.unwrap();
		reader.verify(b"hello layout").unwrap();
		let zeros = reader.read_vec(BLOCK_SIZE as usize).unwrap();
		assert!(zeros.iter().all(|b| *b == 0));
		reader.verify(b"tail").unwrap();

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn verify_mismatch_rewinds() {
		let path = temp_store("verify");
		let factory =
			IoFactory::open(&path, IoMode::CreateReadWrite, 4 * BLOCK_SIZE).unwrap();

		let mut writer = factory.buffered_writer("magic", 0, BLOCK_SIZE).unwrap();
		writer.write_all(b"actual magic").unwrap();
		writer.flush().unwrap();

		let mut reader = factory.buffered_reader("magic", 0, BLOCK_SIZE).unwrap();
		assert!(matches!(
			reader.verify(b"wrong  magic"),
			Err(Error::CorruptData(_))
		));
		// The failed verify must not have consumed anything.
		reader.verify(b"actual magic").unwrap();

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn reader_window_is_bounded() {
		let path = temp_store("bounds");
		let factory =
			IoFactory::open(&path, IoMode::CreateReadWrite, 4 * BLOCK_SIZE).unwrap();

		let mut reader = factory.buffered_reader("window", 0, 8).unwrap();
		assert!(matches!(
			reader.read_vec(9),
			Err(Error::CorruptData(_))
		));

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn writer_window_is_bounded() {
		let path = temp_store("wbounds");
		let factory =
			IoFactory::open(&path, IoMode::CreateReadWrite, 4 * BLOCK_SIZE).unwrap();

		let mut writer = factory.buffered_writer("window", 0, 8).unwrap();
		assert!(matches!(
			writer.write_all(&[0; 9]),
			Err(Error::NoSpace)
		));

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn open_existing_too_small() {
		let path = temp_store("small");
		IoFactory::open(&path, IoMode::CreateReadWrite, 2 * BLOCK_SIZE).unwrap();

		assert!(matches!(
			IoFactory::open(&path, IoMode::ReadWrite, 64 * BLOCK_SIZE),
			Err(Error::NoSpace)
		));

		std::fs::remove_file(&path).unwrap();
	}
}
