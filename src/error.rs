//! Error taxonomy of the layout engine.

use std::io;
use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the layout engine.
///
/// Callers either recover locally (a fresh store reporting [`Error::NoIndex`],
/// a load finding [`Error::IndexNotSavedCleanly`]) or propagate.
#[derive(Debug, Error)]
pub enum Error {
	/// The first header read found no region magic: the store has never
	/// been formatted.
	#[error("no index found on the backing store")]
	NoIndex,

	/// The magic was recognized but an invariant inside the layout failed.
	#[error("corrupt data: {0}")]
	CorruptData(String),

	/// A recognized but unhandled on-disk version.
	#[error("unsupported version: {0}")]
	UnsupportedVersion(String),

	/// The geometry's page size is not a multiple of the block size.
	#[error("page size is not a multiple of the block size")]
	IncorrectAlignment,

	/// An operation was attempted on an object in the wrong state.
	#[error("bad state: {0}")]
	BadState(String),

	/// An argument was out of range.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	/// The region iterator found a region that does not belong where it
	/// was read.
	#[error("unexpected region layout: {0}")]
	UnexpectedResult(String),

	/// The backing store is smaller than the requested or required size.
	#[error("insufficient space on the backing store")]
	NoSpace,

	/// No save slot holds a valid save.
	#[error("the index was not saved cleanly")]
	IndexNotSavedCleanly,

	/// An I/O failure, wrapped with the name of the region being accessed.
	#[error("{context}: {source}")]
	Io {
		/// What was being read or written.
		context: String,
		/// The underlying failure.
		#[source]
		source: io::Error,
	},
}

impl Error {
	/// Wraps an I/O error with a context string naming the region being
	/// read or written.
	pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
		let context = context.into();
		move |source| Self::Io {
			context,
			source,
		}
	}
}
