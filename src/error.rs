//! The error surface shared by every dolpatch component.
//!
//! Every public entry point in this crate returns [`Result`]; no component
//! prints or logs as part of its contract. The variants mirror the failure
//! classes of the patch pipeline: parse failures ([`Error::CorruptData`]),
//! address-translation misses ([`Error::AddressOutOfRange`]), allocator
//! exhaustion ([`Error::OutOfSpace`]), instruction operands that do not fit
//! their fields ([`Error::EncodingRange`]), and patch-site bytes that
//! disagree with the detected table layout ([`Error::LayoutMismatch`]).
//!
//! [`Result`]: type.Result.html
//! [`Error::CorruptData`]: enum.Error.html

use std::fmt;
use std::io;

use crate::addr::AddressSpace;

/// A convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced while reading or patching an image.
#[derive(Debug)]
pub enum Error {
  /// An underlying I/O operation failed.
  Io(io::Error),
  /// A magic literal, reserved field, or validation constant did not match
  /// its expected value while parsing a binary format. No partial value is
  /// ever returned alongside this error.
  CorruptData {
    /// The field or structure that failed validation.
    what: &'static str,
  },
  /// An address could not be placed in any known section of the image.
  ///
  /// This is recoverable: callers decide whether the address legitimately
  /// has no mapping (e.g. it points outside the patched executable).
  AddressOutOfRange {
    /// The address that could not be converted.
    addr: u32,
    /// The coordinate space the address was interpreted in.
    space: AddressSpace,
  },
  /// The free-space allocator could not satisfy a request.
  OutOfSpace {
    /// The number of bytes that were requested.
    requested: u32,
    /// The largest remaining contiguous block, for diagnostics.
    largest: u32,
  },
  /// A branch displacement or immediate operand does not fit the
  /// instruction field it would be encoded into.
  EncodingRange {
    /// The field that overflowed.
    what: &'static str,
    /// The offending value.
    value: i64,
  },
  /// Bytes at a patch site disagree with what the detected table layout
  /// implies should be there.
  LayoutMismatch {
    /// The table whose write path noticed the disagreement.
    table: &'static str,
    /// What was expected at the site.
    what: &'static str,
  },
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::Io(e) => write!(f, "i/o error: {}", e),
      Error::CorruptData { what } => write!(f, "corrupt data: {}", what),
      Error::AddressOutOfRange { addr, space } => {
        write!(f, "address {:#010x} not mapped in {} space", addr, space)
      }
      Error::OutOfSpace { requested, largest } => write!(
        f,
        "out of free space: requested {} bytes, largest block is {}",
        requested, largest
      ),
      Error::EncodingRange { what, value } => {
        write!(f, "{} out of range: {:#x}", what, value)
      }
      Error::LayoutMismatch { table, what } => {
        write!(f, "layout mismatch in {}: expected {}", table, what)
      }
    }
  }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
  fn from(e: io::Error) -> Self {
    Error::Io(e)
  }
}
