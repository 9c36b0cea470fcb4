//! Address translation between the three coordinate systems of a patched
//! image.
//!
//! Every interesting location exists in up to three spaces at once: the
//! on-disk file offset, the virtual address the executable maps it to at
//! runtime ("standard"), and the virtual address the same bytes had in the
//! earlier revision of the binary that the patch-site constants were
//! documented against ("legacy"). A table of [`AddressSection`]s, supplied
//! by the caller when the image is opened, drives all conversions; the core
//! never discovers sections itself.
//!
//! Conversion of an address that no section covers is a recoverable
//! [`AddressOutOfRange`] condition, never a panic: some addresses genuinely
//! live outside the patched executable.
//!
//! [`AddressSection`]: struct.AddressSection.html
//! [`AddressOutOfRange`]: ../error/enum.Error.html

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::{Error, Result};

/// A virtual-address coordinate system.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AddressSpace {
  /// The runtime layout of the executable being patched.
  Standard,
  /// The layout of the earlier revision the patch-site addresses were
  /// documented against.
  Legacy,
}

impl fmt::Display for AddressSpace {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AddressSpace::Standard => write!(f, "standard"),
      AddressSpace::Legacy => write!(f, "legacy"),
    }
  }
}

/// One mapped region of the executable image.
///
/// Sections must be non-overlapping in each coordinate space; a valid
/// address falls in exactly one section per space.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct AddressSection {
  /// Offset of this section's first byte in the image file.
  pub file_offset: u32,
  /// Length of the section in bytes.
  pub len: u32,
  /// Virtual address of the first byte in the standard layout.
  pub standard_base: u32,
  /// Virtual address of the first byte in the legacy layout.
  pub legacy_base: u32,
}

impl AddressSection {
  fn base(&self, space: AddressSpace) -> u32 {
    match space {
      AddressSpace::Standard => self.standard_base,
      AddressSpace::Legacy => self.legacy_base,
    }
  }

  fn contains(&self, addr: u32, space: AddressSpace) -> bool {
    let base = self.base(space);
    addr >= base && addr - base < self.len
  }
}

/// Translates addresses between the coordinate systems of one opened image.
///
/// Built once per image and passed by reference into every component; there
/// is deliberately no global instance, so several images can be processed in
/// the same process.
#[derive(Clone, Debug)]
pub struct AddressMapper {
  sections: Vec<AddressSection>,
}

impl AddressMapper {
  /// Creates a mapper from the caller-supplied section table.
  pub fn new(sections: Vec<AddressSection>) -> Self {
    AddressMapper { sections }
  }

  fn section_for(
    &self,
    addr: u32,
    space: AddressSpace,
  ) -> Result<&AddressSection> {
    self
      .sections
      .iter()
      .find(|s| s.contains(addr, space))
      .ok_or(Error::AddressOutOfRange { addr, space })
  }

  /// Converts a virtual address in `space` to a file offset.
  pub fn to_file_offset(&self, addr: u32, space: AddressSpace) -> Result<u32> {
    let section = self.section_for(addr, space)?;
    Ok(section.file_offset + (addr - section.base(space)))
  }

  /// Converts a file offset to a virtual address in `space`.
  pub fn from_file_offset(
    &self,
    offset: u32,
    space: AddressSpace,
  ) -> Result<u32> {
    let section = self
      .sections
      .iter()
      .find(|s| offset >= s.file_offset && offset - s.file_offset < s.len)
      .ok_or(Error::AddressOutOfRange { addr: offset, space })?;
    Ok(section.base(space) + (offset - section.file_offset))
  }

  /// Converts a legacy-layout address to its standard-layout equivalent.
  pub fn legacy_to_standard(&self, addr: u32) -> Result<u32> {
    let section = self.section_for(addr, AddressSpace::Legacy)?;
    Ok(section.standard_base + (addr - section.legacy_base))
  }

  /// Converts a standard-layout address to its legacy-layout equivalent.
  pub fn standard_to_legacy(&self, addr: u32) -> Result<u32> {
    let section = self.section_for(addr, AddressSpace::Standard)?;
    Ok(section.legacy_base + (addr - section.standard_base))
  }

  /// Converts a legacy-layout address straight to a file offset.
  ///
  /// Patch-site constants are documented in the legacy layout, so this is
  /// the conversion the table patchers reach for most.
  pub fn legacy_to_file_offset(&self, addr: u32) -> Result<u32> {
    self.to_file_offset(addr, AddressSpace::Legacy)
  }

  /// Returns whether `to_file_offset` would succeed.
  pub fn can_convert_to_file_offset(
    &self,
    addr: u32,
    space: AddressSpace,
  ) -> bool {
    self.section_for(addr, space).is_ok()
  }

  /// Returns whether `from_file_offset` would succeed.
  pub fn can_convert_from_file_offset(&self, offset: u32) -> bool {
    self
      .sections
      .iter()
      .any(|s| offset >= s.file_offset && offset - s.file_offset < s.len)
  }

  /// Returns whether `legacy_to_standard` would succeed.
  pub fn can_convert_legacy_to_standard(&self, addr: u32) -> bool {
    self.section_for(addr, AddressSpace::Legacy).is_ok()
  }

  /// Returns whether `standard_to_legacy` would succeed.
  pub fn can_convert_standard_to_legacy(&self, addr: u32) -> bool {
    self.section_for(addr, AddressSpace::Standard).is_ok()
  }
}
