//! Tracking and allocation of reusable byte ranges inside the image.
//!
//! The unmodified executable contains stretches of bytes that are safe to
//! repurpose (padding, dead strings, tables made obsolete by the patch).
//! [`FreeSpaceManager`] owns those ranges and serves allocation requests for
//! injected tables and routines. Addresses are standard-space virtual
//! addresses; the manager writes payload bytes through the image stream at
//! the mapped file offset as part of each allocation.
//!
//! The selection policy is first-fit in ascending address order. Best-fit
//! would fragment less, but the chosen policy is deterministic and every
//! downstream patch embeds whatever address comes out, so it stays.
//!
//! [`FreeSpaceManager`]: struct.FreeSpaceManager.html

use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};

use tracing::debug;

use crate::addr::{AddressMapper, AddressSpace};
use crate::error::{Error, Result};

/// A registered byte range, in standard-space virtual addresses.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct Range {
  start: u32,
  len: u32,
}

/// One block of the current partition of the registered ranges.
///
/// Blocks only ever split; the sum of their lengths equals the total
/// registered capacity at all times.
#[derive(Clone, Debug)]
struct Block {
  start: u32,
  len: u32,
  occupied: bool,
  /// What the occupying allocation is for. Diagnostics only.
  purpose: Option<String>,
}

/// The pool of reusable byte ranges inside one opened image.
#[derive(Debug, Default)]
pub struct FreeSpaceManager {
  /// Ranges as originally registered. Never shrinks; `reset` rebuilds the
  /// partition from this.
  registered: Vec<Range>,
  /// Current partition, sorted by start address.
  blocks: Vec<Block>,
  /// Content-addressed cache for `reuse` allocations.
  cache: HashMap<(Vec<u8>, String), u32>,
}

impl FreeSpaceManager {
  /// Creates an empty manager.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `len` bytes starting at `start` as free.
  ///
  /// The caller guarantees the range does not overlap any registered range;
  /// a violation is a bug in the caller, not a runtime condition.
  pub fn add_free_space(&mut self, start: u32, len: u32) {
    debug_assert!(len > 0);
    debug_assert!(
      self
        .registered
        .iter()
        .all(|r| start + len <= r.start || r.start + r.len <= start),
      "overlapping free-space registration at {:#010x}",
      start,
    );
    self.registered.push(Range { start, len });
    let pos = self
      .blocks
      .iter()
      .position(|b| b.start > start)
      .unwrap_or(self.blocks.len());
    self.blocks.insert(
      pos,
      Block { start, len, occupied: false, purpose: None },
    );
  }

  /// Allocates space for `bytes`, writes them into the image, and returns
  /// the standard-space address they now live at.
  ///
  /// With `reuse` set, a previous allocation with the same purpose and
  /// identical content is returned as-is, with no new reservation. Fails
  /// with [`OutOfSpace`] when no free block fits.
  ///
  /// [`OutOfSpace`]: ../error/enum.Error.html
  pub fn allocate<S: Write + Seek>(
    &mut self,
    stream: &mut S,
    mapper: &AddressMapper,
    bytes: &[u8],
    purpose: &str,
    reuse: bool,
  ) -> Result<u32> {
    let len = bytes.len() as u32;
    debug_assert!(len > 0);

    if reuse {
      let key = (bytes.to_vec(), purpose.to_string());
      if let Some(&addr) = self.cache.get(&key) {
        debug!(purpose, addr = format_args!("{:#010x}", addr), "reuse hit");
        return Ok(addr);
      }
    }

    let index = self
      .blocks
      .iter()
      .position(|b| !b.occupied && b.len >= len)
      .ok_or_else(|| Error::OutOfSpace {
        requested: len,
        largest: self.largest_remaining_block(),
      })?;

    let start = self.blocks[index].start;
    let remainder = self.blocks[index].len - len;
    self.blocks[index].len = len;
    self.blocks[index].occupied = true;
    self.blocks[index].purpose = Some(purpose.to_string());
    if remainder > 0 {
      self.blocks.insert(
        index + 1,
        Block {
          start: start + len,
          len: remainder,
          occupied: false,
          purpose: None,
        },
      );
    }

    let offset = mapper.to_file_offset(start, AddressSpace::Standard)?;
    stream.seek(SeekFrom::Start(offset as u64))?;
    stream.write_all(bytes)?;

    self
      .cache
      .insert((bytes.to_vec(), purpose.to_string()), start);
    debug!(
      purpose,
      len,
      addr = format_args!("{:#010x}", start),
      "allocated"
    );
    Ok(start)
  }

  /// Total capacity: the sum of all registered range lengths. Independent
  /// of current occupancy.
  pub fn total_free_space(&self) -> u32 {
    self.registered.iter().map(|r| r.len).sum()
  }

  /// The sum of lengths of currently unoccupied blocks.
  pub fn total_remaining_free_space(&self) -> u32 {
    self
      .blocks
      .iter()
      .filter(|b| !b.occupied)
      .map(|b| b.len)
      .sum()
  }

  /// The largest single registered range.
  pub fn largest_block(&self) -> u32 {
    self.registered.iter().map(|r| r.len).max().unwrap_or(0)
  }

  /// The largest currently unoccupied block.
  pub fn largest_remaining_block(&self) -> u32 {
    self
      .blocks
      .iter()
      .filter(|b| !b.occupied)
      .map(|b| b.len)
      .max()
      .unwrap_or(0)
  }

  /// The occupied blocks, as `(start, len, purpose)`, in address order.
  pub fn occupied_blocks(&self) -> impl Iterator<Item = (u32, u32, &str)> {
    self
      .blocks
      .iter()
      .filter(|b| b.occupied)
      .map(|b| (b.start, b.len, b.purpose.as_deref().unwrap_or("")))
  }

  /// Undoes every allocation and clears the reuse cache, without forgetting
  /// which ranges were registered.
  ///
  /// Run before re-deriving a full patch set, so repeated runs against the
  /// same base image hand out the same addresses.
  pub fn reset(&mut self) {
    self.blocks = self
      .registered
      .iter()
      .map(|r| Block {
        start: r.start,
        len: r.len,
        occupied: false,
        purpose: None,
      })
      .collect();
    self.blocks.sort_by_key(|b| b.start);
    self.cache.clear();
  }
}
