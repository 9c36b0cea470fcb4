//! Table patchers: the operations that relocate one game table each.
//!
//! Every patcher follows the same shape. It knows the legacy-space addresses
//! of the instructions that reference its table, can tell from a probe word
//! whether the image still has the original layout, can recover the current
//! table address by decoding the `lis`/`addi` pair at a known site, reads
//! rows into [`MapDescriptor`]s, and writes a relocated table into free
//! space before rewriting the referencing instructions.
//!
//! Injected routines are pure `assemble(entry_addr)` functions evaluated
//! twice: once with `entry_addr == 0` to learn the routine's size (external
//! branches become placeholders of identical width), then again at the
//! allocated address to produce the final words.
//!
//! [`MapDescriptor`]: ../map/struct.MapDescriptor.html

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::addr::{AddressMapper, AddressSpace};
use crate::error::{Error, Result};
use crate::free_space::FreeSpaceManager;
use crate::map::MapDescriptor;
use crate::ppc::{self, Instruction};
use crate::stream;

pub mod background;
pub mod description;
pub mod mapicon;
pub mod music;
pub mod venturecard;

/// What a probe found at a patch site.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Layout {
  /// The documented original instruction is still in place.
  Vanilla,
  /// Anything else: the site has been rewritten by a previous run.
  Patched,
}

impl fmt::Display for Layout {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Layout::Vanilla => write!(f, "vanilla"),
      Layout::Patched => write!(f, "patched"),
    }
  }
}

/// One relocatable game table and the instruction sites that reference it.
pub trait TablePatch<S: Read + Write + Seek> {
  /// Short name for diagnostics.
  fn name(&self) -> &'static str;

  /// Probes the image for this table's layout.
  fn detect_layout(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
  ) -> Result<Layout>;

  /// Recovers the table's standard-space address from the image.
  fn table_addr(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    layout: Layout,
  ) -> Result<u32>;

  /// Recovers the table's row count, or `-1` if this table does not encode
  /// one.
  fn row_count(
    &self,
    _stream: &mut S,
    _mapper: &AddressMapper,
    _layout: Layout,
  ) -> Result<i16> {
    Ok(-1)
  }

  /// Reads this table's column of every descriptor out of the image.
  fn read(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    descriptors: &mut [MapDescriptor],
    layout: Layout,
  ) -> Result<()>;

  /// Writes the relocated table and rewrites every instruction site that
  /// references it.
  fn write(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    free: &mut FreeSpaceManager,
    descriptors: &[MapDescriptor],
  ) -> Result<()>;
}

/// Every table patch, in application order.
pub fn patches<S: Read + Write + Seek>() -> Vec<Box<dyn TablePatch<S>>> {
  vec![
    Box::new(background::BackgroundTable),
    Box::new(mapicon::MapIconTable),
    Box::new(music::MusicTable),
    Box::new(venturecard::VentureCardTable),
    Box::new(description::DescriptionTable),
  ]
}

/// Reads the machine word at a legacy-space instruction site.
pub fn read_site_word<S: Read + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  site: u32,
) -> Result<u32> {
  stream.seek(SeekFrom::Start(mapper.legacy_to_file_offset(site)? as u64))?;
  Ok(stream.read_u32::<BigEndian>()?)
}

/// Writes consecutive instructions starting at a legacy-space site.
pub fn write_site<S: Write + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  site: u32,
  insts: &[Instruction],
) -> Result<()> {
  stream.seek(SeekFrom::Start(mapper.legacy_to_file_offset(site)? as u64))?;
  for inst in insts {
    stream.write_u32::<BigEndian>(inst.encode())?;
  }
  Ok(())
}

/// Compares the word at a site against the documented original instruction.
pub fn probe<S: Read + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  site: u32,
  vanilla: Instruction,
) -> Result<Layout> {
  if read_site_word(stream, mapper, site)? == vanilla.encode() {
    Ok(Layout::Vanilla)
  } else {
    Ok(Layout::Patched)
  }
}

/// Recovers the address materialized by the `lis`/`addi` pair at a site.
pub fn read_site_pair<S: Read + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  site: u32,
) -> Result<u32> {
  stream.seek(SeekFrom::Start(mapper.legacy_to_file_offset(site)? as u64))?;
  let lis = stream.read_u32::<BigEndian>()?;
  let addi = stream.read_u32::<BigEndian>()?;
  ppc::join_pair(lis, addi)
}

/// Reads the word at a standard-space data address.
pub fn read_std_word<S: Read + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  addr: u32,
) -> Result<u32> {
  let offset = mapper.to_file_offset(addr, AddressSpace::Standard)?;
  stream.seek(SeekFrom::Start(offset as u64))?;
  Ok(stream.read_u32::<BigEndian>()?)
}

/// Serializes words big-endian.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
  let mut bytes = Vec::with_capacity(words.len() * 4);
  for &word in words {
    bytes.extend_from_slice(&word.to_be_bytes());
  }
  bytes
}

/// Resolves a standard-space address to the NUL-terminated string stored
/// there. A null address resolves to the empty string. The stream position
/// is restored afterwards.
pub fn resolve_string<S: Read + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  addr: u32,
) -> Result<String> {
  if addr == 0 {
    return Ok(String::new());
  }
  let saved = stream.stream_position()?;
  let offset = mapper.to_file_offset(addr, AddressSpace::Standard)?;
  stream.seek(SeekFrom::Start(offset as u64))?;
  let text = stream::read_cstring(stream, 0x100)?;
  stream.seek(SeekFrom::Start(saved))?;
  Ok(text)
}

/// Resolves a pointer-to-pointer: reads the address stored at `addr`, then
/// the string it points at.
pub fn resolve_string_indirect<S: Read + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  addr: u32,
) -> Result<String> {
  if addr == 0 {
    return Ok(String::new());
  }
  let saved = stream.stream_position()?;
  let inner = read_std_word(stream, mapper, addr)?;
  stream.seek(SeekFrom::Start(saved))?;
  resolve_string(stream, mapper, inner)
}

/// Allocates a NUL-terminated string in free space, deduplicating identical
/// strings through the reuse cache.
///
/// The payload is padded to word length: instruction and word-table
/// allocations follow strings in the same blocks and must stay 4-byte
/// aligned.
pub fn allocate_string<S: Write + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  free: &mut FreeSpaceManager,
  text: &str,
) -> Result<u32> {
  let mut bytes = text.as_bytes().to_vec();
  bytes.push(0);
  while bytes.len() % 4 != 0 {
    bytes.push(0);
  }
  free.allocate(stream, mapper, &bytes, "string", true)
}

/// Allocates a word table in free space.
pub fn allocate_words<S: Write + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  free: &mut FreeSpaceManager,
  words: &[u32],
  purpose: &str,
) -> Result<u32> {
  free.allocate(stream, mapper, &words_to_bytes(words), purpose, false)
}

/// Builds a branch from instruction `index` of a routine at `entry` to the
/// absolute address `to`.
///
/// During the measuring pass (`entry == 0`) the routine has no address yet,
/// so the branch is emitted as a placeholder of identical width instead of
/// failing the range check.
pub fn reloc_branch(
  entry: u32,
  index: usize,
  to: u32,
  link: bool,
) -> Result<Instruction> {
  if entry == 0 {
    return Ok(Instruction::B { disp: 0, link });
  }
  let from = entry + index as u32 * 4;
  if link {
    Instruction::bl(from, to)
  } else {
    Instruction::b(from, to)
  }
}

/// Injects a routine: measures it, allocates free space, re-assembles it at
/// the real address, and writes the final words over the reservation.
/// Returns the routine's standard-space entry address.
pub fn inject<S, F>(
  stream: &mut S,
  mapper: &AddressMapper,
  free: &mut FreeSpaceManager,
  purpose: &str,
  assemble: F,
) -> Result<u32>
where
  S: Read + Write + Seek,
  F: Fn(u32) -> Result<Vec<Instruction>>,
{
  let measured = assemble(0)?;
  let entry = free.allocate(
    stream,
    mapper,
    &words_to_bytes(&measured.iter().map(|i| i.encode()).collect::<Vec<_>>()),
    purpose,
    false,
  )?;
  let routine = assemble(entry)?;
  debug_assert_eq!(measured.len(), routine.len());
  let offset = mapper.to_file_offset(entry, AddressSpace::Standard)?;
  stream.seek(SeekFrom::Start(offset as u64))?;
  for inst in &routine {
    stream.write_u32::<BigEndian>(inst.encode())?;
  }
  Ok(entry)
}

/// Fails with [`LayoutMismatch`] unless the word at a site decodes to a
/// `cmpwi` against the given register, and returns its immediate. Used for
/// row-count sites.
///
/// [`LayoutMismatch`]: ../error/enum.Error.html
pub fn read_row_count_site<S: Read + Seek>(
  stream: &mut S,
  mapper: &AddressMapper,
  site: u32,
  ra: u8,
  table: &'static str,
) -> Result<i16> {
  let word = read_site_word(stream, mapper, site)?;
  match Instruction::decode(word) {
    Some(Instruction::Cmpwi { ra: reg, imm }) if reg == ra => Ok(imm),
    _ => Err(Error::LayoutMismatch { table, what: "row-count compare" }),
  }
}
