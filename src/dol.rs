//! The opened executable image: address mapping, free space, and the patch
//! pipeline over every registered table.

use std::io::{Read, Seek, Write};

use tracing::{debug, info};

use crate::addr::{AddressMapper, AddressSection};
use crate::error::Result;
use crate::free_space::FreeSpaceManager;
use crate::map::MapDescriptor;
use crate::table::{self, Layout, TablePatch};
use crate::vanilla;

/// Per-table findings for diagnostics.
#[derive(Clone, Debug)]
pub struct TableStatus {
  /// The table's name.
  pub name: &'static str,
  /// The layout the probe found.
  pub layout: Layout,
  /// The table's current standard-space address.
  pub table_addr: u32,
  /// The row count, or `-1` where the table does not encode one.
  pub row_count: i16,
}

/// One opened image's patching context.
///
/// Owns the address mapper and the free-space bookkeeping; the image bytes
/// themselves stay with the caller, passed in as a stream per operation.
/// There is deliberately no global instance of any of this.
pub struct Dol {
  mapper: AddressMapper,
  free: FreeSpaceManager,
}

impl Dol {
  /// Creates a context from a caller-supplied section table and registers
  /// the known-safe free ranges.
  pub fn new(sections: Vec<AddressSection>) -> Result<Self> {
    let mapper = AddressMapper::new(sections);
    let mut free = FreeSpaceManager::new();
    vanilla::register_free_space(&mut free, &mapper)?;
    Ok(Dol { mapper, free })
  }

  /// Creates a context with the stock section layout.
  pub fn with_default_sections() -> Result<Self> {
    Self::new(vanilla::SECTIONS.clone())
  }

  /// The image's address mapper.
  pub fn mapper(&self) -> &AddressMapper {
    &self.mapper
  }

  /// The image's free-space bookkeeping.
  pub fn free_space(&self) -> &FreeSpaceManager {
    &self.free
  }

  /// Probes every table and reports what it found.
  pub fn report<S: Read + Write + Seek>(
    &self,
    stream: &mut S,
  ) -> Result<Vec<TableStatus>> {
    let mut statuses = Vec::new();
    for patch in table::patches::<S>() {
      let layout = patch.detect_layout(stream, &self.mapper)?;
      statuses.push(TableStatus {
        name: patch.name(),
        layout,
        table_addr: patch.table_addr(stream, &self.mapper, layout)?,
        row_count: patch.row_count(stream, &self.mapper, layout)?,
      });
    }
    Ok(statuses)
  }

  /// Reads every table into a fresh descriptor list.
  ///
  /// The board count comes from the icon table's bounds check, which both
  /// layouts encode; each table is then read under whatever layout its own
  /// probe reports.
  pub fn read_maps<S: Read + Write + Seek>(
    &self,
    stream: &mut S,
  ) -> Result<Vec<MapDescriptor>> {
    let icon_patch = table::mapicon::MapIconTable;
    let layout = icon_patch.detect_layout(stream, &self.mapper)?;
    let count = icon_patch.row_count(stream, &self.mapper, layout)?;
    let count = if count < 0 { vanilla::BOARD_COUNT } else { count };

    let mut descriptors = vec![MapDescriptor::default(); count as usize];
    for patch in table::patches::<S>() {
      let layout = patch.detect_layout(stream, &self.mapper)?;
      info!(table = patch.name(), %layout, "reading");
      patch.read(stream, &self.mapper, &mut descriptors, layout)?;
    }
    Ok(descriptors)
  }

  /// Applies every table patch to the image.
  ///
  /// All-or-nothing: the first error aborts the run and leaves the stream
  /// partially written, so callers patch a copy and discard it on failure.
  /// Free space is re-derived from scratch first, which makes repeated runs
  /// against the same base image hand out the same addresses.
  pub fn patch<S: Read + Write + Seek>(
    &mut self,
    stream: &mut S,
    descriptors: &[MapDescriptor],
  ) -> Result<()> {
    self.free.reset();
    for patch in table::patches::<S>() {
      info!(table = patch.name(), "patching");
      patch.write(stream, &self.mapper, &mut self.free, descriptors)?;
    }
    for (start, len, purpose) in self.free.occupied_blocks() {
      debug!(purpose, len, addr = format_args!("{:#010x}", start), "in use");
    }
    info!(
      boards = descriptors.len(),
      free = self.free.total_remaining_free_space(),
      "patch complete"
    );
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use std::io::Cursor;

  use super::*;
  use crate::addr::AddressSpace;
  use crate::ppc::{Instruction, Pair16};

  /// Builds an image holding a two-board vanilla layout: original probe
  /// words at every patch site and hand-written vanilla tables.
  fn vanilla_image(mapper: &AddressMapper) -> Cursor<Vec<u8>> {
    let mut img = Cursor::new(vec![0u8; 0x90_0000]);
    let mut put_word = |legacy: u32, word: u32| {
      let at = mapper.legacy_to_file_offset(legacy).unwrap() as usize;
      img.get_mut()[at..at + 4].copy_from_slice(&word.to_be_bytes());
    };
    let pair = |addr: u32, rt: u8| {
      let [lis, addi] = Pair16::of(addr).load_into(rt);
      (lis.encode(), addi.encode())
    };

    // Background lookup: stride multiply and table pair.
    put_word(0x801c_ca80, Instruction::Mulli { rt: 0, ra: 3, imm: 0x38 }.encode());
    let bg_table = mapper.legacy_to_standard(vanilla::BOARD_TABLE).unwrap();
    let (lis, addi) = pair(bg_table, 3);
    put_word(0x801c_ca84, lis);
    put_word(0x801c_ca88, addi);

    // Icon lookup: identity compare and a two-board bounds check.
    put_word(0x8021_e790, Instruction::Cmpw { ra: 28, rb: 30 }.encode());
    put_word(0x8021_1dd4, Instruction::Cmpwi { ra: 31, imm: 2 }.encode());

    // Music: untouched conversion function.
    put_word(0x801c_c8a0, Instruction::Mr { ra: 31, rs: 3 }.encode());

    // Venture cards: padded-stride multiply and table pair.
    put_word(0x8007_e114, Instruction::Mulli { rt: 0, ra: 3, imm: 0x82 }.encode());
    let vc_table =
      mapper.legacy_to_standard(vanilla::VENTURE_CARD_TABLE).unwrap();
    let (lis, addi) = pair(vc_table, 4);
    put_word(0x8007_e118, lis);
    put_word(0x8007_e11c, addi);
    put_word(0x8007_e130, Instruction::Cmpwi { ra: 3, imm: 2 }.encode());

    // Descriptions: wide-stride multiply, table pair, bounds check.
    put_word(0x801f_d9c0, Instruction::Mulli { rt: 0, ra: 3, imm: 0x24 }.encode());
    let desc_table =
      mapper.legacy_to_standard(vanilla::DESCRIPTION_TABLE).unwrap();
    let (lis, addi) = pair(desc_table, 3);
    put_word(0x801f_d9c4, lis);
    put_word(0x801f_d9c8, addi);
    put_word(0x801f_d9d8, Instruction::Cmpwi { ra: 3, imm: 2 }.encode());

    // Vanilla table contents for two boards.
    let mut put_std = |std: u32, bytes: &[u8]| {
      let at =
        mapper.to_file_offset(std, AddressSpace::Standard).unwrap() as usize;
      img.get_mut()[at..at + bytes.len()].copy_from_slice(bytes);
    };
    let str_a = 0x8046_0000u32;
    let str_b = 0x8046_0010u32;
    put_std(str_a, b"bg101\0");
    put_std(str_b, b"bg201\0");
    put_std(bg_table + 0xC, &str_a.to_be_bytes());
    put_std(bg_table + 0x38 + 0xC, &str_b.to_be_bytes());

    put_std(vc_table, &[1u8; 4]);
    put_std(vc_table + 0x82, &[2u8; 4]);

    put_std(desc_table, &10u32.to_be_bytes());
    put_std(desc_table + 4, &11u32.to_be_bytes());
    put_std(desc_table + 8, &0u32.to_be_bytes());
    put_std(desc_table + 0x24, &20u32.to_be_bytes());
    put_std(desc_table + 0x24 + 4, &21u32.to_be_bytes());
    put_std(desc_table + 0x24 + 8, &3u32.to_be_bytes());

    img
  }

  #[test]
  fn vanilla_report() {
    let dol = Dol::with_default_sections().unwrap();
    let mut img = vanilla_image(dol.mapper());
    let statuses = dol.report(&mut img).unwrap();
    assert_eq!(statuses.len(), 5);
    assert!(statuses.iter().all(|s| s.layout == Layout::Vanilla));
    let bg = statuses.iter().find(|s| s.name == "background").unwrap();
    assert_eq!(
      bg.table_addr,
      dol.mapper().legacy_to_standard(vanilla::BOARD_TABLE).unwrap(),
    );
    let music = statuses.iter().find(|s| s.name == "music").unwrap();
    assert_eq!(music.table_addr, 0);
    assert_eq!(music.row_count, -1);
  }

  #[test]
  fn full_pipeline_round_trips() {
    let mut dol = Dol::with_default_sections().unwrap();
    let mut img = vanilla_image(dol.mapper());

    let mut maps = dol.read_maps(&mut img).unwrap();
    assert_eq!(maps.len(), 2);
    assert_eq!(maps[0].background, "bg101");
    assert_eq!(maps[0].map_icon, "p_bg_101");
    assert_eq!(maps[1].name_msg_id, 20);
    assert_eq!(maps[1].unlock_id, 3);
    assert_eq!(maps[0].venture_cards[..4], [1, 1, 1, 1]);
    assert_eq!(maps[1].venture_cards[..4], [2, 2, 2, 2]);

    // Give board 1 a music replacement and patch.
    maps[1].music.push(crate::map::MusicEntry {
      bgm_id: 17,
      sar_index: 204,
      volume: 100,
    });
    dol.patch(&mut img, &maps).unwrap();

    // Everything reads back identically from the patched image.
    let back = dol.read_maps(&mut img).unwrap();
    assert_eq!(back, maps);

    let statuses = dol.report(&mut img).unwrap();
    assert!(statuses.iter().all(|s| s.layout == Layout::Patched));
  }

  #[test]
  fn repatching_is_deterministic() {
    let mut dol = Dol::with_default_sections().unwrap();
    let mut img = vanilla_image(dol.mapper());
    let maps = dol.read_maps(&mut img).unwrap();

    dol.patch(&mut img, &maps).unwrap();
    let first = img.get_ref().clone();
    dol.patch(&mut img, &maps).unwrap();
    assert_eq!(img.get_ref(), &first);
  }
}
