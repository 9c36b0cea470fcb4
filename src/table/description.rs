//! The board description table: name / description message ids and the
//! unlock id.
//!
//! The vanilla table interleaves these three words with UI state in a
//! 0x24-byte row; the relocated table keeps just the three words, so the
//! row-offset multiply shrinks from 0x24 to 0x0C.

use std::io::{Read, Seek, Write};

use crate::addr::AddressMapper;
use crate::error::Result;
use crate::free_space::FreeSpaceManager;
use crate::map::MapDescriptor;
use crate::ppc::{Instruction, Pair16};
use crate::table::{self, Layout, TablePatch};
use crate::vanilla;

/// The `mulli r0, r3, stride` computing the row offset.
const STRIDE_SITE: u32 = 0x801f_d9c0;
/// The `lis r3` / `addi r3` pair materializing the table address.
const PAIR_SITE: u32 = 0x801f_d9c4;
/// The `cmpwi r3, boardCount` bounds check.
const BOUNDS_SITE: u32 = 0x801f_d9d8;

/// Relocated row: name msg id, description msg id, unlock id.
const ROW_WORDS: u32 = 3;

const VANILLA_STRIDE_INST: Instruction = Instruction::Mulli {
  rt: 0,
  ra: 3,
  imm: vanilla::DESCRIPTION_TABLE_STRIDE as i16,
};

/// See the module docs.
pub struct DescriptionTable;

impl DescriptionTable {
  fn row_stride(layout: Layout) -> u32 {
    match layout {
      Layout::Vanilla => vanilla::DESCRIPTION_TABLE_STRIDE,
      Layout::Patched => ROW_WORDS * 4,
    }
  }
}

impl<S: Read + Write + Seek> TablePatch<S> for DescriptionTable {
  fn name(&self) -> &'static str {
    "description"
  }

  fn detect_layout(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
  ) -> Result<Layout> {
    table::probe(stream, mapper, STRIDE_SITE, VANILLA_STRIDE_INST)
  }

  fn table_addr(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    _layout: Layout,
  ) -> Result<u32> {
    table::read_site_pair(stream, mapper, PAIR_SITE)
  }

  fn row_count(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    _layout: Layout,
  ) -> Result<i16> {
    table::read_row_count_site(stream, mapper, BOUNDS_SITE, 3, "description")
  }

  fn read(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    descriptors: &mut [MapDescriptor],
    layout: Layout,
  ) -> Result<()> {
    let base = self.table_addr(stream, mapper, layout)?;
    let stride = Self::row_stride(layout);
    for (i, desc) in descriptors.iter_mut().enumerate() {
      let row = base + i as u32 * stride;
      desc.name_msg_id = table::read_std_word(stream, mapper, row)?;
      desc.desc_msg_id = table::read_std_word(stream, mapper, row + 4)?;
      desc.unlock_id = table::read_std_word(stream, mapper, row + 8)?;
    }
    Ok(())
  }

  fn write(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    free: &mut FreeSpaceManager,
    descriptors: &[MapDescriptor],
  ) -> Result<()> {
    let mut words = Vec::with_capacity(descriptors.len() * ROW_WORDS as usize);
    for desc in descriptors {
      words.push(desc.name_msg_id);
      words.push(desc.desc_msg_id);
      words.push(desc.unlock_id);
    }
    let addr =
      table::allocate_words(stream, mapper, free, &words, "description table")?;

    table::write_site(
      stream,
      mapper,
      STRIDE_SITE,
      &[Instruction::Mulli { rt: 0, ra: 3, imm: (ROW_WORDS * 4) as i16 }],
    )?;
    table::write_site(stream, mapper, PAIR_SITE, &Pair16::of(addr).load_into(3))?;
    table::write_site(
      stream,
      mapper,
      BOUNDS_SITE,
      &[Instruction::Cmpwi { ra: 3, imm: descriptors.len() as i16 }],
    )?;
    Ok(())
  }
}
