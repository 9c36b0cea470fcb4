//! The board background table.
//!
//! The original table packs the background string pointer into a 0x38-byte
//! row alongside data the patch does not touch; the relocated table is a
//! flat array of string pointers, so the lookup's row stride shrinks from
//! 0x38 to 4 and the in-row displacement drops to zero.

use std::io::{Read, Seek, Write};

use tracing::debug;

use crate::addr::AddressMapper;
use crate::error::Result;
use crate::free_space::FreeSpaceManager;
use crate::map::MapDescriptor;
use crate::ppc::{Instruction, Pair16};
use crate::table::{self, Layout, TablePatch};
use crate::vanilla;

/// The `mulli r0, r3, stride` computing the row offset.
const STRIDE_SITE: u32 = 0x801c_ca80;
/// The `lis r3` / `addi r3` pair materializing the table address.
const PAIR_SITE: u32 = 0x801c_ca84;
/// The `lwz r3, disp(r3)` fetching the background pointer out of the row.
const LOAD_SITE: u32 = 0x801c_ca90;

/// Offset of the background pointer inside a vanilla row.
const VANILLA_ROW_OFFSET: u32 = 0xC;

const VANILLA_STRIDE: Instruction =
  Instruction::Mulli { rt: 0, ra: 3, imm: 0x38 };

/// See the module docs.
pub struct BackgroundTable;

impl<S: Read + Write + Seek> TablePatch<S> for BackgroundTable {
  fn name(&self) -> &'static str {
    "background"
  }

  fn detect_layout(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
  ) -> Result<Layout> {
    table::probe(stream, mapper, STRIDE_SITE, VANILLA_STRIDE)
  }

  fn table_addr(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    _layout: Layout,
  ) -> Result<u32> {
    table::read_site_pair(stream, mapper, PAIR_SITE)
  }

  fn read(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    descriptors: &mut [MapDescriptor],
    layout: Layout,
  ) -> Result<()> {
    let base = self.table_addr(stream, mapper, layout)?;
    for (i, desc) in descriptors.iter_mut().enumerate() {
      let slot = match layout {
        Layout::Vanilla => {
          base + i as u32 * vanilla::BOARD_TABLE_STRIDE + VANILLA_ROW_OFFSET
        }
        Layout::Patched => base + i as u32 * 4,
      };
      let ptr = table::read_std_word(stream, mapper, slot)?;
      desc.background = table::resolve_string(stream, mapper, ptr)?;
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
    let mut pointers = Vec::with_capacity(descriptors.len());
    for desc in descriptors {
      pointers
        .push(table::allocate_string(stream, mapper, free, &desc.background)?);
    }
    let addr =
      table::allocate_words(stream, mapper, free, &pointers, "background table")?;
    debug!(addr = format_args!("{:#010x}", addr), "background table");

    let pair = Pair16::of(addr);
    table::write_site(
      stream,
      mapper,
      STRIDE_SITE,
      &[Instruction::Mulli { rt: 0, ra: 3, imm: 0x04 }],
    )?;
    table::write_site(stream, mapper, PAIR_SITE, &pair.load_into(3))?;
    table::write_site(
      stream,
      mapper,
      LOAD_SITE,
      &[Instruction::Lwz { rt: 3, disp: 0, ra: 3 }],
    )?;
    Ok(())
  }
}
