//! The venture-card table.
//!
//! One row per board, 128 one-byte enable flags per row. The vanilla table
//! pads each row to 0x82 bytes; the relocated table drops the padding, so
//! the row-offset multiply shrinks from 0x82 to 0x80 and the bounds compare
//! picks up the real board count.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::addr::{AddressMapper, AddressSpace};
use crate::error::{Error, Result};
use crate::free_space::FreeSpaceManager;
use crate::map::{MapDescriptor, VENTURE_CARD_COUNT};
use crate::ppc::{Instruction, Pair16};
use crate::table::{self, Layout, TablePatch};

/// The `mulli r0, r3, stride` computing the row offset.
const STRIDE_SITE: u32 = 0x8007_e114;
/// The `lis r4` / `addi r4` pair materializing the table address.
const PAIR_SITE: u32 = 0x8007_e118;
/// The `cmpwi r3, boardCount` bounds check.
const BOUNDS_SITE: u32 = 0x8007_e130;

/// Vanilla row stride: 128 flags plus 2 bytes of padding.
const VANILLA_STRIDE: u32 = 0x82;

const VANILLA_STRIDE_INST: Instruction =
  Instruction::Mulli { rt: 0, ra: 3, imm: VANILLA_STRIDE as i16 };

/// See the module docs.
pub struct VentureCardTable;

impl VentureCardTable {
  fn row_stride(layout: Layout) -> u32 {
    match layout {
      Layout::Vanilla => VANILLA_STRIDE,
      Layout::Patched => VENTURE_CARD_COUNT as u32,
    }
  }
}

impl<S: Read + Write + Seek> TablePatch<S> for VentureCardTable {
  fn name(&self) -> &'static str {
    "venturecard"
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
    table::read_row_count_site(stream, mapper, BOUNDS_SITE, 3, "venturecard")
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
      let offset = mapper.to_file_offset(row, AddressSpace::Standard)?;
      stream.seek(SeekFrom::Start(offset as u64))?;
      let mut flags = vec![0u8; VENTURE_CARD_COUNT];
      stream.read_exact(&mut flags)?;
      desc.venture_cards = flags;
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
    let mut bytes = Vec::with_capacity(descriptors.len() * VENTURE_CARD_COUNT);
    for desc in descriptors {
      if desc.venture_cards.len() != VENTURE_CARD_COUNT {
        return Err(Error::LayoutMismatch {
          table: "venturecard",
          what: "flag count",
        });
      }
      bytes.extend_from_slice(&desc.venture_cards);
    }
    let addr =
      free.allocate(stream, mapper, &bytes, "venture card table", false)?;

    table::write_site(
      stream,
      mapper,
      STRIDE_SITE,
      &[Instruction::Mulli { rt: 0, ra: 3, imm: VENTURE_CARD_COUNT as i16 }],
    )?;
    table::write_site(
      stream,
      mapper,
      PAIR_SITE,
      &Pair16::of(addr).load_into(4),
    )?;
    table::write_site(
      stream,
      mapper,
      BOUNDS_SITE,
      &[Instruction::Cmpwi { ra: 3, imm: descriptors.len() as i16 }],
    )?;
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use std::io::Cursor;

  use super::*;
  use crate::vanilla;

  fn fixture() -> (Cursor<Vec<u8>>, AddressMapper, FreeSpaceManager) {
    let mapper = AddressMapper::new(vanilla::SECTIONS.clone());
    let mut free = FreeSpaceManager::new();
    vanilla::register_free_space(&mut free, &mapper).unwrap();
    (Cursor::new(vec![0u8; 0x90_0000]), mapper, free)
  }

  #[test]
  fn write_then_read_round_trips() {
    let (mut img, mapper, mut free) = fixture();
    let mut descs =
      vec![MapDescriptor::default(), MapDescriptor::default()];
    descs[0].venture_cards[0] = 1;
    descs[0].venture_cards[127] = 1;
    descs[1].venture_cards[64] = 1;

    let patch = VentureCardTable;
    patch.write(&mut img, &mapper, &mut free, &descs).unwrap();
    assert_eq!(
      patch.detect_layout(&mut img, &mapper).unwrap(),
      Layout::Patched,
    );
    assert_eq!(
      patch.row_count(&mut img, &mapper, Layout::Patched).unwrap(),
      2,
    );

    let mut back = vec![MapDescriptor::default(), MapDescriptor::default()];
    patch
      .read(&mut img, &mapper, &mut back, Layout::Patched)
      .unwrap();
    assert_eq!(back[0].venture_cards, descs[0].venture_cards);
    assert_eq!(back[1].venture_cards, descs[1].venture_cards);
  }

  #[test]
  fn vanilla_rows_are_padded() {
    let (mut img, mapper, _) = fixture();
    let base_std =
      mapper.legacy_to_standard(vanilla::VENTURE_CARD_TABLE).unwrap();
    // Row 1 starts 0x82 bytes in; set its first flag.
    let offset = mapper
      .to_file_offset(base_std + VANILLA_STRIDE, AddressSpace::Standard)
      .unwrap() as usize;
    img.get_mut()[offset] = 1;
    table::write_site(&mut img, &mapper, STRIDE_SITE, &[VANILLA_STRIDE_INST])
      .unwrap();
    table::write_site(
      &mut img,
      &mapper,
      PAIR_SITE,
      &Pair16::of(base_std).load_into(4),
    )
    .unwrap();

    let patch = VentureCardTable;
    assert_eq!(
      patch.detect_layout(&mut img, &mapper).unwrap(),
      Layout::Vanilla,
    );
    let mut descs =
      vec![MapDescriptor::default(), MapDescriptor::default()];
    patch
      .read(&mut img, &mapper, &mut descs, Layout::Vanilla)
      .unwrap();
    assert!(descs[0].venture_cards.iter().all(|&c| c == 0));
    assert_eq!(descs[1].venture_cards[0], 1);
  }

  #[test]
  fn short_flag_vector_is_rejected() {
    let (mut img, mapper, mut free) = fixture();
    let descs = vec![MapDescriptor {
      venture_cards: vec![0; 10],
      ..Default::default()
    }];
    match VentureCardTable.write(&mut img, &mapper, &mut free, &descs) {
      Err(Error::LayoutMismatch { table: "venturecard", .. }) => {}
      other => panic!("expected LayoutMismatch, got {:?}", other),
    }
  }
}
