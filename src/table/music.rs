//! Per-board music replacement.
//!
//! Unlike the other tables there is no vanilla table to relocate: the
//! vanilla image has no notion of per-board music. The patch injects a
//! routine at the head of the BGM-id conversion function that, while a game
//! is running, looks the current board up in a pointer table and walks its
//! replacement list; on a hit it substitutes the replacement stream index
//! and leaves through the function's success path.
//!
//! The replacement list for a board is `[count, (bgm_id, sar_index)...]`;
//! boards with no replacements get a null pointer instead of an empty list.

use std::io::{Read, Seek, Write};

use tracing::debug;

use crate::addr::AddressMapper;
use crate::error::Result;
use crate::free_space::FreeSpaceManager;
use crate::map::{MapDescriptor, MusicEntry};
use crate::ppc::{self, Condition::Ne, Instruction, Pair16};
use crate::table::{self, Layout, TablePatch};
use crate::vanilla;

/// First instruction of the BGM-id conversion function; `mr r31, r3` in the
/// vanilla image, a `b` into the injected routine afterwards.
const HIJACK_SITE: u32 = 0x801c_c8a0;
const PROBE_VANILLA: Instruction = Instruction::Mr { ra: 31, rs: 3 };
/// Where the routine returns for an unreplaced id.
const RETURN_CONTINUE: u32 = 0x801c_c8a4;
/// Where it returns after substituting a replacement.
const RETURN_REPLACED: u32 = 0x801c_c93c;

/// Word index of the `lis` half of the pointer-table address pair inside
/// the injected routine. This is how the table address is recovered when
/// reading a patched image back.
const TABLE_PAIR_INDEX: u32 = 13;

/// See the module docs.
pub struct MusicTable;

impl MusicTable {
  /// The BGM-id interception routine.
  ///
  /// Register use mirrors the function it extends: r3 carries the id in and
  /// out, r31 holds the id the displaced `mr` would have saved, r5/r6 are
  /// scratch. Both exits re-execute the `cmplwi r3, 0xffff` the hijacked
  /// word displaced.
  fn assemble_replace_bgm(
    mapper: &AddressMapper,
    table_addr: u32,
    entry: u32,
  ) -> Result<Vec<Instruction>> {
    let manager = Pair16::of(mapper.legacy_to_standard(vanilla::GAME_MANAGER)?);
    let map_id = Pair16::of(mapper.legacy_to_standard(vanilla::GLOBAL_MAP_ID)?);
    let table = Pair16::of(table_addr);
    let ret_continue = mapper.legacy_to_standard(RETURN_CONTINUE)?;
    let ret_replaced = mapper.legacy_to_standard(RETURN_REPLACED)?;

    let mut asm = Vec::with_capacity(38);
    asm.push(Instruction::Mr { ra: 31, rs: 3 });
    // Bail out unless a game is running.
    asm.extend(manager.load_into(3));
    asm.push(Instruction::Lwz { rt: 5, disp: 0, ra: 3 });
    asm.push(Instruction::Cmpwi { ra: 5, imm: 0 });
    asm.push(Instruction::bc_words(Ne, 4));
    asm.push(Instruction::Mr { ra: 3, rs: 31 });
    asm.push(Instruction::Cmplwi { ra: 3, imm: 0xffff });
    asm.push(table::reloc_branch(entry, asm.len(), ret_continue, false)?);
    // Fetch this board's replacement list.
    asm.extend(map_id.load_into(3));
    asm.push(Instruction::Lwz { rt: 5, disp: 0, ra: 3 });
    // Pointer-table slots are one word wide.
    asm.push(Instruction::Rlwinm { ra: 5, rs: 5, sh: 2, mb: 0, me: 29 });
    debug_assert_eq!(asm.len() as u32, TABLE_PAIR_INDEX);
    asm.extend(table.load_into(3));
    asm.push(Instruction::Lwzx { rt: 5, ra: 5, rb: 3 });
    asm.push(Instruction::Cmpwi { ra: 5, imm: 0 });
    asm.push(Instruction::bc_words(Ne, 4));
    asm.push(Instruction::Mr { ra: 3, rs: 31 });
    asm.push(Instruction::Cmplwi { ra: 3, imm: 0xffff });
    asm.push(table::reloc_branch(entry, asm.len(), ret_continue, false)?);
    // Walk the list.
    asm.push(Instruction::Lwz { rt: 6, disp: 0, ra: 5 });
    asm.push(Instruction::Addi { rt: 5, ra: 5, imm: 4 });
    let loop_head = asm.len() as i32;
    asm.push(Instruction::Lwz { rt: 3, disp: 0, ra: 5 });
    asm.push(Instruction::Cmpw { ra: 3, rb: 31 });
    asm.push(Instruction::bc_words(Ne, 6));
    asm.push(Instruction::Addi { rt: 5, ra: 5, imm: 4 });
    asm.push(Instruction::Lwz { rt: 31, disp: 0, ra: 5 });
    asm.push(Instruction::Mr { ra: 3, rs: 31 });
    asm.push(Instruction::Cmplwi { ra: 3, imm: 0xffff });
    asm.push(table::reloc_branch(entry, asm.len(), ret_replaced, false)?);
    asm.push(Instruction::Addi { rt: 5, ra: 5, imm: 8 });
    asm.push(Instruction::Addi { rt: 6, ra: 6, imm: -1 });
    asm.push(Instruction::Cmpwi { ra: 6, imm: 0 });
    asm.push(Instruction::bc_words(Ne, loop_head - asm.len() as i32));
    asm.push(Instruction::Mr { ra: 3, rs: 31 });
    asm.push(Instruction::Cmplwi { ra: 3, imm: 0xffff });
    asm.push(table::reloc_branch(entry, asm.len(), ret_continue, false)?);
    Ok(asm)
  }

  /// Writes the per-board replacement lists and the pointer table.
  fn write_tables<S: Read + Write + Seek>(
    stream: &mut S,
    mapper: &AddressMapper,
    free: &mut FreeSpaceManager,
    descriptors: &[MapDescriptor],
  ) -> Result<u32> {
    let mut pointers = Vec::with_capacity(descriptors.len());
    for desc in descriptors {
      let entries = desc.sorted_music();
      if entries.is_empty() {
        pointers.push(0);
        continue;
      }
      let mut words = vec![entries.len() as u32];
      for entry in &entries {
        words.push(entry.bgm_id);
        words.push(entry.sar_index);
      }
      pointers.push(table::allocate_words(
        stream,
        mapper,
        free,
        &words,
        "music replacement list",
      )?);
    }
    table::allocate_words(stream, mapper, free, &pointers, "music pointer table")
  }

  /// Locates the injected routine by decoding the hijack branch.
  fn routine_entry<S: Read + Seek>(
    stream: &mut S,
    mapper: &AddressMapper,
  ) -> Result<Option<u32>> {
    let word = table::read_site_word(stream, mapper, HIJACK_SITE)?;
    let from = mapper.legacy_to_standard(HIJACK_SITE)?;
    match Instruction::decode(word) {
      Some(inst @ Instruction::B { link: false, .. }) => {
        Ok(inst.branch_target(from))
      }
      _ => Ok(None),
    }
  }
}

impl<S: Read + Write + Seek> TablePatch<S> for MusicTable {
  fn name(&self) -> &'static str {
    "music"
  }

  fn detect_layout(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
  ) -> Result<Layout> {
    table::probe(stream, mapper, HIJACK_SITE, PROBE_VANILLA)
  }

  fn table_addr(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    layout: Layout,
  ) -> Result<u32> {
    if layout == Layout::Vanilla {
      return Ok(0);
    }
    match Self::routine_entry(stream, mapper)? {
      Some(entry) => {
        let lis =
          table::read_std_word(stream, mapper, entry + TABLE_PAIR_INDEX * 4)?;
        let addi = table::read_std_word(
          stream,
          mapper,
          entry + (TABLE_PAIR_INDEX + 1) * 4,
        )?;
        ppc::join_pair(lis, addi)
      }
      None => Ok(0),
    }
  }

  fn read(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    descriptors: &mut [MapDescriptor],
    layout: Layout,
  ) -> Result<()> {
    if layout == Layout::Vanilla {
      return Ok(());
    }
    let base = self.table_addr(stream, mapper, layout)?;
    if base == 0 {
      return Ok(());
    }
    for (i, desc) in descriptors.iter_mut().enumerate() {
      desc.music.clear();
      let list = table::read_std_word(stream, mapper, base + i as u32 * 4)?;
      if list == 0 {
        continue;
      }
      let count = table::read_std_word(stream, mapper, list)?;
      for j in 0..count {
        let bgm_id = table::read_std_word(stream, mapper, list + 4 + j * 8)?;
        let sar_index =
          table::read_std_word(stream, mapper, list + 8 + j * 8)?;
        desc.music.push(MusicEntry { bgm_id, sar_index, volume: 100 });
      }
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
    let table_addr = Self::write_tables(stream, mapper, free, descriptors)?;
    let routine = table::inject(stream, mapper, free, "bgm replacement", |e| {
      Self::assemble_replace_bgm(mapper, table_addr, e)
    })?;
    debug!(
      table = format_args!("{:#010x}", table_addr),
      routine = format_args!("{:#010x}", routine),
      "music replacement"
    );
    let from = mapper.legacy_to_standard(HIJACK_SITE)?;
    table::write_site(
      stream,
      mapper,
      HIJACK_SITE,
      &[Instruction::b(from, routine)?],
    )?;
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use std::io::Cursor;

  use super::*;

  fn fixture() -> (Cursor<Vec<u8>>, AddressMapper, FreeSpaceManager) {
    let mapper = AddressMapper::new(vanilla::SECTIONS.clone());
    let mut free = FreeSpaceManager::new();
    vanilla::register_free_space(&mut free, &mapper).unwrap();
    (Cursor::new(vec![0u8; 0x90_0000]), mapper, free)
  }

  #[test]
  fn routine_measures_correctly() {
    let (_, mapper, _) = fixture();
    let measured =
      MusicTable::assemble_replace_bgm(&mapper, 0x8041_1000, 0).unwrap();
    let real = MusicTable::assemble_replace_bgm(&mapper, 0x8041_1000, 0x8041_0508)
      .unwrap();
    assert_eq!(measured.len(), real.len());
  }

  #[test]
  fn table_pair_sits_at_the_documented_index() {
    let (_, mapper, _) = fixture();
    let table_addr = 0x8041_2340;
    let asm =
      MusicTable::assemble_replace_bgm(&mapper, table_addr, 0x8041_0508)
        .unwrap();
    let lis = asm[TABLE_PAIR_INDEX as usize].encode();
    let addi = asm[TABLE_PAIR_INDEX as usize + 1].encode();
    assert_eq!(ppc::join_pair(lis, addi).unwrap(), table_addr);
  }

  #[test]
  fn loop_branch_goes_backward() {
    let (_, mapper, _) = fixture();
    let asm = MusicTable::assemble_replace_bgm(&mapper, 0x8041_2340, 0x8041_0508)
      .unwrap();
    let backward = asm.iter().any(|inst| {
      matches!(inst, Instruction::Bc { cond: Ne, disp } if *disp < 0)
    });
    assert!(backward, "the list walk must loop");
  }

  #[test]
  fn write_then_read_round_trips() {
    let (mut img, mapper, mut free) = fixture();
    let mut descs =
      vec![MapDescriptor::default(), MapDescriptor::default()];
    descs[1].music.push(MusicEntry { bgm_id: 40, sar_index: 300, volume: 100 });
    descs[1].music.push(MusicEntry { bgm_id: 17, sar_index: 204, volume: 100 });

    table::write_site(&mut img, &mapper, HIJACK_SITE, &[PROBE_VANILLA])
      .unwrap();
    let patch = MusicTable;
    assert_eq!(
      patch.detect_layout(&mut img, &mapper).unwrap(),
      Layout::Vanilla,
    );
    patch.write(&mut img, &mapper, &mut free, &descs).unwrap();
    assert_eq!(
      patch.detect_layout(&mut img, &mapper).unwrap(),
      Layout::Patched,
    );

    let mut back = vec![MapDescriptor::default(), MapDescriptor::default()];
    patch
      .read(&mut img, &mapper, &mut back, Layout::Patched)
      .unwrap();
    assert!(back[0].music.is_empty());
    // Lists come back in BGM-id order.
    assert_eq!(
      back[1].music,
      vec![
        MusicEntry { bgm_id: 17, sar_index: 204, volume: 100 },
        MusicEntry { bgm_id: 40, sar_index: 300, volume: 100 },
      ],
    );
  }

  #[test]
  fn vanilla_table_addr_is_null() {
    let (mut img, mapper, _) = fixture();
    table::write_site(&mut img, &mapper, HIJACK_SITE, &[PROBE_VANILLA])
      .unwrap();
    let patch = MusicTable;
    assert_eq!(
      patch.table_addr(&mut img, &mapper, Layout::Vanilla).unwrap(),
      0,
    );
  }
}
