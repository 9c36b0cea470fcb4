//! The board-select icon tables and the visibility hack around them.
//!
//! Icons are looked up through two levels: an icon table of string pointers
//! (one slot per distinct icon) and a per-board pointer table whose entries
//! point *into* the icon table. The selection screen compares those inner
//! pointers for identity, so distinct boards sharing an icon must share the
//! slot; the strings themselves are deduplicated through the allocator's
//! reuse cache.
//!
//! The rewrite repurposes the mostly-unused difficulty getter to return the
//! icon pointer-pointer for a board, patches its callers to use it, and
//! injects two routines: one that fills the freshly grown icon array with -1
//! sentinels, and one that hides the icon widgets of array slots no board
//! claimed.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, Write};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::addr::AddressMapper;
use crate::error::Result;
use crate::free_space::FreeSpaceManager;
use crate::map::MapDescriptor;
use crate::ppc::{Instruction, Pair16};
use crate::table::{self, Layout, TablePatch};
use crate::vanilla;

/// Call sites of the origin getter, redirected to the difficulty getter.
const BL_DIFFICULTY_SITES: [u32; 3] = [0x8021_e77c, 0x8021_e8a4, 0x8021_e824];
/// The identity compare the probe keys on.
const PROBE_SITE: u32 = 0x8021_e790;
const PROBE_VANILLA: Instruction = Instruction::Cmpw { ra: 28, rb: 30 };
/// The second identity compare.
const CMPW_SITE_2: u32 = 0x8021_e8b8;
/// Icon-count bound checks, `cmplwi rX, 0x12` in the vanilla image.
const ICON_COUNT_SITES: [(u32, u8); 3] =
  [(0x8021_e7c0, 28), (0x8021_e8e8, 29), (0x8021_e84c, 28)];
/// Icon-table address pairs whose `lis` and `addi` are 8 bytes apart.
const SPLIT_PAIR_SITES: [(u32, u8); 3] =
  [(0x8021_e780, 29), (0x8021_e8a8, 30), (0x8021_e828, 30)];
/// Sites whose `mr r3, r28` becomes `mr r3, r26`.
const MR_SITES: [u32; 2] = [0x8021_e94c, 0x8021_e968];

/// Rewrites inside the difficulty getter itself.
const DIFFICULTY_SUBI_SITE: u32 = 0x8021_1dc8;
const ROW_COUNT_SITE: u32 = 0x8021_1dd4;
const DIFFICULTY_LI_SITE: u32 = 0x8021_1e4c;
const DIFFICULTY_STRIDE_SITE_1: u32 = 0x8021_1e58;
/// The pair materializing the per-board pointer table address.
const POINTER_PAIR_SITE: u32 = 0x8021_1e5c;
const DIFFICULTY_STRIDE_SITE_2: u32 = 0x8021_1e64;
const DIFFICULTY_LOAD_SITE: u32 = 0x8021_1e78;

/// Icon-array growth sites: `rlwinm r3, r16, 2` becomes shift 3.
const ARRAY_GROW_SITES: [u32; 2] = [0x8018_7794, 0x8018_7aa4];
/// Hijacks right after the growth sites; the replaced compare moves into
/// the following word.
const ARRAY_INIT_HIJACKS: [u32; 2] = [0x8018_779c, 0x8018_7aac];

/// Hijack inside the icon refresh loop.
const INVISIBLE_HIJACK: u32 = 0x8021_e73c;
const RETURN_CONTINUE: u32 = 0x8021_e740;
const RETURN_MAKE_INVISIBLE: u32 = 0x8021_e808;

/// Board-select UI fixes that only make sense once the board count can
/// exceed the vanilla one.
const NO_WRAP_SITE: u32 = 0x8018_7dfc;
const TOUR_BOUNDS_SITE: u32 = 0x8018_8230;
const MAPS_IN_ZONE_SITES: [u32; 2] = [0x8021_f880, 0x8021_ff4c];

lazy_static! {
  /// Digits of a background id, e.g. the `101` of `bg101`.
  static ref BACKGROUND_DIGITS: Regex = Regex::new(r"\d+").unwrap();
}

/// See the module docs.
pub struct MapIconTable;

impl MapIconTable {
  /// The icon-array init routine. Called where the vanilla code compared
  /// the freshly allocated array pointer against null; it saves the link
  /// register, memsets the array to -1, and leaves the pointer in r24 the
  /// way the displaced instructions did.
  fn assemble_init_array(
    mapper: &AddressMapper,
    entry: u32,
  ) -> Result<Vec<Instruction>> {
    let memset = mapper.legacy_to_standard(vanilla::JUTILITY_MEMSET)?;
    Ok(vec![
      Instruction::Mflr { rt: 24 },
      Instruction::li(4, -1),
      Instruction::Rlwinm { ra: 5, rs: 16, sh: 3, mb: 0, me: 0x1d },
      table::reloc_branch(entry, 3, memset, true)?,
      Instruction::Mtlr { rs: 24 },
      Instruction::Mr { ra: 24, rs: 3 },
      Instruction::Blr,
    ])
  }

  /// The visibility routine. Replaces the icon-type load at the hijack
  /// site: for array slots still holding the -1 sentinel it hides the
  /// widget's overlay objects and leaves through the make-invisible path,
  /// otherwise it re-executes the displaced load and continues.
  fn assemble_make_invisible(
    mapper: &AddressMapper,
    entry: u32,
  ) -> Result<Vec<Instruction>> {
    use crate::ppc::Condition::Ne;
    let set_visible =
      mapper.legacy_to_standard(vanilla::SCENE_LAYOUT_OBJ_SET_VISIBLE)?;
    let ret_continue = mapper.legacy_to_standard(RETURN_CONTINUE)?;
    let ret_invisible = mapper.legacy_to_standard(RETURN_MAKE_INVISIBLE)?;
    Ok(vec![
      Instruction::Lwz { rt: 5, disp: 0x188, ra: 31 },
      Instruction::Cmpwi { ra: 5, imm: -1 },
      Instruction::bc_words(Ne, 8),
      Instruction::Lwz { rt: 3, disp: 0x28, ra: 31 },
      Instruction::li(5, 0),
      Instruction::Lwz { rt: 4, disp: -0x6600, ra: 13 },
      table::reloc_branch(entry, 6, set_visible, true)?,
      Instruction::Lwz { rt: 3, disp: 0x28, ra: 31 },
      Instruction::li(5, 0),
      table::reloc_branch(entry, 9, ret_invisible, false)?,
      Instruction::Lwz { rt: 0, disp: 0x184, ra: 3 },
      table::reloc_branch(entry, 11, ret_continue, false)?,
    ])
  }

  /// Writes the icon table and the per-board pointer table. Returns both
  /// table addresses and the number of distinct icons.
  fn write_tables<S: Read + Write + Seek>(
    stream: &mut S,
    mapper: &AddressMapper,
    free: &mut FreeSpaceManager,
    descriptors: &[MapDescriptor],
  ) -> Result<(u32, u32, u16)> {
    let unique: BTreeSet<&str> = descriptors
      .iter()
      .filter(|d| !d.map_icon.is_empty())
      .map(|d| d.map_icon.as_str())
      .collect();

    let mut string_addrs = BTreeMap::new();
    for icon in &unique {
      string_addrs
        .insert(*icon, table::allocate_string(stream, mapper, free, icon)?);
    }

    let icon_words: Vec<u32> = string_addrs.values().copied().collect();
    // No board names an icon: leave a null table rather than reserving a
    // zero-length block.
    let icon_table = if icon_words.is_empty() {
      0
    } else {
      table::allocate_words(stream, mapper, free, &icon_words, "icon table")?
    };
    let slots: BTreeMap<&str, u32> = string_addrs
      .keys()
      .enumerate()
      .map(|(i, icon)| (*icon, icon_table + i as u32 * 4))
      .collect();

    let pointer_words: Vec<u32> = descriptors
      .iter()
      .map(|d| slots.get(d.map_icon.as_str()).copied().unwrap_or(0))
      .collect();
    let pointer_table = table::allocate_words(
      stream,
      mapper,
      free,
      &pointer_words,
      "icon pointer table",
    )?;
    debug!(
      icons = unique.len(),
      icon_table = format_args!("{:#010x}", icon_table),
      pointer_table = format_args!("{:#010x}", pointer_table),
      "icon tables"
    );
    Ok((icon_table, pointer_table, unique.len() as u16))
  }
}

impl<S: Read + Write + Seek> TablePatch<S> for MapIconTable {
  fn name(&self) -> &'static str {
    "mapicon"
  }

  fn detect_layout(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
  ) -> Result<Layout> {
    table::probe(stream, mapper, PROBE_SITE, PROBE_VANILLA)
  }

  fn table_addr(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    layout: Layout,
  ) -> Result<u32> {
    match layout {
      // The vanilla getter does not materialize the table address in an
      // adjacent lis/addi pair; the stock location is known instead.
      Layout::Vanilla => mapper.legacy_to_standard(vanilla::ICON_POINTER_TABLE),
      Layout::Patched => {
        table::read_site_pair(stream, mapper, POINTER_PAIR_SITE)
      }
    }
  }

  fn row_count(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    _layout: Layout,
  ) -> Result<i16> {
    table::read_row_count_site(stream, mapper, ROW_COUNT_SITE, 31, "mapicon")
  }

  fn read(
    &self,
    stream: &mut S,
    mapper: &AddressMapper,
    descriptors: &mut [MapDescriptor],
    layout: Layout,
  ) -> Result<()> {
    match layout {
      Layout::Vanilla => {
        // The vanilla image maps bgNNN to p_bg_NNN; synthesize the icon
        // names rather than chasing the original tables.
        for desc in descriptors.iter_mut() {
          if let Some(digits) = BACKGROUND_DIGITS.find(&desc.background) {
            desc.map_icon = format!("p_bg_{}", digits.as_str());
          }
        }
      }
      Layout::Patched => {
        let base = self.table_addr(stream, mapper, layout)?;
        for (i, desc) in descriptors.iter_mut().enumerate() {
          let ptr = table::read_std_word(stream, mapper, base + i as u32 * 4)?;
          desc.map_icon = table::resolve_string_indirect(stream, mapper, ptr)?;
        }
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
    let (icon_table, pointer_table, icon_count) =
      Self::write_tables(stream, mapper, free, descriptors)?;
    let row_count = descriptors.len() as i16;

    // Route the icon lookups through the difficulty getter.
    let difficulty = mapper.legacy_to_standard(vanilla::GET_MAP_DIFFICULTY)?;
    for &site in &BL_DIFFICULTY_SITES {
      let from = mapper.legacy_to_standard(site)?;
      table::write_site(
        stream,
        mapper,
        site,
        &[Instruction::bl(from, difficulty)?],
      )?;
    }
    table::write_site(
      stream,
      mapper,
      PROBE_SITE,
      &[Instruction::Cmpw { ra: 29, rb: 30 }],
    )?;
    table::write_site(
      stream,
      mapper,
      CMPW_SITE_2,
      &[Instruction::Cmpw { ra: 30, rb: 28 }],
    )?;
    for &(site, ra) in &ICON_COUNT_SITES {
      table::write_site(
        stream,
        mapper,
        site,
        &[Instruction::Cmplwi { ra, imm: icon_count }],
      )?;
    }
    let icon_pair = Pair16::of(icon_table);
    for &(site, rt) in &SPLIT_PAIR_SITES {
      // An unrelated instruction sits between the halves at these sites.
      table::write_site(
        stream,
        mapper,
        site,
        &[Instruction::Lis { rt, imm: icon_pair.upper }],
      )?;
      table::write_site(
        stream,
        mapper,
        site + 8,
        &[Instruction::Addi { rt, ra: rt, imm: icon_pair.lower }],
      )?;
    }
    for &site in &MR_SITES {
      table::write_site(
        stream,
        mapper,
        site,
        &[Instruction::Mr { ra: 3, rs: 26 }],
      )?;
    }

    // Turn the difficulty getter into the icon pointer-pointer getter.
    table::write_site(stream, mapper, DIFFICULTY_SUBI_SITE, &[Instruction::Nop])?;
    table::write_site(
      stream,
      mapper,
      ROW_COUNT_SITE,
      &[Instruction::Cmpwi { ra: 31, imm: row_count }],
    )?;
    table::write_site(stream, mapper, DIFFICULTY_LI_SITE, &[Instruction::Nop])?;
    table::write_site(
      stream,
      mapper,
      DIFFICULTY_STRIDE_SITE_1,
      &[Instruction::Mulli { rt: 4, ra: 3, imm: 0x04 }],
    )?;
    table::write_site(
      stream,
      mapper,
      POINTER_PAIR_SITE,
      &Pair16::of(pointer_table).load_into(3),
    )?;
    table::write_site(
      stream,
      mapper,
      DIFFICULTY_STRIDE_SITE_2,
      &[Instruction::Mulli { rt: 0, ra: 31, imm: 0x04 }],
    )?;
    table::write_site(
      stream,
      mapper,
      DIFFICULTY_LOAD_SITE,
      &[Instruction::Lwz { rt: 3, disp: 0, ra: 3 }],
    )?;

    // Grow the icon array and initialize it with -1 sentinels.
    let init = table::inject(stream, mapper, free, "icon array init", |e| {
      Self::assemble_init_array(mapper, e)
    })?;
    for (&grow, &hijack) in ARRAY_GROW_SITES.iter().zip(&ARRAY_INIT_HIJACKS) {
      table::write_site(
        stream,
        mapper,
        grow,
        &[Instruction::Rlwinm { ra: 3, rs: 16, sh: 3, mb: 0, me: 0x1d }],
      )?;
      let from = mapper.legacy_to_standard(hijack)?;
      table::write_site(
        stream,
        mapper,
        hijack,
        &[Instruction::bl(from, init)?, Instruction::Cmpwi { ra: 3, imm: 0 }],
      )?;
    }

    // Hide icons no board claimed.
    let invisible =
      table::inject(stream, mapper, free, "icon visibility", |e| {
        Self::assemble_make_invisible(mapper, e)
      })?;
    let from = mapper.legacy_to_standard(INVISIBLE_HIJACK)?;
    table::write_site(
      stream,
      mapper,
      INVISIBLE_HIJACK,
      &[Instruction::b(from, invisible)?],
    )?;

    // Board-select UI bounds fixes.
    table::write_site(
      stream,
      mapper,
      NO_WRAP_SITE,
      &[Instruction::b_words(8)],
    )?;
    table::write_site(stream, mapper, TOUR_BOUNDS_SITE, &[Instruction::Nop])?;
    for &site in &MAPS_IN_ZONE_SITES {
      table::write_site(stream, mapper, site, &[Instruction::li(3, 6)])?;
    }
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

  fn descriptors(icons: &[&str]) -> Vec<MapDescriptor> {
    icons
      .iter()
      .map(|icon| MapDescriptor {
        map_icon: icon.to_string(),
        ..Default::default()
      })
      .collect()
  }

  #[test]
  fn routines_measure_correctly() {
    let (_, mapper, _) = fixture();
    assert_eq!(
      MapIconTable::assemble_init_array(&mapper, 0).unwrap().len(),
      MapIconTable::assemble_init_array(&mapper, 0x8041_0508)
        .unwrap()
        .len(),
    );
    assert_eq!(
      MapIconTable::assemble_make_invisible(&mapper, 0).unwrap().len(),
      MapIconTable::assemble_make_invisible(&mapper, 0x8041_0508)
        .unwrap()
        .len(),
    );
  }

  #[test]
  fn init_array_scales_the_count_like_the_grow_sites() {
    let (_, mapper, _) = fixture();
    let asm = MapIconTable::assemble_init_array(&mapper, 0x8041_0508).unwrap();
    // The memset length uses the exact shift encoding the grow sites get.
    assert!(asm.contains(&Instruction::Rlwinm {
      ra: 5,
      rs: 16,
      sh: 3,
      mb: 0,
      me: 0x1d,
    }));
  }

  #[test]
  fn write_then_read_round_trips() {
    let (mut img, mapper, mut free) = fixture();
    let descs = descriptors(&["p_bg_101", "p_bg_201", "p_bg_101", ""]);

    let patch = MapIconTable;
    patch.write(&mut img, &mapper, &mut free, &descs).unwrap();
    assert_eq!(
      patch.detect_layout(&mut img, &mapper).unwrap(),
      Layout::Patched,
    );
    assert_eq!(
      patch.row_count(&mut img, &mapper, Layout::Patched).unwrap(),
      4,
    );

    let mut back = descriptors(&["", "", "", ""]);
    patch
      .read(&mut img, &mapper, &mut back, Layout::Patched)
      .unwrap();
    assert_eq!(back[0].map_icon, "p_bg_101");
    assert_eq!(back[1].map_icon, "p_bg_201");
    assert_eq!(back[2].map_icon, "p_bg_101");
    assert_eq!(back[3].map_icon, "");

    // Boards sharing an icon share the icon-table slot.
    let base = patch
      .table_addr(&mut img, &mapper, Layout::Patched)
      .unwrap();
    let slot_0 = table::read_std_word(&mut img, &mapper, base).unwrap();
    let slot_2 = table::read_std_word(&mut img, &mapper, base + 8).unwrap();
    assert_eq!(slot_0, slot_2);
  }

  #[test]
  fn blank_icons_write_a_null_table() {
    let (mut img, mapper, mut free) = fixture();
    let descs = descriptors(&["", ""]);

    let patch = MapIconTable;
    patch.write(&mut img, &mapper, &mut free, &descs).unwrap();

    let mut back = descriptors(&["stale", "stale"]);
    patch
      .read(&mut img, &mapper, &mut back, Layout::Patched)
      .unwrap();
    assert_eq!(back[0].map_icon, "");
    assert_eq!(back[1].map_icon, "");
  }

  #[test]
  fn vanilla_table_addr_is_the_stock_table() {
    // No pair is written anywhere; the vanilla answer is fixed knowledge.
    let (mut img, mapper, _) = fixture();
    assert_eq!(
      MapIconTable
        .table_addr(&mut img, &mapper, Layout::Vanilla)
        .unwrap(),
      mapper.legacy_to_standard(vanilla::ICON_POINTER_TABLE).unwrap(),
    );
  }

  #[test]
  fn vanilla_read_synthesizes_icon_names() {
    let (mut img, mapper, _) = fixture();
    let mut descs = descriptors(&["", ""]);
    descs[0].background = "bg101".into();
    descs[1].background = "bg901".into();

    MapIconTable
      .read(&mut img, &mapper, &mut descs, Layout::Vanilla)
      .unwrap();
    assert_eq!(descs[0].map_icon, "p_bg_101");
    assert_eq!(descs[1].map_icon, "p_bg_901");
  }

  #[test]
  fn hijack_branches_into_the_injected_routine() {
    let (mut img, mapper, mut free) = fixture();
    let descs = descriptors(&["p_bg_101"]);
    MapIconTable.write(&mut img, &mapper, &mut free, &descs).unwrap();

    let word =
      table::read_site_word(&mut img, &mapper, INVISIBLE_HIJACK).unwrap();
    let inst = Instruction::decode(word).unwrap();
    let from = mapper.legacy_to_standard(INVISIBLE_HIJACK).unwrap();
    let entry = inst.branch_target(from).unwrap();
    // The routine starts with the sentinel load it was specified with.
    let first = table::read_std_word(&mut img, &mapper, entry).unwrap();
    assert_eq!(
      Instruction::decode(first),
      Some(Instruction::Lwz { rt: 5, disp: 0x188, ra: 31 }),
    );
  }
}
