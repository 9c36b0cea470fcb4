//! What we know about the unmodified executable.
//!
//! Every constant in here is a legacy-space address or layout fact observed
//! in the unpatched image: where the vanilla tables live, which instruction
//! words sit at the patch sites, which helper routines the injected code
//! calls, and which byte ranges are safe to repurpose. The rest of the crate
//! treats this module as ground truth and never hardcodes an address
//! anywhere else.

use lazy_static::lazy_static;

use crate::addr::AddressSection;
use crate::free_space::FreeSpaceManager;

/// Boards in the unmodified executable.
pub const BOARD_COUNT: i16 = 18;

/// The board data table: one 0x38-byte row per board; the background
/// string pointer sits at offset 0xC of each row.
pub const BOARD_TABLE: u32 = 0x8042_8e50;
/// Row stride of the board data table.
pub const BOARD_TABLE_STRIDE: u32 = 0x38;

/// The icon string-pointer table.
pub const ICON_TABLE: u32 = 0x8047_f5c0;
/// The per-board icon pointer table: one 0x24-byte row per board; the icon
/// pointer-pointer is at offset 0x1c.
pub const ICON_POINTER_TABLE: u32 = 0x8043_63c8;

/// The per-board description table: one 0x24-byte row per board holding the
/// name message id, description message id and unlock id as its first three
/// words.
pub const DESCRIPTION_TABLE: u32 = 0x8043_6bc0;
/// Row stride of the description table.
pub const DESCRIPTION_TABLE_STRIDE: u32 = 0x24;

/// The venture-card table: one 128-byte row of card-enable flags per board.
pub const VENTURE_CARD_TABLE: u32 = 0x8041_0648;

/// `memset`-alike the icon-array init routine calls.
pub const JUTILITY_MEMSET: u32 = 0x8000_4714;
/// Layout-object visibility setter.
pub const SCENE_LAYOUT_OBJ_SET_VISIBLE: u32 = 0x8006_f854;
/// Pointer to the live game manager; null outside a game.
pub const GAME_MANAGER: u32 = 0x8081_794c;
/// Id of the board currently being played.
pub const GLOBAL_MAP_ID: u32 = 0x8055_2408;
/// The mostly-unused difficulty getter the icon hack repurposes.
pub const GET_MAP_DIFFICULTY: u32 = 0x8021_1da4;

/// Byte ranges of the unmodified image that are safe to overwrite, as
/// legacy-space `(start, len)` pairs. These are the vanilla tables the patch
/// relocates plus the padding after them.
pub const FREE_RANGES: &[(u32, u32)] = &[
  (VENTURE_CARD_TABLE, 0x0920),
  (0x8042_8978, 0x04d8),
  (ICON_TABLE, 0x1758),
];

lazy_static! {
  /// Section layout of the executable. The text sections are identical in
  /// both virtual layouts; the data section sits 0x140 bytes later in the
  /// legacy layout.
  pub static ref SECTIONS: Vec<AddressSection> = vec![
    AddressSection {
      file_offset: 0x0100,
      len: 0x24e0,
      standard_base: 0x8000_4000,
      legacy_base: 0x8000_4000,
    },
    AddressSection {
      file_offset: 0x2600,
      len: 0x33_a2e0,
      standard_base: 0x8000_6520,
      legacy_base: 0x8000_6520,
    },
    AddressSection {
      file_offset: 0x34_08e0,
      len: 0x4e_0000,
      standard_base: 0x8034_0800,
      legacy_base: 0x8034_0940,
    },
  ];
}

/// Registers every known-safe range of the unmodified image with `free`,
/// translated to standard-space addresses.
pub fn register_free_space(
  free: &mut FreeSpaceManager,
  mapper: &crate::addr::AddressMapper,
) -> crate::error::Result<()> {
  for &(start, len) in FREE_RANGES {
    free.add_free_space(mapper.legacy_to_standard(start)?, len);
  }
  Ok(())
}
