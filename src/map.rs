//! The board descriptor: everything the patcher knows about one board.
//!
//! Descriptors are plain data. They are produced by reading the tables out
//! of an image, edited as JSON5 documents, and consumed by the patch
//! pipeline; nothing in here touches the image itself.

use serde::Deserialize;
use serde::Serialize;

/// Number of venture-card flags each board carries.
pub const VENTURE_CARD_COUNT: usize = 128;

/// One music replacement: the stream played instead of a vanilla BGM id.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct MusicEntry {
  /// The vanilla BGM id being replaced.
  pub bgm_id: u32,
  /// Index of the replacement stream in the audio archive's sound-data
  /// table.
  pub sar_index: u32,
  /// Playback volume, `0..=100`.
  #[serde(default = "default_volume")]
  pub volume: u8,
}

fn default_volume() -> u8 {
  100
}

/// Everything the patch pipeline reads or writes for a single board.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct MapDescriptor {
  /// Background id, e.g. `bg101`. Also the key the icon pipeline derives
  /// vanilla icon names from.
  pub background: String,
  /// Icon shown on the board-select screen.
  pub map_icon: String,
  /// Music replacements, kept sorted by BGM id so extracted documents and
  /// injected tables are deterministic.
  #[serde(default)]
  pub music: Vec<MusicEntry>,
  /// Message id of the board's name.
  pub name_msg_id: u32,
  /// Message id of the board's description text.
  pub desc_msg_id: u32,
  /// Id gating when the board becomes selectable.
  pub unlock_id: u32,
  /// One enable flag per venture card; always [`VENTURE_CARD_COUNT`] long.
  ///
  /// [`VENTURE_CARD_COUNT`]: constant.VENTURE_CARD_COUNT.html
  #[serde(default = "default_venture_cards")]
  pub venture_cards: Vec<u8>,
}

fn default_venture_cards() -> Vec<u8> {
  vec![0; VENTURE_CARD_COUNT]
}

impl MapDescriptor {
  /// Returns the music replacements in BGM-id order, regardless of how the
  /// source document listed them.
  pub fn sorted_music(&self) -> Vec<MusicEntry> {
    let mut entries = self.music.clone();
    entries.sort_by_key(|e| e.bgm_id);
    entries
  }
}

impl Default for MapDescriptor {
  fn default() -> Self {
    MapDescriptor {
      background: String::new(),
      map_icon: String::new(),
      music: Vec::new(),
      name_msg_id: 0,
      desc_msg_id: 0,
      unlock_id: 0,
      venture_cards: default_venture_cards(),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn json5_round_trip() {
    let mut desc = MapDescriptor {
      background: "bg101".into(),
      map_icon: "p_bg_101".into(),
      name_msg_id: 3325,
      desc_msg_id: 3326,
      unlock_id: 0,
      ..MapDescriptor::default()
    };
    desc.music.push(MusicEntry { bgm_id: 17, sar_index: 204, volume: 90 });
    desc.venture_cards[3] = 1;

    let text = json5::to_string(&desc).unwrap();
    let back: MapDescriptor = json5::from_str(&text).unwrap();
    assert_eq!(back, desc);
  }

  #[test]
  fn omitted_fields_default() {
    let desc: MapDescriptor = json5::from_str(
      r#"{
        background: "bg801",
        map_icon: "p_bg_801",
        name_msg_id: 1,
        desc_msg_id: 2,
        unlock_id: 0,
      }"#,
    )
    .unwrap();
    assert!(desc.music.is_empty());
    assert_eq!(desc.venture_cards.len(), VENTURE_CARD_COUNT);
    assert!(desc.venture_cards.iter().all(|&c| c == 0));
  }

  #[test]
  fn music_is_sorted_for_output() {
    let desc: MapDescriptor = json5::from_str(
      r#"{
        background: "bg101",
        map_icon: "p_bg_101",
        music: [
          { bgm_id: 40, sar_index: 300 },
          { bgm_id: 17, sar_index: 204, volume: 90 },
        ],
        name_msg_id: 1,
        desc_msg_id: 2,
        unlock_id: 0,
      }"#,
    )
    .unwrap();
    assert_eq!(desc.music[0].volume, 100);
    let sorted = desc.sorted_music();
    assert_eq!(sorted[0].bgm_id, 17);
    assert_eq!(sorted[1].bgm_id, 40);
  }
}
