//! The sound-resource archive format.
//!
//! The archive is a chunked container: a fixed 0x40-byte file header naming
//! three sections, each section a magic-tagged chunk whose internal offsets
//! are relative to its own anchor (see [`stream`]). Only the pieces the
//! patch pipeline needs are modeled: the SYMB name table (so sound names can
//! be resolved to indices) and the INFO sound-data table (per-sound entries
//! carrying name indices and playback parameters). The parser is
//! deliberately incomplete for anything else and fails closed on every
//! reserved field it does not understand.
//!
//! [`stream`]: ../stream/index.html

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::stream;

/// The file magic.
pub const MAGIC: &[u8; 4] = b"RSAR";
/// Required byte-order marker (the format is always big-endian).
const BYTE_ORDER_MARK: u16 = 0xFEFF;
/// The single format version this parser understands.
const FORMAT_VERSION: u16 = 0x0104;
/// Declared length of the file header.
const HEADER_LEN: u16 = 0x40;
/// Number of sections the header declares.
const SECTION_COUNT: u16 = 3;
/// Width of one name-table entry.
const NAME_ENTRY_WIDTH: usize = 128;
/// Marker word preceding every table reference inside INFO. Its only known
/// purpose is to flag layouts this parser does not understand.
const REF_TAG: u32 = 0x0100_0000;
/// Offset of the name table within the SYMB section body.
const NAME_TABLE_OFFSET: u32 = 0x14;

/// The kind of a sound, as a small-integer flag in its INFO entry.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SoundKind {
  /// A sequenced sound.
  Seq,
  /// A streamed sound.
  Strm,
  /// A raw wave.
  Wave,
}

impl SoundKind {
  fn from_u8(value: u8) -> Result<Self> {
    match value {
      1 => Ok(SoundKind::Seq),
      2 => Ok(SoundKind::Strm),
      3 => Ok(SoundKind::Wave),
      _ => Err(Error::CorruptData { what: "sound kind flag" }),
    }
  }
}

/// One entry of the INFO sound-data table.
///
/// Field names follow the community documentation of the format; several
/// are opaque playback parameters carried through untouched.
#[derive(Clone, Debug)]
pub struct SoundEntry {
  /// Index into the SYMB name table.
  pub name_index: u32,
  /// Index into the collection table.
  pub collection_index: u32,
  /// The player this sound is routed to.
  pub player_id: u32,
  /// Sound-parameter subsection offset; always directly follows the entry.
  pub param_offset: u32,
  /// Playback volume.
  pub volume: u8,
  /// Scheduling priority within the player.
  pub player_priority: u8,
  /// The sound's kind flag.
  pub kind: SoundKind,
  /// Remote (controller speaker) filter.
  pub remote_filter: u8,
  /// Opaque flag word.
  pub flags: u32,
  /// Kind-specific subsection offset; always directly follows the entry.
  pub kind_param_offset: u32,
  /// Free-form user parameters.
  pub user_params: [u32; 2],
  /// Panning mode.
  pub pan_mode: u8,
  /// Panning curve.
  pub pan_curve: u8,
  /// Actor player id.
  pub actor_player_id: u8,
  /// Stream start position.
  pub start_position: u32,
  /// Channels to allocate.
  pub channel_count: u32,
  /// Stream track allocation mask.
  pub track_mask: u32,
  /// Unvalidated reserved word carried through as-is.
  pub reserved: u32,
  /// 3D parameter flags.
  pub sound3d_flags: u32,
  /// Decay curve selector.
  pub decay_curve: u8,
  /// Decay ratio.
  pub decay_ratio: u8,
}

impl SoundEntry {
  fn read<R: Read + Seek>(r: &mut R) -> Result<Self> {
    let name_index = r.read_u32::<BigEndian>()?;
    let collection_index = r.read_u32::<BigEndian>()?;
    let player_id = r.read_u32::<BigEndian>()?;
    stream::expect_u32(r, REF_TAG, "sound entry reference tag")?;
    let param_offset = r.read_u32::<BigEndian>()?;
    let volume = r.read_u8()?;
    let player_priority = r.read_u8()?;
    let kind = SoundKind::from_u8(r.read_u8()?)?;
    let remote_filter = r.read_u8()?;
    let flags = r.read_u32::<BigEndian>()?;
    let kind_param_offset = r.read_u32::<BigEndian>()?;
    let user_params = [r.read_u32::<BigEndian>()?, r.read_u32::<BigEndian>()?];
    let pan_mode = r.read_u8()?;
    let pan_curve = r.read_u8()?;
    let actor_player_id = r.read_u8()?;
    stream::expect_u8(r, 0, "sound entry padding")?;
    // Kind-specific parameters. Streamed sounds are the only kind the
    // patch pipeline rewrites, so one shape is assumed for all three.
    let start_position = r.read_u32::<BigEndian>()?;
    let channel_count = r.read_u32::<BigEndian>()?;
    let track_mask = r.read_u32::<BigEndian>()?;
    let reserved = r.read_u32::<BigEndian>()?;
    let sound3d_flags = r.read_u32::<BigEndian>()?;
    let decay_curve = r.read_u8()?;
    let decay_ratio = r.read_u8()?;
    Ok(SoundEntry {
      name_index,
      collection_index,
      player_id,
      param_offset,
      volume,
      player_priority,
      kind,
      remote_filter,
      flags,
      kind_param_offset,
      user_params,
      pan_mode,
      pan_curve,
      actor_player_id,
      start_position,
      channel_count,
      track_mask,
      reserved,
      sound3d_flags,
      decay_curve,
      decay_ratio,
    })
  }

  /// Writes this entry at the current stream position.
  pub fn write<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
    w.write_u32::<BigEndian>(self.name_index)?;
    w.write_u32::<BigEndian>(self.collection_index)?;
    w.write_u32::<BigEndian>(self.player_id)?;
    w.write_u32::<BigEndian>(REF_TAG)?;
    w.write_u32::<BigEndian>(self.param_offset)?;
    w.write_u8(self.volume)?;
    w.write_u8(self.player_priority)?;
    w.write_u8(match self.kind {
      SoundKind::Seq => 1,
      SoundKind::Strm => 2,
      SoundKind::Wave => 3,
    })?;
    w.write_u8(self.remote_filter)?;
    w.write_u32::<BigEndian>(self.flags)?;
    w.write_u32::<BigEndian>(self.kind_param_offset)?;
    w.write_u32::<BigEndian>(self.user_params[0])?;
    w.write_u32::<BigEndian>(self.user_params[1])?;
    w.write_u8(self.pan_mode)?;
    w.write_u8(self.pan_curve)?;
    w.write_u8(self.actor_player_id)?;
    w.write_u8(0)?;
    w.write_u32::<BigEndian>(self.start_position)?;
    w.write_u32::<BigEndian>(self.channel_count)?;
    w.write_u32::<BigEndian>(self.track_mask)?;
    w.write_u32::<BigEndian>(self.reserved)?;
    w.write_u32::<BigEndian>(self.sound3d_flags)?;
    w.write_u8(self.decay_curve)?;
    w.write_u8(self.decay_ratio)?;
    Ok(())
  }
}

/// The SYMB section: the archive's name table.
#[derive(Clone, Debug, Default)]
pub struct SymbSection {
  /// Offsets of the four lookup-mask tables, carried through unparsed.
  pub mask_offsets: [u32; 4],
  /// Every name in the archive, in table order.
  pub names: Vec<String>,
}

impl SymbSection {
  /// Reads a SYMB section starting at the current stream position.
  pub fn read<R: Read + Seek>(r: &mut R) -> Result<Self> {
    let header = stream::read_section_header(r, b"SYMB", "SYMB magic")?;
    let name_table_offset = r.read_u32::<BigEndian>()?;
    let mask_offsets = [
      r.read_u32::<BigEndian>()?,
      r.read_u32::<BigEndian>()?,
      r.read_u32::<BigEndian>()?,
      r.read_u32::<BigEndian>()?,
    ];
    r.seek(SeekFrom::Start(header.start + name_table_offset as u64))?;
    let count = r.read_u32::<BigEndian>()?;
    let offsets = stream::read_u32_offsets(r, count)?;
    let names = stream::read_offset_table(r, header.start, &offsets, |r| {
      stream::read_padded_string(r, NAME_ENTRY_WIDTH)
    })?;
    Ok(SymbSection { mask_offsets, names })
  }

  /// Writes this section at the current stream position.
  ///
  /// Entry offsets are established by pre-walking the (fixed-width) entries
  /// once, then the table and entries are emitted; the declared section
  /// size is backpatched afterwards.
  pub fn write<W: Write + Seek>(&self, w: &mut W) -> Result<u32> {
    stream::write_section(w, b"SYMB", |w| {
      w.write_u32::<BigEndian>(NAME_TABLE_OFFSET)?;
      for &mask in &self.mask_offsets {
        w.write_u32::<BigEndian>(mask)?;
      }
      let count = self.names.len() as u32;
      w.write_u32::<BigEndian>(count)?;
      let entries_at = NAME_TABLE_OFFSET + 4 + count * 4;
      for i in 0..count {
        w.write_u32::<BigEndian>(entries_at + i * NAME_ENTRY_WIDTH as u32)?;
      }
      for name in &self.names {
        stream::write_padded_string(w, name, NAME_ENTRY_WIDTH)?;
      }
      Ok(())
    })
  }
}

/// The INFO section: tables describing every sound in the archive.
#[derive(Clone, Debug)]
pub struct InfoSection {
  /// Anchor-relative offsets of the five subtables (sound data, bank,
  /// player, collection, group).
  pub table_offsets: [u32; 5],
  /// The sound-data table.
  pub sounds: Vec<SoundEntry>,
}

impl InfoSection {
  /// Reads an INFO section starting at the current stream position.
  pub fn read<R: Read + Seek>(r: &mut R) -> Result<Self> {
    let header = stream::read_section_header(r, b"INFO", "INFO magic")?;
    let mut table_offsets = [0u32; 5];
    for offset in table_offsets.iter_mut() {
      stream::expect_u32(r, REF_TAG, "INFO table reference tag")?;
      *offset = r.read_u32::<BigEndian>()?;
    }
    stream::expect_u32(r, REF_TAG, "INFO trailing reference tag")?;

    r.seek(SeekFrom::Start(header.start + table_offsets[0] as u64))?;
    let count = r.read_u32::<BigEndian>()?;
    let mut offsets = Vec::with_capacity(count as usize);
    for _ in 0..count {
      stream::expect_u32(r, REF_TAG, "sound table reference tag")?;
      offsets.push(r.read_u32::<BigEndian>()?);
    }
    let sounds =
      stream::read_offset_table(r, header.start, &offsets, SoundEntry::read)?;
    Ok(InfoSection { table_offsets, sounds })
  }
}

/// A parsed archive.
#[derive(Clone, Debug)]
pub struct SarFile {
  /// Declared total file length.
  pub file_len: u32,
  /// The name table.
  pub symb: SymbSection,
  /// The sound tables.
  pub info: InfoSection,
}

impl SarFile {
  /// Reads an archive from the start of `r`.
  ///
  /// Any magic, marker, or reserved-field mismatch aborts with
  /// [`CorruptData`]; no partially parsed archive is returned.
  ///
  /// [`CorruptData`]: ../error/enum.Error.html
  pub fn read<R: Read + Seek>(r: &mut R) -> Result<Self> {
    stream::read_magic(r, MAGIC, "archive magic")?;
    stream::expect_u16(r, BYTE_ORDER_MARK, "byte-order marker")?;
    stream::expect_u16(r, FORMAT_VERSION, "format version")?;
    let file_len = r.read_u32::<BigEndian>()?;
    stream::expect_u16(r, HEADER_LEN, "header length")?;
    stream::expect_u16(r, SECTION_COUNT, "section count")?;
    let symb_offset = r.read_u32::<BigEndian>()?;
    let _symb_len = r.read_u32::<BigEndian>()?;
    let info_offset = r.read_u32::<BigEndian>()?;
    let _info_len = r.read_u32::<BigEndian>()?;
    let _data_offset = r.read_u32::<BigEndian>()?;
    let _data_len = r.read_u32::<BigEndian>()?;
    // Reserved: one unused (offset, length) pair plus 16 bytes of padding.
    r.seek(SeekFrom::Current(24))?;

    r.seek(SeekFrom::Start(symb_offset as u64))?;
    let symb = SymbSection::read(r)?;
    r.seek(SeekFrom::Start(info_offset as u64))?;
    let info = InfoSection::read(r)?;
    Ok(SarFile { file_len, symb, info })
  }

  /// Resolves a sound name to its index in the sound-data table.
  ///
  /// This index is what the music-replacement table embeds in the
  /// executable.
  pub fn sound_index(&self, name: &str) -> Option<u32> {
    self.info.sounds.iter().position(|entry| {
      self
        .symb
        .names
        .get(entry.name_index as usize)
        .map(|n| n == name)
        .unwrap_or(false)
    }).map(|i| i as u32)
  }
}

#[cfg(test)]
mod test {
  use std::io::Cursor;

  use super::*;

  fn sample_entry(name_index: u32) -> SoundEntry {
    SoundEntry {
      name_index,
      collection_index: 0,
      player_id: 1,
      param_offset: 0x38,
      volume: 96,
      player_priority: 64,
      kind: SoundKind::Strm,
      remote_filter: 0,
      flags: 0,
      kind_param_offset: 0x1C,
      user_params: [0, 0],
      pan_mode: 0,
      pan_curve: 1,
      actor_player_id: 0,
      start_position: 0,
      channel_count: 2,
      track_mask: 1,
      reserved: 0,
      sound3d_flags: 0,
      decay_curve: 1,
      decay_ratio: 0x80,
    }
  }

  /// Serializes a minimal archive: SYMB with `names`, INFO with `sounds`.
  fn sample_archive(names: &[&str], sounds: &[SoundEntry]) -> Vec<u8> {
    let mut w = Cursor::new(Vec::new());
    w.seek(SeekFrom::Start(0x40)).unwrap();

    let symb_offset = w.stream_position().unwrap() as u32;
    let symb = SymbSection {
      mask_offsets: [0; 4],
      names: names.iter().map(|s| s.to_string()).collect(),
    };
    let symb_len = symb.write(&mut w).unwrap() + 8;

    let info_offset = w.stream_position().unwrap() as u32;
    let info_len = stream::write_section(&mut w, b"INFO", |w| {
      // Five table references plus the trailing one; only the sound table
      // is populated.
      let sound_table_at = 6 * 8;
      for i in 0..5 {
        w.write_u32::<BigEndian>(REF_TAG).unwrap();
        w.write_u32::<BigEndian>(if i == 0 { sound_table_at } else { 0 })
          .unwrap();
      }
      w.write_u32::<BigEndian>(REF_TAG).unwrap();
      w.write_u32::<BigEndian>(0).unwrap();

      w.write_u32::<BigEndian>(sounds.len() as u32).unwrap();
      let entries_at = sound_table_at + 4 + sounds.len() as u32 * 8;
      // Serialized SoundEntry width: 14 words plus 10 single bytes.
      const ENTRY_LEN: u32 = 0x42;
      for i in 0..sounds.len() as u32 {
        w.write_u32::<BigEndian>(REF_TAG).unwrap();
        w.write_u32::<BigEndian>(entries_at + i * ENTRY_LEN).unwrap();
      }
      for sound in sounds {
        sound.write(w).unwrap();
      }
      Ok(())
    })
    .unwrap()
      + 8;

    let total = w.stream_position().unwrap() as u32;
    w.seek(SeekFrom::Start(0)).unwrap();
    w.write_all(MAGIC).unwrap();
    w.write_u16::<BigEndian>(BYTE_ORDER_MARK).unwrap();
    w.write_u16::<BigEndian>(FORMAT_VERSION).unwrap();
    w.write_u32::<BigEndian>(total).unwrap();
    w.write_u16::<BigEndian>(HEADER_LEN).unwrap();
    w.write_u16::<BigEndian>(SECTION_COUNT).unwrap();
    w.write_u32::<BigEndian>(symb_offset).unwrap();
    w.write_u32::<BigEndian>(symb_len).unwrap();
    w.write_u32::<BigEndian>(info_offset).unwrap();
    w.write_u32::<BigEndian>(info_len).unwrap();
    w.write_u32::<BigEndian>(0).unwrap();
    w.write_u32::<BigEndian>(0).unwrap();
    w.into_inner()
  }

  #[test]
  fn read_round_trip() {
    let bytes = sample_archive(
      &["ITA_bgm_title", "ITA_bgm_map_circuit"],
      &[sample_entry(0), sample_entry(1)],
    );
    let sar = SarFile::read(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(sar.symb.names.len(), 2);
    assert_eq!(sar.symb.names[1], "ITA_bgm_map_circuit");
    assert_eq!(sar.info.sounds.len(), 2);
    assert_eq!(sar.info.sounds[1].name_index, 1);
    assert_eq!(sar.info.sounds[0].kind, SoundKind::Strm);
  }

  #[test]
  fn sound_index_by_name() {
    let bytes = sample_archive(
      &["ITA_bgm_title", "ITA_bgm_map_circuit"],
      &[sample_entry(1), sample_entry(0)],
    );
    let sar = SarFile::read(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(sar.sound_index("ITA_bgm_map_circuit"), Some(0));
    assert_eq!(sar.sound_index("ITA_bgm_title"), Some(1));
    assert_eq!(sar.sound_index("ITA_bgm_missing"), None);
  }

  #[test]
  fn bad_magic_fails_closed() {
    let mut bytes =
      sample_archive(&["ITA_bgm_title"], &[sample_entry(0)]);
    bytes[0] = b'X';
    match SarFile::read(&mut Cursor::new(bytes)) {
      Err(Error::CorruptData { what: "archive magic" }) => {}
      other => panic!("expected CorruptData, got {:?}", other),
    }
  }

  #[test]
  fn bad_version_fails_closed() {
    let mut bytes =
      sample_archive(&["ITA_bgm_title"], &[sample_entry(0)]);
    bytes[7] = 0x05;
    assert!(SarFile::read(&mut Cursor::new(bytes)).is_err());
  }

  #[test]
  fn bad_reference_tag_fails_closed() {
    let mut bytes =
      sample_archive(&["ITA_bgm_title"], &[sample_entry(0)]);
    // Corrupt the first INFO table reference tag.
    let info_body = bytes
      .windows(4)
      .position(|w| w == b"INFO")
      .unwrap()
      + 8;
    bytes[info_body] = 0xFF;
    assert!(SarFile::read(&mut Cursor::new(bytes)).is_err());
  }
}
