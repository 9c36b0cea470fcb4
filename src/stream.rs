//! Validating primitives for the chunked binary formats this crate parses.
//!
//! Everything here fails closed: a magic literal, byte-order marker, or
//! reserved constant that does not match its expected value aborts the parse
//! with [`CorruptData`] before any partial structure escapes. Multi-byte
//! fields are big-endian throughout.
//!
//! Offsets inside a section are relative to the section's *anchor*: the
//! stream position immediately after its magic + size header. Readers that
//! follow an offset table seek freely and must not rely on the position they
//! left behind.
//!
//! [`CorruptData`]: ../error/enum.Error.html

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// A parsed section header: 4-byte magic plus a declared size.
#[derive(Copy, Clone, Debug)]
pub struct SectionHeader {
  /// The size the section declares for its contents.
  pub size: u32,
  /// The anchor: stream position immediately after this header. Every
  /// offset declared inside the section is relative to this.
  pub start: u64,
}

/// Reads 4 bytes and compares them against an expected magic literal.
pub fn read_magic<R: Read>(
  r: &mut R,
  expected: &[u8; 4],
  what: &'static str,
) -> Result<()> {
  let mut magic = [0u8; 4];
  r.read_exact(&mut magic)?;
  if &magic != expected {
    return Err(Error::CorruptData { what });
  }
  Ok(())
}

/// Reads a `u32` that must equal a known constant.
///
/// Mismatches mean the layout is one this parser does not understand, which
/// is treated identically to a bad magic.
pub fn expect_u32<R: Read>(
  r: &mut R,
  expected: u32,
  what: &'static str,
) -> Result<()> {
  if r.read_u32::<BigEndian>()? != expected {
    return Err(Error::CorruptData { what });
  }
  Ok(())
}

/// Reads a `u16` that must equal a known constant.
pub fn expect_u16<R: Read>(
  r: &mut R,
  expected: u16,
  what: &'static str,
) -> Result<()> {
  if r.read_u16::<BigEndian>()? != expected {
    return Err(Error::CorruptData { what });
  }
  Ok(())
}

/// Reads a `u8` that must equal a known constant.
pub fn expect_u8<R: Read>(
  r: &mut R,
  expected: u8,
  what: &'static str,
) -> Result<()> {
  if r.read_u8()? != expected {
    return Err(Error::CorruptData { what });
  }
  Ok(())
}

/// Reads a section header, validating its magic and recording the anchor.
pub fn read_section_header<R: Read + Seek>(
  r: &mut R,
  magic: &[u8; 4],
  what: &'static str,
) -> Result<SectionHeader> {
  read_magic(r, magic, what)?;
  let size = r.read_u32::<BigEndian>()?;
  let start = r.stream_position()?;
  Ok(SectionHeader { size, start })
}

/// Reads `count` table offsets.
pub fn read_u32_offsets<R: Read>(r: &mut R, count: u32) -> Result<Vec<u32>> {
  let mut offsets = Vec::with_capacity(count as usize);
  for _ in 0..count {
    offsets.push(r.read_u32::<BigEndian>()?);
  }
  Ok(offsets)
}

/// Follows an offset table: seeks to `start + offset` for each entry and
/// decodes one record there.
///
/// The result preserves table order, not seek order; an empty offset slice
/// performs no seeks at all.
pub fn read_offset_table<R, T, F>(
  r: &mut R,
  start: u64,
  offsets: &[u32],
  mut read_entry: F,
) -> Result<Vec<T>>
where
  R: Read + Seek,
  F: FnMut(&mut R) -> Result<T>,
{
  let mut entries = Vec::with_capacity(offsets.len());
  for &offset in offsets {
    r.seek(SeekFrom::Start(start + offset as u64))?;
    entries.push(read_entry(r)?);
  }
  Ok(entries)
}

/// Reads a fixed-width, NUL-padded string entry.
pub fn read_padded_string<R: Read>(r: &mut R, width: usize) -> Result<String> {
  let mut buf = vec![0u8; width];
  r.read_exact(&mut buf)?;
  let end = buf.iter().position(|&b| b == 0).unwrap_or(width);
  Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Writes a string into a fixed-width entry, NUL-padding the remainder.
pub fn write_padded_string<W: Write>(
  w: &mut W,
  s: &str,
  width: usize,
) -> Result<()> {
  if s.len() >= width {
    return Err(Error::CorruptData { what: "string too long for table entry" });
  }
  w.write_all(s.as_bytes())?;
  w.write_all(&vec![0u8; width - s.len()])?;
  Ok(())
}

/// Reads a NUL-terminated string of at most `cap` bytes.
pub fn read_cstring<R: Read>(r: &mut R, cap: usize) -> Result<String> {
  let mut buf = Vec::new();
  let mut byte = [0u8; 1];
  while buf.len() < cap {
    r.read_exact(&mut byte)?;
    if byte[0] == 0 {
      return Ok(String::from_utf8_lossy(&buf).into_owned());
    }
    buf.push(byte[0]);
  }
  Err(Error::CorruptData { what: "unterminated string" })
}

/// Writes a section: magic, placeholder size, body, then backpatches the
/// size once the body length is known. Returns the body length.
pub fn write_section<W, F>(w: &mut W, magic: &[u8; 4], body: F) -> Result<u32>
where
  W: Write + Seek,
  F: FnOnce(&mut W) -> Result<()>,
{
  w.write_all(magic)?;
  let size_at = w.stream_position()?;
  w.write_u32::<BigEndian>(0)?;
  let start = w.stream_position()?;
  body(w)?;
  let end = w.stream_position()?;
  let size = (end - start) as u32;
  w.seek(SeekFrom::Start(size_at))?;
  w.write_u32::<BigEndian>(size)?;
  w.seek(SeekFrom::Start(end))?;
  Ok(size)
}

#[cfg(test)]
mod test {
  use std::io::Cursor;

  use super::*;

  #[test]
  fn magic_mismatch_is_corrupt() {
    let mut r = Cursor::new(b"XSEC\x00\x00\x00\x14".to_vec());
    match read_section_header(&mut r, b"RSEC", "test section") {
      Err(Error::CorruptData { what: "test section" }) => {}
      other => panic!("expected CorruptData, got {:?}", other),
    }
  }

  #[test]
  fn header_anchors_after_itself() {
    let mut bytes = b"RSEC\x00\x00\x00\x14".to_vec();
    bytes.extend_from_slice(&[0u8; 0x14]);
    let mut r = Cursor::new(bytes);
    let header = read_section_header(&mut r, b"RSEC", "test section").unwrap();
    assert_eq!(header.size, 0x14);
    assert_eq!(header.start, 8);
  }

  #[test]
  fn offset_table_entry_at_anchor() {
    // "RSEC" || size=20, then count=1, entryOffsets=[0]: the record sits
    // exactly at the anchor, which here doubles as the count field. Use a
    // layout where offsets point past the table instead.
    let mut bytes = b"RSEC\x00\x00\x00\x14".to_vec();
    bytes.extend_from_slice(&1u32.to_be_bytes()); // count
    bytes.extend_from_slice(&8u32.to_be_bytes()); // entryOffsets[0]
    bytes.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes()); // the record
    let mut r = Cursor::new(bytes);

    let header = read_section_header(&mut r, b"RSEC", "test section").unwrap();
    let count = r.read_u32::<BigEndian>().unwrap();
    let offsets = read_u32_offsets(&mut r, count).unwrap();
    assert_eq!(offsets, vec![8]);

    let records = read_offset_table(&mut r, header.start, &offsets, |r| {
      Ok(r.read_u32::<BigEndian>()?)
    })
    .unwrap();
    assert_eq!(records, vec![0xDEAD_BEEF]);
    // header.start + 8 == file offset 16.
    assert_eq!(header.start + 8, 16);
  }

  #[test]
  fn record_at_anchor() {
    // An entry offset of zero addresses the first byte after the header.
    let mut bytes = b"RSEC\x00\x00\x00\x14".to_vec();
    bytes.extend_from_slice(&0xCAFE_F00Du32.to_be_bytes());
    let mut r = Cursor::new(bytes);
    let header = read_section_header(&mut r, b"RSEC", "test section").unwrap();
    let records = read_offset_table(&mut r, header.start, &[0], |r| {
      Ok(r.read_u32::<BigEndian>()?)
    })
    .unwrap();
    assert_eq!(records, vec![0xCAFE_F00D]);
  }

  #[test]
  fn empty_offset_table_reads_nothing() {
    let mut r = Cursor::new(Vec::new());
    let records: Vec<u32> =
      read_offset_table(&mut r, 0, &[], |_| unreachable!()).unwrap();
    assert!(records.is_empty());
  }

  #[test]
  fn padded_string_round_trip() {
    let mut buf = Cursor::new(Vec::new());
    write_padded_string(&mut buf, "ITA_bgm_map_circuit", 128).unwrap();
    assert_eq!(buf.get_ref().len(), 128);
    buf.set_position(0);
    assert_eq!(
      read_padded_string(&mut buf, 128).unwrap(),
      "ITA_bgm_map_circuit",
    );
  }

  #[test]
  fn oversized_padded_string_fails() {
    let mut buf = Cursor::new(Vec::new());
    let long = "x".repeat(128);
    assert!(write_padded_string(&mut buf, &long, 128).is_err());
  }

  #[test]
  fn section_size_is_backpatched() {
    let mut w = Cursor::new(Vec::new());
    let size = write_section(&mut w, b"SYMB", |w| {
      w.write_all(&[0xAB; 10])?;
      Ok(())
    })
    .unwrap();
    assert_eq!(size, 10);
    let bytes = w.into_inner();
    assert_eq!(&bytes[0..4], b"SYMB");
    assert_eq!(&bytes[4..8], &10u32.to_be_bytes());
    assert_eq!(bytes.len(), 18);
  }
}
