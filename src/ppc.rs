//! The PowerPC instruction subset used at patch sites.
//!
//! This is not a general-purpose assembler: it covers exactly the fixed-width
//! operations the table patchers read and rewrite, and round-trips each of
//! them exactly (`decode(encode(i)) == i`). All words are big-endian on disk;
//! this module deals in already-byteswapped `u32` values.
//!
//! The other job of this module is the hi/lo immediate convention for
//! materializing a 32-bit address in a register: a `lis` with the upper half
//! followed by an `addi` whose 16-bit immediate is *sign-extended* by the
//! processor. [`Pair16`] owns the carry compensation that convention
//! requires.
//!
//! [`Pair16`]: struct.Pair16.html

use crate::error::{Error, Result};

/// A condition for a conditional branch, tested against `cr0`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Condition {
  /// Branch if less than.
  Lt,
  /// Branch if greater than or equal.
  Ge,
  /// Branch if greater than.
  Gt,
  /// Branch if less than or equal.
  Le,
  /// Branch if equal.
  Eq,
  /// Branch if not equal.
  Ne,
}

impl Condition {
  /// Returns the `BO` and `BI` fields encoding this condition.
  fn bo_bi(self) -> (u32, u32) {
    match self {
      Condition::Lt => (12, 0),
      Condition::Ge => (4, 0),
      Condition::Gt => (12, 1),
      Condition::Le => (4, 1),
      Condition::Eq => (12, 2),
      Condition::Ne => (4, 2),
    }
  }

  fn from_bo_bi(bo: u32, bi: u32) -> Option<Self> {
    match (bo, bi) {
      (12, 0) => Some(Condition::Lt),
      (4, 0) => Some(Condition::Ge),
      (12, 1) => Some(Condition::Gt),
      (4, 1) => Some(Condition::Le),
      (12, 2) => Some(Condition::Eq),
      (4, 2) => Some(Condition::Ne),
      _ => None,
    }
  }
}

/// A single supported instruction.
///
/// Displacement-carrying variants store *byte* displacements relative to the
/// instruction's own address. Use the checked constructors ([`b`], [`bl`],
/// [`bc`]) to build them from absolute addresses; they reject targets that do
/// not fit the displacement field instead of wrapping.
///
/// [`b`]: #method.b
/// [`bl`]: #method.bl
/// [`bc`]: #method.bc
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Instruction {
  /// `b`/`bl`: unconditional branch, 24-bit signed word displacement.
  B {
    /// Byte displacement from the instruction's own address.
    disp: i32,
    /// Whether the branch records the return address (`bl`).
    link: bool,
  },
  /// `bc`: conditional branch on `cr0`, 14-bit signed word displacement.
  Bc {
    /// The `cr0` condition being branched on.
    cond: Condition,
    /// Byte displacement from the instruction's own address.
    disp: i32,
  },
  /// `cmpw`: signed register-register compare.
  Cmpw {
    /// Left operand register.
    ra: u8,
    /// Right operand register.
    rb: u8,
  },
  /// `cmplw`: unsigned register-register compare.
  Cmplw {
    /// Left operand register.
    ra: u8,
    /// Right operand register.
    rb: u8,
  },
  /// `cmpwi`: signed compare against a 16-bit immediate.
  Cmpwi {
    /// Left operand register.
    ra: u8,
    /// The immediate compared against.
    imm: i16,
  },
  /// `cmplwi`: unsigned compare against a 16-bit immediate.
  Cmplwi {
    /// Left operand register.
    ra: u8,
    /// The immediate compared against.
    imm: u16,
  },
  /// `lwz`: load word from `disp(ra)`.
  Lwz {
    /// Destination register.
    rt: u8,
    /// Signed byte displacement off `ra`.
    disp: i16,
    /// Base address register.
    ra: u8,
  },
  /// `stw`: store word to `disp(ra)`.
  Stw {
    /// Source register.
    rs: u8,
    /// Signed byte displacement off `ra`.
    disp: i16,
    /// Base address register.
    ra: u8,
  },
  /// `lwzx`: load word from `ra + rb`.
  Lwzx {
    /// Destination register.
    rt: u8,
    /// Base address register.
    ra: u8,
    /// Index register.
    rb: u8,
  },
  /// `lis` (`addis rt, 0, imm`): load the upper 16 bits of a register.
  Lis {
    /// Destination register.
    rt: u8,
    /// The upper half being loaded.
    imm: u16,
  },
  /// `addi`: add a sign-extended 16-bit immediate. `li` when `ra == 0`.
  Addi {
    /// Destination register.
    rt: u8,
    /// Source register, or the literal zero when 0.
    ra: u8,
    /// The immediate being added.
    imm: i16,
  },
  /// `mulli`: multiply by a sign-extended 16-bit immediate.
  Mulli {
    /// Destination register.
    rt: u8,
    /// Source register.
    ra: u8,
    /// The immediate multiplier.
    imm: i16,
  },
  /// `rlwinm`: rotate left by `sh`, then AND with the mask `mb..=me`.
  Rlwinm {
    /// Destination register.
    ra: u8,
    /// Source register.
    rs: u8,
    /// Rotate amount in bits.
    sh: u8,
    /// First bit of the mask, IBM numbering.
    mb: u8,
    /// Last bit of the mask, IBM numbering.
    me: u8,
  },
  /// `mr` (`or ra, rs, rs`): register move.
  Mr {
    /// Destination register.
    ra: u8,
    /// Source register.
    rs: u8,
  },
  /// `nop` (`ori 0, 0, 0`).
  Nop,
  /// `blr`: return from subroutine.
  Blr,
  /// `mflr`: save the link register.
  Mflr {
    /// Destination register.
    rt: u8,
  },
  /// `mtlr`: restore the link register.
  Mtlr {
    /// Source register.
    rs: u8,
  },
}

/// Byte range of the 24-bit branch displacement field.
const B_DISP_MIN: i64 = -0x0200_0000;
const B_DISP_MAX: i64 = 0x01FF_FFFC;
/// Byte range of the 14-bit conditional-branch displacement field.
const BC_DISP_MIN: i64 = -0x8000;
const BC_DISP_MAX: i64 = 0x7FFC;

fn branch_disp(
  from: u32,
  to: u32,
  min: i64,
  max: i64,
  what: &'static str,
) -> Result<i32> {
  let disp = to as i64 - from as i64;
  if disp % 4 != 0 || disp < min || disp > max {
    return Err(Error::EncodingRange { what, value: disp });
  }
  Ok(disp as i32)
}

impl Instruction {
  /// Builds a `b` from `from` to the absolute address `to`.
  pub fn b(from: u32, to: u32) -> Result<Self> {
    let disp =
      branch_disp(from, to, B_DISP_MIN, B_DISP_MAX, "branch displacement")?;
    Ok(Instruction::B { disp, link: false })
  }

  /// Builds a `bl` from `from` to the absolute address `to`.
  pub fn bl(from: u32, to: u32) -> Result<Self> {
    let disp =
      branch_disp(from, to, B_DISP_MIN, B_DISP_MAX, "branch displacement")?;
    Ok(Instruction::B { disp, link: true })
  }

  /// Builds a conditional branch from `from` to the absolute address `to`.
  pub fn bc(cond: Condition, from: u32, to: u32) -> Result<Self> {
    let disp = branch_disp(
      from,
      to,
      BC_DISP_MIN,
      BC_DISP_MAX,
      "conditional branch displacement",
    )?;
    Ok(Instruction::Bc { cond, disp })
  }

  /// Builds a `b` skipping `words` instructions forward (or backward).
  ///
  /// This is for short jumps inside an injected routine, where the distance
  /// is a small compile-time constant; out-of-range values are a programming
  /// error.
  pub fn b_words(words: i32) -> Self {
    debug_assert!((words as i64 * 4) >= B_DISP_MIN);
    debug_assert!((words as i64 * 4) <= B_DISP_MAX);
    Instruction::B { disp: words * 4, link: false }
  }

  /// Builds a conditional branch skipping `words` instructions.
  pub fn bc_words(cond: Condition, words: i32) -> Self {
    debug_assert!((words as i64 * 4) >= BC_DISP_MIN);
    debug_assert!((words as i64 * 4) <= BC_DISP_MAX);
    Instruction::Bc { cond, disp: words * 4 }
  }

  /// Builds an `li` (`addi rt, 0, imm`).
  pub fn li(rt: u8, imm: i16) -> Self {
    Instruction::Addi { rt, ra: 0, imm }
  }

  /// Returns the absolute target of this instruction when placed at `at`,
  /// if it is a branch.
  pub fn branch_target(self, at: u32) -> Option<u32> {
    match self {
      Instruction::B { disp, .. } | Instruction::Bc { disp, .. } => {
        Some(at.wrapping_add(disp as u32))
      }
      _ => None,
    }
  }

  /// Encodes this instruction into a machine word.
  pub fn encode(self) -> u32 {
    use Instruction::*;
    let r = |n: u8| n as u32 & 0x1F;
    match self {
      B { disp, link } => {
        0x4800_0000 | (disp as u32 & 0x03FF_FFFC) | link as u32
      }
      Bc { cond, disp } => {
        let (bo, bi) = cond.bo_bi();
        0x4000_0000 | bo << 21 | bi << 16 | (disp as u32 & 0xFFFC)
      }
      Cmpw { ra, rb } => 0x7C00_0000 | r(ra) << 16 | r(rb) << 11,
      Cmplw { ra, rb } => 0x7C00_0040 | r(ra) << 16 | r(rb) << 11,
      Cmpwi { ra, imm } => 0x2C00_0000 | r(ra) << 16 | (imm as u16 as u32),
      Cmplwi { ra, imm } => 0x2800_0000 | r(ra) << 16 | imm as u32,
      Lwz { rt, disp, ra } => {
        0x8000_0000 | r(rt) << 21 | r(ra) << 16 | (disp as u16 as u32)
      }
      Stw { rs, disp, ra } => {
        0x9000_0000 | r(rs) << 21 | r(ra) << 16 | (disp as u16 as u32)
      }
      Lwzx { rt, ra, rb } => {
        0x7C00_002E | r(rt) << 21 | r(ra) << 16 | r(rb) << 11
      }
      Lis { rt, imm } => 0x3C00_0000 | r(rt) << 21 | imm as u32,
      Addi { rt, ra, imm } => {
        0x3800_0000 | r(rt) << 21 | r(ra) << 16 | (imm as u16 as u32)
      }
      Mulli { rt, ra, imm } => {
        0x1C00_0000 | r(rt) << 21 | r(ra) << 16 | (imm as u16 as u32)
      }
      Rlwinm { ra, rs, sh, mb, me } => {
        0x5400_0000
          | r(rs) << 21
          | r(ra) << 16
          | r(sh) << 11
          | r(mb) << 6
          | r(me) << 1
      }
      Mr { ra, rs } => 0x7C00_0378 | r(rs) << 21 | r(ra) << 16 | r(rs) << 11,
      Nop => 0x6000_0000,
      Blr => 0x4E80_0020,
      Mflr { rt } => 0x7C08_02A6 | r(rt) << 21,
      Mtlr { rs } => 0x7C08_03A6 | r(rs) << 21,
    }
  }

  /// Decodes a machine word, if it is one of the supported instructions.
  pub fn decode(word: u32) -> Option<Self> {
    use Instruction::*;
    let rt = ((word >> 21) & 0x1F) as u8;
    let ra = ((word >> 16) & 0x1F) as u8;
    let rb = ((word >> 11) & 0x1F) as u8;
    let imm = word as u16;
    match word >> 26 {
      18 => {
        // AA=1 (absolute) branches never appear in the images we patch.
        if word & 0x2 != 0 {
          return None;
        }
        let mut disp = (word & 0x03FF_FFFC) as i32;
        if disp & 0x0200_0000 != 0 {
          disp |= 0xFC00_0000u32 as i32;
        }
        Some(B { disp, link: word & 1 != 0 })
      }
      16 => {
        if word & 0x3 != 0 {
          return None;
        }
        let cond = Condition::from_bo_bi(rt as u32, ra as u32)?;
        let disp = (word & 0xFFFC) as i16 as i32;
        Some(Bc { cond, disp })
      }
      10 => {
        // crfD and L must be zero; anything else compares a field we do
        // not model.
        if rt != 0 {
          return None;
        }
        Some(Cmplwi { ra, imm })
      }
      11 => {
        if rt != 0 {
          return None;
        }
        Some(Cmpwi { ra, imm: imm as i16 })
      }
      7 => Some(Mulli { rt, ra, imm: imm as i16 }),
      14 => Some(Addi { rt, ra, imm: imm as i16 }),
      15 => {
        if ra != 0 {
          return None;
        }
        Some(Lis { rt, imm })
      }
      21 => {
        if word & 1 != 0 {
          return None;
        }
        let sh = rb;
        let mb = ((word >> 6) & 0x1F) as u8;
        let me = ((word >> 1) & 0x1F) as u8;
        Some(Rlwinm { ra, rs: rt, sh, mb, me })
      }
      24 => {
        if word == 0x6000_0000 {
          Some(Nop)
        } else {
          None
        }
      }
      19 => {
        if word == 0x4E80_0020 {
          Some(Blr)
        } else {
          None
        }
      }
      32 => Some(Lwz { rt, disp: imm as i16, ra }),
      36 => Some(Stw { rs: rt, disp: imm as i16, ra }),
      31 => match (word >> 1) & 0x3FF {
        0 if rt == 0 && word & 1 == 0 => Some(Cmpw { ra, rb }),
        32 if rt == 0 && word & 1 == 0 => Some(Cmplw { ra, rb }),
        23 if word & 1 == 0 => Some(Lwzx { rt, ra, rb }),
        339 if word == 0x7C08_02A6 | (rt as u32) << 21 => Some(Mflr { rt }),
        467 if word == 0x7C08_03A6 | (rt as u32) << 21 => Some(Mtlr { rs: rt }),
        444 if rt == rb && word & 1 == 0 => Some(Mr { ra, rs: rt }),
        _ => None,
      },
      _ => None,
    }
  }
}

/// The hi/lo halves of a 32-bit address, as `lis`/`addi` immediates.
///
/// The `addi` immediate is sign-extended by the processor, so when bit 15 of
/// the low half is set, the upper half carries an extra 1 to compensate.
/// Getting this wrong produces addresses that are off by 0x10000 with no
/// diagnostic, which is why [`join`] is the *only* sanctioned inverse.
///
/// [`join`]: #method.join
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Pair16 {
  /// The `lis` immediate.
  pub upper: u16,
  /// The `addi` immediate, sign-extended at evaluation time.
  pub lower: i16,
}

impl Pair16 {
  /// Splits `addr` into a `lis`/`addi` immediate pair.
  pub fn of(addr: u32) -> Self {
    let lower = addr as u16 as i16;
    let mut upper = (addr >> 16) as u16;
    if lower < 0 {
      upper = upper.wrapping_add(1);
    }
    Pair16 { upper, lower }
  }

  /// Reassembles the address this pair evaluates to.
  pub fn join(self) -> u32 {
    ((self.upper as u32) << 16).wrapping_add(self.lower as i32 as u32)
  }

  /// Emits the pair as a `lis rt` / `addi rt, rt` sequence.
  pub fn load_into(self, rt: u8) -> [Instruction; 2] {
    [
      Instruction::Lis { rt, imm: self.upper },
      Instruction::Addi { rt, ra: rt, imm: self.lower },
    ]
  }
}

/// Recovers the address materialized by a `lis`/`addi` pair of machine words.
///
/// The `addi` must add into the register the `lis` loaded; anything else at
/// the site means the image does not hold the pair the caller assumed.
pub fn join_pair(lis_word: u32, addi_word: u32) -> Result<u32> {
  match (Instruction::decode(lis_word), Instruction::decode(addi_word)) {
    (
      Some(Instruction::Lis { rt, imm: upper }),
      Some(Instruction::Addi { rt: art, ra, imm: lower }),
    ) if rt == ra && rt == art => Ok(Pair16 { upper, lower }.join()),
    _ => Err(Error::CorruptData { what: "lis/addi address pair" }),
  }
}
