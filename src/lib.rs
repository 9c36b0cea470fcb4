//! dolpatch, a table-injection patcher for a Wii board game's executable.
//!
//! The crate reads the game's data tables (backgrounds, icons, music
//! replacement, venture cards, descriptions) out of a `main.dol` image,
//! exposes them as plain [`MapDescriptor`] records, and writes modified
//! tables back by relocating them into free space and rewriting the PowerPC
//! instructions that reference them.
//!
//! [`MapDescriptor`]: map/struct.MapDescriptor.html

#![deny(missing_docs)]
#![deny(unused)]
#![deny(warnings)]
#![deny(unsafe_code)]

pub mod addr;
pub mod dol;
pub mod error;
pub mod free_space;
pub mod map;
pub mod ppc;
pub mod sar;
pub mod stream;
pub mod table;
pub mod vanilla;
