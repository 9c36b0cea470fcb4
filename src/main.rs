//! The dolpatch command line.

#![deny(warnings)]
#![deny(unsafe_code)]

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process;

use structopt::StructOpt;

use dolpatch::addr::AddressSection;
use dolpatch::dol::Dol;
use dolpatch::error::{Error, Result};
use dolpatch::map::MapDescriptor;
use dolpatch::sar::SarFile;

#[derive(StructOpt)]
#[structopt(name = "dolpatch", about = "Patches board tables into main.dol")]
enum Command {
  /// Report free space and per-table layout of an image.
  Info {
    /// The main.dol image to inspect.
    image: PathBuf,
    /// A JSON5 section table overriding the stock layout.
    #[structopt(long)]
    sections: Option<PathBuf>,
  },
  /// Extract every board table into a JSON5 descriptor document.
  Extract {
    /// The main.dol image to read.
    image: PathBuf,
    /// Where to write the descriptor document.
    #[structopt(short, long)]
    output: PathBuf,
    /// A JSON5 section table overriding the stock layout.
    #[structopt(long)]
    sections: Option<PathBuf>,
  },
  /// Apply a descriptor document to a copy of an image.
  Patch {
    /// The unmodified main.dol image.
    image: PathBuf,
    /// The descriptor document to apply.
    descriptors: PathBuf,
    /// Where to write the patched image. Not written at all if patching
    /// fails partway.
    #[structopt(short, long)]
    output: PathBuf,
    /// A JSON5 section table overriding the stock layout.
    #[structopt(long)]
    sections: Option<PathBuf>,
  },
  /// List the sounds of an audio archive.
  SarInfo {
    /// The archive to list.
    archive: PathBuf,
  },
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();
  if let Err(e) = run(Command::from_args()) {
    eprintln!("error: {}", e);
    process::exit(1);
  }
}

fn load_dol(sections: &Option<PathBuf>) -> Result<Dol> {
  match sections {
    Some(path) => {
      let text = fs::read_to_string(path)?;
      let sections: Vec<AddressSection> = json5::from_str(&text)
        .map_err(|_| Error::CorruptData { what: "section table document" })?;
      Dol::new(sections)
    }
    None => Dol::with_default_sections(),
  }
}

fn load_image(path: &Path) -> Result<Cursor<Vec<u8>>> {
  Ok(Cursor::new(fs::read(path)?))
}

fn run(cmd: Command) -> Result<()> {
  match cmd {
    Command::Info { image, sections } => {
      let dol = load_dol(&sections)?;
      let mut img = load_image(&image)?;
      println!(
        "{:<12} {:<8} {:<10} {:>5}",
        "table", "layout", "address", "rows"
      );
      for status in dol.report(&mut img)? {
        println!(
          "{:<12} {:<8} {:#010x} {:>5}",
          status.name, status.layout, status.table_addr, status.row_count
        );
      }
      let free = dol.free_space();
      println!(
        "free space: {} bytes total, largest block {} bytes",
        free.total_free_space(),
        free.largest_block()
      );
    }
    Command::Extract { image, output, sections } => {
      let dol = load_dol(&sections)?;
      let mut img = load_image(&image)?;
      let maps = dol.read_maps(&mut img)?;
      let text = json5::to_string(&maps)
        .map_err(|_| Error::CorruptData { what: "descriptor document" })?;
      fs::write(output, text)?;
      println!("extracted {} boards", maps.len());
    }
    Command::Patch { image, descriptors, output, sections } => {
      let mut dol = load_dol(&sections)?;
      let text = fs::read_to_string(descriptors)?;
      let maps: Vec<MapDescriptor> = json5::from_str(&text)
        .map_err(|_| Error::CorruptData { what: "descriptor document" })?;
      let mut img = load_image(&image)?;
      dol.patch(&mut img, &maps)?;
      fs::write(output, img.into_inner())?;
      println!("patched {} boards", maps.len());
    }
    Command::SarInfo { archive } => {
      let sar = SarFile::read(&mut load_image(&archive)?)?;
      println!(
        "{} names, {} sounds",
        sar.symb.names.len(),
        sar.info.sounds.len()
      );
      for (i, sound) in sar.info.sounds.iter().enumerate() {
        let name = sar
          .symb
          .names
          .get(sound.name_index as usize)
          .map(String::as_str)
          .unwrap_or("<unnamed>");
        println!("{:>5} {:?} {}", i, sound.kind, name);
      }
    }
  }
  Ok(())
}
