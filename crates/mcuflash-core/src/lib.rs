use std::io::{Read, Seek, Write};

use log::*;
use thiserror::Error;

pub mod dfu;
pub mod elf;
pub mod flatten;
pub mod hex;
pub mod hid;
pub mod picoboot;
pub mod reporter;
pub mod section;
pub mod targets;
pub mod uf2;
pub mod usb;

pub use crate::{
    flatten::{flatten, FlatImage, DEFAULT_PAD},
    reporter::{NoProgress, ProgressReporter},
    section::{Include, Section, Sections},
    targets::Target,
    uf2::Family,
};

use crate::{
    elf::{open_elf, read_sections, ElfError},
    flatten::FlattenError,
    hex::{write_sections_hex, HexError},
    section::{read_includes, SectionError},
    targets::LoadError,
    uf2::{write_uf2, Uf2Error},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Section(#[from] SectionError),
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error(transparent)]
    Flatten(#[from] FlattenError),
    #[error(transparent)]
    Hex(#[from] HexError),
    #[error(transparent)]
    Uf2(#[from] Uf2Error),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to write to output: {0}")]
    FailedToWrite(#[from] std::io::Error),
}

/// Reads the loadable sections of an ELF program and appends the raw
/// `includes` after them.
pub fn read_program(input: impl Read + Seek, includes: &[Include]) -> Result<Sections, Error> {
    let mut elf = open_elf(input)?;
    let mut sections = read_sections(&mut elf)?;
    sections.extend(read_includes(includes)?);
    debug!(
        "Read {} sections, {} bytes",
        sections.len(),
        sections.size()
    );
    Ok(sections)
}

/// Lays the program out as one contiguous image with gaps filled by `pad`.
pub fn build_image(
    input: impl Read + Seek,
    includes: &[Include],
    pad: u8,
) -> Result<FlatImage, Error> {
    let mut sections = read_program(input, includes)?;
    Ok(flatten(&mut sections, pad)?)
}

/// Converts an elf file into a raw binary image.
pub fn elf2bin(
    input: impl Read + Seek,
    includes: &[Include],
    pad: u8,
    output: impl Write,
) -> Result<FlatImage, Error> {
    let image = build_image(input, includes, pad)?;
    image.write_bin(output)?;
    Ok(image)
}

/// Converts an elf file into Intel HEX. Gaps between sections are not filled.
pub fn elf2hex(input: impl Read + Seek, includes: &[Include], output: impl Write) -> Result<(), Error> {
    let sections = read_program(input, includes)?;
    write_sections_hex(&sections, output)?;
    Ok(())
}

/// Converts an elf file into a uf2 file.
pub fn elf2uf2(
    input: impl Read + Seek,
    includes: &[Include],
    pad: u8,
    family_id: u32,
    output: impl Write,
) -> Result<FlatImage, Error> {
    let image = build_image(input, includes, pad)?;
    write_uf2(output, image.base_addr, family_id, &image.bytes)?;
    Ok(image)
}
