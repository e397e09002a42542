use std::io::{Read, Seek};

use elf::{
    abi::{PT_LOAD, SHF_ALLOC, SHT_PROGBITS},
    endian::{AnyEndian, EndianParse},
    section::SectionHeader,
    segment::ProgramHeader,
    ElfStream, ParseError,
};
use log::{debug, warn};
use thiserror::Error;

use crate::section::{Section, Sections};

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("failed to open elf file: {0}")]
    FailedToOpenElfFile(ParseError),
    #[error("failed to read section headers: {0}")]
    FailedToReadSectionHeaders(ParseError),
    #[error("failed to read section '{0}': {1}")]
    FailedToReadSection(String, ParseError),
    #[error("section '{0}' is compressed")]
    CompressedSection(String),
    #[error("failed to read symbol table: {0}")]
    FailedToReadSymbols(ParseError),
}

pub fn open_elf<T: Read + Seek>(input: T) -> Result<ElfStream<AnyEndian, T>, ElfError> {
    ElfStream::<AnyEndian, _>::open_stream(input).map_err(ElfError::FailedToOpenElfFile)
}

fn is_loadable(shdr: &SectionHeader) -> bool {
    shdr.sh_type == SHT_PROGBITS && shdr.sh_flags & (SHF_ALLOC as u64) != 0
}

/// Physical address of a section, taken from the load segment that contains
/// its file offset. The section header alone only knows the virtual address.
fn physical_address(segments: &[ProgramHeader], shdr: &SectionHeader) -> Option<u64> {
    segments
        .iter()
        .find(|p| {
            p.p_type == PT_LOAD
                && p.p_offset <= shdr.sh_offset
                && shdr.sh_offset < p.p_offset + p.p_filesz
        })
        .map(|p| p.p_paddr + shdr.sh_offset - p.p_offset)
}

/// Reads the loadable sections of the program. The order of the returned
/// sections is unspecified.
pub fn read_sections<E: EndianParse, S: Read + Seek>(
    elf: &mut ElfStream<E, S>,
) -> Result<Sections, ElfError> {
    let segments = elf.segments().clone();

    let headers: Vec<(SectionHeader, String)> = {
        let (shdrs, strtab) = elf
            .section_headers_with_strtab()
            .map_err(ElfError::FailedToReadSectionHeaders)?;
        shdrs
            .iter()
            .map(|shdr| {
                let name = strtab
                    .as_ref()
                    .and_then(|strtab| strtab.get(shdr.sh_name as usize).ok())
                    .unwrap_or("")
                    .to_string();
                (*shdr, name)
            })
            .collect()
    };

    let mut sections = Sections::new();

    for (i, (shdr, name)) in headers.iter().enumerate() {
        if !is_loadable(shdr) {
            // Non-loadable sections between loadable ones usually point at a
            // linker script problem
            let next_loadable = headers.get(i + 1).is_some_and(|(next, _)| is_loadable(next));
            if next_loadable && !sections.is_empty() && shdr.sh_size > 0 {
                warn!("Skipping section '{}' ({} bytes)", name, shdr.sh_size);
            }
            continue;
        }

        let (data, compression) = elf
            .section_data(shdr)
            .map_err(|err| ElfError::FailedToReadSection(name.clone(), err))?;
        if compression.is_some() {
            return Err(ElfError::CompressedSection(name.clone()));
        }
        if data.is_empty() {
            continue;
        }

        let paddr = match physical_address(&segments, shdr) {
            Some(paddr) => paddr,
            None => {
                warn!(
                    "Section '{}' is not covered by a load segment, using its virtual address",
                    name
                );
                shdr.sh_addr
            }
        };

        debug!(
            "Section '{}' vaddr {:#010x} paddr {:#010x} offset {:#x} ({} bytes)",
            name,
            shdr.sh_addr,
            paddr,
            shdr.sh_offset,
            data.len()
        );

        sections.push(Section {
            vaddr: shdr.sh_addr,
            paddr,
            file_offset: shdr.sh_offset,
            data: data.to_vec(),
        });
    }

    Ok(sections)
}

/// Whether the symbol table defines `name`.
pub fn has_symbol<E: EndianParse, S: Read + Seek>(
    elf: &mut ElfStream<E, S>,
    name: &str,
) -> Result<bool, ElfError> {
    let (symtab, strtab) = match elf
        .symbol_table()
        .map_err(ElfError::FailedToReadSymbols)?
    {
        Some(tables) => tables,
        None => return Ok(false),
    };

    Ok(symtab
        .iter()
        .any(|sym| matches!(strtab.get(sym.st_name as usize), Ok(n) if n == name)))
}
