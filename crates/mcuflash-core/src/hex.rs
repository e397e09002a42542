use std::{collections::BTreeMap, io::Write};

use ihex::Record;
use thiserror::Error;

use crate::section::Sections;

/// Data bytes per Intel-HEX data record.
pub const HEX_RECORD_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum HexError {
    #[error("data at {addr:#010x} ({len} bytes) overlaps already inserted data")]
    Overlap { addr: u32, len: usize },
    #[error("data at {0:#x} doesn't fit in 32-bit address space")]
    AddressTooLarge(u64),
    #[error("failed to encode Intel HEX: {0}")]
    Encode(#[from] ihex::WriterError),
    #[error("failed to write to output: {0}")]
    FailedToWrite(#[from] std::io::Error),
}

/// Sparse memory image keyed by absolute address. Adjacent runs are merged so
/// records are laid out across section boundaries.
#[derive(Debug, Default)]
pub struct HexMemory {
    runs: BTreeMap<u32, Vec<u8>>,
}

impl HexMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: u32, data: &[u8]) -> Result<(), HexError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = addr as u64 + data.len() as u64;
        if end > 1 << 32 {
            return Err(HexError::AddressTooLarge(addr as u64));
        }

        let overlap = |start: u32, len: usize| {
            let run_end = start as u64 + len as u64;
            (start as u64) < end && (addr as u64) < run_end
        };
        if let Some((&start, run)) = self.runs.range(..=addr).next_back() {
            if overlap(start, run.len()) {
                return Err(HexError::Overlap {
                    addr,
                    len: data.len(),
                });
            }
        }
        if let Some((&start, run)) = self.runs.range(addr..).next() {
            if overlap(start, run.len()) {
                return Err(HexError::Overlap {
                    addr,
                    len: data.len(),
                });
            }
        }

        // Merge with the run that ends right where this one starts
        let mut start = addr;
        let mut bytes = match self.runs.range(..addr).next_back() {
            Some((&prev, run)) if prev as u64 + run.len() as u64 == addr as u64 => {
                start = prev;
                self.runs.remove(&prev).unwrap_or_default()
            }
            _ => Vec::with_capacity(data.len()),
        };
        bytes.extend_from_slice(data);

        if end < 1 << 32 {
            if let Some(next) = self.runs.remove(&(end as u32)) {
                bytes.extend_from_slice(&next);
            }
        }
        self.runs.insert(start, bytes);
        Ok(())
    }

    /// Builds the Intel-HEX record list, ending with the end-of-file record.
    pub fn records(&self, record_len: usize) -> Vec<Record> {
        let mut records = Vec::new();
        let mut upper: u16 = 0;

        for (&start, run) in &self.runs {
            let mut addr = start as u64;
            let mut rest = run.as_slice();
            while !rest.is_empty() {
                let hi = (addr >> 16) as u16;
                if hi != upper {
                    records.push(Record::ExtendedLinearAddress(hi));
                    upper = hi;
                }
                // Records never cross a 64 KiB boundary
                let to_boundary = 0x1_0000 - (addr & 0xffff) as usize;
                let n = record_len.min(to_boundary).min(rest.len());
                records.push(Record::Data {
                    offset: addr as u16,
                    value: rest[..n].to_vec(),
                });
                addr += n as u64;
                rest = &rest[n..];
            }
        }
        records.push(Record::EndOfFile);
        records
    }

    pub fn write_hex(&self, mut output: impl Write, record_len: usize) -> Result<(), HexError> {
        let text = ihex::create_object_file_representation(&self.records(record_len))?;
        output.write_all(text.as_bytes())?;
        output.flush()?;
        Ok(())
    }
}

/// Places every section at its physical address and writes the result as
/// Intel-HEX. Gaps between sections are left out rather than padded.
pub fn write_sections_hex(sections: &Sections, output: impl Write) -> Result<(), HexError> {
    let mut memory = HexMemory::new();
    for section in sections {
        let addr =
            u32::try_from(section.paddr).map_err(|_| HexError::AddressTooLarge(section.paddr))?;
        memory.insert(addr, &section.data)?;
    }
    memory.write_hex(output, HEX_RECORD_LEN)
}
