use std::{
    fmt,
    io::{self, Write},
};

use assert_into::AssertInto;
use log::debug;
use static_assertions::const_assert;
use thiserror::Error;
use zerocopy::{
    byteorder::little_endian::U32, FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

use crate::section::parse_int;

pub const UF2_MAGIC_START0: u32 = 0x0A324655;
pub const UF2_MAGIC_START1: u32 = 0x9E5D5157;
pub const UF2_MAGIC_END: u32 = 0x0AB16F30;

pub const UF2_FLAG_NOT_MAIN_FLASH: u32 = 0x00000001;
pub const UF2_FLAG_FILE_CONTAINER: u32 = 0x00001000;
pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x00002000;
pub const UF2_FLAG_MD5_PRESENT: u32 = 0x00004000;
pub const UF2_FLAG_EXTENSION_TAGS_PRESENT: u32 = 0x00008000;

/// Payload bytes carried by each block.
pub const UF2_PAYLOAD_SIZE: usize = 256;
pub const UF2_BLOCK_SIZE: usize = 512;

#[repr(C)]
#[derive(Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Uf2Block {
    // 32 byte header
    pub magic_start0: U32,
    pub magic_start1: U32,
    pub flags: U32,
    pub target_addr: U32,
    pub payload_size: U32,
    pub block_no: U32,
    pub num_blocks: U32,
    pub family_id: U32,
    pub data: [u8; UF2_PAYLOAD_SIZE],
    pub reserved: [u8; 476 - UF2_PAYLOAD_SIZE],
    pub magic_end: U32,
}

const_assert!(std::mem::size_of::<Uf2Block>() == UF2_BLOCK_SIZE);

// See https://github.com/microsoft/uf2/blob/master/utils/uf2families.json for list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum Family {
    /// Raspberry Pi RP2040
    RP2040 = 0xe48bff56,

    /// Raspberry Pi Microcontrollers: Absolute (unpartitioned) download
    RP2XXX_ABSOLUTE = 0xe48bff57,

    /// Raspberry Pi Microcontrollers: Data partition download
    RP2XXX_DATA = 0xe48bff58,

    /// Raspberry Pi RP2350, Secure Arm image
    RP2350_ARM_S = 0xe48bff59,

    /// Raspberry Pi RP2350, RISC-V image
    RP2350_RISCV = 0xe48bff5a,

    /// Raspberry Pi RP2350, Non-secure Arm image
    RP2350_ARM_NS = 0xe48bff5b,
}

impl Family {
    pub const ALL: [Family; 6] = [
        Family::RP2040,
        Family::RP2XXX_ABSOLUTE,
        Family::RP2XXX_DATA,
        Family::RP2350_ARM_S,
        Family::RP2350_RISCV,
        Family::RP2350_ARM_NS,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::RP2040 => "rp2040",
            Family::RP2XXX_ABSOLUTE => "absolute",
            Family::RP2XXX_DATA => "data",
            Family::RP2350_ARM_S => "rp2350_arm_s",
            Family::RP2350_RISCV => "rp2350_riscv",
            Family::RP2350_ARM_NS => "rp2350_arm_ns",
        }
    }

    pub fn find_by_name(name: &str) -> Option<Family> {
        Self::ALL
            .into_iter()
            .find(|family| family.name().eq_ignore_ascii_case(name))
    }
}

impl Default for Family {
    fn default() -> Self {
        Self::RP2040
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves a family given by name or as a 32-bit number.
pub fn parse_family_id(s: &str) -> Result<u32, Uf2Error> {
    if let Some(family) = Family::find_by_name(s) {
        return Ok(family.id());
    }
    parse_int(s)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| Uf2Error::BadFamily(s.to_string()))
}

#[derive(Error, Debug)]
pub enum Uf2Error {
    #[error("bad family ID: \"{0}\"")]
    BadFamily(String),
    #[error("the target address {0:#x} doesn't fit in 32 bits")]
    AddressTooLarge(u64),
    #[error("the image doesn't fit in 32-bit address space")]
    ImageTooLarge,
    #[error("failed to write to output: {0}")]
    FailedToWrite(#[from] io::Error),
}

/// Streams bytes into consecutive UF2 blocks.
///
/// The writer buffers up to one payload worth of bytes. The buffered tail is
/// only written by [`Uf2Writer::finish`], which is also the only way to get the
/// underlying sink back.
#[must_use = "the last block is only written by Uf2Writer::finish"]
pub struct Uf2Writer<W: Write> {
    output: W,
    block: Uf2Block,
    fill: usize,
}

impl<W: Write> Uf2Writer<W> {
    /// `size` is the total number of payload bytes that will be written and
    /// determines the block count stamped in every block.
    pub fn new(output: W, addr: u32, flags: u32, family_id: u32, size: usize) -> Self {
        let mut block = Uf2Block::new_zeroed();
        block.magic_start0 = U32::new(UF2_MAGIC_START0);
        block.magic_start1 = U32::new(UF2_MAGIC_START1);
        block.flags = U32::new(flags);
        block.target_addr = U32::new(addr);
        block.num_blocks = U32::new(size.div_ceil(UF2_PAYLOAD_SIZE).assert_into());
        block.family_id = U32::new(family_id);
        block.magic_end = U32::new(UF2_MAGIC_END);

        Self {
            output,
            block,
            fill: 0,
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        let block = &mut self.block;
        block.data[self.fill..].fill(0);
        block.payload_size = U32::new(self.fill.assert_into());

        debug!(
            "Block {} / {} {:#010x}",
            block.block_no.get(),
            block.num_blocks.get(),
            block.target_addr.get()
        );

        self.output.write_all(block.as_bytes())?;

        block.target_addr = U32::new(block.target_addr.get().wrapping_add(self.fill as u32));
        block.block_no = U32::new(block.block_no.get() + 1);
        self.fill = 0;
        Ok(())
    }

    /// Writes out the buffered tail block, zero padded, and returns the sink.
    pub fn finish(mut self) -> io::Result<W> {
        if self.fill != 0 {
            self.emit()?;
        }
        self.output.flush()?;
        Ok(self.output)
    }
}

impl<W: Write> Write for Uf2Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = (UF2_PAYLOAD_SIZE - self.fill).min(buf.len());
        self.block.data[self.fill..self.fill + n].copy_from_slice(&buf[..n]);
        self.fill += n;
        if self.fill == UF2_PAYLOAD_SIZE {
            self.emit()?;
        }
        Ok(n)
    }

    /// Flushes the sink only. A partially filled block stays buffered.
    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

/// Encodes a complete image that starts at `base_addr` into UF2 blocks.
pub fn write_uf2<W: Write>(
    output: W,
    base_addr: u64,
    family_id: u32,
    image: &[u8],
) -> Result<W, Uf2Error> {
    let addr = u32::try_from(base_addr).map_err(|_| Uf2Error::AddressTooLarge(base_addr))?;
    if base_addr + image.len() as u64 > 1 << 32 {
        return Err(Uf2Error::ImageTooLarge);
    }

    let mut writer = Uf2Writer::new(
        output,
        addr,
        UF2_FLAG_FAMILY_ID_PRESENT,
        family_id,
        image.len(),
    );
    writer.write_all(image)?;
    Ok(writer.finish()?)
}
