//! Supported targets and the sequences that flash them.

use std::{
    fmt,
    io::{Read, Seek},
    str::FromStr,
};

use ::elf::{endian::EndianParse, ElfStream};
use thiserror::Error;

use crate::{
    dfu::DfuError,
    elf::{has_symbol, ElfError},
    hid::HidError,
    picoboot::PicobootError,
    usb::DiscoveryError,
};

pub mod dfu;
pub mod pico;
pub mod teensy;

/// ELF symbol that marks a program built for the Pico.
pub const PICO_META_SYMBOL: &str = "picometa";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// RP2350 via USB PICOBOOT
    Pico,
    /// Teensy 4.x via the HID bootloader
    Teensy,
    /// STM32 via the USB DFU bootloader
    Stm32,
}

impl Target {
    pub const ALL: [Target; 3] = [Target::Pico, Target::Teensy, Target::Stm32];

    pub fn name(self) -> &'static str {
        match self {
            Target::Pico => "pico",
            Target::Teensy => "teensy",
            Target::Stm32 => "stm32",
        }
    }

    pub fn find_by_name(name: &str) -> Option<Target> {
        Self::ALL
            .into_iter()
            .find(|target| target.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Target {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::find_by_name(s).ok_or_else(|| LoadError::UnknownTarget(s.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error("cannot determine the target by reading {0}")]
    CannotDetect(String),
    #[error("unsupported device type: {name} ({id:#x})")]
    UnsupportedChip { name: &'static str, id: u32 },
    #[error("picoboot: GetInfo: UF2TargetPartition: bad response")]
    BadPartitionInfo,
    #[error("the load address must be {expected:#010x}, got {actual:#010x}")]
    BadLoadAddress { expected: u64, actual: u64 },
    #[error("the image ({size} bytes) doesn't fit in the target partition ({capacity} bytes)")]
    PartitionTooSmall { size: usize, capacity: usize },
    #[error("the image ({0} bytes) is too large for the target")]
    ImageTooLarge(usize),
    #[error(transparent)]
    Picoboot(#[from] PicobootError),
    #[error(transparent)]
    Dfu(#[from] DfuError),
    #[error(transparent)]
    Hid(#[from] HidError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Elf(#[from] ElfError),
}

/// Picks the target a program was built for. `source` names the ELF file in
/// the error.
pub fn detect_target<E: EndianParse, S: Read + Seek>(
    elf: &mut ElfStream<E, S>,
    source: &str,
) -> Result<Target, LoadError> {
    if has_symbol(elf, PICO_META_SYMBOL)? {
        return Ok(Target::Pico);
    }
    Err(LoadError::CannotDetect(source.to_string()))
}

#[cfg(feature = "usb")]
pub use self::flash::flash;

#[cfg(feature = "usb")]
mod flash {
    use log::info;

    use super::{dfu, pico, teensy, LoadError, Target};
    use crate::{flatten::FlatImage, reporter::ProgressReporter, usb::BusAddr};

    /// Finds the target's bootloader on the bus and writes `image` to it.
    pub fn flash(
        target: Target,
        image: FlatImage,
        pad: u8,
        bus_addr: Option<BusAddr>,
        progress: &mut dyn ProgressReporter,
    ) -> Result<(), LoadError> {
        info!("Loading {} bytes at {:#010x} onto {target}", image.len(), image.base_addr);
        match target {
            Target::Pico => {
                let mut conn = crate::picoboot::connect(bus_addr)?;
                pico::load(&mut conn, image, pad, progress)
            }
            Target::Teensy => {
                let profile = &teensy::TEENSY4;
                let mut writer = teensy::connect(profile, bus_addr)?;
                teensy::load(&mut writer, profile, image, pad, progress)
            }
            Target::Stm32 => {
                let profile = &dfu::STM32;
                let mut conn = crate::dfu::connect(
                    profile.vendor_id,
                    profile.product_id,
                    bus_addr,
                    profile.poll_speed,
                )?;
                dfu::load(&mut conn, profile, &image, progress)
            }
        }
    }
}
