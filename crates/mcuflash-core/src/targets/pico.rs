use std::time::Duration;

use log::{debug, info};

use super::LoadError;
use crate::{
    flatten::FlatImage,
    picoboot::{PicobootConnection, RebootType, INFO_UF2_TARGET_PARTITION},
    reporter::ProgressReporter,
    uf2::Family,
    usb::UsbTransport,
};

pub const FLASH_BASE: u64 = 0x1000_0000;
pub const SECTOR_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = 256;

const CHIP_ID_ADDR: u32 = 0x10;
const CHIP_ID_RP2040: u32 = 0x01754d;
const CHIP_ID_RP2350: u32 = 0x02754d;

const SECTOR_MASK: u32 = 0x1fff;
/// Last sector of a partition that spans the whole flash
const WHOLE_FLASH_LAST: u32 = 8191;

const REBOOT_DELAY: Duration = Duration::from_millis(500);

/// Sectors of the partition the bootloader would write a UF2 image to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TargetPartition {
    pub first_sector: u32,
    pub last_sector: u32,
}

impl TargetPartition {
    pub fn from_location(word: u32) -> Self {
        Self {
            first_sector: word & SECTOR_MASK,
            last_sector: word >> 13 & SECTOR_MASK,
        }
    }

    pub fn is_whole_flash(&self) -> bool {
        self.first_sector == 0 && self.last_sector == WHOLE_FLASH_LAST
    }

    pub fn size(&self) -> usize {
        (self.last_sector.saturating_sub(self.first_sector) as usize + 1) * SECTOR_SIZE
    }

    pub fn start_addr(&self) -> u64 {
        FLASH_BASE + self.first_sector as u64 * SECTOR_SIZE as u64
    }
}

fn chip_id<T: UsbTransport>(conn: &mut PicobootConnection<T>) -> Result<u32, LoadError> {
    let mut buf = [0u8; 4];
    conn.set_read_addr(CHIP_ID_ADDR);
    conn.read(&mut buf)?;
    Ok(u32::from_le_bytes(buf) & 0xff_ffff)
}

fn target_partition<T: UsbTransport>(
    conn: &mut PicobootConnection<T>,
    family_id: u32,
) -> Result<TargetPartition, LoadError> {
    let mut info = [0u32; 4];
    conn.get_info(&mut info, &[INFO_UF2_TARGET_PARTITION, family_id])?;
    if info[0] != 3 {
        return Err(LoadError::BadPartitionInfo);
    }
    Ok(TargetPartition::from_location(info[2]))
}

/// Writes `image` into the UF2 target partition of an RP2350 and reboots it.
///
/// The image has to start at the beginning of flash. It is padded to whole
/// sectors; each sector is erased and then written page by page.
pub fn load<T: UsbTransport>(
    conn: &mut PicobootConnection<T>,
    mut image: FlatImage,
    pad: u8,
    progress: &mut dyn ProgressReporter,
) -> Result<(), LoadError> {
    if image.base_addr != FLASH_BASE {
        return Err(LoadError::BadLoadAddress {
            expected: FLASH_BASE,
            actual: image.base_addr,
        });
    }

    conn.exclusive_access(true)?;

    match chip_id(conn)? {
        CHIP_ID_RP2350 => info!("Found RP2350"),
        CHIP_ID_RP2040 => {
            return Err(LoadError::UnsupportedChip {
                name: "RP2040",
                id: CHIP_ID_RP2040,
            })
        }
        id => return Err(LoadError::UnsupportedChip { name: "unknown", id }),
    }

    // Only rp2350_arm_s images are supported
    let partition = target_partition(conn, Family::RP2350_ARM_S.id())?;
    debug!(
        "Target partition: sectors {}..={}",
        partition.first_sector, partition.last_sector
    );

    image.pad_to(SECTOR_SIZE, pad);

    if partition.is_whole_flash() {
        info!("Target partition spans the whole flash");
    } else if image.len() > partition.size() {
        return Err(LoadError::PartitionTooSmall {
            size: image.len(),
            capacity: partition.size(),
        });
    }

    let start = partition.start_addr();
    if start + image.len() as u64 > 1 << 32 {
        return Err(LoadError::ImageTooLarge(image.len()));
    }
    conn.set_write_addr(start as u32);

    conn.exit_xip()?;

    progress.start("Loading", image.len() as u64);
    for sector in image.bytes.chunks(SECTOR_SIZE) {
        let sector_addr = conn.write_addr();
        debug!("Erasing sector at {sector_addr:#010x}");
        conn.flash_erase(sector_addr, SECTOR_SIZE as u32)?;

        for page in sector.chunks(PAGE_SIZE) {
            conn.write(page)?;
            progress.advance(page.len() as u64);
        }
    }
    progress.finish();

    info!("Rebooting");
    conn.reboot2(RebootType::Normal, 0, REBOOT_DELAY, 0, 0)?;
    Ok(())
}
