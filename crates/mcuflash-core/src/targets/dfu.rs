use log::{debug, info};

use super::LoadError;
use crate::{
    dfu::DfuConnection, flatten::FlatImage, reporter::ProgressReporter, usb::UsbTransport,
};

/// How a DFU bootloader expects an image to be downloaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuProfile {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Block number of the first image block
    pub first_block: u16,
    pub block_size: usize,
    /// Divides the poll timeout requested by a busy device
    pub poll_speed: u32,
    /// Sent as block 0 before the image, if set
    pub mass_erase: Option<&'static [u8]>,
    pub expected_base: Option<u64>,
    /// Whether a failure of the closing empty download is tolerated
    pub ignore_final_error: bool,
}

/// STM32 system memory bootloader (DfuSe).
pub const STM32: DfuProfile = DfuProfile {
    vendor_id: 0x0483,
    product_id: 0xdf11,
    first_block: 2,
    // TODO: read wTransferSize from the DFU functional descriptor, 2048 byte
    // blocks are rejected by the transfer path used here
    block_size: 1024,
    poll_speed: 64,
    mass_erase: Some(&[0x41]),
    expected_base: Some(0x0800_0000),
    ignore_final_error: true,
};

/// Downloads `image` block by block and finishes with an empty download,
/// which makes the device leave DFU mode.
pub fn load<T: UsbTransport>(
    conn: &mut DfuConnection<T>,
    profile: &DfuProfile,
    image: &FlatImage,
    progress: &mut dyn ProgressReporter,
) -> Result<(), LoadError> {
    if let Some(expected) = profile.expected_base {
        if image.base_addr != expected {
            return Err(LoadError::BadLoadAddress {
                expected,
                actual: image.base_addr,
            });
        }
    }

    let blocks = image.len().div_ceil(profile.block_size);
    // the closing download needs a block number too
    if profile.first_block as usize + blocks > u16::MAX as usize {
        return Err(LoadError::ImageTooLarge(image.len()));
    }

    if let Some(command) = profile.mass_erase {
        info!("Erasing flash");
        conn.download(0, command)?;
    }

    progress.start("Loading", image.len() as u64);
    let mut block = profile.first_block;
    for chunk in image.bytes.chunks(profile.block_size) {
        conn.download(block, chunk)?;
        progress.advance(chunk.len() as u64);
        block += 1;
    }
    progress.finish();

    match conn.download(block, &[]) {
        Err(e) if profile.ignore_final_error => {
            debug!("Ignoring error of the final download: {e}");
            Ok(())
        }
        result => Ok(result?),
    }
}
