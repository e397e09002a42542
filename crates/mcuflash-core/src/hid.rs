//! Block writer for bootloaders that take firmware as HID output reports.
//!
//! Each report is a header whose first three bytes hold the little-endian
//! offset of the block, followed by the block payload.

use std::{thread, time::Duration};

use log::{debug, trace};
use thiserror::Error;

use crate::{
    reporter::ProgressReporter,
    usb::{ControlRequest, Recipient, RequestType, UsbError, UsbTransport},
};

const HID_SET_REPORT: u8 = 0x09;
/// Output report, id 0
const HID_REPORT_OUTPUT: u16 = 0x0200;

/// Offset that makes the bootloader start the loaded program.
pub const BOOT_OFFSET: u32 = 0xff_ffff;

pub const DEFAULT_RETRIES: usize = 500;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum HidError {
    #[error("hid: writing block at {offset:#08x}: {source}")]
    Write { offset: u32, source: UsbError },
    #[error("hid: block offset {0:#x} doesn't fit in 24 bits")]
    OffsetTooLarge(usize),
    #[error("hid: {len} byte payload doesn't fit in a {block_size} byte block")]
    PayloadTooLarge { len: usize, block_size: usize },
}

pub struct HidBlockWriter<T: UsbTransport> {
    transport: T,
    header_len: usize,
    block_size: usize,
    retries: usize,
    retry_delay: Duration,
    report: Vec<u8>,
}

impl<T: UsbTransport> HidBlockWriter<T> {
    pub fn new(transport: T, header_len: usize, block_size: usize) -> Self {
        Self {
            transport,
            header_len: header_len.max(3),
            block_size,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            report: Vec::new(),
        }
    }

    pub fn with_retries(mut self, retries: usize, retry_delay: Duration) -> Self {
        self.retries = retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn send(&mut self, offset: u32) -> Result<(), HidError> {
        let request = ControlRequest {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request: HID_SET_REPORT,
            value: HID_REPORT_OUTPUT,
            index: 0,
        };

        let mut attempt = 1;
        loop {
            match self.transport.control_out(request, &self.report) {
                Ok(_) => return Ok(()),
                Err(source) if attempt >= self.retries => {
                    return Err(HidError::Write { offset, source });
                }
                Err(e) => {
                    trace!("Block {offset:#08x} attempt {attempt} failed: {e}");
                    attempt += 1;
                    thread::sleep(self.retry_delay);
                }
            }
        }
    }

    /// Sends one block. A short payload is zero filled to the block size.
    pub fn write_block(&mut self, offset: u32, payload: &[u8]) -> Result<(), HidError> {
        if offset > BOOT_OFFSET {
            return Err(HidError::OffsetTooLarge(offset as usize));
        }
        if payload.len() > self.block_size {
            return Err(HidError::PayloadTooLarge {
                len: payload.len(),
                block_size: self.block_size,
            });
        }

        self.report.clear();
        self.report.resize(self.header_len + self.block_size, 0);
        self.report[..3].copy_from_slice(&offset.to_le_bytes()[..3]);
        self.report[self.header_len..self.header_len + payload.len()].copy_from_slice(payload);
        self.send(offset)
    }

    /// Tells the bootloader to run the loaded program.
    pub fn boot(&mut self) -> Result<(), HidError> {
        debug!("Sending boot command");
        self.write_block(BOOT_OFFSET, &[])
    }

    /// Writes a whole image, which starts at offset zero, then boots it.
    ///
    /// The tail block is filled with `pad`. Blocks made only of `pad` are
    /// skipped, except the first and the last one. Returns the number of
    /// blocks sent, not counting the boot command.
    pub fn write_image(
        &mut self,
        image: &[u8],
        pad: u8,
        progress: &mut dyn ProgressReporter,
    ) -> Result<usize, HidError> {
        let block_size = self.block_size;
        let total = image.len().div_ceil(block_size);
        if total * block_size > BOOT_OFFSET as usize {
            return Err(HidError::OffsetTooLarge(total * block_size));
        }

        progress.start("Loading", (total * block_size) as u64);
        let mut block = vec![pad; block_size];
        let mut sent = 0;

        for (i, chunk) in image.chunks(block_size).enumerate() {
            block[..chunk.len()].copy_from_slice(chunk);
            block[chunk.len()..].fill(pad);

            let edge = i == 0 || i + 1 == total;
            if edge || block.iter().any(|&b| b != pad) {
                let offset = (i * block_size) as u32;
                trace!("Block {i} at {offset:#08x}");
                let payload = std::mem::take(&mut block);
                let result = self.write_block(offset, &payload);
                block = payload;
                result?;
                sent += 1;
            }
            progress.advance(block_size as u64);
        }
        progress.finish();

        debug!("Sent {sent} of {total} blocks");
        self.boot()?;
        Ok(sent)
    }
}
