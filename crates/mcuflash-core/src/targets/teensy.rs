use log::info;

use super::LoadError;
use crate::{
    flatten::FlatImage, hid::HidBlockWriter, reporter::ProgressReporter, usb::UsbTransport,
};

/// Layout of the reports a HID bootloader accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HidProfile {
    pub vendor_id: u16,
    pub product_id: u16,
    pub header_len: usize,
    pub block_size: usize,
    /// Address the image must start at. Block offsets are relative to it.
    pub base: u64,
}

/// Teensy 4.x (i.MX RT1062) HalfKay bootloader.
pub const TEENSY4: HidProfile = HidProfile {
    vendor_id: 0x16c0,
    product_id: 0x0478,
    header_len: 64,
    block_size: 1024,
    base: 0x6000_0000,
};

/// Writes `image`, which must start at the profile base, and boots it.
pub fn load<T: UsbTransport>(
    writer: &mut HidBlockWriter<T>,
    profile: &HidProfile,
    image: FlatImage,
    pad: u8,
    progress: &mut dyn ProgressReporter,
) -> Result<(), LoadError> {
    if image.base_addr != profile.base {
        return Err(LoadError::BadLoadAddress {
            expected: profile.base,
            actual: image.base_addr,
        });
    }
    let sent = writer.write_image(&image.bytes, pad, progress)?;
    info!("Loaded {sent} blocks, booting");
    Ok(())
}

#[cfg(feature = "usb")]
pub fn connect(
    profile: &HidProfile,
    bus_addr: Option<crate::usb::BusAddr>,
) -> Result<HidBlockWriter<crate::usb::nusb::NusbTransport>, LoadError> {
    use crate::usb::{nusb::open_devices, select_single};

    let device = select_single(
        open_devices(profile.vendor_id, profile.product_id, bus_addr)?,
        "bootloader",
    )?;
    let transport = device.claim(0, 0)?;
    info!("Found HID bootloader at {}", device.info.bus_addr());
    Ok(HidBlockWriter::new(
        transport,
        profile.header_len,
        profile.block_size,
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{reporter::NoProgress, usb::mock::MockTransport};

    #[test]
    fn image_must_start_at_base() {
        let mut mock = MockTransport::default();
        let mut writer = HidBlockWriter::new(&mut mock, 64, 1024);
        let image = FlatImage {
            base_addr: 0x6000_1000,
            bytes: vec![0; 16],
        };
        let err = load(&mut writer, &TEENSY4, image, 0xff, &mut NoProgress).unwrap_err();
        assert_eq!(
            err.to_string(),
            "the load address must be 0x60000000, got 0x60001000"
        );
    }

    #[test]
    fn loads_and_boots() {
        let mut mock = MockTransport::default();
        {
            let mut writer =
                HidBlockWriter::new(&mut mock, 64, 1024).with_retries(1, Duration::ZERO);
            let image = FlatImage {
                base_addr: 0x6000_0000,
                bytes: vec![0x11; 2048 + 1],
            };
            load(&mut writer, &TEENSY4, image, 0xff, &mut NoProgress).unwrap();
        }
        let outs = mock.control_outs();
        assert_eq!(outs.len(), 4);
        assert_eq!(outs[2].1[64], 0x11);
        assert_eq!(outs[2].1[65], 0xff);
        assert_eq!(outs[3].1[..3], [0xff, 0xff, 0xff]);
    }
}
