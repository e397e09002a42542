//! Real USB access through `nusb`.

use std::time::Duration;

use futures_lite::future::block_on;
use log::{debug, warn};
use nusb::{
    descriptors::language_id::US_ENGLISH,
    transfer::{ControlIn, ControlOut, ControlType, EndpointType, RequestBuffer, TransferError},
    Device, Interface,
};

use super::{
    BusAddr, ControlRequest, Direction, DiscoveryError, Recipient, RequestType, UsbAltSetting,
    UsbDevice, UsbEndpoint, UsbError, UsbTransport,
};

const STRING_TIMEOUT: Duration = Duration::from_millis(500);

impl From<TransferError> for UsbError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Stall => UsbError::Stall,
            TransferError::Disconnected => UsbError::Disconnected,
            TransferError::Cancelled => UsbError::Timeout,
            other => UsbError::Transfer(other.to_string()),
        }
    }
}

impl From<nusb::Error> for DiscoveryError {
    fn from(e: nusb::Error) -> Self {
        DiscoveryError::Usb(UsbError::Io(e))
    }
}

fn control_type(request_type: RequestType) -> ControlType {
    match request_type {
        RequestType::Standard => ControlType::Standard,
        RequestType::Class => ControlType::Class,
        RequestType::Vendor => ControlType::Vendor,
    }
}

fn recipient(recipient: Recipient) -> nusb::transfer::Recipient {
    match recipient {
        Recipient::Device => nusb::transfer::Recipient::Device,
        Recipient::Interface => nusb::transfer::Recipient::Interface,
        Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
        Recipient::Other => nusb::transfer::Recipient::Other,
    }
}

/// A claimed interface of an opened device.
pub struct NusbTransport {
    interface: Interface,
}

impl UsbTransport for NusbTransport {
    fn control_in(&mut self, request: ControlRequest, buf: &mut [u8]) -> Result<usize, UsbError> {
        let length = u16::try_from(buf.len())
            .map_err(|_| UsbError::Transfer("control transfer too long".to_string()))?;
        let data = block_on(self.interface.control_in(ControlIn {
            control_type: control_type(request.request_type),
            recipient: recipient(request.recipient),
            request: request.request,
            value: request.value,
            index: request.index,
            length,
        }))
        .into_result()?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn control_out(&mut self, request: ControlRequest, data: &[u8]) -> Result<usize, UsbError> {
        let completion = block_on(self.interface.control_out(ControlOut {
            control_type: control_type(request.request_type),
            recipient: recipient(request.recipient),
            request: request.request,
            value: request.value,
            index: request.index,
            data,
        }));
        completion.status?;
        Ok(data.len())
    }

    fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError> {
        let response = block_on(self.interface.bulk_out(endpoint, data.to_vec())).into_result()?;
        Ok(response.actual_length())
    }

    fn bulk_in(&mut self, endpoint: u8, len: usize) -> Result<Vec<u8>, UsbError> {
        Ok(block_on(self.interface.bulk_in(endpoint, RequestBuffer::new(len))).into_result()?)
    }
}

/// An opened device together with what its active configuration advertises.
pub struct OpenDevice {
    pub device: Device,
    pub info: UsbDevice,
}

impl OpenDevice {
    /// Claims `interface`, detaching a kernel driver if one is bound, and
    /// selects `alt` when it isn't the default setting.
    pub fn claim(&self, interface: u8, alt: u8) -> Result<NusbTransport, DiscoveryError> {
        let claimed = self.device.detach_and_claim_interface(interface)?;
        if alt != 0 {
            claimed.set_alt_setting(alt)?;
        }
        Ok(NusbTransport { interface: claimed })
    }
}

fn string_descriptor(device: &Device, index: Option<u8>) -> Option<String> {
    // index 0 means the setting has no name
    let index = index.filter(|&i| i != 0)?;
    match device.get_string_descriptor(index, US_ENGLISH, STRING_TIMEOUT) {
        Ok(s) => Some(s),
        Err(e) => {
            debug!("Failed to read string descriptor {index}: {e}");
            None
        }
    }
}

fn describe(device: &Device, here: BusAddr, vendor_id: u16, product_id: u16) -> UsbDevice {
    let mut info = UsbDevice {
        bus_number: here.bus,
        address: here.address,
        vendor_id,
        product_id,
        alt_settings: Vec::new(),
    };

    let config = match device.active_configuration() {
        Ok(config) => config,
        Err(e) => {
            warn!("Device {} has no active configuration: {e}", info.bus_addr());
            return info;
        }
    };

    for alt in config.interface_alt_settings() {
        info.alt_settings.push(UsbAltSetting {
            interface: alt.interface_number(),
            alt: alt.alternate_setting(),
            class: alt.class(),
            subclass: alt.subclass(),
            protocol: alt.protocol(),
            endpoints: alt
                .endpoints()
                .map(|ep| UsbEndpoint {
                    address: ep.address(),
                    direction: match ep.direction() {
                        nusb::transfer::Direction::In => Direction::In,
                        nusb::transfer::Direction::Out => Direction::Out,
                    },
                    bulk: ep.transfer_type() == EndpointType::Bulk,
                })
                .collect(),
            name: string_descriptor(device, alt.string_index()),
        });
    }
    info
}

/// Opens every device with the given IDs, optionally narrowed to one bus
/// address. Devices that fail to open are skipped with a warning.
pub fn open_devices(
    vendor_id: u16,
    product_id: u16,
    bus_addr: Option<BusAddr>,
) -> Result<Vec<OpenDevice>, DiscoveryError> {
    let mut found = Vec::new();

    for dev_info in nusb::list_devices()? {
        let here = BusAddr {
            bus: dev_info.bus_number(),
            address: dev_info.device_address(),
        };
        if dev_info.vendor_id() != vendor_id
            || dev_info.product_id() != product_id
            || bus_addr.is_some_and(|b| b != here)
        {
            continue;
        }

        let device = match dev_info.open() {
            Ok(device) => device,
            Err(e) => {
                warn!("Failed to open USB device {here}: {e}");
                continue;
            }
        };
        debug!("Found {vendor_id:04x}:{product_id:04x} at {here}");

        let info = describe(&device, here, vendor_id, product_id);
        found.push(OpenDevice { device, info });
    }

    Ok(found)
}
