//! USB transport seam and device selection.
//!
//! The protocol clients only talk to a [`UsbTransport`]. The `nusb` backend
//! provides the real one; device selection works on plain [`UsbDevice`]
//! descriptions so the matching rules don't depend on a live bus.

use std::{fmt, str::FromStr};

use thiserror::Error;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "usb")]
pub mod nusb;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup packet of a control transfer, direction given by the call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

#[derive(Error, Debug)]
pub enum UsbError {
    #[error("endpoint stalled")]
    Stall,
    #[error("device disconnected")]
    Disconnected,
    #[error("transfer timed out")]
    Timeout,
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Blocking USB transfers on one claimed interface.
pub trait UsbTransport {
    fn control_in(&mut self, request: ControlRequest, buf: &mut [u8]) -> Result<usize, UsbError>;

    fn control_out(&mut self, request: ControlRequest, data: &[u8]) -> Result<usize, UsbError>;

    fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError>;

    /// Reads up to `len` bytes. `len == 0` waits for a zero length packet.
    fn bulk_in(&mut self, endpoint: u8, len: usize) -> Result<Vec<u8>, UsbError>;
}

impl<T: UsbTransport + ?Sized> UsbTransport for &mut T {
    fn control_in(&mut self, request: ControlRequest, buf: &mut [u8]) -> Result<usize, UsbError> {
        (**self).control_in(request, buf)
    }

    fn control_out(&mut self, request: ControlRequest, data: &[u8]) -> Result<usize, UsbError> {
        (**self).control_out(request, data)
    }

    fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError> {
        (**self).bulk_out(endpoint, data)
    }

    fn bulk_in(&mut self, endpoint: u8, len: usize) -> Result<Vec<u8>, UsbError> {
        (**self).bulk_in(endpoint, len)
    }
}

/// Location of a device on the bus, written `BUS:ADDR` in decimal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusAddr {
    pub bus: u8,
    pub address: u8,
}

impl FromStr for BusAddr {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DiscoveryError::BadBusAddr(s.to_string());
        let (bus, address) = s.split_once(':').ok_or_else(bad)?;
        Ok(Self {
            bus: bus.parse().map_err(|_| bad())?,
            address: address.parse().map_err(|_| bad())?,
        })
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.address)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbEndpoint {
    pub address: u8,
    pub direction: Direction,
    pub bulk: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsbAltSetting {
    pub interface: u8,
    pub alt: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<UsbEndpoint>,
    /// Interface string, when the device provides one
    pub name: Option<String>,
}

impl UsbAltSetting {
    pub fn is_class(&self, class: (u8, u8, u8)) -> bool {
        (self.class, self.subclass, self.protocol) == class
    }
}

/// This is the usb device information gathered from the active configuration
/// of a device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsbDevice {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub alt_settings: Vec<UsbAltSetting>,
}

impl UsbDevice {
    pub fn bus_addr(&self) -> BusAddr {
        BusAddr {
            bus: self.bus_number,
            address: self.address,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16, bus_addr: Option<BusAddr>) -> bool {
        self.vendor_id == vendor_id
            && self.product_id == product_id
            && bus_addr.map_or(true, |b| b == self.bus_addr())
    }
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("bad USB device address: {0}")]
    BadBusAddr(String),
    #[error("no USB devices in {0} mode were found")]
    NoDevice(&'static str),
    #[error("found more than one USB device in {0} mode")]
    AmbiguousDevice(&'static str),
    #[error("the found device {0} doesn't provide the expected interface")]
    NoInterface(BusAddr),
    #[error("want exactly two USB bulk endpoints, found {0}")]
    EndpointCount(usize),
    #[error("no USB IN endpoint in the USB interface")]
    MissingInEndpoint,
    #[error("no USB OUT endpoint in the USB interface")]
    MissingOutEndpoint,
    #[error("device {0} has no DFU alternate setting for flash")]
    NoFlashAltSetting(BusAddr),
    #[error("device {0} has more than one valid DFU configuration")]
    AmbiguousAltSetting(BusAddr),
    #[error(transparent)]
    Usb(#[from] UsbError),
}

/// Picks the one device out of `devices`. Zero or several candidates are both
/// errors; ambiguity is never resolved by guessing.
pub fn select_single<T>(mut devices: Vec<T>, mode: &'static str) -> Result<T, DiscoveryError> {
    match devices.len() {
        0 => Err(DiscoveryError::NoDevice(mode)),
        1 => Ok(devices.remove(0)),
        _ => Err(DiscoveryError::AmbiguousDevice(mode)),
    }
}

/// First alternate setting with the given class/subclass/protocol triple.
pub fn find_interface(
    device: &UsbDevice,
    class: (u8, u8, u8),
) -> Result<&UsbAltSetting, DiscoveryError> {
    device
        .alt_settings
        .iter()
        .find(|alt| alt.is_class(class))
        .ok_or(DiscoveryError::NoInterface(device.bus_addr()))
}

/// The `(in, out)` bulk endpoint addresses of an interface that has exactly
/// one of each.
pub fn bulk_endpoints(alt: &UsbAltSetting) -> Result<(u8, u8), DiscoveryError> {
    if alt.endpoints.len() != 2 || !alt.endpoints.iter().all(|ep| ep.bulk) {
        return Err(DiscoveryError::EndpointCount(alt.endpoints.len()));
    }
    let find = |dir| {
        alt.endpoints
            .iter()
            .find(|ep| ep.direction == dir)
            .map(|ep| ep.address)
    };
    let ep_in = find(Direction::In).ok_or(DiscoveryError::MissingInEndpoint)?;
    let ep_out = find(Direction::Out).ok_or(DiscoveryError::MissingOutEndpoint)?;
    Ok((ep_in, ep_out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picoboot_device(bus_number: u8, address: u8) -> UsbDevice {
        UsbDevice {
            bus_number,
            address,
            vendor_id: 0x2e8a,
            product_id: 0x000f,
            alt_settings: vec![
                UsbAltSetting {
                    interface: 0,
                    class: 0x08,
                    subclass: 0x06,
                    protocol: 0x50,
                    ..Default::default()
                },
                UsbAltSetting {
                    interface: 1,
                    class: 0xff,
                    endpoints: vec![
                        UsbEndpoint {
                            address: 0x03,
                            direction: Direction::Out,
                            bulk: true,
                        },
                        UsbEndpoint {
                            address: 0x84,
                            direction: Direction::In,
                            bulk: true,
                        },
                    ],
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn parses_bus_addr() {
        assert_eq!(
            "1:12".parse::<BusAddr>().unwrap(),
            BusAddr {
                bus: 1,
                address: 12
            }
        );
        assert!("1".parse::<BusAddr>().is_err());
        assert!("1:x".parse::<BusAddr>().is_err());
        assert!("1:300".parse::<BusAddr>().is_err());
    }

    #[test]
    fn single_device_is_required() {
        assert!(matches!(
            select_single(Vec::<UsbDevice>::new(), "BOOTSEL"),
            Err(DiscoveryError::NoDevice("BOOTSEL"))
        ));
        assert!(matches!(
            select_single(vec![picoboot_device(1, 2), picoboot_device(1, 3)], "BOOTSEL"),
            Err(DiscoveryError::AmbiguousDevice(_))
        ));
        let device = select_single(vec![picoboot_device(1, 2)], "BOOTSEL").unwrap();
        assert_eq!(device.address, 2);
    }

    #[test]
    fn bus_addr_narrows_matches() {
        let device = picoboot_device(3, 7);
        assert!(device.matches(0x2e8a, 0x000f, None));
        assert!(device.matches(0x2e8a, 0x000f, Some("3:7".parse().unwrap())));
        assert!(!device.matches(0x2e8a, 0x000f, Some("3:8".parse().unwrap())));
        assert!(!device.matches(0x2e8a, 0x0003, None));
    }

    #[test]
    fn finds_vendor_interface_and_endpoints() {
        let device = picoboot_device(1, 2);
        let alt = find_interface(&device, (0xff, 0, 0)).unwrap();
        assert_eq!(alt.interface, 1);
        assert_eq!(bulk_endpoints(alt).unwrap(), (0x84, 0x03));
        assert!(matches!(
            find_interface(&device, (0xfe, 1, 2)),
            Err(DiscoveryError::NoInterface(_))
        ));
    }

    #[test]
    fn endpoint_directions_are_checked() {
        let mut alt = picoboot_device(1, 2).alt_settings.remove(1);
        alt.endpoints[1].direction = Direction::Out;
        assert!(matches!(
            bulk_endpoints(&alt),
            Err(DiscoveryError::MissingInEndpoint)
        ));
        alt.endpoints.pop();
        assert!(matches!(
            bulk_endpoints(&alt),
            Err(DiscoveryError::EndpointCount(1))
        ));
    }
}
