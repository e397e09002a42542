//! USB DFU 1.1 download client.

use std::{thread, time::Duration};

use log::{debug, trace};
use thiserror::Error;

use crate::usb::{
    ControlRequest, DiscoveryError, Recipient, RequestType, UsbAltSetting, UsbDevice, UsbError,
    UsbTransport,
};

/// Class, subclass and protocol of a DFU mode interface.
pub const DFU_INTERFACE: (u8, u8, u8) = (0xfe, 0x01, 0x02);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum DfuRequest {
    Dnload = 0x01,
    GetStatus = 0x03,
    ClrStatus = 0x04,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuDnloadSync = 3,
    DfuDnbusy = 4,
    DfuDnloadIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuUploadIdle = 9,
    DfuError = 10,
}

impl DfuState {
    pub fn from_u8(state: u8) -> Option<DfuState> {
        Some(match state {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DfuDnloadSync,
            4 => DfuState::DfuDnbusy,
            5 => DfuState::DfuDnloadIdle,
            6 => DfuState::DfuManifestSync,
            7 => DfuState::DfuManifest,
            8 => DfuState::DfuManifestWaitReset,
            9 => DfuState::DfuUploadIdle,
            10 => DfuState::DfuError,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            DfuState::AppIdle => "app idle",
            DfuState::AppDetach => "app detach",
            DfuState::DfuIdle => "DFU idle",
            DfuState::DfuDnloadSync => "DFU download sync",
            DfuState::DfuDnbusy => "DFU download busy",
            DfuState::DfuDnloadIdle => "DFU download idle",
            DfuState::DfuManifestSync => "DFU manifest sync",
            DfuState::DfuManifest => "DFU manifest",
            DfuState::DfuManifestWaitReset => "DFU manifest wait reset",
            DfuState::DfuUploadIdle => "DFU upload idle",
            DfuState::DfuError => "DFU error",
        }
    }
}

pub fn status_str(status: u8) -> &'static str {
    match status {
        0 => "OK",
        1 => "file is not for this target",
        2 => "file fails a vendor-specific verification test",
        3 => "unable to write memory",
        4 => "memory erase function failed",
        5 => "memory erase check failed",
        6 => "program memory function failed",
        7 => "programmed memory failed verification",
        8 => "memory address is out of range",
        9 => "premature DFU_DNLOAD with wLength = 0",
        10 => "firmware is corrupt",
        11 => "vendor-specific error",
        12 => "unexpected USB reset signaling",
        13 => "unexpected power on reset",
        14 => "unknown error",
        15 => "stalled an unexpected request",
        _ => "unknown error",
    }
}

/// Answer to DFU_GETSTATUS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout_ms: u32,
    pub state: u8,
    pub string_index: u8,
}

impl DfuStatus {
    fn parse(buf: &[u8; 6]) -> Self {
        Self {
            status: buf[0],
            poll_timeout_ms: u32::from_le_bytes([buf[1], buf[2], buf[3], 0]),
            state: buf[4],
            string_index: buf[5],
        }
    }
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error("dfu: {op}: {status}")]
    Status {
        op: &'static str,
        code: u8,
        status: &'static str,
    },
    #[error("dfu: {op}: {source}")]
    Transfer {
        op: &'static str,
        source: UsbError,
    },
    #[error("dfu: {op}: status answer has {got} bytes")]
    ShortStatus { op: &'static str, got: usize },
    #[error("dfu: Connect: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Finds the DFU alternate setting that targets flash.
///
/// Only one device may offer DFU interfaces and only one of its alternate
/// settings may have "flash" in its name. Returns the index of the device
/// and the chosen setting.
pub fn select_flash_alt(
    devices: &[UsbDevice],
) -> Result<(usize, &UsbAltSetting), DiscoveryError> {
    let mut found: Option<(usize, Vec<&UsbAltSetting>)> = None;

    for (i, device) in devices.iter().enumerate() {
        let alts: Vec<_> = device
            .alt_settings
            .iter()
            .filter(|alt| alt.is_class(DFU_INTERFACE) && alt.endpoints.is_empty())
            .collect();
        if alts.is_empty() {
            continue;
        }
        if found.is_some() {
            return Err(DiscoveryError::AmbiguousDevice("DFU"));
        }
        found = Some((i, alts));
    }

    let (index, alts) = found.ok_or(DiscoveryError::NoDevice("DFU"))?;
    let bus_addr = devices[index].bus_addr();

    let mut flash = alts.into_iter().filter(|alt| {
        alt.name
            .as_deref()
            .is_some_and(|name| name.to_lowercase().contains("flash"))
    });
    let alt = flash
        .next()
        .ok_or(DiscoveryError::NoFlashAltSetting(bus_addr))?;
    if flash.next().is_some() {
        return Err(DiscoveryError::AmbiguousAltSetting(bus_addr));
    }
    Ok((index, alt))
}

/// A claimed DFU interface.
pub struct DfuConnection<T: UsbTransport> {
    transport: T,
    interface: u16,
    poll_speed: u32,
}

impl<T: UsbTransport> DfuConnection<T> {
    /// `poll_speed` divides the poll timeout the device asks for while busy.
    pub fn new(transport: T, interface: u8, poll_speed: u32) -> Self {
        Self {
            transport,
            interface: interface.into(),
            poll_speed: poll_speed.max(1),
        }
    }

    fn request(&self, request: DfuRequest, value: u16) -> ControlRequest {
        ControlRequest {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request: request as u8,
            value,
            index: self.interface,
        }
    }

    fn control_out(
        &mut self,
        op: &'static str,
        request: DfuRequest,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let request = self.request(request, value);
        self.transport
            .control_out(request, data)
            .map_err(|source| DfuError::Transfer { op, source })?;
        Ok(())
    }

    pub fn get_status(&mut self) -> Result<DfuStatus, DfuError> {
        let op = "GetStatus";
        let request = self.request(DfuRequest::GetStatus, 0);
        let mut buf = [0u8; 6];
        let n = self
            .transport
            .control_in(request, &mut buf)
            .map_err(|source| DfuError::Transfer { op, source })?;
        if n != buf.len() {
            return Err(DfuError::ShortStatus { op, got: n });
        }
        Ok(DfuStatus::parse(&buf))
    }

    pub fn clear_status(&mut self) -> Result<(), DfuError> {
        self.control_out("ClrStatus", DfuRequest::ClrStatus, 0, &[])
    }

    /// Sends block `block` and waits until the device is done with it.
    pub fn download(&mut self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        trace!("DNLOAD block {block}, {} bytes", data.len());
        self.control_out("Download", DfuRequest::Dnload, block, data)?;
        self.wait_idle("Download")
    }

    /// Polls the status until the device leaves the busy state. An error state
    /// is cleared before the failure is reported.
    fn wait_idle(&mut self, op: &'static str) -> Result<(), DfuError> {
        loop {
            let status = self.get_status()?;
            trace!(
                "Status {}, state {}",
                status.status,
                DfuState::from_u8(status.state).map_or("unknown", DfuState::name)
            );

            if status.state == DfuState::DfuError as u8 {
                self.clear_status()?;
            }
            if status.status != 0 {
                return Err(DfuError::Status {
                    op,
                    code: status.status,
                    status: status_str(status.status),
                });
            }
            if status.state != DfuState::DfuDnbusy as u8 {
                return Ok(());
            }

            let wait = status.poll_timeout_ms / self.poll_speed;
            debug!("Device busy, polling again in {wait} ms");
            thread::sleep(Duration::from_millis(wait.into()));
        }
    }
}

#[cfg(feature = "usb")]
pub fn connect(
    vendor_id: u16,
    product_id: u16,
    bus_addr: Option<crate::usb::BusAddr>,
    poll_speed: u32,
) -> Result<DfuConnection<crate::usb::nusb::NusbTransport>, DfuError> {
    use crate::usb::nusb::open_devices;
    use log::info;

    let devices = open_devices(vendor_id, product_id, bus_addr)?;
    let infos: Vec<UsbDevice> = devices.iter().map(|d| d.info.clone()).collect();
    let (index, alt) = select_flash_alt(&infos)?;

    let transport = devices[index].claim(alt.interface, alt.alt)?;
    info!(
        "Found DFU device at {}: {}",
        infos[index].bus_addr(),
        alt.name.as_deref().unwrap_or_default()
    );
    Ok(DfuConnection::new(transport, alt.interface, poll_speed))
}
