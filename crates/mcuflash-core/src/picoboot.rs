//! PICOBOOT client for RP2xxx chips in BOOTSEL mode.
//!
//! Every command is a 32 byte frame on the bulk OUT endpoint, an optional data
//! phase, a zero length acknowledgement in the opposite direction and a
//! command status query on the control endpoint.

use std::time::Duration;

use assert_into::AssertInto;
use log::{debug, trace};
use static_assertions::const_assert;
use thiserror::Error;
use zerocopy::{
    byteorder::little_endian::{U16, U32},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

use crate::usb::{ControlRequest, DiscoveryError, Recipient, RequestType, UsbError, UsbTransport};

pub const PICOBOOT_VID: u16 = 0x2e8a;
pub const PICOBOOT_PID: u16 = 0x000f;
pub const PICOBOOT_INTERFACE: (u8, u8, u8) = (0xff, 0x00, 0x00);

const PICOBOOT_MAGIC: u32 = 0x431f_d10b;
const MAX_ARGS: usize = 16;

const CTRL_INTERFACE_RESET: u8 = 0x41;
const CTRL_GET_COMMAND_STATUS: u8 = 0x42;

/// Bit 7 of the id marks commands with a device to host data phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    ExclusiveAccess = 0x01,
    Reboot = 0x02,
    FlashErase = 0x03,
    Read = 0x84,
    Write = 0x05,
    ExitXip = 0x06,
    EnterXip = 0x07,
    Exec = 0x08,
    VectorizeFlash = 0x09,
    Reboot2 = 0x0a,
    GetInfo = 0x8b,
    OtpRead = 0x8c,
    OtpWrite = 0x0d,
}

impl CommandId {
    const ALL: [CommandId; 13] = [
        CommandId::ExclusiveAccess,
        CommandId::Reboot,
        CommandId::FlashErase,
        CommandId::Read,
        CommandId::Write,
        CommandId::ExitXip,
        CommandId::EnterXip,
        CommandId::Exec,
        CommandId::VectorizeFlash,
        CommandId::Reboot2,
        CommandId::GetInfo,
        CommandId::OtpRead,
        CommandId::OtpWrite,
    ];

    pub fn is_in(self) -> bool {
        self as u8 & 0x80 != 0
    }

    /// Looks up a command by the id reported in a status, which may lack
    /// the direction bit.
    pub fn from_wire(id: u8) -> Option<CommandId> {
        Self::ALL
            .into_iter()
            .find(|cmd| *cmd as u8 & 0x7f == id & 0x7f)
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandId::ExclusiveAccess => "ExclusiveAccess",
            CommandId::Reboot => "Reboot",
            CommandId::FlashErase => "FlashErase",
            CommandId::Read => "Read",
            CommandId::Write => "Write",
            CommandId::ExitXip => "ExitXIP",
            CommandId::EnterXip => "EnterXIP",
            CommandId::Exec => "Exec",
            CommandId::VectorizeFlash => "VectorizeFlash",
            CommandId::Reboot2 => "Reboot2",
            CommandId::GetInfo => "GetInfo",
            CommandId::OtpRead => "OTPRead",
            CommandId::OtpWrite => "OTPWrite",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RebootType {
    Normal = 0x0,
    Bootsel = 0x2,
    RamImage = 0x3,
    FlashUpdate = 0x4,
    PcSp = 0xd,
}

/// Flags ORed into the Reboot2 type.
pub const REBOOT_TO_ARM: u32 = 1 << 4;
pub const REBOOT_TO_RISCV: u32 = 1 << 5;

// GetInfo information type (first argument)
pub const INFO_SYS: u32 = 1;
pub const INFO_PARTITION: u32 = 2;
pub const INFO_UF2_TARGET_PARTITION: u32 = 3;
pub const INFO_UF2_STATUS: u32 = 4;

// INFO_SYS flags (second argument)
pub const SYS_CHIP_INFO: u32 = 1 << 0;
pub const SYS_CRITICAL: u32 = 1 << 1;
pub const SYS_CPU_INFO: u32 = 1 << 2;
pub const SYS_FLASH_DEV_INFO: u32 = 1 << 3;
pub const SYS_BOOT_RANDOM: u32 = 1 << 4;
pub const SYS_BOOT_INFO: u32 = 1 << 6;

// INFO_PARTITION flags (second argument)
pub const PT_INFO: u32 = 1 << 0;
pub const PT_LOCATION_AND_FLAGS: u32 = 1 << 4;
pub const PT_ID: u32 = 1 << 5;
pub const PT_FAMILY_IDS: u32 = 1 << 6;
pub const PT_NAME: u32 = 1 << 7;
pub const PT_SINGLE_PARTITION: u32 = 1 << 15;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct CommandFrame {
    magic: U32,
    token: U32,
    cmd_id: u8,
    cmd_size: u8,
    reserved: U16,
    transfer_len: U32,
    args: [u8; MAX_ARGS],
}

const_assert!(std::mem::size_of::<CommandFrame>() == 32);

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct StatusFrame {
    token: U32,
    status: U32,
    cmd_id: u8,
    in_progress: u8,
    reserved: [u8; 6],
}

const_assert!(std::mem::size_of::<StatusFrame>() == 16);

/// Decoded answer to the command status query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandStatus {
    pub token: u32,
    pub status: u32,
    pub cmd_id: u8,
    pub in_progress: bool,
}

pub fn status_str(status: u32) -> &'static str {
    match status {
        1 => "unknown cmd",
        2 => "invalid cmd length",
        3 => "invalid transfer length",
        4 => "invalid address",
        5 => "bad alignment",
        6 => "interleaved write",
        7 => "rebooting",
        8 => "unknown error",
        9 => "invalid state",
        10 => "not permitted",
        11 => "invalid arg",
        12 => "buffer too small",
        13 => "precondition not met",
        14 => "modified data",
        15 => "invalid data",
        16 => "not found",
        17 => "unsupported modification",
        _ => "unknown",
    }
}

#[derive(Error, Debug)]
pub enum PicobootError {
    /// The device rejected a command. Displays as the bare status string.
    #[error("{status}")]
    Status {
        op: &'static str,
        code: u32,
        status: &'static str,
    },
    #[error("picoboot: {op}: {source}")]
    Transfer {
        op: &'static str,
        source: UsbError,
    },
    #[error("picoboot: {op}: read {got} bytes, expected {expected}")]
    ShortRead {
        op: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("picoboot: {op}: wrote {got} bytes, expected {expected}")]
    ShortWrite {
        op: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("picoboot: {op}: {len} argument bytes don't fit in a command")]
    ArgsTooLong { op: &'static str, len: usize },
    #[error("picoboot: Connect: {0}")]
    Discovery(#[from] DiscoveryError),
}

#[derive(Clone, Copy)]
enum Phase<'a> {
    None,
    In(usize),
    Out(&'a [u8]),
}

fn words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// An open PICOBOOT interface.
///
/// Reads and writes continue where the previous one of the same kind ended
/// until the address is set explicitly.
pub struct PicobootConnection<T: UsbTransport> {
    transport: T,
    interface: u16,
    ep_in: u8,
    ep_out: u8,
    token: u32,
    read_cursor: u32,
    write_cursor: u32,
}

impl<T: UsbTransport> PicobootConnection<T> {
    pub fn new(transport: T, interface: u8, ep_in: u8, ep_out: u8) -> Self {
        Self {
            transport,
            interface: interface.into(),
            ep_in,
            ep_out,
            token: 0,
            read_cursor: 0,
            write_cursor: 0,
        }
    }

    /// Token of the last command sent.
    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn set_read_addr(&mut self, addr: u32) {
        self.read_cursor = addr;
    }

    pub fn read_addr(&self) -> u32 {
        self.read_cursor
    }

    pub fn set_write_addr(&mut self, addr: u32) {
        self.write_cursor = addr;
    }

    pub fn write_addr(&self) -> u32 {
        self.write_cursor
    }

    /// Reads the data phase of an IN command in one transfer. A short packet
    /// ends it early, the device then waits for the acknowledgement.
    fn read_data(&mut self, op: &'static str, len: usize) -> Result<Vec<u8>, PicobootError> {
        let mut data = self
            .transport
            .bulk_in(self.ep_in, len)
            .map_err(|source| PicobootError::Transfer { op, source })?;
        data.truncate(len);
        Ok(data)
    }

    fn transact(
        &mut self,
        cmd: CommandId,
        args: &[u8],
        phase: Phase<'_>,
    ) -> Result<Vec<u8>, PicobootError> {
        let op = cmd.name();
        if args.len() > MAX_ARGS {
            return Err(PicobootError::ArgsTooLong {
                op,
                len: args.len(),
            });
        }
        let transfer = |source| PicobootError::Transfer { op, source };

        self.token = self.token.wrapping_add(1);
        let transfer_len = match phase {
            Phase::None => 0,
            Phase::In(len) => len,
            Phase::Out(data) => data.len(),
        };

        let mut frame = CommandFrame::new_zeroed();
        frame.magic = U32::new(PICOBOOT_MAGIC);
        frame.token = U32::new(self.token);
        frame.cmd_id = cmd as u8;
        frame.cmd_size = args.len().assert_into();
        frame.transfer_len = U32::new(
            u32::try_from(transfer_len).map_err(|_| PicobootError::ArgsTooLong {
                op,
                len: transfer_len,
            })?,
        );
        frame.args[..args.len()].copy_from_slice(args);

        trace!("{op} token {} transfer {transfer_len}", self.token);
        self.transport
            .bulk_out(self.ep_out, frame.as_bytes())
            .map_err(transfer)?;

        match phase {
            Phase::None => {
                self.transport.bulk_in(self.ep_in, 0).map_err(transfer)?;
                Ok(Vec::new())
            }
            Phase::In(len) => {
                let data = self.read_data(op, len)?;
                self.transport.bulk_out(self.ep_out, &[]).map_err(transfer)?;
                Ok(data)
            }
            Phase::Out(data) => {
                let n = self.transport.bulk_out(self.ep_out, data).map_err(transfer)?;
                if n != data.len() {
                    return Err(PicobootError::ShortWrite {
                        op,
                        got: n,
                        expected: data.len(),
                    });
                }
                self.transport.bulk_in(self.ep_in, 0).map_err(transfer)?;
                Ok(Vec::new())
            }
        }
    }

    /// Runs one command and checks its status. When the exchange itself
    /// fails, a status reported by the device takes precedence over the
    /// transport error.
    fn exchange(
        &mut self,
        cmd: CommandId,
        args: &[u8],
        phase: Phase<'_>,
    ) -> Result<Vec<u8>, PicobootError> {
        match self.transact(cmd, args, phase) {
            Ok(data) => {
                self.check_status()?;
                Ok(data)
            }
            Err(e) => match self.check_status() {
                Err(status @ PicobootError::Status { .. }) => Err(status),
                _ => Err(e),
            },
        }
    }

    fn check_status(&mut self) -> Result<(), PicobootError> {
        let status = self.command_status()?;
        if status.status == 0 {
            return Ok(());
        }

        if let Err(e) = self.interface_reset() {
            debug!("Interface reset after failed command: {e}");
        }
        Err(PicobootError::Status {
            op: CommandId::from_wire(status.cmd_id).map_or("unknown", CommandId::name),
            code: status.status,
            status: status_str(status.status),
        })
    }

    pub fn command_status(&mut self) -> Result<CommandStatus, PicobootError> {
        let op = "GetCommandStatus";
        let mut buf = [0u8; 16];
        let n = self
            .transport
            .control_in(
                ControlRequest {
                    request_type: RequestType::Vendor,
                    recipient: Recipient::Interface,
                    request: CTRL_GET_COMMAND_STATUS,
                    value: 0,
                    index: self.interface,
                },
                &mut buf,
            )
            .map_err(|source| PicobootError::Transfer { op, source })?;
        let frame = StatusFrame::read_from_bytes(&buf[..n]).map_err(|_| {
            PicobootError::ShortRead {
                op,
                got: n,
                expected: buf.len(),
            }
        })?;

        Ok(CommandStatus {
            token: frame.token.get(),
            status: frame.status.get(),
            cmd_id: frame.cmd_id,
            in_progress: frame.in_progress != 0,
        })
    }

    pub fn interface_reset(&mut self) -> Result<(), PicobootError> {
        self.transport
            .control_out(
                ControlRequest {
                    request_type: RequestType::Vendor,
                    recipient: Recipient::Interface,
                    request: CTRL_INTERFACE_RESET,
                    value: 0,
                    index: self.interface,
                },
                &[],
            )
            .map_err(|source| PicobootError::Transfer {
                op: "InterfaceReset",
                source,
            })?;
        Ok(())
    }

    pub fn exclusive_access(&mut self, exclusive: bool) -> Result<(), PicobootError> {
        self.exchange(CommandId::ExclusiveAccess, &[exclusive as u8], Phase::None)?;
        Ok(())
    }

    /// RP2040 style reboot to `pc` with stack pointer `sp`.
    pub fn reboot(&mut self, pc: u32, sp: u32, delay: Duration) -> Result<(), PicobootError> {
        let delay: u32 = delay.as_millis().try_into().unwrap_or(u32::MAX);
        self.exchange(CommandId::Reboot, &words(&[pc, sp, delay]), Phase::None)?;
        Ok(())
    }

    pub fn flash_erase(&mut self, addr: u32, size: u32) -> Result<(), PicobootError> {
        self.exchange(CommandId::FlashErase, &words(&[addr, size]), Phase::None)?;
        Ok(())
    }

    /// Fills `buf` starting at the read cursor and advances it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, PicobootError> {
        let len: u32 = buf.len().assert_into();
        let args = words(&[self.read_cursor, len]);
        let data = self.exchange(CommandId::Read, &args, Phase::In(buf.len()))?;
        if data.len() != buf.len() {
            return Err(PicobootError::ShortRead {
                op: "Read",
                got: data.len(),
                expected: buf.len(),
            });
        }
        buf.copy_from_slice(&data);
        self.read_cursor = self.read_cursor.wrapping_add(len);
        Ok(data.len())
    }

    /// Writes `data` at the write cursor and advances it.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, PicobootError> {
        let len: u32 = data.len().assert_into();
        let args = words(&[self.write_cursor, len]);
        self.exchange(CommandId::Write, &args, Phase::Out(data))?;
        self.write_cursor = self.write_cursor.wrapping_add(len);
        Ok(data.len())
    }

    pub fn exit_xip(&mut self) -> Result<(), PicobootError> {
        self.exchange(CommandId::ExitXip, &[], Phase::None)?;
        Ok(())
    }

    pub fn enter_xip(&mut self) -> Result<(), PicobootError> {
        self.exchange(CommandId::EnterXip, &[], Phase::None)?;
        Ok(())
    }

    pub fn exec(&mut self, addr: u32) -> Result<(), PicobootError> {
        self.exchange(CommandId::Exec, &words(&[addr]), Phase::None)?;
        Ok(())
    }

    pub fn vectorize_flash(&mut self, addr: u32) -> Result<(), PicobootError> {
        self.exchange(CommandId::VectorizeFlash, &words(&[addr]), Phase::None)?;
        Ok(())
    }

    pub fn reboot2(
        &mut self,
        kind: RebootType,
        flags: u32,
        delay: Duration,
        p0: u32,
        p1: u32,
    ) -> Result<(), PicobootError> {
        let delay: u32 = delay.as_millis().try_into().unwrap_or(u32::MAX);
        let args = words(&[kind as u32 | flags, delay, p0, p1]);
        self.exchange(CommandId::Reboot2, &args, Phase::None)?;
        Ok(())
    }

    /// Fills `info` with the words returned for up to four arguments, unused
    /// ones sent as zero.
    pub fn get_info(&mut self, info: &mut [u32], args: &[u32]) -> Result<(), PicobootError> {
        let mut a = [0u32; 4];
        let n = args.len().min(a.len());
        a[..n].copy_from_slice(&args[..n]);

        let expected = info.len() * 4;
        let data = self.exchange(CommandId::GetInfo, &words(&a), Phase::In(expected))?;
        if data.len() != expected {
            return Err(PicobootError::ShortRead {
                op: "GetInfo",
                got: data.len(),
                expected,
            });
        }
        for (word, bytes) in info.iter_mut().zip(data.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(())
    }

    fn otp_args(row: u16, row_count: u16, ecc: bool) -> Vec<u8> {
        let mut args = Vec::with_capacity(5);
        args.extend_from_slice(&row.to_le_bytes());
        args.extend_from_slice(&row_count.to_le_bytes());
        args.push(ecc as u8);
        args
    }

    /// Reads OTP rows from `row`. ECC rows are 2 bytes, raw rows 4.
    pub fn otp_read(&mut self, row: u16, ecc: bool, buf: &mut [u8]) -> Result<(), PicobootError> {
        let row_size = if ecc { 2 } else { 4 };
        let row_count: u16 = (buf.len() / row_size).assert_into();
        let len = row_count as usize * row_size;
        let args = Self::otp_args(row, row_count, ecc);
        let data = self.exchange(CommandId::OtpRead, &args, Phase::In(len))?;
        if data.len() != len {
            return Err(PicobootError::ShortRead {
                op: "OTPRead",
                got: data.len(),
                expected: len,
            });
        }
        buf[..len].copy_from_slice(&data);
        Ok(())
    }

    pub fn otp_write(&mut self, row: u16, ecc: bool, data: &[u8]) -> Result<(), PicobootError> {
        let row_size = if ecc { 2 } else { 4 };
        let row_count: u16 = (data.len() / row_size).assert_into();
        let len = row_count as usize * row_size;
        let args = Self::otp_args(row, row_count, ecc);
        self.exchange(CommandId::OtpWrite, &args, Phase::Out(&data[..len]))?;
        Ok(())
    }
}

#[cfg(feature = "usb")]
pub fn connect(
    bus_addr: Option<crate::usb::BusAddr>,
) -> Result<PicobootConnection<crate::usb::nusb::NusbTransport>, PicobootError> {
    use crate::usb::{bulk_endpoints, find_interface, nusb::open_devices, select_single};
    use log::info;

    let device = select_single(open_devices(PICOBOOT_VID, PICOBOOT_PID, bus_addr)?, "BOOTSEL")?;
    let alt = find_interface(&device.info, PICOBOOT_INTERFACE)?;
    let (ep_in, ep_out) = bulk_endpoints(alt)?;
    let (interface, alt_setting) = (alt.interface, alt.alt);

    let transport = device.claim(interface, alt_setting)?;
    info!("Found PICOBOOT device at {}", device.info.bus_addr());
    Ok(PicobootConnection::new(transport, interface, ep_in, ep_out))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::usb::mock::{Event, MockTransport};

    const EP_IN: u8 = 0x84;
    const EP_OUT: u8 = 0x03;

    pub(crate) fn status_bytes(token: u32, status: u32, cmd_id: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&token.to_le_bytes());
        bytes.extend_from_slice(&status.to_le_bytes());
        bytes.extend_from_slice(&[cmd_id, 0, 0, 0, 0, 0, 0, 0]);
        bytes
    }

    pub(crate) fn mock() -> MockTransport {
        MockTransport::new(status_bytes(0, 0, 0))
    }

    fn connection(mock: &mut MockTransport) -> PicobootConnection<&mut MockTransport> {
        PicobootConnection::new(mock, 1, EP_IN, EP_OUT)
    }

    fn frame(bytes: &[u8]) -> CommandFrame {
        CommandFrame::read_from_bytes(bytes).ok().expect("command frame")
    }

    #[test]
    fn command_frame_and_acknowledge() {
        let mut mock = mock();
        connection(&mut mock).exclusive_access(true).unwrap();

        let outs = mock.bulk_outs();
        assert_eq!(outs.len(), 1);
        let (ep, bytes) = &outs[0];
        assert_eq!(*ep, EP_OUT);
        assert_eq!(bytes.len(), 32);

        let frame = frame(bytes);
        assert_eq!(frame.magic.get(), 0x431f_d10b);
        assert_eq!(frame.token.get(), 1);
        assert_eq!(frame.cmd_id, 0x01);
        assert_eq!(frame.cmd_size, 1);
        assert_eq!(frame.transfer_len.get(), 0);
        assert_eq!(frame.args[0], 1);
        assert!(frame.args[1..].iter().all(|&b| b == 0));

        assert_eq!(mock.events[1], Event::BulkIn(EP_IN, 0));
        assert!(matches!(
            mock.events[2],
            Event::ControlIn(ControlRequest {
                request_type: RequestType::Vendor,
                recipient: Recipient::Interface,
                request: 0x42,
                index: 1,
                ..
            })
        ));
    }

    #[test]
    fn tokens_increase() {
        let mut mock = mock();
        let mut conn = connection(&mut mock);
        conn.exit_xip().unwrap();
        conn.enter_xip().unwrap();
        assert_eq!(conn.token(), 2);
    }

    #[test]
    fn rebooting_status_resets_interface() {
        let mut mock = mock();
        mock.queue_control_in(Ok(status_bytes(1, 7, 0x0a)));

        let err = connection(&mut mock)
            .reboot2(RebootType::Normal, 0, Duration::from_millis(500), 0, 0)
            .unwrap_err();
        assert_eq!(err.to_string(), "rebooting");
        assert!(matches!(
            err,
            PicobootError::Status {
                op: "Reboot2",
                code: 7,
                ..
            }
        ));

        let resets = mock.control_outs();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].0.request, 0x41);
        assert_eq!(resets[0].0.request_type, RequestType::Vendor);
        assert!(resets[0].1.is_empty());
    }

    #[test]
    fn failed_reset_keeps_status_error() {
        let mut mock = mock();
        mock.queue_control_in(Ok(status_bytes(1, 4, 0x03)))
            .queue_control_out(Err(UsbError::Stall));

        let err = connection(&mut mock).flash_erase(0x1000_0000, 4096).unwrap_err();
        assert_eq!(err.to_string(), "invalid address");
    }

    #[test]
    fn device_status_wins_over_transport_error() {
        let mut with_status = mock();
        with_status
            .queue_bulk_in(Err(UsbError::Stall))
            .queue_control_in(Ok(status_bytes(1, 5, 0x05)));
        let err = connection(&mut with_status).write(&[0; 64]).unwrap_err();
        assert_eq!(err.to_string(), "bad alignment");

        let mut without_status = mock();
        without_status.queue_bulk_in(Err(UsbError::Stall));
        let err = connection(&mut without_status).write(&[0; 64]).unwrap_err();
        assert!(matches!(
            err,
            PicobootError::Transfer {
                op: "Write",
                source: UsbError::Stall
            }
        ));
    }

    #[test]
    fn write_cursor_advances() {
        let mut mock = mock();
        let mut conn = connection(&mut mock);
        conn.set_write_addr(0x1000_0000);
        conn.write(&[0xaa; 64]).unwrap();
        conn.write(&[0xbb; 64]).unwrap();
        assert_eq!(conn.write_addr(), 0x1000_0080);

        let outs = mock.bulk_outs();
        // frame, data, frame, data
        assert_eq!(outs.len(), 4);
        let second = frame(&outs[2].1);
        assert_eq!(second.cmd_id, 0x05);
        assert_eq!(second.transfer_len.get(), 64);
        assert_eq!(second.args[..8], words(&[0x1000_0040, 64])[..]);
        assert_eq!(outs[3].1, vec![0xbb; 64]);
    }

    #[test]
    fn read_returns_data_and_advances() {
        let mut mock = mock();
        mock.queue_bulk_in(Ok(vec![0x4d, 0x75, 0x02, 0x00]));
        let mut conn = connection(&mut mock);
        conn.set_read_addr(0x10);

        let mut buf = [0u8; 4];
        conn.read(&mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf) & 0xff_ffff, 0x02754d);
        assert_eq!(conn.read_addr(), 0x14);

        // Data phase is acknowledged with an empty OUT transfer
        let outs = mock.bulk_outs();
        assert_eq!(outs.len(), 2);
        assert!(outs[1].1.is_empty());
        assert_eq!(frame(&outs[0].1).cmd_id, 0x84);
    }

    #[test]
    fn get_info_decodes_words() {
        let mut mock = mock();
        mock.queue_bulk_in(Ok(words(&[3, 0, 0x3ffe_000])));
        let mut info = [0u32; 3];
        connection(&mut mock)
            .get_info(&mut info, &[INFO_UF2_TARGET_PARTITION, 0xe48b_ff59])
            .unwrap();
        assert_eq!(info, [3, 0, 0x3ffe_000]);

        let outs = mock.bulk_outs();
        let frame = frame(&outs[0].1);
        assert_eq!(frame.cmd_id, 0x8b);
        assert_eq!(frame.cmd_size, 16);
        assert_eq!(frame.transfer_len.get(), 12);
        assert_eq!(frame.args[..], words(&[3, 0xe48b_ff59, 0, 0])[..]);
    }

    #[test]
    fn short_get_info_is_an_error() {
        let mut mock = mock();
        mock.queue_bulk_in(Ok(words(&[3, 0])));
        let mut info = [0u32; 3];
        let err = connection(&mut mock)
            .get_info(&mut info, &[INFO_UF2_TARGET_PARTITION])
            .unwrap_err();
        assert!(matches!(
            err,
            PicobootError::ShortRead {
                got: 8,
                expected: 12,
                ..
            }
        ));

        // one IN request only, the short packet is acknowledged right away
        let ins: Vec<&Event> = mock
            .events
            .iter()
            .filter(|e| matches!(e, Event::BulkIn(..)))
            .collect();
        assert_eq!(ins, [&Event::BulkIn(EP_IN, 12)]);
        assert_eq!(mock.events[2], Event::BulkOut(EP_OUT, Vec::new()));
    }

    #[test]
    fn address_commands() {
        let mut mock = mock();
        let mut conn = connection(&mut mock);
        conn.exec(0x2000_0001).unwrap();
        conn.vectorize_flash(0x2000_0000).unwrap();
        conn.reboot(0x2000_0101, 0x2004_2000, Duration::from_millis(10))
            .unwrap();

        let frames: Vec<CommandFrame> = mock.bulk_outs().iter().map(|(_, b)| frame(b)).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!((frames[0].cmd_id, frames[0].cmd_size), (0x08, 4));
        assert_eq!(frames[0].args[..4], 0x2000_0001u32.to_le_bytes());
        assert_eq!((frames[1].cmd_id, frames[1].cmd_size), (0x09, 4));
        assert_eq!(frames[1].args[..4], 0x2000_0000u32.to_le_bytes());
        assert_eq!((frames[2].cmd_id, frames[2].cmd_size), (0x02, 12));
        assert_eq!(
            frames[2].args[..12],
            words(&[0x2000_0101, 0x2004_2000, 10])[..]
        );
        assert!(frames.iter().all(|f| f.transfer_len.get() == 0));
    }

    #[test]
    fn otp_read_rows() {
        let mut mock = mock();
        mock.queue_bulk_in(Ok(vec![1, 2, 3, 4, 5, 6]));
        let mut buf = [0u8; 7];
        connection(&mut mock).otp_read(0x0104, true, &mut buf).unwrap();
        // three 2-byte ECC rows, the odd byte is left alone
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 0]);

        let outs = mock.bulk_outs();
        let frame = frame(&outs[0].1);
        assert_eq!(frame.cmd_id, 0x8c);
        assert_eq!(frame.cmd_size, 5);
        assert_eq!(frame.transfer_len.get(), 6);
        assert_eq!(frame.args[..5], [0x04, 0x01, 3, 0, 1]);
        assert!(outs[1].1.is_empty());
    }

    #[test]
    fn otp_write_rejected_by_device() {
        let mut mock = mock();
        mock.queue_control_in(Ok(status_bytes(1, 10, 0x0d)));
        let err = connection(&mut mock)
            .otp_write(0x0040, false, &[0xaa; 8])
            .unwrap_err();
        assert_eq!(err.to_string(), "not permitted");

        let outs = mock.bulk_outs();
        let frame = frame(&outs[0].1);
        assert_eq!(frame.cmd_id, 0x0d);
        assert_eq!(frame.transfer_len.get(), 8);
        assert_eq!(frame.args[..5], [0x40, 0x00, 2, 0, 0]);
        assert_eq!(outs[1].1, vec![0xaa; 8]);
        assert_eq!(mock.control_outs()[0].0.request, 0x41);
    }

    #[test]
    fn status_names() {
        assert_eq!(status_str(1), "unknown cmd");
        assert_eq!(status_str(17), "unsupported modification");
        assert_eq!(status_str(0), "unknown");
        assert_eq!(status_str(18), "unknown");
        assert_eq!(CommandId::from_wire(0x04), Some(CommandId::Read));
        assert_eq!(CommandId::from_wire(0x8b), Some(CommandId::GetInfo));
        assert_eq!(CommandId::from_wire(0x0e), None);
    }
}
