//! USB Device Firmware Upgrade (DFU 1.1) definitions.
//!
//! Covers the class-specific requests and the device-side state machine this
//! library needs to leave bootloader mode. Enumerations follow the DFU 1.1
//! specification verbatim.

pub mod client;

pub use client::DfuClient;

use std::fmt;

use crate::error::Error;

/// The seven standard DFU class requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0,
    Dnload = 1,
    /// Present for symmetry; the leave path never exercises it.
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

/// DFU device states, numeric values 0-10 in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    pub fn from_code(code: u8) -> Result<Self, Error> {
        match code {
            0 => Ok(DfuState::AppIdle),
            1 => Ok(DfuState::AppDetach),
            2 => Ok(DfuState::DfuIdle),
            3 => Ok(DfuState::DfuDnloadSync),
            4 => Ok(DfuState::DfuDnbusy),
            5 => Ok(DfuState::DfuDnloadIdle),
            6 => Ok(DfuState::DfuManifestSync),
            7 => Ok(DfuState::DfuManifest),
            8 => Ok(DfuState::DfuManifestWaitReset),
            9 => Ok(DfuState::DfuUploadIdle),
            10 => Ok(DfuState::DfuError),
            other => Err(Error::Dfu(format!("Unknown DFU state code {other}"))),
        }
    }

    /// States from which a download can be started directly.
    pub fn is_idle(&self) -> bool {
        matches!(self, DfuState::DfuIdle | DfuState::DfuDnloadIdle)
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DfuDnloadSync => "dfuDNLOAD_SYNC",
            DfuState::DfuDnbusy => "dfuDNBUSY",
            DfuState::DfuDnloadIdle => "dfuDNLOAD_IDLE",
            DfuState::DfuManifestSync => "dfuMANIFEST_SYNC",
            DfuState::DfuManifest => "dfuMANIFEST",
            DfuState::DfuManifestWaitReset => "dfuMANIFEST_WAIT_RESET",
            DfuState::DfuUploadIdle => "dfuUPLOAD_IDLE",
            DfuState::DfuError => "dfuERROR",
        };
        write!(f, "{name}")
    }
}

/// DFU status codes, 0x00-0x0F in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuDeviceStatus {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotdone = 0x09,
    ErrFirmware = 0x0A,
    ErrVendor = 0x0B,
    ErrUsbr = 0x0C,
    ErrPor = 0x0D,
    ErrUnknown = 0x0E,
    ErrStalledpkt = 0x0F,
}

impl DfuDeviceStatus {
    pub fn from_code(code: u8) -> Result<Self, Error> {
        match code {
            0x00 => Ok(DfuDeviceStatus::Ok),
            0x01 => Ok(DfuDeviceStatus::ErrTarget),
            0x02 => Ok(DfuDeviceStatus::ErrFile),
            0x03 => Ok(DfuDeviceStatus::ErrWrite),
            0x04 => Ok(DfuDeviceStatus::ErrErase),
            0x05 => Ok(DfuDeviceStatus::ErrCheckErased),
            0x06 => Ok(DfuDeviceStatus::ErrProg),
            0x07 => Ok(DfuDeviceStatus::ErrVerify),
            0x08 => Ok(DfuDeviceStatus::ErrAddress),
            0x09 => Ok(DfuDeviceStatus::ErrNotdone),
            0x0A => Ok(DfuDeviceStatus::ErrFirmware),
            0x0B => Ok(DfuDeviceStatus::ErrVendor),
            0x0C => Ok(DfuDeviceStatus::ErrUsbr),
            0x0D => Ok(DfuDeviceStatus::ErrPor),
            0x0E => Ok(DfuDeviceStatus::ErrUnknown),
            0x0F => Ok(DfuDeviceStatus::ErrStalledpkt),
            other => Err(Error::Dfu(format!("Unknown DFU status code {other}"))),
        }
    }
}

/// Parsed GETSTATUS reply: `bStatus` (1), `bwPollTimeout` (3, little-endian),
/// `bState` (1), `iString` (1).
#[derive(Debug, Clone, Copy)]
pub struct DfuStatusReport {
    pub status: DfuDeviceStatus,
    pub poll_timeout_ms: u32,
    pub state: DfuState,
    pub i_string: u8,
}

impl DfuStatusReport {
    pub const SIZE: usize = 6;

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            return Err(Error::Dfu(format!(
                "GETSTATUS reply too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            status: DfuDeviceStatus::from_code(data[0])?,
            poll_timeout_ms: u32::from(data[1])
                | u32::from(data[2]) << 8
                | u32::from(data[3]) << 16,
            state: DfuState::from_code(data[4])?,
            i_string: data[5],
        })
    }
}
