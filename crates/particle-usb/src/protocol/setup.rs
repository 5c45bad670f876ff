//! Service-request setup packets.
//!
//! Every service transfer is a USB control transfer whose eight-byte setup
//! stage selects the operation: `wIndex` carries the service kind, `wValue`
//! carries the request type (INIT) or protocol id (everything else).

use std::fmt;

use super::constants::*;

/// Service request kinds, encoded in `wIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceKind {
    /// Open a protocol slot for a new logical request.
    Init = 1,
    /// Poll progress/result of a slot.
    Check = 2,
    /// Upload the request payload.
    Send = 3,
    /// Download the reply payload.
    Recv = 4,
    /// Release a slot (or all slots when `proto_id == 0`).
    Reset = 5,
}

impl ServiceKind {
    pub fn from_windex(value: u16) -> Option<Self> {
        match value {
            1 => Some(ServiceKind::Init),
            2 => Some(ServiceKind::Check),
            3 => Some(ServiceKind::Send),
            4 => Some(ServiceKind::Recv),
            5 => Some(ServiceKind::Reset),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Init => write!(f, "INIT"),
            ServiceKind::Check => write!(f, "CHECK"),
            ServiceKind::Send => write!(f, "SEND"),
            ServiceKind::Recv => write!(f, "RECV"),
            ServiceKind::Reset => write!(f, "RESET"),
        }
    }
}

/// The six-field USB control-transfer setup header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    /// Direction bit of `bmRequestType`: true for device-to-host.
    pub fn is_in(&self) -> bool {
        self.bm_request_type & 0x80 != 0
    }

    /// Service kind, if this is a service-request setup.
    pub fn service_kind(&self) -> Option<ServiceKind> {
        if self.b_request != PARTICLE_BREQUEST {
            return None;
        }
        ServiceKind::from_windex(self.w_index)
    }
}

impl fmt::Display for SetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bmRequestType=0x{:02X} bRequest=0x{:02X} wValue=0x{:04X} wIndex={} wLength={}",
            self.bm_request_type, self.b_request, self.w_value, self.w_index, self.w_length
        )
    }
}

/// INIT: `wValue` carries the request type. The payload length is advertised
/// through `wLength`, clamped up so the reply frame always fits the IN data
/// stage; the exact length reaches the device as the SEND data-stage length.
pub fn init_setup(request_type: u16, payload_len: u16) -> SetupPacket {
    SetupPacket {
        bm_request_type: BMREQUEST_DEVICE_TO_HOST,
        b_request: PARTICLE_BREQUEST,
        w_value: request_type,
        w_index: ServiceKind::Init as u16,
        w_length: payload_len.max(SERVICE_REPLY_SIZE),
    }
}

/// CHECK: poll the slot identified by `proto_id`.
pub fn check_setup(proto_id: u16) -> SetupPacket {
    SetupPacket {
        bm_request_type: BMREQUEST_DEVICE_TO_HOST,
        b_request: PARTICLE_BREQUEST,
        w_value: proto_id,
        w_index: ServiceKind::Check as u16,
        w_length: SERVICE_REPLY_SIZE,
    }
}

/// SEND: upload the payload in a single OUT data stage.
pub fn send_setup(proto_id: u16, payload_len: u16) -> SetupPacket {
    SetupPacket {
        bm_request_type: BMREQUEST_HOST_TO_DEVICE,
        b_request: PARTICLE_BREQUEST,
        w_value: proto_id,
        w_index: ServiceKind::Send as u16,
        w_length: payload_len,
    }
}

/// RECV: download exactly `size` reply bytes.
pub fn recv_setup(proto_id: u16, size: u16) -> SetupPacket {
    SetupPacket {
        bm_request_type: BMREQUEST_DEVICE_TO_HOST,
        b_request: PARTICLE_BREQUEST,
        w_value: proto_id,
        w_index: ServiceKind::Recv as u16,
        w_length: size,
    }
}

/// RESET: release one slot, or all slots when `proto_id == 0`.
pub fn reset_setup(proto_id: u16) -> SetupPacket {
    SetupPacket {
        bm_request_type: BMREQUEST_HOST_TO_DEVICE,
        b_request: PARTICLE_BREQUEST,
        w_value: proto_id,
        w_index: ServiceKind::Reset as u16,
        w_length: 0,
    }
}
