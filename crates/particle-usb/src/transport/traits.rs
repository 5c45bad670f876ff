//! USB transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for control-transfer communication,
//! allowing different implementations (nusb, mock, etc.).

use thiserror::Error;

use crate::protocol::SetupPacket;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Control transfer failed: {0}")]
    TransferFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract USB transport interface.
///
/// The engine is single-threaded over a transport: at most one transfer is in
/// flight per device at any instant. A per-transfer USB timeout applies to
/// each individual operation, distinct from logical-request deadlines.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send {
    /// Open the device and claim what the mode requires.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Release the device.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Override the per-transfer USB timeout. Backends without a timeout
    /// concept may ignore this.
    fn set_transfer_timeout(&mut self, _timeout: std::time::Duration) {}

    /// Execute an IN control transfer and return the data stage.
    fn transfer_in(&self, setup: &SetupPacket) -> Result<Vec<u8>, TransportError>;

    /// Execute an OUT control transfer with the given data stage.
    fn transfer_out(&self, setup: &SetupPacket, data: &[u8]) -> Result<(), TransportError>;

    /// String serial-number descriptor, if the device reports one.
    fn serial_number(&self) -> Option<String>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
