//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{TransportError, UsbTransport};
use crate::device_type::{DeviceInfo, classify};
use crate::protocol::{CONTROL_TRANSFER_TIMEOUT_MS, SetupPacket};

/// nusb-based USB transport.
///
/// Holds the enumerated device info; `open()` opens the device and claims
/// interface 0, which both the service protocol (on Windows) and the DFU
/// bootloader require.
pub struct NusbTransport {
    device_info: nusb::DeviceInfo,
    entry: &'static DeviceInfo,
    dfu_mode: bool,
    interface: Option<nusb::Interface>,
    timeout: Duration,
}

impl NusbTransport {
    /// Enumerate all plugged devices whose (vid, pid) is in the static table.
    #[instrument(level = "info")]
    pub fn enumerate() -> Result<Vec<NusbTransport>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let mut found = Vec::new();
        for device_info in devices {
            if let Some((entry, dfu_mode)) = classify(device_info.vendor_id(), device_info.product_id())
            {
                debug!(
                    vid = %format!("{:04X}", device_info.vendor_id()),
                    pid = %format!("{:04X}", device_info.product_id()),
                    device_type = %entry.device_type,
                    dfu = dfu_mode,
                    "Found device"
                );
                found.push(NusbTransport {
                    device_info,
                    entry,
                    dfu_mode,
                    interface: None,
                    timeout: Duration::from_millis(CONTROL_TRANSFER_TIMEOUT_MS),
                });
            }
        }
        Ok(found)
    }

    /// Table entry this device matched.
    pub fn device_entry(&self) -> &'static DeviceInfo {
        self.entry
    }

    /// Whether the matched (vid, pid) pair is the DFU-mode pair.
    pub fn is_dfu_mode(&self) -> bool {
        self.dfu_mode
    }

    fn interface(&self) -> Result<&nusb::Interface, TransportError> {
        self.interface
            .as_ref()
            .ok_or_else(|| TransportError::TransferFailed("device is not open".to_string()))
    }
}

/// Split a raw bmRequestType into nusb's type/recipient pair.
fn request_type_fields(bm_request_type: u8) -> (ControlType, Recipient) {
    let control_type = match (bm_request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    };
    let recipient = match bm_request_type & 0x1F {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };
    (control_type, recipient)
}

impl UsbTransport for NusbTransport {
    fn set_transfer_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    #[instrument(level = "info", skip(self), fields(
        vid = %format!("{:04X}", self.device_info.vendor_id()),
        pid = %format!("{:04X}", self.device_info.product_id()),
    ))]
    fn open(&mut self) -> Result<(), TransportError> {
        let device = self
            .device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        if self.dfu_mode {
            // DFU operates on interface 0, alternate setting 0.
            interface
                .set_alt_setting(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;
        }

        info!(device_type = %self.entry.device_type, dfu = self.dfu_mode, "Device opened");
        self.interface = Some(interface);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.interface = None;
        debug!("Device closed");
        Ok(())
    }

    #[instrument(level = "trace", skip(self, setup), fields(setup = %setup))]
    fn transfer_in(&self, setup: &SetupPacket) -> Result<Vec<u8>, TransportError> {
        let (control_type, recipient) = request_type_fields(setup.bm_request_type);
        let data = self
            .interface()?
            .control_in(
                ControlIn {
                    control_type,
                    recipient,
                    request: setup.b_request,
                    value: setup.w_value,
                    index: setup.w_index,
                    length: setup.w_length,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::TransferFailed(e.to_string()))?;
        debug!(bytes_read = data.len(), "IN transfer complete");
        Ok(data)
    }

    #[instrument(level = "trace", skip(self, setup, data), fields(setup = %setup, len = data.len()))]
    fn transfer_out(&self, setup: &SetupPacket, data: &[u8]) -> Result<(), TransportError> {
        let (control_type, recipient) = request_type_fields(setup.bm_request_type);
        self.interface()?
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request: setup.b_request,
                    value: setup.w_value,
                    index: setup.w_index,
                    data,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::TransferFailed(e.to_string()))?;
        debug!(bytes_written = data.len(), "OUT transfer complete");
        Ok(())
    }

    fn serial_number(&self) -> Option<String> {
        self.device_info.serial_number().map(str::to_string)
    }

    fn vendor_id(&self) -> u16 {
        self.device_info.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.device_info.product_id()
    }
}
