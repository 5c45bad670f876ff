//! DFU client: drives the device-side state machine over control transfers.

use tracing::{debug, info, instrument};

use super::{DfuDeviceStatus, DfuRequest, DfuState, DfuStatusReport};
use crate::error::{Error, Result};
use crate::protocol::{BMREQUEST_DFU_IN, BMREQUEST_DFU_OUT, SetupPacket};
use crate::transport::UsbTransport;

/// DFU interface number; the bootloader exposes interface 0, alternate
/// setting 0.
const DFU_INTERFACE: u16 = 0;

/// Client for a device in DFU (bootloader) mode.
pub struct DfuClient<'a, T: UsbTransport> {
    transport: &'a T,
}

impl<'a, T: UsbTransport> DfuClient<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    fn setup_in(request: DfuRequest, value: u16, length: u16) -> SetupPacket {
        SetupPacket {
            bm_request_type: BMREQUEST_DFU_IN,
            b_request: request as u8,
            w_value: value,
            w_index: DFU_INTERFACE,
            w_length: length,
        }
    }

    fn setup_out(request: DfuRequest, value: u16, length: u16) -> SetupPacket {
        SetupPacket {
            bm_request_type: BMREQUEST_DFU_OUT,
            b_request: request as u8,
            w_value: value,
            w_index: DFU_INTERFACE,
            w_length: length,
        }
    }

    pub fn get_status(&self) -> Result<DfuStatusReport> {
        let data = self.transport.transfer_in(&Self::setup_in(
            DfuRequest::GetStatus,
            0,
            DfuStatusReport::SIZE as u16,
        ))?;
        let report = DfuStatusReport::from_bytes(&data)?;
        debug!(status = ?report.status, state = %report.state, "GETSTATUS");
        Ok(report)
    }

    pub fn get_state(&self) -> Result<DfuState> {
        let data = self
            .transport
            .transfer_in(&Self::setup_in(DfuRequest::GetState, 0, 1))?;
        if data.is_empty() {
            return Err(Error::Dfu("Empty GETSTATE reply".to_string()));
        }
        DfuState::from_code(data[0])
    }

    pub fn clear_status(&self) -> Result<()> {
        debug!("CLRSTATUS");
        self.transport
            .transfer_out(&Self::setup_out(DfuRequest::ClrStatus, 0, 0), &[])?;
        Ok(())
    }

    pub fn abort(&self) -> Result<()> {
        debug!("ABORT");
        self.transport
            .transfer_out(&Self::setup_out(DfuRequest::Abort, 0, 0), &[])?;
        Ok(())
    }

    /// Ask a runtime-mode device to detach into the bootloader.
    pub fn detach(&self, timeout_ms: u16) -> Result<()> {
        debug!(timeout_ms, "DETACH");
        self.transport
            .transfer_out(&Self::setup_out(DfuRequest::Detach, timeout_ms, 0), &[])?;
        Ok(())
    }

    fn dnload(&self, block_num: u16, data: &[u8]) -> Result<()> {
        debug!(block_num, len = data.len(), "DNLOAD");
        self.transport.transfer_out(
            &Self::setup_out(DfuRequest::Dnload, block_num, data.len() as u16),
            data,
        )?;
        Ok(())
    }

    /// Leave DFU mode.
    ///
    /// Normalizes the state machine to an idle state, then issues a
    /// zero-length DNLOAD with a non-zero block number, which moves a
    /// conforming device through dfuMANIFEST_SYNC into dfuMANIFEST. Some
    /// device generations instead report OK in dfuDNLOAD_IDLE; both are
    /// accepted. After a successful leave the device resets itself and the
    /// handle must only be closed.
    #[instrument(level = "info", skip(self))]
    pub fn leave(&self) -> Result<()> {
        let mut report = match self.get_status() {
            Ok(report) => report,
            Err(err) => {
                debug!(error = %err, "GETSTATUS failed, clearing status");
                self.clear_status()?;
                self.get_status()?
            }
        };

        if !report.state.is_idle() {
            if report.state == DfuState::DfuError {
                self.clear_status()?;
            } else if self.clear_status().is_err() {
                // The failed CLRSTATUS left the device in dfuERROR; a second
                // one reaches dfuIDLE.
                self.clear_status()?;
            }
            report = self.get_status()?;
            if !report.state.is_idle() {
                return Err(Error::Dfu("Invalid state".to_string()));
            }
        }

        // Zero-length download with a non-zero block number triggers
        // manifestation.
        self.dnload(1, &[])?;

        let report = self.get_status()?;
        match (report.status, report.state) {
            (_, DfuState::DfuManifest) => {}
            (DfuDeviceStatus::Ok, DfuState::DfuDnloadIdle) => {
                debug!("Device reports dfuDNLOAD_IDLE after manifest trigger");
            }
            (status, state) => {
                return Err(Error::Dfu(format!(
                    "Invalid DFU state: status={status:?} state={state}"
                )));
            }
        }
        info!("Device is leaving DFU mode");
        Ok(())
    }
}
