//! Open-time configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{CONTROL_TRANSFER_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS};

/// Options applied when opening a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Concurrency cap to start from. When unset, the cap is learned from
    /// the first BUSY reply to INIT.
    pub max_active: Option<u16>,
    /// Default deadline for logical requests.
    pub default_request_timeout_ms: u64,
    /// Timeout applied to each individual USB control transfer.
    pub control_transfer_timeout_ms: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            max_active: None,
            default_request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            control_transfer_timeout_ms: CONTROL_TRANSFER_TIMEOUT_MS,
        }
    }
}

impl OpenOptions {
    /// Load options from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Device(format!("Failed to read options file: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::Device(format!("Invalid options file: {e}")))
    }

    /// Save options to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize options: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| Error::Device(format!("Failed to write options file: {e}")))
    }
}
