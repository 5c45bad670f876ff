//! Crate error types.

use thiserror::Error;

use crate::protocol::result_message;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The handle is not open, or is being closed.
    #[error("{0}")]
    State(String),

    /// The logical request's deadline elapsed.
    #[error("Request timeout")]
    Timeout,

    /// The device reported NO_MEMORY.
    #[error("Device is out of memory")]
    Memory,

    /// Malformed or unexpected service frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Underlying transport failure.
    #[error("USB error")]
    Usb(#[from] TransportError),

    /// The device processed the request but returned a non-OK result.
    #[error("{message} (result code {result})")]
    Request { result: i32, message: String },

    /// Entity lookup (device, module, section) failed.
    #[error("{0}")]
    NotFound(String),

    /// DFU state-machine violation.
    #[error("DFU error: {0}")]
    Dfu(String),

    /// Generic device error.
    #[error("{0}")]
    Device(String),

    /// Assertion failure; a bug in this library.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `Request` error from a device result code, using the known
    /// message table.
    pub fn from_result(result: i32) -> Self {
        Error::Request {
            result,
            message: result_message(result).to_string(),
        }
    }
}

/// Render an error and its causal chain, outermost first.
pub fn cause_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
