//! Service-reply frame parsing.
//!
//! Replies to IN service transfers follow a fixed little-endian layout:
//! `status: u16` at 0, `id: u16` at 2, `size: u32` at 4, `result: i32` at 8.
//! The device may return a shorter frame when the trailing fields are not
//! meaningful for the operation; larger frames carry reserved bytes that the
//! host ignores.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum ReplyError {
    #[error("Service reply too small: expected at least {expected} bytes, got {actual}")]
    FrameTooSmall { expected: usize, actual: usize },
}

/// Reply status of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Pending,
    Busy,
    NoMemory,
    NotFound,
    /// A status code this host does not know.
    Unknown(u16),
}

impl Status {
    pub fn from_code(code: u16) -> Self {
        match code {
            STATUS_OK => Status::Ok,
            STATUS_ERROR => Status::Error,
            STATUS_PENDING => Status::Pending,
            STATUS_BUSY => Status::Busy,
            STATUS_NO_MEMORY => Status::NoMemory,
            STATUS_NOT_FOUND => Status::NotFound,
            other => Status::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => STATUS_OK,
            Status::Error => STATUS_ERROR,
            Status::Pending => STATUS_PENDING,
            Status::Busy => STATUS_BUSY,
            Status::NoMemory => STATUS_NO_MEMORY,
            Status::NotFound => STATUS_NOT_FOUND,
            Status::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Error => write!(f, "ERROR"),
            Status::Pending => write!(f, "PENDING"),
            Status::Busy => write!(f, "BUSY"),
            Status::NoMemory => write!(f, "NO_MEMORY"),
            Status::NotFound => write!(f, "NOT_FOUND"),
            Status::Unknown(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

/// Parsed service reply.
///
/// Fields past `status` are `None` when the frame was too short to carry
/// them; callers validate presence against the operation they performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceReply {
    pub status: Status,
    /// Server-assigned protocol slot id.
    pub id: Option<u16>,
    /// Reply payload length.
    pub size: Option<u32>,
    /// Caller-visible result code.
    pub result: Option<i32>,
}

impl ServiceReply {
    /// Parse a reply frame. At least the status field must be present.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ReplyError> {
        if data.len() < 2 {
            return Err(ReplyError::FrameTooSmall {
                expected: 2,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let status = Status::from_code(cursor.read_u16::<LittleEndian>().unwrap());
        let id = cursor.read_u16::<LittleEndian>().ok();
        let size = cursor.read_u32::<LittleEndian>().ok();
        let result = cursor.read_i32::<LittleEndian>().ok();
        Ok(Self {
            status,
            id,
            size,
            result,
        })
    }
}

impl fmt::Display for ServiceReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status={}", self.status)?;
        if let Some(id) = self.id {
            write!(f, " id={id}")?;
        }
        if let Some(size) = self.size {
            write!(f, " size={size}")?;
        }
        if let Some(result) = self.result {
            write!(f, " result={result}")?;
        }
        Ok(())
    }
}

/// Encode a reply frame; the device-side counterpart of [`ServiceReply::from_bytes`].
///
/// Used by the mock transport and by round-trip tests.
pub fn encode_reply(status: u16, id: u16, size: u32, result: i32) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    let mut buf = Vec::with_capacity(SERVICE_REPLY_SIZE as usize);
    buf.write_u16::<LittleEndian>(status).unwrap();
    buf.write_u16::<LittleEndian>(id).unwrap();
    buf.write_u32::<LittleEndian>(size).unwrap();
    buf.write_i32::<LittleEndian>(result).unwrap();
    // Reserved tail up to the full frame size.
    buf.resize(SERVICE_REPLY_SIZE as usize, 0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_over_all_status_codes() {
        for code in [
            STATUS_OK,
            STATUS_ERROR,
            STATUS_PENDING,
            STATUS_BUSY,
            STATUS_NO_MEMORY,
            STATUS_NOT_FOUND,
            0x7FFF,
        ] {
            let frame = encode_reply(code, 7, 4, -160);
            let reply = ServiceReply::from_bytes(&frame).unwrap();
            assert_eq!(reply.status.code(), code);
            assert_eq!(reply.id, Some(7));
            assert_eq!(reply.size, Some(4));
            assert_eq!(reply.result, Some(-160));
        }
    }

    #[test]
    fn test_short_frame_drops_trailing_fields() {
        // status + id only
        let reply = ServiceReply::from_bytes(&[0x00, 0x00, 0x0B, 0x00]).unwrap();
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.id, Some(11));
        assert_eq!(reply.size, None);
        assert_eq!(reply.result, None);
    }

    #[test]
    fn test_oversized_frame_ignores_tail() {
        let mut frame = encode_reply(STATUS_OK, 1, 0, 0);
        frame.extend_from_slice(&[0xAA; 16]);
        let reply = ServiceReply::from_bytes(&frame).unwrap();
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.id, Some(1));
    }

    #[test]
    fn test_undersized_frame_is_rejected() {
        assert!(ServiceReply::from_bytes(&[0x02]).is_err());
        assert!(ServiceReply::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_little_endian_layout() {
        let frame = encode_reply(0x0102, 0x0304, 0x0506_0708, 0x0A0B_0C0D);
        assert_eq!(
            &frame[..12],
            &[0x02, 0x01, 0x04, 0x03, 0x08, 0x07, 0x06, 0x05, 0x0D, 0x0C, 0x0B, 0x0A]
        );
    }
}
