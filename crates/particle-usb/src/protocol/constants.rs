//! Protocol constants for the vendor service-request protocol.
//!
//! The service protocol multiplexes logical control requests over a single
//! vendor-specific USB control request. Values mirror the device firmware's
//! control-request contract.

// ============================================================================
// Setup packet fields
// ============================================================================

/// Vendor bRequest used for all service transfers (ASCII 'P').
pub const PARTICLE_BREQUEST: u8 = 0x50;

/// bmRequestType for vendor IN transfers (device-to-host).
pub const BMREQUEST_DEVICE_TO_HOST: u8 = 0xC0;

/// bmRequestType for vendor OUT transfers (host-to-device).
pub const BMREQUEST_HOST_TO_DEVICE: u8 = 0x40;

/// bmRequestType for DFU class IN transfers (class, interface recipient).
pub const BMREQUEST_DFU_IN: u8 = 0xA1;

/// bmRequestType for DFU class OUT transfers.
pub const BMREQUEST_DFU_OUT: u8 = 0x21;

// ============================================================================
// Size limits
// ============================================================================

/// Maximum payload size of a logical request or reply.
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Maximum logical request type code.
pub const MAX_REQUEST_TYPE: u16 = 65535;

/// Size of a full service-reply frame. The device may return fewer bytes;
/// trailing bytes beyond the known fields are reserved and ignored.
pub const SERVICE_REPLY_SIZE: u16 = 16;

// ============================================================================
// Timeouts and polling
// ============================================================================

/// Per-transfer USB timeout, distinct from logical-request timeouts.
pub const CONTROL_TRANSFER_TIMEOUT_MS: u64 = 5000;

/// Default logical-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30000;

/// Default CHECK backoff schedule in milliseconds, saturating at the last
/// entry.
pub const DEFAULT_CHECK_DELAYS_MS: &[u64] = &[50, 50, 100, 100, 250, 250, 500, 500, 1000];

// ============================================================================
// Service reply status codes (Device -> Host)
// ============================================================================

pub const STATUS_OK: u16 = 0;
pub const STATUS_ERROR: u16 = 1;
pub const STATUS_PENDING: u16 = 2;
pub const STATUS_BUSY: u16 = 3;
pub const STATUS_NO_MEMORY: u16 = 4;
pub const STATUS_NOT_FOUND: u16 = 5;

// ============================================================================
// Known request types
// ============================================================================
//
// The engine treats the type as an opaque u16; these are the codes the
// firmware's control-request enumeration assigns to system operations.

pub const REQUEST_APP_CUSTOM: u16 = 10;
pub const REQUEST_DEVICE_ID: u16 = 20;
pub const REQUEST_SERIAL_NUMBER: u16 = 21;
pub const REQUEST_SYSTEM_VERSION: u16 = 30;
pub const REQUEST_RESET: u16 = 40;
pub const REQUEST_FACTORY_RESET: u16 = 41;
pub const REQUEST_DFU_MODE: u16 = 50;
pub const REQUEST_SAFE_MODE: u16 = 60;
pub const REQUEST_START_LISTENING: u16 = 70;
pub const REQUEST_STOP_LISTENING: u16 = 71;
pub const REQUEST_MODULE_INFO: u16 = 90;
pub const REQUEST_DIAGNOSTIC_INFO: u16 = 100;
pub const REQUEST_WIFI_SCAN: u16 = 112;

// ============================================================================
// Request result codes (caller-visible, firmware system error values)
// ============================================================================

pub const RESULT_OK: i32 = 0;
pub const RESULT_UNKNOWN: i32 = -100;
pub const RESULT_BUSY: i32 = -110;
pub const RESULT_NOT_SUPPORTED: i32 = -120;
pub const RESULT_NOT_ALLOWED: i32 = -130;
pub const RESULT_CANCELLED: i32 = -140;
pub const RESULT_ABORTED: i32 = -150;
pub const RESULT_TIMEOUT: i32 = -160;
pub const RESULT_NOT_FOUND: i32 = -170;
pub const RESULT_ALREADY_EXISTS: i32 = -180;
pub const RESULT_TOO_LARGE: i32 = -190;
pub const RESULT_LIMIT_EXCEEDED: i32 = -200;
pub const RESULT_INVALID_STATE: i32 = -210;
pub const RESULT_IO: i32 = -220;
pub const RESULT_NETWORK: i32 = -230;
pub const RESULT_PROTOCOL: i32 = -240;
pub const RESULT_INTERNAL: i32 = -250;
pub const RESULT_NO_MEMORY: i32 = -260;
pub const RESULT_INVALID_ARGUMENT: i32 = -270;
pub const RESULT_BAD_DATA: i32 = -280;
pub const RESULT_OUT_OF_RANGE: i32 = -290;

/// Readable message for a known result code.
pub fn result_message(result: i32) -> &'static str {
    match result {
        RESULT_OK => "Operation succeeded",
        RESULT_UNKNOWN => "Unknown error",
        RESULT_BUSY => "Resource busy",
        RESULT_NOT_SUPPORTED => "Not supported",
        RESULT_NOT_ALLOWED => "Not allowed",
        RESULT_CANCELLED => "Operation cancelled",
        RESULT_ABORTED => "Operation aborted",
        RESULT_TIMEOUT => "Timeout error",
        RESULT_NOT_FOUND => "Not found",
        RESULT_ALREADY_EXISTS => "Already exists",
        RESULT_TOO_LARGE => "Data is too large",
        RESULT_LIMIT_EXCEEDED => "Limit exceeded",
        RESULT_INVALID_STATE => "Invalid state",
        RESULT_IO => "IO error",
        RESULT_NETWORK => "Network error",
        RESULT_PROTOCOL => "Protocol error",
        RESULT_INTERNAL => "Internal error",
        RESULT_NO_MEMORY => "Memory allocation error",
        RESULT_INVALID_ARGUMENT => "Invalid argument",
        RESULT_BAD_DATA => "Invalid data format",
        RESULT_OUT_OF_RANGE => "Out of range",
        _ => "Request error",
    }
}
