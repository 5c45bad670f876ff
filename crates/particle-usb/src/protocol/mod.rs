//! Protocol module - service-request wire definitions.

pub mod constants;
pub mod reply;
pub mod setup;

pub use constants::*;
pub use reply::{ReplyError, ServiceReply, Status, encode_reply};
pub use setup::{
    ServiceKind, SetupPacket, check_setup, init_setup, recv_setup, reset_setup, send_setup,
};
