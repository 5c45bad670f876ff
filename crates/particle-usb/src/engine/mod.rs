//! Request engine module.

pub mod pump;
pub mod request;

pub use pump::{Progress, RequestEngine};
pub use request::{
    ConstantPolling, DefaultPolling, PollingPolicy, Reply, ReplyData, RequestData,
};
