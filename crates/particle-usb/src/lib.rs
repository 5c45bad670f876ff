//! particle-usb: host-side control-request protocol for Particle devices.
//!
//! This crate speaks the vendor service-request protocol that multiplexes
//! logical requests over USB control transfers, and the DFU 1.1 flow used to
//! leave bootloader mode.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Setup-packet encoders and service-reply parsing
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Engine**: Multiplexed request state machine driven by a pump
//! - **DFU**: DFU 1.1 client for bootloader-mode devices
//! - **Device**: Stateful façade holding identity and lifecycle
//! - **Events**: Observer pattern for lifecycle notifications
//!
//! # Example
//!
//! ```no_run
//! use particle_usb::{SendRequestOptions, open_device_by_id};
//!
//! let mut device = open_device_by_id("e00fce68f1d2a3b4c5d6e7f8")?;
//! let reply = device.send_request(
//!     particle_usb::protocol::REQUEST_DEVICE_ID,
//!     None,
//!     &SendRequestOptions::default(),
//! )?;
//! println!("result: {}", reply.result);
//! device.close(&Default::default())?;
//! # Ok::<(), particle_usb::Error>(())
//! ```

pub mod config;
pub mod device;
pub mod device_type;
pub mod dfu;
pub mod engine;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use config::OpenOptions;
pub use device::{
    CloseOptions, Device, DeviceState, SendRequestOptions, list_devices, open_device_by_id,
};
pub use device_type::{DEVICE_TABLE, DeviceInfo, DeviceType, UsbIds, classify};
pub use dfu::{DfuClient, DfuDeviceStatus, DfuRequest, DfuState, DfuStatusReport};
pub use engine::{
    ConstantPolling, DefaultPolling, PollingPolicy, Reply, ReplyData, RequestData, RequestEngine,
};
pub use error::{Error, Result, cause_chain};
pub use events::{DeviceEvent, DeviceObserver, NullObserver, TracingObserver};
pub use protocol::{ServiceReply, SetupPacket, Status};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
