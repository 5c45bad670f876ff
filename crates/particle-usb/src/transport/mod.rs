//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBehavior, MockTransport, Transfer};
pub use self::nusb::NusbTransport;
pub use traits::{TransportError, UsbTransport};
