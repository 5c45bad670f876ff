//! Device lifecycle events.
//!
//! A minimal observer so callers can invalidate cached device-side
//! information when a handle opens or closes, without coupling to the
//! engine.

use std::fmt;

/// Events emitted by a device handle, exactly once per open cycle each.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// The handle reached the open state.
    Open { device_id: String },
    /// The handle was closed.
    Closed { device_id: String },
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::Open { device_id } => write!(f, "open({device_id})"),
            DeviceEvent::Closed { device_id } => write!(f, "closed({device_id})"),
        }
    }
}

/// Observer trait for receiving device events.
pub trait DeviceObserver: Send + Sync {
    fn on_event(&self, event: &DeviceEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DeviceObserver for NullObserver {
    fn on_event(&self, _event: &DeviceEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DeviceObserver for TracingObserver {
    fn on_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Open { device_id } => {
                tracing::info!(device_id = %device_id, "Device opened");
            }
            DeviceEvent::Closed { device_id } => {
                tracing::info!(device_id = %device_id, "Device closed");
            }
        }
    }
}
