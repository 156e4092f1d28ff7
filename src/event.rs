//! Event handling for per-device status changes.
//!
//! Status writes that matter to the dashboard emit a [`BridgeEvent`]; the
//! daemon forwards them as D-Bus signals.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::status::{ConnectionState, DeviceStatus, ProcessState};

/// Events that can be emitted by a device's supervisors.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
   ConnectionChanged(ConnectionState),
   ProcessChanged(ProcessState),
   PlaybackChanged(bool),
   VolumeChanged { volume: u8, muted: bool },
   DeviceError(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: &DeviceStatus, event: BridgeEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

