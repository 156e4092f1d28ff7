//! Error types for the bridge daemon.
//!
//! Supervisors never propagate host-tool failures upward; these errors only
//! surface at startup and on the dashboard command boundary.

use smol_str::SmolStr;
use thiserror::Error;
use tokio::task::JoinError;

use crate::{audio::volume_store, bluetooth::MacAddress};

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Volume store error: {0}")]
   VolumeStore(#[from] volume_store::Error),

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(SmolStr),

   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("Device {0} has Bluetooth management released")]
   DeviceReleased(SmolStr),

   #[error("Device {0} has no Bluetooth speaker configured")]
   NoBluetooth(SmolStr),

   #[error("Audio sink not found for {0}")]
   SinkUnavailable(MacAddress),

   #[error("Host command `{command}` failed: {output}")]
   CommandFailed { command: SmolStr, output: String },

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Supervisor task panicked: {0}")]
   SupervisorPanicked(JoinError),

   #[error("Supervisor has been shut down")]
   SupervisorShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
