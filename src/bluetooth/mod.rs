//! Bluetooth link management through the host's `bluetoothctl`.

pub mod address;
pub mod controller;
pub mod supervisor;

pub use address::MacAddress;
pub use controller::{BluetoothController, BluetoothSurface, Bluetoothctl};
pub use supervisor::{ConnectionSupervisor, LinkHandle, LinkTimings};
