//! Audio routing for Bluetooth speakers.

pub mod router;
pub mod volume_store;

pub use router::{AudioSinkRouter, AudioSurface, Pactl, SinkTimings};
pub use volume_store::VolumeStore;
