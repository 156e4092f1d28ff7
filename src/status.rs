//! Per-device status shared between supervisors and the dashboard.
//!
//! Each [`DeviceStatus`] is written by at most two supervisors (connection and
//! process) and read concurrently by the dashboard. Every field is updated
//! atomically on its own, so no lock is ever held across devices or across
//! an await point.

use std::{
   mem,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
   },
   time::SystemTime,
};

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;

use crate::{
   bluetooth::MacAddress,
   event::{BridgeEvent, EventSender},
};

/// Bluetooth link state of one device.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
   #[default]
   Disconnected,
   Pairing,
   Connecting,
   Connected,
   Reconnecting,
}

/// Lifecycle state of one player process.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessState {
   #[default]
   Stopped,
   Starting,
   Running,
   /// Not running because the Bluetooth sink is gone.
   Suspended,
}

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn replace(dst: &Mutex<Option<T>>, new: Option<T>) -> Self {
      let mut lock = dst.lock();
      if *lock == new {
         return Self::Noop;
      }
      Self::new(mem::replace(&mut *lock, new), lock.is_some())
   }

   fn new(prev: Option<T>, now_some: bool) -> Self {
      match (prev, now_some) {
         (None, true) => Self::Inserted,
         (Some(p), false) => Self::Deleted(p),
         (Some(p), true) => Self::Updated(p),
         (None, false) => Self::Noop,
      }
   }

   pub const fn is_noop(&self) -> bool {
      matches!(self, Self::Noop)
   }
}

/// Static identity of a device as shown on the dashboard.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
   pub key: SmolStr,
   pub name: SmolStr,
   pub mac: Option<MacAddress>,
   pub adapter: Option<SmolStr>,
   pub listen_address: SmolStr,
   pub hostname: SmolStr,
}

struct DeviceStatusInner {
   identity: DeviceIdentity,
   started_at: u64,
   events: EventSender,

   enabled: AtomicBool,
   bluetooth_available: AtomicBool,

   connection: AtomicCell<ConnectionState>,
   reconnect_attempt: AtomicU32,
   connected_since: AtomicCell<Option<u64>>,

   process: AtomicCell<ProcessState>,
   pid: AtomicCell<Option<u32>>,
   process_started_at: AtomicCell<Option<u64>>,
   server_connected: AtomicBool,
   server_connected_at: AtomicCell<Option<u64>>,

   sink: Mutex<Option<SmolStr>>,
   volume: AtomicU8,
   muted: AtomicBool,
   playing: AtomicBool,
   audio_format: Mutex<Option<SmolStr>>,
   last_sync_error_ms: AtomicCell<Option<f64>>,
   reanchor_count: AtomicU64,
   reanchoring: AtomicBool,
   last_error: Mutex<Option<SmolStr>>,

   link_ticks: AtomicU64,
   liveness_ticks: AtomicU64,
}

/// Live status of one device.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct DeviceStatus(Arc<DeviceStatusInner>);

impl std::fmt::Debug for DeviceStatus {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("DeviceStatus")
         .field("key", &self.0.identity.key)
         .field("connection", &self.connection())
         .field("process", &self.process())
         .finish_non_exhaustive()
   }
}

/// Point-in-time copy of a device's status, as consumed by the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
   pub key: SmolStr,
   pub name: SmolStr,
   pub mac: Option<MacAddress>,
   pub adapter: Option<SmolStr>,
   pub enabled: bool,
   pub bluetooth_available: bool,
   pub connection_state: ConnectionState,
   pub reconnecting: bool,
   pub reconnect_attempt: u32,
   pub connected_since: Option<u64>,
   pub process_state: ProcessState,
   pub pid: Option<u32>,
   pub process_started_at: Option<u64>,
   pub server_connected: bool,
   pub server_connected_at: Option<u64>,
   pub sink: Option<SmolStr>,
   pub volume: u8,
   pub muted: bool,
   pub playing: bool,
   pub audio_format: Option<SmolStr>,
   pub last_sync_error_ms: Option<f64>,
   pub reanchor_count: u64,
   pub reanchoring: bool,
   pub last_error: Option<SmolStr>,
   pub listen_address: SmolStr,
   pub hostname: SmolStr,
   pub uptime_secs: u64,
   pub link_ticks: u64,
   pub liveness_ticks: u64,
}

impl DeviceStatus {
   pub fn new(identity: DeviceIdentity, enabled: bool, events: EventSender) -> Self {
      Self(Arc::new(DeviceStatusInner {
         identity,
         started_at: unix_now(),
         events,
         enabled: AtomicBool::new(enabled),
         bluetooth_available: AtomicBool::new(false),
         connection: AtomicCell::new(ConnectionState::Disconnected),
         reconnect_attempt: AtomicU32::new(0),
         connected_since: AtomicCell::new(None),
         process: AtomicCell::new(ProcessState::Stopped),
         pid: AtomicCell::new(None),
         process_started_at: AtomicCell::new(None),
         server_connected: AtomicBool::new(false),
         server_connected_at: AtomicCell::new(None),
         sink: Mutex::new(None),
         volume: AtomicU8::new(100),
         muted: AtomicBool::new(false),
         playing: AtomicBool::new(false),
         audio_format: Mutex::new(None),
         last_sync_error_ms: AtomicCell::new(None),
         reanchor_count: AtomicU64::new(0),
         reanchoring: AtomicBool::new(false),
         last_error: Mutex::new(None),
         link_ticks: AtomicU64::new(0),
         liveness_ticks: AtomicU64::new(0),
      }))
   }

   fn emit(&self, event: BridgeEvent) {
      self.0.events.emit(self, event);
   }

   pub fn key(&self) -> &SmolStr {
      &self.0.identity.key
   }

   pub fn name(&self) -> &SmolStr {
      &self.0.identity.name
   }

   pub fn mac(&self) -> Option<MacAddress> {
      self.0.identity.mac
   }

   // === Management ===

   pub fn enabled(&self) -> bool {
      self.0.enabled.load(Ordering::Relaxed)
   }

   pub fn set_enabled(&self, enabled: bool) {
      self.0.enabled.store(enabled, Ordering::Relaxed);
   }

   pub fn set_bluetooth_available(&self, available: bool) {
      self.0.bluetooth_available.store(available, Ordering::Relaxed);
   }

   // === Connection ===

   pub fn connection(&self) -> ConnectionState {
      self.0.connection.load()
   }

   pub fn set_connection(&self, state: ConnectionState) {
      if self.0.connection.swap(state) != state {
         self.emit(BridgeEvent::ConnectionChanged(state));
      }
   }

   pub fn reconnect_attempt(&self) -> u32 {
      self.0.reconnect_attempt.load(Ordering::Relaxed)
   }

   /// Increments the reconnect counter and returns the new attempt number.
   pub fn bump_reconnect_attempt(&self) -> u32 {
      self.0.reconnect_attempt.fetch_add(1, Ordering::Relaxed) + 1
   }

   /// Records a successful connection: resets the attempt counter and stamps
   /// `connected_since`.
   pub fn mark_connected(&self) {
      self.0.reconnect_attempt.store(0, Ordering::Relaxed);
      self.0.connected_since.store(Some(unix_now()));
      self.set_connection(ConnectionState::Connected);
   }

   pub fn connected_since(&self) -> Option<u64> {
      self.0.connected_since.load()
   }

   // === Process ===

   pub fn process(&self) -> ProcessState {
      self.0.process.load()
   }

   pub fn set_process(&self, state: ProcessState) {
      if self.0.process.swap(state) != state {
         self.emit(BridgeEvent::ProcessChanged(state));
      }
   }

   pub fn set_pid(&self, pid: Option<u32>) {
      self.0.pid.store(pid);
      self.0.process_started_at.store(pid.map(|_| unix_now()));
   }

   pub fn pid(&self) -> Option<u32> {
      self.0.pid.load()
   }

   pub fn server_connected(&self) -> bool {
      self.0.server_connected.load(Ordering::Relaxed)
   }

   /// Updates the server link flag, stamping the time of every edge.
   pub fn set_server_connected(&self, connected: bool) {
      if self.0.server_connected.swap(connected, Ordering::Relaxed) != connected {
         self.0.server_connected_at.store(Some(unix_now()));
      }
   }

   // === Audio ===

   pub fn sink(&self) -> Option<SmolStr> {
      self.0.sink.lock().clone()
   }

   pub fn set_sink(&self, sink: Option<SmolStr>) -> UpdateOp<SmolStr> {
      UpdateOp::replace(&self.0.sink, sink)
   }

   pub fn volume(&self) -> u8 {
      self.0.volume.load(Ordering::Relaxed)
   }

   pub fn muted(&self) -> bool {
      self.0.muted.load(Ordering::Relaxed)
   }

   pub fn set_volume(&self, volume: u8) {
      let volume = volume.min(100);
      if self.0.volume.swap(volume, Ordering::Relaxed) != volume {
         self.emit(BridgeEvent::VolumeChanged {
            volume,
            muted: self.muted(),
         });
      }
   }

   pub fn set_muted(&self, muted: bool) {
      if self.0.muted.swap(muted, Ordering::Relaxed) != muted {
         self.emit(BridgeEvent::VolumeChanged {
            volume: self.volume(),
            muted,
         });
      }
   }

   // === Playback ===

   pub fn playing(&self) -> bool {
      self.0.playing.load(Ordering::Relaxed)
   }

   pub fn set_playing(&self, playing: bool) {
      if self.0.playing.swap(playing, Ordering::Relaxed) != playing {
         self.emit(BridgeEvent::PlaybackChanged(playing));
      }
   }

   pub fn audio_format(&self) -> Option<SmolStr> {
      self.0.audio_format.lock().clone()
   }

   pub fn set_audio_format(&self, format: Option<SmolStr>) -> UpdateOp<SmolStr> {
      UpdateOp::replace(&self.0.audio_format, format)
   }

   /// Records a re-anchor event and returns the new count.
   pub fn record_reanchor(&self, sync_error_ms: Option<f64>) -> u64 {
      if sync_error_ms.is_some() {
         self.0.last_sync_error_ms.store(sync_error_ms);
      }
      self.0.reanchoring.store(true, Ordering::Relaxed);
      self.0.reanchor_count.fetch_add(1, Ordering::Relaxed) + 1
   }

   pub fn reanchoring(&self) -> bool {
      self.0.reanchoring.load(Ordering::Relaxed)
   }

   pub fn clear_reanchoring(&self) {
      self.0.reanchoring.store(false, Ordering::Relaxed);
   }

   pub fn reanchor_count(&self) -> u64 {
      self.0.reanchor_count.load(Ordering::Relaxed)
   }

   pub fn last_sync_error_ms(&self) -> Option<f64> {
      self.0.last_sync_error_ms.load()
   }

   // === Errors ===

   pub fn last_error(&self) -> Option<SmolStr> {
      self.0.last_error.lock().clone()
   }

   pub fn set_error(&self, message: impl Into<SmolStr>) {
      let message = message.into();
      if !UpdateOp::replace(&self.0.last_error, Some(message.clone())).is_noop() {
         self.emit(BridgeEvent::DeviceError(message));
      }
   }

   pub fn clear_error(&self) {
      *self.0.last_error.lock() = None;
   }

   // === Scheduler diagnostics ===

   pub fn tick_link(&self) {
      self.0.link_ticks.fetch_add(1, Ordering::Relaxed);
   }

   pub fn tick_liveness(&self) {
      self.0.liveness_ticks.fetch_add(1, Ordering::Relaxed);
   }

   pub fn link_ticks(&self) -> u64 {
      self.0.link_ticks.load(Ordering::Relaxed)
   }

   pub fn liveness_ticks(&self) -> u64 {
      self.0.liveness_ticks.load(Ordering::Relaxed)
   }

   /// Takes a consistent-per-field copy of the status.
   pub fn snapshot(&self) -> StatusSnapshot {
      let inner = &*self.0;
      let connection = self.connection();
      StatusSnapshot {
         key: inner.identity.key.clone(),
         name: inner.identity.name.clone(),
         mac: inner.identity.mac,
         adapter: inner.identity.adapter.clone(),
         enabled: self.enabled(),
         bluetooth_available: inner.bluetooth_available.load(Ordering::Relaxed),
         connection_state: connection,
         reconnecting: connection == ConnectionState::Reconnecting,
         reconnect_attempt: self.reconnect_attempt(),
         connected_since: self.connected_since(),
         process_state: self.process(),
         pid: self.pid(),
         process_started_at: inner.process_started_at.load(),
         server_connected: self.server_connected(),
         server_connected_at: inner.server_connected_at.load(),
         sink: self.sink(),
         volume: self.volume(),
         muted: self.muted(),
         playing: self.playing(),
         audio_format: self.audio_format(),
         last_sync_error_ms: self.last_sync_error_ms(),
         reanchor_count: self.reanchor_count(),
         reanchoring: self.reanchoring(),
         last_error: self.last_error(),
         listen_address: inner.identity.listen_address.clone(),
         hostname: inner.identity.hostname.clone(),
         uptime_secs: unix_now().saturating_sub(inner.started_at),
         link_ticks: self.link_ticks(),
         liveness_ticks: self.liveness_ticks(),
      }
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
   }
}

/// Read view over every configured device's status.
#[derive(Debug, Clone, Default)]
pub struct StatusStore {
   devices: Arc<[DeviceStatus]>,
}

impl StatusStore {
   pub fn new(devices: Vec<DeviceStatus>) -> Self {
      Self {
         devices: devices.into(),
      }
   }

   pub fn get(&self, key: &str) -> Option<&DeviceStatus> {
      self.iter().find(|d| d.key() == key)
   }

   pub fn iter(&self) -> impl Iterator<Item = &DeviceStatus> {
      self.devices.iter()
   }

   pub fn len(&self) -> usize {
      self.devices.len()
   }

   pub fn snapshots(&self) -> Vec<StatusSnapshot> {
      self.iter().map(DeviceStatus::snapshot).collect()
   }
}

pub fn unix_now() -> u64 {
   SystemTime::now()
      .duration_since(SystemTime::UNIX_EPOCH)
      .map_or(0, |d| d.as_secs())
}
