use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{error::BridgeError, orchestrator::Bridge};

pub const SERVICE_NAME: &str = "org.sendspin.bridge";
pub const OBJECT_PATH: &str = "/org/sendspin/bridge";

fn to_fdo(e: BridgeError) -> zbus::fdo::Error {
   match e {
      BridgeError::DeviceNotFound(_) | BridgeError::NoBluetooth(_) => {
         zbus::fdo::Error::InvalidArgs(e.to_string())
      },
      e => zbus::fdo::Error::Failed(e.to_string()),
   }
}

pub struct BridgeService {
   bridge: Bridge,
}

impl BridgeService {
   pub const fn new(bridge: Bridge) -> Self {
      Self { bridge }
   }
}

#[interface(name = "org.sendspin.Bridge")]
impl BridgeService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      serde_json::to_string(&self.bridge.store().snapshots())
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn get_device(&self, key: String) -> zbus::fdo::Result<String> {
      let status = self
         .bridge
         .store()
         .get(&key)
         .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Device not found: {key}")))?;
      Ok(status.to_json().to_string())
   }

   async fn set_volume(&self, key: String, volume: u8) -> zbus::fdo::Result<bool> {
      if volume > 100 {
         return Err(zbus::fdo::Error::InvalidArgs(format!(
            "Volume out of range: {volume}"
         )));
      }
      self.bridge.set_volume(&key, volume).await.map_err(to_fdo)?;
      info!("Set volume of {key} to {volume}%");
      Ok(true)
   }

   async fn set_mute(&self, key: String, muted: bool) -> zbus::fdo::Result<bool> {
      self.bridge.set_mute(&key, muted).await.map_err(to_fdo)?;
      info!("Set mute of {key} to {muted}");
      Ok(true)
   }

   async fn reconnect(&self, key: String) -> zbus::fdo::Result<bool> {
      self.bridge.reconnect(&key).await.map_err(to_fdo)?;
      info!("Reconnect requested for {key}");
      Ok(true)
   }

   async fn repair(&self, key: String) -> zbus::fdo::Result<bool> {
      self.bridge.repair(&key).await.map_err(to_fdo)?;
      info!("Re-pair requested for {key}");
      Ok(true)
   }

   async fn set_enabled(&self, key: String, enabled: bool) -> zbus::fdo::Result<bool> {
      self
         .bridge
         .set_enabled(&key, enabled)
         .await
         .map_err(to_fdo)?;
      info!(
         "{} {key}",
         if enabled { "Reclaimed" } else { "Released" }
      );
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_changed(
      emitter: &SignalEmitter<'_>,
      key: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn process_changed(
      emitter: &SignalEmitter<'_>,
      key: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn playback_changed(
      emitter: &SignalEmitter<'_>,
      key: &str,
      playing: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn volume_changed(
      emitter: &SignalEmitter<'_>,
      key: &str,
      volume: u8,
      muted: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(
      emitter: &SignalEmitter<'_>,
      key: &str,
      message: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn device_count(&self) -> u32 {
      u32::try_from(self.bridge.store().len()).unwrap_or(u32::MAX)
   }
}
