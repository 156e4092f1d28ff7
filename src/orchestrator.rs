//! Wiring of the per-device supervisors.
//!
//! Every configured device gets its own ProcessSupervisor and, when it has a
//! Bluetooth address, its own ConnectionSupervisor. Devices share nothing but
//! the host runner behind the backends, so one device's failures never
//! block another's.

use std::{net::UdpSocket, sync::Arc, time::Duration};

use futures::future::join_all;
use log::{error, info, warn};
use smol_str::{SmolStr, ToSmolStr, format_smolstr};
use tokio::{task::JoinSet, time};

use crate::{
   audio::{AudioSinkRouter, AudioSurface, SinkTimings, VolumeStore},
   bluetooth::{
      BluetoothController, BluetoothSurface, ConnectionSupervisor, LinkHandle,
      controller::resolve_adapter,
   },
   config::{Config, Device},
   error::{BridgeError, Result},
   event::EventSender,
   mpris::PlaybackPauser,
   player::{PlayerHandle, PlayerLauncher, PlayerSettings, ProcessSupervisor},
   status::{DeviceIdentity, DeviceStatus, StatusStore},
};

/// Upper bound for pausing players on shutdown
const PAUSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound for each supervisor to stop on its own
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Host tool surfaces shared by every device.
pub struct Backends<B, L, A> {
   pub bluetooth: B,
   pub launcher: L,
   pub audio: A,
}

#[derive(Debug)]
struct DeviceHandle {
   status: DeviceStatus,
   link: Option<LinkHandle>,
   player: PlayerHandle,
}

/// Command entry point for the dashboard.
///
/// This type is cheaply cloneable.
#[derive(Clone, Debug)]
pub struct Bridge {
   store: StatusStore,
   devices: Arc<[DeviceHandle]>,
}

impl Bridge {
   pub fn store(&self) -> &StatusStore {
      &self.store
   }

   fn device(&self, key: &str) -> Result<&DeviceHandle> {
      self
         .devices
         .iter()
         .find(|d| d.status.key() == key)
         .ok_or_else(|| BridgeError::DeviceNotFound(key.into()))
   }

   fn link(&self, key: &str) -> Result<&LinkHandle> {
      self
         .device(key)?
         .link
         .as_ref()
         .ok_or_else(|| BridgeError::NoBluetooth(key.into()))
   }

   pub async fn set_volume(&self, key: &str, volume: u8) -> Result<()> {
      self.device(key)?.player.set_volume(volume).await
   }

   pub async fn set_mute(&self, key: &str, muted: bool) -> Result<()> {
      self.device(key)?.player.set_mute(muted).await
   }

   pub async fn reconnect(&self, key: &str) -> Result<()> {
      self.link(key)?.reconnect().await
   }

   pub async fn repair(&self, key: &str) -> Result<()> {
      self.link(key)?.repair().await
   }

   /// Releases a device to the host, or takes it back.
   pub async fn set_enabled(&self, key: &str, enabled: bool) -> Result<()> {
      let device = self.device(key)?;
      if let Some(link) = &device.link {
         return link.set_enabled(enabled).await;
      }

      device.status.set_enabled(enabled);
      if enabled {
         device.player.reclaim().await
      } else {
         device.player.release().await
      }
   }
}

/// Owns every supervisor task.
pub struct DeviceOrchestrator {
   bridge: Bridge,
   tasks: JoinSet<()>,
}

impl DeviceOrchestrator {
   /// Spawns the supervisors of every device.
   pub async fn start<B, L, A>(
      config: &Config,
      devices: Vec<Device>,
      backends: Backends<B, L, A>,
      volumes: Option<VolumeStore>,
      events: EventSender,
   ) -> Self
   where
      B: BluetoothSurface + Clone,
      L: PlayerLauncher + Clone,
      A: AudioSurface + Clone,
   {
      let hostname = hostname();
      let detected_ip = local_ip();
      let server_url = config.server_url();
      let mut tasks = JoinSet::new();
      let mut handles = Vec::with_capacity(devices.len());

      for device in devices {
         let adapter = match (&device.mac, &device.adapter) {
            (Some(_), Some(adapter)) => Some(resolve_adapter(&backends.bluetooth, adapter).await),
            _ => device.adapter.clone(),
         };
         let host = device
            .listen_host
            .clone()
            .or_else(|| detected_ip.clone())
            .unwrap_or_else(|| SmolStr::new_static("0.0.0.0"));

         let status = DeviceStatus::new(
            DeviceIdentity {
               key: device.key.clone(),
               name: device.name.clone(),
               mac: device.mac,
               adapter: adapter.clone(),
               listen_address: format_smolstr!("{host}:{}", device.listen_port),
               hostname: hostname.clone(),
            },
            device.enabled,
            events.clone(),
         );

         let router = Arc::new(AudioSinkRouter::new(
            backends.audio.clone(),
            volumes.clone(),
            SinkTimings::default(),
         ));
         let settings = PlayerSettings {
            program: config.player_binary.clone(),
            name: device.name.clone(),
            slug: device.slug.clone(),
            port: device.listen_port,
            work_dir: config.work_dir.clone(),
            static_delay_ms: device.static_delay_ms,
            server_url: server_url.clone(),
         };
         let (player, player_handle) = ProcessSupervisor::new(
            settings,
            config.player_timings(),
            backends.launcher.clone(),
            router,
            status.clone(),
         );
         tasks.spawn(player.run());

         let link = device.mac.map(|mac| {
            let controller =
               BluetoothController::new(backends.bluetooth.clone(), adapter, mac, device.name.clone());
            let (supervisor, handle) = ConnectionSupervisor::new(
               controller,
               status.clone(),
               player_handle.clone(),
               config.link_timings(),
            );
            tasks.spawn(supervisor.run());
            handle
         });

         info!(
            "Managing {} ({}) on port {}",
            device.name,
            device
               .mac
               .map_or_else(|| SmolStr::new_static("default output"), |m| m.to_smolstr()),
            device.listen_port
         );
         handles.push(DeviceHandle {
            status,
            link,
            player: player_handle,
         });
      }

      let store = StatusStore::new(handles.iter().map(|h| h.status.clone()).collect());
      Self {
         bridge: Bridge {
            store,
            devices: handles.into(),
         },
         tasks,
      }
   }

   pub fn bridge(&self) -> Bridge {
      self.bridge.clone()
   }

   /// Pauses playback, stops every supervisor and waits for their tasks.
   pub async fn shutdown<P: PlaybackPauser>(mut self, pauser: Option<&P>) {
      if let Some(pauser) = pauser {
         match time::timeout(PAUSE_TIMEOUT, pauser.pause_all()).await {
            Ok(count) => info!("Paused {count} player(s)"),
            Err(_) => warn!("Pausing players timed out"),
         }
      }

      // links first so nothing sends LinkUp to a stopped player
      let links = self.bridge.devices.iter().filter_map(|d| d.link.as_ref()).map(|link| async move {
         if time::timeout(STOP_TIMEOUT, link.shutdown()).await.is_err() {
            warn!("Connection supervisor did not stop: {}", BridgeError::RequestTimeout);
         }
      });
      join_all(links).await;

      let players = self.bridge.devices.iter().map(|d| async move {
         match time::timeout(STOP_TIMEOUT, d.player.shutdown()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!("[{}] {e}", d.status.name()),
            Err(_) => warn!("[{}] player did not stop: {}", d.status.name(), BridgeError::RequestTimeout),
         }
      });
      join_all(players).await;

      self.tasks.abort_all();
      while let Some(result) = self.tasks.join_next().await {
         if let Err(e) = result
            && e.is_panic()
         {
            error!("{}", BridgeError::SupervisorPanicked(e));
         }
      }
      info!("All supervisors stopped");
   }
}

/// Address other hosts reach us on, from the default route.
fn local_ip() -> Option<SmolStr> {
   // connecting a UDP socket sends nothing; it only selects a route
   let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
   socket.connect("8.8.8.8:80").ok()?;
   Some(socket.local_addr().ok()?.ip().to_smolstr())
}

fn hostname() -> SmolStr {
   let mut buf = [0u8; 256];
   // SAFETY: the buffer is valid for writes of its full length
   let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
   if rc != 0 {
      return SmolStr::new_static("localhost");
   }
   let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
   String::from_utf8_lossy(&buf[..end]).to_smolstr()
}
