//! Sendspin Bluetooth bridge daemon
//!
//! Keeps one Sendspin player per configured speaker running against the
//! speaker's audio sink, reconnecting the Bluetooth link and restarting the
//! player as needed. Status and control are exposed over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::ArrayQueue;
use log::{info, warn};
use tokio::{
   signal::{
      self,
      unix::{SignalKind, signal as unix_signal},
   },
   sync::Notify,
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use audio::{Pactl, VolumeStore};
use bluetooth::Bluetoothctl;
use config::{BusKind, Config};
use dbus::BridgeService;
use event::{BridgeEvent, EventBus};
use host::HostRunner;
use mpris::MprisPauser;
use orchestrator::{Backends, Bridge, DeviceOrchestrator};
use player::SendspinLauncher;
use status::DeviceStatus;

mod audio;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod host;
mod mpris;
mod orchestrator;
mod player;
mod status;
#[cfg(test)]
mod testing;

use crate::{dbus::BridgeServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting Sendspin bridge...");

   // Load configuration
   let config = Config::load()?;
   let devices = config.devices()?;
   info!("Loaded configuration with {} device(s)", devices.len());
   if devices.is_empty() {
      warn!("No devices configured; nothing to supervise");
   }

   let runner = HostRunner::new(config.max_host_commands);
   let volumes = if config.persist_volume {
      match VolumeStore::open() {
         Ok(store) => Some(store),
         Err(e) => {
            warn!("Volume persistence disabled: {e}");
            None
         },
      }
   } else {
      None
   };

   let event_bus = EventProcessor::new();
   let backends = Backends {
      bluetooth: Bluetoothctl::new(runner.clone(), config.bluetoothctl.clone()),
      launcher: SendspinLauncher,
      audio: Pactl::new(runner, config.pactl.clone()),
   };
   let orchestrator =
      DeviceOrchestrator::start(&config, devices, backends, volumes, event_bus.clone()).await;

   // D-Bus is optional; supervision runs without a dashboard
   let _connection = match serve(config.dbus_bus, orchestrator.bridge()).await {
      Ok(connection) => {
         info!("Bridge D-Bus service started at {}", dbus::SERVICE_NAME);
         if let Err(e) = event_bus.clone().spawn_dispatcher(connection.clone()).await {
            warn!("Failed to start signal dispatcher: {e}");
         }
         Some(connection)
      },
      Err(e) => {
         warn!("D-Bus service unavailable: {e}");
         None
      },
   };

   // Wait for shutdown signal
   shutdown_signal().await?;
   info!("Shutting down Sendspin bridge...");

   let pauser = match MprisPauser::connect(config.mpris_prefix.clone()).await {
      Ok(pauser) => Some(pauser),
      Err(e) => {
         warn!("Skipping MPRIS pause: {e}");
         None
      },
   };
   orchestrator.shutdown(pauser.as_ref()).await;

   info!("Sendspin bridge stopped");
   Ok(())
}

async fn serve(bus: BusKind, bridge: Bridge) -> Result<Connection> {
   let builder = match bus {
      BusKind::Session => connection::Builder::session()?,
      BusKind::System => connection::Builder::system()?,
   };
   let connection = builder
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, BridgeService::new(bridge))?
      .build()
      .await?;
   Ok(connection)
}

async fn shutdown_signal() -> Result<()> {
   let mut terminate = unix_signal(SignalKind::terminate())?;
   tokio::select! {
      res = signal::ctrl_c() => res?,
      _ = terminate.recv() => {},
   }
   Ok(())
}

/// Pending signals kept while no dispatcher drains the queue.
const EVENT_BACKLOG: usize = 1024;

struct EventProcessor {
   queue: ArrayQueue<(DeviceStatus, BridgeEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Self::with_capacity(EVENT_BACKLOG)
   }

   fn with_capacity(capacity: usize) -> Arc<Self> {
      Arc::new(Self {
         queue: ArrayQueue::new(capacity),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(DeviceStatus, BridgeEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<BridgeService>,
      (device, event): (DeviceStatus, BridgeEvent),
   ) -> Result<()> {
      let key = device.key().as_str();
      match event {
         BridgeEvent::ConnectionChanged(state) => {
            iface.connection_changed(key, <&str>::from(state)).await?;
         },
         BridgeEvent::ProcessChanged(state) => {
            iface.process_changed(key, <&str>::from(state)).await?;
         },
         BridgeEvent::PlaybackChanged(playing) => {
            iface.playback_changed(key, playing).await?;
         },
         BridgeEvent::VolumeChanged { volume, muted } => {
            iface.volume_changed(key, volume, muted).await?;
         },
         BridgeEvent::DeviceError(message) => {
            iface.device_error(key, &message).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BridgeService>(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: &DeviceStatus, event: BridgeEvent) {
      // oldest event is dropped when full
      self.queue.force_push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}
