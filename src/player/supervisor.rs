//! Per-device supervisor of the player process.
//!
//! The supervisor is an actor: it owns the running player instance and is
//! driven by link messages from the connection supervisor, dashboard
//! commands, and its own liveness timer. The player's output is consumed by
//! a separate task per instance, so a chatty player can never delay the
//! liveness check or the reaction to a link change.

use std::{path::PathBuf, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, ToSmolStr, format_smolstr};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   audio::{AudioSinkRouter, AudioSurface},
   error::{BridgeError, Result},
   player::{
      output::OutputConsumer,
      process::{LaunchSpec, PlayerLauncher, PlayerProcess, client_id},
   },
   status::{DeviceStatus, ProcessState, UpdateOp},
};

const CHANNEL_BUFFER_SIZE: usize = 32;

/// Static launch settings of one device's player.
#[derive(Debug, Clone)]
pub struct PlayerSettings {
   pub program: SmolStr,
   pub name: SmolStr,
   pub slug: SmolStr,
   pub port: u16,
   pub work_dir: PathBuf,
   pub static_delay_ms: f64,
   pub server_url: Option<SmolStr>,
}

impl PlayerSettings {
   fn launch_spec(&self, sink: Option<SmolStr>) -> LaunchSpec {
      LaunchSpec {
         program: self.program.clone(),
         name: self.name.clone(),
         client_id: client_id(&self.slug),
         port: self.port,
         settings_dir: self.work_dir.join(format!("sendspin-{}", self.slug)),
         static_delay_ms: self.static_delay_ms,
         server_url: self.server_url.clone(),
         sink,
      }
   }
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerTimings {
   pub liveness_interval: Duration,
   pub terminate_grace: Duration,
}

impl Default for PlayerTimings {
   fn default() -> Self {
      Self {
         liveness_interval: Duration::from_secs(10),
         terminate_grace: Duration::from_secs(3),
      }
   }
}

enum PlayerCommand {
   /// The Bluetooth link is up; start a fresh instance.
   LinkUp,
   /// The Bluetooth link is gone; stop and acknowledge once stopped.
   LinkDown(oneshot::Sender<()>),
   Release(oneshot::Sender<()>),
   Reclaim,
   SetVolume(u8, oneshot::Sender<Result<()>>),
   SetMute(bool, oneshot::Sender<Result<()>>),
   Shutdown(oneshot::Sender<()>),
}

/// Handle to a running [`ProcessSupervisor`].
#[derive(Clone, Debug)]
pub struct PlayerHandle {
   inbox: mpsc::Sender<PlayerCommand>,
}

impl PlayerHandle {
   async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> PlayerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(build(tx))
         .await
         .map_err(|_| BridgeError::SupervisorShutdown)?;
      rx.await.map_err(|_| BridgeError::SupervisorShutdown)
   }

   pub async fn link_up(&self) -> Result<()> {
      self
         .inbox
         .send(PlayerCommand::LinkUp)
         .await
         .map_err(|_| BridgeError::SupervisorShutdown)
   }

   /// Stops the player because the link dropped. Returns once it is stopped.
   pub async fn suspend(&self) -> Result<()> {
      self.request(PlayerCommand::LinkDown).await
   }

   pub async fn release(&self) -> Result<()> {
      self.request(PlayerCommand::Release).await
   }

   pub async fn reclaim(&self) -> Result<()> {
      self
         .inbox
         .send(PlayerCommand::Reclaim)
         .await
         .map_err(|_| BridgeError::SupervisorShutdown)
   }

   pub async fn set_volume(&self, volume: u8) -> Result<()> {
      self
         .request(|tx| PlayerCommand::SetVolume(volume, tx))
         .await?
   }

   pub async fn set_mute(&self, muted: bool) -> Result<()> {
      self.request(|tx| PlayerCommand::SetMute(muted, tx)).await?
   }

   pub async fn shutdown(&self) -> Result<()> {
      self.request(PlayerCommand::Shutdown).await
   }
}

struct RunningPlayer<P> {
   process: P,
   consumer: JoinHandle<()>,
   generation: u64,
}

/// Keeps at most one player instance alive for a device.
pub struct ProcessSupervisor<L: PlayerLauncher, A> {
   settings: PlayerSettings,
   timings: PlayerTimings,
   launcher: L,
   router: Arc<AudioSinkRouter<A>>,
   status: DeviceStatus,
   inbox: mpsc::Receiver<PlayerCommand>,

   running: Option<RunningPlayer<L::Process>>,
   generation: u64,
   format_cache: Arc<Mutex<Option<SmolStr>>>,
   sink: Option<SmolStr>,
   link_up: bool,
   released: bool,
   /// The last start attempt failed to launch; retried on the next tick.
   launch_failed: bool,
}

impl<L: PlayerLauncher, A: AudioSurface> ProcessSupervisor<L, A> {
   pub fn new(
      settings: PlayerSettings,
      timings: PlayerTimings,
      launcher: L,
      router: Arc<AudioSinkRouter<A>>,
      status: DeviceStatus,
   ) -> (Self, PlayerHandle) {
      let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let released = !status.enabled();
      let supervisor = Self {
         settings,
         timings,
         launcher,
         router,
         status,
         inbox: rx,
         running: None,
         generation: 0,
         format_cache: Arc::default(),
         sink: None,
         link_up: false,
         released,
         launch_failed: false,
      };
      (supervisor, PlayerHandle { inbox: tx })
   }

   /// Devices with a Bluetooth address only run while their link is up.
   fn needs_link(&self) -> bool {
      self.status.mac().is_some()
   }

   pub async fn run(mut self) {
      debug!("[{}] process supervisor starting", self.settings.name);

      if !self.needs_link() && !self.released {
         self.start().await;
      }

      let mut liveness = time::interval(self.timings.liveness_interval);
      liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = liveness.tick() => {
               self.status.tick_liveness();
               self.check_liveness().await;
            }
            cmd = self.inbox.recv() => {
               let Some(cmd) = cmd else {
                  debug!("[{}] process supervisor inbox closed", self.settings.name);
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
         }
      }

      self.stop().await;
      self.status.set_process(ProcessState::Stopped);
   }

   async fn handle_command(&mut self, cmd: PlayerCommand) -> bool {
      match cmd {
         PlayerCommand::LinkUp => {
            self.link_up = true;
            // the sink of a fresh connection may carry a new name
            self.sink = None;
            if self.released {
               debug!("[{}] link up while released, not starting", self.settings.name);
            } else {
               self.start().await;
            }
         },
         PlayerCommand::LinkDown(ack) => {
            self.link_up = false;
            self.launch_failed = false;
            self.sink = None;
            if self.running.is_some() {
               info!("[{}] Bluetooth link lost, suspending player", self.settings.name);
            }
            self.stop().await;
            if !self.released {
               self.status.set_process(ProcessState::Suspended);
            }
            let _ = ack.send(());
         },
         PlayerCommand::Release(ack) => {
            info!("[{}] released, stopping player", self.settings.name);
            self.released = true;
            self.launch_failed = false;
            // the host takes over the speaker; a fresh LinkUp is required
            self.link_up = false;
            self.stop().await;
            self.status.set_process(ProcessState::Stopped);
            let _ = ack.send(());
         },
         PlayerCommand::Reclaim => {
            self.released = false;
            if !self.needs_link() || self.link_up {
               self.start().await;
            } else {
               self.status.set_process(ProcessState::Suspended);
            }
         },
         PlayerCommand::SetVolume(volume, reply) => {
            let _ = reply.send(self.set_volume(volume).await);
         },
         PlayerCommand::SetMute(muted, reply) => {
            let _ = reply.send(self.set_mute(muted).await);
         },
         PlayerCommand::Shutdown(ack) => {
            info!("[{}] stopping player for shutdown", self.settings.name);
            self.stop().await;
            self.status.set_process(ProcessState::Stopped);
            let _ = ack.send(());
            return false;
         },
      }
      true
   }

   /// Starts a fresh player instance, replacing any running one.
   async fn start(&mut self) {
      if self.needs_link() && !self.link_up {
         debug!("[{}] not starting player without a link", self.settings.name);
         return;
      }

      self.status.set_process(ProcessState::Starting);
      // the listening port must be free before the new instance binds it
      self.stop().await;

      if let Some(mac) = self.status.mac()
         && self.sink.is_none()
      {
         match self.router.configure(mac, &self.status).await {
            Some(sink) => {
               if let UpdateOp::Updated(previous) = self.status.set_sink(Some(sink.clone())) {
                  info!("[{}] audio sink moved from {previous} to {sink}", self.settings.name);
               }
               self.status.clear_error();
               self.sink = Some(sink);
            },
            None => {
               if let UpdateOp::Deleted(previous) = self.status.set_sink(None) {
                  warn!("[{}] lost audio sink {previous}", self.settings.name);
               }
               self
                  .status
                  .set_error(BridgeError::SinkUnavailable(mac).to_smolstr());
            },
         }
      }

      let spec = self.settings.launch_spec(self.sink.clone());
      match self.launcher.launch(&spec) {
         Ok((process, output)) => {
            self.launch_failed = false;
            self.generation += 1;
            let pid = process.id();
            let consumer = OutputConsumer {
               generation: self.generation,
               status: self.status.clone(),
               format_cache: self.format_cache.clone(),
               router: self.router.clone(),
               sink: self.sink.clone(),
            };
            let consumer = tokio::spawn(consumer.run(output));
            self.running = Some(RunningPlayer {
               process,
               consumer,
               generation: self.generation,
            });

            self.status.set_pid(pid);
            self.status.set_playing(false);
            self.status.set_server_connected(false);
            self.status.set_process(ProcessState::Running);
            info!(
               "[{}] player started (pid {pid:?}, port {}, sink {})",
               self.settings.name,
               self.settings.port,
               self.sink.as_deref().unwrap_or("default")
            );
         },
         Err(e) => {
            self.launch_failed = true;
            error!("[{}] failed to start player: {e}", self.settings.name);
            self
               .status
               .set_error(format_smolstr!("Failed to start player: {e}"));
            self.status.set_process(ProcessState::Stopped);
         },
      }
   }

   /// Terminates the running instance, if any, and detaches its consumer.
   async fn stop(&mut self) {
      let Some(mut running) = self.running.take() else {
         return;
      };
      debug!(
         "[{}] stopping player instance {}",
         self.settings.name, running.generation
      );
      running.process.terminate(self.timings.terminate_grace).await;
      running.consumer.abort();
      self.status.set_pid(None);
      self.status.set_playing(false);
      self.status.set_server_connected(false);
   }

   fn should_run(&self) -> bool {
      !self.released && (!self.needs_link() || self.link_up)
   }

   async fn check_liveness(&mut self) {
      if self.running.is_none() && self.launch_failed && self.should_run() {
         info!("[{}] retrying player launch", self.settings.name);
         self.start().await;
         return;
      }
      let Some(running) = &mut self.running else {
         return;
      };
      let Some(exit) = running.process.try_wait() else {
         return;
      };

      warn!(
         "[{}] player instance {} exited unexpectedly ({exit})",
         self.settings.name, running.generation
      );
      if let Some(running) = self.running.take() {
         running.consumer.abort();
      }
      self.status.set_pid(None);
      self.status.set_playing(false);
      self.status.set_server_connected(false);

      if self.released {
         self.status.set_process(ProcessState::Stopped);
      } else if self.should_run() {
         info!("[{}] restarting player", self.settings.name);
         self.start().await;
      } else {
         info!("[{}] waiting for Bluetooth before restarting", self.settings.name);
         self.status.set_process(ProcessState::Suspended);
      }
   }

   async fn set_volume(&mut self, volume: u8) -> Result<()> {
      let volume = volume.min(100);
      if let Some(sink) = &self.sink {
         self.router.set_volume(sink, volume).await?;
      }
      self.status.set_volume(volume);
      if let Some(mac) = self.status.mac() {
         self.router.persist(mac, volume, self.status.muted());
      }
      Ok(())
   }

   async fn set_mute(&mut self, muted: bool) -> Result<()> {
      if let Some(sink) = &self.sink {
         self.router.set_mute(sink, muted).await?;
      }
      self.status.set_muted(muted);
      if let Some(mac) = self.status.mac() {
         self.router.persist(mac, self.status.volume(), muted);
      }
      Ok(())
   }
}
