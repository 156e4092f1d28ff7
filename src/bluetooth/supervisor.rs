//! Per-device supervisor of the Bluetooth link.
//!
//! Polls the link on a fixed cadence, reconnects when it drops, and tells the
//! process supervisor when the link comes and goes. The player is always
//! suspended, and the suspension acknowledged, before any reconnect attempt
//! is made.

use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, Instant, MissedTickBehavior},
};

use crate::{
   bluetooth::controller::{BluetoothController, BluetoothSurface},
   error::{BridgeError, Result},
   player::PlayerHandle,
   status::{ConnectionState, DeviceStatus},
};

const CHANNEL_BUFFER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct LinkTimings {
   /// Cadence of the scheduling tick
   pub tick: Duration,
   /// Minimum time between two link checks
   pub check_interval: Duration,
   /// Delay before the first connection attempt
   pub startup_delay: Duration,
   /// Upper bound of the random delay added to `startup_delay`
   pub startup_jitter: Duration,
}

impl Default for LinkTimings {
   fn default() -> Self {
      Self {
         tick: Duration::from_secs(5),
         check_interval: Duration::from_secs(10),
         startup_delay: Duration::from_secs(2),
         startup_jitter: Duration::from_millis(1500),
      }
   }
}

enum LinkCommand {
   Reconnect(oneshot::Sender<Result<()>>),
   Repair(oneshot::Sender<Result<()>>),
   SetEnabled(bool, oneshot::Sender<()>),
   Shutdown(oneshot::Sender<()>),
}

/// Handle to a running [`ConnectionSupervisor`].
#[derive(Clone, Debug)]
pub struct LinkHandle {
   inbox: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
   async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> LinkCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(build(tx))
         .await
         .map_err(|_| BridgeError::SupervisorShutdown)?;
      rx.await.map_err(|_| BridgeError::SupervisorShutdown)
   }

   /// Drops the link and connects again. Returns once the request is accepted.
   pub async fn reconnect(&self) -> Result<()> {
      self.request(LinkCommand::Reconnect).await?
   }

   /// Pairs the device from scratch. Returns once the request is accepted.
   pub async fn repair(&self) -> Result<()> {
      self.request(LinkCommand::Repair).await?
   }

   /// Releases the device to the host (`false`) or takes it back (`true`).
   pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
      self
         .request(|tx| LinkCommand::SetEnabled(enabled, tx))
         .await
   }

   pub async fn shutdown(&self) -> Result<()> {
      self.request(LinkCommand::Shutdown).await
   }
}

/// Keeps one device's Bluetooth link up.
pub struct ConnectionSupervisor<S> {
   controller: BluetoothController<S>,
   status: DeviceStatus,
   player: PlayerHandle,
   timings: LinkTimings,
   inbox: mpsc::Receiver<LinkCommand>,
   last_check: Option<Instant>,
}

impl<S: BluetoothSurface> ConnectionSupervisor<S> {
   pub fn new(
      controller: BluetoothController<S>,
      status: DeviceStatus,
      player: PlayerHandle,
      timings: LinkTimings,
   ) -> (Self, LinkHandle) {
      let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let supervisor = Self {
         controller,
         status,
         player,
         timings,
         inbox: rx,
         last_check: None,
      };
      (supervisor, LinkHandle { inbox: tx })
   }

   fn label(&self) -> &str {
      self.status.name()
   }

   pub async fn run(mut self) {
      info!(
         "[{}] connection supervisor starting for {}",
         self.label(),
         self.controller.mac()
      );
      self
         .status
         .set_bluetooth_available(self.controller.is_available().await);

      if self.status.enabled() {
         let jitter = rand::thread_rng().gen_range(Duration::ZERO..=self.timings.startup_jitter);
         time::sleep(self.timings.startup_delay + jitter).await;
         self.establish().await;
      } else {
         info!("[{}] released at startup, not connecting", self.label());
      }

      let mut ticker = time::interval(self.timings.tick);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            deadline = ticker.tick() => {
               self.status.tick_link();
               if self.status.enabled() && self.check_due(deadline) {
                  self.check(deadline).await;
               }
            }
            cmd = self.inbox.recv() => {
               let Some(cmd) = cmd else {
                  debug!("[{}] connection supervisor inbox closed", self.label());
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
         }
      }
      debug!("[{}] connection supervisor stopped", self.label());
   }

   /// Elapsed time is taken between tick deadlines.
   fn check_due(&self, now: Instant) -> bool {
      self
         .last_check
         .is_none_or(|at| now.saturating_duration_since(at) >= self.timings.check_interval)
   }

   async fn handle_command(&mut self, cmd: LinkCommand) -> bool {
      match cmd {
         LinkCommand::Reconnect(reply) => {
            if !self.status.enabled() {
               let _ = reply.send(Err(BridgeError::DeviceReleased(self.status.key().clone())));
               return true;
            }
            let _ = reply.send(Ok(()));
            info!("[{}] forced reconnect", self.label());
            self.suspend_player().await;
            self.controller.disconnect().await;
            self.status.set_connection(ConnectionState::Disconnected);
            self.reconnect(Instant::now()).await;
         },
         LinkCommand::Repair(reply) => {
            if !self.status.enabled() {
               let _ = reply.send(Err(BridgeError::DeviceReleased(self.status.key().clone())));
               return true;
            }
            let _ = reply.send(Ok(()));
            info!("[{}] re-pairing", self.label());
            self.suspend_player().await;
            self.controller.disconnect().await;
            self.status.set_connection(ConnectionState::Pairing);
            if !self.controller.pair().await {
               self
                  .status
                  .set_error(format!("Pairing with {} failed", self.controller.mac()));
               // retried by the next check
               self.last_check = Some(Instant::now());
               self.status.set_connection(ConnectionState::Reconnecting);
               return true;
            }
            if !self.controller.trust().await {
               warn!("[{}] failed to trust {}", self.label(), self.controller.mac());
            }
            self.reconnect(Instant::now()).await;
         },
         LinkCommand::SetEnabled(enabled, ack) => {
            self.set_enabled(enabled).await;
            let _ = ack.send(());
         },
         LinkCommand::Shutdown(ack) => {
            let _ = ack.send(());
            return false;
         },
      }
      true
   }

   async fn set_enabled(&mut self, enabled: bool) {
      if enabled == self.status.enabled() {
         return;
      }
      self.status.set_enabled(enabled);

      if enabled {
         info!("[{}] reclaimed, resuming management", self.label());
         if let Err(e) = self.player.reclaim().await {
            warn!("[{}] failed to reclaim player: {e}", self.label());
         }
         self.check(Instant::now()).await;
      } else {
         info!("[{}] released to the host", self.label());
         if let Err(e) = self.player.release().await {
            warn!("[{}] failed to release player: {e}", self.label());
         }
         self.controller.disconnect().await;
         self.status.set_connection(ConnectionState::Disconnected);
      }
   }

   /// Stops the player and waits until it is stopped.
   async fn suspend_player(&self) {
      if let Err(e) = self.player.suspend().await {
         warn!("[{}] failed to suspend player: {e}", self.label());
      }
   }

   /// Initial connection attempt.
   async fn establish(&mut self) {
      self.last_check = Some(Instant::now());
      if self.connect_now().await {
         self.on_connected().await;
      } else {
         warn!(
            "[{}] initial connection to {} failed, will retry",
            self.label(),
            self.controller.mac()
         );
         self.status.set_connection(ConnectionState::Disconnected);
      }
   }

   /// Periodic link check; `at` is the tick deadline it runs for.
   async fn check(&mut self, at: Instant) {
      self.last_check = Some(at);

      if self.controller.is_connected().await {
         if self.status.connection() != ConnectionState::Connected {
            info!("[{}] link is up", self.label());
            self.on_connected().await;
         }
         return;
      }

      if self.status.connection() == ConnectionState::Connected {
         warn!("[{}] Bluetooth disconnected", self.label());
      }
      self.suspend_player().await;
      self.reconnect(at).await;
   }

   /// One reconnect attempt; the player must already be suspended.
   async fn reconnect(&mut self, at: Instant) {
      self.last_check = Some(at);
      let attempt = self.status.bump_reconnect_attempt();
      self.status.set_connection(ConnectionState::Reconnecting);
      info!("[{}] reconnecting (attempt {attempt})", self.label());

      if self.connect_now().await {
         self.on_connected().await;
      } else {
         self.status.set_connection(ConnectionState::Reconnecting);
      }
   }

   async fn connect_now(&self) -> bool {
      let status = self.status.clone();
      self
         .controller
         .connect(&move |phase| status.set_connection(phase))
         .await
   }

   async fn on_connected(&mut self) {
      self.status.mark_connected();
      self.status.set_bluetooth_available(true);
      if let Err(e) = self.player.link_up().await {
         warn!("[{}] failed to notify player of link: {e}", self.label());
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use tokio::io::AsyncWriteExt;

   use super::*;
   use crate::{
      audio::{AudioSinkRouter, SinkTimings},
      bluetooth::MacAddress,
      player::{PlayerSettings, PlayerTimings, ProcessSupervisor},
      status::{DeviceIdentity, ProcessState},
      testing::{EventLog, FakeAudio, FakeBluetooth, FakeLauncher, NullBus},
   };

   const SPEAKER: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
   const SINK: &str = "bluez_output.AA_BB_CC_DD_EE_FF.1";

   struct Harness {
      link: LinkHandle,
      status: DeviceStatus,
      bluetooth: FakeBluetooth,
      launcher: FakeLauncher,
      log: EventLog,
   }

   #[derive(Default)]
   struct Timings {
      link: LinkTimings,
      player: PlayerTimings,
      sink: SinkTimings,
   }

   /// Millisecond cadences for tests on the real clock.
   fn fast() -> Timings {
      Timings {
         link: LinkTimings {
            tick: Duration::from_millis(50),
            check_interval: Duration::from_millis(100),
            startup_delay: Duration::ZERO,
            startup_jitter: Duration::ZERO,
         },
         player: PlayerTimings {
            liveness_interval: Duration::from_millis(50),
            terminate_grace: Duration::from_millis(100),
         },
         sink: SinkTimings {
            settle: Duration::ZERO,
            retry: Duration::from_millis(10),
         },
      }
   }

   fn harness(enabled: bool) -> Harness {
      harness_with(enabled, Timings::default())
   }

   fn harness_with(enabled: bool, timings: Timings) -> Harness {
      let log = EventLog::default();
      let bluetooth = FakeBluetooth::new(log.clone());
      bluetooth.set_paired(true);
      bluetooth.set_connected(true);
      let launcher = FakeLauncher::new(log.clone());
      let audio = FakeAudio::new(log.clone());
      audio.add_sink(SINK);

      let status = DeviceStatus::new(
         DeviceIdentity {
            key: SPEAKER.to_string().into(),
            name: "Kitchen".into(),
            mac: Some(SPEAKER),
            ..Default::default()
         },
         enabled,
         Arc::new(NullBus),
      );
      let router = Arc::new(AudioSinkRouter::new(audio, None, timings.sink));
      let (player, player_handle) = ProcessSupervisor::new(
         PlayerSettings {
            program: "sendspin".into(),
            name: "Kitchen".into(),
            slug: "kitchen".into(),
            port: 8928,
            work_dir: "/tmp".into(),
            static_delay_ms: -500.0,
            server_url: None,
         },
         timings.player,
         launcher.clone(),
         router,
         status.clone(),
      );
      let controller =
         BluetoothController::new(bluetooth.clone(), None, SPEAKER, "Kitchen".into());
      let (link, link_handle) =
         ConnectionSupervisor::new(controller, status.clone(), player_handle, timings.link);
      tokio::spawn(player.run());
      tokio::spawn(link.run());

      Harness {
         link: link_handle,
         status,
         bluetooth,
         launcher,
         log,
      }
   }

   async fn wait_until(what: &str, cond: impl Fn() -> bool) {
      for _ in 0..600 {
         if cond() {
            return;
         }
         time::sleep(Duration::from_millis(100)).await;
      }
      panic!("timed out waiting for {what}");
   }

   #[tokio::test(start_paused = true)]
   async fn test_connected_at_startup_starts_player() {
      let h = harness(true);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;
      assert_eq!(h.status.connection(), ConnectionState::Connected);
      assert_eq!(h.status.reconnect_attempt(), 0);
      assert!(h.status.connected_since().is_some());
      assert_eq!(h.launcher.launches()[0].sink.as_deref(), Some(SINK));
   }

   #[tokio::test(start_paused = true)]
   async fn test_link_loss_suspends_before_reconnecting() {
      let h = harness(true);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;

      // speaker switched off
      h.bluetooth.set_reachable(false);
      h.bluetooth.set_connected(false);
      wait_until("reconnecting", || {
         h.status.connection() == ConnectionState::Reconnecting
      })
      .await;
      assert_eq!(h.status.process(), ProcessState::Suspended);

      let terminated = h.log.position("player:terminate").unwrap();
      let first_connect = h.log.position("bt:connect").unwrap();
      assert!(terminated < first_connect, "{:?}", h.log.entries());

      // attempts count up while the speaker stays away
      wait_until("second attempt", || h.status.reconnect_attempt() >= 2).await;
      assert_eq!(h.launcher.alive(), 0);

      // speaker comes back
      h.bluetooth.set_reachable(true);
      wait_until("player running again", || {
         h.status.process() == ProcessState::Running
      })
      .await;
      assert_eq!(h.status.connection(), ConnectionState::Connected);
      assert_eq!(h.status.reconnect_attempt(), 0);
      assert_eq!(h.launcher.launches().len(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_self_recovered_link_starts_player() {
      let h = harness(true);
      h.bluetooth.set_connected(false);
      h.bluetooth.set_reachable(false);
      wait_until("reconnecting", || {
         h.status.connection() == ConnectionState::Reconnecting
      })
      .await;

      // the stack reconnects on its own between two checks
      h.bluetooth.set_connected(true);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;
      assert_eq!(h.status.connection(), ConnectionState::Connected);
   }

   #[tokio::test(start_paused = true)]
   async fn test_release_skips_polling() {
      let h = harness(true);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;

      h.link.set_enabled(false).await.unwrap();
      assert!(!h.status.enabled());
      assert_eq!(h.status.process(), ProcessState::Stopped);
      assert!(!h.bluetooth.is_connected_now());

      let entries = h.log.entries().len();
      time::sleep(Duration::from_secs(60)).await;
      assert_eq!(h.log.entries().len(), entries, "polled while released");

      assert!(matches!(
         h.link.reconnect().await,
         Err(BridgeError::DeviceReleased(_))
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_reclaim_resumes_immediately() {
      let h = harness(true);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;
      h.link.set_enabled(false).await.unwrap();

      h.link.set_enabled(true).await.unwrap();
      // set_enabled returns after the immediate check
      assert_eq!(h.status.connection(), ConnectionState::Connected);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_disabled_at_startup_never_connects() {
      let h = harness(false);
      h.bluetooth.set_connected(false);
      time::sleep(Duration::from_secs(60)).await;
      assert!(h.log.position("bt:connect").is_none());
      assert!(h.launcher.launches().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_forced_reconnect_cycles_player() {
      let h = harness(true);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;

      h.link.reconnect().await.unwrap();
      wait_until("second launch", || h.launcher.launches().len() == 2).await;
      wait_until("player running", || h.status.process() == ProcessState::Running).await;

      let disconnect = h.log.position("bt:disconnect").unwrap();
      let terminate = h.log.position("player:terminate").unwrap();
      assert!(terminate < disconnect);
   }

   #[tokio::test(start_paused = true)]
   async fn test_repair_pairs_before_reconnecting() {
      let h = harness(true);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;
      h.bluetooth.set_discoverable(true);

      h.link.repair().await.unwrap();
      wait_until("second launch", || h.launcher.launches().len() == 2).await;
      wait_until("player running", || h.status.process() == ProcessState::Running).await;

      let terminate = h.log.position("player:terminate").unwrap();
      let pair = h.log.position("bt:pair").unwrap();
      assert!(terminate < pair);
      assert_eq!(
         h.log.entries().iter().filter(|e| e.starts_with("bt:trust")).count(),
         2
      );
      assert!(h.status.last_error().is_none());
   }

   #[tokio::test(start_paused = true)]
   async fn test_failed_repair_waits_for_next_check() {
      let h = harness(true);
      wait_until("player running", || h.status.process() == ProcessState::Running).await;
      // bond removed on the speaker side, and it is not in pairing mode
      h.bluetooth.set_paired(false);

      h.link.repair().await.unwrap();
      wait_until("pairing error", || h.status.last_error().is_some()).await;
      assert_eq!(h.status.connection(), ConnectionState::Reconnecting);
      assert_eq!(count(&h.log, "bt:pair "), 1);
      assert!(h.log.position("bt:connect").is_none());
   }

   fn count(log: &EventLog, prefix: &str) -> usize {
      log.entries().iter().filter(|e| e.starts_with(prefix)).count()
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_checks_keep_their_interval_on_real_clock() {
      let h = harness_with(true, fast());
      wait_until("player running", || h.status.process() == ProcessState::Running).await;

      let before = count(&h.log, "bt:info");
      time::sleep(Duration::from_millis(3000)).await;
      let checks = count(&h.log, "bt:info") - before;
      // one check per 100 ms
      assert!(checks >= 27, "only {checks} link checks in 3 s");
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_error_flood_does_not_stall_either_supervisor() {
      let h = harness_with(true, fast());
      wait_until("player running", || h.status.process() == ProcessState::Running).await;

      let mut writer = h.launcher.take_writer().unwrap();
      let flood = tokio::spawn(async move {
         // about 500 lines per second for two seconds
         for i in 0..1000u32 {
            let line =
               format!("ERROR:sendspin.audio:Playback error {i}: buffer underrun, dropping chunk\n");
            if writer.write_all(line.as_bytes()).await.is_err() {
               break;
            }
            time::sleep(Duration::from_millis(2)).await;
         }
      });

      let (link_before, liveness_before) = (h.status.link_ticks(), h.status.liveness_ticks());
      time::sleep(Duration::from_millis(1000)).await;
      let link = h.status.link_ticks() - link_before;
      let liveness = h.status.liveness_ticks() - liveness_before;
      assert!(link >= 10, "link ticked only {link} times");
      assert!(liveness >= 10, "liveness ticked only {liveness} times");
      assert_eq!(h.status.connection(), ConnectionState::Connected);
      assert_eq!(h.status.process(), ProcessState::Running);
      flood.abort();
   }

   #[tokio::test(start_paused = true)]
   async fn test_ticks_advance() {
      let h = harness(true);
      time::sleep(Duration::from_secs(31)).await;
      assert!(h.status.link_ticks() >= 6);
      assert!(h.status.liveness_ticks() >= 3);
   }
}
