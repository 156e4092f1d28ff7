//! Command/response wrapper around the host Bluetooth control utility.
//!
//! The host stack is driven through `bluetoothctl` scripts fed on stdin. Any
//! failure or timeout is reported as "not available / not connected"; the
//! owning supervisor retries on its next poll.

use std::{
   sync::atomic::{AtomicBool, Ordering},
   time::Duration,
};

use log::{debug, info, warn};
use smallvec::SmallVec;
use smol_str::{SmolStr, ToSmolStr, format_smolstr};
use tokio::time;

use crate::{
   bluetooth::address::MacAddress,
   host::{CommandOutput, HostRunner, SessionStep},
   status::ConnectionState,
};

/// Timeout for a single non-interactive script
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Time spent scanning so the stack caches the device before pairing
const PAIR_SCAN_DURATION: Duration = Duration::from_secs(12);
/// Time left for pair/trust to settle before the session is closed
const PAIR_SETTLE_DURATION: Duration = Duration::from_secs(10);
/// Upper bound for the whole pairing session
const PAIR_SESSION_TIMEOUT: Duration = Duration::from_secs(28);
/// Pause between powering the adapter and issuing `connect`
const POWER_ON_DELAY: Duration = Duration::from_secs(1);
/// Number of "is it connected yet" checks after `connect`
const CONNECT_WAIT_CHECKS: u32 = 5;
/// Interval between those checks
const CONNECT_WAIT_INTERVAL: Duration = Duration::from_secs(1);

pub type Script = SmallVec<[SmolStr; 4]>;

/// The text command surface of the host Bluetooth stack.
pub trait BluetoothSurface: Send + Sync + 'static {
   /// Runs a short script of commands and returns the combined output.
   fn exec(&self, script: &[SmolStr]) -> impl Future<Output = CommandOutput> + Send;

   /// Runs a long-lived interactive session bounded by `limit`.
   fn session(
      &self,
      steps: &[SessionStep],
      limit: Duration,
   ) -> impl Future<Output = CommandOutput> + Send;
}

/// `bluetoothctl` driven through the shared host runner.
#[derive(Debug, Clone)]
pub struct Bluetoothctl {
   runner: HostRunner,
   program: SmolStr,
}

impl Bluetoothctl {
   pub fn new(runner: HostRunner, program: impl Into<SmolStr>) -> Self {
      Self {
         runner,
         program: program.into(),
      }
   }
}

impl BluetoothSurface for Bluetoothctl {
   async fn exec(&self, script: &[SmolStr]) -> CommandOutput {
      let mut input = script
         .iter()
         .map(SmolStr::as_str)
         .collect::<Vec<_>>()
         .join("\n");
      input.push('\n');
      self
         .runner
         .run(&self.program, &[], Some(&input), COMMAND_TIMEOUT)
         .await
   }

   async fn session(&self, steps: &[SessionStep], limit: Duration) -> CommandOutput {
      self
         .runner
         .run_session(&self.program, &[], steps, limit)
         .await
   }
}

/// Resolves an adapter identifier to the string used with `select`.
///
/// `hciN` names are not stable across container/bridge boundaries, so they
/// are mapped to the MAC of the N-th controller reported by `list`. MACs and
/// unparseable names are returned unchanged, as is `hciN` when resolution
/// fails.
pub async fn resolve_adapter<S: BluetoothSurface>(surface: &S, adapter: &str) -> SmolStr {
   let Some(index) = adapter
      .strip_prefix("hci")
      .and_then(|n| n.parse::<usize>().ok())
   else {
      return adapter.into();
   };

   let out = surface.exec(&[SmolStr::new_static("list")]).await;
   let controllers: Vec<MacAddress> = out
      .stdout
      .lines()
      .filter(|line| line.contains("Controller"))
      .filter_map(MacAddress::find_in)
      .collect();

   match controllers.get(index) {
      Some(mac) => {
         info!("Resolved adapter {adapter} -> {mac}");
         mac.to_smolstr()
      },
      None => {
         debug!("Could not resolve adapter {adapter}, using it verbatim");
         adapter.into()
      },
   }
}

/// Bluetooth operations for one device on one adapter.
pub struct BluetoothController<S> {
   surface: S,
   adapter: Option<SmolStr>,
   mac: MacAddress,
   label: SmolStr,
   last_connected: AtomicBool,
}

impl<S: BluetoothSurface> BluetoothController<S> {
   /// Creates a controller; `adapter` must already be resolved.
   pub fn new(surface: S, adapter: Option<SmolStr>, mac: MacAddress, label: SmolStr) -> Self {
      Self {
         surface,
         adapter: adapter.filter(|a| !a.is_empty()),
         mac,
         label,
         last_connected: AtomicBool::new(false),
      }
   }

   pub fn mac(&self) -> MacAddress {
      self.mac
   }

   fn script<const N: usize>(&self, commands: [SmolStr; N]) -> Script {
      let mut script = Script::new();
      if let Some(adapter) = &self.adapter {
         script.push(format_smolstr!("select {adapter}"));
      }
      script.extend(commands);
      script
   }

   async fn device_info(&self) -> CommandOutput {
      let mac = self.mac;
      self
         .surface
         .exec(&self.script([format_smolstr!("info {mac}")]))
         .await
   }

   /// True iff the host reports a usable controller.
   pub async fn is_available(&self) -> bool {
      if self.adapter.is_some() {
         let out = self.surface.exec(&self.script([SmolStr::new_static("show")])).await;
         return out.succeeded_with("Controller");
      }
      let out = self.surface.exec(&[SmolStr::new_static("show")]).await;
      let lower = out.stdout.to_lowercase();
      out.success && lower.contains("controller") && !lower.contains("no default controller")
   }

   pub async fn is_paired(&self) -> bool {
      self.device_info().await.succeeded_with("Paired: yes")
   }

   /// Queries the link state; edges are logged, steady state is not.
   pub async fn is_connected(&self) -> bool {
      let connected = self.device_info().await.succeeded_with("Connected: yes");
      let was = self.last_connected.swap(connected, Ordering::Relaxed);
      if connected != was {
         if connected {
            info!("BT device {} ({}) connected", self.label, self.mac);
         } else {
            warn!("BT device {} ({}) disconnected", self.label, self.mac);
         }
      }
      connected
   }

   /// Pairs and trusts the device in one long-lived session.
   ///
   /// The device must already be discoverable: the session scans long enough
   /// for the stack to cache it, then pairs while it is still cached.
   pub async fn pair(&self) -> bool {
      let mac = self.mac;
      info!("Pairing with {} ({mac})...", self.label);

      let mut steps: SmallVec<[SessionStep; 12]> = SmallVec::new();
      if let Some(adapter) = &self.adapter {
         steps.push(SessionStep::Send(format_smolstr!("select {adapter}")));
      }
      steps.extend([
         SessionStep::Send("power on".into()),
         SessionStep::Send("agent on".into()),
         SessionStep::Send("default-agent".into()),
         SessionStep::Send("scan on".into()),
         SessionStep::Wait(PAIR_SCAN_DURATION),
         SessionStep::Send(format_smolstr!("pair {mac}")),
         SessionStep::Send(format_smolstr!("trust {mac}")),
         SessionStep::Send("scan off".into()),
         SessionStep::Wait(PAIR_SETTLE_DURATION),
      ]);

      let out = self.surface.session(&steps, PAIR_SESSION_TIMEOUT).await;
      debug!("Pair output for {mac}: {}", out.tail(600));

      let confirmed = ["Pairing successful", "Already paired", "Paired: yes"]
         .iter()
         .any(|needle| out.stdout.contains(needle));
      if confirmed || self.is_paired().await {
         info!("Pairing with {mac} successful");
         true
      } else {
         warn!("Pairing with {mac} may have failed: {}", out.tail(200));
         false
      }
   }

   /// Connects the device, pairing first when needed.
   ///
   /// Returns immediately without side effects when already connected.
   /// `on_phase` is told when the pairing and connecting phases begin.
   pub async fn connect(&self, on_phase: &(dyn Fn(ConnectionState) + Send + Sync)) -> bool {
      if self.is_connected().await {
         debug!("{} already connected", self.mac);
         return true;
      }

      if !self.is_paired().await {
         info!("{} not paired, attempting to pair...", self.mac);
         on_phase(ConnectionState::Pairing);
         if !self.pair().await {
            return false;
         }
      }

      on_phase(ConnectionState::Connecting);
      info!("Connecting to {} ({})...", self.label, self.mac);
      self.power_on().await;
      time::sleep(POWER_ON_DELAY).await;

      let mac = self.mac;
      let out = self
         .surface
         .exec(&self.script([format_smolstr!("connect {mac}")]))
         .await;
      debug!("connect {mac}: {}", out.tail(200));

      for _ in 0..CONNECT_WAIT_CHECKS {
         time::sleep(CONNECT_WAIT_INTERVAL).await;
         if self.is_connected().await {
            info!("Connected to {} ({mac})", self.label);
            return true;
         }
      }

      warn!("Failed to connect to {mac} after {CONNECT_WAIT_CHECKS} checks");
      false
   }

   pub async fn disconnect(&self) -> bool {
      let mac = self.mac;
      let ok = self
         .surface
         .exec(&self.script([format_smolstr!("disconnect {mac}")]))
         .await
         .success;
      if ok {
         self.last_connected.store(false, Ordering::Relaxed);
      }
      ok
   }

   pub async fn trust(&self) -> bool {
      let mac = self.mac;
      self
         .surface
         .exec(&self.script([format_smolstr!("trust {mac}")]))
         .await
         .success
   }

   pub async fn power_on(&self) -> bool {
      self
         .surface
         .exec(&self.script([SmolStr::new_static("power on")]))
         .await
         .success
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use parking_lot::Mutex;

   use super::*;
   use crate::testing::{EventLog, FakeBluetooth};

   const SPEAKER: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

   fn controller(fake: FakeBluetooth, adapter: Option<&str>) -> BluetoothController<FakeBluetooth> {
      BluetoothController::new(fake, adapter.map(SmolStr::from), SPEAKER, "Kitchen".into())
   }

   #[tokio::test]
   async fn test_resolve_adapter_by_index() {
      let fake = FakeBluetooth::new(EventLog::default());
      fake.set_controllers(&["00:1A:7D:DA:71:13", "5C:F3:70:00:00:01"]);
      assert_eq!(resolve_adapter(&fake, "hci1").await, "5C:F3:70:00:00:01");
      assert_eq!(resolve_adapter(&fake, "hci7").await, "hci7");
      assert_eq!(resolve_adapter(&fake, "AA:BB:CC:DD:EE:FF").await, "AA:BB:CC:DD:EE:FF");
   }

   #[tokio::test]
   async fn test_scripts_are_prefixed_with_select() {
      let log = EventLog::default();
      let fake = FakeBluetooth::new(log.clone());
      let ctl = controller(fake, Some("00:1A:7D:DA:71:13"));
      ctl.is_connected().await;
      assert_eq!(
         log.entries(),
         vec!["bt:select 00:1A:7D:DA:71:13", "bt:info 11:22:33:44:55:66"]
      );
   }

   #[tokio::test]
   async fn test_availability() {
      let fake = FakeBluetooth::new(EventLog::default());
      let ctl = controller(fake.clone(), None);
      assert!(ctl.is_available().await);
      fake.set_available(false);
      assert!(!ctl.is_available().await);
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_when_connected_has_no_side_effects() {
      let log = EventLog::default();
      let fake = FakeBluetooth::new(log.clone());
      fake.set_paired(true);
      fake.set_connected(true);
      let ctl = controller(fake, None);

      let phases = Arc::new(Mutex::new(Vec::new()));
      let sink = phases.clone();
      assert!(ctl.connect(&move |p| sink.lock().push(p)).await);
      assert!(phases.lock().is_empty());
      assert_eq!(log.entries(), vec!["bt:info 11:22:33:44:55:66"]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_pairs_unknown_device() {
      let log = EventLog::default();
      let fake = FakeBluetooth::new(log.clone());
      fake.set_discoverable(true);
      let ctl = controller(fake.clone(), None);

      let phases = Arc::new(Mutex::new(Vec::new()));
      let sink = phases.clone();
      assert!(ctl.connect(&move |p| sink.lock().push(p)).await);
      assert_eq!(
         *phases.lock(),
         vec![ConnectionState::Pairing, ConnectionState::Connecting]
      );

      let entries = log.entries();
      let order = [
         "bt:power on",
         "bt:agent on",
         "bt:default-agent",
         "bt:scan on",
         "bt:pair 11:22:33:44:55:66",
         "bt:trust 11:22:33:44:55:66",
         "bt:scan off",
         "bt:connect 11:22:33:44:55:66",
      ];
      let mut cursor = 0;
      for step in order {
         let found = entries[cursor..]
            .iter()
            .position(|e| e == step)
            .unwrap_or_else(|| panic!("missing {step} in {entries:?}"));
         cursor += found + 1;
      }
      assert!(fake.is_connected_now());
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_fails_when_device_not_discoverable() {
      let fake = FakeBluetooth::new(EventLog::default());
      let ctl = controller(fake.clone(), None);
      assert!(!ctl.connect(&|_| {}).await);
      assert!(!fake.is_connected_now());
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_gives_up_after_wait_checks() {
      let log = EventLog::default();
      let fake = FakeBluetooth::new(log.clone());
      fake.set_paired(true);
      fake.set_reachable(false);
      let ctl = controller(fake, None);
      assert!(!ctl.connect(&|_| {}).await);
      let infos = log
         .entries()
         .iter()
         .filter(|e| e.starts_with("bt:info"))
         .count();
      // initial check, paired check, then the wait loop
      assert_eq!(infos, 2 + CONNECT_WAIT_CHECKS as usize);
   }
}
