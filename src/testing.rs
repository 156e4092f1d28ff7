//! In-memory stand-ins for the host tools, shared by unit tests.

use std::{
   collections::HashMap,
   io,
   sync::{
      Arc,
      atomic::{AtomicU32, Ordering},
   },
   time::Duration,
};

use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   io::{AsyncWriteExt, DuplexStream},
   time,
};

use crate::{
   audio::AudioSurface,
   bluetooth::BluetoothSurface,
   event::{BridgeEvent, EventBus},
   host::{CommandOutput, SessionStep},
   player::process::{ExitInfo, LaunchSpec, PlayerLauncher, PlayerOutput, PlayerProcess},
   status::DeviceStatus,
};

/// Ordered record of every side effect the fakes observe.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
   pub fn push(&self, entry: impl Into<String>) {
      self.0.lock().push(entry.into());
   }

   pub fn entries(&self) -> Vec<String> {
      self.0.lock().clone()
   }

   /// Index of the first entry starting with `prefix`.
   pub fn position(&self, prefix: &str) -> Option<usize> {
      self.0.lock().iter().position(|e| e.starts_with(prefix))
   }
}

/// Event bus that drops everything.
pub struct NullBus;

impl EventBus for NullBus {
   fn emit(&self, _device: &DeviceStatus, _event: BridgeEvent) {}
}

/// Event bus recording `(device key, event)` pairs.
#[derive(Debug, Default)]
pub struct RecordingBus(Mutex<Vec<(SmolStr, BridgeEvent)>>);

impl RecordingBus {
   pub fn events(&self) -> Vec<(SmolStr, BridgeEvent)> {
      self.0.lock().clone()
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, device: &DeviceStatus, event: BridgeEvent) {
      self.0.lock().push((device.key().clone(), event));
   }
}

// === Bluetooth ===

#[derive(Debug, Clone, Copy)]
struct RemoteDevice {
   paired: bool,
   connected: bool,
   discoverable: bool,
   reachable: bool,
}

#[derive(Debug)]
struct BluetoothState {
   controllers: Vec<String>,
   available: bool,
   /// Initial state of devices not seen yet
   template: RemoteDevice,
   devices: HashMap<String, RemoteDevice>,
}

impl BluetoothState {
   fn update_all(&mut self, f: impl Fn(&mut RemoteDevice)) {
      f(&mut self.template);
      self.devices.values_mut().for_each(f);
   }
}

/// Scripted `bluetoothctl`.
///
/// Setters apply to every remote device; the `*_for` variants to one.
#[derive(Debug, Clone)]
pub struct FakeBluetooth {
   state: Arc<Mutex<BluetoothState>>,
   log: EventLog,
}

impl FakeBluetooth {
   pub fn new(log: EventLog) -> Self {
      Self {
         state: Arc::new(Mutex::new(BluetoothState {
            controllers: vec!["00:1A:7D:DA:71:13".to_owned()],
            available: true,
            template: RemoteDevice {
               paired: false,
               connected: false,
               discoverable: false,
               reachable: true,
            },
            devices: HashMap::new(),
         })),
         log,
      }
   }

   pub fn set_controllers(&self, controllers: &[&str]) {
      self.state.lock().controllers = controllers.iter().map(|c| (*c).to_owned()).collect();
   }

   pub fn set_available(&self, available: bool) {
      self.state.lock().available = available;
   }

   pub fn set_paired(&self, paired: bool) {
      self.state.lock().update_all(|d| d.paired = paired);
   }

   pub fn set_connected(&self, connected: bool) {
      self.state.lock().update_all(|d| d.connected = connected);
   }

   pub fn set_discoverable(&self, discoverable: bool) {
      self.state.lock().update_all(|d| d.discoverable = discoverable);
   }

   /// Whether `connect` succeeds for a paired device.
   pub fn set_reachable(&self, reachable: bool) {
      self.state.lock().update_all(|d| d.reachable = reachable);
   }

   fn with_device<T>(&self, mac: &str, f: impl FnOnce(&mut RemoteDevice) -> T) -> T {
      let mut state = self.state.lock();
      let template = state.template;
      f(state.devices.entry(mac.to_owned()).or_insert(template))
   }

   pub fn set_connected_for(&self, mac: &str, connected: bool) {
      self.with_device(mac, |d| d.connected = connected);
   }

   pub fn set_reachable_for(&self, mac: &str, reachable: bool) {
      self.with_device(mac, |d| d.reachable = reachable);
   }

   /// True if any remote device is connected.
   pub fn is_connected_now(&self) -> bool {
      let state = self.state.lock();
      if state.devices.is_empty() {
         return state.template.connected;
      }
      state.devices.values().any(|d| d.connected)
   }

   fn answer(&self, command: &str) -> String {
      self.log.push(format!("bt:{command}"));
      let (verb, mac) = command.split_once(' ').unwrap_or((command, ""));
      match verb {
         "list" => self
            .state
            .lock()
            .controllers
            .iter()
            .map(|c| format!("Controller {c} host [default]\n"))
            .collect(),
         "show" if self.state.lock().available => {
            "Controller 00:1A:7D:DA:71:13 (public)\n\tPowered: yes\n".to_owned()
         },
         "show" => "No default controller available\n".to_owned(),
         "info" => self.with_device(mac, |d| {
            let yes_no = |b: bool| if b { "yes" } else { "no" };
            format!(
               "Device {mac}\n\tPaired: {}\n\tTrusted: yes\n\tConnected: {}\n",
               yes_no(d.paired),
               yes_no(d.connected)
            )
         }),
         "connect" => self.with_device(mac, |d| {
            if d.paired && d.reachable {
               d.connected = true;
               "Connection successful\n".to_owned()
            } else {
               "Failed to connect: org.bluez.Error.Failed\n".to_owned()
            }
         }),
         "disconnect" => self.with_device(mac, |d| {
            d.connected = false;
            "Successful disconnected\n".to_owned()
         }),
         "pair" => self.with_device(mac, |d| {
            if d.discoverable {
               d.paired = true;
               "Pairing successful\n".to_owned()
            } else {
               "Failed to pair: org.bluez.Error.AuthenticationFailed\n".to_owned()
            }
         }),
         _ => String::new(),
      }
   }
}

impl BluetoothSurface for FakeBluetooth {
   async fn exec(&self, script: &[SmolStr]) -> CommandOutput {
      let stdout: String = script.iter().map(|c| self.answer(c)).collect();
      CommandOutput::ok(stdout)
   }

   async fn session(&self, steps: &[SessionStep], limit: Duration) -> CommandOutput {
      let run = async {
         let mut stdout = String::new();
         for step in steps {
            match step {
               SessionStep::Send(command) => stdout.push_str(&self.answer(command)),
               SessionStep::Wait(d) => time::sleep(*d).await,
            }
         }
         stdout
      };
      match time::timeout(limit, run).await {
         Ok(stdout) => CommandOutput::ok(stdout),
         Err(_) => CommandOutput::failed("session timed out"),
      }
   }
}

// === Audio ===

#[derive(Debug, Default)]
struct AudioState {
   /// Sink name -> number of probes before it becomes visible
   sinks: Vec<(String, u32)>,
   volumes: HashMap<String, u8>,
   mutes: HashMap<String, bool>,
   probes: u32,
}

impl AudioState {
   fn visible(&self, sink: &str) -> bool {
      self
         .sinks
         .iter()
         .any(|(name, after)| name == sink && self.probes >= *after)
   }
}

/// Scripted `pactl`.
#[derive(Debug, Clone)]
pub struct FakeAudio {
   state: Arc<Mutex<AudioState>>,
   log: EventLog,
}

impl FakeAudio {
   pub fn new(log: EventLog) -> Self {
      Self {
         state: Arc::default(),
         log,
      }
   }

   pub fn add_sink(&self, name: &str) {
      self.add_sink_after(name, 0);
   }

   /// Adds a sink that only answers once `probes` volume queries were made.
   pub fn add_sink_after(&self, name: &str, probes: u32) {
      self.state.lock().sinks.push((name.to_owned(), probes));
   }

   pub fn remove_sink(&self, name: &str) {
      self.state.lock().sinks.retain(|(n, _)| n != name);
   }

   pub fn probes(&self) -> u32 {
      self.state.lock().probes
   }

   pub fn volume_of(&self, sink: &str) -> Option<u8> {
      self.state.lock().volumes.get(sink).copied()
   }
}

impl AudioSurface for FakeAudio {
   async fn exec(&self, args: &[&str]) -> CommandOutput {
      self.log.push(format!("pactl:{}", args.join(" ")));
      let mut state = self.state.lock();
      match args {
         ["get-sink-volume", sink] => {
            let visible = state.visible(sink);
            state.probes += 1;
            if !visible {
               return CommandOutput::failed("Failed to get sink volume: No such entity");
            }
            let v = state.volumes.get(*sink).copied().unwrap_or(100);
            CommandOutput::ok(format!("Volume: front-left: 65536 / {v}% / 0.00 dB\n"))
         },
         ["set-sink-volume", sink, level] => {
            if !state.visible(sink) {
               return CommandOutput::failed("Failure: No such entity");
            }
            let v = level.trim_end_matches('%').parse().unwrap_or(100);
            state.volumes.insert((*sink).to_owned(), v);
            CommandOutput::ok("")
         },
         ["set-sink-mute", sink, flag] => {
            if !state.visible(sink) {
               return CommandOutput::failed("Failure: No such entity");
            }
            state.mutes.insert((*sink).to_owned(), *flag == "1");
            CommandOutput::ok("")
         },
         ["get-sink-mute", sink] => {
            let muted = state.mutes.get(*sink).copied().unwrap_or(false);
            CommandOutput::ok(if muted { "Mute: yes\n" } else { "Mute: no\n" })
         },
         ["get-default-sink"] => match state.sinks.first() {
            Some((name, _)) => CommandOutput::ok(format!("{name}\n")),
            None => CommandOutput::failed(""),
         },
         ["list", "short", "sinks"] => CommandOutput::ok(
            state
               .sinks
               .iter()
               .enumerate()
               .map(|(i, (name, _))| format!("{i}\t{name}\tmodule-bluez5-device.c\ts16le 2ch 48000Hz\tIDLE\n"))
               .collect::<String>(),
         ),
         _ => CommandOutput::failed("unknown command"),
      }
   }
}

// === Player ===

#[derive(Debug, Default)]
struct Instance {
   pid: u32,
   exit: Option<ExitInfo>,
   writer: Option<DuplexStream>,
}

#[derive(Debug, Default)]
struct LauncherState {
   launches: Vec<LaunchSpec>,
   instances: Vec<Arc<Mutex<Instance>>>,
   fail: bool,
}

/// Launcher whose processes are driven by the test.
#[derive(Debug, Clone)]
pub struct FakeLauncher {
   state: Arc<Mutex<LauncherState>>,
   log: EventLog,
   next_pid: Arc<AtomicU32>,
}

impl FakeLauncher {
   pub fn new(log: EventLog) -> Self {
      Self {
         state: Arc::default(),
         log,
         next_pid: Arc::new(AtomicU32::new(4000)),
      }
   }

   pub fn launches(&self) -> Vec<LaunchSpec> {
      self.state.lock().launches.clone()
   }

   pub fn set_fail(&self, fail: bool) {
      self.state.lock().fail = fail;
   }

   /// Number of instances that have not exited.
   pub fn alive(&self) -> usize {
      self
         .state
         .lock()
         .instances
         .iter()
         .filter(|i| i.lock().exit.is_none())
         .count()
   }

   fn latest(&self) -> Option<Arc<Mutex<Instance>>> {
      self.state.lock().instances.last().cloned()
   }

   /// Makes the latest instance exit on its own.
   pub fn crash(&self) {
      if let Some(instance) = self.latest() {
         let mut instance = instance.lock();
         instance.exit = Some(ExitInfo { code: Some(1) });
         instance.writer = None;
      }
   }

   /// Writes one line to the latest instance's stdout.
   pub async fn emit(&self, line: &str) {
      let Some(mut writer) = self.take_writer() else {
         return;
      };
      let _ = writer.write_all(format!("{line}\n").as_bytes()).await;
      if let Some(instance) = self.latest() {
         instance.lock().writer = Some(writer);
      }
   }

   /// Takes the stdout writer of the latest instance.
   pub fn take_writer(&self) -> Option<DuplexStream> {
      self.latest()?.lock().writer.take()
   }
}

pub struct FakeProcess {
   instance: Arc<Mutex<Instance>>,
   log: EventLog,
}

impl PlayerProcess for FakeProcess {
   fn id(&self) -> Option<u32> {
      Some(self.instance.lock().pid)
   }

   fn try_wait(&mut self) -> Option<ExitInfo> {
      self.instance.lock().exit
   }

   async fn terminate(&mut self, _grace: Duration) {
      let pid = {
         let mut instance = self.instance.lock();
         if instance.exit.is_none() {
            instance.exit = Some(ExitInfo { code: None });
         }
         instance.writer = None;
         instance.pid
      };
      self.log.push(format!("player:terminate {pid}"));
   }
}

impl PlayerLauncher for FakeLauncher {
   type Process = FakeProcess;

   fn launch(&self, spec: &LaunchSpec) -> io::Result<(FakeProcess, PlayerOutput)> {
      let mut state = self.state.lock();
      state.launches.push(spec.clone());
      if state.fail {
         self.log.push("player:launch-failed");
         return Err(io::Error::new(io::ErrorKind::NotFound, "sendspin: not found"));
      }

      let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
      let (writer, reader) = tokio::io::duplex(64 * 1024);
      let instance = Arc::new(Mutex::new(Instance {
         pid,
         exit: None,
         writer: Some(writer),
      }));
      state.instances.push(instance.clone());
      self.log.push(format!("player:launch {pid}"));

      Ok((
         FakeProcess {
            instance,
            log: self.log.clone(),
         },
         PlayerOutput {
            stdout: Box::new(reader),
            stderr: Box::new(tokio::io::empty()),
         },
      ))
   }
}
