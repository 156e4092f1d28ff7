//! Audio sink discovery and volume control through `pactl`.
//!
//! Naming of Bluetooth sinks differs between PipeWire and PulseAudio, so the
//! sink for a speaker is found by probing a list of naming conventions.
//! Discovery is retried a few times since the sink may appear a few seconds
//! after the link comes up.

use std::time::Duration;

use log::{debug, info, warn};
use smallvec::SmallVec;
use smol_str::{SmolStr, format_smolstr};
use tokio::time;

use crate::{
   audio::volume_store::VolumeStore,
   bluetooth::MacAddress,
   error::{BridgeError, Result},
   host::{CommandOutput, HostRunner},
   status::DeviceStatus,
};

/// Timeout for one `pactl` call
const PACTL_TIMEOUT: Duration = Duration::from_secs(5);
/// Rounds of probing before discovery gives up
const RESOLVE_ROUNDS: u32 = 3;

/// The command surface of the host sound server.
pub trait AudioSurface: Send + Sync + 'static {
   fn exec(&self, args: &[&str]) -> impl Future<Output = CommandOutput> + Send;
}

/// `pactl` driven through the shared host runner.
#[derive(Debug, Clone)]
pub struct Pactl {
   runner: HostRunner,
   program: SmolStr,
}

impl Pactl {
   pub fn new(runner: HostRunner, program: impl Into<SmolStr>) -> Self {
      Self {
         runner,
         program: program.into(),
      }
   }
}

impl AudioSurface for Pactl {
   async fn exec(&self, args: &[&str]) -> CommandOutput {
      self
         .runner
         .run(&self.program, args, None, PACTL_TIMEOUT)
         .await
   }
}

/// Delays used during sink discovery.
#[derive(Debug, Clone, Copy)]
pub struct SinkTimings {
   /// Wait after the link comes up before the first probe
   pub settle: Duration,
   /// Wait between probing rounds
   pub retry: Duration,
}

impl Default for SinkTimings {
   fn default() -> Self {
      Self {
         settle: Duration::from_secs(3),
         retry: Duration::from_secs(3),
      }
   }
}

/// Candidate sink names for a speaker, in probing order.
pub fn sink_candidates(mac: MacAddress) -> SmallVec<[SmolStr; 4]> {
   let m = mac.underscored();
   SmallVec::from_buf([
      // PipeWire
      format_smolstr!("bluez_output.{m}.1"),
      format_smolstr!("bluez_output.{m}.a2dp-sink"),
      // PulseAudio
      format_smolstr!("bluez_sink.{m}.a2dp_sink"),
      format_smolstr!("bluez_sink.{m}"),
   ])
}

/// Parses the first percentage from `pactl get-sink-volume` output.
fn parse_volume(output: &str) -> Option<u8> {
   output.split_whitespace().find_map(|word| {
      let digits = word.strip_suffix('%')?;
      digits.parse::<u16>().ok().map(|v| v.min(100) as u8)
   })
}

/// Resolves and drives the audio sink of a Bluetooth speaker.
pub struct AudioSinkRouter<A> {
   surface: A,
   volumes: Option<VolumeStore>,
   timings: SinkTimings,
}

impl<A: AudioSurface> AudioSinkRouter<A> {
   pub fn new(surface: A, volumes: Option<VolumeStore>, timings: SinkTimings) -> Self {
      Self {
         surface,
         volumes,
         timings,
      }
   }

   async fn probe(&self, sink: &str) -> bool {
      self.surface.exec(&["get-sink-volume", sink]).await.success
   }

   /// Finds the sink of `mac`, or `None` after all rounds came up empty.
   pub async fn resolve_sink(&self, mac: MacAddress) -> Option<SmolStr> {
      time::sleep(self.timings.settle).await;

      let candidates = sink_candidates(mac);
      for round in 1..=RESOLVE_ROUNDS {
         for sink in &candidates {
            if self.probe(sink).await {
               info!("Found audio sink for {mac}: {sink}");
               return Some(sink.clone());
            }
         }
         if round < RESOLVE_ROUNDS {
            debug!("No sink for {mac} yet (round {round}/{RESOLVE_ROUNDS})");
            time::sleep(self.timings.retry).await;
         }
      }

      let known = self.list_sinks().await;
      let default = self.default_sink().await;
      warn!("Could not find audio sink for {mac}; known sinks: {known:?}, default: {default:?}");
      None
   }

   /// Resolves the sink, resets it to 100% and restores the persisted level.
   ///
   /// The restored level is written through to `status`; when nothing was
   /// persisted the status keeps reporting 100.
   pub async fn configure(&self, mac: MacAddress, status: &DeviceStatus) -> Option<SmolStr> {
      let sink = self.resolve_sink(mac).await?;

      if let Err(e) = self.set_volume(&sink, 100).await {
         warn!("Failed to reset volume of {sink}: {e}");
      }
      status.set_volume(100);

      match self.restore(mac, &sink).await {
         Some((volume, muted)) => {
            status.set_volume(volume);
            status.set_muted(muted);
         },
         None => {
            status.set_volume(self.get_volume(&sink).await.unwrap_or(100));
            status.set_muted(self.get_mute(&sink).await.unwrap_or(false));
         },
      }
      Some(sink)
   }

   /// Applies the persisted level of `mac` to `sink`, if one exists.
   async fn restore(&self, mac: MacAddress, sink: &str) -> Option<(u8, bool)> {
      let store = self.volumes.as_ref()?;
      let record = match store.get(mac) {
         Ok(record) => record?,
         Err(e) => {
            warn!("Failed to read persisted volume for {mac}: {e}");
            return None;
         },
      };

      if let Err(e) = self.set_volume(sink, record.volume).await {
         warn!("Failed to restore volume of {sink}: {e}");
         return None;
      }
      if record.muted
         && let Err(e) = self.set_mute(sink, true).await
      {
         warn!("Failed to restore mute of {sink}: {e}");
      }
      info!("Restored volume {}% for {mac}", record.volume);
      Some((record.volume, record.muted))
   }

   /// Stores the level of `mac` for the next connection.
   pub fn persist(&self, mac: MacAddress, volume: u8, muted: bool) {
      if let Some(store) = &self.volumes
         && let Err(e) = store.put(mac, volume, muted)
      {
         warn!("Failed to persist volume for {mac}: {e}");
      }
   }

   pub async fn set_volume(&self, sink: &str, volume: u8) -> Result<()> {
      let level = format!("{}%", volume.min(100));
      let out = self.surface.exec(&["set-sink-volume", sink, &level]).await;
      Self::check("set-sink-volume", out)
   }

   pub async fn set_mute(&self, sink: &str, muted: bool) -> Result<()> {
      let flag = if muted { "1" } else { "0" };
      let out = self.surface.exec(&["set-sink-mute", sink, flag]).await;
      Self::check("set-sink-mute", out)
   }

   pub async fn get_volume(&self, sink: &str) -> Option<u8> {
      let out = self.surface.exec(&["get-sink-volume", sink]).await;
      if !out.success {
         return None;
      }
      parse_volume(&out.stdout)
   }

   pub async fn get_mute(&self, sink: &str) -> Option<bool> {
      let out = self.surface.exec(&["get-sink-mute", sink]).await;
      if !out.success {
         return None;
      }
      Some(out.stdout.contains("yes"))
   }

   pub async fn default_sink(&self) -> Option<SmolStr> {
      let out = self.surface.exec(&["get-default-sink"]).await;
      let name = out.stdout.trim();
      (out.success && !name.is_empty()).then(|| name.into())
   }

   /// Names of every sink the sound server knows about.
   pub async fn list_sinks(&self) -> Vec<SmolStr> {
      let out = self.surface.exec(&["list", "short", "sinks"]).await;
      if !out.success {
         return Vec::new();
      }
      out.stdout
         .lines()
         .filter_map(|line| line.split('\t').nth(1))
         .map(SmolStr::from)
         .collect()
   }

   fn check(command: &'static str, out: CommandOutput) -> Result<()> {
      if out.success {
         Ok(())
      } else {
         Err(BridgeError::CommandFailed {
            command: SmolStr::new_static(command),
            output: out.tail(200).to_owned(),
         })
      }
   }
}
