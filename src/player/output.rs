//! Interpretation of the player's log output.
//!
//! The player reports playback, format, sync and volume changes only through
//! its log lines. Each line is matched independently; anything unrecognised
//! is ignored.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{
   audio::{AudioSinkRouter, AudioSurface},
   player::process::PlayerOutput,
   status::{DeviceStatus, UpdateOp},
};

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
   PlaybackStarted { codec: Option<SmolStr> },
   PlaybackStopped,
   AudioFormat(SmolStr),
   Reanchor { sync_error_ms: Option<f64> },
   ServerConnected,
   Volume(u8),
}

pub type OutputEvents = SmallVec<[OutputEvent; 2]>;

fn after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
   line.find(marker).map(|i| &line[i + marker.len()..])
}

/// Extracts `N` from "... Sync error N ms ...".
fn parse_sync_error(line: &str) -> Option<f64> {
   let rest = after(line, "Sync error")?.trim_start();
   let end = rest
      .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
      .unwrap_or(rest.len());
   let (number, tail) = rest.split_at(end);
   if !tail.trim_start().starts_with("ms") {
      return None;
   }
   number.parse().ok()
}

fn parse_volume(line: &str) -> Option<u8> {
   if !line.contains("Volume:") && !line.to_ascii_lowercase().contains("player volume:") {
      return None;
   }
   let (_, value) = line.rsplit_once(':')?;
   let value = value.trim().trim_end_matches('%').trim_end();
   if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
      return None;
   }
   value.parse::<u16>().ok().map(|v| v.min(100) as u8)
}

/// Matches one line of player output against every known pattern.
pub fn parse_line(line: &str) -> OutputEvents {
   let mut events = OutputEvents::new();

   if line.contains("Stream STARTED") || line.contains("Stream started with codec") {
      let codec = after(line, "Stream started with codec")
         .map(str::trim)
         .filter(|c| !c.is_empty())
         .map(SmolStr::from);
      events.push(OutputEvent::PlaybackStarted { codec });
   } else if line.contains("Stream STOPPED") || line.contains("MPRIS interface stopped") {
      events.push(OutputEvent::PlaybackStopped);
   }

   if let Some(format) = after(line, "Audio format:").map(str::trim)
      && !format.is_empty()
   {
      events.push(OutputEvent::AudioFormat(format.into()));
   }

   if line.contains("re-anchor") {
      events.push(OutputEvent::Reanchor {
         sync_error_ms: parse_sync_error(line),
      });
   }

   if line.contains("Server connected") || line.contains("Handshake with server complete") {
      events.push(OutputEvent::ServerConnected);
   }

   if let Some(volume) = parse_volume(line) {
      events.push(OutputEvent::Volume(volume));
   }

   events
}

/// Consumes the output of one player instance and applies it to the status.
///
/// One consumer exists per process instance; it owns that instance's
/// streams and ends when both reach end of file.
pub struct OutputConsumer<A> {
   pub generation: u64,
   pub status: DeviceStatus,
   /// Last detailed format line, shared across instances of one device.
   pub format_cache: Arc<Mutex<Option<SmolStr>>>,
   pub router: Arc<AudioSinkRouter<A>>,
   /// Sink the instance renders to; volume sync is skipped without one.
   pub sink: Option<SmolStr>,
}

impl<A: AudioSurface> OutputConsumer<A> {
   pub async fn run(self, output: PlayerOutput) {
      let mut stdout = BufReader::new(output.stdout).split(b'\n');
      let mut stderr = BufReader::new(output.stderr).split(b'\n');
      let (mut stdout_open, mut stderr_open) = (true, true);

      while stdout_open || stderr_open {
         tokio::select! {
            segment = stdout.next_segment(), if stdout_open => match segment {
               Ok(Some(bytes)) => self.handle_bytes(&bytes).await,
               Ok(None) => stdout_open = false,
               Err(e) => {
                  warn!("Player stdout read failed: {e}");
                  stdout_open = false;
               },
            },
            segment = stderr.next_segment(), if stderr_open => match segment {
               Ok(Some(bytes)) => self.handle_bytes(&bytes).await,
               Ok(None) => stderr_open = false,
               Err(e) => {
                  warn!("Player stderr read failed: {e}");
                  stderr_open = false;
               },
            },
         }
      }
      debug!(
         "[{}] output of player instance {} closed",
         self.status.name(),
         self.generation
      );
   }

   async fn handle_bytes(&self, bytes: &[u8]) {
      let line = String::from_utf8_lossy(bytes);
      let line = line.trim_end();
      if line.is_empty() {
         return;
      }
      info!("[{}] {line}", self.status.name());
      for event in parse_line(line) {
         self.apply(event).await;
      }
   }

   fn show_format(&self, format: SmolStr) {
      if let UpdateOp::Updated(previous) = self.status.set_audio_format(Some(format.clone())) {
         debug!("[{}] audio format {previous} -> {format}", self.status.name());
      }
   }

   async fn apply(&self, event: OutputEvent) {
      let status = &self.status;
      match event {
         OutputEvent::PlaybackStarted { codec } => {
            status.set_playing(true);
            status.clear_reanchoring();
            if let Some(codec) = codec {
               let cached = self.format_cache.lock().clone();
               let format = match cached {
                  Some(detailed) if detailed.starts_with(codec.as_str()) => detailed,
                  _ => codec,
               };
               self.show_format(format);
            }
         },
         OutputEvent::PlaybackStopped => status.set_playing(false),
         OutputEvent::AudioFormat(format) => {
            *self.format_cache.lock() = Some(format.clone());
            self.show_format(format);
         },
         OutputEvent::Reanchor { sync_error_ms } => {
            let count = status.record_reanchor(sync_error_ms);
            match sync_error_ms {
               Some(ms) => warn!("[{}] re-anchor #{count}, sync error {ms} ms", status.name()),
               None => warn!("[{}] re-anchor #{count}", status.name()),
            }
         },
         OutputEvent::ServerConnected => {
            if !status.server_connected() {
               info!("[{}] connected to Sendspin server", status.name());
            }
            status.set_server_connected(true);
         },
         OutputEvent::Volume(volume) => {
            status.set_volume(volume);
            let Some(sink) = &self.sink else {
               return;
            };
            if let Err(e) = self.router.set_volume(sink, volume).await {
               warn!("[{}] failed to apply volume {volume}%: {e}", status.name());
            }
            // a resolved sink implies the persisted level was already restored
            if let Some(mac) = status.mac() {
               self.router.persist(mac, volume, status.muted());
            }
         },
      }
   }
}
