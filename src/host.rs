//! Bounded execution of host utilities.
//!
//! Every call into `bluetoothctl`, `pactl` and friends goes through a
//! [`HostRunner`], which caps the number of concurrently running host
//! commands and enforces a timeout on each. A timed-out command is killed
//! and reported as a failure; nothing here ever returns an error to the
//! caller; failures are data.

use std::{process::Stdio, sync::Arc, time::Duration};

use log::debug;
use smol_str::SmolStr;
use tokio::{io::AsyncWriteExt, process::Command, sync::Semaphore, time};

/// Captured result of a host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
   pub success: bool,
   pub stdout: String,
}

impl CommandOutput {
   #[cfg(test)]
   pub fn ok(stdout: impl Into<String>) -> Self {
      Self {
         success: true,
         stdout: stdout.into(),
      }
   }

   pub fn failed(stdout: impl Into<String>) -> Self {
      Self {
         success: false,
         stdout: stdout.into(),
      }
   }

   /// True iff the command succeeded and its output contains `needle`.
   pub fn succeeded_with(&self, needle: &str) -> bool {
      self.success && self.stdout.contains(needle)
   }

   /// Last `max` bytes of output, for log lines.
   pub fn tail(&self, max: usize) -> &str {
      let mut start = self.stdout.len().saturating_sub(max);
      while !self.stdout.is_char_boundary(start) {
         start += 1;
      }
      &self.stdout[start..]
   }
}

/// One step of an interactive session fed to a tool's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStep {
   Send(SmolStr),
   Wait(Duration),
}

/// Semaphore-bounded pool for host command execution.
///
/// Cheaply cloneable; all clones share the same permits.
#[derive(Debug, Clone)]
pub struct HostRunner {
   permits: Arc<Semaphore>,
}

impl HostRunner {
   pub fn new(max_concurrent: usize) -> Self {
      Self {
         permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
      }
   }

   /// Runs `program` with `args`, optionally piping `stdin`, bounded by `limit`.
   pub async fn run(
      &self,
      program: &str,
      args: &[&str],
      stdin: Option<&str>,
      limit: Duration,
   ) -> CommandOutput {
      let Ok(_permit) = self.permits.acquire().await else {
         return CommandOutput::failed("host runner closed");
      };

      let exec = async {
         let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
               Stdio::piped()
            } else {
               Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

         if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
         }
         child.wait_with_output().await
      };

      match time::timeout(limit, exec).await {
         Ok(Ok(output)) => {
            let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            stdout.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandOutput {
               success: output.status.success(),
               stdout,
            }
         },
         Ok(Err(e)) => {
            debug!("{program} {args:?} failed to run: {e}");
            CommandOutput::failed(e.to_string())
         },
         Err(_) => {
            debug!("{program} {args:?} timed out after {limit:?}");
            CommandOutput::failed(format!("timed out after {limit:?}"))
         },
      }
   }

   /// Runs a long-lived interactive session of `program`, feeding `steps` to
   /// its stdin while output is collected concurrently. Stdin is closed after
   /// the last step; the whole session is bounded by `limit`.
   pub async fn run_session(
      &self,
      program: &str,
      args: &[&str],
      steps: &[SessionStep],
      limit: Duration,
   ) -> CommandOutput {
      let Ok(_permit) = self.permits.acquire().await else {
         return CommandOutput::failed("host runner closed");
      };

      let exec = async {
         let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

         let mut pipe = child.stdin.take();
         let feed = async move {
            let Some(pipe) = pipe.as_mut() else {
               return;
            };
            for step in steps {
               match step {
                  SessionStep::Send(line) => {
                     let line = format!("{line}\n");
                     if let Err(e) = pipe.write_all(line.as_bytes()).await {
                        debug!("{program} session stdin closed early: {e}");
                        return;
                     }
                  },
                  SessionStep::Wait(d) => time::sleep(*d).await,
               }
            }
         };

         let (_, output) = tokio::join!(feed, child.wait_with_output());
         output
      };

      match time::timeout(limit, exec).await {
         Ok(Ok(output)) => {
            let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            stdout.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandOutput {
               success: output.status.success(),
               stdout,
            }
         },
         Ok(Err(e)) => CommandOutput::failed(e.to_string()),
         Err(_) => CommandOutput::failed(format!("session timed out after {limit:?}")),
      }
   }
}
