//! Launching and terminating the Sendspin player process.

use std::{fmt, io, path::PathBuf, process::Stdio, time::Duration};

use log::{debug, warn};
use smol_str::{SmolStr, format_smolstr};
use tokio::{io::AsyncRead, process::Command, time};

/// Everything needed to start one player instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
   pub program: SmolStr,
   pub name: SmolStr,
   pub client_id: SmolStr,
   pub port: u16,
   pub settings_dir: PathBuf,
   pub static_delay_ms: f64,
   /// Explicit server address; `None` lets the player discover one.
   pub server_url: Option<SmolStr>,
   /// Sink the player should render to.
   pub sink: Option<SmolStr>,
}

impl LaunchSpec {
   pub fn args(&self) -> Vec<String> {
      let mut args = vec![
         "daemon".to_owned(),
         "--name".to_owned(),
         self.name.to_string(),
         "--id".to_owned(),
         self.client_id.to_string(),
         "--port".to_owned(),
         self.port.to_string(),
         "--settings-dir".to_owned(),
         self.settings_dir.display().to_string(),
         "--static-delay-ms".to_owned(),
         self.static_delay_ms.to_string(),
      ];
      if let Some(url) = &self.server_url {
         args.push("--url".to_owned());
         args.push(url.to_string());
      }
      args
   }

   pub fn envs(&self) -> Vec<(&'static str, SmolStr)> {
      let mut envs = vec![
         ("SENDSPIN_BRIDGE_MANUFACTURER", SmolStr::new_static("Sendspin")),
         ("SENDSPIN_BRIDGE_PRODUCT_NAME", SmolStr::new_static("Bluetooth Bridge")),
         ("SENDSPIN_BRIDGE_VERSION", SmolStr::new_static(env!("CARGO_PKG_VERSION"))),
      ];
      if let Some(sink) = &self.sink {
         envs.push(("PULSE_SINK", sink.clone()));
      }
      envs
   }
}

/// Filesystem- and id-safe form of a player name.
pub fn slug(name: &str) -> SmolStr {
   let mut out = String::with_capacity(name.len());
   for c in name.chars() {
      if c.is_ascii_alphanumeric() {
         out.push(c.to_ascii_lowercase());
      } else if !out.ends_with('-') {
         out.push('-');
      }
   }
   let trimmed = out.trim_matches('-');
   if trimmed.is_empty() {
      SmolStr::new_static("player")
   } else {
      trimmed.into()
   }
}

/// Client id the player announces to the server.
pub fn client_id(slug: &str) -> SmolStr {
   format_smolstr!("sendspin-{slug}")
}

/// How a player process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
   pub code: Option<i32>,
}

impl fmt::Display for ExitInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.code {
         Some(code) => write!(f, "exit code {code}"),
         None => f.write_str("killed by signal"),
      }
   }
}

/// Output streams of a launched player.
pub struct PlayerOutput {
   pub stdout: Box<dyn AsyncRead + Send + Unpin>,
   pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

/// A running player instance.
pub trait PlayerProcess: Send + 'static {
   fn id(&self) -> Option<u32>;

   /// `None` while the process is still running.
   fn try_wait(&mut self) -> Option<ExitInfo>;

   /// Asks the process to stop, killing it once `grace` has elapsed.
   fn terminate(&mut self, grace: Duration) -> impl Future<Output = ()> + Send;
}

/// Starts player instances.
pub trait PlayerLauncher: Send + Sync + 'static {
   type Process: PlayerProcess;

   fn launch(&self, spec: &LaunchSpec) -> io::Result<(Self::Process, PlayerOutput)>;
}

/// Launches the real `sendspin` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendspinLauncher;

impl PlayerLauncher for SendspinLauncher {
   type Process = SendspinProcess;

   fn launch(&self, spec: &LaunchSpec) -> io::Result<(SendspinProcess, PlayerOutput)> {
      std::fs::create_dir_all(&spec.settings_dir)?;

      let mut child = Command::new(spec.program.as_str())
         .args(spec.args())
         .envs(spec.envs().iter().map(|(k, v)| (*k, v.as_str())))
         .stdin(Stdio::null())
         .stdout(Stdio::piped())
         .stderr(Stdio::piped())
         .kill_on_drop(true)
         .spawn()?;

      let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
         return Err(io::Error::other("player output not captured"));
      };
      Ok((
         SendspinProcess { child },
         PlayerOutput {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
         },
      ))
   }
}

pub struct SendspinProcess {
   child: tokio::process::Child,
}

impl PlayerProcess for SendspinProcess {
   fn id(&self) -> Option<u32> {
      self.child.id()
   }

   fn try_wait(&mut self) -> Option<ExitInfo> {
      match self.child.try_wait() {
         Ok(Some(status)) => Some(ExitInfo {
            code: status.code(),
         }),
         Ok(None) => None,
         Err(e) => {
            warn!("Failed to poll player process: {e}");
            Some(ExitInfo { code: None })
         },
      }
   }

   async fn terminate(&mut self, grace: Duration) {
      if self.try_wait().is_some() {
         return;
      }

      if let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) {
         // SAFETY: plain signal delivery to our own child
         unsafe {
            libc::kill(pid, libc::SIGTERM);
         }
      }

      match time::timeout(grace, self.child.wait()).await {
         Ok(Ok(status)) => debug!("Player exited with {status}"),
         Ok(Err(e)) => warn!("Failed to wait for player: {e}"),
         Err(_) => {
            warn!("Player ignored SIGTERM for {grace:?}, killing");
            if let Err(e) = self.child.kill().await {
               warn!("Failed to kill player: {e}");
            }
         },
      }
   }
}
