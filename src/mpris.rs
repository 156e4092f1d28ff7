//! Best-effort pause of the bridge's players over MPRIS.
//!
//! Pausing before the players are stopped lets the server see a clean
//! transition instead of a dropped stream.

use log::{debug, warn};
use smol_str::SmolStr;
use zbus::{Connection, Proxy, fdo::DBusProxy};

use crate::error::Result;

const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
const MPRIS_PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";

/// Pauses every player the bridge runs.
pub trait PlaybackPauser: Send + Sync {
   /// Returns the number of players that accepted the pause.
   fn pause_all(&self) -> impl Future<Output = usize> + Send;
}

/// Pauses MPRIS players whose bus name starts with a prefix.
pub struct MprisPauser {
   connection: Connection,
   prefix: SmolStr,
}

impl MprisPauser {
   pub async fn connect(prefix: SmolStr) -> Result<Self> {
      let connection = Connection::session().await?;
      Ok(Self { connection, prefix })
   }

   async fn pause(&self, name: &str) -> Result<()> {
      let proxy = Proxy::new(&self.connection, name, MPRIS_PATH, MPRIS_PLAYER_INTERFACE).await?;
      proxy.call_method("Pause", &()).await?;
      Ok(())
   }
}

impl PlaybackPauser for MprisPauser {
   async fn pause_all(&self) -> usize {
      let names = match DBusProxy::new(&self.connection).await {
         Ok(proxy) => match proxy.list_names().await {
            Ok(names) => names,
            Err(e) => {
               warn!("Failed to list bus names: {e}");
               return 0;
            },
         },
         Err(e) => {
            warn!("Failed to reach the bus daemon: {e}");
            return 0;
         },
      };

      let mut paused = 0;
      for name in names.iter().filter(|n| n.as_str().starts_with(self.prefix.as_str())) {
         match self.pause(name.as_str()).await {
            Ok(()) => {
               debug!("Paused {name}");
               paused += 1;
            },
            Err(e) => debug!("Failed to pause {name}: {e}"),
         }
      }
      paused
   }
}
