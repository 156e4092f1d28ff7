//! Persistent per-device volume using heed (LMDB).
//!
//! Volumes are keyed by the speaker's Bluetooth address so a speaker gets
//! its last level back after a reconnect or a daemon restart.

use std::{
   path::{Path, PathBuf},
   sync::Arc,
};

use heed::{
   Database, Env, EnvOpenOptions,
   types::{SerdeBincode, Str},
};
use log::debug;
use serde::{Deserialize, Serialize};
use smol_str::ToSmolStr;
use thiserror::Error;

use crate::{bluetooth::MacAddress, error::Result, status::unix_now};

/// Errors that can occur in volume store operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create volume store directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

/// Last known output level of one speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
   pub volume: u8,
   pub muted: bool,
   pub updated: u64, // Unix timestamp
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// MAC address -> `VolumeRecord`
   volumes: Database<Str, SerdeBincode<VolumeRecord>>,
}

/// Thread-safe handle to the volume database.
#[derive(Clone, Debug)]
pub struct VolumeStore {
   db: Arc<Db>,
}

impl VolumeStore {
   /// Opens or creates the store at its default location.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path).map_err(Error::CreateDirectory)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024)
            .max_dbs(1)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let volumes = env
         .create_database(&mut wtxn, Some("volumes"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      debug!("Opened volume store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, volumes }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BRIDGE_VOLUME_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/sendspin-bridge/volumes.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("sendspin-bridge").join("volumes.db"))
   }

   pub fn get(&self, mac: MacAddress) -> Result<Option<VolumeRecord>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      let key = mac.to_smolstr();
      let record = self
         .db
         .volumes
         .get(&rtxn, key.as_str())
         .map_err(Error::DatabaseOperation)?;
      Ok(record.filter(|r| r.volume <= 100))
   }

   pub fn put(&self, mac: MacAddress, volume: u8, muted: bool) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      let key = mac.to_smolstr();
      let record = VolumeRecord {
         volume: volume.min(100),
         muted,
         updated: unix_now(),
      };
      self
         .db
         .volumes
         .put(&mut wtxn, key.as_str(), &record)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }
}
