//! Configuration management for the bridge daemon.
//!
//! This module handles loading and saving configuration from disk and turns
//! the configured speakers into resolved [`Device`] descriptions.

use std::{collections::HashSet, env, fs, path::PathBuf, time::Duration};

use log::warn;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, ToSmolStr, format_smolstr};

use crate::{
   bluetooth::{LinkTimings, MacAddress},
   error::{BridgeError, Result},
   player::{PlayerTimings, process::slug},
};

/// Which message bus the dashboard service is published on.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
   #[default]
   Session,
   System,
}

/// Main configuration structure for the daemon.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Sendspin server host; `auto`/`discover`/empty let the player discover it.
   #[serde(default = "default_server_host")]
   pub server_host: SmolStr,

   #[serde(default = "default_server_port")]
   pub server_port: u16,

   #[serde(default = "default_player_binary")]
   pub player_binary: SmolStr,

   #[serde(default = "default_bluetoothctl")]
   pub bluetoothctl: SmolStr,

   #[serde(default = "default_pactl")]
   pub pactl: SmolStr,

   /// Parent directory of the per-player settings directories.
   #[serde(default = "default_work_dir")]
   pub work_dir: PathBuf,

   #[serde(default = "default_base_listen_port")]
   pub base_listen_port: u16,

   #[serde(default = "default_static_delay_ms")]
   pub static_delay_ms: f64,

   #[serde(default = "default_check_interval")]
   pub check_interval_secs: u64,

   #[serde(default = "default_liveness_interval")]
   pub liveness_interval_secs: u64,

   #[serde(default = "default_max_host_commands")]
   pub max_host_commands: usize,

   #[serde(default = "default_true")]
   pub persist_volume: bool,

   #[serde(default)]
   pub dbus_bus: BusKind,

   /// Bus-name prefix of the players paused on shutdown.
   #[serde(default = "default_mpris_prefix")]
   pub mpris_prefix: SmolStr,

   /// Single-speaker setups from before `[[devices]]` existed.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub bluetooth_mac: Option<SmolStr>,

   #[serde(default)]
   pub devices: Vec<DeviceConfig>,
}

/// One configured speaker.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeviceConfig {
   /// Empty for a plain player on the host's default output.
   #[serde(default)]
   pub mac: SmolStr,

   #[serde(default)]
   pub adapter: SmolStr,

   #[serde(default)]
   pub player_name: SmolStr,

   #[serde(default, alias = "port", skip_serializing_if = "Option::is_none")]
   pub listen_port: Option<u16>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub listen_host: Option<SmolStr>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub static_delay_ms: Option<f64>,

   #[serde(default = "default_true")]
   pub enabled: bool,
}

/// A configured speaker with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
   pub key: SmolStr,
   pub slug: SmolStr,
   pub name: SmolStr,
   pub mac: Option<MacAddress>,
   pub adapter: Option<SmolStr>,
   pub listen_host: Option<SmolStr>,
   pub listen_port: u16,
   pub static_delay_ms: f64,
   pub enabled: bool,
}

fn default_server_host() -> SmolStr {
   SmolStr::new_static("auto")
}

const fn default_server_port() -> u16 {
   9000
}

fn default_player_binary() -> SmolStr {
   SmolStr::new_static("sendspin")
}

fn default_bluetoothctl() -> SmolStr {
   SmolStr::new_static("bluetoothctl")
}

fn default_pactl() -> SmolStr {
   SmolStr::new_static("pactl")
}

fn default_work_dir() -> PathBuf {
   PathBuf::from("/tmp")
}

const fn default_base_listen_port() -> u16 {
   8928
}

const fn default_static_delay_ms() -> f64 {
   -500.0
}

const fn default_check_interval() -> u64 {
   10
}

const fn default_liveness_interval() -> u64 {
   10
}

const fn default_max_host_commands() -> usize {
   8
}

const fn default_true() -> bool {
   true
}

fn default_mpris_prefix() -> SmolStr {
   SmolStr::new_static("org.mpris.MediaPlayer2.Sendspin")
}

impl Default for Config {
   fn default() -> Self {
      Self {
         server_host: default_server_host(),
         server_port: default_server_port(),
         player_binary: default_player_binary(),
         bluetoothctl: default_bluetoothctl(),
         pactl: default_pactl(),
         work_dir: default_work_dir(),
         base_listen_port: default_base_listen_port(),
         static_delay_ms: default_static_delay_ms(),
         check_interval_secs: default_check_interval(),
         liveness_interval_secs: default_liveness_interval(),
         max_host_commands: default_max_host_commands(),
         persist_volume: true,
         dbus_bus: BusKind::default(),
         mpris_prefix: default_mpris_prefix(),
         bluetooth_mac: None,
         devices: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(path) = env::var("BRIDGE_CONFIG") {
         return Ok(PathBuf::from(path));
      }
      if let Ok(bridge_home) = env::var("BRIDGE_HOME") {
         return Ok(PathBuf::from(bridge_home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(BridgeError::ConfigDirNotFound);
      };

      Ok(config_dir.join("sendspin-bridge").join("config.toml"))
   }

   /// Server URL passed to players, unless discovery is requested.
   pub fn server_url(&self) -> Option<SmolStr> {
      let host = self.server_host.trim();
      if host.is_empty() || host.eq_ignore_ascii_case("auto") || host.eq_ignore_ascii_case("discover")
      {
         return None;
      }
      Some(format_smolstr!("ws://{host}:{}/sendspin", self.server_port))
   }

   pub fn link_timings(&self) -> LinkTimings {
      LinkTimings {
         check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
         ..LinkTimings::default()
      }
   }

   pub fn player_timings(&self) -> PlayerTimings {
      PlayerTimings {
         liveness_interval: Duration::from_secs(self.liveness_interval_secs.max(1)),
         ..PlayerTimings::default()
      }
   }

   /// Resolves the configured speakers.
   ///
   /// Without `[[devices]]`, the legacy `bluetooth_mac` yields a single device.
   pub fn devices(&self) -> Result<Vec<Device>> {
      let legacy;
      let entries = if self.devices.is_empty() {
         legacy = [DeviceConfig {
            mac: self.bluetooth_mac.clone().unwrap_or_default(),
            adapter: SmolStr::default(),
            player_name: SmolStr::new_static("Sendspin Player"),
            listen_port: None,
            listen_host: None,
            static_delay_ms: None,
            enabled: true,
         }];
         &legacy[..]
      } else {
         &self.devices[..]
      };

      let mut keys = HashSet::new();
      let mut devices = Vec::with_capacity(entries.len());
      for (index, entry) in entries.iter().enumerate() {
         let mac_text = entry.mac.trim();
         let mac = if mac_text.is_empty() {
            None
         } else {
            Some(mac_text.to_ascii_uppercase().parse::<MacAddress>()?)
         };

         let name = match entry.player_name.trim() {
            "" => match mac {
               Some(mac) => format_smolstr!("Speaker {mac}"),
               None => format_smolstr!("Sendspin Player {}", index + 1),
            },
            name => name.to_smolstr(),
         };
         let slug = slug(&name);

         let mut key = mac.map_or_else(|| slug.clone(), |m| m.to_smolstr());
         if !keys.insert(key.clone()) {
            warn!("Duplicate device {key}, keying entry {index} separately");
            key = format_smolstr!("{key}-{index}");
            keys.insert(key.clone());
         }

         let offset = u16::try_from(index).unwrap_or(u16::MAX);
         devices.push(Device {
            key,
            slug,
            name,
            mac,
            adapter: Some(entry.adapter.trim().to_smolstr()).filter(|a| !a.is_empty()),
            listen_host: entry
               .listen_host
               .as_ref()
               .map(|h| h.trim().to_smolstr())
               .filter(|h| !h.is_empty()),
            listen_port: entry
               .listen_port
               .unwrap_or_else(|| self.base_listen_port.saturating_add(offset)),
            static_delay_ms: entry.static_delay_ms.unwrap_or(self.static_delay_ms),
            enabled: entry.enabled,
         });
      }
      Ok(devices)
   }
}
