//! Bluetooth hardware addresses.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smol_str::{SmolStr, format_smolstr};

use crate::error::BridgeError;

/// A 48-bit Bluetooth device or controller address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
   /// Returns the address with `_` separators, as used by audio-server sink names.
   pub fn underscored(&self) -> SmolStr {
      let [a, b, c, d, e, f] = self.0;
      format_smolstr!("{a:02X}_{b:02X}_{c:02X}_{d:02X}_{e:02X}_{f:02X}")
   }

   /// Finds the first address-shaped token in a line of tool output.
   pub fn find_in(line: &str) -> Option<Self> {
      line.split_whitespace().find_map(|tok| tok.parse().ok())
   }
}

impl fmt::Display for MacAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for MacAddress {
   type Err = BridgeError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || BridgeError::InvalidAddress(s.into());
      if s.len() != 17 {
         return Err(invalid());
      }
      let mut bytes = [0u8; 6];
      let mut parts = s.split(':');
      for byte in &mut bytes {
         let part = parts.next().ok_or_else(invalid)?;
         if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
         }
         *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
      }
      if parts.next().is_some() {
         return Err(invalid());
      }
      Ok(Self(bytes))
   }
}

impl Serialize for MacAddress {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for MacAddress {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = SmolStr::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}
