//! Supervision of the Sendspin player process.

pub mod output;
pub mod process;
pub mod supervisor;

pub use process::{PlayerLauncher, SendspinLauncher};
pub use supervisor::{PlayerHandle, PlayerSettings, PlayerTimings, ProcessSupervisor};
