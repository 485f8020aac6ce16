//! Block storage provisioning core: iSCSI session setup and teardown, device
//! preparation, and the broker's service instance registry.
//!
//! ```no_run
//! use nbp::{Config, ConnectionDescriptor, Mounter, SessionManager};
//!
//! fn main() -> anyhow::Result<()> {
//!     let cfg = Config::default();
//!     let sessions = SessionManager::host(cfg.iscsi());
//!     let mounter = Mounter::host(cfg.volume());
//!
//!     let desc = ConnectionDescriptor::new("10.0.0.1:3260", "iqn.2017-01.demo:vol1", 0);
//!     let device = sessions.connect(&desc)?;
//!     mounter.format_and_mount(&device, "", "/mnt/vol1")?;
//!
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod exec;
mod iscsi;
mod probe;
mod registry;
mod volume;

pub use client::*;
pub use config::*;
pub use error::*;
pub use exec::{Executor, HostExecutor};
pub use iscsi::*;
pub use probe::*;
pub use registry::*;
pub use volume::*;
