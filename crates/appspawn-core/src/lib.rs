//! appspawn-core: errors, hook pipeline and configuration shared by every
//! appspawn crate
//!
//! - Error taxonomy and Result alias
//! - Priority-ordered, staged hook registry
//! - Daemon configuration and config-fragment lookup
//! - Host capability detection and sandbox mode resolution

pub mod capabilities;
pub mod config;
pub mod error;
pub mod hook;
pub mod privilege;
pub mod util;

pub use config::{ConfigLocator, DaemonConfig};
pub use error::{Result, SpawnError};
pub use hook::{HookRegistry, HookStage, Priority, StageKind};
pub use privilege::SandboxMode;
