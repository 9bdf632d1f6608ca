//! appspawn-sandbox: per-app mount-namespace construction
//!
//! The engine walks the configured mount points in order, skips those whose
//! permission the request lacks, substitutes `<Variable>` tokens, creates
//! missing directories with class-specific mode and ownership, and hands the
//! resolved mount to a [`Mounter`].

pub mod config;
pub mod dirs;
pub mod engine;
pub mod label;
pub mod mount;
pub mod namespace;
pub mod request;
pub mod variables;

pub use config::{SandboxConfig, SandboxMountConfig, SymbolLinkConfig};
pub use dirs::{ClassGroups, DirClass};
pub use engine::{MountFailure, SandboxEngine, SandboxReport};
pub use label::{LabelApplier, NoopLabeler, SelinuxLabeler};
pub use mount::{MountRequest, Mounter, RecordingMounter, SystemMounter};
pub use namespace::NamespaceConfig;
pub use request::SandboxRequest;
pub use variables::VariableTable;
