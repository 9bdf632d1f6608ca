//! appspawn: the application spawning daemon
//!
//! A single-threaded server accepts one request per connection, decodes it,
//! and runs it through the hook pipeline around a fork:
//!
//! - **context**: per-request working state and live process records
//! - **store**: in-flight contexts, live processes, died queue
//! - **fork**: parent/child continuation split and the readiness pipe
//! - **child**: the program a child finally runs
//! - **modules**: builtin hooks (env, identity, sandbox, cgroup)
//! - **orchestrator**: request state machine
//! - **server** / **client**: the socket on either side
//!
//! # Example
//!
//! ```ignore
//! use appspawn::{AppSpawnContent, AppSpawnMgr, Server};
//! use appspawn_core::DaemonConfig;
//!
//! let config = DaemonConfig::load(None)?;
//! let server = Server::bind(&config)?;
//! let mut mgr = AppSpawnMgr::new(AppSpawnContent::new(config)).with_builtin_modules()?;
//! server.install_signal_handlers()?;
//! server.run(&mut mgr)?;
//! ```

pub mod child;
pub mod client;
pub mod content;
pub mod context;
pub mod fork;
pub mod modules;
pub mod orchestrator;
pub mod server;
pub mod store;

pub use child::{ChildEntry, ExecEntry, RecordingEntry};
pub use client::{SpawnClient, SpawnRequest};
pub use content::{AppSpawnContent, SandboxSetup};
pub use context::{AppSpawnedProcess, AppSpawningCtx, SpawnOutcome, SpawnState};
pub use fork::{Forker, ReadinessPipe, SimulatedForker, SystemForker};
pub use orchestrator::{AppSpawnMgr, Hooks};
pub use server::Server;
pub use store::SpawnStore;
