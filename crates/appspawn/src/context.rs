//! Per-request working state and live process records

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use appspawn_core::util::user_id_of;
use appspawn_msg::{AppFlag, MsgType, SpawnMessage};
use appspawn_sandbox::SandboxReport;

/// Identifier of one in-flight spawn inside the store
pub type RequestId = u64;

/// Where a spawn request currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    Accepted,
    Preparing,
    Forked,
    /// Child side, between fork and exec
    ChildSetup,
    /// Parent side, waiting for the child to report
    ParentWait,
    Completed,
    Failed,
}

/// Result slot of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned(i32),
    Failed(i32),
}

/// Values derived from the message before fork and consumed by child setup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildWork {
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
    pub sandbox_root: Option<PathBuf>,
    /// Descriptors passed with the request; they survive the clear-env stage
    pub keep_fds: Vec<RawFd>,
    /// Write end of the readiness pipe
    pub ready_fd: Option<RawFd>,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// One in-flight spawn request
#[derive(Debug, Clone)]
pub struct AppSpawningCtx {
    pub id: RequestId,
    pub message: SpawnMessage,
    pub state: SpawnState,
    pub work: ChildWork,
    pub pid: Option<i32>,
    pub result: Option<SpawnOutcome>,
    /// Child side only; the parent sees [`Self::mount_failures`]
    pub sandbox: Option<SandboxReport>,
    /// Non-fatal sandbox failures the child reported when it became ready
    pub mount_failures: Vec<String>,
    pub accepted: Instant,
}

impl AppSpawningCtx {
    pub fn new(id: RequestId, message: SpawnMessage) -> Self {
        let work = ChildWork {
            uid: message.uid,
            gid: message.gid,
            ..Default::default()
        };
        Self {
            id,
            message,
            state: SpawnState::Accepted,
            work,
            pid: None,
            result: None,
            sandbox: None,
            mount_failures: Vec::new(),
            accepted: Instant::now(),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.message.process_name
    }

    pub fn is_native(&self) -> bool {
        self.message.msg_type == MsgType::SpawnNative
    }

    /// Native spawns and `no-sandbox` requests never get the app sandbox
    pub fn sandbox_disabled(&self) -> bool {
        self.is_native() || self.message.is_flag_set(AppFlag::NoSandbox)
    }

    pub fn debuggable(&self) -> bool {
        self.message.is_flag_set(AppFlag::Debuggable)
    }

    /// `target: reason` for each failure in the child's sandbox report
    pub fn sandbox_notes(&self) -> Vec<String> {
        self.sandbox
            .iter()
            .flat_map(|report| &report.failures)
            .map(|f| format!("{}: {}", f.target, f.reason))
            .collect()
    }
}

/// One live process spawned by this daemon
#[derive(Debug, Clone, PartialEq)]
pub struct AppSpawnedProcess {
    pub pid: i32,
    pub name: String,
    pub bundle_name: String,
    /// Instance index of a multi-instance app
    pub app_index: u32,
    pub uid: u32,
    pub debuggable: bool,
    pub mount_failures: Vec<String>,
    pub created: Instant,
}

impl AppSpawnedProcess {
    pub fn from_ctx(ctx: &AppSpawningCtx, pid: i32) -> Self {
        let (bundle_name, app_index) = ctx.message.bundle_info();
        Self {
            pid,
            name: ctx.message.process_name.clone(),
            bundle_name: bundle_name.to_string(),
            app_index,
            uid: ctx.work.uid,
            debuggable: ctx.debuggable(),
            mount_failures: ctx.mount_failures.clone(),
            created: Instant::now(),
        }
    }

    pub fn user_id(&self) -> u32 {
        user_id_of(self.uid)
    }

    pub fn uptime(&self) -> Duration {
        self.created.elapsed()
    }
}

/// Exit record of a process that is no longer live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiedProcess {
    pub pid: i32,
    pub name: String,
    pub status: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use appspawn_msg::TlvRecord;
    use appspawn_sandbox::MountFailure;

    #[test]
    fn test_native_spawn_skips_sandbox() {
        let msg = SpawnMessage::new(MsgType::SpawnNative, "native");
        let ctx = AppSpawningCtx::new(1, msg);
        assert!(ctx.sandbox_disabled());
        assert_eq!(ctx.state, SpawnState::Accepted);
    }

    #[test]
    fn test_no_sandbox_flag() {
        let mut msg = SpawnMessage::new(MsgType::Spawn, "com.example.app");
        assert!(!AppSpawningCtx::new(1, msg.clone()).sandbox_disabled());
        msg.set_flag(AppFlag::NoSandbox);
        assert!(AppSpawningCtx::new(1, msg).sandbox_disabled());
    }

    #[test]
    fn test_process_record_from_ctx() {
        let mut msg = SpawnMessage::new(MsgType::Spawn, "com.example.app:remote");
        msg.uid = 20010001;
        msg.push(TlvRecord::BundleInfo {
            bundle_index: 2,
            bundle_name: "com.example.app".into(),
        });
        msg.set_flag(AppFlag::Debuggable);
        let ctx = AppSpawningCtx::new(7, msg);

        let process = AppSpawnedProcess::from_ctx(&ctx, 4242);
        assert_eq!(process.pid, 4242);
        assert_eq!(process.name, "com.example.app:remote");
        assert_eq!(process.bundle_name, "com.example.app");
        assert_eq!(process.app_index, 2);
        assert_eq!(process.user_id(), 100);
        assert!(process.debuggable);
        assert!(process.mount_failures.is_empty());
    }

    #[test]
    fn test_sandbox_notes_from_report() {
        let mut ctx = AppSpawningCtx::new(1, SpawnMessage::new(MsgType::Spawn, "app"));
        assert!(ctx.sandbox_notes().is_empty());
        ctx.sandbox = Some(SandboxReport {
            failures: vec![MountFailure {
                target: "/data/a".into(),
                reason: "gone".into(),
                critical: false,
            }],
            ..Default::default()
        });
        assert_eq!(ctx.sandbox_notes(), vec!["/data/a: gone"]);
    }
}
