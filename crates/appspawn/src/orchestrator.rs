//! Drives one request from decoded bytes to a reply
//!
//! ```text
//! Accepted -> Decoding -> Preparing -> Forked -+-> ChildSetup (child)
//!                                              +-> ParentWait -> Completed | Failed
//! ```
//!
//! Requests are handled one at a time on the calling thread; every path
//! through [`AppSpawnMgr::handle_request`] yields exactly one [`Reply`].

use appspawn_core::hook::StageKind;
use appspawn_core::{HookRegistry, HookStage, Result, SpawnError};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use appspawn_msg::{FailureCode, MsgType, Reply, SpawnMessage};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::child::{ChildEntry, ExecEntry};
use crate::content::AppSpawnContent;
use crate::context::{AppSpawnedProcess, AppSpawningCtx, RequestId, SpawnOutcome, SpawnState};
use crate::fork::{Forker, Readiness, ReadinessPipe, SystemForker};
use crate::store::{SpawnStore, exit_status};

/// Hook registries, one per stage kind
pub struct Hooks {
    pub server: HookRegistry<(), AppSpawnContent>,
    pub spawn: HookRegistry<AppSpawnContent, AppSpawningCtx>,
    pub process: HookRegistry<AppSpawnContent, AppSpawnedProcess>,
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            server: HookRegistry::new(StageKind::Server),
            spawn: HookRegistry::new(StageKind::Spawn),
            process: HookRegistry::new(StageKind::Process),
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("server", &self.server)
            .field("spawn", &self.spawn)
            .field("process", &self.process)
            .finish()
    }
}

/// The spawn orchestrator
pub struct AppSpawnMgr {
    content: AppSpawnContent,
    store: SpawnStore,
    hooks: Hooks,
    forker: Box<dyn Forker>,
    entry: Box<dyn ChildEntry>,
}

impl AppSpawnMgr {
    /// Orchestrator with real fork, exec entry and no hooks
    pub fn new(content: AppSpawnContent) -> Self {
        let store = SpawnStore::new(content.config.died_queue_len);
        Self {
            content,
            store,
            hooks: Hooks::new(),
            forker: Box::new(SystemForker),
            entry: Box::new(ExecEntry),
        }
    }

    pub fn with_forker(mut self, forker: impl Forker + 'static) -> Self {
        self.forker = Box::new(forker);
        self
    }

    pub fn with_entry(mut self, entry: impl ChildEntry + 'static) -> Self {
        self.entry = Box::new(entry);
        self
    }

    /// Register the builtin modules that make a real daemon
    pub fn with_builtin_modules(mut self) -> Result<Self> {
        crate::modules::register_builtins(&mut self.hooks)?;
        Ok(self)
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    pub fn content(&self) -> &AppSpawnContent {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut AppSpawnContent {
        &mut self.content
    }

    pub fn store(&self) -> &SpawnStore {
        &self.store
    }

    /// Run `PRELOAD` hooks; must precede the first request
    pub fn preload(&mut self) -> Result<()> {
        self.hooks
            .server
            .dispatch(HookStage::Preload, &(), &mut self.content)
    }

    /// Run `SERVER_EXIT` hooks
    pub fn server_exit(&mut self) {
        let failed = self
            .hooks
            .server
            .notify(HookStage::ServerExit, &(), &mut self.content);
        if failed > 0 {
            log::warn!("{} server exit hooks failed", failed);
        }
    }

    /// Decode `buf` and handle it
    pub fn handle_request(&mut self, buf: &[u8]) -> Reply {
        self.handle_request_with_fds(buf, Vec::new())
    }

    /// Decode `buf` and handle it along with the descriptors passed with it
    ///
    /// The descriptors are closed in the daemon once the request is done.
    pub fn handle_request_with_fds(&mut self, buf: &[u8], fds: Vec<OwnedFd>) -> Reply {
        match appspawn_msg::decode(buf) {
            Ok((msg, consumed)) => {
                log::debug!(
                    "decoded {:?} for {} ({} bytes)",
                    msg.msg_type,
                    msg.process_name,
                    consumed
                );
                self.handle_message_with_fds(msg, fds)
            }
            Err(err) => {
                log::warn!("rejecting request: {}", err);
                Reply::failure(SpawnError::from(err).reply_code())
            }
        }
    }

    pub fn handle_message(&mut self, msg: SpawnMessage) -> Reply {
        self.handle_message_with_fds(msg, Vec::new())
    }

    pub fn handle_message_with_fds(&mut self, msg: SpawnMessage, fds: Vec<OwnedFd>) -> Reply {
        match msg.msg_type {
            MsgType::Spawn | MsgType::SpawnNative => self.spawn(msg, &fds),
            MsgType::TerminationStatus => self.termination_status(&msg),
            MsgType::Dump => {
                for line in self.dump() {
                    log::info!("{}", line);
                }
                Reply(0)
            }
        }
    }

    fn spawn(&mut self, msg: SpawnMessage, fds: &[OwnedFd]) -> Reply {
        if let Err(err) = msg.validate_names() {
            log::warn!("rejecting spawn request: {}", err);
            return Reply::failure(SpawnError::from(err).reply_code());
        }
        let id = self.store.create_context(msg);
        let outcome = self.run_spawn(id, fds);

        let reply = match &outcome {
            Ok(pid) => Reply::pid(*pid),
            Err(err) => {
                log::error!("spawn request {} failed: {}", id, err);
                Reply::failure(err.reply_code())
            }
        };
        let slot = match outcome {
            Ok(pid) => SpawnOutcome::Spawned(pid),
            Err(err) => SpawnOutcome::Failed(err.code()),
        };
        match self.store.complete(id, slot) {
            Ok(Some(process)) => {
                self.hooks
                    .process
                    .notify(HookStage::AppAdd, &self.content, process);
            }
            Ok(None) => {}
            Err(err) => log::error!("completing request {}: {}", id, err),
        }
        reply
    }

    fn run_spawn(&mut self, id: RequestId, fds: &[OwnedFd]) -> Result<i32> {
        let ctx = self
            .store
            .context_mut(id)
            .ok_or_else(|| SpawnError::NotFound(format!("spawn request {}", id)))?;

        ctx.work.keep_fds = passed_fds(&ctx.message, fds)?;
        ctx.state = SpawnState::Preparing;
        self.hooks
            .spawn
            .dispatch(HookStage::SpawnPrepare, &self.content, ctx)?;

        let mut pipe = ReadinessPipe::new()?;
        ctx.work.ready_fd = pipe.writer_fd();
        ctx.state = SpawnState::Forked;

        let pid = {
            let hooks = &self.hooks.spawn;
            let content = &self.content;
            let entry = &*self.entry;
            let pipe = &pipe;
            // the child works on its own copy, as it would after a real fork
            let mut child_ctx = ctx.clone();
            self.forker
                .fork(&mut || child_main(hooks, content, entry, pipe, &mut child_ctx))?
                .as_raw()
        };
        pipe.close_writer();
        ctx.pid = Some(pid);
        ctx.state = SpawnState::ParentWait;

        let ready = match pipe.wait(self.content.config.child_ready_timeout()) {
            Ok(Readiness::Ready(notes)) => {
                for note in &notes {
                    log::warn!("child {} sandbox: {}", pid, note);
                }
                ctx.mount_failures = notes;
                Ok(())
            }
            Ok(Readiness::Aborted(code)) => Err(SpawnError::Hook {
                code,
                reason: format!("child {} setup", pid),
            }),
            Ok(Readiness::Closed) => Err(SpawnError::Setup(format!(
                "child {} exited during setup",
                pid
            ))),
            Err(err) => Err(err),
        };
        let posted = ready.and_then(|()| {
            self.hooks
                .spawn
                .dispatch(HookStage::SpawnPost, &self.content, ctx)
        });
        if let Err(err) = posted {
            kill_child(pid);
            return Err(err);
        }
        Ok(pid)
    }

    fn termination_status(&mut self, msg: &SpawnMessage) -> Reply {
        let Some(pid) = msg.termination_pid() else {
            log::warn!("termination request without a pid");
            return Reply::failure(FailureCode::Unknown);
        };
        if let Some(died) = self.store.take_died(pid) {
            return Reply(i64::from(died.status));
        }
        let timeout = self.content.config.terminate_timeout();
        match self.store.terminate(pid, Signal::SIGKILL, timeout) {
            Ok((mut process, status)) => {
                self.hooks
                    .process
                    .notify(HookStage::AppDied, &self.content, &mut process);
                Reply(i64::from(status))
            }
            Err(err) => {
                log::warn!("terminating {}: {}", pid, err);
                Reply::failure(err.reply_code())
            }
        }
    }

    /// One line per in-flight context and live process
    pub fn dump(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} spawning, {} live",
            self.store.spawning_count(),
            self.store.live_count()
        )];
        self.store.traverse_spawning(|ctx| {
            lines.push(format!(
                "request {} {} state {:?} age {:?}",
                ctx.id,
                ctx.process_name(),
                ctx.state,
                ctx.accepted.elapsed()
            ));
        });
        self.store.traverse(|p| {
            lines.push(format!(
                "pid {} {} index {} uid {} debuggable {} mount failures {} up {:?}",
                p.pid,
                p.name,
                p.app_index,
                p.uid,
                p.debuggable,
                p.mount_failures.len(),
                p.uptime()
            ));
        });
        lines
    }

    /// Reap every exited child without blocking
    ///
    /// Called from the server loop after SIGCHLD.
    pub fn reap_children(&mut self) -> usize {
        let mut reaped = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status) => {
                    if let (Some(pid), Some(code)) = (status.pid(), exit_status(status)) {
                        self.on_child_exit(pid.as_raw(), code);
                        reaped += 1;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("waitpid: {}", e);
                    break;
                }
            }
        }
        reaped
    }

    /// Apply one death notification
    pub fn on_child_exit(&mut self, pid: i32, status: i32) {
        match self.store.on_process_died(pid, status) {
            Some(mut process) => {
                self.hooks
                    .process
                    .notify(HookStage::AppDied, &self.content, &mut process);
            }
            None => log::debug!("reaped untracked child {} ({})", pid, status),
        }
    }
}

impl std::fmt::Debug for AppSpawnMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSpawnMgr")
            .field("content", &self.content)
            .field("store", &self.store)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// The child continuation: setup stages, readiness report, entry
fn child_main(
    hooks: &HookRegistry<AppSpawnContent, AppSpawningCtx>,
    content: &AppSpawnContent,
    entry: &dyn ChildEntry,
    pipe: &ReadinessPipe,
    ctx: &mut AppSpawningCtx,
) -> i32 {
    ctx.state = SpawnState::ChildSetup;
    let setup = [
        HookStage::SpawnClearEnv,
        HookStage::SpawnSetChildProperty,
        HookStage::SpawnCompleted,
    ]
    .into_iter()
    .try_for_each(|stage| hooks.dispatch(stage, content, ctx));

    match setup {
        Ok(()) => match pipe.notify_ready(&ctx.sandbox_notes()) {
            Ok(()) => entry.run(ctx),
            Err(err) => {
                log::error!("{}: reporting readiness: {}", ctx.process_name(), err);
                err.code()
            }
        },
        Err(err) => {
            let code = err.code();
            if let Err(report) = pipe.notify(code) {
                log::error!("{}: reporting abort: {}", ctx.process_name(), report);
            }
            code
        }
    }
}

/// Raw numbers of the descriptors passed with a request
///
/// The message's fd list must account for every descriptor received.
fn passed_fds(msg: &SpawnMessage, fds: &[OwnedFd]) -> Result<Vec<RawFd>> {
    if msg.fds().len() != fds.len() {
        return Err(SpawnError::InvalidArgument(format!(
            "fd list names {} descriptors but {} arrived",
            msg.fds().len(),
            fds.len()
        )));
    }
    Ok(fds.iter().map(AsRawFd::as_raw_fd).collect())
}

fn kill_child(pid: i32) {
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => log::info!("killed child {}", pid),
        Err(e) => log::debug!("kill {}: {}", pid, e),
    }
}
