//! In-flight spawn contexts and live spawned processes
//!
//! The store is owned by the orchestrator thread. Death notifications from
//! the reaper are applied through [`SpawnStore::on_process_died`] on that same
//! thread, so no locking is needed.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use appspawn_core::{Result, SpawnError};
use appspawn_msg::SpawnMessage;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::context::{
    AppSpawnedProcess, AppSpawningCtx, DiedProcess, RequestId, SpawnOutcome, SpawnState,
};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct SpawnStore {
    next_id: RequestId,
    spawning: BTreeMap<RequestId, AppSpawningCtx>,
    live: BTreeMap<i32, AppSpawnedProcess>,
    died: VecDeque<DiedProcess>,
    died_capacity: usize,
}

impl SpawnStore {
    pub fn new(died_capacity: usize) -> Self {
        Self {
            next_id: 1,
            spawning: BTreeMap::new(),
            live: BTreeMap::new(),
            died: VecDeque::new(),
            died_capacity,
        }
    }

    /// Start tracking a new request
    pub fn create_context(&mut self, message: SpawnMessage) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        self.spawning.insert(id, AppSpawningCtx::new(id, message));
        id
    }

    pub fn context(&self, id: RequestId) -> Option<&AppSpawningCtx> {
        self.spawning.get(&id)
    }

    pub fn context_mut(&mut self, id: RequestId) -> Option<&mut AppSpawningCtx> {
        self.spawning.get_mut(&id)
    }

    pub fn spawning_count(&self) -> usize {
        self.spawning.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Finish a request
    ///
    /// The context leaves the in-flight set. On success it is promoted to a
    /// live process record, replacing any stale record with the same pid.
    pub fn complete(
        &mut self,
        id: RequestId,
        outcome: SpawnOutcome,
    ) -> Result<Option<&mut AppSpawnedProcess>> {
        let mut ctx = self
            .spawning
            .remove(&id)
            .ok_or_else(|| SpawnError::NotFound(format!("spawn request {}", id)))?;
        ctx.result = Some(outcome);

        match outcome {
            SpawnOutcome::Failed(code) => {
                ctx.state = SpawnState::Failed;
                log::debug!("request {} ({}) failed with {}", id, ctx.process_name(), code);
                Ok(None)
            }
            SpawnOutcome::Spawned(pid) => {
                ctx.state = SpawnState::Completed;
                if let Some(stale) = self.live.remove(&pid) {
                    log::warn!("pid {} reused, dropping stale record for {}", pid, stale.name);
                }
                let process = AppSpawnedProcess::from_ctx(&ctx, pid);
                log::info!("{} spawned as pid {}", process.name, pid);
                Ok(Some(self.live.entry(pid).or_insert(process)))
            }
        }
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<&AppSpawnedProcess> {
        self.live.get(&pid)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&AppSpawnedProcess> {
        self.live.values().find(|p| p.name == name)
    }

    /// Visit every live process in pid order
    pub fn traverse(&self, mut visitor: impl FnMut(&AppSpawnedProcess)) {
        self.live.values().for_each(&mut visitor);
    }

    /// Visit every in-flight context in arrival order
    pub fn traverse_spawning(&self, mut visitor: impl FnMut(&AppSpawningCtx)) {
        self.spawning.values().for_each(&mut visitor);
    }

    /// Apply a death notification
    ///
    /// Untracked pids are ignored. A tracked one moves to the died queue,
    /// evicting the oldest entry once the queue is full.
    pub fn on_process_died(&mut self, pid: i32, status: i32) -> Option<AppSpawnedProcess> {
        let process = self.live.remove(&pid)?;
        log::info!("{} (pid {}) died with status {}", process.name, pid, status);
        if self.died_capacity > 0 {
            if self.died.len() == self.died_capacity {
                self.died.pop_front();
            }
            self.died.push_back(DiedProcess {
                pid,
                name: process.name.clone(),
                status,
            });
        }
        Some(process)
    }

    /// Take the recorded exit of `pid`, if any
    pub fn take_died(&mut self, pid: i32) -> Option<DiedProcess> {
        let at = self.died.iter().position(|d| d.pid == pid)?;
        self.died.remove(at)
    }

    pub fn died(&self) -> impl Iterator<Item = &DiedProcess> {
        self.died.iter()
    }

    /// Signal a live process and reap it
    ///
    /// Escalates to SIGKILL once when `timeout` passes. The record is removed
    /// whenever the pid turns out to be gone.
    pub fn terminate(
        &mut self,
        pid: i32,
        signal: Signal,
        timeout: Duration,
    ) -> Result<(AppSpawnedProcess, i32)> {
        if !self.live.contains_key(&pid) {
            return Err(SpawnError::NotFound(format!("pid {} is not a spawned app", pid)));
        }
        match terminate_process(Pid::from_raw(pid), signal, timeout) {
            Ok(status) => {
                let process = self
                    .live
                    .remove(&pid)
                    .ok_or_else(|| SpawnError::NotFound(format!("pid {}", pid)))?;
                Ok((process, status))
            }
            Err(err @ SpawnError::NotFound(_)) => {
                self.live.remove(&pid);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

/// Exit status of a terminated child, signals reported as `128 + signo`
pub fn exit_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Send `signal`, wait up to `timeout`, then SIGKILL and wait once more
pub fn terminate_process(pid: Pid, signal: Signal, timeout: Duration) -> Result<i32> {
    send(pid, signal)?;
    if let Some(status) = wait_exit(pid, timeout)? {
        return Ok(status);
    }
    if signal == Signal::SIGKILL {
        return Err(SpawnError::Timeout(format!("pid {} survived SIGKILL", pid)));
    }

    log::warn!("pid {} ignored {}, sending SIGKILL", pid, signal);
    send(pid, Signal::SIGKILL)?;
    wait_exit(pid, timeout)?
        .ok_or_else(|| SpawnError::Timeout(format!("pid {} survived SIGKILL", pid)))
}

fn send(pid: Pid, signal: Signal) -> Result<()> {
    match kill(pid, signal) {
        // already exited; the zombie is still ours to reap
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SpawnError::syscall(&format!("kill {}", pid), e)),
    }
}

fn wait_exit(pid: Pid, timeout: Duration) -> Result<Option<i32>> {
    let start = Instant::now();
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                if let Some(code) = exit_status(status) {
                    return Ok(Some(code));
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                return Err(SpawnError::NotFound(format!("pid {} is not our child", pid)));
            }
            Err(e) => return Err(SpawnError::syscall("waitpid", e)),
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use appspawn_msg::MsgType;
    use nix::sys::signal::{SigHandler, signal};
    use nix::unistd::{ForkResult, fork, pause};
    use std::io::{Read, Write};

    fn message(name: &str) -> SpawnMessage {
        SpawnMessage::new(MsgType::Spawn, name)
    }

    fn spawned(store: &mut SpawnStore, name: &str, pid: i32) {
        let id = store.create_context(message(name));
        store.complete(id, SpawnOutcome::Spawned(pid)).unwrap();
    }

    #[test]
    fn test_complete_promotes_to_live() {
        let mut store = SpawnStore::new(4);
        let id = store.create_context(message("com.example.app"));
        assert_eq!(store.spawning_count(), 1);
        assert_eq!(store.context(id).unwrap().state, SpawnState::Accepted);

        let process = store.complete(id, SpawnOutcome::Spawned(100)).unwrap().unwrap();
        assert_eq!(process.pid, 100);
        assert_eq!(store.spawning_count(), 0);
        assert_eq!(store.find_by_pid(100).unwrap().name, "com.example.app");
        assert_eq!(store.find_by_name("com.example.app").unwrap().pid, 100);
    }

    #[test]
    fn test_failed_request_leaves_no_record() {
        let mut store = SpawnStore::new(4);
        let id = store.create_context(message("broken"));
        assert!(store.complete(id, SpawnOutcome::Failed(13)).unwrap().is_none());
        assert_eq!(store.live_count(), 0);
        assert!(store.complete(id, SpawnOutcome::Failed(13)).is_err());
    }

    #[test]
    fn test_pid_reuse_replaces_stale_record() {
        let mut store = SpawnStore::new(4);
        spawned(&mut store, "old", 100);
        spawned(&mut store, "new", 100);
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.find_by_pid(100).unwrap().name, "new");
        assert!(store.find_by_name("old").is_none());
    }

    #[test]
    fn test_death_moves_to_bounded_queue() {
        let mut store = SpawnStore::new(2);
        for pid in [1, 2, 3] {
            spawned(&mut store, &format!("app{}", pid), pid);
        }
        for pid in [1, 2, 3] {
            assert!(store.on_process_died(pid, pid).is_some());
            assert!(store.find_by_pid(pid).is_none());
        }
        assert!(store.on_process_died(99, 0).is_none());

        assert!(store.take_died(1).is_none());
        assert_eq!(store.take_died(3).unwrap().status, 3);
        assert!(store.take_died(3).is_none());
        assert_eq!(store.died().count(), 1);
    }

    #[test]
    fn test_traverse_in_pid_order() {
        let mut store = SpawnStore::new(2);
        spawned(&mut store, "b", 20);
        spawned(&mut store, "a", 10);
        let mut seen = Vec::new();
        store.traverse(|p| seen.push(p.pid));
        assert_eq!(seen, vec![10, 20]);
    }

    #[test]
    fn test_terminate_untracked_pid() {
        let mut store = SpawnStore::new(2);
        let err = store.terminate(12345, Signal::SIGTERM, Duration::from_millis(10));
        assert!(matches!(err, Err(SpawnError::NotFound(_))));
    }

    #[test]
    fn test_terminate_reaps_child() {
        let _guard = serial_guard();
        match unsafe { fork() } {
            Ok(ForkResult::Child) => loop {
                pause();
            },
            Ok(ForkResult::Parent { child }) => {
                let mut store = SpawnStore::new(2);
                spawned(&mut store, "sleeper", child.as_raw());
                let (process, status) = store
                    .terminate(child.as_raw(), Signal::SIGTERM, Duration::from_secs(5))
                    .unwrap();
                assert_eq!(process.name, "sleeper");
                assert_eq!(status, 128 + libc::SIGTERM);
                assert!(store.find_by_pid(child.as_raw()).is_none());
            }
            Err(e) => panic!("fork failed: {}", e),
        }
    }

    #[test]
    fn test_terminate_escalates_to_sigkill() {
        let _guard = serial_guard();
        let (reader, writer) = nix::unistd::pipe().unwrap();
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) }.ok();
                let mut writer = std::fs::File::from(writer);
                let _ = writer.write_all(b"r");
                loop {
                    pause();
                }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(writer);
                let mut ready = [0u8; 1];
                std::fs::File::from(reader).read_exact(&mut ready).unwrap();

                let mut store = SpawnStore::new(2);
                spawned(&mut store, "stubborn", child.as_raw());
                let (_, status) = store
                    .terminate(child.as_raw(), Signal::SIGTERM, Duration::from_millis(200))
                    .unwrap();
                assert_eq!(status, 128 + libc::SIGKILL);
            }
            Err(e) => panic!("fork failed: {}", e),
        }
    }
}
