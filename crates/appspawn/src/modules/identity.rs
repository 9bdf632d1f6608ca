//! Switches the child to the app identity and names the process

use std::ffi::CString;

use appspawn_core::hook::{PRIO_COMMON, PRIO_PROPERTY};
use appspawn_core::{HookStage, Result, SpawnError, util};
use nix::unistd::{Gid, Uid, setgroups, setresgid, setresuid};

use crate::content::AppSpawnContent;
use crate::context::AppSpawningCtx;
use crate::orchestrator::Hooks;

/// Kernel limit on a thread name, without the terminating nul
const TASK_COMM_LEN: usize = 15;

pub fn register(hooks: &mut Hooks) -> Result<()> {
    hooks.spawn.register(
        HookStage::SpawnSetChildProperty,
        PRIO_PROPERTY,
        "identity",
        set_identity,
    )?;
    hooks.spawn.register(
        HookStage::SpawnCompleted,
        PRIO_COMMON,
        "process-name",
        set_process_properties,
    )
}

fn set_identity(_: &AppSpawnContent, ctx: &mut AppSpawningCtx) -> Result<()> {
    let work = &ctx.work;
    if !util::is_root() {
        if work.uid == util::get_uid() && work.gid == util::get_gid() {
            return Ok(());
        }
        return Err(SpawnError::PermissionDenied(format!(
            "cannot switch to {}:{} without root",
            work.uid, work.gid
        )));
    }

    let gids: Vec<Gid> = work.gids.iter().copied().map(Gid::from_raw).collect();
    setgroups(&gids).map_err(|e| SpawnError::syscall("setgroups", e))?;
    let gid = Gid::from_raw(work.gid);
    setresgid(gid, gid, gid).map_err(|e| SpawnError::syscall("setresgid", e))?;
    let uid = Uid::from_raw(work.uid);
    setresuid(uid, uid, uid).map_err(|e| SpawnError::syscall("setresuid", e))?;
    log::debug!("{} now runs as {}:{}", ctx.process_name(), work.uid, work.gid);
    Ok(())
}

fn set_process_properties(_: &AppSpawnContent, ctx: &mut AppSpawningCtx) -> Result<()> {
    let name = comm_name(ctx.process_name());
    let name = CString::new(name)
        .map_err(|_| SpawnError::InvalidArgument("nul byte in process name".into()))?;
    if unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr()) } != 0 {
        log::warn!("PR_SET_NAME: {}", std::io::Error::last_os_error());
    }

    // setuid clears the dumpable bit; debuggable apps need it back for tracing
    if ctx.debuggable() && unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1) } != 0 {
        return Err(SpawnError::syscall(
            "PR_SET_DUMPABLE",
            nix::errno::Errno::last(),
        ));
    }
    Ok(())
}

/// Tail of `name` that fits the kernel's thread name
fn comm_name(name: &str) -> &str {
    if name.len() <= TASK_COMM_LEN {
        return name;
    }
    let mut start = name.len() - TASK_COMM_LEN;
    while !name.is_char_boundary(start) {
        start += 1;
    }
    &name[start..]
}
