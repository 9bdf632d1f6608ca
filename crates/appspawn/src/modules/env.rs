//! Child argv/env resolution and the clear-env stage

use std::collections::BTreeMap;
use std::os::fd::RawFd;

use appspawn_core::hook::{PRIO_COMMON, PRIO_HIGHEST};
use appspawn_core::{HookStage, Result, SpawnError};
use appspawn_msg::tlv::ext;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, Signal, signal, sigprocmask};

use crate::child::DEFAULT_PATH;
use crate::content::AppSpawnContent;
use crate::context::AppSpawningCtx;
use crate::orchestrator::Hooks;

/// Signals the daemon handles that a child must not inherit handlers for
const RESET_SIGNALS: [Signal; 5] = [
    Signal::SIGCHLD,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGPIPE,
];

/// Comma-separated numbers of the descriptors passed with the request
pub const FDS_ENV: &str = "APPSPAWN_FDS";

pub fn register(hooks: &mut Hooks) -> Result<()> {
    hooks
        .spawn
        .register(HookStage::SpawnPrepare, PRIO_COMMON, "resolve-env", prepare)?;
    hooks
        .spawn
        .register(HookStage::SpawnClearEnv, PRIO_HIGHEST, "clear-env", clear_env)
}

/// Fill the child's working state from the message
fn prepare(content: &AppSpawnContent, ctx: &mut AppSpawningCtx) -> Result<()> {
    let work = &mut ctx.work;
    work.argv = ctx
        .message
        .exec_args()
        .unwrap_or_else(|| content.config.default_entry.clone());
    work.env = child_env(ctx.message.extension(ext::APP_ENV), &work.keep_fds)?;
    if let Some(dac) = ctx.message.dac_info() {
        work.gids = dac.gids.clone();
    }
    log::debug!(
        "{}: argv {:?}, {} env vars, keeps fds {:?}",
        ctx.message.process_name,
        work.argv,
        work.env.len(),
        work.keep_fds
    );
    Ok(())
}

/// `PATH` plus the `AppEnv` extension, a JSON object of strings
///
/// Passed descriptors are announced in [`FDS_ENV`].
fn child_env(app_env: Option<&[u8]>, fds: &[RawFd]) -> Result<Vec<(String, String)>> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
    if let Some(raw) = app_env {
        let extra: BTreeMap<String, String> = serde_json::from_slice(raw)
            .map_err(|e| SpawnError::InvalidArgument(format!("{}: {}", ext::APP_ENV, e)))?;
        env.extend(extra);
    }
    if !fds.is_empty() {
        let list: Vec<String> = fds.iter().map(|fd| fd.to_string()).collect();
        env.insert(FDS_ENV.to_string(), list.join(","));
    }
    Ok(env.into_iter().collect())
}

/// Drop everything the child inherited from the daemon
fn clear_env(_: &AppSpawnContent, ctx: &mut AppSpawningCtx) -> Result<()> {
    let keep: Vec<RawFd> = ctx.work.keep_fds.iter().copied().chain(ctx.work.ready_fd).collect();
    let closed = close_inherited_fds(&keep)?;
    log::debug!("{}: closed {} inherited fds", ctx.process_name(), closed);
    // passed descriptors arrive close-on-exec
    for fd in &ctx.work.keep_fds {
        fcntl(*fd, FcntlArg::F_SETFD(FdFlag::empty()))
            .map_err(|e| SpawnError::syscall(&format!("keep fd {}", fd), e))?;
    }

    for sig in RESET_SIGNALS {
        unsafe { signal(sig, SigHandler::SigDfl) }
            .map_err(|e| SpawnError::syscall(&format!("reset {}", sig), e))?;
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| SpawnError::syscall("sigprocmask", e))?;
    Ok(())
}

/// Close every descriptor above stderr that is not in `keep`
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<usize> {
    let open: Vec<RawFd> = std::fs::read_dir("/proc/self/fd")?
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    let mut closed = 0;
    for fd in open {
        if fd <= 2 || keep.contains(&fd) {
            continue;
        }
        // the directory handle used above is already gone: EBADF
        if nix::unistd::close(fd).is_ok() {
            closed += 1;
        }
    }
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::{Forker, SystemForker};
    use crate::test_support::serial_guard;
    use appspawn_core::DaemonConfig;
    use appspawn_core::capabilities::SystemCapabilities;
    use appspawn_msg::{DacInfo, MsgType, SpawnMessage, TlvRecord};
    use std::os::fd::AsRawFd;

    fn content(default_entry: Vec<String>) -> AppSpawnContent {
        let config = DaemonConfig {
            default_entry,
            ..Default::default()
        };
        AppSpawnContent::with_caps(config, SystemCapabilities::detect())
    }

    fn extension(name: &str, value: &[u8]) -> TlvRecord {
        TlvRecord::Extension {
            name: name.to_string(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_prepare_uses_exec_args_and_env() {
        let mut msg = SpawnMessage::new(MsgType::Spawn, "app");
        msg.push(extension(ext::EXEC_ARGS, b"/bin/app\0--flag\0"));
        msg.push(extension(ext::APP_ENV, br#"{"LANG":"C","PATH":"/bin"}"#));
        msg.push(TlvRecord::DacInfo(DacInfo {
            gids: vec![1000, 3003],
            user_name: "app".into(),
        }));
        let mut ctx = AppSpawningCtx::new(1, msg);
        // received descriptors are attached before prepare runs
        ctx.work.keep_fds = vec![7, 9];

        prepare(&content(vec!["/bin/default".into()]), &mut ctx).unwrap();
        assert_eq!(ctx.work.argv, vec!["/bin/app", "--flag"]);
        assert_eq!(
            ctx.work.env,
            vec![
                (FDS_ENV.to_string(), "7,9".to_string()),
                ("LANG".to_string(), "C".to_string()),
                ("PATH".to_string(), "/bin".to_string())
            ]
        );
        assert_eq!(ctx.work.keep_fds, vec![7, 9]);
        assert_eq!(ctx.work.gids, vec![1000, 3003]);
    }

    #[test]
    fn test_fd_numbers_alone_keep_nothing() {
        let mut msg = SpawnMessage::new(MsgType::Spawn, "app");
        msg.push(TlvRecord::FdList(vec![7, 9]));
        let mut ctx = AppSpawningCtx::new(1, msg);
        prepare(&content(Vec::new()), &mut ctx).unwrap();
        assert!(ctx.work.keep_fds.is_empty());
        assert!(ctx.work.env.iter().all(|(k, _)| k != FDS_ENV));
    }

    #[test]
    fn test_prepare_falls_back_to_default_entry() {
        let mut ctx = AppSpawningCtx::new(1, SpawnMessage::new(MsgType::Spawn, "app"));
        prepare(&content(vec!["/bin/default".into()]), &mut ctx).unwrap();
        assert_eq!(ctx.work.argv, vec!["/bin/default"]);
        assert_eq!(ctx.work.env, vec![("PATH".to_string(), DEFAULT_PATH.to_string())]);
    }

    #[test]
    fn test_bad_app_env_rejected() {
        let mut msg = SpawnMessage::new(MsgType::Spawn, "app");
        msg.push(extension(ext::APP_ENV, b"[1,2]"));
        let mut ctx = AppSpawningCtx::new(1, msg);
        assert!(matches!(
            prepare(&content(Vec::new()), &mut ctx),
            Err(SpawnError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_close_inherited_fds_in_child() {
        let _guard = serial_guard();
        let kept = tempfile::tempfile().unwrap();
        let dropped = tempfile::tempfile().unwrap();
        let (kept_fd, dropped_fd) = (kept.as_raw_fd(), dropped.as_raw_fd());

        let child = SystemForker
            .fork(&mut || {
                if close_inherited_fds(&[kept_fd]).is_err() {
                    return 1;
                }
                let alive = |fd| nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok();
                match (alive(kept_fd), alive(dropped_fd)) {
                    (true, false) => 0,
                    _ => 2,
                }
            })
            .unwrap();
        let status = nix::sys::wait::waitpid(child, None).unwrap();
        assert_eq!(crate::store::exit_status(status), Some(0));
    }
}
