//! What the child runs once setup succeeded

use std::ffi::CString;
use std::path::Path;
use std::sync::{Arc, Mutex};

use appspawn_core::{Result, SpawnError};
use nix::unistd::{AccessFlags, access, execve, pause};

use crate::context::AppSpawningCtx;

/// Search path used when the child environment has no `PATH`
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Exit status of a child whose exec failed
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Final step of the child continuation
pub trait ChildEntry {
    /// Replace the process image or run until killed; returns only on failure
    fn run(&self, ctx: &AppSpawningCtx) -> i32;
}

/// Execs `ctx.work.argv`, or waits for signals when it is empty
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecEntry;

impl ChildEntry for ExecEntry {
    fn run(&self, ctx: &AppSpawningCtx) -> i32 {
        if ctx.work.argv.is_empty() {
            log::debug!("{} has no entry, waiting for signals", ctx.process_name());
            loop {
                pause();
            }
        }
        match exec(&ctx.work.argv, &ctx.work.env) {
            Ok(never) => match never {},
            Err(err) => {
                log::error!("{}: {}", ctx.process_name(), err);
                EXIT_EXEC_FAILED
            }
        }
    }
}

/// Records which processes reached their entry and exits with `status`
#[derive(Debug, Clone, Default)]
pub struct RecordingEntry {
    runs: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    status: i32,
}

impl RecordingEntry {
    pub fn new(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// `(process name, argv)` of every entry reached
    pub fn runs(&self) -> Vec<(String, Vec<String>)> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ChildEntry for RecordingEntry {
    fn run(&self, ctx: &AppSpawningCtx) -> i32 {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push((ctx.process_name().to_string(), ctx.work.argv.clone()));
        }
        self.status
    }
}

/// Replace the calling process with `argv[0]`
pub fn exec(argv: &[String], env: &[(String, String)]) -> Result<std::convert::Infallible> {
    let program = argv
        .first()
        .ok_or_else(|| SpawnError::InvalidArgument("empty argv".into()))?;
    let resolved = resolve_program_path(program, env)?;

    let program = to_cstring(&resolved)?;
    let args = argv
        .iter()
        .map(|a| to_cstring(a))
        .collect::<Result<Vec<_>>>()?;
    let env = env
        .iter()
        .map(|(k, v)| to_cstring(&format!("{}={}", k, v)))
        .collect::<Result<Vec<_>>>()?;

    execve(&program, &args, &env).map_err(|e| SpawnError::syscall(&format!("execve {}", resolved), e))
}

/// Resolve a bare program name through `PATH`
pub fn resolve_program_path(program: &str, env: &[(String, String)]) -> Result<String> {
    if program.contains('/') {
        return Ok(program.to_string());
    }

    let path_value = env
        .iter()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| value.as_str())
        .unwrap_or(DEFAULT_PATH);

    for entry in path_value.split(':') {
        let dir = if entry.is_empty() { "." } else { entry };
        let candidate = Path::new(dir).join(program);
        if access(&candidate, AccessFlags::X_OK).is_ok() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }

    Err(SpawnError::NotFound(format!("command not found: {}", program)))
}

fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| SpawnError::InvalidArgument(format!("nul byte in {:?}", value)))
}
