//! Per-app cgroup placement
//!
//! Each spawned process gets `<root>/<userId>/<name>/app_<pid>`, created on
//! `APP_ADD` and removed on `APP_DIED`. Nothing happens without a configured
//! cgroup root.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use appspawn_core::hook::PRIO_COMMON;
use appspawn_core::{HookStage, Result, SpawnError};
use appspawn_msg::is_safe_name;

use crate::content::AppSpawnContent;
use crate::context::AppSpawnedProcess;
use crate::orchestrator::Hooks;

pub fn register(hooks: &mut Hooks) -> Result<()> {
    hooks
        .process
        .register(HookStage::AppAdd, PRIO_COMMON, "cgroup-place", place)?;
    hooks
        .process
        .register(HookStage::AppDied, PRIO_COMMON, "cgroup-release", release)
}

/// Cgroup directory of one app process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCgroup {
    path: PathBuf,
}

impl AppCgroup {
    /// The process name must be a single path component
    pub fn for_process(root: &Path, process: &AppSpawnedProcess) -> Result<Self> {
        if !is_safe_name(&process.name) {
            return Err(SpawnError::InvalidArgument(format!(
                "process name {:?} cannot name a cgroup",
                process.name
            )));
        }
        Ok(Self {
            path: root
                .join(process.user_id().to_string())
                .join(&process.name)
                .join(format!("app_{}", process.pid)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.path).map_err(|e| {
            SpawnError::Resource(format!(
                "Failed to create cgroup directory {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    pub fn add_process(&self, pid: i32) -> Result<()> {
        let procs_file = self.path.join("cgroup.procs");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&procs_file)
            .map_err(|e| {
                SpawnError::Resource(format!("Failed to open {}: {}", procs_file.display(), e))
            })?;
        write!(file, "{}", pid).map_err(|e| {
            SpawnError::Resource(format!(
                "Failed to write to {}: {}",
                procs_file.display(),
                e
            ))
        })
    }

    pub fn delete(&self) -> Result<()> {
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpawnError::Resource(format!(
                "Failed to delete cgroup {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

fn place(content: &AppSpawnContent, process: &mut AppSpawnedProcess) -> Result<()> {
    let Some(root) = &content.config.cgroup_root else {
        return Ok(());
    };
    let cgroup = AppCgroup::for_process(root, process)?;
    cgroup.create()?;
    cgroup.add_process(process.pid)?;
    log::debug!("pid {} placed in {}", process.pid, cgroup.path().display());
    Ok(())
}

fn release(content: &AppSpawnContent, process: &mut AppSpawnedProcess) -> Result<()> {
    let Some(root) = &content.config.cgroup_root else {
        return Ok(());
    };
    AppCgroup::for_process(root, process)?.delete()
}
