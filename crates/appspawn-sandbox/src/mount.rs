//! Mount and symlink operations behind a swappable capability

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use appspawn_core::{Result, SpawnError};
use nix::mount::{MsFlags, mount};

/// One fully resolved mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fs_type: Option<String>,
    pub flags: MsFlags,
    pub options: Option<String>,
}

/// Performs the filesystem operations of a sandbox build
pub trait Mounter: Send + Sync {
    fn mount(&self, req: &MountRequest) -> Result<()>;

    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
}

/// Real mounts through mount(2)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, req: &MountRequest) -> Result<()> {
        let fail = |errno: nix::errno::Errno| SpawnError::Mount {
            target: req.target.display().to_string(),
            reason: errno.to_string(),
        };

        // read-only binds need a second remount pass
        let read_only_bind =
            req.flags.contains(MsFlags::MS_BIND) && req.flags.contains(MsFlags::MS_RDONLY);
        let first = if read_only_bind {
            req.flags - MsFlags::MS_RDONLY
        } else {
            req.flags
        };

        mount(
            req.source.as_deref(),
            req.target.as_path(),
            req.fs_type.as_deref(),
            first,
            req.options.as_deref(),
        )
        .map_err(fail)?;

        if read_only_bind {
            mount(
                None::<&Path>,
                req.target.as_path(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(fail)?;
        }
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link).map_err(|e| SpawnError::Mount {
            target: link.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Records requests instead of touching the filesystem
///
/// Targets listed with [`RecordingMounter::fail_on`] report a mount failure.
#[derive(Debug, Default)]
pub struct RecordingMounter {
    mounts: Mutex<Vec<MountRequest>>,
    links: Mutex<Vec<(PathBuf, PathBuf)>>,
    failing: BTreeSet<PathBuf>,
}

impl RecordingMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(mut self, target: impl Into<PathBuf>) -> Self {
        self.failing.insert(target.into());
        self
    }

    pub fn mounts(&self) -> Vec<MountRequest> {
        self.mounts.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn links(&self) -> Vec<(PathBuf, PathBuf)> {
        self.links.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// How many mounts were attempted onto `target`
    pub fn mount_count(&self, target: &Path) -> usize {
        self.mounts().iter().filter(|m| m.target == target).count()
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, req: &MountRequest) -> Result<()> {
        if let Ok(mut mounts) = self.mounts.lock() {
            mounts.push(req.clone());
        }
        if self.failing.contains(&req.target) {
            return Err(SpawnError::Mount {
                target: req.target.display().to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        if let Ok(mut links) = self.links.lock() {
            links.push((target.to_path_buf(), link.to_path_buf()));
        }
        Ok(())
    }
}

/// Shared handles can be injected too
impl<M: Mounter + ?Sized> Mounter for std::sync::Arc<M> {
    fn mount(&self, req: &MountRequest) -> Result<()> {
        (**self).mount(req)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        (**self).symlink(target, link)
    }
}
