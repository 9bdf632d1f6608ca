//! Namespace setup for a spawned child

use std::path::Path;

use appspawn_core::{Result, SpawnError};
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};
use nix::unistd::{chdir, chroot};

/// Namespaces a child detaches into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NamespaceConfig {
    pub mount: bool,
    pub net: bool,
}

impl NamespaceConfig {
    /// Private mount namespace only
    pub fn sandbox() -> Self {
        Self {
            mount: true,
            net: false,
        }
    }

    /// Mount and network namespaces
    pub fn isolated() -> Self {
        Self {
            mount: true,
            net: true,
        }
    }

    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    pub fn is_empty(&self) -> bool {
        !self.mount && !self.net
    }

    /// Unshare the configured namespaces in the calling process
    ///
    /// A new mount namespace is made a slave of the parent's so mounts never
    /// propagate back out.
    pub fn enter(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        unshare(self.to_clone_flags()).map_err(|e| SpawnError::syscall("unshare", e))?;
        if self.mount {
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_SLAVE,
                None::<&str>,
            )
            .map_err(|e| SpawnError::Mount {
                target: "/".to_string(),
                reason: e.to_string(),
            })?;
        }
        log::debug!("entered namespaces {:?}", self.to_clone_flags());
        Ok(())
    }
}

/// Make `root` the calling process's filesystem root
pub fn enter_root(root: &Path) -> Result<()> {
    chdir(root).map_err(|e| SpawnError::syscall(&format!("chdir {}", root.display()), e))?;
    chroot(".").map_err(|e| SpawnError::syscall(&format!("chroot {}", root.display()), e))?;
    chdir("/").map_err(|e| SpawnError::syscall("chdir /", e))?;
    Ok(())
}

/// Inode of one of the calling process's namespaces, e.g. `"mnt"`
pub fn namespace_inode(ns_type: &str) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;
    let path = format!("/proc/self/ns/{}", ns_type);
    let stat = std::fs::metadata(&path).map_err(|e| {
        SpawnError::NotFound(format!("namespace {}: {}", ns_type, e))
    })?;
    Ok(stat.ino())
}
