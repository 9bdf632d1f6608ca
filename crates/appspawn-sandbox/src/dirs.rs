//! Directory classes and create-if-absent semantics

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use appspawn_core::{Result, SpawnError};
use nix::unistd::{Gid, Group, Uid, chown};
use serde::Deserialize;

/// Kind of directory being created, deciding its mode and group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirClass {
    Data,
    Database,
    Log,
    #[default]
    Default,
}

impl DirClass {
    /// Infer the class from the destination path's components
    ///
    /// The innermost `base`, `database` or `log` component decides.
    pub fn infer(path: &Path) -> Self {
        for component in path.components().rev() {
            match component.as_os_str().to_str() {
                Some("base") => return DirClass::Data,
                Some("database") => return DirClass::Database,
                Some("log") => return DirClass::Log,
                _ => {}
            }
        }
        DirClass::Default
    }

    pub fn mode(self) -> u32 {
        match self {
            DirClass::Data | DirClass::Database => 0o2770,
            DirClass::Log => 0o770,
            DirClass::Default => 0o700,
        }
    }
}

/// Gids of the dedicated groups, when the host defines them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassGroups {
    pub ddms: Option<u32>,
    pub log: Option<u32>,
}

impl ClassGroups {
    pub fn lookup() -> Self {
        let gid_of = |name: &str| match Group::from_name(name) {
            Ok(Some(group)) => Some(group.gid.as_raw()),
            Ok(None) => None,
            Err(err) => {
                log::debug!("group lookup {} failed: {}", name, err);
                None
            }
        };
        Self {
            ddms: gid_of("ddms"),
            log: gid_of("log"),
        }
    }

    /// Group owning a directory of `class` for an app whose own gid is `app_gid`
    pub fn gid_for(&self, class: DirClass, app_gid: u32) -> u32 {
        match class {
            DirClass::Database => self.ddms.unwrap_or(app_gid),
            DirClass::Log => self.log.unwrap_or(app_gid),
            DirClass::Data | DirClass::Default => app_gid,
        }
    }
}

/// How a newly created directory is finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSpec {
    pub mode: u32,
    /// `(uid, gid)` to chown to, if any
    pub owner: Option<(u32, u32)>,
}

/// Create `path` (and missing parents) unless it already exists
///
/// Only a directory created here gets `spec` applied; an existing one is left
/// exactly as it is. Returns whether the directory was created.
pub fn create_if_absent(path: &Path, spec: DirSpec) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(path).map_err(|e| {
        SpawnError::Setup(format!("failed to create {}: {}", path.display(), e))
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(spec.mode)).map_err(|e| {
        SpawnError::Setup(format!("failed to chmod {}: {}", path.display(), e))
    })?;
    if let Some((uid, gid)) = spec.owner {
        chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| SpawnError::syscall(&format!("chown {}", path.display()), e))?;
    }
    log::debug!("created {} mode {:o}", path.display(), spec.mode);
    Ok(true)
}

/// Create an empty file at `path` unless something already exists there
pub fn touch_if_absent(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::File::create(path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn current_owner() -> Option<(u32, u32)> {
        Some((
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        ))
    }

    #[test]
    fn class_modes() {
        assert_eq!(DirClass::Database.mode(), 0o2770);
        assert_eq!(DirClass::Log.mode(), 0o770);
        assert_eq!(DirClass::Default.mode(), 0o700);
    }

    #[test]
    fn infer_from_path() {
        assert_eq!(DirClass::infer(Path::new("/data/storage/database")), DirClass::Database);
        assert_eq!(DirClass::infer(Path::new("/data/log/app")), DirClass::Log);
        assert_eq!(DirClass::infer(Path::new("/data/storage")), DirClass::Default);
        assert_eq!(DirClass::infer(Path::new("/data/storage/el2/base")), DirClass::Data);
        assert_eq!(DirClass::infer(Path::new("/data/storage/base/cache")), DirClass::Data);
        assert_eq!(DirClass::infer(Path::new("/data/base/database")), DirClass::Database);
    }

    #[test]
    fn groups_fall_back_to_app_gid() {
        let groups = ClassGroups {
            ddms: Some(1090),
            log: None,
        };
        assert_eq!(groups.gid_for(DirClass::Database, 20010001), 1090);
        assert_eq!(groups.gid_for(DirClass::Log, 20010001), 20010001);
        assert_eq!(groups.gid_for(DirClass::Data, 20010001), 20010001);
    }

    #[test]
    fn creates_with_class_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/database");
        let spec = DirSpec {
            mode: DirClass::Database.mode(),
            owner: current_owner(),
        };
        assert!(create_if_absent(&path, spec).unwrap());
        let mode = fs::metadata(&path).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o2770);
    }

    #[test]
    fn second_call_leaves_existing_directory_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data");
        let spec = DirSpec {
            mode: 0o700,
            owner: current_owner(),
        };
        assert!(create_if_absent(&path, spec).unwrap());

        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(path.join("user-file"), b"keep").unwrap();

        assert!(!create_if_absent(&path, spec).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o7777, 0o755);
        assert_eq!(fs::read(path.join("user-file")).unwrap(), b"keep");
    }

    #[test]
    fn touch_creates_file_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dev/binder");
        assert!(touch_if_absent(&path).unwrap());
        assert!(path.is_file());
        assert!(!touch_if_absent(&path).unwrap());
    }
}
