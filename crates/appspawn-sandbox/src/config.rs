//! Sandbox fragment model
//!
//! A fragment looks like:
//!
//! ```json
//! {
//!   "sandbox-root": "/mnt/sandbox/<currentUserId>/<PackageName>",
//!   "path-aliases": { "appdata": "/data/app/el2/<currentUserId>" },
//!   "permission": [
//!     "ohos.permission.internet",
//!     { "ohos.permission.camera": { "mount-paths": [ ... ] } }
//!   ],
//!   "mount-paths": [
//!     { "src-path": "<appdata>/base/<PackageName>", "sandbox-path": "/data/storage/el2/base",
//!       "sandbox-flags": ["bind", "rec"], "check-action-status": true }
//!   ],
//!   "symbol-links": [ { "target-name": "/system/bin", "link-name": "/bin" } ]
//! }
//! ```
//!
//! `permission` may also be a single object keyed by permission name, the
//! same shapes the permission registry reads.

use std::collections::BTreeMap;
use std::path::PathBuf;

use appspawn_core::{Result, SpawnError};
use nix::mount::MsFlags;
use serde::Deserialize;
use serde_json::Value;

use crate::dirs::DirClass;

/// Ownership and mode for a source directory created on demand
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DemandInfo {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Permission bits, e.g. `0o750`
    pub ugo: Option<u32>,
}

/// One mount point
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SandboxMountConfig {
    /// Source template; empty for filesystems without a backing path
    #[serde(default)]
    pub src_path: String,
    /// Destination template, relative to the sandbox root
    pub sandbox_path: String,
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub sandbox_flags: Vec<String>,
    #[serde(default)]
    pub options: Option<String>,
    /// Permission that must be granted for this mount to be attempted
    #[serde(default)]
    pub permission: Option<String>,
    /// A failure aborts the sandbox build
    #[serde(default)]
    pub check_action_status: bool,
    #[serde(default)]
    pub category: Option<DirClass>,
    #[serde(default)]
    pub create_on_demand: Option<DemandInfo>,
    #[serde(default)]
    pub dest_mode: Option<String>,
}

impl SandboxMountConfig {
    pub fn bind(src: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            src_path: src.into(),
            sandbox_path: dest.into(),
            fs_type: None,
            sandbox_flags: Vec::new(),
            options: None,
            permission: None,
            check_action_status: false,
            category: None,
            create_on_demand: None,
            dest_mode: None,
        }
    }

    pub fn gated(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn critical(mut self) -> Self {
        self.check_action_status = true;
        self
    }

    /// Mount flags; a plain bind mount when none are configured
    pub fn flags(&self) -> Result<MsFlags> {
        if self.sandbox_flags.is_empty() {
            return Ok(if self.fs_type.is_some() {
                MsFlags::empty()
            } else {
                MsFlags::MS_BIND | MsFlags::MS_REC
            });
        }
        self.sandbox_flags
            .iter()
            .try_fold(MsFlags::empty(), |acc, name| -> Result<MsFlags> {
                Ok(acc | parse_mount_flag(name)?)
            })
    }

    pub fn mode(&self) -> Result<Option<u32>> {
        self.dest_mode.as_deref().map(parse_mode).transpose()
    }
}

/// One symbolic link inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SymbolLinkConfig {
    pub target_name: String,
    pub link_name: String,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub check_action_status: bool,
}

/// Mounts and links that belong to one permission
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PermissionSection {
    pub mount_paths: Vec<SandboxMountConfig>,
    pub symbol_links: Vec<SymbolLinkConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct Fragment {
    sandbox_root: Option<String>,
    path_aliases: BTreeMap<String, String>,
    permission: Value,
    mount_paths: Vec<SandboxMountConfig>,
    symbol_links: Vec<SymbolLinkConfig>,
}

/// Sandbox layout merged from every fragment, in configuration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxConfig {
    pub sandbox_root: Option<String>,
    pub path_aliases: BTreeMap<String, String>,
    pub mounts: Vec<SandboxMountConfig>,
    pub links: Vec<SymbolLinkConfig>,
}

impl SandboxConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let mut config = Self::default();
        config.merge(&value)?;
        Ok(config)
    }

    /// Merge fragments in order; a fragment that does not parse is skipped
    pub fn from_fragments<'a>(fragments: impl IntoIterator<Item = (&'a PathBuf, &'a Value)>) -> Self {
        let mut config = Self::default();
        for (path, value) in fragments {
            if let Err(err) = config.merge(value) {
                log::warn!("skipping sandbox fragment {}: {}", path.display(), err);
            }
        }
        config
    }

    /// Add one fragment; later roots win, aliases are overlaid, mounts appended
    ///
    /// Within a fragment the top-level `mount-paths` and `symbol-links` come
    /// first, followed by each permission section in listing order. JSON
    /// keeps no order between sibling keys, so that is the only order there is.
    pub fn merge(&mut self, value: &Value) -> Result<()> {
        let fragment: Fragment = serde_json::from_value(value.clone())
            .map_err(|e| SpawnError::Config(format!("invalid sandbox fragment: {}", e)))?;

        if fragment.sandbox_root.is_some() {
            self.sandbox_root = fragment.sandbox_root;
        }
        self.path_aliases.extend(fragment.path_aliases);
        self.mounts.extend(fragment.mount_paths);
        self.links.extend(fragment.symbol_links);

        let mut sections = Vec::new();
        collect_sections(&fragment.permission, &mut sections)?;
        for (name, section) in sections {
            self.mounts.extend(section.mount_paths.into_iter().map(|mut m| {
                m.permission = Some(name.clone());
                m
            }));
            self.links.extend(section.symbol_links.into_iter().map(|mut l| {
                l.permission = Some(name.clone());
                l
            }));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.links.is_empty()
    }
}

/// Sections of a `permission` value: a name, an object keyed by name, or an
/// array of either
///
/// Bare names and non-object values carry no sandbox entries.
fn collect_sections(value: &Value, out: &mut Vec<(String, PermissionSection)>) -> Result<()> {
    match value {
        Value::Null => {}
        Value::String(name) => log::trace!("permission {} has no sandbox section", name),
        Value::Array(items) => {
            for item in items {
                collect_sections(item, out)?;
            }
        }
        Value::Object(map) => {
            for (name, section) in map {
                if !section.is_object() {
                    log::trace!("permission {} has no sandbox section", name);
                    continue;
                }
                let section: PermissionSection = serde_json::from_value(section.clone())
                    .map_err(|e| {
                        SpawnError::Config(format!("invalid section for {}: {}", name, e))
                    })?;
                out.push((name.clone(), section));
            }
        }
        other => log::warn!("ignoring permission entry {}", other),
    }
    Ok(())
}

/// Parse `bind`, `MS_BIND` and friends
pub fn parse_mount_flag(name: &str) -> Result<MsFlags> {
    let key = name.trim();
    let key = key.strip_prefix("MS_").unwrap_or(key).to_ascii_lowercase();
    let flag = match key.as_str() {
        "rec" => MsFlags::MS_REC,
        "bind" => MsFlags::MS_BIND,
        "move" => MsFlags::MS_MOVE,
        "slave" => MsFlags::MS_SLAVE,
        "rdonly" => MsFlags::MS_RDONLY,
        "shared" => MsFlags::MS_SHARED,
        "private" => MsFlags::MS_PRIVATE,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        "remount" => MsFlags::MS_REMOUNT,
        "nosuid" => MsFlags::MS_NOSUID,
        "nodev" => MsFlags::MS_NODEV,
        "noexec" => MsFlags::MS_NOEXEC,
        "noatime" => MsFlags::MS_NOATIME,
        "lazytime" => MsFlags::MS_LAZYTIME,
        _ => {
            return Err(SpawnError::Config(format!("unknown mount flag {}", name)));
        }
    };
    Ok(flag)
}

/// Parse `S_IRWXU|S_IRGRP` or an octal string such as `0750`
pub fn parse_mode(text: &str) -> Result<u32> {
    let text = text.trim();
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return u32::from_str_radix(text, 8)
            .map_err(|_| SpawnError::Config(format!("invalid mode {}", text)));
    }
    text.split('|').try_fold(0u32, |mode, part| -> Result<u32> {
        let bits = match part.trim() {
            "S_IRUSR" => 0o400,
            "S_IWUSR" => 0o200,
            "S_IXUSR" => 0o100,
            "S_IRWXU" => 0o700,
            "S_IRGRP" => 0o040,
            "S_IWGRP" => 0o020,
            "S_IXGRP" => 0o010,
            "S_IRWXG" => 0o070,
            "S_IROTH" => 0o004,
            "S_IWOTH" => 0o002,
            "S_IXOTH" => 0o001,
            "S_IRWXO" => 0o007,
            "S_ISGID" => 0o2000,
            other => {
                return Err(SpawnError::Config(format!("unknown mode bit {}", other)));
            }
        };
        Ok(mode | bits)
    })
}
