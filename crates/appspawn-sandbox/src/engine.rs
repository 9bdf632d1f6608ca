//! Builds an app's filesystem view from the sandbox configuration

use std::path::{Component, Path, PathBuf};

use appspawn_core::{Result, SpawnError};
use appspawn_permission::PermissionRegistry;

use crate::config::{SandboxConfig, SandboxMountConfig, SymbolLinkConfig};
use crate::dirs::{self, ClassGroups, DirClass, DirSpec};
use crate::label::{LabelApplier, NoopLabeler};
use crate::mount::{MountRequest, Mounter};
use crate::request::SandboxRequest;
use crate::variables::VariableTable;

/// The root stays owned by the daemon and traversable after the app drops
/// privileges
const ROOT_MODE: u32 = 0o755;

/// A mount point or link that could not be set up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountFailure {
    pub target: String,
    pub reason: String,
    pub critical: bool,
}

/// Outcome of one sandbox build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxReport {
    pub root: PathBuf,
    pub mounted: Vec<PathBuf>,
    pub linked: Vec<PathBuf>,
    /// Entries whose permission was not granted
    pub gated: usize,
    pub created_dirs: usize,
    pub failures: Vec<MountFailure>,
}

impl SandboxReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Step {
    Done,
    Gated,
}

pub struct SandboxEngine {
    config: SandboxConfig,
    variables: VariableTable,
    mounter: Box<dyn Mounter>,
    labeler: Box<dyn LabelApplier>,
    groups: ClassGroups,
    apply_ownership: bool,
}

impl SandboxEngine {
    pub fn new(config: SandboxConfig, mounter: Box<dyn Mounter>) -> Self {
        let variables = VariableTable::with_aliases(&config.path_aliases);
        Self {
            config,
            variables,
            mounter,
            labeler: Box::new(NoopLabeler),
            groups: ClassGroups::default(),
            apply_ownership: appspawn_core::util::is_root(),
        }
    }

    pub fn with_labeler(mut self, labeler: Box<dyn LabelApplier>) -> Self {
        self.labeler = labeler;
        self
    }

    pub fn with_groups(mut self, groups: ClassGroups) -> Self {
        self.groups = groups;
        self
    }

    /// Whether created directories are chowned to the app
    pub fn with_ownership(mut self, apply: bool) -> Self {
        self.apply_ownership = apply;
        self
    }

    pub fn variables_mut(&mut self) -> &mut VariableTable {
        &mut self.variables
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Resolved sandbox root; `/` when none is configured
    ///
    /// A root that would climb out of its template with `..` is an error.
    pub fn root_for(&self, req: &SandboxRequest) -> Result<PathBuf> {
        let Some(template) = &self.config.sandbox_root else {
            return Ok(PathBuf::from("/"));
        };
        let root = PathBuf::from(self.variables.resolve(template, req)?);
        if root.components().any(|c| c == Component::ParentDir) {
            return Err(SpawnError::InvalidArgument(format!(
                "sandbox root {} leaves its parent",
                root.display()
            )));
        }
        Ok(root)
    }

    /// Mount every granted entry, in configuration order
    ///
    /// Failures are collected in the report. A failure of an entry marked
    /// critical aborts the build unless the request ignores sandbox errors.
    pub fn build(
        &self,
        req: &SandboxRequest,
        permissions: &PermissionRegistry,
    ) -> Result<SandboxReport> {
        let root = self.root_for(req)?;
        let mut report = SandboxReport {
            root: root.clone(),
            ..Default::default()
        };
        let root_spec = DirSpec {
            mode: ROOT_MODE,
            owner: None,
        };
        if dirs::create_if_absent(&root, root_spec)? {
            report.created_dirs += 1;
        }

        for mount in &self.config.mounts {
            match self.mount_one(mount, &root, req, permissions, &mut report) {
                Ok(Step::Done) => {}
                Ok(Step::Gated) => report.gated += 1,
                Err(err) => self.record_failure(
                    &mut report,
                    &mount.sandbox_path,
                    err,
                    mount.check_action_status,
                    req,
                )?,
            }
        }

        for link in &self.config.links {
            match self.link_one(link, &root, req, permissions, &mut report) {
                Ok(Step::Done) => {}
                Ok(Step::Gated) => report.gated += 1,
                Err(err) => self.record_failure(
                    &mut report,
                    &link.link_name,
                    err,
                    link.check_action_status,
                    req,
                )?,
            }
        }

        log::info!(
            "sandbox for {}: {} mounts, {} links, {} gated, {} failures",
            req.bundle_name,
            report.mounted.len(),
            report.linked.len(),
            report.gated,
            report.failures.len()
        );
        Ok(report)
    }

    fn record_failure(
        &self,
        report: &mut SandboxReport,
        target: &str,
        err: SpawnError,
        critical: bool,
        req: &SandboxRequest,
    ) -> Result<()> {
        // unresolved variables only ever cost the one entry
        let critical = critical && !matches!(err, SpawnError::Config(_));
        log::warn!("sandbox entry {} for {} failed: {}", target, req.bundle_name, err);
        report.failures.push(MountFailure {
            target: target.to_string(),
            reason: err.to_string(),
            critical,
        });
        if critical && !req.ignore_errors {
            return Err(SpawnError::Mount {
                target: target.to_string(),
                reason: err.to_string(),
            });
        }
        Ok(())
    }

    fn granted(
        &self,
        gate: Option<&str>,
        req: &SandboxRequest,
        permissions: &PermissionRegistry,
    ) -> bool {
        gate.is_none_or(|name| permissions.is_set(&req.permission_code, name))
    }

    fn dir_spec(&self, class: DirClass, req: &SandboxRequest, mode: Option<u32>) -> DirSpec {
        DirSpec {
            mode: mode.unwrap_or_else(|| class.mode()),
            owner: self
                .apply_ownership
                .then(|| (req.uid, self.groups.gid_for(class, req.gid))),
        }
    }

    fn mount_one(
        &self,
        mount: &SandboxMountConfig,
        root: &Path,
        req: &SandboxRequest,
        permissions: &PermissionRegistry,
        report: &mut SandboxReport,
    ) -> Result<Step> {
        if !self.granted(mount.permission.as_deref(), req, permissions) {
            log::debug!("{} not granted, skipping {}", req.bundle_name, mount.sandbox_path);
            return Ok(Step::Gated);
        }

        let source = if mount.src_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(self.variables.resolve(&mount.src_path, req)?))
        };
        let dest = self.variables.resolve(&mount.sandbox_path, req)?;
        let target = root.join(dest.trim_start_matches('/'));
        let class = mount.category.unwrap_or_else(|| DirClass::infer(&target));
        let flags = mount.flags()?;

        if let (Some(source), Some(demand)) = (&source, &mount.create_on_demand) {
            let spec = DirSpec {
                mode: demand.ugo.unwrap_or_else(|| class.mode()),
                owner: self.apply_ownership.then(|| {
                    (
                        demand.uid.unwrap_or(req.uid),
                        demand.gid.unwrap_or_else(|| self.groups.gid_for(class, req.gid)),
                    )
                }),
            };
            if dirs::create_if_absent(source, spec)? {
                report.created_dirs += 1;
            }
        }

        let created = match &source {
            Some(source) if source.is_file() => dirs::touch_if_absent(&target)?,
            _ => dirs::create_if_absent(&target, self.dir_spec(class, req, mount.mode()?))?,
        };
        if created {
            report.created_dirs += 1;
            self.labeler.apply(&target, req)?;
        }

        self.mounter.mount(&MountRequest {
            source,
            target: target.clone(),
            fs_type: mount.fs_type.clone(),
            flags,
            options: mount.options.clone(),
        })?;
        report.mounted.push(target);
        Ok(Step::Done)
    }

    fn link_one(
        &self,
        link: &SymbolLinkConfig,
        root: &Path,
        req: &SandboxRequest,
        permissions: &PermissionRegistry,
        report: &mut SandboxReport,
    ) -> Result<Step> {
        if !self.granted(link.permission.as_deref(), req, permissions) {
            return Ok(Step::Gated);
        }
        let target = PathBuf::from(self.variables.resolve(&link.target_name, req)?);
        let name = self.variables.resolve(&link.link_name, req)?;
        let path = root.join(name.trim_start_matches('/'));

        if path.symlink_metadata().is_ok() {
            log::debug!("{} already exists", path.display());
            return Ok(Step::Done);
        }
        let parent_spec = DirSpec {
            mode: ROOT_MODE,
            owner: None,
        };
        if let Some(parent) = path.parent()
            && dirs::create_if_absent(parent, parent_spec)?
        {
            report.created_dirs += 1;
        }
        self.mounter.symlink(&target, &path)?;
        report.linked.push(path);
        Ok(Step::Done)
    }
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("config", &self.config)
            .field("variables", &self.variables)
            .field("groups", &self.groups)
            .field("apply_ownership", &self.apply_ownership)
            .finish()
    }
}
