//! Daemon-wide state shared by every hook

use appspawn_core::DaemonConfig;
use appspawn_core::capabilities::SystemCapabilities;
use appspawn_permission::PermissionRegistry;
use appspawn_sandbox::SandboxEngine;

/// Sandbox engine plus how much of it touches the calling process
#[derive(Debug)]
pub struct SandboxSetup {
    pub engine: SandboxEngine,
    /// Unshare namespaces and chroot into the built root. Off only when the
    /// engine is driven against scratch directories.
    pub enter_namespaces: bool,
}

/// State constructed once at startup and passed to every hook
#[derive(Debug)]
pub struct AppSpawnContent {
    pub config: DaemonConfig,
    pub caps: SystemCapabilities,
    pub permissions: PermissionRegistry,
    pub sandbox: Option<SandboxSetup>,
}

impl AppSpawnContent {
    pub fn new(config: DaemonConfig) -> Self {
        Self::with_caps(config, SystemCapabilities::detect())
    }

    pub fn with_caps(config: DaemonConfig, caps: SystemCapabilities) -> Self {
        Self {
            config,
            caps,
            permissions: PermissionRegistry::new(),
            sandbox: None,
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionRegistry) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_sandbox(mut self, setup: SandboxSetup) -> Self {
        self.sandbox = Some(setup);
        self
    }

    /// Whether the configured sandbox mode is on for this host
    pub fn sandbox_enabled(&self) -> bool {
        self.config.sandbox.resolve(&self.caps)
    }
}
