//! Whether spawned children get a mount-namespace sandbox

use serde::{Deserialize, Serialize};

use crate::capabilities::SystemCapabilities;

/// Configured sandbox policy for the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Always build the sandbox; spawns fail if the host cannot
    Enabled,
    /// Never build the sandbox
    Disabled,
    /// Build the sandbox when running as root with mount namespaces
    #[default]
    Auto,
}

impl SandboxMode {
    /// Resolve Auto against the detected host capabilities
    pub fn resolve(&self, caps: &SystemCapabilities) -> bool {
        match self {
            SandboxMode::Enabled => true,
            SandboxMode::Disabled => false,
            SandboxMode::Auto => caps.has_root && caps.has_mount_namespaces,
        }
    }
}
