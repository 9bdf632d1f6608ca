//! Runtime detection of host features the daemon relies on

use std::path::Path;

/// Detected host capabilities
#[derive(Debug, Clone)]
pub struct SystemCapabilities {
    /// Running as root (euid == 0)
    pub has_root: bool,
    /// Unprivileged user namespaces are available
    pub has_user_namespaces: bool,
    /// The kernel exposes mount namespaces
    pub has_mount_namespaces: bool,
    /// SELinux is mounted, so security labels can be applied
    pub has_selinux: bool,
    /// Cgroup v2 unified hierarchy is mounted
    pub has_cgroup_v2: bool,
}

impl SystemCapabilities {
    pub fn detect() -> Self {
        Self {
            has_root: crate::util::is_root(),
            has_user_namespaces: detect_user_namespaces(),
            has_mount_namespaces: Path::new("/proc/self/ns/mnt").exists(),
            has_selinux: Path::new("/sys/fs/selinux/enforce").exists(),
            has_cgroup_v2: Path::new("/sys/fs/cgroup/cgroup.controllers").exists(),
        }
    }

    /// Whether real application sandboxes can be built here
    pub fn can_build_sandbox(&self) -> bool {
        self.has_root && self.has_mount_namespaces
    }

    pub fn summary(&self) -> String {
        let check = |available: bool| if available { "[ok]" } else { "[--]" };
        [
            format!("{} Root privileges", check(self.has_root)),
            format!("{} User namespaces", check(self.has_user_namespaces)),
            format!("{} Mount namespaces", check(self.has_mount_namespaces)),
            format!("{} SELinux", check(self.has_selinux)),
            format!("{} Cgroup v2", check(self.has_cgroup_v2)),
        ]
        .join("\n")
    }
}

fn detect_user_namespaces() -> bool {
    if let Ok(content) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
        && content.trim() == "0"
    {
        return false;
    }

    if let Ok(content) = std::fs::read_to_string("/proc/sys/user/max_user_namespaces")
        && let Ok(max) = content.trim().parse::<u64>()
    {
        return max > 0;
    }

    // unreadable on older kernels; assume present
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_every_probe() {
        let summary = SystemCapabilities::detect().summary();
        assert_eq!(summary.lines().count(), 5);
        assert!(summary.contains("Root privileges"));
        assert!(summary.contains("Mount namespaces"));
    }

    #[test]
    fn root_detection_matches_euid() {
        let caps = SystemCapabilities::detect();
        assert_eq!(caps.has_root, nix::unistd::geteuid().is_root());
    }

    #[test]
    fn sandbox_needs_root() {
        let mut caps = SystemCapabilities::detect();
        caps.has_root = false;
        assert!(!caps.can_build_sandbox());
    }
}
