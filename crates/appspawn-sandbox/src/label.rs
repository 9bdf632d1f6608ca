//! Security labels for sandbox directories

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use appspawn_core::{Result, SpawnError};

use crate::request::SandboxRequest;

/// Applies a security label to a path created for an app
pub trait LabelApplier: Send + Sync {
    fn apply(&self, path: &Path, req: &SandboxRequest) -> Result<()>;
}

/// Used when no security module is present
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLabeler;

impl LabelApplier for NoopLabeler {
    fn apply(&self, _path: &Path, _req: &SandboxRequest) -> Result<()> {
        Ok(())
    }
}

/// Writes an SELinux file context into the `security.selinux` xattr
#[derive(Debug, Clone, Copy, Default)]
pub struct SelinuxLabeler;

impl SelinuxLabeler {
    /// File context for a directory of `req`
    pub fn context_for(req: &SandboxRequest) -> String {
        let domain = if req.debuggable {
            format!("debug_{}_data_file", req.apl)
        } else {
            format!("{}_data_file", req.apl)
        };
        format!("u:object_r:{}:s0", domain)
    }
}

impl LabelApplier for SelinuxLabeler {
    fn apply(&self, path: &Path, req: &SandboxRequest) -> Result<()> {
        let context = Self::context_for(req);
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| SpawnError::InvalidArgument(format!("path {}", path.display())))?;
        let name = c"security.selinux";
        let ret = unsafe {
            libc::lsetxattr(
                c_path.as_ptr(),
                name.as_ptr(),
                context.as_ptr() as *const libc::c_void,
                context.len(),
                0,
            )
        };
        if ret != 0 {
            return Err(SpawnError::Syscall(format!(
                "label {} as {}: {}",
                path.display(),
                context,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// Labeler matching the host: SELinux when it is mounted, nothing otherwise
pub fn host_labeler(has_selinux: bool) -> Box<dyn LabelApplier> {
    if has_selinux {
        Box::new(SelinuxLabeler)
    } else {
        Box::new(NoopLabeler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_depends_on_apl_and_debuggable() {
        let mut req = SandboxRequest {
            apl: "normal".into(),
            ..Default::default()
        };
        assert_eq!(
            SelinuxLabeler::context_for(&req),
            "u:object_r:normal_data_file:s0"
        );
        req.debuggable = true;
        assert_eq!(
            SelinuxLabeler::context_for(&req),
            "u:object_r:debug_normal_data_file:s0"
        );
    }

    #[test]
    fn noop_always_succeeds() {
        let req = SandboxRequest::default();
        assert!(NoopLabeler.apply(Path::new("/nonexistent"), &req).is_ok());
    }
}
