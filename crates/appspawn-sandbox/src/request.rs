//! What the sandbox engine needs to know about one spawn

use appspawn_msg::{AppFlag, FlagBitmap, SpawnMessage};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxRequest {
    pub bundle_name: String,
    pub bundle_index: u32,
    pub uid: u32,
    pub gid: u32,
    pub permission_code: FlagBitmap,
    /// Privilege level used for security labels
    pub apl: String,
    pub debuggable: bool,
    /// Critical mount failures are downgraded to warnings
    pub ignore_errors: bool,
    /// The child also gets its own network namespace
    pub isolated: bool,
}

impl SandboxRequest {
    pub fn from_message(msg: &SpawnMessage) -> Self {
        let (bundle_name, bundle_index) = msg.bundle_info();
        Self {
            bundle_name: bundle_name.to_string(),
            bundle_index,
            uid: msg.uid,
            gid: msg.gid,
            permission_code: msg.permission_code().cloned().unwrap_or_default(),
            apl: msg
                .domain_info()
                .map(|d| d.apl.clone())
                .unwrap_or_else(|| "normal".to_string()),
            debuggable: msg.is_flag_set(AppFlag::Debuggable),
            ignore_errors: msg.is_flag_set(AppFlag::IgnoreSandbox),
            isolated: msg.is_flag_set(AppFlag::IsolatedSandbox),
        }
    }
}
