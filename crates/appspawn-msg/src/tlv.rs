//! Typed extension records

use crate::flags::FlagBitmap;

/// Wire tags for extension records
pub mod tag {
    pub const BUNDLE_INFO: u32 = 0;
    pub const MSG_FLAGS: u32 = 1;
    pub const DAC_INFO: u32 = 2;
    pub const DOMAIN_INFO: u32 = 3;
    pub const OWNER_INFO: u32 = 4;
    pub const PERMISSION: u32 = 6;
    pub const INTERNET_INFO: u32 = 7;
    pub const TERMINATION_INFO: u32 = 8;
    pub const FD_LIST: u32 = 9;
    pub const EXTENSION: u32 = 10;
}

/// Well-known names for [`TlvRecord::Extension`] records
pub mod ext {
    pub const RENDER_CMD: &str = "render-cmd";
    pub const HSP_LIST: &str = "HspList";
    pub const OVERLAY: &str = "Overlay";
    pub const DATA_GROUP: &str = "DataGroup";
    pub const APP_ENV: &str = "AppEnv";
    /// NUL-separated argv the child executes after setup
    pub const EXEC_ARGS: &str = "exec-args";
}

/// Supplementary identity for the child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DacInfo {
    pub gids: Vec<u32>,
    pub user_name: String,
}

/// Security domain of the application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainInfo {
    pub hap_flags: u32,
    /// Ability privilege level, e.g. `normal`, `system_basic`, `system_core`
    pub apl: String,
}

/// One decoded extension record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvRecord {
    BundleInfo { bundle_index: u32, bundle_name: String },
    MsgFlags(FlagBitmap),
    DacInfo(DacInfo),
    DomainInfo(DomainInfo),
    OwnerInfo(String),
    Permission(FlagBitmap),
    InternetInfo { set_allow: bool, allow: bool },
    TerminationInfo { pid: i32 },
    FdList(Vec<i32>),
    Extension { name: String, value: Vec<u8> },
}

impl TlvRecord {
    pub fn tag(&self) -> u32 {
        match self {
            TlvRecord::BundleInfo { .. } => tag::BUNDLE_INFO,
            TlvRecord::MsgFlags(_) => tag::MSG_FLAGS,
            TlvRecord::DacInfo(_) => tag::DAC_INFO,
            TlvRecord::DomainInfo(_) => tag::DOMAIN_INFO,
            TlvRecord::OwnerInfo(_) => tag::OWNER_INFO,
            TlvRecord::Permission(_) => tag::PERMISSION,
            TlvRecord::InternetInfo { .. } => tag::INTERNET_INFO,
            TlvRecord::TerminationInfo { .. } => tag::TERMINATION_INFO,
            TlvRecord::FdList(_) => tag::FD_LIST,
            TlvRecord::Extension { .. } => tag::EXTENSION,
        }
    }

    pub fn tag_name(&self) -> &'static str {
        match self {
            TlvRecord::BundleInfo { .. } => "bundle-info",
            TlvRecord::MsgFlags(_) => "msg-flags",
            TlvRecord::DacInfo(_) => "dac-info",
            TlvRecord::DomainInfo(_) => "domain-info",
            TlvRecord::OwnerInfo(_) => "owner-info",
            TlvRecord::Permission(_) => "permission",
            TlvRecord::InternetInfo { .. } => "internet-info",
            TlvRecord::TerminationInfo { .. } => "termination-info",
            TlvRecord::FdList(_) => "fd-list",
            TlvRecord::Extension { .. } => "extension",
        }
    }

    /// Records of these kinds may appear at most once per message
    pub fn is_singleton(&self) -> bool {
        !matches!(self, TlvRecord::Extension { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_wire_constants() {
        assert_eq!(TlvRecord::MsgFlags(FlagBitmap::default()).tag(), 1);
        assert_eq!(TlvRecord::Permission(FlagBitmap::default()).tag(), 6);
        assert_eq!(TlvRecord::FdList(vec![3]).tag(), tag::FD_LIST);
    }

    #[test]
    fn only_extensions_repeat() {
        let ext = TlvRecord::Extension {
            name: ext::APP_ENV.to_string(),
            value: Vec::new(),
        };
        assert!(!ext.is_singleton());
        assert!(TlvRecord::OwnerInfo("owner".into()).is_singleton());
    }
}
