//! Spawn request message model

use crate::codec::{DecodeError, MAX_NAME_LEN};
use crate::flags::{AppFlag, FlagBitmap};
use crate::tlv::{DacInfo, DomainInfo, TlvRecord, ext};

/// Kind of request carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Spawn an application process inside its sandbox
    Spawn,
    /// Query (and if needed reap) the exit status of a spawned pid
    TerminationStatus,
    /// Spawn a native process without the application sandbox
    SpawnNative,
    /// Log the daemon's bookkeeping
    Dump,
}

impl MsgType {
    pub fn as_u32(self) -> u32 {
        match self {
            MsgType::Spawn => 0,
            MsgType::TerminationStatus => 1,
            MsgType::SpawnNative => 2,
            MsgType::Dump => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MsgType::Spawn),
            1 => Some(MsgType::TerminationStatus),
            2 => Some(MsgType::SpawnNative),
            3 => Some(MsgType::Dump),
            _ => None,
        }
    }

    /// Whether this request forks a new process
    pub fn is_spawn(self) -> bool {
        matches!(self, MsgType::Spawn | MsgType::SpawnNative)
    }
}

/// Whether `name` is usable as one path component (sandbox roots, cgroup dirs)
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// One decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnMessage {
    pub msg_type: MsgType,
    pub msg_id: u32,
    pub process_name: String,
    pub uid: u32,
    pub gid: u32,
    pub token: u64,
    /// Known extension records, in wire order
    pub records: Vec<TlvRecord>,
}

impl SpawnMessage {
    pub fn new(msg_type: MsgType, process_name: impl Into<String>) -> Self {
        Self {
            msg_type,
            msg_id: 0,
            process_name: process_name.into(),
            uid: 0,
            gid: 0,
            token: 0,
            records: Vec::new(),
        }
    }

    /// Request asking for the termination status of `pid`
    pub fn termination(pid: i32) -> Self {
        let mut msg = Self::new(MsgType::TerminationStatus, "terminate");
        msg.push(TlvRecord::TerminationInfo { pid });
        msg
    }

    /// Append a record; singleton kinds replace any earlier record of the same tag
    pub fn push(&mut self, record: TlvRecord) {
        if record.is_singleton()
            && let Some(slot) = self.records.iter_mut().find(|r| r.tag() == record.tag())
        {
            *slot = record;
            return;
        }
        self.records.push(record);
    }

    fn find(&self, tag: u32) -> Option<&TlvRecord> {
        self.records.iter().find(|r| r.tag() == tag)
    }

    /// Bundle name and index; falls back to the process name with index 0
    pub fn bundle_info(&self) -> (&str, u32) {
        match self.find(crate::tlv::tag::BUNDLE_INFO) {
            Some(TlvRecord::BundleInfo {
                bundle_index,
                bundle_name,
            }) => (bundle_name.as_str(), *bundle_index),
            _ => (self.process_name.as_str(), 0),
        }
    }

    /// Reject spawn requests whose process or bundle name is not a plain file name
    pub fn validate_names(&self) -> Result<(), DecodeError> {
        if !self.msg_type.is_spawn() {
            return Ok(());
        }
        if !is_safe_name(&self.process_name) {
            return Err(DecodeError::InvalidName {
                what: "process name",
                name: self.process_name.clone(),
            });
        }
        let (bundle_name, _) = self.bundle_info();
        if !is_safe_name(bundle_name) {
            return Err(DecodeError::InvalidName {
                what: "bundle name",
                name: bundle_name.to_string(),
            });
        }
        Ok(())
    }

    pub fn msg_flags(&self) -> Option<&FlagBitmap> {
        match self.find(crate::tlv::tag::MSG_FLAGS) {
            Some(TlvRecord::MsgFlags(flags)) => Some(flags),
            _ => None,
        }
    }

    pub fn permission_code(&self) -> Option<&FlagBitmap> {
        match self.find(crate::tlv::tag::PERMISSION) {
            Some(TlvRecord::Permission(code)) => Some(code),
            _ => None,
        }
    }

    pub fn dac_info(&self) -> Option<&DacInfo> {
        match self.find(crate::tlv::tag::DAC_INFO) {
            Some(TlvRecord::DacInfo(info)) => Some(info),
            _ => None,
        }
    }

    pub fn domain_info(&self) -> Option<&DomainInfo> {
        match self.find(crate::tlv::tag::DOMAIN_INFO) {
            Some(TlvRecord::DomainInfo(info)) => Some(info),
            _ => None,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        match self.find(crate::tlv::tag::OWNER_INFO) {
            Some(TlvRecord::OwnerInfo(owner)) => Some(owner),
            _ => None,
        }
    }

    pub fn fds(&self) -> &[i32] {
        match self.find(crate::tlv::tag::FD_LIST) {
            Some(TlvRecord::FdList(fds)) => fds,
            _ => &[],
        }
    }

    pub fn termination_pid(&self) -> Option<i32> {
        match self.find(crate::tlv::tag::TERMINATION_INFO) {
            Some(TlvRecord::TerminationInfo { pid }) => Some(*pid),
            _ => None,
        }
    }

    pub fn internet_allowed(&self) -> Option<bool> {
        match self.find(crate::tlv::tag::INTERNET_INFO) {
            Some(TlvRecord::InternetInfo {
                set_allow: true,
                allow,
            }) => Some(*allow),
            _ => None,
        }
    }

    /// Value of the first extension record named `name`
    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        self.records.iter().find_map(|r| match r {
            TlvRecord::Extension { name: n, value } if n == name => Some(value.as_slice()),
            _ => None,
        })
    }

    /// Argv from the `exec-args` extension (NUL-separated)
    pub fn exec_args(&self) -> Option<Vec<String>> {
        let raw = self.extension(ext::EXEC_ARGS)?;
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        (!args.is_empty()).then_some(args)
    }

    pub fn is_flag_set(&self, flag: AppFlag) -> bool {
        self.msg_flags().is_some_and(|f| f.is_set(flag.index()))
    }

    /// Set a message flag, creating the flag record on first use
    pub fn set_flag(&mut self, flag: AppFlag) {
        for record in &mut self.records {
            if let TlvRecord::MsgFlags(flags) = record {
                flags.set(flag.index());
                return;
            }
        }
        let mut flags = FlagBitmap::with_capacity(AppFlag::ALL.len());
        flags.set(flag.index());
        self.records.push(TlvRecord::MsgFlags(flags));
    }

    pub fn clear_flag(&mut self, flag: AppFlag) {
        for record in &mut self.records {
            if let TlvRecord::MsgFlags(flags) = record {
                flags.clear(flag.index());
            }
        }
    }

    pub fn set_permission_code(&mut self, code: FlagBitmap) {
        self.push(TlvRecord::Permission(code));
    }
}
