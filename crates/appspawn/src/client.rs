//! Client side: build a request and exchange it for one reply

use std::collections::BTreeMap;
use std::io::{IoSlice, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use appspawn_core::{DaemonConfig, Result, SpawnError};
use appspawn_msg::reply::REPLY_LEN;
use appspawn_msg::tlv::ext;
use appspawn_msg::{AppFlag, DacInfo, DomainInfo, MsgType, Reply, SpawnMessage, TlvRecord};
use appspawn_permission::PermissionRegistry;
use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};

/// Builder for a spawn message
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    name: String,
    native: bool,
    uid: u32,
    gid: u32,
    bundle: Option<(String, u32)>,
    gids: Vec<u32>,
    apl: Option<String>,
    flags: Vec<AppFlag>,
    permissions: Vec<String>,
    exec_args: Vec<String>,
    env: BTreeMap<String, String>,
    fds: Vec<i32>,
}

impl SpawnRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            native: false,
            uid: 0,
            gid: 0,
            bundle: None,
            gids: Vec::new(),
            apl: None,
            flags: Vec::new(),
            permissions: Vec::new(),
            exec_args: Vec::new(),
            env: BTreeMap::new(),
            fds: Vec::new(),
        }
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    pub fn bundle(mut self, name: impl Into<String>, index: u32) -> Self {
        self.bundle = Some((name.into(), index));
        self
    }

    pub fn groups(mut self, gids: Vec<u32>) -> Self {
        self.gids = gids;
        self
    }

    pub fn apl(mut self, apl: impl Into<String>) -> Self {
        self.apl = Some(apl.into());
        self
    }

    /// Spawn without the application sandbox
    pub fn native(mut self) -> Self {
        self.native = true;
        self
    }

    pub fn flag(mut self, flag: AppFlag) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn permission(mut self, name: impl Into<String>) -> Self {
        self.permissions.push(name.into());
        self
    }

    pub fn exec_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Pass this descriptor of the calling process to the child
    pub fn keep_fd(mut self, fd: i32) -> Self {
        self.fds.push(fd);
        self
    }

    /// Encode into a message; permission names go through `registry`
    pub fn build(&self, registry: &PermissionRegistry) -> Result<SpawnMessage> {
        let msg_type = if self.native {
            MsgType::SpawnNative
        } else {
            MsgType::Spawn
        };
        let mut msg = SpawnMessage::new(msg_type, self.name.clone());
        msg.uid = self.uid;
        msg.gid = self.gid;

        if let Some((name, index)) = &self.bundle {
            msg.push(TlvRecord::BundleInfo {
                bundle_index: *index,
                bundle_name: name.clone(),
            });
        }
        for flag in &self.flags {
            msg.set_flag(*flag);
        }
        if !self.permissions.is_empty() {
            msg.set_permission_code(registry.gen_permission_code(&self.permissions));
        }
        if !self.gids.is_empty() {
            msg.push(TlvRecord::DacInfo(DacInfo {
                gids: self.gids.clone(),
                user_name: self.name.clone(),
            }));
        }
        if let Some(apl) = &self.apl {
            msg.push(TlvRecord::DomainInfo(DomainInfo {
                hap_flags: 0,
                apl: apl.clone(),
            }));
        }
        if !self.fds.is_empty() {
            msg.push(TlvRecord::FdList(self.fds.clone()));
        }
        if !self.exec_args.is_empty() {
            let mut value = Vec::new();
            for arg in &self.exec_args {
                value.extend_from_slice(arg.as_bytes());
                value.push(0);
            }
            msg.push(TlvRecord::Extension {
                name: ext::EXEC_ARGS.to_string(),
                value,
            });
        }
        if !self.env.is_empty() {
            msg.push(TlvRecord::Extension {
                name: ext::APP_ENV.to_string(),
                value: serde_json::to_vec(&self.env)?,
            });
        }
        Ok(msg)
    }
}

/// Sends one message per connection to the daemon socket
#[derive(Debug, Clone)]
pub struct SpawnClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SpawnClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        // the daemon may wait for a child before replying
        let timeout = config.child_ready_timeout() + config.socket_timeout();
        Self::new(&config.socket_path).with_timeout(timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn send(&self, msg: &SpawnMessage) -> Result<Reply> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        let bytes = appspawn_msg::encode(msg);
        let sent = send_with_fds(&stream, &bytes, msg.fds())?;
        stream.write_all(&bytes[sent..])?;

        let mut buf = [0u8; REPLY_LEN];
        stream.read_exact(&mut buf)?;
        Ok(Reply::decode(&buf)?)
    }

    pub fn spawn(&self, request: &SpawnRequest, registry: &PermissionRegistry) -> Result<Reply> {
        self.send(&request.build(registry)?)
    }

    /// Exit status of `pid`, killing it first if it is still running
    pub fn termination_status(&self, pid: i32) -> Result<Reply> {
        self.send(&SpawnMessage::termination(pid))
    }

    pub fn dump(&self) -> Result<Reply> {
        self.send(&SpawnMessage::new(MsgType::Dump, "dump"))
    }
}

/// Send the start of `bytes` with `fds` attached as `SCM_RIGHTS`
///
/// Returns how many bytes went out; the caller writes the rest.
fn send_with_fds(stream: &UnixStream, bytes: &[u8], fds: &[i32]) -> Result<usize> {
    if fds.is_empty() {
        return Ok(0);
    }
    let rights = [ControlMessage::ScmRights(fds)];
    loop {
        match sendmsg::<()>(
            stream.as_raw_fd(),
            &[IoSlice::new(bytes)],
            &rights,
            MsgFlags::empty(),
            None,
        ) {
            Ok(sent) => return Ok(sent),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SpawnError::syscall("sendmsg", e)),
        }
    }
}
