//! Unix socket front end: one request and one reply per connection

use std::fs;
use std::io::{self, ErrorKind, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use appspawn_core::{DaemonConfig, Result, SpawnError};
use appspawn_msg::codec::{HEADER_LEN, MAX_MSG_LEN, peek_msg_len};
use appspawn_msg::{FailureCode, Reply};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM};

use crate::orchestrator::AppSpawnMgr;

/// How often the loop wakes to check for exits and shutdown
const POLL_INTERVAL_MS: u16 = 100;

/// Most descriptors one request can pass
pub const MAX_PASSED_FDS: usize = 16;

#[derive(Debug)]
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    io_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
}

impl Server {
    /// Bind the configured socket, replacing a stale one
    pub fn bind(config: &DaemonConfig) -> Result<Self> {
        let path = config.socket_path.clone();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => fs::remove_file(&path)?,
            Ok(_) => {
                return Err(SpawnError::Config(format!(
                    "{} exists and is not a socket",
                    path.display()
                )));
            }
            Err(_) => {}
        }

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        log::info!("listening on {}", path.display());
        Ok(Self {
            listener,
            path,
            io_timeout: config.socket_timeout(),
            shutdown: Arc::new(AtomicBool::new(false)),
            child_exited: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Setting the returned flag stops [`Server::run`] within one poll interval
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Route SIGCHLD to the reaper and SIGTERM/SIGINT to shutdown
    ///
    /// Handlers only set flags; the loop acts on them.
    pub fn install_signal_handlers(&self) -> Result<()> {
        signal_hook::flag::register(SIGCHLD, Arc::clone(&self.child_exited))?;
        for sig in [SIGTERM, SIGINT] {
            signal_hook::flag::register(sig, Arc::clone(&self.shutdown))?;
        }
        Ok(())
    }

    /// Preload, then serve until shutdown
    pub fn run(&self, mgr: &mut AppSpawnMgr) -> Result<()> {
        mgr.preload()?;
        let result = self.serve_loop(mgr);
        mgr.server_exit();
        log::info!("server stopped");
        result
    }

    fn serve_loop(&self, mgr: &mut AppSpawnMgr) -> Result<()> {
        while !self.shutdown.load(Ordering::SeqCst) {
            if self.child_exited.swap(false, Ordering::SeqCst) {
                let reaped = mgr.reap_children();
                log::debug!("reaped {} children", reaped);
            }

            let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(e) => return Err(SpawnError::syscall("poll", e)),
            }
            self.accept_pending(mgr);
        }
        Ok(())
    }

    fn accept_pending(&self, mgr: &mut AppSpawnMgr) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => self.serve(stream, mgr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept: {}", e);
                    break;
                }
            }
        }
    }

    fn serve(&self, mut stream: UnixStream, mgr: &mut AppSpawnMgr) {
        if let Err(e) = self.configure(&stream) {
            log::warn!("connection setup: {}", e);
            return;
        }
        let reply = match receive_request(&stream) {
            Ok((buf, fds)) => mgr.handle_request_with_fds(&buf, fds),
            Err(e) => {
                log::warn!("reading request: {}", e);
                Reply::failure(FailureCode::DecodeFailed)
            }
        };
        if let Err(e) = stream.write_all(&reply.encode()) {
            log::warn!("sending reply {}: {}", reply, e);
        }
    }

    fn configure(&self, stream: &UnixStream) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("removing {}: {}", self.path.display(), e);
        }
    }
}

/// Read one framed request and the descriptors passed with its header
fn receive_request(stream: &UnixStream) -> io::Result<(Vec<u8>, Vec<OwnedFd>)> {
    let mut header = vec![0u8; HEADER_LEN];
    let mut fds = Vec::new();
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = recv_with_fds(stream, &mut header[filled..], &mut fds)?;
        if n == 0 {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    let mut reader = stream;
    let buf = read_body(header, &mut reader)?;
    Ok((buf, fds))
}

/// One `recvmsg`, collecting any `SCM_RIGHTS` descriptors into `fds`
fn recv_with_fds(
    stream: &UnixStream,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut space = nix::cmsg_space!([RawFd; MAX_PASSED_FDS]);
    loop {
        let msg = match recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                // the kernel just installed these; nothing else owns them
                fds.extend(received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        return Ok(msg.bytes);
    }
}

/// Read the rest of a request whose header is already in `buf`
///
/// A header declaring an out-of-range length is returned as is so that
/// decoding reports the precise error.
fn read_body(mut buf: Vec<u8>, stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let total = peek_msg_len(&buf).unwrap_or(0);
    if !(HEADER_LEN..=MAX_MSG_LEN).contains(&total) {
        return Ok(buf);
    }
    buf.resize(total, 0);
    stream.read_exact(&mut buf[HEADER_LEN..])?;
    Ok(buf)
}
