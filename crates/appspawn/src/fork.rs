//! Fork as an explicit parent/child split, plus the readiness pipe
//!
//! [`Forker::fork`] takes the child continuation as a closure and returns the
//! child's pid to the parent continuation, which is simply the caller.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use appspawn_core::{Result, SpawnError};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::{ForkResult, Pid, fork, pipe2};

/// Starts child continuations
pub trait Forker {
    /// Run `child` in a new process and return that process's pid
    ///
    /// `child` returns the exit status to use when it does not exec.
    fn fork(&self, child: &mut dyn FnMut() -> i32) -> Result<Pid>;
}

/// Real fork(2)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemForker;

impl Forker for SystemForker {
    fn fork(&self, run_child: &mut dyn FnMut() -> i32) -> Result<Pid> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => {
                let code = run_child();
                // never unwind into the parent's copy of the stack
                unsafe { libc::_exit(code) }
            }
            Err(e) => Err(SpawnError::syscall("fork", e)),
        }
    }
}

/// First pid handed out by [`SimulatedForker`], above any kernel `pid_max`
pub const SIMULATED_PID_BASE: i32 = 1 << 24;

#[derive(Debug, Default)]
struct SimulatedState {
    forks: AtomicI32,
    exits: Mutex<Vec<(i32, i32)>>,
}

/// Runs the child continuation in-process
///
/// Pids never collide with real processes, so signalling them fails with
/// `ESRCH`. Clones share the recorded exits.
#[derive(Debug, Clone, Default)]
pub struct SimulatedForker {
    state: Arc<SimulatedState>,
}

impl SimulatedForker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(pid, exit status)` of every child run so far
    pub fn exits(&self) -> Vec<(i32, i32)> {
        self.state
            .exits
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn exit_of(&self, pid: i32) -> Option<i32> {
        self.exits()
            .into_iter()
            .find(|(p, _)| *p == pid)
            .map(|(_, status)| status)
    }
}

impl Forker for SimulatedForker {
    fn fork(&self, child: &mut dyn FnMut() -> i32) -> Result<Pid> {
        let pid = SIMULATED_PID_BASE + self.state.forks.fetch_add(1, Ordering::SeqCst);
        let status = child();
        if let Ok(mut exits) = self.state.exits.lock() {
            exits.push((pid, status));
        }
        Ok(Pid::from_raw(pid))
    }
}

/// Upper bound on the notes a ready child may send
pub const MAX_NOTES_LEN: usize = 4096;

/// What the child reported through the readiness pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Setup finished; carries the child's notes, one per line
    Ready(Vec<String>),
    /// Setup aborted with this code
    Aborted(i32),
    /// The pipe closed without a status
    Closed,
}

/// Close-on-exec pipe carrying one frame from child to parent
///
/// A frame is a 4-byte status, a 4-byte note length and that many bytes of
/// newline-separated notes, all little endian.
#[derive(Debug)]
pub struct ReadinessPipe {
    reader: File,
    writer: Option<File>,
}

impl ReadinessPipe {
    pub fn new() -> Result<Self> {
        let (reader, writer) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| SpawnError::syscall("pipe2", e))?;
        Ok(Self {
            reader: File::from(reader),
            writer: Some(File::from(writer)),
        })
    }

    pub fn writer_fd(&self) -> Option<RawFd> {
        self.writer.as_ref().map(|w| w.as_raw_fd())
    }

    /// Child side: report `status`, 0 meaning ready
    pub fn notify(&self, status: i32) -> Result<()> {
        self.write_frame(status, &[])
    }

    /// Child side: report readiness along with `notes`
    ///
    /// Notes past [`MAX_NOTES_LEN`] are dropped.
    pub fn notify_ready(&self, notes: &[String]) -> Result<()> {
        let mut payload = Vec::new();
        for (i, note) in notes.iter().enumerate() {
            let line = note.replace('\n', " ");
            if payload.len() + line.len() + 1 > MAX_NOTES_LEN {
                log::warn!("dropping {} readiness notes", notes.len() - i);
                break;
            }
            if !payload.is_empty() {
                payload.push(b'\n');
            }
            payload.extend_from_slice(line.as_bytes());
        }
        self.write_frame(0, &payload)
    }

    fn write_frame(&self, status: i32, payload: &[u8]) -> Result<()> {
        let mut writer = self
            .writer
            .as_ref()
            .ok_or_else(|| SpawnError::Setup("readiness pipe already closed".into()))?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&status.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        writer.write_all(&frame)?;
        Ok(())
    }

    /// Parent side: drop the write end so a dead child reads as EOF
    pub fn close_writer(&mut self) {
        self.writer = None;
    }

    /// Parent side: wait for the child's frame
    pub fn wait(&self, timeout: Duration) -> Result<Readiness> {
        let deadline = Instant::now() + timeout;

        let mut header = [0u8; 8];
        match self.read_until(&mut header, deadline, timeout)? {
            0 => return Ok(Readiness::Closed),
            n if n < header.len() => {
                return Err(SpawnError::Setup(format!(
                    "short readiness status ({} bytes)",
                    n
                )));
            }
            _ => {}
        }
        let [s0, s1, s2, s3, l0, l1, l2, l3] = header;
        let status = i32::from_le_bytes([s0, s1, s2, s3]);
        let len = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
        if len > MAX_NOTES_LEN {
            return Err(SpawnError::Setup(format!(
                "readiness notes of {} bytes exceed {}",
                len, MAX_NOTES_LEN
            )));
        }

        let mut payload = vec![0u8; len];
        let got = self.read_until(&mut payload, deadline, timeout)?;
        if got < len {
            return Err(SpawnError::Setup(format!(
                "short readiness notes ({} of {} bytes)",
                got, len
            )));
        }
        Ok(match status {
            0 => Readiness::Ready(
                String::from_utf8_lossy(&payload)
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            code => Readiness::Aborted(code),
        })
    }

    /// Fill `buf` until it is full, the pipe hits EOF or `deadline` passes
    fn read_until(&self, buf: &mut [u8], deadline: Instant, timeout: Duration) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SpawnError::Timeout(format!(
                    "child not ready after {:?}",
                    timeout
                )));
            }
            let ms = remaining.as_millis().clamp(1, u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(self.reader.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SpawnError::syscall("poll", e)),
            }

            let mut reader = &self.reader;
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;

    #[test]
    fn test_simulated_fork_runs_child_inline() {
        let forker = SimulatedForker::new();
        let mut ran = false;
        let pid = forker
            .fork(&mut || {
                ran = true;
                7
            })
            .unwrap();
        assert!(ran);
        assert_eq!(pid.as_raw(), SIMULATED_PID_BASE);
        assert_eq!(forker.exit_of(pid.as_raw()), Some(7));

        let next = forker.fork(&mut || 0).unwrap();
        assert_eq!(next.as_raw(), SIMULATED_PID_BASE + 1);
        assert_eq!(forker.clone().exits().len(), 2);
    }

    #[test]
    fn test_pipe_reports_ready_and_abort() {
        let mut pipe = ReadinessPipe::new().unwrap();
        pipe.notify(0).unwrap();
        pipe.close_writer();
        assert_eq!(
            pipe.wait(Duration::from_secs(1)).unwrap(),
            Readiness::Ready(Vec::new())
        );

        let mut pipe = ReadinessPipe::new().unwrap();
        pipe.notify(13).unwrap();
        pipe.close_writer();
        assert_eq!(
            pipe.wait(Duration::from_secs(1)).unwrap(),
            Readiness::Aborted(13)
        );
    }

    #[test]
    fn test_pipe_carries_ready_notes() {
        let mut pipe = ReadinessPipe::new().unwrap();
        let notes = ["/data/a: no such file".to_string(), "/b\nsplit".to_string()];
        pipe.notify_ready(&notes).unwrap();
        pipe.close_writer();
        assert_eq!(
            pipe.wait(Duration::from_secs(1)).unwrap(),
            Readiness::Ready(vec!["/data/a: no such file".to_string(), "/b split".to_string()])
        );
    }

    #[test]
    fn test_pipe_drops_notes_past_limit() {
        let mut pipe = ReadinessPipe::new().unwrap();
        let notes = vec!["x".repeat(3000), "y".repeat(3000)];
        pipe.notify_ready(&notes).unwrap();
        pipe.close_writer();
        assert_eq!(
            pipe.wait(Duration::from_secs(1)).unwrap(),
            Readiness::Ready(vec!["x".repeat(3000)])
        );
    }

    #[test]
    fn test_pipe_short_frame_is_an_error() {
        let mut pipe = ReadinessPipe::new().unwrap();
        {
            let mut writer = pipe.writer.as_ref().unwrap();
            writer.write_all(&[0, 0, 0, 0, 9]).unwrap();
        }
        pipe.close_writer();
        assert!(matches!(
            pipe.wait(Duration::from_secs(1)),
            Err(SpawnError::Setup(_))
        ));
    }

    #[test]
    fn test_pipe_eof_without_status() {
        let mut pipe = ReadinessPipe::new().unwrap();
        pipe.close_writer();
        assert_eq!(pipe.wait(Duration::from_secs(1)).unwrap(), Readiness::Closed);
        assert!(pipe.notify(0).is_err());
    }

    #[test]
    fn test_pipe_times_out() {
        let pipe = ReadinessPipe::new().unwrap();
        let err = pipe.wait(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, SpawnError::Timeout(_)));
    }

    #[test]
    fn test_system_fork_reports_through_pipe() {
        let _guard = serial_guard();
        let mut pipe = ReadinessPipe::new().unwrap();
        let child = SystemForker
            .fork(&mut || match pipe.notify_ready(&["note".to_string()]) {
                Ok(()) => 0,
                Err(_) => 1,
            })
            .unwrap();
        pipe.close_writer();
        assert_eq!(
            pipe.wait(Duration::from_secs(5)).unwrap(),
            Readiness::Ready(vec!["note".to_string()])
        );

        let status = nix::sys::wait::waitpid(child, None).unwrap();
        assert_eq!(crate::store::exit_status(status), Some(0));
    }
}
