//! Error types for spawn operations

use std::io;

use appspawn_msg::{DecodeError, FailureCode};
use nix::errno::Errno;
use thiserror::Error;

/// Result type for spawn operations
pub type Result<T> = std::result::Result<T, SpawnError>;

/// Errors that can occur while serving spawn requests
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Child setup failed: {0}")]
    Setup(String),

    #[error("Mount of {target} failed: {reason}")]
    Mount { target: String, reason: String },

    #[error("Resource exhausted: {0}")]
    Resource(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout exceeded: {0}")]
    Timeout(String),

    #[error("Hook {reason} aborted with code {code}")]
    Hook { code: i32, reason: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl SpawnError {
    /// Wrap a failed syscall, classifying descriptor/memory/process exhaustion
    /// as a resource error
    pub fn syscall(what: &str, errno: Errno) -> Self {
        match errno {
            Errno::EAGAIN | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE => {
                SpawnError::Resource(format!("{}: {}", what, errno))
            }
            Errno::EPERM | Errno::EACCES => {
                SpawnError::PermissionDenied(format!("{}: {}", what, errno))
            }
            _ => SpawnError::Syscall(format!("{}: {}", what, errno)),
        }
    }

    /// Stable non-zero code, used as a context failure code and as the exit
    /// status of a child that aborts setup
    pub fn code(&self) -> i32 {
        match self {
            SpawnError::Protocol(_) => 10,
            SpawnError::Config(_) => 11,
            SpawnError::Setup(_) => 12,
            SpawnError::Mount { .. } => 13,
            SpawnError::Resource(_) => 14,
            SpawnError::Io(_) => 15,
            SpawnError::Syscall(_) => 16,
            SpawnError::InvalidArgument(_) => 17,
            SpawnError::NotFound(_) => 18,
            SpawnError::Timeout(_) => 19,
            SpawnError::PermissionDenied(_) => 20,
            SpawnError::Hook { code, .. } if *code != 0 => *code,
            SpawnError::Hook { .. } => 1,
        }
    }

    /// Negative reply value reported to the caller
    pub fn reply_code(&self) -> FailureCode {
        match self {
            SpawnError::Protocol(_) => FailureCode::DecodeFailed,
            SpawnError::Resource(_) => FailureCode::ResourceExhausted,
            SpawnError::Timeout(_) => FailureCode::Timeout,
            SpawnError::NotFound(_) => FailureCode::NotFound,
            _ => FailureCode::SpawnFailed,
        }
    }
}

impl From<Errno> for SpawnError {
    fn from(errno: Errno) -> Self {
        SpawnError::syscall("syscall", errno)
    }
}

impl From<serde_json::Error> for SpawnError {
    fn from(err: serde_json::Error) -> Self {
        SpawnError::Config(err.to_string())
    }
}
