//! Identity helpers

use crate::error::{Result, SpawnError};

/// Uids of one user occupy a block of this size
pub const UID_BASE: u32 = 200_000;

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

pub fn get_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

pub fn get_gid() -> u32 {
    nix::unistd::getegid().as_raw()
}

pub fn require_root() -> Result<()> {
    if !is_root() {
        Err(SpawnError::PermissionDenied(
            "This operation requires root privileges".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// User id that owns an application uid
pub fn user_id_of(uid: u32) -> u32 {
    uid / UID_BASE
}
