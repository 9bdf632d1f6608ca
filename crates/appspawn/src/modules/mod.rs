//! Builtin hook modules
//!
//! | stage | priority | module |
//! |---|---|---|
//! | `PRELOAD` | highest | permission names |
//! | `PRELOAD` | sandbox | sandbox engine |
//! | `SPAWN_PREPARE` | common | argv, env, groups, kept fds |
//! | `SPAWN_CLEAR_ENV` | highest | close fds, reset signals |
//! | `SPAWN_SET_CHILD_PROPERTY` | sandbox | namespaces, mounts, chroot |
//! | `SPAWN_SET_CHILD_PROPERTY` | property | groups, gid, uid |
//! | `SPAWN_COMPLETED` | common | process name, dumpable |
//! | `APP_ADD` / `APP_DIED` | common | cgroup placement |

pub mod cgroup;
pub mod env;
pub mod identity;
pub mod permission;
pub mod sandbox;

use appspawn_core::Result;

use crate::orchestrator::Hooks;

pub fn register_builtins(hooks: &mut Hooks) -> Result<()> {
    permission::register(hooks)?;
    sandbox::register(hooks)?;
    env::register(hooks)?;
    identity::register(hooks)?;
    cgroup::register(hooks)?;
    Ok(())
}
