//! Loads the permission names before the first request

use appspawn_core::hook::PRIO_HIGHEST;
use appspawn_core::{HookStage, Result};

use crate::content::AppSpawnContent;
use crate::orchestrator::Hooks;

pub fn register(hooks: &mut Hooks) -> Result<()> {
    hooks
        .server
        .register(HookStage::Preload, PRIO_HIGHEST, "permission-load", load)
}

fn load(_: &(), content: &mut AppSpawnContent) -> Result<()> {
    let locator = content.config.locator();
    let set = content
        .permissions
        .load(&locator, &content.config.sandbox_fragment);
    log::info!("{} sandbox permissions: {}", set.len(), set);
    Ok(())
}
