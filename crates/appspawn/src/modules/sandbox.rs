//! Builds the app sandbox in the child

use std::path::Path;

use appspawn_core::hook::PRIO_SANDBOX;
use appspawn_core::{HookStage, Result, SpawnError};
use appspawn_sandbox::label::host_labeler;
use appspawn_sandbox::namespace::{enter_root, namespace_inode};
use appspawn_sandbox::{
    ClassGroups, NamespaceConfig, SandboxConfig, SandboxEngine, SandboxRequest, SystemMounter,
};

use crate::content::{AppSpawnContent, SandboxSetup};
use crate::context::AppSpawningCtx;
use crate::orchestrator::Hooks;

pub fn register(hooks: &mut Hooks) -> Result<()> {
    hooks
        .server
        .register(HookStage::Preload, PRIO_SANDBOX, "sandbox-load", load)?;
    hooks.spawn.register(
        HookStage::SpawnSetChildProperty,
        PRIO_SANDBOX,
        "sandbox-build",
        build,
    )
}

/// Create the system engine from the configured fragments
fn load(_: &(), content: &mut AppSpawnContent) -> Result<()> {
    if content.sandbox.is_some() {
        return Ok(());
    }
    if !content.sandbox_enabled() {
        log::info!("app sandbox disabled on this host");
        return Ok(());
    }

    let fragments = content
        .config
        .locator()
        .load_json(&content.config.sandbox_fragment);
    let config = SandboxConfig::from_fragments(fragments.iter().map(|(path, value)| (path, value)));
    if config.is_empty() {
        log::warn!(
            "no sandbox entries in {}, apps share the host view",
            content.config.sandbox_fragment
        );
        return Ok(());
    }

    let engine = SandboxEngine::new(config, Box::new(SystemMounter))
        .with_labeler(host_labeler(content.caps.has_selinux))
        .with_groups(ClassGroups::lookup());
    content.sandbox = Some(SandboxSetup {
        engine,
        enter_namespaces: true,
    });
    Ok(())
}

fn build(content: &AppSpawnContent, ctx: &mut AppSpawningCtx) -> Result<()> {
    if ctx.sandbox_disabled() {
        log::debug!("{} runs without sandbox", ctx.process_name());
        return Ok(());
    }
    let Some(setup) = &content.sandbox else {
        return Ok(());
    };

    let mut req = SandboxRequest::from_message(&ctx.message);
    req.uid = ctx.work.uid;
    req.gid = ctx.work.gid;

    if setup.enter_namespaces {
        let namespaces = if req.isolated {
            NamespaceConfig::isolated()
        } else {
            NamespaceConfig::sandbox()
        };
        detach(namespaces)?;
    }

    let report = setup.engine.build(&req, &content.permissions)?;
    if setup.enter_namespaces && report.root != Path::new("/") {
        enter_root(&report.root)?;
    }
    ctx.work.sandbox_root = Some(report.root.clone());
    ctx.sandbox = Some(report);
    Ok(())
}

/// Enter `namespaces` and check the mount namespace really changed
fn detach(namespaces: NamespaceConfig) -> Result<()> {
    let before = namespace_inode("mnt")?;
    namespaces.enter()?;
    if namespace_inode("mnt")? == before {
        return Err(SpawnError::Setup("mount namespace not detached".into()));
    }
    Ok(())
}
