use appspawn::{AppSpawnContent, AppSpawnMgr, Server, SpawnClient, SpawnRequest};
use appspawn_core::capabilities::SystemCapabilities;
use appspawn_core::{DaemonConfig, Result, SpawnError, util};
use appspawn_msg::{AppFlag, Reply};
use appspawn_permission::PermissionRegistry;
use log::info;

use crate::cli::SpawnArgs;

pub fn serve(config: DaemonConfig) -> Result<()> {
    let server = Server::bind(&config)?;
    server.install_signal_handlers()?;
    let mut mgr = AppSpawnMgr::new(AppSpawnContent::new(config)).with_builtin_modules()?;
    server.run(&mut mgr)
}

pub fn spawn(config: &DaemonConfig, args: SpawnArgs) -> Result<()> {
    let registry = load_registry(config);
    let request = build_request(args)?;
    let reply = SpawnClient::from_config(config).spawn(&request, &registry)?;
    let pid = expect_success(reply)?;
    println!("{}", pid);
    Ok(())
}

pub fn status(config: &DaemonConfig, pid: i32) -> Result<()> {
    let reply = SpawnClient::from_config(config).termination_status(pid)?;
    let status = expect_success(reply)?;
    println!("{}", status);
    Ok(())
}

pub fn dump(config: &DaemonConfig) -> Result<()> {
    expect_success(SpawnClient::from_config(config).dump()?)?;
    println!("dump written to the daemon log");
    Ok(())
}

pub fn list_permissions(config: &DaemonConfig) {
    info!("Loading permissions from {:?}", config.config_dirs);
    let registry = load_registry(config);
    let Some(set) = registry.set().filter(|set| !set.is_empty()) else {
        println!("No permissions configured in {}", config.sandbox_fragment);
        return;
    };
    println!("Permissions ({}):\n", set.len());
    for (bit, name) in set.names().iter().enumerate() {
        println!("  {:3}  {}", bit, name);
    }
}

pub fn check_requirements(config: &DaemonConfig) {
    info!("Checking host capabilities");
    let caps = SystemCapabilities::detect();
    println!("Checking appspawn requirements...\n");
    println!("{}", caps.summary());

    let sandbox = config.sandbox.resolve(&caps);
    println!(
        "\nApplication sandbox: {} (mode {:?})",
        if sandbox { "on" } else { "off" },
        config.sandbox
    );
    if sandbox && !caps.can_build_sandbox() {
        println!("  spawns will fail: the sandbox needs root and mount namespaces");
    }

    println!("\nSystem info:");
    println!("  UID: {}", util::get_uid());
    println!("  GID: {}", util::get_gid());
}

fn load_registry(config: &DaemonConfig) -> PermissionRegistry {
    let registry = PermissionRegistry::new();
    registry.load(&config.locator(), &config.sandbox_fragment);
    registry
}

fn build_request(args: SpawnArgs) -> Result<SpawnRequest> {
    let mut request = SpawnRequest::new(args.name.clone())
        .uid(args.uid)
        .gid(args.gid)
        .exec_args(args.argv);
    if let Some(index) = args.bundle_index {
        request = request.bundle(args.name, index);
    }
    if !args.groups.is_empty() {
        request = request.groups(args.groups);
    }
    if let Some(apl) = args.apl {
        request = request.apl(apl);
    }
    if args.native {
        request = request.native();
    }
    for name in &args.flags {
        let flag = AppFlag::from_name(name)
            .ok_or_else(|| SpawnError::InvalidArgument(format!("unknown flag {}", name)))?;
        request = request.flag(flag);
    }
    for name in args.permissions {
        request = request.permission(name);
    }
    for entry in &args.env {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            SpawnError::InvalidArgument(format!("expected KEY=VALUE, got {}", entry))
        })?;
        request = request.env(key, value);
    }
    Ok(request)
}

fn expect_success(reply: Reply) -> Result<i64> {
    match reply.failure_code() {
        None => Ok(reply.value()),
        Some(code) => Err(SpawnError::Setup(format!(
            "daemon replied {}: {}",
            reply.value(),
            code
        ))),
    }
}
