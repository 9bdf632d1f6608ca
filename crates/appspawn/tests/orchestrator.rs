//! Orchestrator pipeline tests
//!
//! Most tests use the simulated forker, so the child continuation runs in the
//! test process and every hook it runs is observable. Tests that really fork
//! hold `FORK_LOCK` so their children are not reaped by each other.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use appspawn::modules;
use appspawn::{
    AppSpawnContent, AppSpawnMgr, RecordingEntry, SandboxSetup, SimulatedForker, SpawnRequest,
    SystemForker,
};
use appspawn_core::capabilities::SystemCapabilities;
use appspawn_core::hook::{PRIO_COMMON, PRIO_LOWEST};
use appspawn_core::{DaemonConfig, HookStage, SpawnError};
use appspawn_msg::{FailureCode, MsgType, SpawnMessage};
use appspawn_permission::{PermissionRegistry, PermissionSet};
use appspawn_sandbox::{RecordingMounter, SandboxConfig, SandboxEngine, SandboxMountConfig};

static FORK_LOCK: Mutex<()> = Mutex::new(());

fn fork_guard() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn caps() -> SystemCapabilities {
    SystemCapabilities {
        has_root: false,
        has_user_namespaces: false,
        has_mount_namespaces: false,
        has_selinux: false,
        has_cgroup_v2: false,
    }
}

fn registry() -> PermissionRegistry {
    PermissionRegistry::with_set(PermissionSet::from_names(["internet", "camera"]))
}

fn simulated(content: AppSpawnContent) -> (AppSpawnMgr, SimulatedForker, RecordingEntry) {
    let forker = SimulatedForker::new();
    let entry = RecordingEntry::new(0);
    let mgr = AppSpawnMgr::new(content)
        .with_forker(forker.clone())
        .with_entry(entry.clone());
    (mgr, forker, entry)
}

fn plain_content() -> AppSpawnContent {
    AppSpawnContent::with_caps(DaemonConfig::default(), caps()).with_permissions(registry())
}

fn trace_hook(
    mgr: &mut AppSpawnMgr,
    stage: HookStage,
    trace: &Rc<RefCell<Vec<HookStage>>>,
) {
    let trace = Rc::clone(trace);
    mgr.hooks_mut()
        .spawn
        .register(stage, PRIO_LOWEST, format!("trace-{}", stage), move |_, _| {
            trace.borrow_mut().push(stage);
            Ok(())
        })
        .unwrap();
}

/// Test the full request from the scenario: internet granted, camera not
#[test]
fn test_end_to_end_spawn_with_sandbox() {
    let tmp = tempfile::tempdir().unwrap();
    let mounter = Arc::new(RecordingMounter::new());
    let config = SandboxConfig {
        sandbox_root: Some(
            tmp.path()
                .join("sandbox/<currentUserId>/<PackageName>")
                .display()
                .to_string(),
        ),
        mounts: vec![
            SandboxMountConfig::bind("/dev/video0", "/dev/video0").gated("camera"),
            SandboxMountConfig::bind("/etc/net", "/etc/net").gated("internet"),
            SandboxMountConfig::bind("/data/app/<PackageName>", "/data/storage/base"),
        ],
        ..Default::default()
    };
    let engine = SandboxEngine::new(config, Box::new(mounter.clone())).with_ownership(false);
    let content = plain_content().with_sandbox(SandboxSetup {
        engine,
        enter_namespaces: false,
    });
    let (mut mgr, forker, entry) = simulated(content);
    // only the sandbox module: clear-env would close the harness's descriptors
    modules::sandbox::register(mgr.hooks_mut()).unwrap();

    let reg = registry();
    assert_eq!(reg.set().unwrap().index_of("camera"), Some(0));
    assert_eq!(reg.set().unwrap().index_of("internet"), Some(1));
    let msg = SpawnRequest::new("com.example.app")
        .uid(20010001)
        .gid(20010001)
        .permission("internet")
        .build(&reg)
        .unwrap();
    assert_eq!(msg.permission_code().unwrap().to_u64(), 0b10);

    let reply = mgr.handle_message(msg);
    assert!(reply.is_success(), "reply {}", reply);
    let pid = reply.value() as i32;

    let root = tmp.path().join("sandbox/100/com.example.app");
    assert_eq!(mounter.mount_count(&root.join("dev/video0")), 0);
    assert_eq!(mounter.mount_count(&root.join("etc/net")), 1);
    assert_eq!(
        mounter.mounts()[1].source.as_deref(),
        Some(Path::new("/data/app/com.example.app"))
    );

    let process = mgr.store().find_by_pid(pid).unwrap();
    assert_eq!(process.name, "com.example.app");
    assert_eq!(process.uid, 20010001);
    assert_eq!(mgr.store().spawning_count(), 0);
    assert_eq!(forker.exit_of(pid), Some(0));
    assert_eq!(entry.runs().len(), 1);
}

/// Test that a bundle name climbing out of the sandbox root is refused
#[test]
fn test_traversing_bundle_name_stays_out_of_host() {
    let tmp = tempfile::tempdir().unwrap();
    let mounter = Arc::new(RecordingMounter::new());
    let config = SandboxConfig {
        sandbox_root: Some(
            tmp.path()
                .join("sandbox/<currentUserId>/<PackageName>")
                .display()
                .to_string(),
        ),
        mounts: vec![SandboxMountConfig::bind("/data/app/<PackageName>", "/data/storage")],
        ..Default::default()
    };
    let engine = SandboxEngine::new(config, Box::new(mounter.clone())).with_ownership(false);
    let content = plain_content().with_sandbox(SandboxSetup {
        engine,
        enter_namespaces: false,
    });
    let (mut mgr, forker, _) = simulated(content);
    modules::sandbox::register(mgr.hooks_mut()).unwrap();

    for msg in [
        SpawnRequest::new("../../escaped").uid(20010001),
        SpawnRequest::new("com.example.app")
            .uid(20010001)
            .bundle("../../escaped", 0),
    ] {
        let msg = msg.build(&registry()).unwrap();
        let buf = appspawn_msg::encode(&msg);
        let reply = mgr.handle_request(&buf);
        assert_eq!(reply.failure_code(), Some(FailureCode::DecodeFailed));

        let reply = mgr.handle_message(msg);
        assert_eq!(reply.failure_code(), Some(FailureCode::DecodeFailed));
    }
    assert!(!tmp.path().join("escaped").exists());
    assert!(forker.exits().is_empty());
    assert!(mounter.mounts().is_empty());
}

/// Test that non-critical mount failures in the child reach the parent's record
#[test]
fn test_mount_failures_reach_parent() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("sandbox/com.example.app");
    let mounter = Arc::new(RecordingMounter::new().fail_on(root.join("data/broken")));
    let config = SandboxConfig {
        sandbox_root: Some(tmp.path().join("sandbox/<PackageName>").display().to_string()),
        mounts: vec![
            SandboxMountConfig::bind("/data/app", "/data/broken"),
            SandboxMountConfig::bind("/data/app", "/data/storage"),
        ],
        ..Default::default()
    };
    let engine = SandboxEngine::new(config, Box::new(mounter.clone())).with_ownership(false);
    let content = plain_content().with_sandbox(SandboxSetup {
        engine,
        enter_namespaces: false,
    });
    let (mut mgr, _, entry) = simulated(content);
    modules::sandbox::register(mgr.hooks_mut()).unwrap();

    let reply = mgr.handle_message(SpawnMessage::new(MsgType::Spawn, "com.example.app"));
    assert!(reply.is_success(), "reply {}", reply);
    assert_eq!(entry.runs().len(), 1);

    let process = mgr.store().find_by_pid(reply.value() as i32).unwrap();
    assert_eq!(process.mount_failures.len(), 1);
    assert!(process.mount_failures[0].starts_with("/data/broken: "));
    assert!(
        mgr.dump()
            .iter()
            .any(|line| line.contains("mount failures 1"))
    );
}

/// Test that a child-side abort stops later child stages and fails the request
#[test]
fn test_child_abort_skips_completed() {
    let (mut mgr, forker, entry) = simulated(plain_content());
    let trace = Rc::new(RefCell::new(Vec::new()));
    trace_hook(&mut mgr, HookStage::SpawnClearEnv, &trace);
    trace_hook(&mut mgr, HookStage::SpawnCompleted, &trace);
    trace_hook(&mut mgr, HookStage::SpawnPost, &trace);
    mgr.hooks_mut()
        .spawn
        .register(
            HookStage::SpawnSetChildProperty,
            PRIO_COMMON,
            "refuse",
            |_, _| {
                Err(SpawnError::Hook {
                    code: 77,
                    reason: "refuse".into(),
                })
            },
        )
        .unwrap();

    let reply = mgr.handle_message(SpawnMessage::new(MsgType::Spawn, "app"));
    assert_eq!(reply.failure_code(), Some(FailureCode::SpawnFailed));
    assert_eq!(*trace.borrow(), vec![HookStage::SpawnClearEnv]);
    assert!(entry.runs().is_empty());
    assert_eq!(forker.exits()[0].1, 77);
    assert_eq!(mgr.store().live_count(), 0);
    assert_eq!(mgr.store().spawning_count(), 0);
}

/// Test the stage order of a successful spawn and the lifecycle hooks
#[test]
fn test_stage_order_and_lifecycle() {
    let (mut mgr, _, _) = simulated(plain_content());
    let trace = Rc::new(RefCell::new(Vec::new()));
    for stage in [
        HookStage::SpawnPrepare,
        HookStage::SpawnClearEnv,
        HookStage::SpawnSetChildProperty,
        HookStage::SpawnCompleted,
        HookStage::SpawnPost,
    ] {
        trace_hook(&mut mgr, stage, &trace);
    }
    let lifecycle = Rc::new(RefCell::new(Vec::new()));
    for stage in [HookStage::AppAdd, HookStage::AppDied] {
        let lifecycle = Rc::clone(&lifecycle);
        mgr.hooks_mut()
            .process
            .register(stage, PRIO_COMMON, "lifecycle", move |_, p| {
                lifecycle.borrow_mut().push((stage, p.pid));
                Ok(())
            })
            .unwrap();
    }

    let pid = mgr
        .handle_message(SpawnMessage::new(MsgType::Spawn, "app"))
        .value() as i32;
    assert_eq!(
        *trace.borrow(),
        vec![
            HookStage::SpawnPrepare,
            HookStage::SpawnClearEnv,
            HookStage::SpawnSetChildProperty,
            HookStage::SpawnCompleted,
            HookStage::SpawnPost,
        ]
    );

    assert!(mgr.store().find_by_pid(pid).is_some());
    mgr.on_child_exit(pid, 0);
    assert!(mgr.store().find_by_pid(pid).is_none());
    mgr.on_child_exit(pid, 0);
    assert_eq!(
        *lifecycle.borrow(),
        vec![(HookStage::AppAdd, pid), (HookStage::AppDied, pid)]
    );
}

/// Test that a parent-side post hook failure fails the request
#[test]
fn test_post_abort_fails_request() {
    let (mut mgr, _, entry) = simulated(plain_content());
    mgr.hooks_mut()
        .spawn
        .register(HookStage::SpawnPost, PRIO_COMMON, "post", |_, ctx| {
            Err(SpawnError::Setup(format!("rejecting {}", ctx.process_name())))
        })
        .unwrap();

    let reply = mgr.handle_message(SpawnMessage::new(MsgType::Spawn, "app"));
    assert_eq!(reply.failure_code(), Some(FailureCode::SpawnFailed));
    assert_eq!(entry.runs().len(), 1);
    assert_eq!(mgr.store().live_count(), 0);
}

/// Test that a child which never reports times out
#[test]
fn test_readiness_timeout_kills_child() {
    let _guard = fork_guard();
    let config = DaemonConfig {
        child_ready_timeout_ms: 100,
        ..Default::default()
    };
    let content = AppSpawnContent::with_caps(config, caps());
    let mut mgr = AppSpawnMgr::new(content)
        .with_forker(SystemForker)
        .with_entry(RecordingEntry::new(0));
    mgr.hooks_mut()
        .spawn
        .register(HookStage::SpawnCompleted, PRIO_COMMON, "stall", |_, _| {
            std::thread::sleep(Duration::from_secs(30));
            Ok(())
        })
        .unwrap();

    let reply = mgr.handle_message(SpawnMessage::new(MsgType::Spawn, "slow"));
    assert_eq!(reply.failure_code(), Some(FailureCode::Timeout));
    assert_eq!(mgr.store().live_count(), 0);

    // the killed child is reaped but was never tracked
    let deadline = Instant::now() + Duration::from_secs(5);
    while mgr.reap_children() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(mgr.store().died().count(), 0);
}

/// Test a real fork and exec, its death notification and status query
#[test]
fn test_real_spawn_and_status() {
    if !Path::new("/bin/true").exists() {
        return;
    }
    let _guard = fork_guard();
    let config = DaemonConfig {
        default_entry: vec!["/bin/true".into()],
        ..Default::default()
    };
    let mut mgr = AppSpawnMgr::new(AppSpawnContent::with_caps(config, caps()));
    modules::env::register(mgr.hooks_mut()).unwrap();

    let reply = mgr.handle_message(SpawnMessage::new(MsgType::SpawnNative, "true"));
    assert!(reply.is_success(), "reply {}", reply);
    let pid = reply.value() as i32;
    assert_eq!(mgr.store().find_by_name("true").unwrap().pid, pid);

    let deadline = Instant::now() + Duration::from_secs(5);
    while mgr.store().find_by_pid(pid).is_some() && Instant::now() < deadline {
        mgr.reap_children();
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(mgr.store().find_by_pid(pid).is_none());

    let status = mgr.handle_message(SpawnMessage::termination(pid));
    assert_eq!(status.value(), 0);
}

/// Test that terminating a live child kills and reaps it
#[test]
fn test_termination_of_live_child() {
    let _guard = fork_guard();
    let mut mgr = AppSpawnMgr::new(AppSpawnContent::with_caps(DaemonConfig::default(), caps()));

    // no argv: the child waits for signals
    let pid = mgr
        .handle_message(SpawnMessage::new(MsgType::SpawnNative, "idle"))
        .value() as i32;
    assert!(pid > 0);

    let reply = mgr.handle_message(SpawnMessage::termination(pid));
    assert_eq!(reply.value(), 128 + libc::SIGKILL as i64);
    assert!(mgr.store().find_by_pid(pid).is_none());
}
