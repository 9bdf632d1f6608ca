//! Staged hook pipeline
//!
//! Callbacks are registered per stage with a priority; lower priorities run
//! first and equal priorities keep their registration order. Registration is
//! expected to finish before the daemon starts serving: the registry takes
//! `&mut self` to register and `&self` to dispatch, and performs no locking.

use std::fmt;
use std::time::Instant;

use crate::error::{Result, SpawnError};

pub type Priority = i32;

pub const PRIO_HIGHEST: Priority = 1000;
pub const PRIO_COMMON: Priority = 2000;
pub const PRIO_SANDBOX: Priority = 3000;
pub const PRIO_PROPERTY: Priority = 4000;
pub const PRIO_LOWEST: Priority = 5000;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookStage {
    /// Once at startup, before any request is accepted
    Preload,
    /// Parent, before fork
    SpawnPrepare,
    /// Child, immediately after fork
    SpawnClearEnv,
    /// Child: identity, namespaces, sandbox
    SpawnSetChildProperty,
    /// Child, last step before the entry runs
    SpawnCompleted,
    /// Parent, after fork returned a pid
    SpawnPost,
    /// Parent, a spawned process was recorded
    AppAdd,
    /// Parent, a spawned process was reaped
    AppDied,
    /// Once when the daemon stops serving
    ServerExit,
}

/// Which context a stage's callbacks receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Daemon-wide stages, no request in flight
    Server,
    /// Stages of a single spawn request
    Spawn,
    /// Lifecycle notifications about a spawned process
    Process,
}

impl HookStage {
    pub const ALL: [HookStage; 9] = [
        HookStage::Preload,
        HookStage::SpawnPrepare,
        HookStage::SpawnClearEnv,
        HookStage::SpawnSetChildProperty,
        HookStage::SpawnCompleted,
        HookStage::SpawnPost,
        HookStage::AppAdd,
        HookStage::AppDied,
        HookStage::ServerExit,
    ];

    pub fn kind(self) -> StageKind {
        match self {
            HookStage::Preload | HookStage::ServerExit => StageKind::Server,
            HookStage::AppAdd | HookStage::AppDied => StageKind::Process,
            _ => StageKind::Spawn,
        }
    }

    /// Whether callbacks of this stage run in the forked child
    pub fn runs_in_child(self) -> bool {
        matches!(
            self,
            HookStage::SpawnClearEnv | HookStage::SpawnSetChildProperty | HookStage::SpawnCompleted
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            HookStage::Preload => "preload",
            HookStage::SpawnPrepare => "spawn-prepare",
            HookStage::SpawnClearEnv => "spawn-clear-env",
            HookStage::SpawnSetChildProperty => "spawn-set-child-property",
            HookStage::SpawnCompleted => "spawn-completed",
            HookStage::SpawnPost => "spawn-post",
            HookStage::AppAdd => "app-add",
            HookStage::AppDied => "app-died",
            HookStage::ServerExit => "server-exit",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Callback<S, C> = Box<dyn Fn(&S, &mut C) -> Result<()>>;

struct HookEntry<S, C> {
    name: String,
    priority: Priority,
    callback: Callback<S, C>,
}

/// Hooks of one stage kind, receiving shared state `S` and a context `C`
pub struct HookRegistry<S, C> {
    kind: StageKind,
    stages: Vec<Vec<HookEntry<S, C>>>,
}

impl<S, C> HookRegistry<S, C> {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            stages: (0..HookStage::ALL.len()).map(|_| Vec::new()).collect(),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Register `callback` at `stage`
    ///
    /// Fails if the stage belongs to a different kind than this registry.
    pub fn register<F>(
        &mut self,
        stage: HookStage,
        priority: Priority,
        name: impl Into<String>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&S, &mut C) -> Result<()> + 'static,
    {
        if stage.kind() != self.kind {
            return Err(SpawnError::InvalidArgument(format!(
                "stage {} cannot be registered in a {:?} registry",
                stage, self.kind
            )));
        }
        let name = name.into();
        log::debug!("register hook {} at {} prio {}", name, stage, priority);
        let hooks = &mut self.stages[stage.slot()];
        let at = hooks.partition_point(|h| h.priority <= priority);
        hooks.insert(
            at,
            HookEntry {
                name,
                priority,
                callback: Box::new(callback),
            },
        );
        Ok(())
    }

    pub fn len(&self, stage: HookStage) -> usize {
        self.stages[stage.slot()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(|s| s.is_empty())
    }

    /// Hook names at `stage`, in dispatch order
    pub fn names(&self, stage: HookStage) -> Vec<&str> {
        self.stages[stage.slot()]
            .iter()
            .map(|h| h.name.as_str())
            .collect()
    }

    /// Run every hook at `stage` in order, stopping at the first failure
    pub fn dispatch(&self, stage: HookStage, state: &S, ctx: &mut C) -> Result<()> {
        for hook in &self.stages[stage.slot()] {
            let start = Instant::now();
            let result = (hook.callback)(state, ctx);
            log::debug!(
                "hook {} at {} took {:?}",
                hook.name,
                stage,
                start.elapsed()
            );
            if let Err(err) = result {
                log::error!("hook {} at {} failed: {}", hook.name, stage, err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run every hook at `stage`, logging failures instead of stopping
    ///
    /// Returns the number of hooks that failed.
    pub fn notify(&self, stage: HookStage, state: &S, ctx: &mut C) -> usize {
        let mut failed = 0;
        for hook in &self.stages[stage.slot()] {
            if let Err(err) = (hook.callback)(state, ctx) {
                log::warn!("hook {} at {} failed: {}", hook.name, stage, err);
                failed += 1;
            }
        }
        failed
    }
}

impl<S, C> fmt::Debug for HookRegistry<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for stage in HookStage::ALL {
            let names = self.names(stage);
            if !names.is_empty() {
                list.entry(&stage.name(), &names);
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Trace = Vec<&'static str>;

    fn push(tag: &'static str) -> impl Fn(&(), &mut Trace) -> Result<()> {
        move |_, trace: &mut Trace| {
            trace.push(tag);
            Ok(())
        }
    }

    #[test]
    fn priority_then_insertion_order() {
        let mut hooks: HookRegistry<(), Trace> = HookRegistry::new(StageKind::Spawn);
        hooks.register(HookStage::SpawnPrepare, 1, "a", push("A")).unwrap();
        hooks.register(HookStage::SpawnPrepare, 5, "b", push("B")).unwrap();
        hooks.register(HookStage::SpawnPrepare, 1, "c", push("C")).unwrap();

        let mut trace = Vec::new();
        hooks.dispatch(HookStage::SpawnPrepare, &(), &mut trace).unwrap();
        assert_eq!(trace, vec!["A", "C", "B"]);
        assert_eq!(hooks.names(HookStage::SpawnPrepare), vec!["a", "c", "b"]);
    }

    #[test]
    fn failure_stops_the_stage() {
        let mut hooks: HookRegistry<(), Trace> = HookRegistry::new(StageKind::Spawn);
        hooks.register(HookStage::SpawnPost, 1, "first", push("1")).unwrap();
        hooks
            .register(HookStage::SpawnPost, 2, "fails", |_, _: &mut Trace| {
                Err(SpawnError::Hook {
                    code: 7,
                    reason: "fails".into(),
                })
            })
            .unwrap();
        hooks.register(HookStage::SpawnPost, 3, "never", push("3")).unwrap();

        let mut trace = Vec::new();
        let err = hooks
            .dispatch(HookStage::SpawnPost, &(), &mut trace)
            .unwrap_err();
        assert_eq!(err.code(), 7);
        assert_eq!(trace, vec!["1"]);
    }

    #[test]
    fn notify_runs_every_hook() {
        let mut hooks: HookRegistry<(), Trace> = HookRegistry::new(StageKind::Process);
        hooks
            .register(HookStage::AppDied, 1, "fails", |_, _: &mut Trace| {
                Err(SpawnError::Setup("boom".into()))
            })
            .unwrap();
        hooks.register(HookStage::AppDied, 2, "runs", push("ran")).unwrap();

        let mut trace = Vec::new();
        assert_eq!(hooks.notify(HookStage::AppDied, &(), &mut trace), 1);
        assert_eq!(trace, vec!["ran"]);
    }

    #[test]
    fn stage_kind_is_enforced() {
        let mut hooks: HookRegistry<(), Trace> = HookRegistry::new(StageKind::Server);
        assert!(hooks.register(HookStage::SpawnPrepare, 1, "x", push("x")).is_err());
        assert!(hooks.register(HookStage::Preload, 1, "x", push("x")).is_ok());
        assert_eq!(hooks.len(HookStage::Preload), 1);
    }

    #[test]
    fn empty_stage_dispatches_ok() {
        let hooks: HookRegistry<(), Trace> = HookRegistry::new(StageKind::Spawn);
        let mut trace = Vec::new();
        assert!(hooks.dispatch(HookStage::SpawnCompleted, &(), &mut trace).is_ok());
        assert!(hooks.is_empty());
    }

    #[test]
    fn stages_are_ordered() {
        assert!(HookStage::SpawnPrepare < HookStage::SpawnClearEnv);
        assert!(HookStage::SpawnSetChildProperty < HookStage::SpawnCompleted);
        assert!(HookStage::SpawnCompleted.runs_in_child());
        assert!(!HookStage::SpawnPost.runs_in_child());
    }
}
