//! Task manager — owns the registries, arms triggers, runs tasks and walks
//! task sets forward.
//!
//! Every timer callback holds only a weak reference to the manager plus the
//! address of its task. All bookkeeping happens under one registry lock;
//! nested work (DO_NOW links, set advancement, fallbacks) receives the
//! already-locked registry instead of locking again.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Local;
use dasgate_core::GatewayConfig;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::AbortHandle;

use crate::clock;
use crate::dispatch::{Confirmation, Delivery, Dispatcher, ManagerCommand, Sinks};
use crate::error::TaskError;
use crate::loader::TaskFile;
use crate::requirement::{ActiveIssues, DataProviding, RequirementEvaluator};
use crate::tasks::{Execution, LinkType, OutputKind, Suppression, Task, TaskRef};
use crate::taskset::{FailureTarget, RunType, TaskSet};
use crate::template;
use crate::timer::{ScheduledHandle, TimerPool};
use crate::trigger::{Armed, FireContext, TriggerPolicy, Verdict};

const DISABLE_FOR: Duration = Duration::from_secs(24 * 3600);
/// Minimum distance between a CLOCK firing and its next occurrence.
const CLOCK_GAP: Duration = Duration::from_secs(1);

/// Manager knobs, usually taken from the gateway config.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub id: String,
    pub tasks_file: Option<PathBuf>,
    pub start_on_load: bool,
    /// Period of the interval recheck sweep.
    pub recheck: Option<Duration>,
    pub restore_first: Duration,
    pub restore_again: Duration,
    /// Recipient for operator alerts.
    pub admin: String,
}

impl ManagerSettings {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tasks_file: None,
            start_on_load: true,
            recheck: None,
            restore_first: Duration::from_secs(15),
            restore_again: Duration::from_secs(10),
            admin: "admin".into(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let tasks = &config.tasks;
        Self {
            id: tasks.id.clone(),
            tasks_file: Some(config.tasks_file()),
            start_on_load: tasks.start_on_load,
            recheck: (tasks.recheck_secs > 0).then(|| Duration::from_secs(tasks.recheck_secs)),
            restore_first: Duration::from_secs(tasks.restore_first_secs),
            restore_again: Duration::from_secs(tasks.restore_again_secs),
            admin: config.alerts.admin.clone(),
        }
    }
}

/// Tasks already executing on the current call chain, and sets started on it.
#[derive(Debug, Default)]
struct ExecChain {
    running: HashSet<TaskRef>,
    started_sets: HashSet<String>,
}

impl ExecChain {
    fn enter(&mut self, key: &TaskRef) -> bool {
        self.running.insert(key.clone())
    }

    fn leave(&mut self, key: &TaskRef) {
        self.running.remove(key);
    }
}

/// Result of asking a set to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetStart {
    NotFound,
    Empty,
    Unmet(String),
    Started,
    /// MANUAL sets never start as a whole.
    Manual,
    /// Already started on this call chain.
    Looping,
}

/// Registry of everything the manager owns.
pub(crate) struct Registry {
    pub(crate) sets: Vec<TaskSet>,
    pub(crate) tasks: Vec<Task>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) restore_queue: Vec<String>,
    restore_watch: Option<AbortHandle>,
    recheck: Option<ScheduledHandle>,
    listener: Option<AbortHandle>,
}

impl Registry {
    pub(crate) fn set(&self, id: &str) -> Option<&TaskSet> {
        self.sets.iter().find(|s| s.id == id)
    }

    fn set_mut(&mut self, id: &str) -> Option<&mut TaskSet> {
        self.sets.iter_mut().find(|s| s.id == id)
    }

    pub(crate) fn task(&self, key: &TaskRef) -> Option<&Task> {
        match key {
            TaskRef::Standalone(id) => self.tasks.iter().find(|t| &t.id == id),
            TaskRef::Member { set, index } => self.set(set).and_then(|s| s.tasks.get(*index)),
        }
    }

    fn task_mut(&mut self, key: &TaskRef) -> Option<&mut Task> {
        match key {
            TaskRef::Standalone(id) => self.tasks.iter_mut().find(|t| &t.id == id),
            TaskRef::Member { set, index } => {
                self.set_mut(set).and_then(|s| s.tasks.get_mut(*index))
            }
        }
    }

    /// Standalone tasks first, then set members.
    fn resolve(&self, id: &str) -> Option<TaskRef> {
        if self.tasks.iter().any(|t| t.id == id) {
            return Some(TaskRef::Standalone(id.to_string()));
        }
        self.sets.iter().find_map(|s| {
            s.position(id).map(|index| TaskRef::member(&s.id, index))
        })
    }

    fn run_type(&self, key: &TaskRef) -> Option<RunType> {
        key.set_id().and_then(|id| self.set(id)).map(|s| s.run_type)
    }

    /// Cancel every future and forget every task.
    fn clear(&mut self) -> usize {
        let mut cancelled = 0;
        for task in &mut self.tasks {
            cancelled += usize::from(task.is_armed());
            task.shutdown();
        }
        for set in &mut self.sets {
            cancelled += set.stop();
            set.tasks.iter_mut().for_each(Task::shutdown);
        }
        self.tasks.clear();
        self.sets.clear();
        cancelled
    }
}

/// Builder for [`TaskManager`].
pub struct TaskManagerBuilder {
    settings: ManagerSettings,
    store: Option<Arc<dyn DataProviding>>,
    issues: Option<Arc<dyn ActiveIssues>>,
    sinks: Sinks,
}

impl TaskManagerBuilder {
    pub fn store(mut self, store: Arc<dyn DataProviding>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn issues(mut self, issues: Arc<dyn ActiveIssues>) -> Self {
        self.issues = Some(issues);
        self
    }

    pub fn sinks(mut self, sinks: Sinks) -> Self {
        self.sinks = sinks;
        self
    }

    /// Create the manager and start its confirmation listener and recheck sweep.
    pub fn build(self, pool: TimerPool) -> Arc<TaskManager> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Confirmation>();
        let settings = self.settings;
        let dispatcher = Dispatcher::new(&settings.id, self.sinks, &settings.admin);
        let evaluator = RequirementEvaluator::new(self.store, self.issues);
        let manager = Arc::new_cyclic(|me| TaskManager {
            id: settings.id.clone(),
            me: me.clone(),
            pool: pool.clone(),
            evaluator,
            confirm_tx: tx,
            registry: Mutex::new(Registry {
                sets: Vec::new(),
                tasks: Vec::new(),
                dispatcher,
                restore_queue: Vec::new(),
                restore_watch: None,
                recheck: None,
                listener: None,
            }),
            settings,
        });

        let weak = Arc::downgrade(&manager);
        let listener = pool.spawn(async move {
            while let Some(confirmation) = rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.confirm(confirmation);
            }
        });

        let recheck = manager.settings.recheck.and_then(|every| {
            let weak = Arc::downgrade(&manager);
            pool.schedule_at_fixed_rate(every, every, move || {
                if let Some(manager) = weak.upgrade() {
                    manager.recheck_interval_tasks();
                }
            })
            .map_err(|e| tracing::error!("[{}] ❌ Recheck sweep not started: {e}", manager.id))
            .ok()
        });

        {
            let mut reg = manager.lock();
            reg.listener = Some(listener);
            reg.recheck = recheck;
        }
        tracing::info!("[{}] ⏰ Task manager ready", manager.id);
        manager
    }
}

/// The task manager.
pub struct TaskManager {
    id: String,
    me: Weak<TaskManager>,
    pool: TimerPool,
    evaluator: RequirementEvaluator,
    confirm_tx: UnboundedSender<Confirmation>,
    registry: Mutex<Registry>,
    settings: ManagerSettings,
}

impl TaskManager {
    pub fn builder(settings: ManagerSettings) -> TaskManagerBuilder {
        TaskManagerBuilder {
            settings,
            store: None,
            issues: None,
            sinks: Sinks::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            tracing::error!("[{}] ❌ Registry lock was poisoned, recovering", self.id);
            poisoned.into_inner()
        })
    }

    // ── Loading ────────────────────────────────────────────

    /// Reload the task file unless a non-interruptable set is running.
    pub fn reload_tasks(&self) -> bool {
        self.reload(false)
    }

    /// Reload the task file, stopping whatever runs.
    pub fn force_reload_tasks(&self) -> bool {
        self.reload(true)
    }

    fn reload(&self, force: bool) -> bool {
        let Some(path) = self.settings.tasks_file.clone() else {
            tracing::warn!("[{}] ⚠️ No task file configured", self.id);
            return false;
        };
        let mut reg = self.lock();
        if !force
            && let Some(busy) = reg.sets.iter().find(|s| s.active && !s.interruptable)
        {
            tracing::warn!(
                "[{}] ⚠️ Reload refused, taskset '{}' is running and not interruptable",
                self.id,
                busy.id
            );
            return false;
        }
        let file = match TaskFile::load(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("[{}] ❌ Reload failed: {e}", self.id);
                return false;
            }
        };
        let count = self.install(&mut reg, &file, path.parent());
        tracing::info!(
            "[{}] 🔄 Reloaded {count} tasks from {}",
            self.id,
            path.display()
        );
        true
    }

    /// Replace everything with the contents of `file`. Returns the task count.
    pub fn load_tasks(&self, file: &TaskFile, base_dir: Option<&Path>) -> usize {
        let mut reg = self.lock();
        self.install(&mut reg, file, base_dir)
    }

    fn install(&self, reg: &mut Registry, file: &TaskFile, base_dir: Option<&Path>) -> usize {
        let cancelled = reg.clear();
        if cancelled > 0 {
            tracing::debug!("[{}] Cancelled {cancelled} futures before loading", self.id);
        }
        if let Some(dir) = base_dir {
            reg.dispatcher.set_base_dir(dir);
        }
        let (sets, tasks) = file.build(&self.id);
        let count = tasks.len() + sets.iter().map(|s| s.tasks.len()).sum::<usize>();
        reg.sets = sets;
        reg.tasks = tasks;
        if self.settings.start_on_load {
            let auto: Vec<TaskRef> = reg
                .tasks
                .iter()
                .filter(|t| t.enable_on_start)
                .map(|t| TaskRef::Standalone(t.id.clone()))
                .collect();
            for key in auto {
                self.arm(reg, &key, &mut ExecChain::default());
            }
        }
        count
    }

    /// Add a standalone task, arming it when it is enabled on start.
    pub fn add_task(&self, task: Task) -> bool {
        let mut reg = self.lock();
        if reg.resolve(&task.id).is_some() {
            tracing::warn!("[{}] ⚠️ Task '{}' already exists", self.id, task.id);
            return false;
        }
        tracing::info!("[{}] 📅 Task added: '{}' ({})", self.id, task.name, task.trigger);
        let key = TaskRef::Standalone(task.id.clone());
        let arm = task.enable_on_start;
        reg.tasks.push(task);
        if arm {
            self.arm(&mut reg, &key, &mut ExecChain::default());
        }
        true
    }

    pub fn add_taskset(&self, set: TaskSet) -> bool {
        let mut reg = self.lock();
        if reg.set(&set.id).is_some() {
            tracing::warn!("[{}] ⚠️ Taskset '{}' already exists", self.id, set.id);
            return false;
        }
        tracing::info!("[{}] 📅 Taskset added: '{}' ({})", self.id, set.id, set.run_type);
        reg.sets.push(set);
        true
    }

    /// Append a member to a set. Returns its index.
    pub fn add_task_to_set(&self, set_id: &str, task: Task) -> Option<usize> {
        let mut reg = self.lock();
        let set = reg.set_mut(set_id)?;
        Some(set.add_task(task))
    }

    // ── Starting & stopping ────────────────────────────────

    /// Arm (or, for keyword tasks, run) a task by id.
    pub fn start_task(&self, id: &str) -> bool {
        let mut reg = self.lock();
        self.start_task_in(&mut reg, id, &mut ExecChain::default())
    }

    fn start_task_in(&self, reg: &mut Registry, id: &str, chain: &mut ExecChain) -> bool {
        let Some(key) = reg.resolve(id) else {
            tracing::warn!("[{}] ⚠️ No such task '{id}'", self.id);
            return false;
        };
        let keyword = reg
            .task(&key)
            .is_some_and(|t| matches!(t.trigger, TriggerPolicy::Keyword { .. }));
        if keyword {
            if let Some(task) = reg.task_mut(&key) {
                task.runtime.enabled = true;
            }
            self.fire(reg, &key, chain);
            return true;
        }
        self.arm(reg, &key, chain)
    }

    /// Cancel a task's future. Returns whether one was live.
    pub fn cancel_task(&self, id: &str) -> bool {
        let mut reg = self.lock();
        let Some(key) = reg.resolve(id) else {
            return false;
        };
        match reg.task_mut(&key) {
            Some(task) => {
                task.runtime.enabled = false;
                let live = task.cancel();
                tracing::info!("[{}] 🛑 Cancelled task '{id}'", self.id);
                live
            }
            None => false,
        }
    }

    /// Start a set; the answer is meant for humans.
    pub fn start_taskset(&self, id: &str) -> String {
        let mut reg = self.lock();
        let result = self.start_set_in(&mut reg, id, &mut ExecChain::default());
        describe_start(id, &result)
    }

    fn start_set_in(&self, reg: &mut Registry, id: &str, chain: &mut ExecChain) -> SetStart {
        let Some(set) = reg.set(id) else {
            return SetStart::NotFound;
        };
        if set.tasks.is_empty() {
            return SetStart::Empty;
        }
        if set.run_type == RunType::Manual {
            return SetStart::Manual;
        }
        match self.evaluator.evaluate(&set.req) {
            Ok(true) => {}
            Ok(false) => return SetStart::Unmet(set.req.clone()),
            Err(e) => {
                tracing::warn!("[{}] ⚠️ Requirement of '{id}' failed: {e}", self.id);
                return SetStart::Unmet(set.req.clone());
            }
        }
        if !chain.started_sets.insert(id.to_string()) {
            tracing::warn!("[{}] ⚠️ Taskset '{id}' restarted itself, stopping the loop", self.id);
            return SetStart::Looping;
        }
        let Some(set) = reg.set_mut(id) else {
            return SetStart::NotFound;
        };
        if set.active {
            set.stop();
        }
        set.active = true;
        let run_type = set.run_type;
        let members = set.tasks.len();
        tracing::info!("[{}] ▶️ Starting taskset '{id}' ({run_type}, {members} tasks)", self.id);
        match run_type {
            RunType::Sequential => self.arm_step(reg, id, 0, chain),
            _ => {
                for index in 0..members {
                    self.arm(reg, &TaskRef::member(id, index), chain);
                }
                self.finish_if_idle(reg, id);
            }
        }
        SetStart::Started
    }

    /// Run one member of a set, typically a MANUAL one.
    pub fn start_member(&self, set_id: &str, task_id: &str) -> bool {
        let mut reg = self.lock();
        self.start_member_in(&mut reg, set_id, task_id, &mut ExecChain::default())
    }

    fn start_member_in(
        &self,
        reg: &mut Registry,
        set_id: &str,
        task_id: &str,
        chain: &mut ExecChain,
    ) -> bool {
        let index = reg
            .set(set_id)
            .and_then(|s| s.position(task_id).or_else(|| task_id.parse().ok()))
            .filter(|i| reg.set(set_id).is_some_and(|s| *i < s.tasks.len()));
        match index {
            Some(index) => self.arm(reg, &TaskRef::member(set_id, index), chain),
            None => {
                tracing::warn!("[{}] ⚠️ No task '{task_id}' in set '{set_id}'", self.id);
                false
            }
        }
    }

    /// Stop a set. Returns the number of live futures cancelled.
    pub fn stop_taskset(&self, id: &str) -> Option<usize> {
        let mut reg = self.lock();
        self.stop_set_in(&mut reg, id)
    }

    fn stop_set_in(&self, reg: &mut Registry, id: &str) -> Option<usize> {
        let set = reg.set_mut(id)?;
        let cancelled = set.stop();
        tracing::info!("[{}] ⏹️ Stopped taskset '{id}' ({cancelled} cancelled)", self.id);
        Some(cancelled)
    }

    /// Cancel every task and set. Returns the number of live futures cancelled.
    pub fn stop_all(&self, reason: &str) -> usize {
        let mut reg = self.lock();
        let mut cancelled = 0;
        for task in &mut reg.tasks {
            task.runtime.enabled = false;
            cancelled += usize::from(task.cancel());
        }
        for set in &mut reg.sets {
            cancelled += set.stop();
        }
        tracing::info!("[{}] ⏹️ Stopped all tasks ({cancelled} cancelled): {reason}", self.id);
        cancelled
    }

    /// Stop everything, forget every task and end the background helpers.
    pub fn shutdown_and_clear_all(&self) {
        let mut reg = self.lock();
        let cancelled = reg.clear();
        reg.restore_queue.clear();
        for handle in [reg.restore_watch.take(), reg.listener.take()].into_iter().flatten() {
            handle.abort();
        }
        if let Some(recheck) = reg.recheck.take() {
            recheck.cancel();
        }
        tracing::info!("[{}] 🧹 Shut down, {cancelled} futures cancelled", self.id);
    }

    /// Run every keyword task listening for `keyword`. Returns how many ran.
    pub fn start_keyword_task(&self, keyword: &str) -> usize {
        let mut reg = self.lock();
        let listens = |t: &Task| {
            matches!(&t.trigger, TriggerPolicy::Keyword { keyword: k } if k.eq_ignore_ascii_case(keyword))
        };
        let mut keys: Vec<TaskRef> = reg
            .tasks
            .iter()
            .filter(|t| t.runtime.enabled && listens(t))
            .map(|t| TaskRef::Standalone(t.id.clone()))
            .collect();
        for set in reg.sets.iter().filter(|s| s.active) {
            for (index, task) in set.tasks.iter().enumerate() {
                let current = set.run_type != RunType::Sequential || set.cursor == index;
                if current && listens(task) {
                    keys.push(TaskRef::member(&set.id, index));
                }
            }
        }
        for key in &keys {
            self.fire(&mut reg, key, &mut ExecChain::default());
        }
        tracing::debug!("[{}] 🔑 Keyword '{keyword}' ran {} tasks", self.id, keys.len());
        keys.len()
    }

    // ── State ──────────────────────────────────────────────

    /// Set a state keyword. Returns whether the value changed.
    pub fn change_state(&self, key: &str, value: &str) -> bool {
        let Some(store) = self.evaluator.store() else {
            tracing::warn!("[{}] ⚠️ No data store for state '{key}'", self.id);
            return false;
        };
        let changed = store.set_text(key, value);
        if changed {
            tracing::info!("[{}] 🔀 State {key} -> {value}", self.id);
            self.recheck_interval_tasks();
        }
        changed
    }

    pub fn remove_state(&self, key: &str) -> bool {
        let removed = self.evaluator.store().is_some_and(|s| s.remove_text(key));
        if removed {
            self.recheck_interval_tasks();
        }
        removed
    }

    /// Evaluate a `key:value` gate; errors count as false.
    pub fn check_state(&self, when: &str) -> bool {
        self.evaluator.check_state(when).unwrap_or_else(|e| {
            tracing::warn!("[{}] ⚠️ State check '{when}' failed: {e}", self.id);
            false
        })
    }

    /// Arm enabled periodic tasks whose gate passes, cancel those whose gate fails.
    pub fn recheck_interval_tasks(&self) -> usize {
        let mut reg = self.lock();
        self.recheck_in(&mut reg)
    }

    fn recheck_in(&self, reg: &mut Registry) -> usize {
        let mut to_arm = Vec::new();
        for task in reg.tasks.iter_mut() {
            if !task.trigger.is_periodic() || !task.runtime.enabled {
                continue;
            }
            let gate = self.evaluator.check_state(&task.when).unwrap_or(false);
            let stream_down = task.output.kind == OutputKind::Stream
                && reg.restore_queue.contains(&task.output.reference);
            if gate && !task.is_armed() && stream_down {
                tracing::debug!("[{}] '{}' waits for its stream", self.id, task.id);
            } else if gate && !task.is_armed() {
                to_arm.push(TaskRef::Standalone(task.id.clone()));
            } else if !gate && task.is_armed() {
                task.cancel();
                tracing::debug!("[{}] 💤 '{}' paused, state gate closed", self.id, task.id);
            }
        }
        let mut armed = 0;
        for key in to_arm {
            if self.arm(reg, &key, &mut ExecChain::default()) {
                armed += 1;
            }
        }
        if armed > 0 {
            tracing::info!("[{}] 🔁 Recheck re-armed {armed} tasks", self.id);
        }
        armed
    }

    // ── Introspection ──────────────────────────────────────

    /// Sorted `id trigger` lines for every task with a live future.
    pub fn armed_tasks(&self) -> Vec<String> {
        let reg = self.lock();
        let standalone = reg.tasks.iter();
        let members = reg.sets.iter().flat_map(|s| s.tasks.iter());
        let mut armed: Vec<String> = standalone
            .chain(members)
            .filter(|t| t.is_armed())
            .map(|t| format!("{} {}", t.id, t.trigger))
            .collect();
        armed.sort();
        armed
    }

    // ── Confirmations ──────────────────────────────────────

    /// Outcome of a stream confirmation.
    pub fn confirm(&self, confirmation: Confirmation) {
        let mut reg = self.lock();
        let Confirmation { key, success } = confirmation;
        let TaskRef::Member { set, index } = &key else {
            tracing::info!("[{}] 📨 Reply for '{key}': {}", self.id, if success { "ok" } else { "failed" });
            return;
        };
        let waiting = reg
            .set(set)
            .is_some_and(|s| s.active && s.last_index_run == Some(*index));
        if !waiting {
            tracing::debug!("[{}] Ignoring stale reply for '{key}'", self.id);
            return;
        }
        if let Some(s) = reg.set_mut(set) {
            s.last_index_run = None;
        }
        let chain = &mut ExecChain::default();
        if success {
            tracing::info!("[{}] 📨 Reply confirmed for '{key}'", self.id);
            self.advance(&mut reg, set, *index, chain);
        } else {
            tracing::warn!("[{}] ⚠️ No valid reply for '{key}'", self.id);
            self.fail_set(&mut reg, set, chain);
        }
    }

    // ── Arming & firing ────────────────────────────────────

    fn job(&self, key: TaskRef, generation: u64) -> impl Fn() + Send + Sync + 'static {
        let me = self.me.clone();
        move || {
            if let Some(manager) = me.upgrade() {
                manager.on_timer(&key, generation);
            }
        }
    }

    /// Arm a task's trigger. Already armed tasks are left alone.
    fn arm(&self, reg: &mut Registry, key: &TaskRef, chain: &mut ExecChain) -> bool {
        let Some(task) = reg.task_mut(key) else {
            tracing::warn!("[{}] ⚠️ Cannot arm unknown task '{key}'", self.id);
            return false;
        };
        if task.is_armed() {
            tracing::debug!("[{}] '{}' is already armed", self.id, task.id);
            return false;
        }
        task.runtime.generation += 1;
        task.runtime.enabled = true;
        let job = self.job(key.clone(), task.runtime.generation);
        match task.trigger.arm(&self.pool, job) {
            Ok(Armed::Scheduled(handle)) => {
                tracing::debug!("[{}] ⏱️ Armed '{}' ({})", self.id, task.id, task.trigger);
                task.runtime.handle = Some(handle);
                true
            }
            Ok(Armed::Dormant) => true,
            Ok(Armed::Immediate) => {
                self.fire(reg, key, chain);
                true
            }
            Err(TaskError::Scheduling(reason)) if matches!(task.trigger, TriggerPolicy::Clock { .. }) => {
                let id = task.id.clone();
                self.alert(reg, &format!("Task '{id}' will never run"), &reason);
                false
            }
            Err(e) => {
                tracing::error!("[{}] ❌ Could not arm '{}': {e}", self.id, task.id);
                false
            }
        }
    }

    fn on_timer(&self, key: &TaskRef, generation: u64) {
        let mut reg = self.lock();
        let current = reg
            .task(key)
            .is_some_and(|t| t.runtime.generation == generation);
        if !current {
            tracing::debug!("[{}] Dropping stale firing of '{key}'", self.id);
            return;
        }
        self.fire(&mut reg, key, &mut ExecChain::default());
    }

    /// One firing: execute, then act on the trigger's verdict.
    fn fire(&self, reg: &mut Registry, key: &TaskRef, chain: &mut ExecChain) {
        let execution = self.execute(reg, key, chain);
        self.settle(reg, key, &execution, chain);
    }

    fn execute(&self, reg: &mut Registry, key: &TaskRef, chain: &mut ExecChain) -> Execution {
        if !chain.enter(key) {
            tracing::warn!("[{}] ⚠️ '{key}' is already running on this chain", self.id);
            return Execution::Refused;
        }
        let execution = self.execute_inner(reg, key, chain);
        chain.leave(key);
        execution
    }

    fn execute_inner(&self, reg: &mut Registry, key: &TaskRef, chain: &mut ExecChain) -> Execution {
        let Some(task) = reg.task_mut(key) else {
            return Execution::Failed(TaskError::NotFound(key.to_string()));
        };
        let pre = match self.evaluator.evaluate(&task.pre_req) {
            Ok(pre) => pre,
            Err(e) => {
                task.runtime.errors += 1;
                tracing::warn!("[{}] ⚠️ '{}' requirement failed: {e}", self.id, task.id);
                return Execution::Failed(e);
            }
        };
        if !task.runtime.do_today {
            return Execution::Suppressed(Suppression::NotToday);
        }
        match self.evaluator.check_state(&task.when) {
            Ok(true) => {}
            Ok(false) => return Execution::StateMismatch,
            Err(e) => {
                task.runtime.errors += 1;
                return Execution::Failed(e);
            }
        }
        if !pre {
            return Execution::Unmet;
        }
        if task.runtime.skip > 0 {
            task.runtime.skip -= 1;
            tracing::debug!("[{}] ⏭️ '{}' skipped once", self.id, task.id);
            return Execution::Suppressed(Suppression::SkipOne);
        }
        if task.trigger.is_check_only() {
            return Execution::Delivered {
                awaiting_reply: false,
            };
        }

        let value = task.value.trim().to_string();
        let output = task.output.clone();
        let link = task.link.clone();
        let delivery = if let Some(id) = value.strip_prefix("taskset:") {
            match self.start_set_in(reg, id.trim(), chain) {
                SetStart::Started => Ok(Delivery::Sent),
                other => Err(TaskError::Delivery(describe_start(id.trim(), &other))),
            }
        } else if let Some(id) = value.strip_prefix("task:") {
            if self.start_task_in(reg, id.trim(), chain) {
                Ok(Delivery::Sent)
            } else {
                Err(TaskError::NotFound(id.trim().to_string()))
            }
        } else {
            let store = self.evaluator.store().map(|s| s.as_ref());
            let payload = template::resolve(&value, store);
            reg.dispatcher.dispatch(key, &output, &payload, &self.confirm_tx)
        };

        let awaiting_reply = match delivery {
            Ok(Delivery::Sent) => false,
            Ok(Delivery::AwaitingReply) => true,
            Ok(Delivery::Manager(command)) => {
                if !self.run_command(reg, command, chain) {
                    return self.delivery_failed(reg, key, TaskError::Delivery(value));
                }
                false
            }
            Err(e) => return self.delivery_failed(reg, key, e),
        };
        if let Some(task) = reg.task_mut(key) {
            task.runtime.runs += 1;
            tracing::debug!("[{}] ✅ '{}' delivered to {}", self.id, task.id, output);
        }
        if link.is_active() {
            self.apply_links(reg, link.kind, &link.targets, chain);
        }
        Execution::Delivered { awaiting_reply }
    }

    fn delivery_failed(&self, reg: &mut Registry, key: &TaskRef, error: TaskError) -> Execution {
        if let Some(task) = reg.task_mut(key) {
            task.runtime.errors += 1;
        }
        tracing::warn!("[{}] ⚠️ '{key}' failed: {error}", self.id);
        Execution::Failed(error)
    }

    fn run_command(&self, reg: &mut Registry, command: ManagerCommand, chain: &mut ExecChain) -> bool {
        match command {
            ManagerCommand::RaiseFlag(id) => self
                .evaluator
                .store()
                .map(|s| s.raise_flag(&id))
                .is_some(),
            ManagerCommand::LowerFlag(id) => self
                .evaluator
                .store()
                .map(|s| s.lower_flag(&id))
                .is_some(),
            ManagerCommand::Start(set) => self.start_set_in(reg, &set, chain) == SetStart::Started,
            ManagerCommand::Stop(set) => self.stop_set_in(reg, &set).is_some(),
            ManagerCommand::RunMember { set, task } => self.start_member_in(reg, &set, &task, chain),
        }
    }

    fn apply_links(&self, reg: &mut Registry, kind: LinkType, targets: &[String], chain: &mut ExecChain) {
        for target in targets {
            let Some(key) = reg.resolve(target) else {
                tracing::warn!("[{}] ⚠️ Link target '{target}' not found", self.id);
                continue;
            };
            match kind {
                LinkType::None => {}
                LinkType::DoNow => {
                    let outcome = self.execute(reg, &key, chain);
                    tracing::debug!("[{}] 🔗 do-now '{key}': {}", self.id, outcome.label());
                }
                LinkType::SkipOne => {
                    if let Some(task) = reg.task_mut(&key) {
                        task.runtime.skip = 1;
                    }
                }
                LinkType::Disable24h | LinkType::NotToday => {
                    let wait = if kind == LinkType::Disable24h {
                        DISABLE_FOR
                    } else {
                        clock::until_midnight(Local::now().naive_local())
                    };
                    let me = self.me.clone();
                    let restore_key = key.clone();
                    let restore = self.pool.schedule(wait, move || {
                        if let Some(manager) = me.upgrade() {
                            manager.restore_eligibility(&restore_key);
                        }
                    });
                    if let Some(task) = reg.task_mut(&key) {
                        task.runtime.do_today = false;
                        if let Some(old) = task.runtime.restore.replace(restore) {
                            old.cancel();
                        }
                        tracing::info!(
                            "[{}] 🔕 '{}' disabled for {}s",
                            self.id,
                            task.id,
                            wait.as_secs()
                        );
                    }
                }
            }
        }
    }

    fn restore_eligibility(&self, key: &TaskRef) {
        let mut reg = self.lock();
        if let Some(task) = reg.task_mut(key) {
            task.runtime.do_today = true;
            task.runtime.restore = None;
            tracing::info!("[{}] 🔔 '{}' eligible again", self.id, task.id);
        }
    }

    /// Act on the trigger's verdict for one execution.
    fn settle(&self, reg: &mut Registry, key: &TaskRef, execution: &Execution, chain: &mut ExecChain) {
        let run_type = reg.run_type(key);
        let sequential = run_type == Some(RunType::Sequential);
        let Some(task) = reg.task_mut(key) else {
            return;
        };

        if sequential && matches!(execution, Execution::Delivered { awaiting_reply: true }) {
            task.cancel();
            if let TaskRef::Member { set, index } = key
                && let Some(set) = reg.set_mut(set)
            {
                set.last_index_run = Some(*index);
            }
            tracing::info!("[{}] ⏳ '{key}' waiting for reply", self.id);
            return;
        }

        let retry = matches!(task.trigger, TriggerPolicy::Retry { .. });
        let post_condition = if retry && execution.is_delivered() && !task.post_req.is_empty() {
            match self.evaluator.evaluate(&task.post_req) {
                Ok(ok) => Some(ok),
                Err(e) => {
                    task.runtime.errors += 1;
                    tracing::warn!("[{}] ⚠️ '{}' check failed: {e}", self.id, task.id);
                    Some(false)
                }
            }
        } else {
            None
        };
        let trigger = task.trigger.clone();
        let verdict = trigger.on_fire(FireContext {
            execution,
            post_condition,
            sequential,
            stop_on_failure: task.stop_on_failure,
            runtime: &mut task.runtime,
        });
        tracing::debug!(
            "[{}] '{}' {} -> {verdict:?}",
            self.id,
            task.id,
            execution.label()
        );
        let clock = matches!(trigger, TriggerPolicy::Clock { .. });

        match verdict {
            Verdict::Continue | Verdict::Retry => {
                let standalone_interval =
                    run_type.is_none() && matches!(trigger, TriggerPolicy::Interval { .. });
                if standalone_interval && *execution == Execution::StateMismatch {
                    task.cancel();
                    tracing::debug!("[{}] 💤 '{}' paused, state gate closed", self.id, task.id);
                }
            }
            Verdict::Advance => {
                if sequential {
                    task.cancel();
                    if let TaskRef::Member { set, index } = key {
                        self.advance(reg, set, *index, chain);
                    }
                } else if trigger.is_periodic() {
                    task.cancel();
                    task.runtime.enabled = false;
                } else if clock {
                    self.rearm_clock(reg, key);
                }
            }
            Verdict::Abort => {
                task.cancel();
                let stream = (retry && task.output.kind == OutputKind::Stream)
                    .then(|| task.output.reference.clone());
                if stream.is_none() && trigger.is_periodic() {
                    task.runtime.enabled = false;
                }
                tracing::warn!("[{}] 💥 '{}' aborted ({})", self.id, task.id, execution.label());
                if let Some(stream) = stream {
                    self.queue_restore(reg, stream);
                }
                if sequential {
                    if let Some(set) = key.set_id() {
                        self.fail_set(reg, set, chain);
                    }
                } else if clock {
                    self.rearm_clock(reg, key);
                }
            }
        }

        if run_type == Some(RunType::Parallel)
            && let Some(set_id) = key.set_id()
            && !chain.started_sets.contains(set_id)
        {
            self.finish_if_idle(reg, set_id);
        }
    }

    /// Schedule the next occurrence of a CLOCK task that just fired.
    fn rearm_clock(&self, reg: &mut Registry, key: &TaskRef) {
        let Some(task) = reg.task_mut(key) else {
            return;
        };
        let Some(wait) = task.trigger.next_clock_delay_after(CLOCK_GAP) else {
            return;
        };
        task.runtime.generation += 1;
        task.runtime.enabled = true;
        let job = self.job(key.clone(), task.runtime.generation);
        task.runtime.handle = Some(self.pool.schedule(wait, job));
        tracing::debug!("[{}] ⏱️ '{}' next run in {}s", self.id, task.id, wait.as_secs());
    }

    /// Arm one step of a SEQUENTIAL set. A step that cannot be armed fails the set.
    fn arm_step(&self, reg: &mut Registry, set_id: &str, index: usize, chain: &mut ExecChain) {
        let key = TaskRef::member(set_id, index);
        if self.arm(reg, &key, chain) || reg.task(&key).is_some_and(Task::is_armed) {
            return;
        }
        tracing::warn!("[{}] ⚠️ Step {index} of '{set_id}' could not be armed", self.id);
        self.fail_set(reg, set_id, chain);
    }

    /// Close a PARALLEL set once none of its members can fire again.
    fn finish_if_idle(&self, reg: &mut Registry, set_id: &str) {
        let Some(set) = reg.set_mut(set_id) else {
            return;
        };
        let pending = set.tasks.iter().any(|t| {
            t.is_armed()
                || (t.runtime.enabled && matches!(t.trigger, TriggerPolicy::Keyword { .. }))
        });
        if set.active && !pending {
            set.active = false;
            tracing::info!("[{}] 🏁 Taskset '{set_id}' completed", self.id);
        }
    }

    /// Arm the member after `index`, or finish the set.
    fn advance(&self, reg: &mut Registry, set_id: &str, index: usize, chain: &mut ExecChain) {
        let Some(set) = reg.set_mut(set_id) else {
            return;
        };
        if !set.active {
            return;
        }
        let next = index + 1;
        if next >= set.tasks.len() {
            set.active = false;
            set.cursor = 0;
            tracing::info!("[{}] 🏁 Taskset '{set_id}' completed", self.id);
            return;
        }
        set.cursor = next;
        tracing::debug!("[{}] ➡️ '{set_id}' step {next}", self.id);
        self.arm_step(reg, set_id, next, chain);
    }

    /// Stop a failed set and start its fallback.
    fn fail_set(&self, reg: &mut Registry, set_id: &str, chain: &mut ExecChain) {
        let Some(set) = reg.set_mut(set_id) else {
            return;
        };
        if !set.active {
            return;
        }
        let cancelled = set.stop();
        let failure = set.failure.clone();
        tracing::warn!(
            "[{}] 💥 Taskset '{set_id}' failed ({cancelled} cancelled), fallback {failure}",
            self.id
        );
        match failure {
            FailureTarget::None => {}
            FailureTarget::Task(id) => {
                self.start_task_in(reg, &id, chain);
            }
            FailureTarget::TaskSet(id) => {
                let result = self.start_set_in(reg, &id, chain);
                if result != SetStart::Started {
                    tracing::warn!("[{}] ⚠️ {}", self.id, describe_start(&id, &result));
                }
            }
        }
    }

    // ── Restore watcher & alerts ───────────────────────────

    fn queue_restore(&self, reg: &mut Registry, stream: String) {
        if !reg.restore_queue.contains(&stream) {
            tracing::info!("[{}] 🩺 Watching stream '{stream}' for recovery", self.id);
            reg.restore_queue.push(stream);
        }
        if reg.restore_watch.is_some() {
            return;
        }
        let me = self.me.clone();
        let (first, again) = (self.settings.restore_first, self.settings.restore_again);
        reg.restore_watch = Some(self.pool.spawn(async move {
            tokio::time::sleep(first).await;
            loop {
                let Some(manager) = me.upgrade() else { break };
                if !manager.check_restored() {
                    break;
                }
                drop(manager);
                tokio::time::sleep(again).await;
            }
        }));
    }

    /// Poll queued streams. Returns whether any are still down.
    fn check_restored(&self) -> bool {
        let mut guard = self.lock();
        let reg = &mut *guard;
        let queue = std::mem::take(&mut reg.restore_queue);
        let sinks = reg.dispatcher.sinks();
        let (restored, down): (Vec<String>, Vec<String>) =
            queue.into_iter().partition(|s| sinks.stream_healthy(s));
        reg.restore_queue = down;
        if !restored.is_empty() {
            tracing::info!("[{}] 💚 Streams back: {}", self.id, restored.join(", "));
            self.recheck_in(reg);
        }
        if reg.restore_queue.is_empty() {
            reg.restore_watch = None;
            return false;
        }
        true
    }

    fn alert(&self, reg: &Registry, subject: &str, body: &str) {
        tracing::error!("[{}] 🚨 {subject}: {body}", self.id);
        reg.dispatcher.alert(subject, body);
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        let reg = self
            .registry
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reg.clear();
        for handle in [reg.restore_watch.take(), reg.listener.take()].into_iter().flatten() {
            handle.abort();
        }
        if let Some(recheck) = reg.recheck.take() {
            recheck.cancel();
        }
    }
}

fn describe_start(id: &str, result: &SetStart) -> String {
    match result {
        SetStart::NotFound => format!("No such taskset '{id}'"),
        SetStart::Empty => format!("Taskset '{id}' has no tasks"),
        SetStart::Unmet(req) => format!("Requirement of '{id}' not met: {req}"),
        SetStart::Started => format!("Started taskset '{id}'"),
        SetStart::Manual => "Didn't start anything".to_string(),
        SetStart::Looping => format!("Taskset '{id}' already started on this chain"),
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tasks::{Link, Output, Reply};
    use crate::testing::{RecordingSink, RecordingStream};

    const MS: Duration = Duration::from_millis(10);

    struct Rig {
        manager: Arc<TaskManager>,
        store: Arc<MemoryStore>,
        mqtt: Arc<RecordingSink>,
        mail: Arc<RecordingSink>,
        stream: Arc<RecordingStream>,
    }

    fn rig_with(settings: ManagerSettings) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let mqtt = Arc::new(RecordingSink::default());
        let mail = Arc::new(RecordingSink::default());
        let stream = Arc::new(RecordingStream::default());
        let sinks = Sinks::new()
            .with(OutputKind::Mqtt, mqtt.clone())
            .with(OutputKind::Email, mail.clone())
            .with_stream(stream.clone())
            .with_health(stream.clone());
        let manager = TaskManager::builder(settings)
            .store(store.clone())
            .sinks(sinks)
            .build(TimerPool::current().unwrap());
        Rig {
            manager,
            store,
            mqtt,
            mail,
            stream,
        }
    }

    fn rig() -> Rig {
        rig_with(ManagerSettings::new("test"))
    }

    fn task(id: &str, trigger: &str, value: &str) -> Task {
        Task::new(
            id,
            TriggerPolicy::parse(trigger, None).unwrap(),
            Output::new(OutputKind::Mqtt, "topic"),
            value,
        )
    }

    fn set(id: &str, run_type: RunType, failure: &str, members: Vec<Task>) -> TaskSet {
        let mut set = TaskSet::new(id, "", run_type);
        set.failure = FailureTarget::parse(failure);
        for member in members {
            set.add_task(member);
        }
        set
    }

    #[tokio::test(start_paused = true)]
    async fn test_do_now_runs_target_once() {
        let rig = rig();
        let a = task("a", "delay:0s", "A").with_link(Link::parse("donow:b").unwrap());
        let b = task("b", "keyword:never", "B");
        rig.manager.add_task(b);
        rig.manager.add_task(a);
        tokio::time::sleep(MS).await;
        assert_eq!(rig.mqtt.payloads(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_do_now_cycle_is_refused() {
        let rig = rig();
        let a = task("a", "keyword:go", "A").with_link(Link::parse("donow:b").unwrap());
        let b = task("b", "keyword:other", "B").with_link(Link::parse("donow:a").unwrap());
        rig.manager.add_task(a);
        rig.manager.add_task(b);
        assert_eq!(rig.manager.start_keyword_task("go"), 1);
        assert_eq!(rig.mqtt.payloads(), vec!["A", "B"]);
    }

    fn three_step(second: Task) -> TaskSet {
        set(
            "steps",
            RunType::Sequential,
            "task:alarm",
            vec![task("", "delay:0s", "one"), second, task("", "delay:0s", "three")],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_unmet_member_aborts() {
        let rig = rig();
        rig.manager.add_task(task("alarm", "keyword:alarm", "ALARM"));
        rig.manager
            .add_taskset(three_step(task("", "delay:0s", "two").with_req("flag:go")));
        assert_eq!(rig.manager.start_taskset("steps"), "Started taskset 'steps'");
        tokio::time::sleep(MS).await;
        assert_eq!(rig.mqtt.payloads(), vec!["one", "ALARM"]);
        assert!(!rig.manager.lock().set("steps").unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_unmet_member_continues() {
        let rig = rig();
        rig.manager.add_task(task("alarm", "keyword:alarm", "ALARM"));
        let second = task("", "delay:0s", "two")
            .with_req("flag:go")
            .continue_on_failure();
        rig.manager.add_taskset(three_step(second));
        rig.manager.start_taskset("steps");
        tokio::time::sleep(MS).await;
        assert_eq!(rig.mqtt.payloads(), vec!["one", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_single_live_member() {
        let rig = rig();
        let members = (0..3).map(|_| task("", "interval:1s,1s", "tick")).collect();
        rig.manager
            .add_taskset(set("ticks", RunType::Sequential, "", members));
        rig.manager.start_taskset("ticks");
        for _ in 0..8 {
            assert!(rig.manager.lock().set("ticks").unwrap().live_members() <= 1);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(rig.mqtt.payloads().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_fires_failure_once() {
        let rig = rig();
        rig.manager.add_task(task("alarm", "keyword:alarm", "ALARM"));
        let members = vec![
            task("", "retry:1s,3", "try").with_req("flag:up"),
            task("", "delay:0s", "next"),
        ];
        rig.manager
            .add_taskset(set("boot", RunType::Sequential, "task:alarm", members));
        rig.manager.start_taskset("boot");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(rig.mqtt.payloads(), vec!["ALARM"]);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.mqtt.payloads(), vec!["ALARM"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_advances() {
        let rig = rig();
        rig.manager.add_task(task("alarm", "keyword:alarm", "ALARM"));
        let members = vec![
            task("", "retry:1s,3", "try").with_req("flag:up"),
            task("", "delay:0s", "next"),
        ];
        rig.manager
            .add_taskset(set("boot", RunType::Sequential, "task:alarm", members));
        rig.manager.start_taskset("boot");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        rig.store.raise_flag("up");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.mqtt.payloads(), vec!["try", "next"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waitfor_never_gives_up() {
        let rig = rig();
        let members = vec![
            task("", "waitfor:1s,2", "").with_req("flag:ready"),
            task("", "delay:0s", "done"),
        ];
        rig.manager
            .add_taskset(set("wait", RunType::Sequential, "", members));
        rig.manager.start_taskset("wait");
        tokio::time::sleep(Duration::from_millis(5500)).await;
        {
            let reg = rig.manager.lock();
            let wait = reg.set("wait").unwrap();
            assert!(wait.active);
            assert_eq!(wait.tasks[0].runtime.attempts, 0);
        }
        rig.store.raise_flag("ready");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.mqtt.payloads(), vec!["done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_one_suppresses_next_firing() {
        let rig = rig();
        rig.manager
            .add_task(task("a", "keyword:a", "A").with_link(Link::parse("skipone:b").unwrap()));
        rig.manager.add_task(task("b", "keyword:b", "B"));
        rig.manager.start_keyword_task("a");
        rig.manager.start_keyword_task("b");
        {
            let reg = rig.manager.lock();
            let b = reg.task(&TaskRef::Standalone("b".into())).unwrap();
            assert_eq!(b.runtime.skip, 0);
        }
        assert_eq!(rig.mqtt.payloads(), vec!["A"]);
        rig.manager.start_keyword_task("b");
        assert_eq!(rig.mqtt.payloads(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_today_restores_at_midnight() {
        let rig = rig();
        rig.manager
            .add_task(task("a", "keyword:a", "A").with_link(Link::parse("nottoday:b").unwrap()));
        rig.manager.add_task(task("b", "keyword:b", "B"));
        rig.manager.start_keyword_task("a");
        rig.manager.start_keyword_task("b");
        assert_eq!(rig.mqtt.payloads(), vec!["A"]);
        tokio::time::sleep(Duration::from_secs(86_401)).await;
        rig.manager.start_keyword_task("b");
        assert_eq!(rig.mqtt.payloads(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_24h_restores_after_a_day() {
        let rig = rig();
        rig.manager
            .add_task(task("a", "keyword:a", "A").with_link(Link::parse("disable24h:b").unwrap()));
        rig.manager.add_task(task("b", "keyword:b", "B"));
        rig.manager.start_keyword_task("a");
        tokio::time::sleep(Duration::from_secs(86_390)).await;
        rig.manager.start_keyword_task("b");
        assert_eq!(rig.mqtt.payloads(), vec!["A"]);
        tokio::time::sleep(Duration::from_secs(20)).await;
        rig.manager.start_keyword_task("b");
        assert_eq!(rig.mqtt.payloads(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_task_drops_pending_future() {
        let rig = rig();
        rig.manager.add_task(task("a", "delay:1s", "A"));
        assert!(rig.manager.cancel_task("a"));
        assert!(!rig.manager.cancel_task("a"));
        assert!(!rig.manager.cancel_task("missing"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rig.mqtt.payloads().is_empty());
        assert!(rig.manager.armed_tasks().is_empty());

        assert!(rig.manager.start_task("a"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.mqtt.payloads(), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_is_noop() {
        let rig = rig();
        rig.manager.add_task(task("a", "delay:1s", "A"));
        assert!(!rig.manager.start_task("a"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!rig.manager.start_task("a"));
        assert_eq!(rig.manager.armed_tasks(), vec!["a delay:1s"]);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rig.mqtt.payloads(), vec!["A"]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.mqtt.payloads(), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmable_step_fails_the_set() {
        let rig = rig();
        rig.manager.add_task(task("alarm", "keyword:alarm", "ALARM"));
        let never = || {
            Task::new(
                "",
                TriggerPolicy::parse("clock:08:00", Some("never")).unwrap(),
                Output::new(OutputKind::System, ""),
                "",
            )
        };
        rig.manager.add_taskset(set(
            "later",
            RunType::Sequential,
            "task:alarm",
            vec![task("", "delay:0s", "one"), never()],
        ));
        rig.manager.add_taskset(set("first", RunType::Sequential, "task:alarm", vec![never()]));

        rig.manager.start_taskset("later");
        tokio::time::sleep(MS).await;
        assert_eq!(rig.mqtt.payloads(), vec!["one", "ALARM"]);
        {
            let reg = rig.manager.lock();
            let later = reg.set("later").unwrap();
            assert!(!later.active);
            assert_eq!(later.cursor, 0);
        }

        rig.manager.start_taskset("first");
        assert_eq!(rig.mqtt.payloads(), vec!["one", "ALARM", "ALARM"]);
        assert!(!rig.manager.lock().set("first").unwrap().active);
        assert_eq!(rig.mail.sent().len(), 2);
    }

    const TASK_FILE: &str = r#"
[[tasksets]]
id = "boot"
run = "step"
interruptable = false

[[tasksets.tasks]]
trigger = "delay:1h"

[[tasks]]
id = "ping"
trigger = "interval:10s,1m"
output = "mqtt:ping"

[[tasks]]
id = "daily"
trigger = "clock:06:00"

[[tasks]]
id = "off"
trigger = "delay:5s"
enable_on_start = false
"#;

    #[tokio::test(start_paused = true)]
    async fn test_reload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.toml");
        std::fs::write(&path, TASK_FILE).unwrap();
        let mut settings = ManagerSettings::new("test");
        settings.tasks_file = Some(path);
        let rig = rig_with(settings);

        assert!(rig.manager.reload_tasks());
        let first = rig.manager.armed_tasks();
        assert!(rig.manager.reload_tasks());
        assert_eq!(rig.manager.armed_tasks(), first);
        assert_eq!(first.len(), 2);
        assert!(first[0].starts_with("daily clock:06:00:00"));
        assert_eq!(first[1], "ping interval:10s,1m");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_respects_non_interruptable_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.toml");
        std::fs::write(&path, TASK_FILE).unwrap();
        let mut settings = ManagerSettings::new("test");
        settings.tasks_file = Some(path);
        let rig = rig_with(settings);

        assert!(rig.manager.reload_tasks());
        rig.manager.start_taskset("boot");
        assert!(!rig.manager.reload_tasks());
        assert!(rig.manager.force_reload_tasks());
        assert!(!rig.manager.lock().set("boot").unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_set_completes_and_allows_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.toml");
        std::fs::write(
            &path,
            r#"
[[tasksets]]
id = "burst"
run = "oneshot"
interruptable = false

[[tasksets.tasks]]
trigger = "delay:1s"

[[tasksets.tasks]]
trigger = "delay:2s"
"#,
        )
        .unwrap();
        let mut settings = ManagerSettings::new("test");
        settings.tasks_file = Some(path);
        let rig = rig_with(settings);

        assert!(rig.manager.reload_tasks());
        assert_eq!(rig.manager.start_taskset("burst"), "Started taskset 'burst'");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(rig.manager.lock().set("burst").unwrap().active);
        assert!(!rig.manager.reload_tasks());

        tokio::time::sleep(Duration::from_secs(1)).await;
        {
            let reg = rig.manager.lock();
            let burst = reg.set("burst").unwrap();
            assert_eq!(burst.live_members(), 0);
            assert!(!burst.active);
        }
        assert!(rig.manager.reload_tasks());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_set_with_keyword_member_stays_active() {
        let rig = rig();
        rig.manager.add_taskset(set(
            "listen",
            RunType::Parallel,
            "",
            vec![task("", "delay:0s", "now"), task("", "keyword:ping", "pong")],
        ));
        rig.manager.start_taskset("listen");
        tokio::time::sleep(MS).await;
        assert!(rig.manager.lock().set("listen").unwrap().active);
        assert_eq!(rig.manager.start_keyword_task("ping"), 1);
        assert_eq!(rig.mqtt.payloads(), vec!["now", "pong"]);
        assert_eq!(rig.manager.stop_taskset("listen"), Some(0));
        assert!(!rig.manager.lock().set("listen").unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_reply_drives_sequence() {
        let rig = rig();
        rig.manager.add_task(task("alarm", "keyword:alarm", "ALARM"));
        let mut ask = task("", "delay:0s", "AT");
        ask.output = Output::new(OutputKind::Stream, "modem");
        let ask = ask.with_reply(Reply {
            expected: "OK".into(),
            interval: Duration::from_secs(1),
            retries: 3,
        });
        rig.manager.add_taskset(set(
            "modem",
            RunType::Sequential,
            "task:alarm",
            vec![ask, task("", "delay:0s", "after")],
        ));

        rig.manager.start_taskset("modem");
        tokio::time::sleep(MS).await;
        let requests = rig.stream.requests();
        assert_eq!(requests.len(), 1);
        assert!(rig.mqtt.payloads().is_empty());

        requests[0]
            .reply_to
            .send(Confirmation {
                key: requests[0].key.clone(),
                success: true,
            })
            .unwrap();
        tokio::time::sleep(MS).await;
        assert_eq!(rig.mqtt.payloads(), vec!["after"]);

        rig.manager.start_taskset("modem");
        tokio::time::sleep(MS).await;
        rig.manager.confirm(Confirmation {
            key: TaskRef::member("modem", 0),
            success: false,
        });
        assert_eq!(rig.mqtt.payloads(), vec!["after", "ALARM"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_gate_pauses_and_resumes_interval() {
        let rig = rig();
        rig.store.set_text("mode", "night");
        rig.manager
            .add_task(task("poll", "interval:0s,1s", "P").with_when("mode:day"));
        tokio::time::sleep(MS).await;
        assert!(rig.manager.armed_tasks().is_empty());
        assert!(rig.mqtt.payloads().is_empty());

        assert!(rig.manager.change_state("mode", "DAY"));
        assert!(!rig.manager.change_state("mode", "DAY"));
        tokio::time::sleep(MS).await;
        assert_eq!(rig.manager.armed_tasks(), vec!["poll interval:0s,1s"]);
        assert_eq!(rig.mqtt.payloads(), vec!["P"]);

        assert!(rig.manager.check_state("mode:day"));
        rig.manager.change_state("mode", "night");
        assert!(rig.manager.armed_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_without_days_alerts() {
        let rig = rig();
        let never = Task::new(
            "never",
            TriggerPolicy::parse("clock:08:00", Some("never")).unwrap(),
            Output::new(OutputKind::System, ""),
            "",
        );
        rig.manager.add_task(never);
        assert!(rig.manager.armed_tasks().is_empty());
        assert_eq!(rig.mail.sent().len(), 1);
        assert_eq!(rig.mail.sent()[0].0, "admin");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_watcher_rearms_retry() {
        let rig = rig();
        rig.stream.set_healthy(false);
        let mut retry = task("push", "retry:1s,2", "DATA");
        retry.output = Output::new(OutputKind::Stream, "gps");
        rig.manager.add_task(retry);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rig.manager.armed_tasks().is_empty());
        assert_eq!(rig.manager.lock().restore_queue, vec!["gps"]);
        assert_eq!(rig.manager.recheck_interval_tasks(), 0);
        assert!(rig.manager.armed_tasks().is_empty());

        rig.stream.set_healthy(true);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(rig.stream.writes(), vec![("gps".to_string(), "DATA".to_string())]);
        assert!(rig.manager.lock().restore_queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sets_run_members_on_request() {
        let rig = rig();
        rig.manager.add_taskset(set(
            "manual",
            RunType::Manual,
            "",
            vec![task("flush", "execute", "FLUSH")],
        ));
        assert_eq!(rig.manager.start_taskset("manual"), "Didn't start anything");
        assert!(rig.mqtt.payloads().is_empty());

        let trigger = Task::new(
            "trigger",
            TriggerPolicy::Execute,
            Output::new(OutputKind::Manager, ""),
            "manual:flush",
        );
        rig.manager.add_task(trigger);
        assert_eq!(rig.mqtt.payloads(), vec!["FLUSH"]);
        assert!(rig.manager.start_member("manual", "0"));
        assert_eq!(rig.mqtt.payloads(), vec!["FLUSH", "FLUSH"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_taskset_start_messages() {
        let rig = rig();
        rig.manager.add_taskset(set("empty", RunType::Parallel, "", vec![]));
        let mut gated = set("gated", RunType::Parallel, "", vec![task("", "delay:1s", "x")]);
        gated.req = "flag:armed".into();
        rig.manager.add_taskset(gated);
        assert_eq!(rig.manager.start_taskset("nope"), "No such taskset 'nope'");
        assert_eq!(rig.manager.start_taskset("empty"), "Taskset 'empty' has no tasks");
        assert_eq!(
            rig.manager.start_taskset("gated"),
            "Requirement of 'gated' not met: flag:armed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_counts_live_futures() {
        let rig = rig();
        rig.manager.add_task(task("a", "delay:1h", "A"));
        rig.manager.add_task(task("b", "interval:1h,1h", "B"));
        rig.manager.add_task(task("c", "keyword:c", "C"));
        rig.manager.add_taskset(set(
            "p",
            RunType::Parallel,
            "",
            vec![task("", "delay:1h", "x"), task("", "delay:1h", "y")],
        ));
        rig.manager.start_taskset("p");
        assert_eq!(rig.manager.stop_all("test"), 4);
        assert!(rig.manager.armed_tasks().is_empty());
        assert_eq!(rig.manager.stop_taskset("p"), Some(0));
        assert_eq!(rig.manager.stop_taskset("missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_everything() {
        let rig = rig();
        rig.manager.add_task(task("a", "delay:1h", "A"));
        rig.manager.shutdown_and_clear_all();
        assert!(rig.manager.armed_tasks().is_empty());
        assert!(!rig.manager.start_task("a"));
        assert_eq!(rig.manager.stop_all("again"), 0);
    }
}
