//! Task file loading (TOML).
//!
//! ```toml
//! [[tasksets]]
//! id = "boot"
//! run = "step"
//! failure = "task:alarm"
//!
//! [[tasksets.tasks]]
//! trigger = "retry:5s,3"
//! output = "stream:modem"
//! value = "AT"
//! reply = "OK"
//!
//! [[tasks]]
//! id = "alarm"
//! trigger = "keyword:alarm"
//! output = "email:ops@site"
//! value = "Boot failed;modem silent since {utcstamp}"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{TaskError, TaskResult};
use crate::tasks::{Link, Output, Reply, Task};
use crate::taskset::{FailureTarget, RunType, TaskSet};
use crate::trigger::{TriggerPolicy, parse_period};

/// Parsed task file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasksets: Vec<TaskSetConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// One `[[tasksets]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSetConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_run")]
    pub run: String,
    #[serde(default)]
    pub repeat: u32,
    #[serde(default)]
    pub req: String,
    #[serde(default)]
    pub failure: String,
    #[serde(default = "bool_true")]
    pub interruptable: bool,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// One `[[tasks]]` or `[[tasksets.tasks]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub trigger: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub req: String,
    #[serde(default)]
    pub check: String,
    #[serde(default)]
    pub link: String,
    pub days: Option<String>,
    pub reply: Option<String>,
    #[serde(default = "default_reply_interval")]
    pub reply_interval: String,
    #[serde(default = "default_reply_retries")]
    pub reply_retries: u32,
    #[serde(default = "bool_true")]
    pub stop_on_failure: bool,
    #[serde(default = "bool_true")]
    pub enable_on_start: bool,
}

fn bool_true() -> bool { true }
fn default_run() -> String { "oneshot".into() }
fn default_output() -> String { "system".into() }
fn default_reply_interval() -> String { "3s".into() }
fn default_reply_retries() -> u32 { 5 }

impl TaskFile {
    pub fn load(path: &Path) -> TaskResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> TaskResult<Self> {
        toml::from_str(content).map_err(|e| TaskError::Config(format!("task file: {e}")))
    }

    /// Build typed sets and standalone tasks. Bad entries are logged and skipped.
    pub fn build(&self, owner: &str) -> (Vec<TaskSet>, Vec<Task>) {
        let mut sets = Vec::new();
        for config in &self.tasksets {
            match config.build(owner) {
                Ok(set) => sets.push(set),
                Err(e) => tracing::error!("[{owner}] ❌ Skipping taskset '{}': {e}", config.id),
            }
        }
        let mut tasks = Vec::new();
        for config in &self.tasks {
            if config.id.is_empty() {
                tracing::error!("[{owner}] ❌ Skipping task without id ({})", config.trigger);
                continue;
            }
            match config.build() {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::error!("[{owner}] ❌ Skipping task '{}': {e}", config.id),
            }
        }
        (sets, tasks)
    }
}

impl TaskSetConfig {
    pub fn build(&self, owner: &str) -> TaskResult<TaskSet> {
        if self.id.trim().is_empty() {
            return Err(TaskError::Config("taskset without id".into()));
        }
        let mut set = TaskSet::new(&self.id, &self.name, RunType::parse(&self.run)?);
        set.repeat = self.repeat;
        set.req = self.req.clone();
        set.failure = FailureTarget::parse(&self.failure);
        set.interruptable = self.interruptable;
        for (index, member) in self.tasks.iter().enumerate() {
            match member.build() {
                Ok(task) => {
                    set.add_task(task);
                }
                Err(e) => tracing::error!(
                    "[{owner}] ❌ Skipping member {index} of '{}': {e}",
                    self.id
                ),
            }
        }
        Ok(set)
    }
}

impl TaskConfig {
    pub fn build(&self) -> TaskResult<Task> {
        let trigger = TriggerPolicy::parse(&self.trigger, self.days.as_deref())?;
        let mut task = Task::new(&self.id, trigger, Output::parse(&self.output)?, &self.value)
            .with_when(&self.when)
            .with_req(&self.req)
            .with_check(&self.check)
            .with_link(Link::parse(&self.link)?);
        if !self.name.is_empty() {
            task.name = self.name.clone();
        }
        if let Some(expected) = &self.reply {
            task = task.with_reply(Reply {
                expected: expected.clone(),
                interval: parse_period(&self.reply_interval)?,
                retries: self.reply_retries,
            });
        }
        task.stop_on_failure = self.stop_on_failure;
        task.enable_on_start = self.enable_on_start;
        Ok(task)
    }
}
