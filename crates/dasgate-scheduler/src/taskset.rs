//! Task sets — ordered groups of tasks sharing a run discipline.

use std::fmt;

use crate::error::{TaskError, TaskResult};
use crate::tasks::Task;

/// How the members of a set are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Arm every member at once.
    Parallel,
    /// Arm one member at a time, in order.
    Sequential,
    /// Never started as a whole; members run on explicit request.
    Manual,
}

impl RunType {
    pub fn parse(text: &str) -> TaskResult<Self> {
        match text.trim().to_lowercase().as_str() {
            "oneshot" | "parallel" => Ok(Self::Parallel),
            "step" | "sequential" => Ok(Self::Sequential),
            "no" | "manual" => Ok(Self::Manual),
            other => Err(TaskError::Config(format!("unknown run type '{other}'"))),
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Manual => "manual",
        })
    }
}

/// What to start when a sequential set fails.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FailureTarget {
    #[default]
    None,
    Task(String),
    TaskSet(String),
}

impl FailureTarget {
    /// `task:<id>`, `taskset:<id>`, or a bare taskset id.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::None;
        }
        match text.split_once(':') {
            Some(("task", id)) => Self::Task(id.trim().to_string()),
            Some(("taskset", id)) => Self::TaskSet(id.trim().to_string()),
            _ => Self::TaskSet(text.to_string()),
        }
    }
}

impl fmt::Display for FailureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Task(id) => write!(f, "task:{id}"),
            Self::TaskSet(id) => write!(f, "taskset:{id}"),
        }
    }
}

/// A named, ordered group of tasks.
#[derive(Debug)]
pub struct TaskSet {
    pub id: String,
    pub description: String,
    pub run_type: RunType,
    /// Parsed and listed; no runtime effect.
    pub repeat: u32,
    /// Checked once when the set starts.
    pub req: String,
    pub failure: FailureTarget,
    /// Whether a reload may stop this set while it runs.
    pub interruptable: bool,
    pub tasks: Vec<Task>,
    /// Index of the member currently armed (sequential sets).
    pub cursor: usize,
    /// Member waiting for a stream confirmation.
    pub last_index_run: Option<usize>,
    pub active: bool,
}

impl TaskSet {
    pub fn new(id: &str, description: &str, run_type: RunType) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            run_type,
            repeat: 0,
            req: String::new(),
            failure: FailureTarget::None,
            interruptable: true,
            tasks: Vec::new(),
            cursor: 0,
            last_index_run: None,
            active: false,
        }
    }

    /// Append a member, naming it `<setid>_<index>` when it has no id.
    pub fn add_task(&mut self, mut task: Task) -> usize {
        let index = self.tasks.len();
        if task.id.is_empty() {
            task.id = format!("{}_{index}", self.id);
            if task.name.is_empty() {
                task.name = task.id.clone();
            }
        }
        self.tasks.push(task);
        index
    }

    pub fn position(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == task_id)
    }

    /// Members whose future may still fire.
    pub fn live_members(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_armed()).count()
    }

    /// Cancel every member and rewind. Returns how many futures were live.
    pub fn stop(&mut self) -> usize {
        let mut cancelled = 0;
        for task in &mut self.tasks {
            cancelled += usize::from(task.cancel());
            task.runtime.attempts = 0;
            task.runtime.retries_left = task.trigger.budget();
        }
        self.cursor = 0;
        self.last_index_run = None;
        self.active = false;
        cancelled
    }
}
