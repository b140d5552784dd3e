//! Task definitions — the core data model for scheduled work.

use std::fmt;
use std::time::Duration;

use crate::error::{TaskError, TaskResult};
use crate::timer::ScheduledHandle;
use crate::trigger::TriggerPolicy;

/// Address of a task inside the manager's registry.
///
/// Members of a set are addressed by position, standalone tasks by id. This
/// is also the correlation key carried through stream confirmations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskRef {
    Standalone(String),
    Member { set: String, index: usize },
}

impl TaskRef {
    pub fn member(set: &str, index: usize) -> Self {
        Self::Member {
            set: set.to_string(),
            index,
        }
    }

    pub fn set_id(&self) -> Option<&str> {
        match self {
            Self::Standalone(_) => None,
            Self::Member { set, .. } => Some(set),
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standalone(id) => write!(f, "{id}"),
            Self::Member { set, index } => write!(f, "{set}_{index}"),
        }
    }
}

/// Where a task's payload goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    File,
    Sms,
    Email,
    Stream,
    Mqtt,
    Log,
    Telnet,
    Manager,
    I2c,
    System,
}

impl OutputKind {
    pub fn parse(text: &str) -> TaskResult<Self> {
        let kind = match text.trim().to_lowercase().as_str() {
            "file" => Self::File,
            "sms" => Self::Sms,
            "email" | "mail" => Self::Email,
            "stream" | "channel" | "raw" => Self::Stream,
            "mqtt" => Self::Mqtt,
            "log" => Self::Log,
            "telnet" => Self::Telnet,
            "manager" => Self::Manager,
            "i2c" => Self::I2c,
            "system" | "" => Self::System,
            other => return Err(TaskError::Config(format!("unknown output '{other}'"))),
        };
        Ok(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Stream => "stream",
            Self::Mqtt => "mqtt",
            Self::Log => "log",
            Self::Telnet => "telnet",
            Self::Manager => "manager",
            Self::I2c => "i2c",
            Self::System => "system",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected answer on a stream, confirmed asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub expected: String,
    pub interval: Duration,
    pub retries: u32,
}

/// Output descriptor: kind plus its reference (file path, stream id, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub kind: OutputKind,
    pub reference: String,
    pub reply: Option<Reply>,
}

impl Output {
    pub fn new(kind: OutputKind, reference: &str) -> Self {
        Self {
            kind,
            reference: reference.to_string(),
            reply: None,
        }
    }

    /// Parse "kind:reference", e.g. `stream:gps` or `file:log/out.txt`.
    pub fn parse(text: &str) -> TaskResult<Self> {
        let (kind, reference) = text.split_once(':').unwrap_or((text, ""));
        Ok(Self::new(OutputKind::parse(kind)?, reference.trim()))
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reference.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}:{}", self.kind, self.reference)
        }
    }
}

/// Side effect applied to other tasks after a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkType {
    #[default]
    None,
    Disable24h,
    NotToday,
    DoNow,
    SkipOne,
}

/// Link descriptor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Link {
    pub kind: LinkType,
    pub targets: Vec<String>,
}

impl Link {
    /// Parse "type:target1,target2", e.g. `donow:flush` or `skipone:ping`.
    pub fn parse(text: &str) -> TaskResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::default());
        }
        let (kind, targets) = text
            .split_once(':')
            .ok_or_else(|| TaskError::Config(format!("link '{text}' has no target")))?;
        let kind = match kind.trim().to_lowercase().as_str() {
            "disable24h" => LinkType::Disable24h,
            "nottoday" | "not_today" => LinkType::NotToday,
            "donow" | "do_now" => LinkType::DoNow,
            "skipone" | "skip_one" => LinkType::SkipOne,
            "none" => LinkType::None,
            other => return Err(TaskError::Config(format!("unknown link type '{other}'"))),
        };
        let targets = targets
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        Ok(Self { kind, targets })
    }

    pub fn is_active(&self) -> bool {
        self.kind != LinkType::None && !self.targets.is_empty()
    }
}

/// Why a firing did nothing on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    SkipOne,
    NotToday,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// Gates passed and the sink accepted the payload.
    Delivered { awaiting_reply: bool },
    Suppressed(Suppression),
    /// The `when` state gate failed.
    StateMismatch,
    /// The pre-requirement evaluated false.
    Unmet,
    Failed(TaskError),
    /// Already on the active call chain.
    Refused,
}

impl Execution {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Suppressed(_) => "suppressed",
            Self::StateMismatch => "state mismatch",
            Self::Unmet => "not executed",
            Self::Failed(_) => "failed",
            Self::Refused => "refused",
        }
    }
}

/// Mutable per-task state, reset on reload.
#[derive(Debug)]
pub struct TaskRuntime {
    /// The single live future, if any.
    pub handle: Option<ScheduledHandle>,
    /// Bumped on every arm/cancel; stale firings compare and bail.
    pub generation: u64,
    pub attempts: u32,
    pub retries_left: u32,
    pub do_today: bool,
    pub skip: u32,
    pub errors: u32,
    /// Delivered firings.
    pub runs: u64,
    /// Started and not explicitly cancelled; the recheck sweep only re-arms these.
    pub enabled: bool,
    /// Pending eligibility restore from a DISABLE_24H / NOT_TODAY link.
    pub restore: Option<ScheduledHandle>,
}

impl TaskRuntime {
    pub fn new(trigger: &TriggerPolicy) -> Self {
        Self {
            handle: None,
            generation: 0,
            attempts: 0,
            retries_left: trigger.budget(),
            do_today: true,
            skip: 0,
            errors: 0,
            runs: 0,
            enabled: false,
            restore: None,
        }
    }
}

/// A scheduled task.
#[derive(Debug)]
pub struct Task {
    /// Unique id; set members default to `<setid>_<index>`.
    pub id: String,
    pub name: String,
    pub trigger: TriggerPolicy,
    /// Payload template.
    pub value: String,
    pub output: Output,
    /// State gate `key:value`; empty or "always" matches everything.
    pub when: String,
    pub pre_req: String,
    pub post_req: String,
    pub link: Link,
    pub stop_on_failure: bool,
    pub enable_on_start: bool,
    pub runtime: TaskRuntime,
}

impl Task {
    pub fn new(id: &str, trigger: TriggerPolicy, output: Output, value: &str) -> Self {
        let runtime = TaskRuntime::new(&trigger);
        Self {
            id: id.to_string(),
            name: id.to_string(),
            trigger,
            value: value.to_string(),
            output,
            when: String::new(),
            pre_req: String::new(),
            post_req: String::new(),
            link: Link::default(),
            stop_on_failure: true,
            enable_on_start: true,
            runtime,
        }
    }

    pub fn with_when(mut self, when: &str) -> Self {
        self.when = when.to_string();
        self
    }

    pub fn with_req(mut self, req: &str) -> Self {
        self.pre_req = req.to_string();
        self
    }

    pub fn with_check(mut self, check: &str) -> Self {
        self.post_req = check.to_string();
        self
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    pub fn with_reply(mut self, reply: Reply) -> Self {
        self.output.reply = Some(reply);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.stop_on_failure = false;
        self
    }

    /// True while a scheduled future may still fire.
    pub fn is_armed(&self) -> bool {
        self.runtime.handle.as_ref().is_some_and(|h| h.is_live())
    }

    /// Stream output waiting for a confirmation before the set may advance.
    pub fn expects_reply(&self) -> bool {
        self.output.kind == OutputKind::Stream && self.output.reply.is_some()
    }

    /// Drop the live future, if any. Returns whether one was live.
    pub fn cancel(&mut self) -> bool {
        self.runtime.generation += 1;
        match self.runtime.handle.take() {
            Some(handle) => {
                let live = handle.is_live();
                handle.cancel();
                live
            }
            None => false,
        }
    }

    /// Cancel everything including pending eligibility restores.
    pub fn shutdown(&mut self) {
        self.cancel();
        if let Some(restore) = self.runtime.restore.take() {
            restore.cancel();
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] -> {}", self.id, self.trigger, self.output)?;
        if !self.when.is_empty() {
            write!(f, " when {}", self.when)?;
        }
        if !self.pre_req.is_empty() {
            write!(f, " req {}", self.pre_req)?;
        }
        if self.link.is_active() {
            write!(f, " link {:?}:{}", self.link.kind, self.link.targets.join(","))?;
        }
        Ok(())
    }
}
