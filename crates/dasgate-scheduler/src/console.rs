//! Line commands and human-readable listings.

use std::fmt::Write;

use crate::engine::TaskManager;
use crate::tasks::Task;

const HELP: &str = "\
Task manager commands:
  reload | reloadtasks      reload the task file
  forcereload               reload even when a set may not be interrupted
  tasks | listtasks         list standalone tasks
  sets | listsets           list tasksets and their members
  setstate,<id>:<value>     change a state keyword
  stop                      stop every task and set
  run,<setid>               start a taskset
  run,task:<id>             start a single task
  keyword,<word>            fire keyword tasks
  ?                         this help";

impl TaskManager {
    /// Answer one console line.
    pub fn reply_to_command(&self, line: &str) -> String {
        let line = line.trim();
        let (cmd, arg) = match line.split_once(',') {
            Some((cmd, arg)) => (cmd.trim().to_lowercase(), arg.trim()),
            None => (line.to_lowercase(), ""),
        };
        match (cmd.as_str(), arg) {
            ("?" | "help", _) => HELP.to_string(),
            ("reload" | "reloadtasks", _) => {
                if self.reload_tasks() {
                    "Tasks reloaded".into()
                } else {
                    "Reload failed, check the log".into()
                }
            }
            ("forcereload", _) => {
                if self.force_reload_tasks() {
                    "Tasks reloaded".into()
                } else {
                    "Reload failed, check the log".into()
                }
            }
            ("tasks" | "listtasks", _) => self.task_listing(),
            ("sets" | "listsets", _) => self.taskset_listing(),
            ("setstate", arg) => match arg.split_once(':') {
                Some((key, value)) if !key.trim().is_empty() => {
                    if self.change_state(key.trim(), value.trim()) {
                        format!("State {} set to {}", key.trim(), value.trim())
                    } else {
                        format!("State {} unchanged", key.trim())
                    }
                }
                _ => "Usage: setstate,<id>:<value>".into(),
            },
            ("stop", _) => format!("Stopped {} tasks", self.stop_all("console")),
            ("run", "") => "Usage: run,<setid> or run,task:<id>".into(),
            ("run", arg) => match arg.strip_prefix("task:") {
                Some(id) if self.start_task(id.trim()) => format!("Started task '{}'", id.trim()),
                Some(id) => format!("Could not start task '{}'", id.trim()),
                None => self.start_taskset(arg),
            },
            ("keyword", "") => "Usage: keyword,<word>".into(),
            ("keyword", word) => format!("Ran {} tasks", self.start_keyword_task(word)),
            _ => format!("Unknown command '{line}', use ? for help"),
        }
    }

    /// Standalone tasks, one per line.
    pub fn task_listing(&self) -> String {
        let reg = self.lock();
        if reg.tasks.is_empty() {
            return "No tasks".into();
        }
        let mut out = format!("Tasks ({}):", reg.tasks.len());
        for task in &reg.tasks {
            let _ = write!(out, "\n - {}", describe(task));
        }
        out
    }

    /// Tasksets with their members.
    pub fn taskset_listing(&self) -> String {
        let reg = self.lock();
        if reg.sets.is_empty() {
            return "No tasksets".into();
        }
        let mut out = format!("Tasksets ({}):", reg.sets.len());
        for set in &reg.sets {
            let _ = write!(out, "\n - {} ", set.id);
            if !set.description.is_empty() {
                let _ = write!(out, "\"{}\" ", set.description);
            }
            let _ = write!(out, "{}", set.run_type);
            if set.repeat > 0 {
                let _ = write!(out, " repeat={}", set.repeat);
            }
            if !set.req.is_empty() {
                let _ = write!(out, " req={}", set.req);
            }
            let _ = write!(out, " failure={}", set.failure);
            if set.active {
                let _ = write!(out, " [active, step {}/{}]", set.cursor + 1, set.tasks.len());
            }
            for (index, task) in set.tasks.iter().enumerate() {
                let _ = write!(out, "\n    {index}: {}", describe(task));
            }
        }
        out
    }
}

fn describe(task: &Task) -> String {
    let mut line = task.to_string();
    if task.is_armed() {
        line.push_str(" (armed)");
    }
    if !task.runtime.do_today {
        line.push_str(" (disabled)");
    }
    if task.runtime.errors > 0 {
        let _ = write!(line, " errors={}", task.runtime.errors);
    }
    if task.runtime.runs > 0 {
        let _ = write!(line, " runs={}", task.runtime.runs);
    }
    line
}
