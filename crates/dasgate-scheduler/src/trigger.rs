//! Trigger policies — when a task fires and what a firing means.
//!
//! Each variant knows how to arm itself on the [`TimerPool`] and how to turn
//! the outcome of one firing into a [`Verdict`] for the manager. The manager
//! never switches on the trigger kind to decide retries or advancement.

use std::fmt;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, Utc};

use crate::clock::{self, Weekdays};
use crate::error::{TaskError, TaskResult};
use crate::tasks::{Execution, TaskRuntime};
use crate::timer::{ScheduledHandle, TimerPool};

/// How/when a task triggers.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerPolicy {
    /// Fire once, immediately, when armed.
    Execute,
    /// Dormant until the keyword event arrives.
    Keyword { keyword: String },
    /// Fire once after a fixed delay.
    Delay { delay: Duration },
    /// Fire at a time of day on allowed weekdays, re-armed after every firing.
    Clock {
        time: NaiveTime,
        utc: bool,
        days: Weekdays,
    },
    /// Fire every `every`, first after `start`.
    Interval { start: Duration, every: Duration },
    /// Attempt every `every` until success or the budget runs out.
    Retry { every: Duration, retries: u32 },
    /// Check every `every`; `runs` passes in a row advance, one miss aborts.
    While { every: Duration, runs: u32 },
    /// Check every `every`; `runs` passes in a row advance, a miss restarts the count.
    WaitFor { every: Duration, runs: u32 },
}

/// What arming produced.
#[derive(Debug)]
pub enum Armed {
    /// A future is pending on the pool.
    Scheduled(ScheduledHandle),
    /// The caller must fire the task right away.
    Immediate,
    /// Nothing to schedule until an external event.
    Dormant,
}

/// The manager's next step after a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Stay armed, nothing else to do.
    Continue,
    /// The task is done for this run; move the owning set forward.
    Advance,
    /// Failed, but budget remains; stay armed.
    Retry,
    /// Terminal failure for this run; run the failure path.
    Abort,
}

/// Inputs to [`TriggerPolicy::on_fire`].
pub struct FireContext<'a> {
    pub execution: &'a Execution,
    /// Post-condition result, only evaluated for delivered RETRY firings.
    pub post_condition: Option<bool>,
    /// The task belongs to a SEQUENTIAL set.
    pub sequential: bool,
    pub stop_on_failure: bool,
    pub runtime: &'a mut TaskRuntime,
}

impl TriggerPolicy {
    /// Parse the trigger text used in task files, e.g. `delay:10s` or
    /// `retry:5s,3`. `days` only applies to clock triggers.
    pub fn parse(text: &str, days: Option<&str>) -> TaskResult<Self> {
        let text = text.trim();
        let (kind, args) = match text.split_once(':') {
            Some((k, a)) => (k.trim().to_lowercase(), a.trim()),
            None => (text.to_lowercase(), ""),
        };
        let days = match days {
            Some(d) => Weekdays::parse(d)?,
            None => Weekdays::ALL,
        };
        match kind.as_str() {
            "execute" | "now" => Ok(Self::Execute),
            "keyword" => {
                if args.is_empty() {
                    return Err(TaskError::Config("keyword trigger needs a keyword".into()));
                }
                Ok(Self::Keyword {
                    keyword: args.to_string(),
                })
            }
            "delay" => Ok(Self::Delay {
                delay: parse_period(args)?,
            }),
            "clock" | "localclock" | "utcclock" | "utc" => Ok(Self::Clock {
                time: clock::parse_time(args)?,
                utc: kind.starts_with("utc"),
                days,
            }),
            "interval" => {
                let parts = split_args(args);
                let (start, every) = match parts.as_slice() {
                    [every] => {
                        let every = parse_period(every)?;
                        (every, every)
                    }
                    [start, every] => (parse_period(start)?, parse_period(every)?),
                    _ => return Err(bad_args(text)),
                };
                if every.is_zero() {
                    return Err(TaskError::Config(format!("zero interval in '{text}'")));
                }
                Ok(Self::Interval { start, every })
            }
            "retry" | "while" | "waitfor" => {
                let parts = split_args(args);
                let [every, count] = parts.as_slice() else {
                    return Err(bad_args(text));
                };
                let every = parse_period(every)?;
                let count: u32 = count.parse().map_err(|_| bad_args(text))?;
                if every.is_zero() || count == 0 {
                    return Err(TaskError::Config(format!(
                        "'{text}' needs a non-zero period and count"
                    )));
                }
                Ok(match kind.as_str() {
                    "retry" => Self::Retry {
                        every,
                        retries: count,
                    },
                    "while" => Self::While { every, runs: count },
                    _ => Self::WaitFor { every, runs: count },
                })
            }
            _ => Err(TaskError::Config(format!("unknown trigger '{text}'"))),
        }
    }

    /// Short upper-case kind name for listings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute => "EXECUTE",
            Self::Keyword { .. } => "KEYWORD",
            Self::Delay { .. } => "DELAY",
            Self::Clock { .. } => "CLOCK",
            Self::Interval { .. } => "INTERVAL",
            Self::Retry { .. } => "RETRY",
            Self::While { .. } => "WHILE",
            Self::WaitFor { .. } => "WAITFOR",
        }
    }

    /// Triggers that stay armed on a fixed rate.
    pub fn is_periodic(&self) -> bool {
        matches!(
            self,
            Self::Interval { .. } | Self::Retry { .. } | Self::While { .. } | Self::WaitFor { .. }
        )
    }

    /// Check-only triggers never deliver anything.
    pub fn is_check_only(&self) -> bool {
        matches!(self, Self::While { .. } | Self::WaitFor { .. })
    }

    /// Initial retry budget for a fresh runtime.
    pub fn budget(&self) -> u32 {
        match self {
            Self::Retry { retries, .. } => *retries,
            _ => 0,
        }
    }

    /// Wait until the next clock occurrence, from the wall clock.
    pub fn next_clock_delay(&self) -> Option<Duration> {
        self.next_clock_delay_after(Duration::ZERO)
    }

    /// Like [`Self::next_clock_delay`], skipping occurrences closer than `gap`.
    pub fn next_clock_delay_after(&self, gap: Duration) -> Option<Duration> {
        match self {
            Self::Clock { time, utc, days } => {
                let now: NaiveDateTime = if *utc {
                    Utc::now().naive_utc()
                } else {
                    Local::now().naive_local()
                };
                clock::until_next_after(*time, *days, now, gap)
            }
            _ => None,
        }
    }

    /// Arm the trigger on the pool. `job` is what the future runs.
    pub fn arm<F>(&self, pool: &TimerPool, job: F) -> TaskResult<Armed>
    where
        F: Fn() + Send + Sync + 'static,
    {
        match self {
            Self::Execute => Ok(Armed::Immediate),
            Self::Keyword { .. } => Ok(Armed::Dormant),
            Self::Delay { delay } => Ok(Armed::Scheduled(pool.schedule(*delay, job))),
            Self::Clock { days, .. } => match self.next_clock_delay() {
                Some(wait) => Ok(Armed::Scheduled(pool.schedule(wait, job))),
                None => Err(TaskError::Scheduling(format!(
                    "no next occurrence (allowed days: {days})"
                ))),
            },
            Self::Interval { start, every } => {
                pool.schedule_at_fixed_rate(*start, *every, job).map(Armed::Scheduled)
            }
            Self::Retry { every, .. } | Self::While { every, .. } | Self::WaitFor { every, .. } => {
                pool.schedule_at_fixed_rate(Duration::ZERO, *every, job)
                    .map(Armed::Scheduled)
            }
        }
    }

    /// Interpret one firing.
    pub fn on_fire(&self, ctx: FireContext<'_>) -> Verdict {
        let FireContext {
            execution,
            post_condition,
            sequential,
            stop_on_failure,
            runtime,
        } = ctx;
        match self {
            Self::Execute | Self::Keyword { .. } | Self::Delay { .. } | Self::Clock { .. } => {
                match execution {
                    Execution::Delivered { .. } | Execution::Suppressed(_) => Verdict::Advance,
                    Execution::StateMismatch | Execution::Unmet if !stop_on_failure => {
                        Verdict::Advance
                    }
                    _ => Verdict::Abort,
                }
            }
            Self::Interval { .. } => match execution {
                Execution::Delivered { .. } if sequential => Verdict::Advance,
                _ => Verdict::Continue,
            },
            Self::Retry { retries, .. } => match execution {
                Execution::Delivered { .. } if post_condition != Some(false) => {
                    runtime.retries_left = *retries;
                    Verdict::Advance
                }
                Execution::Suppressed(_) => Verdict::Continue,
                other => {
                    if !matches!(other, Execution::Failed(_)) {
                        runtime.errors += 1;
                    }
                    runtime.retries_left = runtime.retries_left.saturating_sub(1);
                    if runtime.retries_left == 0 {
                        runtime.retries_left = *retries;
                        Verdict::Abort
                    } else {
                        Verdict::Retry
                    }
                }
            },
            Self::While { runs, .. } | Self::WaitFor { runs, .. } => match execution {
                Execution::Delivered { .. } => {
                    runtime.attempts += 1;
                    if runtime.attempts >= *runs {
                        runtime.attempts = 0;
                        Verdict::Advance
                    } else {
                        Verdict::Continue
                    }
                }
                Execution::Suppressed(_) => Verdict::Continue,
                _ => {
                    runtime.attempts = 0;
                    if matches!(self, Self::While { .. }) {
                        Verdict::Abort
                    } else {
                        Verdict::Continue
                    }
                }
            },
        }
    }
}

impl fmt::Display for TriggerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execute => write!(f, "execute"),
            Self::Keyword { keyword } => write!(f, "keyword:{keyword}"),
            Self::Delay { delay } => write!(f, "delay:{}", fmt_period(*delay)),
            Self::Clock { time, utc, days } => write!(
                f,
                "{}:{} ({days})",
                if *utc { "utcclock" } else { "clock" },
                time.format("%H:%M:%S")
            ),
            Self::Interval { start, every } => write!(
                f,
                "interval:{},{}",
                fmt_period(*start),
                fmt_period(*every)
            ),
            Self::Retry { every, retries } => write!(f, "retry:{},{retries}", fmt_period(*every)),
            Self::While { every, runs } => write!(f, "while:{},{runs}", fmt_period(*every)),
            Self::WaitFor { every, runs } => write!(f, "waitfor:{},{runs}", fmt_period(*every)),
        }
    }
}

fn split_args(args: &str) -> Vec<&str> {
    args.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn bad_args(text: &str) -> TaskError {
    TaskError::Config(format!("malformed trigger '{text}'"))
}

/// Parse "500ms", "10s", "5m", "2h", "1d"; a bare number is seconds.
pub fn parse_period(text: &str) -> TaskResult<Duration> {
    let text = text.trim().to_lowercase();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| TaskError::Config(format!("invalid period '{text}'")))?;
    let secs = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" | "sec" => value,
        "m" | "min" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => {
            return Err(TaskError::Config(format!(
                "unknown time unit '{other}' in '{text}'"
            )));
        }
    };
    Ok(Duration::from_secs(secs))
}

/// Compact period text, the inverse of [`parse_period`].
pub fn fmt_period(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_millis() != 0 || (secs == 0 && !d.is_zero()) {
        return format!("{}ms", d.as_millis());
    }
    match secs {
        0 => "0s".into(),
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3600 == 0 => format!("{}h", s / 3600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}
