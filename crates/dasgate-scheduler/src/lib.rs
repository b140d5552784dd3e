//! # dasgate Scheduler
//!
//! Task and taskset engine of the acquisition gateway: decides when units of
//! work fire, under which conditions, and where their output goes.
//!
//! ## Architecture
//! ```text
//! TaskManager (one registry lock, weak-ref timer callbacks)
//!   ├── TimerPool: delayed / fixed-rate jobs on a shared tokio runtime
//!   ├── TriggerPolicy: arm() + on_fire() → Continue | Advance | Retry | Abort
//!   │     execute · keyword · delay · clock · interval · retry · while · waitfor
//!   ├── RequirementEvaluator: `when` state gate + req/check expressions
//!   ├── TaskSets: parallel fan-out · sequential stepping · manual
//!   ├── Links: disable24h · nottoday · donow · skipone
//!   └── Dispatcher → sinks
//!         ├── file · log · system · manager (internal)
//!         └── email · sms · stream · mqtt · telnet · i2c (host supplied)
//! ```

pub mod clock;
pub mod console;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod loader;
pub mod requirement;
pub mod store;
pub mod tasks;
pub mod taskset;
pub mod template;
pub mod timer;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use dispatch::{
    ConfirmRequest, Confirmation, OutputSink, Sinks, StreamHealth, StreamSink,
};
pub use engine::{ManagerSettings, TaskManager, TaskManagerBuilder};
pub use error::{TaskError, TaskResult};
pub use loader::TaskFile;
pub use requirement::{ActiveIssues, DataProviding, EvalValue, RequirementEvaluator};
pub use store::MemoryStore;
pub use tasks::{Link, LinkType, Output, OutputKind, Task, TaskRef};
pub use taskset::{FailureTarget, RunType, TaskSet};
pub use timer::TimerPool;
pub use trigger::TriggerPolicy;
