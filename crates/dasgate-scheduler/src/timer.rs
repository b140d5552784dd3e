//! Timer pool — the delayed/periodic callback runner behind every task.
//!
//! All callbacks run on the worker threads of one tokio runtime, so the pool
//! size is whatever the runtime was built with. Callback bodies are plain
//! synchronous closures: a slow body occupies a worker until it returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{TaskError, TaskResult};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to one scheduled callback.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    state: Arc<AtomicU8>,
    abort: AbortHandle,
}

impl ScheduledHandle {
    /// Cancel the callback. Never interrupts a body that is already running.
    pub fn cancel(&self) {
        self.state.store(CANCELLED, Ordering::SeqCst);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// True while the callback may still fire.
    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PENDING && !self.abort.is_finished()
    }
}

/// Shared scheduler backed by a tokio runtime handle.
#[derive(Debug, Clone)]
pub struct TimerPool {
    handle: Handle,
}

impl TimerPool {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Pool on the runtime the caller is running in.
    pub fn current() -> TaskResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| TaskError::Scheduling(format!("no tokio runtime: {e}")))
    }

    /// Run `job` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> ScheduledHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let flag = state.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if flag
                .compare_exchange(PENDING, FIRED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                job();
            }
        });
        ScheduledHandle {
            state,
            abort: task.abort_handle(),
        }
    }

    /// Run `job` after `start`, then every `period` until cancelled.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        start: Duration,
        period: Duration,
        job: F,
    ) -> TaskResult<ScheduledHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(TaskError::Scheduling(format!(
                "illegal period 0 (start={}ms)",
                start.as_millis()
            )));
        }
        let state = Arc::new(AtomicU8::new(PENDING));
        let flag = state.clone();
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) != PENDING {
                    break;
                }
                job();
            }
        });
        Ok(ScheduledHandle {
            state,
            abort: task.abort_handle(),
        })
    }

    /// Spawn a long-running async helper on the pool.
    pub fn spawn<F>(&self, fut: F) -> AbortHandle
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut).abort_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let pool = TimerPool::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = pool.schedule(Duration::from_secs(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.is_live());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!handle.is_live());
        assert!(!handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_one_shot_never_fires() {
        let pool = TimerPool::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = pool.schedule(Duration::from_secs(1), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
        assert!(!handle.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_until_cancel() {
        let pool = TimerPool::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = pool
            .schedule_at_fixed_rate(Duration::ZERO, Duration::from_secs(10), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3); // t=0, 10, 20
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let pool = TimerPool::current().unwrap();
        let err = pool
            .schedule_at_fixed_rate(Duration::ZERO, Duration::ZERO, || {})
            .unwrap_err();
        assert!(matches!(err, TaskError::Scheduling(_)));
    }
}
