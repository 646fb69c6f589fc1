//! One-shot and periodic task scheduling.
//!
//! Sessions use this for the 60 s heartbeat and the stream-end timeout.
//! Every scheduled task returns a [`TaskHandle`]; dropping or cancelling
//! the handle stops the task, observed at its next tick. Cleanup cancels
//! every handle a session owns, regardless of how cleanup was entered.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Heartbeat period and keepalive interval, seconds.
pub const HEARTBEAT_SECS: u64 = 60;

/// Handle to a scheduled task; abort on cancel or drop.
pub struct TaskHandle {
    inner: JoinHandle<()>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.inner.abort();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

/// Task scheduler bound to the engine runtime.
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once<F, Fut>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task().await;
        });
        TaskHandle { inner }
    }

    /// Run `task` every `period`, first firing one period from now.
    pub fn schedule_periodic<F, Fut>(&self, period: Duration, task: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The immediate first tick of a tokio interval
            ticker.tick().await;
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        TaskHandle { inner }
    }
}
