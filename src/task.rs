//! Slow work kept off the control loop
//!
//! Network association and reachability checks can take seconds. They run as
//! spawned tasks and the control loop polls them once per tick. A deadline or
//! a cancel drops the task's future, and with it any helper process started
//! with `kill_on_drop`.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::warn;

/// Result of polling a [`BackgroundTask`]
#[derive(Debug, PartialEq)]
pub enum TaskPoll<T> {
    Pending,
    Ready(T),
    Failed(String),
    TimedOut,
}

/// A spawned job with its own deadline
pub struct BackgroundTask<T> {
    label: &'static str,
    handle: JoinHandle<T>,
    deadline: Instant,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F>(label: &'static str, now: Instant, timeout: Duration, work: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            label,
            handle: tokio::spawn(work),
            deadline: now + timeout,
        }
    }

    /// Check completion without waiting on unfinished work
    pub async fn poll(&mut self, now: Instant) -> TaskPoll<T> {
        if self.handle.is_finished() {
            return match (&mut self.handle).await {
                Ok(value) => TaskPoll::Ready(value),
                Err(e) => TaskPoll::Failed(e.to_string()),
            };
        }

        if now >= self.deadline {
            warn!(task = self.label, "Task exceeded its deadline");
            self.handle.abort();
            return TaskPoll::TimedOut;
        }

        TaskPoll::Pending
    }

    /// Stop the work and discard its result
    pub fn cancel(self) {
        self.handle.abort();
    }
}
