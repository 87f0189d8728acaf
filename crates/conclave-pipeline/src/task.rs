//! One-shot background work with captured failure.
//!
//! [`AsyncTask`] runs a closure on its own thread and records its outcome,
//! including panics, instead of letting the failure cross the thread
//! boundary. Pipelines poll [`AsyncTask::is_finished`] once per tick and never
//! block on the thread. Dropping a handle joins the thread, so background
//! work never outlives its owner; callers only drop finished tasks on the hot
//! path, which keeps the join bounded.
//!
//! [`TaskSlot`] wraps an optional task and enforces that a pipeline has at
//! most one task in flight.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{PipelineError, Result};

enum Outcome<T> {
    Running,
    Finished(Result<T>),
    Taken,
}

pub struct AsyncTask<T> {
    handle: Option<JoinHandle<()>>,
    outcome: Arc<Mutex<Outcome<T>>>,
}

impl<T: Send + 'static> AsyncTask<T> {
    /// Start `f` on a new thread immediately.
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let outcome = Arc::new(Mutex::new(Outcome::Running));
        let shared = Arc::clone(&outcome);

        let handle = thread::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(&*payload))));
            *lock(&shared) = Outcome::Finished(result);
        });

        Self {
            handle: Some(handle),
            outcome,
        }
    }
}

impl<T> AsyncTask<T> {
    /// The closure has returned (or panicked), whatever the outcome.
    pub fn is_finished(&self) -> bool {
        !matches!(*lock(&self.outcome), Outcome::Running)
    }

    /// The closure returned an error or panicked.
    pub fn is_exception_thrown(&self) -> bool {
        matches!(*lock(&self.outcome), Outcome::Finished(Err(_)))
    }

    /// Hand the captured error to the caller.
    ///
    /// # Panics
    /// If no error was captured. Calling this without checking
    /// [`Self::is_exception_thrown`] first is a programming error.
    pub fn rethrow(&mut self) -> PipelineError {
        let mut outcome = lock(&self.outcome);
        match std::mem::replace(&mut *outcome, Outcome::Taken) {
            Outcome::Finished(Err(e)) => e,
            other => {
                *outcome = other;
                panic!("AsyncTask::rethrow called without a captured error");
            }
        }
    }

    /// Take the outcome once the task has finished. Returns `None` while the
    /// task is running or after the outcome was already taken.
    pub fn take(&mut self) -> Option<Result<T>> {
        let mut outcome = lock(&self.outcome);
        match std::mem::replace(&mut *outcome, Outcome::Taken) {
            Outcome::Finished(result) => Some(result),
            other => {
                *outcome = other;
                None
            }
        }
    }
}

impl<T> Drop for AsyncTask<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // The closure's panic was already captured; join cannot fail
            // with anything worth reporting.
            let _ = handle.join();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

// ── TaskSlot ──────────────────────────────────────────────────────────────────

/// Result of polling a [`TaskSlot`].
#[derive(Debug)]
pub enum TaskPoll<T> {
    /// No task was started.
    Idle,
    /// The task is still running.
    Pending,
    /// The task finished successfully; the slot is empty again.
    Ready(T),
}

/// At most one in-flight task per pipeline.
pub struct TaskSlot<T> {
    current: Option<AsyncTask<T>>,
}

impl<T> Default for TaskSlot<T> {
    fn default() -> Self {
        Self { current: None }
    }
}

impl<T> fmt::Debug for TaskSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSlot")
            .field("occupied", &self.current.is_some())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl<T: Send + 'static> TaskSlot<T> {
    /// Start a new task. Rejected while the previous one is unfinished.
    pub fn start<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.is_busy() {
            return Err(PipelineError::TaskBusy);
        }
        self.current = Some(AsyncTask::spawn(f));
        Ok(())
    }
}

impl<T> TaskSlot<T> {
    pub fn is_busy(&self) -> bool {
        self.current.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Guard for leaving an async-bearing state: harvests a finished task and
    /// re-raises its captured error, if any.
    pub fn poll(&mut self) -> Result<TaskPoll<T>> {
        let Some(task) = self.current.as_mut() else {
            return Ok(TaskPoll::Idle);
        };
        if !task.is_finished() {
            return Ok(TaskPoll::Pending);
        }

        let outcome = if task.is_exception_thrown() {
            Err(task.rethrow())
        } else {
            task.take().unwrap_or_else(|| {
                Err(PipelineError::Invariant("finished task has no outcome".into()))
            })
        };
        self.current = None;
        outcome.map(TaskPoll::Ready)
    }

    /// Drop the current task, joining its thread if it is still running.
    pub fn clear(&mut self) {
        self.current = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
