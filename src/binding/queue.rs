//! Deferred-notification queue
//!
//! Notifications that cannot be dispatched inline are copied into a [`Task`]
//! and appended here. The lock is held only for the append/pop itself; an
//! empty→non-empty transition wakes the owner through the configured
//! [`QueueWaker`]. Capacity is bounded so a stalled owner cannot make a
//! misbehaving transport grow memory without limit — a full queue is the
//! engine's recoverable allocation-failure condition.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::sink::{DataFlags, ProgressCode, ResultCode};
use crate::transport::ResumeData;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One deferred notification. Each variant owns a private copy of its
/// payload; the originating call's memory may not outlive the call.
#[derive(Debug, Clone)]
pub enum Task {
    Resume(ResumeData),
    Progress(ProgressCode, String),
    DataReady(DataFlags, u64, u64),
    Result(ResultCode, String),
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Resume(_) => "resume",
            Task::Progress(..) => "progress",
            Task::DataReady(..) => "data",
            Task::Result(..) => "result",
        }
    }
}

#[derive(Debug, Error)]
#[error("notification queue full ({0} tasks)")]
pub struct QueueFull(pub usize);

/// Wakes the owner thread when deferred work appears.
///
/// The engine never assumes an event loop: a condvar-based [`ThreadWaker`]
/// ships for callers that park a plain thread, and anything that can
/// schedule a `pump` call (an executor, a channel) can implement this.
pub trait QueueWaker: Send + Sync {
    fn wake(&self);
}

/// Condvar-backed waker for thread-parking owners.
#[derive(Default)]
pub struct ThreadWaker {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl ThreadWaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Parks until the next wake, consuming the signal.
    pub fn wait(&self) {
        let Ok(mut signaled) = self.signaled.lock() else {
            return;
        };
        while !*signaled {
            match self.condvar.wait(signaled) {
                Ok(guard) => signaled = guard,
                Err(_) => return,
            }
        }
        *signaled = false;
    }

    /// Parks until the next wake or the timeout. Returns true when woken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Ok(mut signaled) = self.signaled.lock() else {
            return false;
        };
        if !*signaled {
            match self.condvar.wait_timeout(signaled, timeout) {
                Ok((guard, _)) => signaled = guard,
                Err(_) => return false,
            }
        }
        let woken = *signaled;
        *signaled = false;
        woken
    }
}

impl QueueWaker for ThreadWaker {
    fn wake(&self) {
        if let Ok(mut signaled) = self.signaled.lock() {
            *signaled = true;
            self.condvar.notify_one();
        }
    }
}

/// Bounded FIFO of deferred tasks for one binding.
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    capacity: usize,
    waker: Arc<dyn QueueWaker>,
}

impl TaskQueue {
    pub fn new(capacity: usize, waker: Arc<dyn QueueWaker>) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            waker,
        }
    }

    /// Appends a task, waking the owner on the empty→non-empty edge.
    pub fn push(&self, task: Task) -> Result<(), QueueFull> {
        let was_empty;
        {
            let Ok(mut tasks) = self.tasks.lock() else {
                return Err(QueueFull(self.capacity));
            };
            if tasks.len() >= self.capacity {
                return Err(QueueFull(self.capacity));
            }
            was_empty = tasks.is_empty();
            trace!(kind = task.kind(), depth = tasks.len(), "task queued");
            tasks.push_back(task);
        }
        if was_empty {
            self.waker.wake();
        }
        Ok(())
    }

    /// Appends a task even when the queue is at capacity, evicting queued
    /// tasks from the front if needed. Reserved for the synthesized
    /// terminal result of overflow recovery.
    pub fn push_forced(&self, task: Task) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        while tasks.len() >= self.capacity {
            tasks.pop_front();
        }
        let was_empty = tasks.is_empty();
        tasks.push_back(task);
        drop(tasks);
        if was_empty {
            self.waker.wake();
        }
    }

    pub fn pop(&self) -> Option<Task> {
        self.tasks.lock().ok()?.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().map(|t| t.is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWaker(AtomicUsize);

    impl QueueWaker for CountingWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task(n: u64) -> Task {
        Task::DataReady(DataFlags::INTERMEDIATE, n, 0)
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new(8, Arc::new(CountingWaker(AtomicUsize::new(0))));
        for n in 0..4 {
            queue.push(task(n)).unwrap();
        }
        for n in 0..4 {
            match queue.pop().unwrap() {
                Task::DataReady(_, got, _) => assert_eq!(got, n),
                other => panic!("unexpected task: {other:?}"),
            }
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_wake_only_on_empty_to_nonempty_edge() {
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let queue = TaskQueue::new(8, waker.clone());

        queue.push(task(0)).unwrap();
        queue.push(task(1)).unwrap();
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);

        queue.pop();
        queue.pop();
        queue.push(task(2)).unwrap();
        assert_eq!(waker.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_capacity_enforced() {
        let queue = TaskQueue::new(2, Arc::new(CountingWaker(AtomicUsize::new(0))));
        queue.push(task(0)).unwrap();
        queue.push(task(1)).unwrap();
        assert!(queue.push(task(2)).is_err());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_forced_push_evicts_from_front() {
        let queue = TaskQueue::new(2, Arc::new(CountingWaker(AtomicUsize::new(0))));
        queue.push(task(0)).unwrap();
        queue.push(task(1)).unwrap();
        queue.push_forced(Task::Result(ResultCode::Failed, "overflow".to_string()));

        assert_eq!(queue.len(), 2);
        match queue.pop().unwrap() {
            Task::DataReady(_, n, _) => assert_eq!(n, 1),
            other => panic!("unexpected task: {other:?}"),
        }
        assert!(matches!(queue.pop().unwrap(), Task::Result(ResultCode::Failed, _)));
    }

    #[test]
    fn test_thread_waker_roundtrip() {
        let waker = ThreadWaker::new();
        waker.wake();
        assert!(waker.wait_timeout(Duration::from_millis(10)));
        // Signal consumed; a second wait times out.
        assert!(!waker.wait_timeout(Duration::from_millis(10)));
    }
}
