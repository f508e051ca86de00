//! Fan-out worker pool
//!
//! Runs per-tablet directives on a fixed set of worker threads. Tasks run in
//! submission order; the queue is bounded and rejects work once full.
//!
//! A task can also be scheduled to run after a delay. Delayed tasks wait in a
//! timer queue, not on a worker, and move to the ready queue once due, so a
//! directive backing off between retries never holds up other work.
//!
//! The pool itself owns the threads. A `FanoutHandle` can submit work but
//! cannot join workers, so tasks may hold one and schedule follow-up work
//! without ever owning the pool they run on.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::error;

/// Error returned when the queue is full or the pool is shutting down.
#[derive(Debug, thiserror::Error)]
#[error("fan-out queue is full or shut down")]
pub struct BackpressureError;

/// Pool metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks waiting in the queue, delayed ones included
    pub queue_depth: usize,
    /// Tasks waiting for their delay to pass
    pub delayed_tasks: usize,
    /// Tasks being executed
    pub active_tasks: usize,
    /// Tasks finished since the pool started
    pub tasks_completed: u64,
    /// Worker threads
    pub worker_count: usize,
}

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TaskQueue {
    ready: VecDeque<Task>,
    /// Keyed by due time, then by a sequence number to keep keys unique
    delayed: BTreeMap<(Instant, u64), Task>,
    next_seq: u64,
}

impl TaskQueue {
    /// Move every due delayed task to the ready queue
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            self.ready.push_back(entry.remove());
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(due, _)| *due)
    }
}

struct PoolInner {
    queue: Mutex<TaskQueue>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

impl PoolInner {
    fn submit(&self, work: Task) -> Result<(), BackpressureError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(BackpressureError);
        }
        {
            let mut queue = self.queue.lock();
            if queue.ready.len() >= self.max_queue_depth {
                return Err(BackpressureError);
            }
            queue.ready.push_back(work);
            self.queue_depth.fetch_add(1, Ordering::Release);
        }
        self.work_ready.notify_one();
        Ok(())
    }

    /// Delayed tasks are follow-ups of accepted work and are not bounded.
    fn submit_after(&self, delay: Duration, work: Task) -> Result<(), BackpressureError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(BackpressureError);
        }
        {
            let mut queue = self.queue.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.delayed.insert((Instant::now() + delay, seq), work);
            self.queue_depth.fetch_add(1, Ordering::Release);
        }
        // The new task may be due before whatever a sleeping worker waits for.
        self.work_ready.notify_all();
        Ok(())
    }
}

/// Submits work to a `FanoutPool` without owning it
#[derive(Clone)]
pub struct FanoutHandle {
    inner: Arc<PoolInner>,
}

impl FanoutHandle {
    /// Queue a task
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<(), BackpressureError> {
        self.inner.submit(Box::new(work))
    }

    /// Queue a task to run once `delay` has passed
    pub fn submit_after(
        &self,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<(), BackpressureError> {
        self.inner.submit_after(delay, Box::new(work))
    }

    /// Whether the owning pool has begun shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

/// Fixed-size worker pool for directive fan-out
pub struct FanoutPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl FanoutPool {
    /// Start `num_threads` workers named `tabletsnap-fanout-N`
    pub fn new(num_threads: usize, max_queue_depth: usize) -> std::io::Result<Self> {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(TaskQueue::default()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("tabletsnap-fanout-{}", i))
                .spawn(move || worker_loop(&inner_clone));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    stop_workers(&inner, &mut workers);
                    return Err(e);
                }
            }
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        })
    }

    /// Handle for submitting work from anywhere, including pool tasks
    pub fn handle(&self) -> FanoutHandle {
        FanoutHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Queue a task
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<(), BackpressureError> {
        self.inner.submit(Box::new(work))
    }

    /// Block until every queued and running task has finished.
    ///
    /// Tasks submitted by running tasks are waited for as well, delayed ones
    /// included.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(Ordering::Acquire) > 0
            || self.inner.active_tasks.load(Ordering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Stop accepting work, finish what is ready, and join the workers.
    ///
    /// Delayed tasks that are not due yet are dropped.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        stop_workers(&self.inner, &mut workers);
    }

    /// Current metrics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            delayed_tasks: self.inner.queue.lock().delayed.len(),
            active_tasks: self.inner.active_tasks.load(Ordering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(Ordering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for FanoutPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_workers(inner: &PoolInner, workers: &mut Vec<JoinHandle<()>>) {
    inner.shutdown.store(true, Ordering::Release);
    // Notify under the queue lock so a worker between its shutdown check
    // and its wait cannot miss the wakeup.
    {
        let _queue = inner.queue.lock();
        inner.work_ready.notify_all();
    }
    for handle in workers.drain(..) {
        let _ = handle.join();
    }
    let dropped = {
        let mut queue = inner.queue.lock();
        let dropped = std::mem::take(&mut queue.delayed);
        inner.queue_depth.fetch_sub(dropped.len(), Ordering::Release);
        inner.drain_cond.notify_all();
        dropped
    };
    drop(dropped);
}

/// Decrements `active_tasks` and wakes drain waiters, even on panic.
struct ActiveTaskGuard<'a> {
    inner: &'a PoolInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, Ordering::Release);
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
        if prev_active == 1 && self.inner.queue_depth.load(Ordering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                queue.promote_due(Instant::now());
                if let Some(task) = queue.ready.pop_front() {
                    inner.active_tasks.fetch_add(1, Ordering::Release);
                    inner.queue_depth.fetch_sub(1, Ordering::Release);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                match queue.next_due() {
                    Some(due) => {
                        inner.work_ready.wait_until(&mut queue, due);
                    }
                    None => inner.work_ready.wait(&mut queue),
                }
            }
        };

        let _guard = ActiveTaskGuard { inner };
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            error!(
                target: "tabletsnap::master",
                "fan-out task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_submit_and_drain() {
        let pool = FanoutPool::new(2, 64).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        assert_eq!(pool.stats().tasks_completed, 10);
    }

    #[test]
    fn test_tasks_can_submit_follow_up_work() {
        let pool = FanoutPool::new(1, 64).unwrap();
        let handle = pool.handle();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        pool.submit(move || {
            let c2 = Arc::clone(&c);
            handle
                .submit(move || {
                    c2.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_backpressure() {
        let pool = FanoutPool::new(1, 1).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        pool.submit(move || {
            b.wait();
        })
        .unwrap();
        // Let the worker take the blocking task off the queue.
        while pool.stats().active_tasks == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        pool.submit(|| {}).unwrap();
        assert!(pool.submit(|| {}).is_err());

        barrier.wait();
        pool.drain();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = FanoutPool::new(1, 8).unwrap();
        pool.submit(|| panic!("boom")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_delayed_task_does_not_block_ready_work() {
        let pool = FanoutPool::new(1, 8).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        pool.handle()
            .submit_after(Duration::from_millis(200), move || o.lock().push("delayed"))
            .unwrap();
        let o = Arc::clone(&order);
        pool.submit(move || o.lock().push("ready")).unwrap();
        assert_eq!(pool.stats().delayed_tasks, 1);

        let start = std::time::Instant::now();
        pool.drain();
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(*order.lock(), vec!["ready", "delayed"]);
        assert_eq!(pool.stats().queue_depth, 0);
        assert_eq!(pool.stats().delayed_tasks, 0);
    }

    #[test]
    fn test_shutdown_drops_pending_delayed_tasks() {
        let pool = FanoutPool::new(1, 8).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.handle()
            .submit_after(Duration::from_secs(60), move || {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        pool.shutdown();
        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(pool.stats().queue_depth, 0);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = FanoutPool::new(2, 8).unwrap();
        let handle = pool.handle();
        pool.shutdown();
        assert!(handle.is_shutting_down());
        assert!(handle.submit(|| {}).is_err());
        assert!(handle.submit_after(Duration::ZERO, || {}).is_err());
    }
}
