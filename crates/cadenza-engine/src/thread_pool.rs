//! A fixed worker pool over a bounded lock-free MPMC queue.
//!
//! Work items are stored inline in the pre-sized queue, so submitting a
//! task never allocates. A null-work sentinel (`Message::Terminate`)
//! tells one worker to exit; `stop` enqueues one per thread. With zero
//! threads the pool degenerates to synchronous execution on the calling
//! thread, which keeps single-threaded runs deterministic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_queue::ArrayQueue;

/// A unit of work executed by the pool. Dependencies between tasks are
/// managed by the caller.
pub trait PoolTask: Send + 'static {
    fn run(self);
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolConfig {
    /// Worker thread count. `0` executes tasks synchronously on the
    /// calling thread.
    pub threads: usize,
    /// Capacity of the task queue.
    pub max_queued_tasks: usize,
    pub start_paused: bool,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_queued_tasks: 256,
            start_paused: false,
        }
    }
}

/// Returned by `add_task` when the queue is full, handing the task back
/// so the caller can apply backpressure (typically by running it
/// synchronously).
pub struct QueueFull<T>(pub T);

enum Message<T> {
    Work(T),
    Terminate,
}

struct PoolShared<T> {
    queue: ArrayQueue<Message<T>>,
    /// Messages available to pop. Workers block on this instead of
    /// spinning on the queue.
    pending: Mutex<usize>,
    pending_cond: Condvar,

    /// Fast-path flag so unpaused workers skip the pause mutex entirely.
    check_paused: AtomicBool,
    paused: Mutex<bool>,
    pause_cond: Condvar,

    threads: usize,
}

impl<T: PoolTask> PoolShared<T> {
    fn add_task(&self, task: T) -> Result<(), QueueFull<T>> {
        if self.threads == 0 {
            if self.check_paused.load(Ordering::Acquire) {
                return match self.queue.push(Message::Work(task)) {
                    Ok(()) => Ok(()),
                    Err(Message::Work(task)) => Err(QueueFull(task)),
                    Err(Message::Terminate) => unreachable!(),
                };
            }
            task.run();
            return Ok(());
        }

        match self.queue.push(Message::Work(task)) {
            Ok(()) => {
                self.signal_pending();
                Ok(())
            }
            Err(Message::Work(task)) => Err(QueueFull(task)),
            Err(Message::Terminate) => unreachable!(),
        }
    }

    fn signal_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending += 1;
        drop(pending);
        self.pending_cond.notify_one();
    }

    fn wait_while_paused(&self) {
        if !self.check_paused.load(Ordering::Acquire) {
            return;
        }
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            paused = self.pause_cond.wait(paused).unwrap();
        }
    }

    /// Blocking pop. The pending count is incremented only after a
    /// successful push, so a positive count guarantees the queue holds a
    /// message.
    fn pop_blocking(&self) -> Message<T> {
        let mut pending = self.pending.lock().unwrap();
        while *pending == 0 {
            pending = self.pending_cond.wait(pending).unwrap();
        }
        *pending -= 1;
        drop(pending);

        self.queue.pop().expect("pending count out of sync")
    }
}

pub struct ThreadPool<T: PoolTask> {
    shared: Arc<PoolShared<T>>,
    workers: Vec<JoinHandle<()>>,
}

/// A cloneable handle for submitting tasks, usable from worker threads
/// themselves (e.g. to push newly-ready successors).
pub struct TaskSender<T: PoolTask> {
    shared: Arc<PoolShared<T>>,
}

impl<T: PoolTask> Clone for TaskSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: PoolTask> TaskSender<T> {
    pub fn add_task(&self, task: T) -> Result<(), QueueFull<T>> {
        self.shared.add_task(task)
    }
}

impl<T: PoolTask> ThreadPool<T> {
    /// Starts the pool, spawning `config.threads` workers.
    pub fn start(config: &ThreadPoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            queue: ArrayQueue::new(config.max_queued_tasks.max(1)),
            pending: Mutex::new(0),
            pending_cond: Condvar::new(),
            check_paused: AtomicBool::new(config.start_paused),
            paused: Mutex::new(config.start_paused),
            pause_cond: Condvar::new(),
            threads: config.threads,
        });

        let workers = (0..config.threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("cadenza-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    pub fn sender(&self) -> TaskSender<T> {
        TaskSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn add_task(&self, task: T) -> Result<(), QueueFull<T>> {
        self.shared.add_task(task)
    }

    /// Parks all worker threads so an idle pool does not consume CPU.
    pub fn pause(&self) {
        let mut paused = self.shared.paused.lock().unwrap();
        *paused = true;
        // The flag must be set while the mutex is held, so a worker
        // re-checking the predicate can never observe the flag without
        // also observing the bool it waits on.
        self.shared.check_paused.store(true, Ordering::Release);
    }

    /// Wakes paused workers. With zero threads this drains the queue on
    /// the calling thread instead.
    pub fn resume(&self) {
        {
            let mut paused = self.shared.paused.lock().unwrap();
            *paused = false;
            self.shared.check_paused.store(false, Ordering::Release);
        }
        self.shared.pause_cond.notify_all();

        if self.shared.threads == 0 {
            while let Some(message) = self.shared.queue.pop() {
                if let Message::Work(task) = message {
                    task.run();
                }
            }
        }
    }

    /// Stops all workers and joins them. Returns the number of queued
    /// tasks that never executed.
    pub fn stop(mut self) -> usize {
        self.stop_internal()
    }

    fn stop_internal(&mut self) -> usize {
        if self.workers.is_empty() {
            // Synchronous mode: unpause without draining so deferred
            // tasks are counted, not executed.
            let mut paused = self.shared.paused.lock().unwrap();
            *paused = false;
            self.shared.check_paused.store(false, Ordering::Release);
        } else {
            // Resume first: a paused pool with a full queue could never
            // accept the terminate sentinels.
            self.resume();

            for _ in 0..self.workers.len() {
                loop {
                    match self.shared.queue.push(Message::Terminate) {
                        Ok(()) => {
                            self.shared.signal_pending();
                            break;
                        }
                        // Queue is briefly full of real work; the
                        // workers are still draining it.
                        Err(_) => std::thread::yield_now(),
                    }
                }
            }

            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }

        let mut unexecuted = 0;
        while let Some(message) = self.shared.queue.pop() {
            if matches!(message, Message::Work(_)) {
                unexecuted += 1;
            }
        }
        *self.shared.pending.lock().unwrap() = 0;

        unexecuted
    }
}

impl<T: PoolTask> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let unexecuted = self.stop_internal();
            if unexecuted > 0 {
                log::warn!("thread pool dropped with {unexecuted} unexecuted tasks");
            }
        }
    }
}

fn worker_loop<T: PoolTask>(shared: Arc<PoolShared<T>>) {
    loop {
        shared.wait_while_paused();

        match shared.pop_blocking() {
            Message::Work(task) => task.run(),
            Message::Terminate => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountTask(Arc<AtomicUsize>);

    impl PoolTask for CountTask {
        fn run(self) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..1_000 {
            if counter.load(Ordering::Acquire) == expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!(
            "counter stuck at {} (expected {expected})",
            counter.load(Ordering::Acquire)
        );
    }

    #[test]
    fn workers_execute_all_tasks() {
        let pool = ThreadPool::start(&ThreadPoolConfig {
            threads: 4,
            max_queued_tasks: 64,
            start_paused: false,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            pool.add_task(CountTask(Arc::clone(&counter))).ok().unwrap();
        }

        wait_for(&counter, 50);
        assert_eq!(pool.stop(), 0);
    }

    #[test]
    fn zero_threads_runs_synchronously() {
        let pool: ThreadPool<CountTask> = ThreadPool::start(&ThreadPoolConfig {
            threads: 0,
            max_queued_tasks: 16,
            start_paused: false,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        pool.add_task(CountTask(Arc::clone(&counter))).ok().unwrap();

        // No waiting: the task already ran on this thread.
        assert_eq!(counter.load(Ordering::Acquire), 1);
        assert_eq!(pool.stop(), 0);
    }

    #[test]
    fn zero_threads_paused_defers_until_resume() {
        let pool: ThreadPool<CountTask> = ThreadPool::start(&ThreadPoolConfig {
            threads: 0,
            max_queued_tasks: 16,
            start_paused: true,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        pool.add_task(CountTask(Arc::clone(&counter))).ok().unwrap();
        assert_eq!(counter.load(Ordering::Acquire), 0);

        pool.resume();
        assert_eq!(counter.load(Ordering::Acquire), 1);

        assert_eq!(pool.stop(), 0);
    }

    #[test]
    fn paused_pool_holds_tasks_and_resume_releases_them() {
        let pool = ThreadPool::start(&ThreadPoolConfig {
            threads: 2,
            max_queued_tasks: 64,
            start_paused: true,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            pool.add_task(CountTask(Arc::clone(&counter))).ok().unwrap();
        }

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Acquire), 0);

        pool.resume();
        wait_for(&counter, 8);
        assert_eq!(pool.stop(), 0);
    }

    #[test]
    fn queue_full_returns_task_to_caller() {
        let pool = ThreadPool::start(&ThreadPoolConfig {
            threads: 1,
            max_queued_tasks: 2,
            start_paused: true,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        pool.add_task(CountTask(Arc::clone(&counter))).ok().unwrap();
        pool.add_task(CountTask(Arc::clone(&counter))).ok().unwrap();

        // Third push overflows; the caller gets the task back and runs
        // it itself.
        match pool.add_task(CountTask(Arc::clone(&counter))) {
            Err(QueueFull(task)) => task.run(),
            Ok(()) => panic!("expected queue-full backpressure"),
        }
        assert_eq!(counter.load(Ordering::Acquire), 1);

        pool.resume();
        wait_for(&counter, 3);
        assert_eq!(pool.stop(), 0);
    }

    #[test]
    fn stop_counts_unexecuted_tasks() {
        let pool = ThreadPool::start(&ThreadPoolConfig {
            threads: 0,
            max_queued_tasks: 16,
            start_paused: true,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            pool.add_task(CountTask(Arc::clone(&counter))).ok().unwrap();
        }

        assert_eq!(pool.stop(), 5);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn worker_tasks_can_submit_more_work() {
        struct Fanout {
            sender: TaskSender<Fanout>,
            remaining: usize,
            counter: Arc<AtomicUsize>,
        }

        impl PoolTask for Fanout {
            fn run(self) {
                self.counter.fetch_add(1, Ordering::AcqRel);
                if self.remaining > 0 {
                    self.sender
                        .add_task(Fanout {
                            sender: self.sender.clone(),
                            remaining: self.remaining - 1,
                            counter: Arc::clone(&self.counter),
                        })
                        .ok()
                        .unwrap();
                }
            }
        }

        let pool: ThreadPool<Fanout> = ThreadPool::start(&ThreadPoolConfig {
            threads: 2,
            max_queued_tasks: 64,
            start_paused: false,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        pool.add_task(Fanout {
            sender: pool.sender(),
            remaining: 9,
            counter: Arc::clone(&counter),
        })
        .ok()
        .unwrap();

        wait_for(&counter, 10);
        assert_eq!(pool.stop(), 0);
    }
}
