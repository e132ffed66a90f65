//! Single-consumer task queue worker
//!
//! Producers on any thread append boxed closures; one dedicated thread pops
//! and runs them strictly in submission order. The worker owns a state value
//! that only ever lives on the consumer thread, so the closures get `&mut`
//! access to it without any further locking.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

/// State owned by a worker thread
pub trait WorkerState: Send + 'static {
    /// Returns true while the state needs [`WorkerState::poll`] to run even with an empty queue
    fn wants_poll(&self) -> bool {
        false
    }

    /// One polling step, run when the queue is empty and `wants_poll` holds.
    /// Implementations should block for a bounded time only.
    fn poll(&mut self) {}
}

impl WorkerState for () {}

/// Thread options of a worker
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub name: String,
    pub stack_size: usize,
}

impl WorkerOptions {
    pub fn new(name: impl Into<String>, stack_size: usize) -> Self {
        Self {
            name: name.into(),
            stack_size,
        }
    }
}

struct QueueState<S> {
    tasks: VecDeque<Task<S>>,
    running: bool,
}

struct Shared<S> {
    queue: Mutex<QueueState<S>>,
    available: Condvar,
}

/// Producer side of a worker queue
pub struct WorkerHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for WorkerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: WorkerState> WorkerHandle<S> {
    /// Append a task to the tail of the queue. Never blocks on the consumer.
    pub fn en_queue<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            log::warn!("Dropping task: worker is not running");
            return false;
        }
        queue.tasks.push_back(Box::new(task));
        drop(queue);
        self.shared.available.notify_one();
        true
    }

    /// Discard every pending task, returning how many were dropped
    pub fn clear_queue(&self) -> usize {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            let count = queue.tasks.len();
            queue.tasks.clear();
            count
        };
        if dropped > 0 {
            log::debug!("Cleared {} pending task(s)", dropped);
        }
        dropped
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().running
    }
}

/// Dedicated consumer thread draining a FIFO of deferred calls
pub struct TaskQueueWorker<S: WorkerState> {
    options: WorkerOptions,
    handle: WorkerHandle<S>,
    thread: Option<JoinHandle<()>>,
}

impl<S: WorkerState> TaskQueueWorker<S> {
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            options,
            handle: WorkerHandle {
                shared: Arc::new(Shared {
                    queue: Mutex::new(QueueState {
                        tasks: VecDeque::new(),
                        running: false,
                    }),
                    available: Condvar::new(),
                }),
            },
            thread: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Spawn the consumer thread owning `state`. Returns false if already running.
    pub fn start_worker(&mut self, state: S) -> bool {
        if self.thread.is_some() {
            log::debug!("Worker {} already running", self.options.name);
            return false;
        }

        self.handle.shared.queue.lock().running = true;

        let shared = Arc::clone(&self.handle.shared);
        let name = self.options.name.clone();
        let spawned = thread::Builder::new()
            .name(self.options.name.clone())
            .stack_size(self.options.stack_size)
            .spawn(move || consume(shared, state, name));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                log::info!("Worker {} started", self.options.name);
                true
            }
            Err(e) => {
                self.handle.shared.queue.lock().running = false;
                log::error!("Failed to spawn worker {}: {}", self.options.name, e);
                false
            }
        }
    }

    /// Signal the consumer to exit after the task in flight, then join it
    pub fn stop_worker(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        {
            let mut queue = self.handle.shared.queue.lock();
            queue.running = false;
            queue.tasks.clear();
        }
        self.handle.shared.available.notify_all();

        if thread.thread().id() == thread::current().id() {
            log::warn!("Worker {} stopped from its own thread, not joining", self.options.name);
            return;
        }
        if thread.join().is_err() {
            log::error!("Worker {} panicked during shutdown", self.options.name);
        }
        log::info!("Worker {} stopped", self.options.name);
    }

    pub fn en_queue<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.handle.en_queue(task)
    }

    pub fn clear_queue(&self) -> usize {
        self.handle.clear_queue()
    }

    pub fn pending(&self) -> usize {
        self.handle.pending()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn handle(&self) -> WorkerHandle<S> {
        self.handle.clone()
    }
}

impl<S: WorkerState> Drop for TaskQueueWorker<S> {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn consume<S: WorkerState>(shared: Arc<Shared<S>>, mut state: S, name: String) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if !queue.running {
                    log::debug!("Worker {} exiting", name);
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    break Some(task);
                }
                if state.wants_poll() {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };

        match task {
            Some(task) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(&mut state)));
                if outcome.is_err() {
                    log::error!("Task panicked on worker {}", name);
                }
            }
            None => state.poll(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn options() -> WorkerOptions {
        WorkerOptions::new("test_worker", 64 * 1024)
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut worker: TaskQueueWorker<()> = TaskQueueWorker::new(options());
        assert!(worker.start_worker(()));
        assert!(!worker.start_worker(()));
        assert!(worker.is_running());
        worker.stop_worker();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_enqueue_before_start_is_rejected() {
        let worker: TaskQueueWorker<()> = TaskQueueWorker::new(options());
        assert!(!worker.en_queue(|_| {}));
        assert_eq!(worker.pending(), 0);
    }

    impl WorkerState for Vec<u32> {}

    #[test]
    fn test_tasks_mutate_owned_state() {
        let mut worker: TaskQueueWorker<Vec<u32>> = TaskQueueWorker::new(options());
        worker.start_worker(Vec::new());

        for i in 0..5 {
            worker.en_queue(move |v: &mut Vec<u32>| v.push(i));
        }
        let (tx, rx) = mpsc::channel();
        worker.en_queue(move |v: &mut Vec<u32>| {
            let _ = tx.send(v.clone());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let mut worker: TaskQueueWorker<()> = TaskQueueWorker::new(options());
        worker.start_worker(());
        worker.en_queue(|_| panic!("boom"));

        let (tx, rx) = mpsc::channel();
        worker.en_queue(move |_| {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    struct Poller {
        remaining: usize,
        done: mpsc::Sender<()>,
    }

    impl WorkerState for Poller {
        fn wants_poll(&self) -> bool {
            self.remaining > 0
        }

        fn poll(&mut self) {
            self.remaining -= 1;
            if self.remaining == 0 {
                let _ = self.done.send(());
            }
        }
    }

    #[test]
    fn test_poll_runs_with_empty_queue() {
        let (tx, rx) = mpsc::channel();
        let mut worker = TaskQueueWorker::new(options());
        worker.start_worker(Poller {
            remaining: 3,
            done: tx,
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());

        // Polling finished; tasks still run
        let (tx, rx) = mpsc::channel();
        worker.en_queue(move |p: &mut Poller| {
            let _ = tx.send(p.remaining);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }
}
