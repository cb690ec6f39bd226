//! Bounded worker pool for job execution.
//!
//! Saturation surfaces as a rejection instead of unbounded buffering: the
//! acquisition loop treats a rejection as backpressure and the rejected job
//! is unacquired so another instance (or a later cycle) can pick it up.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use thiserror::Error;
use tracing::debug;

/// A unit of work for the pool.
pub type PoolTask = Box<dyn FnOnce() + Send + 'static>;

/// The pool had no capacity left for the submission.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("worker pool saturated")]
pub struct TaskRejected;

/// Task executor contract the async executor runs jobs on.
///
/// Implementations must reject rather than block when full: the capacity
/// check and the submission race against other submitters, and callers
/// always keep a rejection-handling path.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: PoolTask) -> Result<(), TaskRejected>;

    /// How many more tasks would currently be accepted.
    fn remaining_capacity(&self) -> usize;

    /// Stop accepting work and join the workers. In-flight tasks run to
    /// completion; nothing is cancelled mid-execution.
    fn shutdown(&self);
}

impl<P> TaskExecutor for Arc<P>
where
    P: TaskExecutor + ?Sized,
{
    fn execute(&self, task: PoolTask) -> Result<(), TaskRejected> {
        (**self).execute(task)
    }

    fn remaining_capacity(&self) -> usize {
        (**self).remaining_capacity()
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

enum PoolMessage {
    Run(PoolTask),
    Terminate,
}

/// Fixed-size worker pool over one shared channel.
///
/// Logical capacity is `workers + queue_capacity`, enforced by a
/// compare-and-swap on the in-flight counter at submission time, so the
/// channel itself never buffers more than the configured queue.
pub struct FixedWorkerPool {
    sender: mpsc::Sender<PoolMessage>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
    worker_count: usize,
    shut_down: AtomicBool,
}

impl FixedWorkerPool {
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<PoolMessage>();
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let in_flight = Arc::clone(&in_flight);
            let handle = thread::Builder::new()
                .name(format!("forgeflow-worker-{index}"))
                .spawn(move || worker_loop(receiver, in_flight))
                .expect("failed to spawn worker pool thread");
            workers.push(handle);
        }

        Self {
            sender,
            workers: Mutex::new(workers),
            in_flight,
            capacity: worker_count + queue_capacity,
            worker_count,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

fn worker_loop(receiver: Arc<Mutex<mpsc::Receiver<PoolMessage>>>, in_flight: Arc<AtomicUsize>) {
    loop {
        let message = {
            let receiver = receiver.lock().unwrap();
            receiver.recv()
        };
        match message {
            Ok(PoolMessage::Run(task)) => {
                task();
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(PoolMessage::Terminate) | Err(_) => break,
        }
    }
}

impl TaskExecutor for FixedWorkerPool {
    fn execute(&self, task: PoolTask) -> Result<(), TaskRejected> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TaskRejected);
        }

        let capacity = self.capacity;
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < capacity).then_some(current + 1)
            })
            .map_err(|_| TaskRejected)?;

        if self.sender.send(PoolMessage::Run(task)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(TaskRejected);
        }
        Ok(())
    }

    fn remaining_capacity(&self) -> usize {
        self.capacity
            .saturating_sub(self.in_flight.load(Ordering::SeqCst))
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(workers = self.worker_count, "shutting down worker pool");

        let mut workers = self.workers.lock().unwrap();
        for _ in 0..workers.len() {
            let _ = self.sender.send(PoolMessage::Terminate);
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for FixedWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for FixedWorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FixedWorkerPool")
            .field("capacity", &self.capacity)
            .field("worker_count", &self.worker_count)
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}
