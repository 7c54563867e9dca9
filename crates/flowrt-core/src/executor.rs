//! Host executor: worker pools and dispatch queues.
//!
//! The executor runs two kinds of tasks on two separate pools:
//!
//! - **work**: short, non-blocking continuations.
//! - **blocking work**: tasks that may park their worker thread, typically
//!   waiting on a device completion marker.
//!
//! Both queues are bounded. A full queue, or an executor that has been shut
//! down, rejects the task with [`FlowError::SubmissionRejected`]; the rejected
//! task is dropped without running.
//!
//! The executor also owns request registration (see
//! [`RequestContext`](crate::request::RequestContext)), the host allocation
//! limit and the [`FaultReporter`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::async_value::AsyncValueRef;
use crate::config::ExecutorConfig;
use crate::error::{FlowError, Result};
use crate::fault::{Fault, FaultReporter};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier of a registered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Which pool a task is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Work,
    Blocking,
}

impl Pool {
    fn name(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Blocking => "blocking",
        }
    }
}

/// State shared with the worker threads.
struct WorkerShared {
    pending: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl WorkerShared {
    fn finish_task(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.release_pending();
    }

    /// Undo the pending increment of a submission that never got queued.
    fn finish_rejected(&self) {
        self.release_pending();
    }

    fn release_pending(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }
}

struct ExecutorInner {
    config: ExecutorConfig,
    work_tx: RwLock<Option<Sender<Task>>>,
    blocking_tx: RwLock<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<WorkerShared>,
    faults: FaultReporter,
    active_requests: AtomicUsize,
    next_request_id: AtomicU64,
    rejected: AtomicU64,
    shutdown: AtomicBool,
}

impl ExecutorInner {
    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            pending = self.shared.pending.load(Ordering::Relaxed),
            "Shutting down host executor"
        );

        // Dropping the senders lets workers drain what is queued, then exit.
        self.work_tx.write().take();
        self.blocking_tx.write().take();

        let current = std::thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("Executor worker exited abnormally");
            }
        }

        info!("Host executor shut down complete");
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Snapshot of executor statistics.
#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    /// Tasks submitted but not yet finished.
    pub pending: usize,
    /// Tasks finished (including panicked ones).
    pub completed: u64,
    /// Tasks that panicked.
    pub panicked: u64,
    /// Submissions rejected.
    pub rejected: u64,
    /// Live request scopes.
    pub active_requests: usize,
    /// Faults reported on the fault channel.
    pub faults_reported: u64,
}

/// Thread pool plus bounded dispatch queues for host-side work.
///
/// Cloning is cheap; all clones share the same pools. The pools shut down
/// when [`shutdown`](Self::shutdown) is called or the last clone drops.
#[derive(Clone)]
pub struct HostExecutor {
    inner: Arc<ExecutorInner>,
}

impl HostExecutor {
    /// Create an executor and start its worker threads.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;

        let (work_tx, work_rx) = channel::bounded::<Task>(config.queue_capacity);
        let (blocking_tx, blocking_rx) = channel::bounded::<Task>(config.blocking_queue_capacity);

        let shared = Arc::new(WorkerShared {
            pending: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(config.num_workers + config.num_blocking_workers);
        for (pool, count, rx) in [
            (Pool::Work, config.num_workers, &work_rx),
            (Pool::Blocking, config.num_blocking_workers, &blocking_rx),
        ] {
            for i in 0..count {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                let worker = std::thread::Builder::new()
                    .name(format!("{}-{}-{}", config.thread_name, pool.name(), i))
                    .spawn(move || worker_loop(pool, rx, shared))
                    .map_err(|e| FlowError::submission(format!("failed to spawn worker: {e}")))?;
                workers.push(worker);
            }
        }

        info!(
            workers = config.num_workers,
            blocking_workers = config.num_blocking_workers,
            queue_capacity = config.queue_capacity,
            blocking_queue_capacity = config.blocking_queue_capacity,
            "Created host executor"
        );

        let faults = FaultReporter::new(config.fault_capacity);
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                config,
                work_tx: RwLock::new(Some(work_tx)),
                blocking_tx: RwLock::new(Some(blocking_tx)),
                workers: Mutex::new(workers),
                shared,
                faults,
                active_requests: AtomicUsize::new(0),
                next_request_id: AtomicU64::new(1),
                rejected: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Create an executor with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ExecutorConfig::default())
    }

    /// The configuration this executor was created with.
    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Submit a non-blocking task.
    pub fn enqueue_work<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Pool::Work, Box::new(work))
    }

    /// Submit a task that may block its worker thread.
    pub fn enqueue_blocking_work<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Pool::Blocking, Box::new(work))
    }

    /// Run `work` on the blocking pool and return its result as a completion
    /// value.
    ///
    /// If the task is rejected the returned value is already resolved with
    /// the submission error and `work` has been dropped. If `work` panics the
    /// value resolves with [`FlowError::TaskPanicked`] and the panic is
    /// counted like any other task panic.
    pub fn run_blocking_work<T, F>(&self, work: F) -> AsyncValueRef<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let result = AsyncValueRef::unresolved();
        let producer = result.clone();
        if let Err(error) = self.enqueue_blocking_work(move || {
            match catch_unwind(AssertUnwindSafe(work)) {
                Ok(outcome) => {
                    producer.set_result(outcome);
                }
                Err(payload) => {
                    producer.set_error(FlowError::panicked(panic_message(payload.as_ref())));
                    std::panic::resume_unwind(payload);
                }
            }
        }) {
            result.set_error(error);
        }
        result
    }

    fn submit(&self, pool: Pool, task: Task) -> Result<()> {
        let rejected = {
            let sender = match pool {
                Pool::Work => self.inner.work_tx.read(),
                Pool::Blocking => self.inner.blocking_tx.read(),
            };
            match sender.as_ref() {
                None => Some((task, "executor is shut down")),
                Some(tx) => {
                    self.inner.shared.pending.fetch_add(1, Ordering::AcqRel);
                    match tx.try_send(task) {
                        Ok(()) => None,
                        Err(TrySendError::Full(task)) => {
                            self.inner.shared.finish_rejected();
                            Some((task, "queue is full"))
                        }
                        Err(TrySendError::Disconnected(task)) => {
                            self.inner.shared.finish_rejected();
                            Some((task, "executor is shut down"))
                        }
                    }
                }
            }
        };

        match rejected {
            None => Ok(()),
            Some((task, reason)) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(pool = pool.name(), reason, "Rejected task submission");
                // Dropped outside the queue lock: captured state may block on drop.
                drop(task);
                Err(FlowError::submission(format!(
                    "{} queue rejected task: {reason}",
                    pool.name()
                )))
            }
        }
    }

    /// Register a new request.
    pub(crate) fn init_request(&self) -> Result<RequestId> {
        if self.is_shutdown() {
            return Err(FlowError::request_rejected("executor is shut down"));
        }

        match self.inner.config.max_active_requests {
            Some(limit) => {
                let mut current = self.inner.active_requests.load(Ordering::Acquire);
                loop {
                    if current >= limit {
                        warn!(limit, "Rejected request registration");
                        return Err(FlowError::request_rejected(format!(
                            "{current} active requests, limit is {limit}"
                        )));
                    }
                    match self.inner.active_requests.compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current = actual,
                    }
                }
            }
            None => {
                self.inner.active_requests.fetch_add(1, Ordering::AcqRel);
            }
        }

        let id = RequestId(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed));
        debug!(request = %id, "Registered request");
        Ok(id)
    }

    /// Release a registration taken by [`init_request`](Self::init_request).
    pub(crate) fn release_request(&self, id: RequestId) {
        self.inner.active_requests.fetch_sub(1, Ordering::AcqRel);
        debug!(request = %id, "Released request");
    }

    /// Check a host allocation of `size` bytes against the configured limit.
    pub fn check_host_allocation(&self, size: usize) -> Result<()> {
        match self.inner.config.max_host_allocation {
            Some(limit) if size > limit => Err(FlowError::allocation(
                size,
                format!("exceeds host allocation limit of {limit} bytes"),
            )),
            _ => Ok(()),
        }
    }

    /// The fault channel.
    pub fn fault_reporter(&self) -> &FaultReporter {
        &self.inner.faults
    }

    /// Snapshot of the retained faults.
    pub fn faults(&self) -> Vec<Fault> {
        self.inner.faults.faults()
    }

    /// Remove and return the retained faults.
    pub fn take_faults(&self) -> Vec<Fault> {
        self.inner.faults.take()
    }

    /// Report a fault that has no caller to return to.
    pub fn report_fault(&self, source: &'static str, error: FlowError) {
        self.inner.faults.report(source, error);
    }

    /// Number of live request scopes.
    pub fn active_requests(&self) -> usize {
        self.inner.active_requests.load(Ordering::Acquire)
    }

    /// Number of submitted tasks that have not finished.
    pub fn pending_work(&self) -> usize {
        self.inner.shared.pending.load(Ordering::Acquire)
    }

    /// Block until every submitted task has finished.
    ///
    /// Must not be called from a task running on this executor.
    pub fn quiesce(&self) {
        let shared = &self.inner.shared;
        let mut guard = shared.idle_lock.lock();
        while shared.pending.load(Ordering::Acquire) != 0 {
            shared.idle.wait(&mut guard);
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            pending: self.pending_work(),
            completed: self.inner.shared.completed.load(Ordering::Relaxed),
            panicked: self.inner.shared.panicked.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            active_requests: self.active_requests(),
            faults_reported: self.inner.faults.total_reported(),
        }
    }

    /// Check if the executor has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Stop accepting work, drain the queues and join the workers.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for HostExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostExecutor")
            .field("workers", &self.inner.config.num_workers)
            .field("blocking_workers", &self.inner.config.num_blocking_workers)
            .field("pending", &self.pending_work())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn worker_loop(pool: Pool, rx: Receiver<Task>, shared: Arc<WorkerShared>) {
    while let Ok(task) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!(pool = pool.name(), "Executor task panicked");
        }
        shared.finish_task();
    }
    debug!(pool = pool.name(), "Executor worker exiting");
}
