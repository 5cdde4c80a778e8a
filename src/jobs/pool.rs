// Bounded worker pool
//
// Workers are OS threads pulling from a bounded queue. Every job produces
// exactly one output, which goes to a bounded result channel drained by a
// single dispatcher thread per pool. Submission never blocks.
//
// The result channel is sized queue_capacity + workers, one slot for every job
// that can exist in the pool at once. A full result channel means the
// dispatcher has fallen behind; that is logged as an invariant violation and
// the worker then blocks on the send rather than dropping the output.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Result, SiftError};

/// A unit of work a pool can run.
pub trait PoolJob: Send + 'static {
    type Output: Send + 'static;

    /// Execute the job on a worker thread.
    fn run(self) -> Self::Output;

    /// Produce a terminal output without running (shutdown deadline passed).
    fn abandon(self) -> Self::Output;
}

/// Callback invoked by the dispatcher for each job output.
pub type OutputHandler<O> = Arc<dyn Fn(O) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Stopping,
    Stopped,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct WorkerPool<J: PoolJob> {
    name: String,
    worker_count: usize,
    queue_capacity: usize,
    state: Mutex<PoolState>,
    job_tx: Mutex<Option<SyncSender<J>>>,
    job_rx: Arc<Mutex<Receiver<J>>>,
    result_tx: Mutex<Option<SyncSender<J::Output>>>,
    result_rx: Mutex<Option<Receiver<J::Output>>>,
    handler: OutputHandler<J::Output>,
    /// Jobs submitted and not yet finished (queued + running)
    in_flight: Arc<AtomicUsize>,
    abandon: Arc<AtomicBool>,
    /// Set once stopped: whether every job finished before the deadline
    drained: Mutex<Option<bool>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<J: PoolJob> WorkerPool<J> {
    pub fn new(name: &str, worker_count: usize, queue_capacity: usize, handler: OutputHandler<J::Output>) -> Self {
        let worker_count = worker_count.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (job_tx, job_rx) = mpsc::sync_channel::<J>(queue_capacity);
        let (result_tx, result_rx) = mpsc::sync_channel::<J::Output>(queue_capacity + worker_count);

        Self {
            name: name.to_string(),
            worker_count,
            queue_capacity,
            state: Mutex::new(PoolState::Created),
            job_tx: Mutex::new(Some(job_tx)),
            job_rx: Arc::new(Mutex::new(job_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            handler,
            in_flight: Arc::new(AtomicUsize::new(0)),
            abandon: Arc::new(AtomicBool::new(false)),
            drained: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn state(&self) -> PoolState {
        *lock(&self.state)
    }

    /// Jobs submitted that have not yet produced an output.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Spawn the dispatcher and workers. Created -> Running.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != PoolState::Created {
            return Err(SiftError::Invalid(format!(
                "pool '{}' cannot start from {:?}",
                self.name, *state
            )));
        }

        let result_rx = lock(&self.result_rx)
            .take()
            .ok_or_else(|| SiftError::Other(format!("pool '{}' already started", self.name)))?;
        let result_tx = lock(&self.result_tx)
            .clone()
            .ok_or_else(|| SiftError::Other(format!("pool '{}' has no result channel", self.name)))?;

        let handler = Arc::clone(&self.handler);
        let dispatcher = thread::Builder::new()
            .name(format!("{}-dispatch", self.name))
            .spawn(move || {
                for output in result_rx {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(output)));
                    if outcome.is_err() {
                        log::error!("Result handler panicked; continuing");
                    }
                }
            })?;
        *lock(&self.dispatcher) = Some(dispatcher);

        let mut workers = lock(&self.workers);
        for i in 0..self.worker_count {
            let rx = Arc::clone(&self.job_rx);
            let tx = result_tx.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let abandon = Arc::clone(&self.abandon);
            let name = self.name.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", self.name, i))
                .spawn(move || worker_loop(&name, rx, tx, in_flight, abandon))?;
            workers.push(handle);
        }

        *state = PoolState::Running;
        log::info!("Pool '{}' started with {} workers", self.name, self.worker_count);
        Ok(())
    }

    /// Non-blocking submit. Fails with PoolStopped when the pool is not
    /// running or the queue is full.
    pub fn submit(&self, job: J) -> Result<()> {
        if self.state() != PoolState::Running {
            return Err(SiftError::PoolStopped(self.name.clone()));
        }
        let guard = lock(&self.job_tx);
        let tx = guard
            .as_ref()
            .ok_or_else(|| SiftError::PoolStopped(self.name.clone()))?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                log::debug!("Pool '{}' queue full", self.name);
                Err(SiftError::PoolStopped(self.name.clone()))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(SiftError::PoolStopped(self.name.clone()))
            }
        }
    }

    /// Stop accepting work, let queued and running jobs finish, then return.
    pub fn stop(&self) {
        self.stop_within(None, || {});
    }

    /// Like `stop`, but once `timeout` passes any still-queued jobs are
    /// abandoned and `on_expire` runs (used to interrupt running jobs).
    /// Returns true if everything finished before the deadline. A call that
    /// finds the pool already stopping waits for that stop (up to `timeout`)
    /// and reports its outcome.
    pub fn stop_within<F: FnOnce()>(&self, timeout: Option<Duration>, on_expire: F) -> bool {
        {
            let mut state = lock(&self.state);
            match *state {
                PoolState::Stopped | PoolState::Stopping => {
                    drop(state);
                    return self.await_stopped(timeout);
                }
                PoolState::Created | PoolState::Running => *state = PoolState::Stopping,
            }
        }
        // Closing the queue lets workers drain what is left and exit
        lock(&self.job_tx).take();

        let mut drained = true;
        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            while self.in_flight() > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if self.in_flight() > 0 {
                drained = false;
                log::warn!(
                    "Pool '{}' did not drain within {:?}; {} jobs interrupted",
                    self.name,
                    timeout,
                    self.in_flight()
                );
                self.abandon.store(true, Ordering::SeqCst);
                on_expire();
            }
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                log::error!("Pool '{}' worker thread panicked", self.name);
            }
        }

        // Workers hold the other senders; dropping ours ends the dispatcher
        lock(&self.result_tx).take();
        if let Some(handle) = lock(&self.dispatcher).take() {
            let _ = handle.join();
        }

        *lock(&self.drained) = Some(drained);
        *lock(&self.state) = PoolState::Stopped;
        log::info!("Pool '{}' stopped", self.name);
        drained
    }

    fn await_stopped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        while self.state() != PoolState::Stopped {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        lock(&self.drained).unwrap_or(false)
    }
}

fn worker_loop<J: PoolJob>(
    name: &str,
    rx: Arc<Mutex<Receiver<J>>>,
    tx: SyncSender<J::Output>,
    in_flight: Arc<AtomicUsize>,
    abandon: Arc<AtomicBool>,
) {
    loop {
        let next = lock(&rx).recv();
        let job = match next {
            Ok(job) => job,
            Err(_) => break,
        };

        let output = if abandon.load(Ordering::SeqCst) {
            job.abandon()
        } else {
            job.run()
        };

        match tx.try_send(output) {
            Ok(()) => {}
            Err(TrySendError::Full(output)) => {
                log::error!(
                    "Pool '{}' result channel full: dispatcher is behind the workers",
                    name
                );
                if tx.send(output).is_err() {
                    log::error!("Pool '{}' dispatcher gone; output lost", name);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("Pool '{}' dispatcher gone; output lost", name);
            }
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A phase's pool behind a swappable reference, so it can be resized.
pub struct PhasePool<J: PoolJob> {
    name: String,
    queue_capacity: usize,
    handler: OutputHandler<J::Output>,
    current: RwLock<Arc<WorkerPool<J>>>,
    /// Pool replaced by a resize that is still finishing its jobs
    draining: Mutex<Option<Arc<WorkerPool<J>>>>,
    resizing: Mutex<()>,
}

impl<J: PoolJob> PhasePool<J> {
    /// Build and start the pool.
    pub fn start(name: &str, worker_count: usize, queue_capacity: usize, handler: OutputHandler<J::Output>) -> Result<Self> {
        let pool = WorkerPool::new(name, worker_count, queue_capacity, Arc::clone(&handler));
        pool.start()?;
        Ok(Self {
            name: name.to_string(),
            queue_capacity,
            handler,
            current: RwLock::new(Arc::new(pool)),
            draining: Mutex::new(None),
            resizing: Mutex::new(()),
        })
    }

    fn current(&self) -> Arc<WorkerPool<J>> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn submit(&self, job: J) -> Result<()> {
        self.current().submit(job)
    }

    pub fn worker_count(&self) -> usize {
        self.current().worker_count()
    }

    /// In-flight jobs of the current pool plus any pool still draining.
    pub fn in_flight(&self) -> usize {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let draining = lock(&self.draining).as_ref().map_or(0, |old| old.in_flight());
        guard.in_flight() + draining
    }

    /// Free worker slots right now. Jobs still running in a pool replaced by
    /// `resize` count against the new pool's workers.
    pub fn available(&self) -> usize {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let draining = lock(&self.draining).as_ref().map_or(0, |old| old.in_flight());
        guard.worker_count().saturating_sub(guard.in_flight() + draining)
    }

    /// Replace the pool with one of `worker_count` workers. The new pool is
    /// accepting work before the old one is stopped, and the old one drains
    /// everything it already holds. Blocks until that drain is done.
    pub fn resize(&self, worker_count: usize) -> Result<()> {
        let _resizing = lock(&self.resizing);
        if self.current().worker_count() == worker_count.max(1) {
            return Ok(());
        }
        let replacement = WorkerPool::new(&self.name, worker_count, self.queue_capacity, Arc::clone(&self.handler));
        replacement.start()?;
        let replacement = Arc::new(replacement);

        let old = {
            let mut guard = self
                .current
                .write()
                .map_err(|_| SiftError::Other(format!("pool '{}' lock poisoned", self.name)))?;
            let old = std::mem::replace(&mut *guard, replacement);
            *lock(&self.draining) = Some(Arc::clone(&old));
            old
        };
        log::info!(
            "Pool '{}' resized {} -> {} workers",
            self.name,
            old.worker_count(),
            worker_count
        );
        old.stop();
        lock(&self.draining).take();
        Ok(())
    }

    pub fn stop(&self) {
        self.current().stop();
    }

    pub fn stop_within<F: FnOnce()>(&self, timeout: Option<Duration>, on_expire: F) -> bool {
        self.current().stop_within(timeout, on_expire)
    }
}
